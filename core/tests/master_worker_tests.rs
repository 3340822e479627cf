//! Master/worker integration: registration, location tracking, profile
//! distribution, peer evictions, and telemetry.

use async_trait::async_trait;
use embers_core::block::{BlockId, BlockManagerId, MemoryMode, StorageLevel};
use embers_core::config::{CacheConfig, EvictionPolicy, MasterConfig, PeerMode};
use embers_core::master::{ask_with_retry, MasterHandle};
use embers_core::messages::{WorkerEndpoint, WorkerMessage, WorkerReply};
use embers_core::store::{ChunkedBuffer, DiscardOnEvict, MemoryStore};
use embers_core::worker::WorkerNode;
use embers_common::{EmbersError, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn worker_id(n: u32) -> BlockManagerId {
    BlockManagerId::new(format!("exec-{n}"), "localhost", 7000 + n as u16)
}

fn new_worker(n: u32, peer_mode: PeerMode) -> (Arc<WorkerNode<i32>>, Arc<MemoryStore<i32>>) {
    let conf = CacheConfig {
        max_on_heap_memory: 10_000,
        eviction_policy: EvictionPolicy::Lrc,
        peer_mode,
        ..CacheConfig::default()
    };
    let store = Arc::new(MemoryStore::new(conf, Arc::new(DiscardOnEvict)));
    let node = Arc::new(WorkerNode::new(worker_id(n), peer_mode, Arc::clone(&store)));
    (node, store)
}

fn put(store: &MemoryStore<i32>, block: BlockId, size: u64) {
    assert!(store
        .put_bytes(block, size, MemoryMode::OnHeap, || {
            ChunkedBuffer::from_vec(vec![0u8; size as usize])
        })
        .unwrap());
}

fn master_conf(dir: &Path, app: &str) -> MasterConfig {
    MasterConfig {
        app_name: app.to_string(),
        profile_dir: dir.to_path_buf(),
        ask_timeout: Duration::from_secs(2),
        ask_retries: 2,
    }
}

fn write_profile(dir: &Path, name: &str, content: &str) {
    let mut f = std::fs::File::create(dir.join(name)).unwrap();
    f.write_all(content.as_bytes()).unwrap();
}

#[tokio::test]
async fn register_update_and_locate_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let master = MasterHandle::start(master_conf(dir.path(), "App"));
    let (node, _store) = new_worker(1, PeerMode::Conservative);
    let id = worker_id(1);

    master.register(id.clone(), 1000, node).await.unwrap();

    let block = BlockId::rdd(3, 0);
    assert!(master
        .update_block_info(id.clone(), block.clone(), StorageLevel::MEMORY_ONLY, 64, 0)
        .await
        .unwrap());
    assert_eq!(master.get_locations(block.clone()).await.unwrap(), vec![id.clone()]);
    assert!(master.has_cached_blocks("exec-1").await.unwrap());

    let mem = master.get_memory_status().await.unwrap();
    assert_eq!(mem[&id], (1000, 936));

    // An invalid level retracts the block.
    assert!(master
        .update_block_info(id.clone(), block.clone(), StorageLevel::NONE, 0, 0)
        .await
        .unwrap());
    assert!(master.get_locations(block).await.unwrap().is_empty());
    assert!(!master.has_cached_blocks("exec-1").await.unwrap());
}

#[tokio::test]
async fn unregistered_workers_are_rejected_except_the_driver() {
    let dir = tempfile::tempdir().unwrap();
    let master = MasterHandle::start(master_conf(dir.path(), "App"));

    let stranger = BlockManagerId::new("exec-9", "elsewhere", 1);
    assert!(!master
        .update_block_info(stranger, BlockId::rdd(1, 0), StorageLevel::MEMORY_ONLY, 1, 0)
        .await
        .unwrap());

    let driver = BlockManagerId::new("driver", "localhost", 1);
    assert!(master
        .update_block_info(driver, BlockId::rdd(1, 0), StorageLevel::MEMORY_ONLY, 1, 0)
        .await
        .unwrap());

    assert!(!master.heartbeat(worker_id(9)).await.unwrap());
}

#[tokio::test]
async fn register_with_pulls_profiles_and_reports_metrics() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "App.txt", "4:7\n");
    let master = MasterHandle::start(master_conf(dir.path(), "App"));

    let (node, store) = new_worker(1, PeerMode::Conservative);
    node.register_with(&master, 10_000).await.unwrap();

    put(&store, BlockId::rdd(4, 0), 32);
    assert_eq!(store.reference_model().ref_of(&BlockId::rdd(4, 0)), Some(7));

    assert!(store.get_bytes(&BlockId::rdd(4, 0)).unwrap().is_some());
    let _ = store.get_bytes(&BlockId::rdd(9, 9)).unwrap();
    node.report_cache_metrics(&master).await.unwrap();
    master.stop().await.unwrap();

    let content = std::fs::read_to_string(dir.path().join("result.txt")).unwrap();
    assert!(content.contains("RDD Hit\t1\tRDD Miss\t1\n"));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn reregistration_supersedes_the_old_worker() {
    let dir = tempfile::tempdir().unwrap();
    let master = MasterHandle::start(master_conf(dir.path(), "App"));
    let (node_a, _) = new_worker(1, PeerMode::Conservative);
    let (node_b, _) = new_worker(1, PeerMode::Conservative);
    let id = worker_id(1);

    master.register(id.clone(), 1000, node_a).await.unwrap();
    assert!(master
        .update_block_info(id.clone(), BlockId::rdd(1, 0), StorageLevel::MEMORY_ONLY, 10, 0)
        .await
        .unwrap());

    master.register(id.clone(), 2000, node_b).await.unwrap();
    // The old instance's blocks are gone with it.
    assert!(master.get_locations(BlockId::rdd(1, 0)).await.unwrap().is_empty());
    let mem = master.get_memory_status().await.unwrap();
    assert_eq!(mem[&id], (2000, 2000));
    assert!(logs_contain("re-registering"));
}

#[tokio::test]
async fn profile_reload_seeds_worker_reference_counts() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "PageRank.txt", "1:2\n2:4\n");
    write_profile(dir.path(), "PageRank-Peers.txt", "1:2\n");
    let master = MasterHandle::start(master_conf(dir.path(), "Page Rank"));

    let (node, store) = new_worker(1, PeerMode::Conservative);
    master.register(worker_id(1), 10_000, node).await.unwrap();

    let profiles = master.get_ref_profile(worker_id(1)).await.unwrap();
    assert_eq!(profiles.ref_profile.get(&1), Some(&2));
    store.install_profiles(
        profiles.ref_profile,
        profiles.ref_profile_by_job,
        profiles.peer_profile,
    );

    put(&store, BlockId::rdd(1, 0), 64);
    assert_eq!(store.reference_model().ref_of(&BlockId::rdd(1, 0)), Some(2));
    assert_eq!(store.reference_model().peer_of(1), Some(2));
}

#[tokio::test]
async fn strict_peer_eviction_decrements_both_datasets_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "App.txt", "1:3\n2:3\n");
    write_profile(dir.path(), "App-Peers.txt", "1:2\n");
    let master = MasterHandle::start(master_conf(dir.path(), "App"));

    let mut stores = Vec::new();
    for n in 1..=2 {
        let (node, store) = new_worker(n, PeerMode::Strict);
        let endpoint: Arc<dyn WorkerEndpoint> = node.clone();
        master.register(worker_id(n), 10_000, endpoint).await.unwrap();
        let profiles = master.get_ref_profile(worker_id(n)).await.unwrap();
        store.install_profiles(
            profiles.ref_profile,
            profiles.ref_profile_by_job,
            profiles.peer_profile,
        );
        stores.push(store);
    }
    for (i, store) in stores.iter().enumerate() {
        put(store, BlockId::rdd(1, i as u64), 32);
        put(store, BlockId::rdd(2, i as u64), 32);
        put(store, BlockId::rdd(3, i as u64), 32);
    }

    master
        .block_with_peer_evicted(BlockId::rdd(1, 0))
        .await
        .unwrap();

    for (i, store) in stores.iter().enumerate() {
        let refs = store.reference_model();
        assert_eq!(refs.ref_of(&BlockId::rdd(1, i as u64)), Some(2));
        assert_eq!(refs.ref_of(&BlockId::rdd(2, i as u64)), Some(2));
        assert_eq!(refs.current_ref(&BlockId::rdd(2, i as u64)), Some(2));
        // Unrelated datasets are untouched.
        assert_eq!(refs.ref_of(&BlockId::rdd(3, i as u64)), Some(1));
        assert_eq!(refs.ref_profile_of(1), Some(2));
    }
}

#[tokio::test]
async fn conservative_peer_eviction_touches_one_partition() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "App.txt", "1:3\n2:3\n");
    write_profile(dir.path(), "App-Peers.txt", "1:2\n");
    let master = MasterHandle::start(master_conf(dir.path(), "App"));

    let (node, store) = new_worker(1, PeerMode::Conservative);
    master.register(worker_id(1), 10_000, node).await.unwrap();
    let profiles = master.get_ref_profile(worker_id(1)).await.unwrap();
    store.install_profiles(
        profiles.ref_profile,
        profiles.ref_profile_by_job,
        profiles.peer_profile,
    );
    put(&store, BlockId::rdd(1, 0), 32);
    put(&store, BlockId::rdd(1, 1), 32);
    put(&store, BlockId::rdd(2, 0), 32);

    master
        .block_with_peer_evicted(BlockId::rdd(1, 0))
        .await
        .unwrap();

    let refs = store.reference_model();
    assert_eq!(refs.ref_of(&BlockId::rdd(1, 0)), Some(2));
    assert_eq!(refs.ref_of(&BlockId::rdd(2, 0)), Some(2));
    // Sibling partitions keep their counts in conservative mode.
    assert_eq!(refs.ref_of(&BlockId::rdd(1, 1)), Some(3));
}

#[tokio::test]
async fn remove_rdd_fans_out_and_purges_master_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let master = MasterHandle::start(master_conf(dir.path(), "App"));

    let mut stores = Vec::new();
    for n in 1..=2 {
        let (node, store) = new_worker(n, PeerMode::Conservative);
        master.register(worker_id(n), 10_000, node).await.unwrap();
        stores.push(store);
    }
    for (i, store) in stores.iter().enumerate() {
        put(store, BlockId::rdd(5, i as u64), 32);
        put(store, BlockId::rdd(6, i as u64), 32);
        master
            .update_block_info(
                worker_id(i as u32 + 1),
                BlockId::rdd(5, i as u64),
                StorageLevel::MEMORY_ONLY,
                32,
                0,
            )
            .await
            .unwrap();
    }

    let removed = master.remove_rdd(5).await.unwrap();
    assert_eq!(removed, 2);
    assert!(!stores[0].contains(&BlockId::rdd(5, 0)));
    assert!(stores[0].contains(&BlockId::rdd(6, 0)));
    assert!(master.get_locations(BlockId::rdd(5, 0)).await.unwrap().is_empty());
}

#[tokio::test]
async fn dag_broadcast_reaches_every_worker() {
    let dir = tempfile::tempdir().unwrap();
    let master = MasterHandle::start(master_conf(dir.path(), "App"));

    let (node, store) = new_worker(1, PeerMode::Conservative);
    master.register(worker_id(1), 10_000, node).await.unwrap();

    let dag = [(1u64, [(2u64, 1u64)]), (2, [(4, 1)])]
        .into_iter()
        .map(|(d, hist)| (d, hist.into_iter().collect()))
        .collect();
    master
        .start_broadcast_dag_info(0, Some(dag), 100)
        .await
        .unwrap();

    assert_eq!(store.lease_engine().assigned(1), Some(2));
    assert_eq!(store.lease_engine().assigned(2), Some(4));
}

#[tokio::test]
async fn ref_count_broadcast_rewrites_worker_counts() {
    let dir = tempfile::tempdir().unwrap();
    let master = MasterHandle::start(master_conf(dir.path(), "App"));

    let (node, store) = new_worker(1, PeerMode::Conservative);
    master.register(worker_id(1), 10_000, node).await.unwrap();
    put(&store, BlockId::rdd(1, 0), 32);
    assert_eq!(store.reference_model().ref_of(&BlockId::rdd(1, 0)), Some(1));

    master
        .start_broadcast_ref_count(0, 4, HashMap::from([(1, 6)]))
        .await
        .unwrap();
    assert_eq!(store.reference_model().ref_of(&BlockId::rdd(1, 0)), Some(6));
    assert_eq!(store.reference_model().ref_profile_of(1), Some(6));
}

#[tokio::test]
async fn job_broadcast_ships_the_loaded_profile() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "App-JobDAG.txt", "0-1:3;2:1\n1-\n");
    let master = MasterHandle::start(master_conf(dir.path(), "App"));

    let (node, store) = new_worker(1, PeerMode::Conservative);
    master.register(worker_id(1), 10_000, node).await.unwrap();
    put(&store, BlockId::rdd(1, 0), 32);

    master.start_broadcast_job_id(0).await.unwrap();
    assert_eq!(store.reference_model().ref_of(&BlockId::rdd(1, 0)), Some(3));
}

#[tokio::test]
async fn remove_executor_forgets_its_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let master = MasterHandle::start(master_conf(dir.path(), "App"));
    let (node, _store) = new_worker(1, PeerMode::Conservative);
    let id = worker_id(1);
    master.register(id.clone(), 1000, node).await.unwrap();
    master
        .update_block_info(id.clone(), BlockId::rdd(1, 0), StorageLevel::MEMORY_ONLY, 8, 0)
        .await
        .unwrap();

    master.remove_executor("exec-1").await.unwrap();
    assert!(master.get_locations(BlockId::rdd(1, 0)).await.unwrap().is_empty());
    assert!(!master.has_cached_blocks("exec-1").await.unwrap());
}

#[tokio::test]
async fn stop_writes_the_telemetry_summary() {
    let dir = tempfile::tempdir().unwrap();
    let master = MasterHandle::start(master_conf(dir.path(), "Word Count"));
    master
        .report_cache_hit(worker_id(1), [7, 2, 0, 0])
        .await
        .unwrap();
    master
        .report_cache_hit(worker_id(2), [3, 1, 5, 5])
        .await
        .unwrap();
    master.stop().await.unwrap();

    let content = std::fs::read_to_string(dir.path().join("result.txt")).unwrap();
    assert!(content.starts_with("AppName: Word Count, Runtime: "));
    assert!(content.contains("RDD Hit\t10\tRDD Miss\t3\n"));

    // The mailbox is gone after stop.
    assert!(master.get_memory_status().await.is_err());
}

/// Endpoint that never answers, for exercising the ask timeout.
struct BlackHole;

#[async_trait]
impl WorkerEndpoint for BlackHole {
    async fn ask(&self, _msg: WorkerMessage) -> Result<WorkerReply> {
        std::future::pending().await
    }
}

/// Endpoint that fails a fixed number of times before answering.
struct Flaky {
    failures: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl WorkerEndpoint for Flaky {
    async fn ask(&self, _msg: WorkerMessage) -> Result<WorkerReply> {
        if self
            .failures
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok()
        {
            Err(EmbersError::endpoint("transient failure"))
        } else {
            Ok(WorkerReply::Count(3))
        }
    }
}

#[tokio::test]
async fn asks_time_out_after_bounded_retries() {
    let result = ask_with_retry(
        &BlackHole,
        WorkerMessage::TriggerThreadDump,
        Duration::from_millis(20),
        2,
    )
    .await;
    assert!(matches!(result, Err(EmbersError::Timeout { .. })));
}

#[tokio::test]
async fn retryable_failures_are_retried() {
    let flaky = Flaky {
        failures: std::sync::atomic::AtomicU32::new(2),
    };
    let reply = ask_with_retry(
        &flaky,
        WorkerMessage::TriggerThreadDump,
        Duration::from_millis(100),
        3,
    )
    .await
    .unwrap();
    assert_eq!(reply, WorkerReply::Count(3));
}

#[tokio::test]
async fn worker_node_removes_shuffle_and_broadcast_blocks() {
    let (node, store) = new_worker(1, PeerMode::Conservative);
    put(&store, BlockId::shuffle(1, 0, 0), 16);
    put(&store, BlockId::shuffle(1, 1, 0), 16);
    put(&store, BlockId::shuffle(2, 0, 0), 16);
    put(&store, BlockId::broadcast(9), 16);

    assert_eq!(
        node.handle(WorkerMessage::RemoveShuffle { shuffle_id: 1 }),
        WorkerReply::Count(2)
    );
    assert_eq!(
        node.handle(WorkerMessage::RemoveBroadcast {
            broadcast_id: 9,
            from_driver: true
        }),
        WorkerReply::Count(1)
    );
    assert!(store.contains(&BlockId::shuffle(2, 0, 0)));
}
