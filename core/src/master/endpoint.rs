//! The master endpoint: a single-threaded mailbox over the directory.
//!
//! One message is processed to completion before the next begins. Fan-out
//! asks are spawned onto the runtime and resolve their caller's reply later,
//! so the mailbox never blocks on a worker.

use crate::block::{BlockId, BlockManagerId, BlockStatus, DatasetId, JobId, StorageLevel};
use crate::config::MasterConfig;
use crate::master::directory::{MasterDirectory, StorageStatus};
use crate::master::profile::AppProfiles;
use crate::messages::WorkerEndpoint;
use crate::store::DagInfo;
use embers_common::{EmbersError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type BlockPredicate = Box<dyn Fn(&BlockId) -> bool + Send>;

enum Command {
    Register {
        id: BlockManagerId,
        max_mem: u64,
        endpoint: Arc<dyn WorkerEndpoint>,
        reply: oneshot::Sender<()>,
    },
    UpdateBlockInfo {
        worker: BlockManagerId,
        block: BlockId,
        level: StorageLevel,
        mem_bytes: u64,
        disk_bytes: u64,
        reply: oneshot::Sender<bool>,
    },
    GetLocations {
        block: BlockId,
        reply: oneshot::Sender<Vec<BlockManagerId>>,
    },
    GetLocationsMultiple {
        blocks: Vec<BlockId>,
        reply: oneshot::Sender<Vec<Vec<BlockManagerId>>>,
    },
    GetPeers {
        worker: BlockManagerId,
        reply: oneshot::Sender<Vec<BlockManagerId>>,
    },
    GetExecutorEndpoint {
        executor_id: String,
        reply: oneshot::Sender<Option<Arc<dyn WorkerEndpoint>>>,
    },
    GetMemoryStatus {
        reply: oneshot::Sender<HashMap<BlockManagerId, (u64, u64)>>,
    },
    GetStorageStatus {
        reply: oneshot::Sender<Vec<StorageStatus>>,
    },
    GetBlockStatus {
        block: BlockId,
        reply: oneshot::Sender<HashMap<BlockManagerId, BlockStatus>>,
    },
    GetMatchingBlockIds {
        pred: BlockPredicate,
        reply: oneshot::Sender<Vec<BlockId>>,
    },
    HasCachedBlocks {
        executor_id: String,
        reply: oneshot::Sender<bool>,
    },
    Heartbeat {
        worker: BlockManagerId,
        reply: oneshot::Sender<bool>,
    },
    ReportCacheHit {
        worker: BlockManagerId,
        counts: [u64; 4],
        reply: oneshot::Sender<()>,
    },
    GetRefProfile {
        worker: BlockManagerId,
        reply: oneshot::Sender<AppProfiles>,
    },
    BlockWithPeerEvicted {
        block: BlockId,
        reply: oneshot::Sender<u64>,
    },
    StartBroadcastJobId {
        job: JobId,
        reply: oneshot::Sender<u64>,
    },
    StartBroadcastRefCount {
        job: JobId,
        partitions: u64,
        refs: HashMap<DatasetId, i64>,
        reply: oneshot::Sender<u64>,
    },
    StartBroadcastDagInfo {
        job: JobId,
        dag: Option<DagInfo>,
        access_number_global: u64,
        reply: oneshot::Sender<u64>,
    },
    RemoveRdd {
        rdd_id: DatasetId,
        reply: oneshot::Sender<u64>,
    },
    RemoveShuffle {
        shuffle_id: u64,
        reply: oneshot::Sender<u64>,
    },
    RemoveBroadcast {
        broadcast_id: u64,
        from_driver: bool,
        reply: oneshot::Sender<u64>,
    },
    RemoveExecutor {
        executor_id: String,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Client handle to a running master endpoint. Cloneable and cheap; every
/// method is one mailbox round-trip.
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl MasterHandle {
    /// Spawn the mailbox task over a fresh directory.
    pub fn start(conf: MasterConfig) -> Self {
        Self::with_directory(MasterDirectory::new(conf))
    }

    pub fn with_directory(mut directory: MasterDirectory) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if Self::handle(&mut directory, command) {
                    break;
                }
            }
            debug!("master mailbox drained");
        });
        Self { tx }
    }

    /// Process one command; returns true on stop.
    fn handle(directory: &mut MasterDirectory, command: Command) -> bool {
        match command {
            Command::Register {
                id,
                max_mem,
                endpoint,
                reply,
            } => {
                directory.register(id, max_mem, endpoint);
                let _ = reply.send(());
            }
            Command::UpdateBlockInfo {
                worker,
                block,
                level,
                mem_bytes,
                disk_bytes,
                reply,
            } => {
                let ok = directory.update_block_info(&worker, block, level, mem_bytes, disk_bytes);
                let _ = reply.send(ok);
            }
            Command::GetLocations { block, reply } => {
                let _ = reply.send(directory.get_locations(&block));
            }
            Command::GetLocationsMultiple { blocks, reply } => {
                let _ = reply.send(directory.get_locations_multiple(&blocks));
            }
            Command::GetPeers { worker, reply } => {
                let _ = reply.send(directory.get_peers(&worker));
            }
            Command::GetExecutorEndpoint { executor_id, reply } => {
                let _ = reply.send(directory.get_executor_endpoint(&executor_id));
            }
            Command::GetMemoryStatus { reply } => {
                let _ = reply.send(directory.get_memory_status());
            }
            Command::GetStorageStatus { reply } => {
                let _ = reply.send(directory.get_storage_status());
            }
            Command::GetBlockStatus { block, reply } => {
                let _ = reply.send(directory.get_block_status(&block));
            }
            Command::GetMatchingBlockIds { pred, reply } => {
                let _ = reply.send(directory.get_matching_block_ids(|b| pred(b)));
            }
            Command::HasCachedBlocks { executor_id, reply } => {
                let _ = reply.send(directory.has_cached_blocks(&executor_id));
            }
            Command::Heartbeat { worker, reply } => {
                let _ = reply.send(directory.heartbeat(&worker));
            }
            Command::ReportCacheHit {
                worker,
                counts,
                reply,
            } => {
                directory.report_cache_hit(&worker, counts);
                let _ = reply.send(());
            }
            Command::GetRefProfile { worker, reply } => {
                debug!("{} fetching the reference profile", worker);
                let _ = reply.send(directory.get_ref_profile());
            }
            Command::BlockWithPeerEvicted { block, reply } => {
                let fut = directory.block_with_peer_evicted(block);
                tokio::spawn(async move {
                    let _ = reply.send(fut.await);
                });
            }
            Command::StartBroadcastJobId { job, reply } => {
                let fut = directory.broadcast_job_id(job);
                tokio::spawn(async move {
                    let _ = reply.send(fut.await);
                });
            }
            Command::StartBroadcastRefCount {
                job,
                partitions,
                refs,
                reply,
            } => {
                let fut = directory.broadcast_ref_count(job, partitions, refs);
                tokio::spawn(async move {
                    let _ = reply.send(fut.await);
                });
            }
            Command::StartBroadcastDagInfo {
                job,
                dag,
                access_number_global,
                reply,
            } => {
                let fut = directory.broadcast_dag_info(job, dag, access_number_global);
                tokio::spawn(async move {
                    let _ = reply.send(fut.await);
                });
            }
            Command::RemoveRdd { rdd_id, reply } => {
                let fut = directory.remove_rdd(rdd_id);
                tokio::spawn(async move {
                    let _ = reply.send(fut.await);
                });
            }
            Command::RemoveShuffle { shuffle_id, reply } => {
                let fut = directory.remove_shuffle(shuffle_id);
                tokio::spawn(async move {
                    let _ = reply.send(fut.await);
                });
            }
            Command::RemoveBroadcast {
                broadcast_id,
                from_driver,
                reply,
            } => {
                let fut = directory.remove_broadcast(broadcast_id, from_driver);
                tokio::spawn(async move {
                    let _ = reply.send(fut.await);
                });
            }
            Command::RemoveExecutor { executor_id, reply } => {
                directory.remove_executor(&executor_id);
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                directory.stop();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn ask<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
        what: &str,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .map_err(|_| EmbersError::endpoint(format!("master gone before {what}")))?;
        rx.await
            .map_err(|_| EmbersError::endpoint(format!("master dropped {what}")))
    }

    pub async fn register(
        &self,
        id: BlockManagerId,
        max_mem: u64,
        endpoint: Arc<dyn WorkerEndpoint>,
    ) -> Result<()> {
        self.ask(
            |reply| Command::Register {
                id,
                max_mem,
                endpoint,
                reply,
            },
            "register",
        )
        .await
    }

    pub async fn update_block_info(
        &self,
        worker: BlockManagerId,
        block: BlockId,
        level: StorageLevel,
        mem_bytes: u64,
        disk_bytes: u64,
    ) -> Result<bool> {
        self.ask(
            |reply| Command::UpdateBlockInfo {
                worker,
                block,
                level,
                mem_bytes,
                disk_bytes,
                reply,
            },
            "update_block_info",
        )
        .await
    }

    pub async fn get_locations(&self, block: BlockId) -> Result<Vec<BlockManagerId>> {
        self.ask(|reply| Command::GetLocations { block, reply }, "get_locations")
            .await
    }

    pub async fn get_locations_multiple(
        &self,
        blocks: Vec<BlockId>,
    ) -> Result<Vec<Vec<BlockManagerId>>> {
        self.ask(
            |reply| Command::GetLocationsMultiple { blocks, reply },
            "get_locations_multiple",
        )
        .await
    }

    pub async fn get_peers(&self, worker: BlockManagerId) -> Result<Vec<BlockManagerId>> {
        self.ask(|reply| Command::GetPeers { worker, reply }, "get_peers")
            .await
    }

    pub async fn get_executor_endpoint(
        &self,
        executor_id: impl Into<String>,
    ) -> Result<Option<Arc<dyn WorkerEndpoint>>> {
        let executor_id = executor_id.into();
        self.ask(
            |reply| Command::GetExecutorEndpoint { executor_id, reply },
            "get_executor_endpoint",
        )
        .await
    }

    pub async fn get_memory_status(&self) -> Result<HashMap<BlockManagerId, (u64, u64)>> {
        self.ask(|reply| Command::GetMemoryStatus { reply }, "get_memory_status")
            .await
    }

    pub async fn get_storage_status(&self) -> Result<Vec<StorageStatus>> {
        self.ask(|reply| Command::GetStorageStatus { reply }, "get_storage_status")
            .await
    }

    /// Status of one block across workers. Answered from master metadata;
    /// `ask_slaves` is accepted for interface parity.
    pub async fn get_block_status(
        &self,
        block: BlockId,
        _ask_slaves: bool,
    ) -> Result<HashMap<BlockManagerId, BlockStatus>> {
        self.ask(
            |reply| Command::GetBlockStatus { block, reply },
            "get_block_status",
        )
        .await
    }

    pub async fn get_matching_block_ids(
        &self,
        pred: impl Fn(&BlockId) -> bool + Send + 'static,
        _ask_slaves: bool,
    ) -> Result<Vec<BlockId>> {
        self.ask(
            |reply| Command::GetMatchingBlockIds {
                pred: Box::new(pred),
                reply,
            },
            "get_matching_block_ids",
        )
        .await
    }

    pub async fn has_cached_blocks(&self, executor_id: impl Into<String>) -> Result<bool> {
        let executor_id = executor_id.into();
        self.ask(
            |reply| Command::HasCachedBlocks { executor_id, reply },
            "has_cached_blocks",
        )
        .await
    }

    pub async fn heartbeat(&self, worker: BlockManagerId) -> Result<bool> {
        self.ask(|reply| Command::Heartbeat { worker, reply }, "heartbeat")
            .await
    }

    pub async fn report_cache_hit(&self, worker: BlockManagerId, counts: [u64; 4]) -> Result<()> {
        self.ask(
            |reply| Command::ReportCacheHit {
                worker,
                counts,
                reply,
            },
            "report_cache_hit",
        )
        .await
    }

    pub async fn get_ref_profile(&self, worker: BlockManagerId) -> Result<AppProfiles> {
        self.ask(
            |reply| Command::GetRefProfile { worker, reply },
            "get_ref_profile",
        )
        .await
    }

    pub async fn block_with_peer_evicted(&self, block: BlockId) -> Result<u64> {
        self.ask(
            |reply| Command::BlockWithPeerEvicted { block, reply },
            "block_with_peer_evicted",
        )
        .await
    }

    pub async fn start_broadcast_job_id(&self, job: JobId) -> Result<u64> {
        self.ask(
            |reply| Command::StartBroadcastJobId { job, reply },
            "start_broadcast_job_id",
        )
        .await
    }

    pub async fn start_broadcast_ref_count(
        &self,
        job: JobId,
        partitions: u64,
        refs: HashMap<DatasetId, i64>,
    ) -> Result<u64> {
        self.ask(
            |reply| Command::StartBroadcastRefCount {
                job,
                partitions,
                refs,
                reply,
            },
            "start_broadcast_ref_count",
        )
        .await
    }

    pub async fn start_broadcast_dag_info(
        &self,
        job: JobId,
        dag: Option<DagInfo>,
        access_number_global: u64,
    ) -> Result<u64> {
        self.ask(
            |reply| Command::StartBroadcastDagInfo {
                job,
                dag,
                access_number_global,
                reply,
            },
            "start_broadcast_dag_info",
        )
        .await
    }

    pub async fn remove_rdd(&self, rdd_id: DatasetId) -> Result<u64> {
        self.ask(|reply| Command::RemoveRdd { rdd_id, reply }, "remove_rdd")
            .await
    }

    pub async fn remove_shuffle(&self, shuffle_id: u64) -> Result<u64> {
        self.ask(
            |reply| Command::RemoveShuffle { shuffle_id, reply },
            "remove_shuffle",
        )
        .await
    }

    pub async fn remove_broadcast(&self, broadcast_id: u64, from_driver: bool) -> Result<u64> {
        self.ask(
            |reply| Command::RemoveBroadcast {
                broadcast_id,
                from_driver,
                reply,
            },
            "remove_broadcast",
        )
        .await
    }

    pub async fn remove_executor(&self, executor_id: impl Into<String>) -> Result<()> {
        let executor_id = executor_id.into();
        self.ask(
            |reply| Command::RemoveExecutor { executor_id, reply },
            "remove_executor",
        )
        .await
    }

    /// Write the telemetry summary and shut the mailbox down.
    pub async fn stop(&self) -> Result<()> {
        self.ask(|reply| Command::Stop { reply }, "stop").await
    }
}
