//! Master-side bookkeeping: who holds what, and profile distribution.

use crate::block::{BlockId, BlockManagerId, BlockStatus, DatasetId, JobId, StorageLevel};
use crate::config::MasterConfig;
use crate::master::profile::{load_profiles, AppProfiles};
use crate::master::telemetry::{write_result, MasterMetrics};
use crate::messages::{WorkerEndpoint, WorkerMessage, WorkerReply};
use crate::store::DagInfo;
use embers_common::{current_timestamp_secs, EmbersError, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the master tracks about one registered worker.
pub struct WorkerInfo {
    pub id: BlockManagerId,
    pub max_mem: u64,
    pub remaining_mem: u64,
    pub last_seen: u64,
    pub blocks: HashMap<BlockId, BlockStatus>,
    pub cached_blocks: HashSet<BlockId>,
    pub endpoint: Arc<dyn WorkerEndpoint>,
}

/// Point-in-time view of one worker's storage, for status queries.
#[derive(Debug, Clone)]
pub struct StorageStatus {
    pub id: BlockManagerId,
    pub max_mem: u64,
    pub remaining_mem: u64,
    pub blocks: HashMap<BlockId, BlockStatus>,
}

/// Coordinator state. Lives inside the single-threaded endpoint mailbox, so
/// plain maps suffice; only the metrics bundle is shared.
pub struct MasterDirectory {
    conf: MasterConfig,
    profiles: AppProfiles,
    workers: HashMap<String, WorkerInfo>,
    block_locations: HashMap<BlockId, HashSet<BlockManagerId>>,
    metrics: Arc<MasterMetrics>,
    total_reference: i64,
    started_at: Instant,
}

impl MasterDirectory {
    pub fn new(conf: MasterConfig) -> Self {
        let profiles = load_profiles(&conf.profile_dir, &conf.app_name);
        info!(
            "master for {} starting with {} profiled datasets, {} peer pairs",
            conf.app_name,
            profiles.ref_profile.len(),
            profiles.peer_profile.len() / 2,
        );
        Self {
            conf,
            profiles,
            workers: HashMap::new(),
            block_locations: HashMap::new(),
            metrics: Arc::new(MasterMetrics::default()),
            total_reference: 0,
            started_at: Instant::now(),
        }
    }

    pub fn metrics(&self) -> Arc<MasterMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn total_reference(&self) -> i64 {
        self.total_reference
    }

    /// Register a worker. A worker re-registering under the same executor id
    /// supersedes the old instance entirely.
    pub fn register(
        &mut self,
        id: BlockManagerId,
        max_mem: u64,
        endpoint: Arc<dyn WorkerEndpoint>,
    ) {
        if self.workers.contains_key(&id.executor_id) {
            warn!("{} is re-registering; dropping the old instance", id);
            self.remove_executor(&id.executor_id.clone());
        }
        info!("worker added: {} with {} bytes", id, max_mem);
        self.workers.insert(
            id.executor_id.clone(),
            WorkerInfo {
                id,
                max_mem,
                remaining_mem: max_mem,
                last_seen: current_timestamp_secs(),
                blocks: HashMap::new(),
                cached_blocks: HashSet::new(),
                endpoint,
            },
        );
    }

    /// Merge a block-status report into the worker and location maps.
    /// Reports from unregistered workers are rejected, except the driver's,
    /// which are acknowledged without being tracked.
    pub fn update_block_info(
        &mut self,
        worker: &BlockManagerId,
        block: BlockId,
        level: StorageLevel,
        mem_bytes: u64,
        disk_bytes: u64,
    ) -> bool {
        let Some(info) = self.workers.get_mut(&worker.executor_id) else {
            return worker.is_driver();
        };
        info.last_seen = current_timestamp_secs();

        if let Some(old) = info.blocks.remove(&block) {
            info.remaining_mem += old.mem_bytes;
        }

        if !level.is_valid() {
            info.cached_blocks.remove(&block);
            Self::drop_location(&mut self.block_locations, &block, worker);
            debug!("{} no longer holds {}", worker, block);
            return true;
        }

        let status = BlockStatus {
            storage_level: level,
            mem_bytes,
            disk_bytes,
        };
        info.remaining_mem = info.remaining_mem.saturating_sub(mem_bytes);
        info.blocks.insert(block.clone(), status);
        if status.is_cached() {
            info.cached_blocks.insert(block.clone());
            self.block_locations
                .entry(block)
                .or_default()
                .insert(worker.clone());
        } else {
            info.cached_blocks.remove(&block);
            Self::drop_location(&mut self.block_locations, &block, worker);
        }
        true
    }

    fn drop_location(
        locations: &mut HashMap<BlockId, HashSet<BlockManagerId>>,
        block: &BlockId,
        worker: &BlockManagerId,
    ) {
        if let Some(holders) = locations.get_mut(block) {
            holders.remove(worker);
            if holders.is_empty() {
                locations.remove(block);
            }
        }
    }

    pub fn get_locations(&self, block: &BlockId) -> Vec<BlockManagerId> {
        self.block_locations
            .get(block)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_locations_multiple(&self, blocks: &[BlockId]) -> Vec<Vec<BlockManagerId>> {
        blocks.iter().map(|b| self.get_locations(b)).collect()
    }

    /// Every other non-driver worker, for replication targets.
    pub fn get_peers(&self, worker: &BlockManagerId) -> Vec<BlockManagerId> {
        self.workers
            .values()
            .filter(|info| !info.id.is_driver() && info.id != *worker)
            .map(|info| info.id.clone())
            .collect()
    }

    pub fn get_executor_endpoint(&self, executor_id: &str) -> Option<Arc<dyn WorkerEndpoint>> {
        self.workers
            .get(executor_id)
            .map(|info| Arc::clone(&info.endpoint))
    }

    pub fn get_memory_status(&self) -> HashMap<BlockManagerId, (u64, u64)> {
        self.workers
            .values()
            .map(|info| (info.id.clone(), (info.max_mem, info.remaining_mem)))
            .collect()
    }

    pub fn get_storage_status(&self) -> Vec<StorageStatus> {
        self.workers
            .values()
            .map(|info| StorageStatus {
                id: info.id.clone(),
                max_mem: info.max_mem,
                remaining_mem: info.remaining_mem,
                blocks: info.blocks.clone(),
            })
            .collect()
    }

    pub fn get_block_status(&self, block: &BlockId) -> HashMap<BlockManagerId, BlockStatus> {
        self.workers
            .values()
            .filter_map(|info| {
                info.blocks
                    .get(block)
                    .map(|status| (info.id.clone(), *status))
            })
            .collect()
    }

    pub fn get_matching_block_ids<F>(&self, pred: F) -> Vec<BlockId>
    where
        F: Fn(&BlockId) -> bool,
    {
        let mut seen = HashSet::new();
        self.workers
            .values()
            .flat_map(|info| info.blocks.keys())
            .filter(|b| pred(b))
            .filter(|b| seen.insert((*b).clone()))
            .cloned()
            .collect()
    }

    pub fn has_cached_blocks(&self, executor_id: &str) -> bool {
        self.workers
            .get(executor_id)
            .map(|info| !info.cached_blocks.is_empty())
            .unwrap_or(false)
    }

    pub fn heartbeat(&mut self, worker: &BlockManagerId) -> bool {
        match self.workers.get_mut(&worker.executor_id) {
            Some(info) => {
                info.last_seen = current_timestamp_secs();
                true
            }
            None => false,
        }
    }

    pub fn report_cache_hit(&self, worker: &BlockManagerId, counts: [u64; 4]) {
        debug!("{} reported counters {:?}", worker, counts);
        self.metrics.accumulate(counts);
    }

    /// The profile triple a freshly registered worker pulls.
    pub fn get_ref_profile(&self) -> AppProfiles {
        self.profiles.clone()
    }

    pub fn remove_executor(&mut self, executor_id: &str) {
        let Some(info) = self.workers.remove(executor_id) else {
            return;
        };
        info!("removing worker {}", info.id);
        for block in info.blocks.keys() {
            Self::drop_location(&mut self.block_locations, block, &info.id);
        }
    }

    /// Purge an RDD's blocks from the master metadata (synchronously), then
    /// tell every worker to drop theirs. The returned future resolves to the
    /// total number of blocks workers removed.
    pub fn remove_rdd(&mut self, rdd_id: DatasetId) -> impl Future<Output = u64> + Send {
        let targets: Vec<BlockId> = self
            .block_locations
            .keys()
            .filter(|b| b.dataset() == Some(rdd_id))
            .cloned()
            .collect();
        for block in targets {
            if let Some(holders) = self.block_locations.remove(&block) {
                for holder in holders {
                    if let Some(info) = self.workers.get_mut(&holder.executor_id) {
                        info.blocks.remove(&block);
                        info.cached_blocks.remove(&block);
                    }
                }
            }
        }
        self.fan_out_counting(WorkerMessage::RemoveRdd { rdd_id })
    }

    pub fn remove_shuffle(&mut self, shuffle_id: u64) -> impl Future<Output = u64> + Send {
        self.fan_out_counting(WorkerMessage::RemoveShuffle { shuffle_id })
    }

    pub fn remove_broadcast(
        &mut self,
        broadcast_id: u64,
        from_driver: bool,
    ) -> impl Future<Output = u64> + Send {
        self.fan_out_counting(WorkerMessage::RemoveBroadcast {
            broadcast_id,
            from_driver,
        })
    }

    /// A job starts: ship its reference map (from the loaded profile) to
    /// every worker.
    pub fn broadcast_job_id(&mut self, job: JobId) -> impl Future<Output = u64> + Send {
        let refs = self.profiles.ref_profile_by_job.get(&job).cloned();
        if refs.is_none() {
            debug!("no per-job profile for job {}", job);
        }
        self.fan_out_counting(WorkerMessage::BroadcastJobDag { job, refs })
    }

    /// Ship an explicit reference map and account for the references it
    /// introduces across `partitions` partitions.
    pub fn broadcast_ref_count(
        &mut self,
        job: JobId,
        partitions: u64,
        refs: HashMap<DatasetId, i64>,
    ) -> impl Future<Output = u64> + Send {
        let introduced: i64 = refs.values().sum::<i64>() * partitions as i64;
        self.total_reference += introduced;
        debug!(
            "job {} introduces {} references (total {})",
            job, introduced, self.total_reference
        );
        self.fan_out_counting(WorkerMessage::BroadcastJobDag {
            job,
            refs: Some(refs),
        })
    }

    pub fn broadcast_dag_info(
        &mut self,
        job: JobId,
        dag: Option<DagInfo>,
        access_number_global: u64,
    ) -> impl Future<Output = u64> + Send {
        self.fan_out_counting(WorkerMessage::BroadcastDagInfo {
            job,
            dag,
            access_number_global,
        })
    }

    /// A worker lost a block whose dataset is peered: every worker hears
    /// about it, in both reaction flavors, under one event id so replays
    /// collapse.
    pub fn block_with_peer_evicted(&mut self, block: BlockId) -> impl Future<Output = u64> + Send {
        let peered = block
            .dataset()
            .map(|d| self.profiles.peer_profile.contains_key(&d))
            .unwrap_or(false);
        let sends: Vec<WorkerMessage> = if peered {
            let event = Uuid::new_v4();
            vec![
                WorkerMessage::CheckPeersConservatively {
                    block: block.clone(),
                    event,
                },
                WorkerMessage::CheckPeersStrictly { block, event },
            ]
        } else {
            // No peer known: logged and swallowed.
            debug!("peer eviction of {} but its dataset has no peer", block);
            Vec::new()
        };
        let endpoints = self.all_endpoints();
        let timeout = self.conf.ask_timeout;
        let retries = self.conf.ask_retries;
        async move {
            let mut acks = 0;
            for msg in sends {
                acks += fan_out(&endpoints, msg, timeout, retries).await;
            }
            acks
        }
    }

    /// Write the shutdown telemetry.
    pub fn stop(&self) {
        let runtime_ms = self.started_at.elapsed().as_millis();
        info!(
            "master for {} stopping after {} ms",
            self.conf.app_name, runtime_ms
        );
        write_result(
            &self.conf.profile_dir,
            &self.conf.app_name,
            runtime_ms,
            &self.metrics,
        );
    }

    fn all_endpoints(&self) -> Vec<(BlockManagerId, Arc<dyn WorkerEndpoint>)> {
        self.workers
            .values()
            .map(|info| (info.id.clone(), Arc::clone(&info.endpoint)))
            .collect()
    }

    fn fan_out_counting(&self, msg: WorkerMessage) -> impl Future<Output = u64> + Send {
        let endpoints = self.all_endpoints();
        let timeout = self.conf.ask_timeout;
        let retries = self.conf.ask_retries;
        async move { fan_out(&endpoints, msg, timeout, retries).await }
    }
}

/// Ask every worker concurrently and sum the numeric replies. Failures are
/// logged and excluded from the sum.
async fn fan_out(
    endpoints: &[(BlockManagerId, Arc<dyn WorkerEndpoint>)],
    msg: WorkerMessage,
    timeout: Duration,
    retries: u32,
) -> u64 {
    let mut handles = Vec::with_capacity(endpoints.len());
    for (id, endpoint) in endpoints {
        let id = id.clone();
        let endpoint = Arc::clone(endpoint);
        let msg = msg.clone();
        handles.push(tokio::spawn(async move {
            match ask_with_retry(endpoint.as_ref(), msg, timeout, retries).await {
                Ok(reply) => reply.count(),
                Err(e) => {
                    warn!("ask to {} failed: {}", id, e);
                    0
                }
            }
        }));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap_or(0);
    }
    total
}

/// One ask with the configured timeout, retried a bounded number of times.
/// A timeout mutates nothing on the caller's side; it only surfaces after
/// the retries run out.
pub async fn ask_with_retry(
    endpoint: &dyn WorkerEndpoint,
    msg: WorkerMessage,
    timeout: Duration,
    retries: u32,
) -> Result<WorkerReply> {
    let mut attempt = 0;
    loop {
        match tokio::time::timeout(timeout, endpoint.ask(msg.clone())).await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(e)) => {
                if attempt < retries && e.is_retryable() {
                    warn!("ask failed (attempt {}): {}", attempt + 1, e);
                } else {
                    return Err(e);
                }
            }
            Err(_) => {
                if attempt >= retries {
                    return Err(EmbersError::timeout(format!(
                        "ask gave up after {} attempts",
                        attempt + 1
                    )));
                }
                warn!("ask timed out (attempt {})", attempt + 1);
            }
        }
        attempt += 1;
    }
}
