//! Worker-side message handling over a memory store.

use crate::block::{BlockId, BlockManagerId};
use crate::config::PeerMode;
use crate::master::MasterHandle;
use crate::messages::{WorkerEndpoint, WorkerMessage, WorkerReply};
use crate::store::{Data, MemoryStore};
use async_trait::async_trait;
use embers_common::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Applies master-originated messages to this worker's store.
///
/// A worker runs in one peer-reaction mode and applies only the matching
/// flavor of the peer-eviction broadcast, ignoring the other.
pub struct WorkerNode<T: Data> {
    id: BlockManagerId,
    peer_mode: PeerMode,
    store: Arc<MemoryStore<T>>,
}

impl<T: Data> WorkerNode<T> {
    pub fn new(id: BlockManagerId, peer_mode: PeerMode, store: Arc<MemoryStore<T>>) -> Self {
        Self {
            id,
            peer_mode,
            store,
        }
    }

    pub fn id(&self) -> &BlockManagerId {
        &self.id
    }

    pub fn store(&self) -> &MemoryStore<T> {
        &self.store
    }

    /// Register with the master and pull the reference profiles into the
    /// local store.
    pub async fn register_with(self: &Arc<Self>, master: &MasterHandle, max_mem: u64) -> Result<()> {
        master
            .register(
                self.id.clone(),
                max_mem,
                Arc::clone(self) as Arc<dyn WorkerEndpoint>,
            )
            .await?;
        let profiles = master.get_ref_profile(self.id.clone()).await?;
        self.store.install_profiles(
            profiles.ref_profile,
            profiles.ref_profile_by_job,
            profiles.peer_profile,
        );
        Ok(())
    }

    /// Push the local hit/miss and disk counters to the master.
    pub async fn report_cache_metrics(&self, master: &MasterHandle) -> Result<()> {
        master
            .report_cache_hit(self.id.clone(), self.store.metrics().snapshot())
            .await
    }

    pub fn handle(&self, msg: WorkerMessage) -> WorkerReply {
        match msg {
            WorkerMessage::RemoveBlock { block } => WorkerReply::Flag(self.store.remove(&block)),
            WorkerMessage::RemoveRdd { rdd_id } => {
                let removed = self.store.remove_dataset(rdd_id);
                debug!("{} removed {} blocks of rdd {}", self.id, removed, rdd_id);
                WorkerReply::Count(removed)
            }
            WorkerMessage::RemoveShuffle { shuffle_id } => WorkerReply::Count(
                self.store
                    .remove_matching(|b| matches!(b, BlockId::Shuffle { shuffle_id: s, .. } if *s == shuffle_id)),
            ),
            WorkerMessage::RemoveBroadcast { broadcast_id, from_driver } => {
                debug!(
                    "{} removing broadcast {} (from driver: {})",
                    self.id, broadcast_id, from_driver
                );
                WorkerReply::Count(
                    self.store
                        .remove_matching(|b| matches!(b, BlockId::Broadcast { broadcast_id: i } if *i == broadcast_id)),
                )
            }
            WorkerMessage::BroadcastJobDag { job, refs } => {
                match refs {
                    Some(refs) => {
                        debug!("{} applying job {} reference profile", self.id, job);
                        self.store.reference_model().apply_job_profile(&refs);
                    }
                    None => debug!("job {} carried no reference profile", job),
                }
                WorkerReply::Unit
            }
            WorkerMessage::BroadcastDagInfo {
                job,
                dag,
                access_number_global,
            } => {
                if let Some(dag) = dag {
                    debug!("{} applying job {} reuse histograms", self.id, job);
                    self.store.apply_dag_broadcast(dag, access_number_global);
                }
                WorkerReply::Unit
            }
            WorkerMessage::CheckPeersConservatively { block, event } => {
                if self.peer_mode == PeerMode::Conservative {
                    self.store
                        .reference_model()
                        .peer_evicted_conservatively(&block, event);
                }
                WorkerReply::Unit
            }
            WorkerMessage::CheckPeersStrictly { block, event } => {
                if self.peer_mode == PeerMode::Strict {
                    self.store.reference_model().peer_evicted_strictly(&block, event);
                }
                WorkerReply::Unit
            }
            WorkerMessage::TriggerThreadDump => {
                info!("{} received a thread dump request", self.id);
                WorkerReply::Unit
            }
        }
    }
}

#[async_trait]
impl<T: Data> WorkerEndpoint for WorkerNode<T> {
    async fn ask(&self, msg: WorkerMessage) -> Result<WorkerReply> {
        Ok(self.handle(msg))
    }
}
