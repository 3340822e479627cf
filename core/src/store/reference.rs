//! Reference tracking: per-dataset profiles and per-block remaining counts.

use crate::block::{BlockId, DatasetId, JobId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Reuse-interval histogram: interval length to occurrence count.
pub type ReuseHistogram = BTreeMap<u64, u64>;

/// Per-dataset reuse histograms, ordered by dataset id so lease computation
/// visits candidates deterministically.
pub type DagInfo = BTreeMap<DatasetId, ReuseHistogram>;

fn decremented(v: i64) -> i64 {
    (v - 1).max(0)
}

/// Tracks how many more times each block and dataset will be referenced.
///
/// `ref_map` spans every storage tier and outlives spills; `current_ref_map`
/// is restricted to blocks presently in the entry table. Each map carries
/// its own mutex; no operation holds two of them at once except the
/// dataset-wide rewrites, which take the two block maps in a fixed order.
#[derive(Debug, Default)]
pub struct ReferenceModel {
    ref_profile: Mutex<HashMap<DatasetId, i64>>,
    ref_profile_by_job: Mutex<HashMap<JobId, HashMap<DatasetId, i64>>>,
    peer_profile: Mutex<HashMap<DatasetId, DatasetId>>,
    ref_map: Mutex<HashMap<BlockId, i64>>,
    current_ref_map: Mutex<HashMap<BlockId, i64>>,
    peer_lost_blocks: Mutex<HashSet<BlockId>>,
    dag_info: Mutex<DagInfo>,
    current_dag_info: Mutex<DagInfo>,
    seen_peer_events: Mutex<HashSet<Uuid>>,
}

impl ReferenceModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the app-wide profiles, as fetched from the master at startup.
    pub fn install_profiles(
        &self,
        ref_profile: HashMap<DatasetId, i64>,
        by_job: HashMap<JobId, HashMap<DatasetId, i64>>,
        peers: HashMap<DatasetId, DatasetId>,
    ) {
        *self.ref_profile.lock().unwrap() = ref_profile;
        *self.ref_profile_by_job.lock().unwrap() = by_job;
        *self.peer_profile.lock().unwrap() = peers;
    }

    /// Replace the reuse-interval histograms from a DAG broadcast.
    pub fn install_dag_info(&self, dag: DagInfo) {
        *self.dag_info.lock().unwrap() = dag;
    }

    pub fn dag_snapshot(&self) -> DagInfo {
        self.dag_info.lock().unwrap().clone()
    }

    pub fn has_dag(&self, dataset: DatasetId) -> bool {
        self.dag_info.lock().unwrap().contains_key(&dataset)
    }

    /// Record that `dataset`'s histogram is live in memory.
    pub fn activate_dag(&self, dataset: DatasetId) {
        let dag = self.dag_info.lock().unwrap();
        if let Some(hist) = dag.get(&dataset) {
            self.current_dag_info
                .lock()
                .unwrap()
                .insert(dataset, hist.clone());
        }
    }

    pub fn ref_profile_of(&self, dataset: DatasetId) -> Option<i64> {
        self.ref_profile.lock().unwrap().get(&dataset).copied()
    }

    pub fn peer_of(&self, dataset: DatasetId) -> Option<DatasetId> {
        self.peer_profile.lock().unwrap().get(&dataset).copied()
    }

    pub fn ref_of(&self, block: &BlockId) -> Option<i64> {
        self.ref_map.lock().unwrap().get(block).copied()
    }

    pub fn current_ref(&self, block: &BlockId) -> Option<i64> {
        self.current_ref_map.lock().unwrap().get(block).copied()
    }

    /// Blocks of `dataset` presently counted as in-memory.
    pub fn cached_blocks_of(&self, dataset: DatasetId) -> usize {
        self.current_ref_map
            .lock()
            .unwrap()
            .keys()
            .filter(|b| b.dataset() == Some(dataset))
            .count()
    }

    /// Assign the app-wide remaining reference count to an arriving block.
    ///
    /// A block already tracked keeps its count (a re-cache after a spill is
    /// routine, not an error); otherwise the dataset profile applies, or 1
    /// when the dataset has no profile. A pending peer decrement recorded
    /// before the block arrived is applied here, exactly once.
    pub fn register_block(&self, block: &BlockId) -> i64 {
        let profiled = block
            .dataset()
            .and_then(|d| self.ref_profile.lock().unwrap().get(&d).copied());
        let mut ref_map = self.ref_map.lock().unwrap();
        if let Some(existing) = ref_map.get(block) {
            debug!("{} already has a reference count of {}", block, existing);
            return *existing;
        }
        let mut refs = profiled.unwrap_or(1);
        if self.peer_lost_blocks.lock().unwrap().remove(block) {
            debug!("applying pending peer decrement to arriving {}", block);
            refs = decremented(refs);
        }
        ref_map.insert(block.clone(), refs);
        refs
    }

    /// Mirror the block's count into the in-memory map. Called once the
    /// entry is installed in the entry table.
    pub fn activate_block(&self, block: &BlockId) {
        let refs = {
            let ref_map = self.ref_map.lock().unwrap();
            *ref_map
                .get(block)
                .unwrap_or_else(|| panic!("{} activated without a reference count", block))
        };
        self.current_ref_map.lock().unwrap().insert(block.clone(), refs);
    }

    /// A successful in-memory read consumes one reference on both tiers.
    pub fn on_hit(&self, block: &BlockId) {
        if let Some(v) = self.ref_map.lock().unwrap().get_mut(block) {
            *v = decremented(*v);
        }
        if let Some(v) = self.current_ref_map.lock().unwrap().get_mut(block) {
            *v = decremented(*v);
        }
    }

    /// A miss (or recomputation) consumes one app-wide reference only.
    pub fn on_miss(&self, block: &BlockId) {
        if let Some(v) = self.ref_map.lock().unwrap().get_mut(block) {
            *v = decremented(*v);
        }
    }

    /// Forget the in-memory count only; the app-wide count survives a spill.
    pub fn deactivate_block(&self, block: &BlockId) {
        self.current_ref_map.lock().unwrap().remove(block);
    }

    /// Forget every count for a fully removed block.
    pub fn remove_block(&self, block: &BlockId) {
        self.ref_map.lock().unwrap().remove(block);
        self.current_ref_map.lock().unwrap().remove(block);
        self.peer_lost_blocks.lock().unwrap().remove(block);
    }

    /// Whether `event` was already applied; records it otherwise.
    fn is_replay(&self, event: Uuid) -> bool {
        !self.seen_peer_events.lock().unwrap().insert(event)
    }

    /// Conservative reaction to a peer eviction: the evicted block and its
    /// counterpart partition each lose one reference. A counterpart not yet
    /// cached here gets the decrement queued for its arrival.
    pub fn peer_evicted_conservatively(&self, block: &BlockId, event: Uuid) {
        if self.is_replay(event) {
            debug!("ignoring replayed peer eviction event {}", event);
            return;
        }
        let (dataset, partition) = match (block.dataset(), block.partition()) {
            (Some(d), Some(p)) => (d, p),
            _ => {
                warn!("peer eviction for non-dataset block {}", block);
                return;
            }
        };
        let peer = match self.peer_of(dataset) {
            Some(peer) => peer,
            None => {
                debug!("no peer registered for dataset {}", dataset);
                return;
            }
        };
        self.decrement_block(block);
        let counterpart = BlockId::rdd(peer, partition);
        if self.ref_of(&counterpart).is_some() {
            self.decrement_block(&counterpart);
        } else {
            debug!("queueing peer decrement for unseen {}", counterpart);
            self.peer_lost_blocks.lock().unwrap().insert(counterpart);
        }
    }

    /// Strict reaction to a peer eviction: both datasets lose one reference
    /// in the profile and on every tracked block.
    pub fn peer_evicted_strictly(&self, block: &BlockId, event: Uuid) {
        if self.is_replay(event) {
            debug!("ignoring replayed peer eviction event {}", event);
            return;
        }
        let dataset = match block.dataset() {
            Some(d) => d,
            None => {
                warn!("peer eviction for non-dataset block {}", block);
                return;
            }
        };
        let peer = match self.peer_of(dataset) {
            Some(peer) => peer,
            None => {
                debug!("no peer registered for dataset {}", dataset);
                return;
            }
        };
        {
            let mut profile = self.ref_profile.lock().unwrap();
            for d in [dataset, peer] {
                if let Some(v) = profile.get_mut(&d) {
                    *v = decremented(*v);
                }
            }
        }
        let in_pair = |b: &BlockId| b.dataset() == Some(dataset) || b.dataset() == Some(peer);
        {
            let mut ref_map = self.ref_map.lock().unwrap();
            for (_, v) in ref_map.iter_mut().filter(|(b, _)| in_pair(b)) {
                *v = decremented(*v);
            }
        }
        {
            let mut current = self.current_ref_map.lock().unwrap();
            for (_, v) in current.iter_mut().filter(|(b, _)| in_pair(b)) {
                *v = decremented(*v);
            }
        }
    }

    /// A job starts: its per-dataset counts replace the app-wide profile and
    /// rewrite every tracked block of those datasets.
    pub fn apply_job_profile(&self, refs: &HashMap<DatasetId, i64>) {
        let mut profile = self.ref_profile.lock().unwrap();
        for (&dataset, &new_ref) in refs {
            profile.insert(dataset, new_ref);
            let mut ref_map = self.ref_map.lock().unwrap();
            for (_, v) in ref_map
                .iter_mut()
                .filter(|(b, _)| b.dataset() == Some(dataset))
            {
                *v = new_ref;
            }
            drop(ref_map);
            let mut current = self.current_ref_map.lock().unwrap();
            for (_, v) in current
                .iter_mut()
                .filter(|(b, _)| b.dataset() == Some(dataset))
            {
                *v = new_ref;
            }
        }
    }

    pub fn job_profile(&self, job: JobId) -> Option<HashMap<DatasetId, i64>> {
        self.ref_profile_by_job.lock().unwrap().get(&job).cloned()
    }

    /// Drop all per-block state. Profiles and histograms survive; they came
    /// from the master, not from the cache contents.
    pub fn clear_block_state(&self) {
        self.ref_map.lock().unwrap().clear();
        self.current_ref_map.lock().unwrap().clear();
        self.peer_lost_blocks.lock().unwrap().clear();
        self.current_dag_info.lock().unwrap().clear();
    }

    fn decrement_block(&self, block: &BlockId) {
        if let Some(v) = self.ref_map.lock().unwrap().get_mut(block) {
            *v = decremented(*v);
        }
        if let Some(v) = self.current_ref_map.lock().unwrap().get_mut(block) {
            *v = decremented(*v);
        }
    }
}
