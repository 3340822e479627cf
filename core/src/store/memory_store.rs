//! The worker-side memory store: admission, reads, and removal.

use crate::block::{BlockId, DatasetId, MemoryMode};
use crate::config::CacheConfig;
use crate::store::account::{MemoryAccount, SpaceReclaimer, TaskAttemptId};
use crate::store::entry_table::{ChunkedBuffer, Entry, EntryTable};
use crate::store::eviction::{BlockEvictionHandler, EvictionPlanner};
use crate::store::lease::LeaseEngine;
use crate::store::lock_table::BlockLockTable;
use crate::store::reference::{DagInfo, ReferenceModel};
use crate::store::Data;
use embers_common::{EmbersError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Hit/miss and disk-traffic counters a worker reports to the master.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub rdd_hits: AtomicU64,
    pub rdd_misses: AtomicU64,
    pub disk_reads: AtomicU64,
    pub disk_writes: AtomicU64,
}

impl StoreMetrics {
    /// Counter vector in report order: hit, miss, disk read, disk write.
    pub fn snapshot(&self) -> [u64; 4] {
        [
            self.rdd_hits.load(Ordering::Relaxed),
            self.rdd_misses.load(Ordering::Relaxed),
            self.disk_reads.load(Ordering::Relaxed),
            self.disk_writes.load(Ordering::Relaxed),
        ]
    }
}

/// Iterator handed back when unrolling ran out of memory: replays the
/// already-materialized prefix, then the rest of the input. The unroll
/// reservation is held until the prefix is consumed or the iterator is
/// dropped.
pub struct PartiallyUnrolledIterator<T> {
    account: Arc<MemoryAccount>,
    task: TaskAttemptId,
    mode: MemoryMode,
    unroll_bytes: u64,
    released: bool,
    unrolled: std::vec::IntoIter<T>,
    rest: Box<dyn Iterator<Item = T> + Send>,
}

impl<T> PartiallyUnrolledIterator<T> {
    /// Give up on the values and free the unroll reservation.
    pub fn discard(self) {}

    fn release(&mut self) {
        if !self.released {
            self.account
                .release_unroll(self.task, self.unroll_bytes, self.mode);
            self.released = true;
        }
    }
}

impl<T> Iterator for PartiallyUnrolledIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self.unrolled.next() {
            Some(v) => Some(v),
            None => {
                // Prefix fully replayed; its memory is no longer needed.
                self.release();
                self.rest.next()
            }
        }
    }
}

impl<T> Drop for PartiallyUnrolledIterator<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Counterpart of [`PartiallyUnrolledIterator`] for serialized puts: holds
/// the bytes written so far plus the unserialized remainder.
pub struct PartiallySerializedBlock<T: Data> {
    account: Arc<MemoryAccount>,
    task: TaskAttemptId,
    mode: MemoryMode,
    unroll_bytes: u64,
    released: bool,
    buf: ChunkedBuffer,
    rest: Box<dyn Iterator<Item = T> + Send>,
}

impl<T: Data> PartiallySerializedBlock<T> {
    pub fn serialized_len(&self) -> usize {
        self.buf.len()
    }

    /// Serialize the remainder and hand back the complete buffer, e.g. for
    /// the caller to spill. Frees the unroll reservation.
    pub fn finish(mut self) -> Result<ChunkedBuffer> {
        while let Some(v) = self.rest.next() {
            bincode::serialize_into(&mut self.buf, &v).map_err(|e| {
                EmbersError::serialization_with_source("finishing a partial block", e)
            })?;
        }
        self.release();
        Ok(std::mem::replace(&mut self.buf, ChunkedBuffer::new(1)))
    }

    /// Give up on the block and free the unroll reservation.
    pub fn discard(self) {}

    fn release(&mut self) {
        if !self.released {
            self.account
                .release_unroll(self.task, self.unroll_bytes, self.mode);
            self.released = true;
        }
    }
}

impl<T: Data> Drop for PartiallySerializedBlock<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Outcome of a value put: the stored size, or the continuation to replay.
pub type ValuesPut<T> = std::result::Result<u64, PartiallyUnrolledIterator<T>>;
/// Outcome of a serialized put.
pub type BytesPut<T> = std::result::Result<u64, PartiallySerializedBlock<T>>;

/// Bounded in-memory block store with reference-aware eviction.
pub struct MemoryStore<T: Data> {
    conf: CacheConfig,
    account: Arc<MemoryAccount>,
    entries: Arc<EntryTable<T>>,
    locks: Arc<BlockLockTable>,
    refs: Arc<ReferenceModel>,
    leases: Arc<LeaseEngine>,
    planner: EvictionPlanner<T>,
    metrics: Arc<StoreMetrics>,
}

impl<T: Data> MemoryStore<T> {
    pub fn new(conf: CacheConfig, handler: Arc<dyn BlockEvictionHandler<T>>) -> Self {
        let account = Arc::new(MemoryAccount::new(
            conf.max_on_heap_memory,
            conf.max_off_heap_memory,
        ));
        let entries = Arc::new(EntryTable::new());
        let locks = Arc::new(BlockLockTable::new());
        let refs = Arc::new(ReferenceModel::new());
        let leases = Arc::new(LeaseEngine::new());
        let planner = EvictionPlanner::new(
            conf.eviction_policy,
            Arc::clone(&entries),
            Arc::clone(&locks),
            Arc::clone(&refs),
            Arc::clone(&leases),
            Arc::clone(&account),
            handler,
        );
        Self {
            conf,
            account,
            entries,
            locks,
            refs,
            leases,
            planner,
            metrics: Arc::new(StoreMetrics::default()),
        }
    }

    pub fn memory_account(&self) -> &MemoryAccount {
        &self.account
    }

    pub fn reference_model(&self) -> &ReferenceModel {
        &self.refs
    }

    pub fn lease_engine(&self) -> &LeaseEngine {
        &self.leases
    }

    pub fn lock_table(&self) -> &BlockLockTable {
        &self.locks
    }

    pub fn metrics(&self) -> Arc<StoreMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn contains(&self, block: &BlockId) -> bool {
        self.entries.contains(block)
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    /// Store pre-serialized bytes. The bytes are only materialized once the
    /// reservation (after any eviction) succeeded.
    pub fn put_bytes<F>(
        &self,
        block: BlockId,
        size: u64,
        mode: MemoryMode,
        bytes: F,
    ) -> Result<bool>
    where
        F: FnOnce() -> ChunkedBuffer,
    {
        self.check_absent(&block)?;
        if !self.account.acquire_storage(&block, size, mode, self) {
            return Ok(false);
        }
        let buf = bytes();
        assert!(
            buf.len() as u64 == size,
            "materialized {} bytes for {} but reserved {}",
            buf.len(),
            block,
            size
        );
        self.install_entry(block, Entry::Serialized { buf, mode, size });
        Ok(true)
    }

    /// Materialize an iterator as a value entry, growing the unroll
    /// reservation as the estimate grows. On memory exhaustion the caller
    /// gets back everything it handed in.
    pub fn put_iterator_as_values<I>(
        &self,
        block: BlockId,
        task: TaskAttemptId,
        values: I,
    ) -> Result<ValuesPut<T>>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        self.check_absent(&block)?;
        let mode = MemoryMode::OnHeap;
        let mut iter = values;
        let mut vector: Vec<T> = Vec::new();
        let mut keep_unrolling =
            self.account
                .acquire_unroll(&block, task, self.conf.unroll_initial_bytes, mode, self);
        let mut threshold = if keep_unrolling {
            self.conf.unroll_initial_bytes
        } else {
            warn!("failed to reserve initial unroll memory for {}", block);
            0
        };
        let mut exhausted = false;

        while keep_unrolling {
            match iter.next() {
                None => {
                    exhausted = true;
                    break;
                }
                Some(v) => vector.push(v),
            }
            if vector.len() % self.conf.unroll_check_period == 0 {
                let current_size = Self::estimated_size(&vector);
                if current_size >= threshold {
                    let amount =
                        (current_size as f64 * self.conf.unroll_growth_factor) as u64 - threshold;
                    if self.account.acquire_unroll(&block, task, amount, mode, self) {
                        threshold += amount;
                    } else {
                        keep_unrolling = false;
                    }
                }
            }
        }

        if exhausted {
            let size = Self::estimated_size(&vector);
            if size > threshold {
                // Top up so the transfer below is byte-for-byte.
                if self
                    .account
                    .acquire_unroll(&block, task, size - threshold, mode, self)
                {
                    threshold += size - threshold;
                } else {
                    return Ok(Err(self.partial_values(task, mode, threshold, vector, iter)));
                }
            } else if threshold > size {
                self.account.release_unroll(task, threshold - size, mode);
                threshold = size;
            }
            debug_assert_eq!(threshold, size);
            self.account.transfer_unroll_to_storage(task, size, mode);
            self.install_entry(block, Entry::Deserialized { values: vector, size });
            Ok(Ok(size))
        } else {
            debug!(
                "ran out of unroll memory for {} after {} values",
                block,
                vector.len()
            );
            Ok(Err(self.partial_values(task, mode, threshold, vector, iter)))
        }
    }

    /// Serialize an iterator into a chunked in-memory buffer, checking the
    /// reservation after every element.
    pub fn put_iterator_as_bytes<I>(
        &self,
        block: BlockId,
        task: TaskAttemptId,
        values: I,
        mode: MemoryMode,
    ) -> Result<BytesPut<T>>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        self.check_absent(&block)?;
        let mut iter = values;
        let mut buf = ChunkedBuffer::new(self.conf.serialize_chunk_bytes);
        let mut keep_unrolling =
            self.account
                .acquire_unroll(&block, task, self.conf.unroll_initial_bytes, mode, self);
        let mut threshold = if keep_unrolling {
            self.conf.unroll_initial_bytes
        } else {
            0
        };
        let mut exhausted = false;

        while keep_unrolling {
            match iter.next() {
                None => {
                    exhausted = true;
                    break;
                }
                Some(v) => {
                    if let Err(e) = bincode::serialize_into(&mut buf, &v) {
                        // A failed put must not keep its scratch reservation.
                        self.account.release_unroll(task, threshold, mode);
                        return Err(EmbersError::serialization_with_source(
                            format!("serializing a value of {}", block),
                            e,
                        ));
                    }
                }
            }
            let written = buf.len() as u64;
            if written >= threshold {
                let amount = (written as f64 * self.conf.unroll_growth_factor) as u64 - threshold;
                if self.account.acquire_unroll(&block, task, amount, mode, self) {
                    threshold += amount;
                } else {
                    keep_unrolling = false;
                }
            }
        }

        if exhausted {
            let size = buf.len() as u64;
            if threshold > size {
                self.account.release_unroll(task, threshold - size, mode);
            }
            self.account.transfer_unroll_to_storage(task, size.min(threshold), mode);
            self.install_entry(block, Entry::Serialized { buf, mode, size });
            Ok(Ok(size))
        } else {
            debug!(
                "ran out of unroll memory serializing {} ({} bytes written)",
                block,
                buf.len()
            );
            Ok(Err(PartiallySerializedBlock {
                account: Arc::clone(&self.account),
                task,
                mode,
                unroll_bytes: threshold,
                released: false,
                buf,
                rest: Box::new(iter),
            }))
        }
    }

    /// Read a value entry. Reading a serialized entry through this view is a
    /// caller bug, not a miss.
    pub fn get_values(&self, block: &BlockId) -> Result<Option<Vec<T>>> {
        match self.entries.get(block) {
            None => {
                self.record_miss(block);
                Ok(None)
            }
            Some(Entry::Deserialized { values, .. }) => {
                self.record_hit(block);
                Ok(Some(values))
            }
            Some(Entry::Serialized { .. }) => Err(EmbersError::protocol(format!(
                "{} holds serialized bytes, not values",
                block
            ))),
        }
    }

    /// Read a serialized entry. The dual of [`MemoryStore::get_values`].
    pub fn get_bytes(&self, block: &BlockId) -> Result<Option<ChunkedBuffer>> {
        match self.entries.get(block) {
            None => {
                self.record_miss(block);
                Ok(None)
            }
            Some(Entry::Serialized { buf, .. }) => {
                self.record_hit(block);
                Ok(Some(buf))
            }
            Some(Entry::Deserialized { .. }) => Err(EmbersError::protocol(format!(
                "{} holds values, not serialized bytes",
                block
            ))),
        }
    }

    /// Drop a block unconditionally, clearing every trace of it. Returns
    /// false when the block was not cached.
    pub fn remove(&self, block: &BlockId) -> bool {
        match self.entries.remove(block) {
            None => false,
            Some(entry) => {
                self.account.release_storage(entry.size(), entry.mode());
                self.refs.remove_block(block);
                if let Some(dataset) = block.dataset() {
                    if self.refs.cached_blocks_of(dataset) == 0 {
                        self.leases.end_lease(dataset);
                    }
                }
                self.locks.remove_block(block);
                true
            }
        }
    }

    /// Remove every cached block whose id matches `pred`; returns how many
    /// went.
    pub fn remove_matching<F>(&self, pred: F) -> u64
    where
        F: Fn(&BlockId) -> bool,
    {
        let targets: Vec<BlockId> = self
            .entries
            .snapshot()
            .into_iter()
            .map(|(block, _, _)| block)
            .filter(|block| pred(block))
            .collect();
        let mut removed = 0;
        for block in targets {
            if self.remove(&block) {
                removed += 1;
            }
        }
        removed
    }

    pub fn remove_dataset(&self, dataset: DatasetId) -> u64 {
        self.remove_matching(|block| block.dataset() == Some(dataset))
    }

    /// Drop everything and reset the unroll tables.
    pub fn clear(&self) {
        for (block, size, mode) in self.entries.drain() {
            self.account.release_storage(size, mode);
            self.locks.remove_block(&block);
        }
        self.account.release_all_unroll();
        self.refs.clear_block_state();
        self.leases.clear_current();
    }

    /// Public eviction hook: free `space` bytes in `mode` on behalf of
    /// `for_block`.
    pub fn evict_blocks_to_free_space(
        &self,
        for_block: Option<&BlockId>,
        space: u64,
        mode: MemoryMode,
    ) -> u64 {
        self.planner.try_free(for_block, space, mode)
    }

    /// Task-completion listener: free whatever unroll memory the task still
    /// holds.
    pub fn release_unroll_for_task(&self, task: TaskAttemptId) -> u64 {
        self.account.release_all_unroll_for_task(task)
    }

    /// Install the app-wide profiles fetched from the master.
    pub fn install_profiles(
        &self,
        ref_profile: HashMap<DatasetId, i64>,
        by_job: HashMap<u64, HashMap<DatasetId, i64>>,
        peers: HashMap<DatasetId, DatasetId>,
    ) {
        self.refs.install_profiles(ref_profile, by_job, peers);
    }

    /// A DAG broadcast replaces the histograms and the lease assignment.
    /// The cost scale is the cached RDD block count, or the dataset count
    /// before anything is cached.
    pub fn apply_dag_broadcast(&self, dag: DagInfo, access_number_global: u64) {
        let cached = self.entries.rdd_block_count();
        let avg_cache_size = if cached > 0 {
            cached as u64
        } else {
            dag.len() as u64
        };
        self.refs.install_dag_info(dag);
        self.leases
            .recompute(&self.refs.dag_snapshot(), access_number_global, avg_cache_size);
    }

    fn check_absent(&self, block: &BlockId) -> Result<()> {
        if self.entries.contains(block) {
            Err(EmbersError::protocol(format!(
                "{} is already cached; entries are replaced by remove + put",
                block
            )))
        } else {
            Ok(())
        }
    }

    /// Entry installation order matters: reference assignment precedes the
    /// entry, the in-memory mirror follows it.
    fn install_entry(&self, block: BlockId, entry: Entry<T>) {
        let is_rdd = block.is_rdd();
        if is_rdd {
            self.refs.register_block(&block);
            if let Some(dataset) = block.dataset() {
                if self.refs.has_dag(dataset) {
                    self.refs.activate_dag(dataset);
                    self.leases.start_lease(dataset);
                }
            }
        }
        self.entries.put(block.clone(), entry);
        if is_rdd {
            self.refs.activate_block(&block);
        }
    }

    fn record_hit(&self, block: &BlockId) {
        if block.is_rdd() {
            self.metrics.rdd_hits.fetch_add(1, Ordering::Relaxed);
            self.refs.on_hit(block);
            self.leases.tick(block.dataset());
            self.planner.check_lease();
        }
    }

    fn record_miss(&self, block: &BlockId) {
        if block.is_rdd() {
            self.metrics.rdd_misses.fetch_add(1, Ordering::Relaxed);
            self.refs.on_miss(block);
            self.leases.tick(None);
            self.planner.check_lease();
        }
    }

    fn partial_values<I>(
        &self,
        task: TaskAttemptId,
        mode: MemoryMode,
        unroll_bytes: u64,
        vector: Vec<T>,
        rest: I,
    ) -> PartiallyUnrolledIterator<T>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        PartiallyUnrolledIterator {
            account: Arc::clone(&self.account),
            task,
            mode,
            unroll_bytes,
            released: false,
            unrolled: vector.into_iter(),
            rest: Box::new(rest),
        }
    }

    fn estimated_size(values: &[T]) -> u64 {
        (values.len() * std::mem::size_of::<T>()) as u64
    }
}

impl<T: Data> SpaceReclaimer for MemoryStore<T> {
    fn reclaim(&self, for_block: Option<&BlockId>, needed: u64, mode: MemoryMode) -> u64 {
        self.planner.try_free(for_block, needed, mode)
    }
}

impl<T: Data> std::fmt::Debug for MemoryStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("blocks", &self.entries.len())
            .field("policy", &self.conf.eviction_policy)
            .finish()
    }
}
