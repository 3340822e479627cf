//! Victim selection under memory pressure.

use crate::block::{BlockId, MemoryMode, StorageLevel};
use crate::config::EvictionPolicy;
use crate::store::account::MemoryAccount;
use crate::store::entry_table::{ChunkedBuffer, Entry, EntryTable};
use crate::store::lease::LeaseEngine;
use crate::store::lock_table::BlockLockTable;
use crate::store::reference::ReferenceModel;
use std::sync::Arc;
use tracing::{debug, info};

/// Block payload handed to the eviction handler.
pub enum EvictedData<T> {
    Values(Vec<T>),
    Bytes(ChunkedBuffer),
}

/// Moves an evicted block out of memory. The returned storage level is where
/// the block now lives; an invalid level means the block was discarded.
///
/// Injected at store construction; implementations may re-enter the store.
pub trait BlockEvictionHandler<T>: Send + Sync {
    fn drop_from_memory(&self, block: &BlockId, data: EvictedData<T>) -> StorageLevel;
}

/// Handler for memory-only deployments: evicted blocks are simply discarded.
pub struct DiscardOnEvict;

impl<T> BlockEvictionHandler<T> for DiscardOnEvict {
    fn drop_from_memory(&self, _block: &BlockId, _data: EvictedData<T>) -> StorageLevel {
        StorageLevel::NONE
    }
}

/// Selects and drops victims for one eviction request.
pub struct EvictionPlanner<T> {
    policy: EvictionPolicy,
    entries: Arc<EntryTable<T>>,
    locks: Arc<BlockLockTable>,
    refs: Arc<ReferenceModel>,
    leases: Arc<LeaseEngine>,
    account: Arc<MemoryAccount>,
    handler: Arc<dyn BlockEvictionHandler<T>>,
}

impl<T: Clone> EvictionPlanner<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: EvictionPolicy,
        entries: Arc<EntryTable<T>>,
        locks: Arc<BlockLockTable>,
        refs: Arc<ReferenceModel>,
        leases: Arc<LeaseEngine>,
        account: Arc<MemoryAccount>,
        handler: Arc<dyn BlockEvictionHandler<T>>,
    ) -> Self {
        Self {
            policy,
            entries,
            locks,
            refs,
            leases,
            account,
            handler,
        }
    }

    /// Free at least `needed` bytes in `mode` to admit `for_block`.
    ///
    /// Victims are write-locked as they are selected; if the byte target
    /// cannot be met the selection is released untouched and 0 is returned.
    /// A candidate is never taken from the dataset being admitted, so one
    /// oversized dataset cannot evict itself into thrash.
    pub fn try_free(&self, for_block: Option<&BlockId>, needed: u64, mode: MemoryMode) -> u64 {
        if needed == 0 {
            return 0;
        }
        let req_dataset = for_block.and_then(|b| b.dataset());
        let snapshot: Vec<(BlockId, u64, MemoryMode)> = self
            .entries
            .snapshot()
            .into_iter()
            .filter(|(block, _, block_mode)| {
                *block_mode == mode && (block.dataset().is_none() || block.dataset() != req_dataset)
            })
            .collect();

        let selected = match self.policy {
            EvictionPolicy::Lru => self.select_lru(&snapshot, needed),
            EvictionPolicy::Lrc => self.select_lrc(&snapshot, needed, for_block),
            EvictionPolicy::Leasing => self.select_leasing(&snapshot, needed, for_block),
        };

        let total: u64 = selected.iter().map(|(_, size)| size).sum();
        if total < needed {
            debug!(
                "eviction for {:?} found only {} of {} bytes, releasing selection",
                for_block, total, needed
            );
            for (block, _) in &selected {
                self.locks.unlock(block);
            }
            return 0;
        }

        let mut freed = 0;
        for (block, size) in selected {
            freed += self.drop_block(&block, size, mode);
        }
        freed
    }

    /// Drop every write-lockable RDD block whose dataset's remaining lease
    /// has run out. No byte target; called after each lease tick.
    pub fn check_lease(&self) {
        if self.policy != EvictionPolicy::Leasing {
            return;
        }
        let expired: Vec<(BlockId, u64, MemoryMode)> = self
            .entries
            .snapshot()
            .into_iter()
            .filter(|(block, _, _)| {
                block
                    .dataset()
                    .and_then(|d| self.leases.current_of(d))
                    .map(|lease| lease == 0)
                    .unwrap_or(false)
            })
            .collect();
        for (block, size, mode) in expired {
            if self.locks.lock_for_writing(&block, false) {
                debug!("lease of {} expired, dropping", block);
                self.drop_block(&block, size, mode);
            }
        }
    }

    fn select_lru(&self, snapshot: &[(BlockId, u64, MemoryMode)], needed: u64) -> Vec<(BlockId, u64)> {
        let mut selected = Vec::new();
        let mut total = 0;
        for (block, size, _) in snapshot {
            if total >= needed {
                break;
            }
            if self.locks.lock_for_writing(block, false) {
                selected.push((block.clone(), *size));
                total += size;
            }
        }
        selected
    }

    fn select_lrc(
        &self,
        snapshot: &[(BlockId, u64, MemoryMode)],
        needed: u64,
        for_block: Option<&BlockId>,
    ) -> Vec<(BlockId, u64)> {
        let incoming = self.incoming_ref_count(for_block);
        let mut candidates: Vec<(BlockId, u64, i64)> = snapshot
            .iter()
            .map(|(block, size, _)| {
                (block.clone(), *size, self.refs.current_ref(block).unwrap_or(0))
            })
            .collect();
        candidates.sort_by_key(|(_, _, refs)| *refs);

        let mut selected = Vec::new();
        let mut total = 0;
        for (block, size, refs) in candidates {
            if total >= needed || refs >= incoming {
                break;
            }
            if self.locks.lock_for_writing(&block, false) {
                selected.push((block, size));
                total += size;
            }
        }
        selected
    }

    fn select_leasing(
        &self,
        snapshot: &[(BlockId, u64, MemoryMode)],
        needed: u64,
        for_block: Option<&BlockId>,
    ) -> Vec<(BlockId, u64)> {
        let current = self.leases.current_snapshot();
        let mut selected = Vec::new();
        let mut total = 0;

        // Phase one: RDD blocks of datasets with no remaining-lease entry.
        for (block, size, _) in snapshot {
            if total >= needed {
                break;
            }
            let unleased = block
                .dataset()
                .map(|d| !current.contains_key(&d))
                .unwrap_or(false);
            if unleased && self.locks.lock_for_writing(block, false) {
                selected.push((block.clone(), *size));
                total += size;
            }
        }
        if total >= needed {
            return selected;
        }

        // Phase two: leased datasets, shortest remaining lease first. A
        // dataset is fair game only while the incoming lease does not
        // outrank it.
        let req_lease = for_block
            .and_then(|b| b.dataset())
            .map(|d| {
                self.leases
                    .current_of(d)
                    .or_else(|| self.leases.assigned(d))
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        let mut leased: Vec<(u64, u64)> = current.iter().map(|(&d, &l)| (d, l)).collect();
        leased.sort_by_key(|&(dataset, lease)| (lease, dataset));

        for (dataset, lease) in leased {
            if total >= needed {
                break;
            }
            if req_lease > lease {
                continue;
            }
            for (block, size, _) in snapshot {
                if total >= needed {
                    break;
                }
                if block.dataset() == Some(dataset) && self.locks.lock_for_writing(block, false) {
                    selected.push((block.clone(), *size));
                    total += size;
                }
            }
        }
        selected
    }

    /// The reference count the admitted block would carry: broadcast blocks
    /// (and target-less requests) always outrank cached candidates.
    fn incoming_ref_count(&self, for_block: Option<&BlockId>) -> i64 {
        let block = match for_block {
            Some(b) if b.is_rdd() => b,
            _ => return i64::MAX,
        };
        self.refs
            .ref_of(block)
            .or_else(|| block.dataset().and_then(|d| self.refs.ref_profile_of(d)))
            .unwrap_or(1)
    }

    /// Drop one write-locked block through the handler, then settle the
    /// metadata: a spill keeps the app-wide counts, a discard forgets the
    /// block entirely.
    fn drop_block(&self, block: &BlockId, size: u64, mode: MemoryMode) -> u64 {
        let entry = match self.entries.remove(block) {
            Some(entry) => entry,
            None => {
                // Lost a race with remove(); nothing left to drop.
                self.locks.unlock(block);
                return 0;
            }
        };
        let data = match entry {
            Entry::Deserialized { values, .. } => EvictedData::Values(values),
            Entry::Serialized { buf, .. } => EvictedData::Bytes(buf),
        };
        let new_level = self.handler.drop_from_memory(block, data);
        self.account.release_storage(size, mode);

        let spilled = new_level.is_valid();
        if spilled {
            self.refs.deactivate_block(block);
        } else {
            self.refs.remove_block(block);
        }
        if let Some(dataset) = block.dataset() {
            if self.refs.cached_blocks_of(dataset) == 0 {
                self.leases.end_lease(dataset);
            }
        }
        if spilled {
            self.locks.unlock(block);
        } else {
            self.locks.remove_block(block);
        }
        info!(
            "evicted {} ({} bytes, {})",
            block,
            size,
            if spilled { "spilled" } else { "discarded" }
        );
        size
    }
}
