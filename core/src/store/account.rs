//! Byte accounting for storage and unroll memory.

use crate::block::{BlockId, MemoryMode};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Task attempt identifier used to charge unroll reservations.
pub type TaskAttemptId = u64;

/// Capability through which an admission that ran out of space asks the
/// store to evict. Implemented by the memory store.
pub trait SpaceReclaimer {
    /// Try to free at least `needed` bytes in `mode`, on behalf of
    /// `for_block`. Returns the bytes actually freed (0 on failure).
    fn reclaim(&self, for_block: Option<&BlockId>, needed: u64, mode: MemoryMode) -> u64;
}

#[derive(Debug, Default)]
struct Pool {
    max: u64,
    storage_used: u64,
    unroll_used: u64,
    unroll_by_task: HashMap<TaskAttemptId, u64>,
}

impl Pool {
    fn free(&self) -> u64 {
        self.max.saturating_sub(self.storage_used + self.unroll_used)
    }
}

#[derive(Debug, Default)]
struct Pools {
    on_heap: Pool,
    off_heap: Pool,
}

impl Pools {
    fn pool_mut(&mut self, mode: MemoryMode) -> &mut Pool {
        match mode {
            MemoryMode::OnHeap => &mut self.on_heap,
            MemoryMode::OffHeap => &mut self.off_heap,
        }
    }

    fn pool(&self, mode: MemoryMode) -> &Pool {
        match mode {
            MemoryMode::OnHeap => &self.on_heap,
            MemoryMode::OffHeap => &self.off_heap,
        }
    }
}

/// Tracks bytes reserved for storage versus unroll, per memory mode.
///
/// Storage and unroll share one pool per mode but are tracked independently,
/// and unroll reservations are additionally charged to the owning task so a
/// completed put can transfer them to storage in one step.
///
/// Two locks: `grant` serializes a whole admission (check, evict, retry) so
/// two admissions cannot double-commit the same freed bytes; `pools` guards
/// the raw counters and is never held across an eviction handler call, which
/// may re-enter the store to release bytes.
#[derive(Debug)]
pub struct MemoryAccount {
    grant: Mutex<()>,
    pools: Mutex<Pools>,
}

impl MemoryAccount {
    pub fn new(max_on_heap: u64, max_off_heap: u64) -> Self {
        Self {
            grant: Mutex::new(()),
            pools: Mutex::new(Pools {
                on_heap: Pool {
                    max: max_on_heap,
                    ..Pool::default()
                },
                off_heap: Pool {
                    max: max_off_heap,
                    ..Pool::default()
                },
            }),
        }
    }

    pub fn max_on_heap_storage_memory(&self) -> u64 {
        self.pools.lock().unwrap().on_heap.max
    }

    pub fn max_memory(&self, mode: MemoryMode) -> u64 {
        self.pools.lock().unwrap().pool(mode).max
    }

    pub fn storage_used(&self, mode: MemoryMode) -> u64 {
        self.pools.lock().unwrap().pool(mode).storage_used
    }

    pub fn unroll_used(&self, mode: MemoryMode) -> u64 {
        self.pools.lock().unwrap().pool(mode).unroll_used
    }

    /// Total bytes committed in `mode`, storage plus unroll.
    pub fn total_used(&self, mode: MemoryMode) -> u64 {
        let pools = self.pools.lock().unwrap();
        let pool = pools.pool(mode);
        pool.storage_used + pool.unroll_used
    }

    pub fn unroll_held_by_task(&self, task: TaskAttemptId, mode: MemoryMode) -> u64 {
        self.pools
            .lock()
            .unwrap()
            .pool(mode)
            .unroll_by_task
            .get(&task)
            .copied()
            .unwrap_or(0)
    }

    /// Reserve `n` bytes of storage for `block`, evicting through
    /// `reclaimer` when the pool is short. Returns false when the bytes
    /// cannot be granted even after eviction.
    pub fn acquire_storage(
        &self,
        block: &BlockId,
        n: u64,
        mode: MemoryMode,
        reclaimer: &dyn SpaceReclaimer,
    ) -> bool {
        let _grant = self.grant.lock().unwrap();
        if n > self.max_memory(mode) {
            warn!(
                "will not store {}: {} bytes exceeds the {:?} pool entirely",
                block, n, mode
            );
            return false;
        }
        if self.try_grow_storage(n, mode) {
            return true;
        }
        let shortfall = {
            let pools = self.pools.lock().unwrap();
            n.saturating_sub(pools.pool(mode).free())
        };
        debug!(
            "storage pool short by {} bytes for {}, asking the planner",
            shortfall, block
        );
        let freed = reclaimer.reclaim(Some(block), shortfall, mode);
        if freed < shortfall {
            return false;
        }
        // One retry; the grant lock keeps the freed bytes ours.
        self.try_grow_storage(n, mode)
    }

    pub fn release_storage(&self, n: u64, mode: MemoryMode) {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.pool_mut(mode);
        if n > pool.storage_used {
            warn!(
                "released {} storage bytes but only {} were held",
                n, pool.storage_used
            );
        }
        pool.storage_used = pool.storage_used.saturating_sub(n);
    }

    /// Reserve `n` unroll bytes for `block` on behalf of `task`.
    pub fn acquire_unroll(
        &self,
        block: &BlockId,
        task: TaskAttemptId,
        n: u64,
        mode: MemoryMode,
        reclaimer: &dyn SpaceReclaimer,
    ) -> bool {
        let _grant = self.grant.lock().unwrap();
        if self.try_grow_unroll(task, n, mode) {
            return true;
        }
        let shortfall = {
            let pools = self.pools.lock().unwrap();
            n.saturating_sub(pools.pool(mode).free())
        };
        let freed = reclaimer.reclaim(Some(block), shortfall, mode);
        if freed < shortfall {
            return false;
        }
        self.try_grow_unroll(task, n, mode)
    }

    pub fn release_unroll(&self, task: TaskAttemptId, n: u64, mode: MemoryMode) {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.pool_mut(mode);
        let held = pool.unroll_by_task.get(&task).copied().unwrap_or(0);
        let released = n.min(held);
        if released < n {
            warn!(
                "task {} released {} unroll bytes but only held {}",
                task, n, held
            );
        }
        if held - released == 0 {
            pool.unroll_by_task.remove(&task);
        } else {
            pool.unroll_by_task.insert(task, held - released);
        }
        pool.unroll_used = pool.unroll_used.saturating_sub(released);
    }

    /// Free every unroll byte still charged to `task`, in both modes.
    /// Invoked by the task-completion listener.
    pub fn release_all_unroll_for_task(&self, task: TaskAttemptId) -> u64 {
        let mut pools = self.pools.lock().unwrap();
        let mut freed = 0;
        for mode in [MemoryMode::OnHeap, MemoryMode::OffHeap] {
            let pool = pools.pool_mut(mode);
            if let Some(held) = pool.unroll_by_task.remove(&task) {
                pool.unroll_used = pool.unroll_used.saturating_sub(held);
                freed += held;
            }
        }
        freed
    }

    /// Drop every unroll reservation in both modes. Part of clearing the
    /// store.
    pub fn release_all_unroll(&self) {
        let mut pools = self.pools.lock().unwrap();
        for mode in [MemoryMode::OnHeap, MemoryMode::OffHeap] {
            let pool = pools.pool_mut(mode);
            pool.unroll_by_task.clear();
            pool.unroll_used = 0;
        }
    }

    /// Atomically convert `n` unroll bytes held by `task` into storage
    /// bytes. The pool total is unchanged, so the transfer cannot fail;
    /// transferring more than the task holds is an accounting bug.
    pub fn transfer_unroll_to_storage(&self, task: TaskAttemptId, n: u64, mode: MemoryMode) {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.pool_mut(mode);
        let held = pool.unroll_by_task.get(&task).copied().unwrap_or(0);
        assert!(
            held >= n,
            "unroll to storage transfer of {} bytes exceeds the {} held by task {}",
            n,
            held,
            task
        );
        if held - n == 0 {
            pool.unroll_by_task.remove(&task);
        } else {
            pool.unroll_by_task.insert(task, held - n);
        }
        pool.unroll_used -= n;
        pool.storage_used += n;
    }

    fn try_grow_storage(&self, n: u64, mode: MemoryMode) -> bool {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.pool_mut(mode);
        if pool.free() >= n {
            pool.storage_used += n;
            true
        } else {
            false
        }
    }

    fn try_grow_unroll(&self, task: TaskAttemptId, n: u64, mode: MemoryMode) -> bool {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.pool_mut(mode);
        if pool.free() >= n {
            pool.unroll_used += n;
            *pool.unroll_by_task.entry(task).or_insert(0) += n;
            true
        } else {
            false
        }
    }
}
