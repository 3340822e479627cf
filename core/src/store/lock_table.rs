//! Per-block read/write locks.

use crate::block::BlockId;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use tracing::warn;

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

impl LockState {
    fn unheld(&self) -> bool {
        self.readers == 0 && !self.writer
    }
}

/// Non-reentrant read/write locks keyed by block id.
///
/// Locks are released explicitly, not by guard drop: a write lock taken for
/// an eviction survives the storage transition and is unlocked only after
/// the post-eviction state has settled. A thread that re-locks a block it
/// already holds will block on itself.
#[derive(Debug, Default)]
pub struct BlockLockTable {
    states: Mutex<HashMap<BlockId, LockState>>,
    released: Condvar,
}

impl BlockLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the write lock on `block`. With `blocking = false` this is a
    /// try-lock: any other holder, readers included, means `false`.
    pub fn lock_for_writing(&self, block: &BlockId, blocking: bool) -> bool {
        let mut states = self.states.lock().unwrap();
        loop {
            let state = states.entry(block.clone()).or_default();
            if state.unheld() {
                state.writer = true;
                return true;
            }
            if !blocking {
                return false;
            }
            states = self.released.wait(states).unwrap();
        }
    }

    /// Acquire a read lock on `block`. Readers exclude the writer only.
    pub fn lock_for_reading(&self, block: &BlockId, blocking: bool) -> bool {
        let mut states = self.states.lock().unwrap();
        loop {
            let state = states.entry(block.clone()).or_default();
            if !state.writer {
                state.readers += 1;
                return true;
            }
            if !blocking {
                return false;
            }
            states = self.released.wait(states).unwrap();
        }
    }

    /// Release one hold on `block`: the write lock when held, one reader
    /// otherwise.
    pub fn unlock(&self, block: &BlockId) {
        let mut states = self.states.lock().unwrap();
        match states.get_mut(block) {
            Some(state) if state.writer => state.writer = false,
            Some(state) if state.readers > 0 => state.readers -= 1,
            _ => {
                warn!("unlock of {} which holds no lock", block);
                return;
            }
        }
        self.released.notify_all();
    }

    /// Drop all lock metadata for `block`.
    pub fn remove_block(&self, block: &BlockId) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.remove(block) {
            if !state.unheld() {
                warn!("removed lock metadata for {} while it was held", block);
            }
        }
        self.released.notify_all();
    }

    pub fn is_write_locked(&self, block: &BlockId) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(block)
            .map(|s| s.writer)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_write_excludes_everyone() {
        let table = BlockLockTable::new();
        let b = BlockId::rdd(1, 0);

        assert!(table.lock_for_writing(&b, false));
        assert!(!table.lock_for_writing(&b, false));
        assert!(!table.lock_for_reading(&b, false));
        table.unlock(&b);
        assert!(table.lock_for_reading(&b, false));
    }

    #[test]
    fn test_readers_block_try_write() {
        let table = BlockLockTable::new();
        let b = BlockId::rdd(1, 0);

        assert!(table.lock_for_reading(&b, false));
        assert!(table.lock_for_reading(&b, false));
        assert!(!table.lock_for_writing(&b, false));
        table.unlock(&b);
        assert!(!table.lock_for_writing(&b, false));
        table.unlock(&b);
        assert!(table.lock_for_writing(&b, false));
    }

    #[test]
    fn test_blocking_write_waits_for_reader() {
        let table = Arc::new(BlockLockTable::new());
        let b = BlockId::rdd(1, 0);
        assert!(table.lock_for_reading(&b, false));

        let writer_table = Arc::clone(&table);
        let writer_block = b.clone();
        let writer = std::thread::spawn(move || {
            assert!(writer_table.lock_for_writing(&writer_block, true));
            writer_table.unlock(&writer_block);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        table.unlock(&b);
        writer.join().unwrap();
    }

    #[test]
    fn test_remove_block_drops_metadata() {
        let table = BlockLockTable::new();
        let b = BlockId::rdd(1, 0);
        assert!(table.lock_for_writing(&b, false));
        table.remove_block(&b);
        assert!(!table.is_write_locked(&b));
        // Fresh metadata after removal.
        assert!(table.lock_for_writing(&b, false));
    }
}
