//! Access-ordered table of in-memory block entries.

use crate::block::{BlockId, MemoryMode};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Mutex;

/// Serialized block bytes held as a sequence of bounded chunks, so growing a
/// buffer never recopies what is already written.
#[derive(Debug, Clone)]
pub struct ChunkedBuffer {
    chunk_cap: usize,
    chunks: Vec<Vec<u8>>,
    len: usize,
}

impl ChunkedBuffer {
    pub fn new(chunk_cap: usize) -> Self {
        assert!(chunk_cap > 0, "chunk capacity must be positive");
        Self {
            chunk_cap,
            chunks: Vec::new(),
            len: 0,
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            chunk_cap: len.max(1),
            chunks: if bytes.is_empty() { Vec::new() } else { vec![bytes] },
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl io::Write for ChunkedBuffer {
    fn write(&mut self, mut data: &[u8]) -> io::Result<usize> {
        let written = data.len();
        while !data.is_empty() {
            let space = match self.chunks.last() {
                Some(last) if last.len() < self.chunk_cap => self.chunk_cap - last.len(),
                _ => {
                    self.chunks.push(Vec::with_capacity(self.chunk_cap));
                    self.chunk_cap
                }
            };
            let take = space.min(data.len());
            self.chunks
                .last_mut()
                .expect("chunk exists after push")
                .extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        self.len += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One cached block: either materialized values or serialized bytes, never
/// both.
#[derive(Debug, Clone)]
pub enum Entry<T> {
    Deserialized { values: Vec<T>, size: u64 },
    Serialized {
        buf: ChunkedBuffer,
        mode: MemoryMode,
        size: u64,
    },
}

impl<T> Entry<T> {
    pub fn size(&self) -> u64 {
        match self {
            Entry::Deserialized { size, .. } => *size,
            Entry::Serialized { size, .. } => *size,
        }
    }

    /// Deserialized values always live on the heap; serialized bytes follow
    /// their buffer's mode.
    pub fn mode(&self) -> MemoryMode {
        match self {
            Entry::Deserialized { .. } => MemoryMode::OnHeap,
            Entry::Serialized { mode, .. } => *mode,
        }
    }

    pub fn is_deserialized(&self) -> bool {
        matches!(self, Entry::Deserialized { .. })
    }
}

#[derive(Debug)]
struct Slot<T> {
    stamp: u64,
    entry: Entry<T>,
}

#[derive(Debug)]
struct TableInner<T> {
    clock: u64,
    slots: HashMap<BlockId, Slot<T>>,
    order: BTreeMap<u64, BlockId>,
}

/// Insertion-ordered map of cached entries that tracks access order.
///
/// Every read restamps the key to the most-recently-used end; iteration
/// snapshots run from least- to most-recently-used. A freshly inserted key
/// is MRU at that moment, so the initial order is insertion order.
#[derive(Debug)]
pub struct EntryTable<T> {
    inner: Mutex<TableInner<T>>,
}

impl<T> Default for EntryTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EntryTable<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                clock: 0,
                slots: HashMap::new(),
                order: BTreeMap::new(),
            }),
        }
    }

    pub fn put(&self, block: BlockId, entry: Entry<T>) {
        let mut inner = self.inner.lock().unwrap();
        let stamp = inner.clock;
        inner.clock += 1;
        if let Some(old) = inner.slots.insert(block.clone(), Slot { stamp, entry }) {
            inner.order.remove(&old.stamp);
        }
        inner.order.insert(stamp, block);
    }

    /// Read an entry and move the key to the most-recently-used end.
    pub fn get(&self, block: &BlockId) -> Option<Entry<T>>
    where
        T: Clone,
    {
        let mut inner = self.inner.lock().unwrap();
        let stamp = inner.clock;
        inner.clock += 1;
        let slot = inner.slots.get_mut(block)?;
        let old_stamp = slot.stamp;
        slot.stamp = stamp;
        let entry = slot.entry.clone();
        inner.order.remove(&old_stamp);
        inner.order.insert(stamp, block.clone());
        Some(entry)
    }

    /// Read an entry without touching the access order.
    pub fn peek(&self, block: &BlockId) -> Option<Entry<T>>
    where
        T: Clone,
    {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(block).map(|slot| slot.entry.clone())
    }

    pub fn remove(&self, block: &BlockId) -> Option<Entry<T>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.remove(block)?;
        inner.order.remove(&slot.stamp);
        Some(slot.entry)
    }

    pub fn contains(&self, block: &BlockId) -> bool {
        self.inner.lock().unwrap().slots.contains_key(block)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_of(&self, block: &BlockId) -> Option<(u64, MemoryMode)> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .get(block)
            .map(|slot| (slot.entry.size(), slot.entry.mode()))
    }

    /// Metadata snapshot in least- to most-recently-used order.
    pub fn snapshot(&self) -> Vec<(BlockId, u64, MemoryMode)> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .values()
            .map(|block| {
                let slot = &inner.slots[block];
                (block.clone(), slot.entry.size(), slot.entry.mode())
            })
            .collect()
    }

    /// Number of cached RDD blocks, the lease engine's cost scale.
    pub fn rdd_block_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.keys().filter(|b| b.is_rdd()).count()
    }

    /// Remove everything, returning the removed keys with their sizes so the
    /// caller can settle byte accounting.
    pub fn drain(&self) -> Vec<(BlockId, u64, MemoryMode)> {
        let mut inner = self.inner.lock().unwrap();
        inner.order.clear();
        inner
            .slots
            .drain()
            .map(|(block, slot)| (block, slot.entry.size(), slot.entry.mode()))
            .collect()
    }
}
