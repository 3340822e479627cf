//! Worker-side cache engine: accounting, locks, entries, references,
//! leases, eviction, and the memory store that ties them together.

pub mod account;
pub mod entry_table;
pub mod eviction;
pub mod lease;
pub mod lock_table;
pub mod memory_store;
pub mod reference;

pub use account::{MemoryAccount, SpaceReclaimer, TaskAttemptId};
pub use entry_table::{ChunkedBuffer, Entry, EntryTable};
pub use eviction::{BlockEvictionHandler, DiscardOnEvict, EvictedData, EvictionPlanner};
pub use lease::LeaseEngine;
pub use lock_table::BlockLockTable;
pub use memory_store::{
    BytesPut, MemoryStore, PartiallySerializedBlock, PartiallyUnrolledIterator, StoreMetrics,
    ValuesPut,
};
pub use reference::{DagInfo, ReferenceModel, ReuseHistogram};

use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

/// Element type cacheable by the memory store.
pub trait Data: Send + Sync + Clone + Debug + Serialize + DeserializeOwned + 'static {}

impl<T> Data for T where T: Send + Sync + Clone + Debug + Serialize + DeserializeOwned + 'static {}
