//! Block identifiers, storage levels, and block status types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a logical dataset whose partitions share profile statistics.
pub type DatasetId = u64;

/// Identifies a job submitted to the compute engine.
pub type JobId = u64;

/// Unique identifier for a cached block.
///
/// Only [`BlockId::Rdd`] blocks participate in reference-count and lease
/// accounting; broadcast, shuffle and test blocks are cached verbatim.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockId {
    Rdd {
        rdd_id: DatasetId,
        partition: u64,
    },
    Broadcast {
        broadcast_id: u64,
    },
    Shuffle {
        shuffle_id: u64,
        map_id: u64,
        reduce_id: u64,
    },
    Test {
        name: String,
    },
}

impl BlockId {
    pub fn rdd(rdd_id: DatasetId, partition: u64) -> Self {
        BlockId::Rdd { rdd_id, partition }
    }

    pub fn broadcast(broadcast_id: u64) -> Self {
        BlockId::Broadcast { broadcast_id }
    }

    pub fn shuffle(shuffle_id: u64, map_id: u64, reduce_id: u64) -> Self {
        BlockId::Shuffle {
            shuffle_id,
            map_id,
            reduce_id,
        }
    }

    pub fn test<S: Into<String>>(name: S) -> Self {
        BlockId::Test { name: name.into() }
    }

    pub fn is_rdd(&self) -> bool {
        matches!(self, BlockId::Rdd { .. })
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, BlockId::Broadcast { .. })
    }

    pub fn is_shuffle(&self) -> bool {
        matches!(self, BlockId::Shuffle { .. })
    }

    /// The dataset this block belongs to, for RDD blocks only.
    pub fn dataset(&self) -> Option<DatasetId> {
        match self {
            BlockId::Rdd { rdd_id, .. } => Some(*rdd_id),
            _ => None,
        }
    }

    /// The partition index within the dataset, for RDD blocks only.
    pub fn partition(&self) -> Option<u64> {
        match self {
            BlockId::Rdd { partition, .. } => Some(*partition),
            _ => None,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Rdd { rdd_id, partition } => write!(f, "rdd_{}_{}", rdd_id, partition),
            BlockId::Broadcast { broadcast_id } => write!(f, "broadcast_{}", broadcast_id),
            BlockId::Shuffle {
                shuffle_id,
                map_id,
                reduce_id,
            } => write!(f, "shuffle_{}_{}_{}", shuffle_id, map_id, reduce_id),
            BlockId::Test { name } => write!(f, "test_{}", name),
        }
    }
}

impl FromStr for BlockId {
    type Err = embers_common::EmbersError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = || embers_common::EmbersError::protocol(format!("bad block name: {s}"));
        if let Some(rest) = s.strip_prefix("rdd_") {
            let mut parts = rest.splitn(2, '_');
            let rdd_id = parts.next().and_then(|p| p.parse().ok());
            let partition = parts.next().and_then(|p| p.parse().ok());
            return match (rdd_id, partition) {
                (Some(rdd_id), Some(partition)) => Ok(BlockId::Rdd { rdd_id, partition }),
                _ => Err(parse_err()),
            };
        }
        if let Some(rest) = s.strip_prefix("broadcast_") {
            return rest
                .parse()
                .map(|broadcast_id| BlockId::Broadcast { broadcast_id })
                .map_err(|_| parse_err());
        }
        if let Some(rest) = s.strip_prefix("shuffle_") {
            let parts: Vec<_> = rest.splitn(3, '_').collect();
            if parts.len() == 3 {
                let ids: Vec<Option<u64>> = parts.iter().map(|p| p.parse().ok()).collect();
                if let (Some(shuffle_id), Some(map_id), Some(reduce_id)) = (ids[0], ids[1], ids[2])
                {
                    return Ok(BlockId::Shuffle {
                        shuffle_id,
                        map_id,
                        reduce_id,
                    });
                }
            }
            return Err(parse_err());
        }
        if let Some(rest) = s.strip_prefix("test_") {
            return Ok(BlockId::Test {
                name: rest.to_string(),
            });
        }
        Err(parse_err())
    }
}

/// Identifies a worker process holding cached blocks.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockManagerId {
    pub executor_id: String,
    pub host: String,
    pub port: u16,
}

impl BlockManagerId {
    pub fn new<S: Into<String>, H: Into<String>>(executor_id: S, host: H, port: u16) -> Self {
        Self {
            executor_id: executor_id.into(),
            host: host.into(),
            port,
        }
    }

    pub fn is_driver(&self) -> bool {
        self.executor_id == "driver"
    }
}

impl fmt::Display for BlockManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockManagerId({}, {}:{})", self.executor_id, self.host, self.port)
    }
}

/// Which memory region a block's bytes live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MemoryMode {
    #[default]
    OnHeap,
    OffHeap,
}

/// Defines how a block should be cached.
///
/// Mirrors the storage levels of the compute engine: the flags compose
/// instead of enumerating every combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLevel {
    pub use_disk: bool,
    pub use_memory: bool,
    pub use_off_heap: bool,
    /// Store values as-is rather than as serialized bytes.
    pub deserialized: bool,
    pub replication: u16,
}

impl StorageLevel {
    /// No caching.
    pub const NONE: StorageLevel = StorageLevel {
        use_disk: false,
        use_memory: false,
        use_off_heap: false,
        deserialized: false,
        replication: 1,
    };
    /// Cache values in memory.
    pub const MEMORY_ONLY: StorageLevel = StorageLevel {
        use_disk: false,
        use_memory: true,
        use_off_heap: false,
        deserialized: true,
        replication: 1,
    };
    /// Cache serialized bytes in memory.
    pub const MEMORY_ONLY_SER: StorageLevel = StorageLevel {
        use_disk: false,
        use_memory: true,
        use_off_heap: false,
        deserialized: false,
        replication: 1,
    };
    /// Cache on disk only.
    pub const DISK_ONLY: StorageLevel = StorageLevel {
        use_disk: true,
        use_memory: false,
        use_off_heap: false,
        deserialized: false,
        replication: 1,
    };
    /// Cache in memory, spill to disk when memory is short.
    pub const MEMORY_AND_DISK: StorageLevel = StorageLevel {
        use_disk: true,
        use_memory: true,
        use_off_heap: false,
        deserialized: true,
        replication: 1,
    };

    pub fn memory_mode(&self) -> MemoryMode {
        if self.use_off_heap {
            MemoryMode::OffHeap
        } else {
            MemoryMode::OnHeap
        }
    }

    /// A level is valid when it stores the block somewhere and replicates at
    /// least once.
    pub fn is_valid(&self) -> bool {
        (self.use_memory || self.use_disk) && self.replication > 0
    }

    pub fn is_cached(&self) -> bool {
        self.use_memory || self.use_disk
    }
}

impl Default for StorageLevel {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StorageLevel(disk={}, memory={}, offheap={}, deserialized={}, replication={})",
            self.use_disk, self.use_memory, self.use_off_heap, self.deserialized, self.replication
        )
    }
}

/// Where a block currently lives and how much space it takes there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub storage_level: StorageLevel,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
}

impl BlockStatus {
    pub fn empty() -> Self {
        Self {
            storage_level: StorageLevel::NONE,
            mem_bytes: 0,
            disk_bytes: 0,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.mem_bytes + self.disk_bytes > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_name_round_trip() {
        let ids = vec![
            BlockId::rdd(3, 7),
            BlockId::broadcast(12),
            BlockId::shuffle(1, 2, 3),
            BlockId::test("scratch"),
        ];
        for id in ids {
            let name = id.to_string();
            let parsed: BlockId = name.parse().unwrap();
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn test_bad_block_name_rejected() {
        assert!("rdd_x_1".parse::<BlockId>().is_err());
        assert!("stream_5".parse::<BlockId>().is_err());
        assert!("shuffle_1_2".parse::<BlockId>().is_err());
    }

    #[test]
    fn test_dataset_discriminator() {
        assert_eq!(BlockId::rdd(9, 0).dataset(), Some(9));
        assert_eq!(BlockId::broadcast(9).dataset(), None);
        assert!(BlockId::rdd(1, 1).is_rdd());
        assert!(!BlockId::shuffle(1, 0, 0).is_rdd());
    }

    #[test]
    fn test_storage_level_flags() {
        assert!(StorageLevel::MEMORY_ONLY.is_valid());
        assert!(StorageLevel::MEMORY_ONLY.deserialized);
        assert!(!StorageLevel::MEMORY_ONLY_SER.deserialized);
        assert!(!StorageLevel::NONE.is_valid());
        assert_eq!(StorageLevel::MEMORY_ONLY.memory_mode(), MemoryMode::OnHeap);
        let invalid = StorageLevel {
            replication: 0,
            ..StorageLevel::MEMORY_ONLY
        };
        assert!(!invalid.is_valid());
    }

    #[test]
    fn test_block_status_cached() {
        let mut status = BlockStatus::empty();
        assert!(!status.is_cached());
        status.mem_bytes = 100;
        assert!(status.is_cached());
    }
}
