//! Message payloads exchanged between the master and workers.
//!
//! Transport is somebody else's problem: these are typed payloads plus the
//! binary form of the block-info update, which crosses process boundaries
//! most often.

use crate::block::{BlockId, BlockManagerId, DatasetId, JobId, StorageLevel};
use crate::store::DagInfo;
use async_trait::async_trait;
use embers_common::{EmbersError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Messages a worker accepts from the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerMessage {
    RemoveBlock {
        block: BlockId,
    },
    RemoveRdd {
        rdd_id: DatasetId,
    },
    RemoveShuffle {
        shuffle_id: u64,
    },
    RemoveBroadcast {
        broadcast_id: u64,
        from_driver: bool,
    },
    BroadcastJobDag {
        job: JobId,
        refs: Option<HashMap<DatasetId, i64>>,
    },
    BroadcastDagInfo {
        job: JobId,
        dag: Option<DagInfo>,
        access_number_global: u64,
    },
    CheckPeersStrictly {
        block: BlockId,
        event: Uuid,
    },
    CheckPeersConservatively {
        block: BlockId,
        event: Uuid,
    },
    TriggerThreadDump,
}

/// What a worker answers to an ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerReply {
    Count(u64),
    Flag(bool),
    Unit,
}

impl WorkerReply {
    pub fn count(&self) -> u64 {
        match self {
            WorkerReply::Count(n) => *n,
            WorkerReply::Flag(true) => 1,
            _ => 0,
        }
    }
}

/// A worker the master can reach. The master fans broadcasts and removals
/// out through this capability; implementations own the actual transport.
#[async_trait]
pub trait WorkerEndpoint: Send + Sync {
    async fn ask(&self, msg: WorkerMessage) -> Result<WorkerReply>;
}

/// Block-info update in its binary form: block-manager id, block name,
/// storage level, then memory and disk sizes as big-endian i64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBlockInfoPayload {
    pub worker: BlockManagerId,
    pub block: BlockId,
    pub level: StorageLevel,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
}

impl UpdateBlockInfoPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_utf(&mut out, &self.worker.executor_id);
        write_utf(&mut out, &self.worker.host);
        out.extend_from_slice(&(self.worker.port as i32).to_be_bytes());
        write_utf(&mut out, &self.block.to_string());
        out.push(level_flags(&self.level));
        out.extend_from_slice(&self.level.replication.to_be_bytes());
        out.extend_from_slice(&(self.mem_bytes as i64).to_be_bytes());
        out.extend_from_slice(&(self.disk_bytes as i64).to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let executor_id = cursor.read_utf()?;
        let host = cursor.read_utf()?;
        let port = cursor.read_i32()?;
        let name = cursor.read_utf()?;
        let block: BlockId = name.parse()?;
        let flags = cursor.read_u8()?;
        let replication = cursor.read_u16()?;
        let mem_bytes = cursor.read_i64()?;
        let disk_bytes = cursor.read_i64()?;
        Ok(Self {
            worker: BlockManagerId::new(executor_id, host, port as u16),
            block,
            level: level_from_flags(flags, replication),
            mem_bytes: mem_bytes.max(0) as u64,
            disk_bytes: disk_bytes.max(0) as u64,
        })
    }
}

fn level_flags(level: &StorageLevel) -> u8 {
    let mut flags = 0u8;
    if level.use_disk {
        flags |= 1;
    }
    if level.use_memory {
        flags |= 2;
    }
    if level.use_off_heap {
        flags |= 4;
    }
    if level.deserialized {
        flags |= 8;
    }
    flags
}

fn level_from_flags(flags: u8, replication: u16) -> StorageLevel {
    StorageLevel {
        use_disk: flags & 1 != 0,
        use_memory: flags & 2 != 0,
        use_off_heap: flags & 4 != 0,
        deserialized: flags & 8 != 0,
        replication,
    }
}

/// Length-prefixed UTF-8 string, two-byte big-endian length.
fn write_utf(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    debug_assert!(bytes.len() <= u16::MAX as usize);
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(EmbersError::protocol("truncated block-info payload"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_utf(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| EmbersError::protocol("non-UTF8 string in block-info payload"))
    }
}
