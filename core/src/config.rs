//! Configuration for the cache engine and the master directory.

use std::path::PathBuf;
use std::time::Duration;

/// Which victim-selection policy the eviction planner runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Classic recency ordering: least-recently-accessed blocks go first.
    #[default]
    Lru,
    /// Reference-count ordering: blocks with the fewest remaining references
    /// go first, and only when the incoming block is referenced more.
    Lrc,
    /// Reuse-interval leases: unleased datasets first, then ascending
    /// remaining lease.
    Leasing,
}

/// How a worker reacts to a peer-eviction broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerMode {
    /// Decrement only the evicted block and its counterpart partition.
    #[default]
    Conservative,
    /// Decrement the whole pair of datasets.
    Strict,
}

/// Worker-side cache engine configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Bytes available for on-heap storage plus unroll.
    pub max_on_heap_memory: u64,
    /// Bytes available for off-heap storage plus unroll.
    pub max_off_heap_memory: u64,
    /// Eviction policy for this worker.
    pub eviction_policy: EvictionPolicy,
    /// Peer-eviction reaction mode for this worker.
    pub peer_mode: PeerMode,
    /// First unroll reservation made before any element is materialized.
    pub unroll_initial_bytes: u64,
    /// Re-estimate unrolled size every this many elements.
    pub unroll_check_period: usize,
    /// Requested headroom factor when growing an unroll reservation.
    pub unroll_growth_factor: f64,
    /// Chunk granularity of serialized in-memory buffers.
    pub serialize_chunk_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_on_heap_memory: 512 * 1024 * 1024,
            max_off_heap_memory: 0,
            eviction_policy: EvictionPolicy::Lru,
            peer_mode: PeerMode::Conservative,
            unroll_initial_bytes: 1024 * 1024,
            unroll_check_period: 16,
            unroll_growth_factor: 1.5,
            serialize_chunk_bytes: 1024 * 1024,
        }
    }
}

/// Master directory configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Application name; spaces are stripped when deriving profile file names.
    pub app_name: String,
    /// Directory holding the profile files and the telemetry output.
    pub profile_dir: PathBuf,
    /// Timeout applied to every outbound worker ask.
    pub ask_timeout: Duration,
    /// How many times a timed-out ask is retried before surfacing the error.
    pub ask_retries: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            app_name: "embers".to_string(),
            profile_dir: PathBuf::from("."),
            ask_timeout: Duration::from_secs(30),
            ask_retries: 3,
        }
    }
}
