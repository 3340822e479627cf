//! Embers core
//!
//! The reference-aware distributed block cache: worker-side memory store
//! with LRU / LRC / leasing eviction, and the master directory that tracks
//! block locations and distributes reference profiles.

pub mod block;
pub mod config;
pub mod master;
pub mod messages;
pub mod store;
pub mod worker;

pub use block::*;
pub use config::*;
pub use master::*;
pub use messages::*;
pub use store::*;
pub use worker::*;
