//! The master directory: location tracking, profile distribution, and the
//! single-threaded endpoint the workers talk to.

pub mod directory;
pub mod endpoint;
pub mod profile;
pub mod telemetry;

pub use directory::{ask_with_retry, MasterDirectory, StorageStatus, WorkerInfo};
pub use endpoint::MasterHandle;
pub use profile::{load_profiles, AppProfiles};
pub use telemetry::{write_result, MasterMetrics};
