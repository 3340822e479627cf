//! Common error handling and utilities for the Embers project.

pub mod error;
pub mod utils;

pub use error::{EmbersError, Result};
pub use utils::{current_timestamp_millis, current_timestamp_secs, normalized_app_name};
