//! Small utilities shared across Embers crates.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in seconds.
pub fn current_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Application name with whitespace stripped, as used for profile file names.
pub fn normalized_app_name(app_name: &str) -> String {
    app_name.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_monotone() {
        let a = current_timestamp_millis();
        let b = current_timestamp_millis();
        assert!(b >= a);
        assert!(current_timestamp_secs() > 0);
    }

    #[test]
    fn test_normalized_app_name() {
        assert_eq!(normalized_app_name("Page Rank"), "PageRank");
        assert_eq!(normalized_app_name("wordcount"), "wordcount");
        assert_eq!(normalized_app_name("a b\tc"), "abc");
    }
}
