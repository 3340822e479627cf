//! Application-wide counters and the shutdown telemetry line.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Counters accumulated from worker reports. Owned by the master directory
/// and handed explicitly to the handlers that bump them.
#[derive(Debug, Default)]
pub struct MasterMetrics {
    pub rdd_hits: AtomicU64,
    pub rdd_misses: AtomicU64,
    pub disk_reads: AtomicU64,
    pub disk_writes: AtomicU64,
}

impl MasterMetrics {
    /// Fold one worker report in: hit, miss, disk read, disk write.
    pub fn accumulate(&self, counts: [u64; 4]) {
        self.rdd_hits.fetch_add(counts[0], Ordering::Relaxed);
        self.rdd_misses.fetch_add(counts[1], Ordering::Relaxed);
        self.disk_reads.fetch_add(counts[2], Ordering::Relaxed);
        self.disk_writes.fetch_add(counts[3], Ordering::Relaxed);
    }
}

/// Append the shutdown summary to `result.txt` in `dir`.
pub fn write_result(dir: &Path, app_name: &str, runtime_ms: u128, metrics: &MasterMetrics) {
    let path = dir.join("result.txt");
    let line = format!(
        "AppName: {}, Runtime: {}\nRDD Hit\t{}\tRDD Miss\t{}\n",
        app_name,
        runtime_ms,
        metrics.rdd_hits.load(Ordering::Relaxed),
        metrics.rdd_misses.load(Ordering::Relaxed),
    );
    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = written {
        warn!("could not append telemetry to {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_file_appends_two_lines() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = MasterMetrics::default();
        metrics.accumulate([10, 3, 1, 2]);
        metrics.accumulate([5, 0, 0, 0]);

        write_result(dir.path(), "WordCount", 1234, &metrics);
        let content = std::fs::read_to_string(dir.path().join("result.txt")).unwrap();
        assert_eq!(content, "AppName: WordCount, Runtime: 1234\nRDD Hit\t15\tRDD Miss\t3\n");

        // A second shutdown appends rather than truncates.
        write_result(dir.path(), "WordCount", 5678, &metrics);
        let content = std::fs::read_to_string(dir.path().join("result.txt")).unwrap();
        assert_eq!(content.lines().count(), 4);
    }
}
