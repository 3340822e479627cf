//! Loading the application's reference profiles from disk.
//!
//! Three optional plain-text files sit next to the master, named after the
//! application (spaces stripped):
//!
//! - `<App>.txt`: one `DATASET:REFCOUNT` per line.
//! - `<App>-JobDAG.txt`: one `JOB-DATASET:REF[;DATASET:REF]*` per line; the
//!   part after `-` may be empty.
//! - `<App>-Peers.txt`: one `DATASET:DATASET` pair per line, registered in
//!   both directions.
//!
//! A missing file is not an error; the cache degrades to one reference per
//! block.

use crate::block::{DatasetId, JobId};
use embers_common::normalized_app_name;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// The profile triple served to workers at registration.
#[derive(Debug, Clone, Default)]
pub struct AppProfiles {
    pub ref_profile: HashMap<DatasetId, i64>,
    pub ref_profile_by_job: HashMap<JobId, HashMap<DatasetId, i64>>,
    pub peer_profile: HashMap<DatasetId, DatasetId>,
}

pub fn load_profiles(dir: &Path, app_name: &str) -> AppProfiles {
    let base = normalized_app_name(app_name);
    AppProfiles {
        ref_profile: load_ref_profile(&dir.join(format!("{base}.txt"))),
        ref_profile_by_job: load_job_profile(&dir.join(format!("{base}-JobDAG.txt"))),
        peer_profile: load_peer_profile(&dir.join(format!("{base}-Peers.txt"))),
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            debug!("no profile at {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn parse_ref_entry(entry: &str) -> Option<(DatasetId, i64)> {
    let (dataset, refs) = entry.split_once(':')?;
    Some((dataset.parse().ok()?, refs.parse().ok()?))
}

fn load_ref_profile(path: &Path) -> HashMap<DatasetId, i64> {
    let mut profile = HashMap::new();
    for line in read_lines(path) {
        match parse_ref_entry(&line) {
            Some((dataset, refs)) => {
                profile.insert(dataset, refs);
            }
            None => warn!("skipping malformed profile line {:?}", line),
        }
    }
    profile
}

fn load_job_profile(path: &Path) -> HashMap<JobId, HashMap<DatasetId, i64>> {
    let mut by_job = HashMap::new();
    for line in read_lines(path) {
        let Some((job, rest)) = line.split_once('-') else {
            warn!("skipping malformed job line {:?}", line);
            continue;
        };
        let Ok(job) = job.parse::<JobId>() else {
            warn!("skipping job line with bad id {:?}", line);
            continue;
        };
        let mut refs = HashMap::new();
        // The reference list may legitimately be empty.
        for entry in rest.split(';').filter(|e| !e.is_empty()) {
            match parse_ref_entry(entry) {
                Some((dataset, r)) => {
                    refs.insert(dataset, r);
                }
                None => warn!("skipping malformed entry {:?} for job {}", entry, job),
            }
        }
        by_job.insert(job, refs);
    }
    by_job
}

fn load_peer_profile(path: &Path) -> HashMap<DatasetId, DatasetId> {
    let mut peers = HashMap::new();
    for line in read_lines(path) {
        let pair = line
            .split_once(':')
            .and_then(|(a, b)| Some((a.parse::<DatasetId>().ok()?, b.parse::<DatasetId>().ok()?)));
        match pair {
            Some((a, b)) => {
                peers.insert(a, b);
                peers.insert(b, a);
            }
            None => warn!("skipping malformed peer line {:?}", line),
        }
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_missing_files_yield_empty_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = load_profiles(dir.path(), "No Such App");
        assert!(profiles.ref_profile.is_empty());
        assert!(profiles.ref_profile_by_job.is_empty());
        assert!(profiles.peer_profile.is_empty());
    }

    #[test]
    fn test_ref_profile_parsing() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "PageRank.txt", "1:2\n2:4\nnot a line\n");
        let profiles = load_profiles(dir.path(), "Page Rank");
        assert_eq!(profiles.ref_profile.get(&1), Some(&2));
        assert_eq!(profiles.ref_profile.get(&2), Some(&4));
        assert_eq!(profiles.ref_profile.len(), 2);
    }

    #[test]
    fn test_job_profile_parsing_allows_empty_tail() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "App-JobDAG.txt",
            "0-1:3;2:1\n1-\n2-7:2\n",
        );
        let profiles = load_profiles(dir.path(), "App");
        assert_eq!(profiles.ref_profile_by_job[&0][&1], 3);
        assert_eq!(profiles.ref_profile_by_job[&0][&2], 1);
        assert!(profiles.ref_profile_by_job[&1].is_empty());
        assert_eq!(profiles.ref_profile_by_job[&2][&7], 2);
    }

    #[test]
    fn test_peer_profile_registers_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "App-Peers.txt", "1:2\n");
        let profiles = load_profiles(dir.path(), "App");
        assert_eq!(profiles.peer_profile.get(&1), Some(&2));
        assert_eq!(profiles.peer_profile.get(&2), Some(&1));
    }
}
