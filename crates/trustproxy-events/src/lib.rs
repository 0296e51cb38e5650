//! Append-only JSONL log of classified outbound URLs observed by the
//! companion MITM proxy, consumed by the analyzer facade as the
//! "network log" artifact.
//!
//! # Example
//!
//! ```
//! use trustproxy_events::{NetworkLog, NetworkLogEntry};
//! use chrono::Utc;
//!
//! let mut log = NetworkLog::new();
//! log.record(NetworkLogEntry {
//!     timestamp: Utc::now(),
//!     url: "https://registry-1.docker.io/v2/library/alpine/manifests/3.19".to_string(),
//!     outcome: "pkg:docker/library/alpine@3.19".to_string(),
//! });
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NETWORK_LOG_FILE: &str = "network-log.jsonl";

pub fn network_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join(NETWORK_LOG_FILE)
}

/// One classified outbound request observed during a proxied build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkLogEntry {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    /// The classifier's outcome, already formatted (a pURL string, or
    /// `"skipped"` / `"unclassified"` / an error tag).
    pub outcome: String,
}

/// An in-memory, append-only network log. Call [`NetworkLog::write_to_file`]
/// to persist it; the proxy flushes periodically rather than per entry.
#[derive(Debug, Default)]
pub struct NetworkLog {
    entries: Vec<NetworkLogEntry>,
}

impl NetworkLog {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn record(&mut self, entry: NetworkLogEntry) {
        self.entries.push(entry);
    }

    /// Append all recorded entries to `path` in JSONL form.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create network log dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open network log {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for entry in &self.entries {
            let line = serde_json::to_string(entry).context("failed to serialize network log entry")?;
            writeln!(writer, "{line}").context("failed to write network log line")?;
        }
        writer.flush().context("failed to flush network log")?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open network log {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| format!("failed to read line from {}", path.display()))?;
            let entry: NetworkLogEntry = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse network log entry from line: {line}"))?;
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    pub fn entries_for_url(&self, url: &str) -> Vec<&NetworkLogEntry> {
        self.entries.iter().filter(|e| e.url == url).collect()
    }

    pub fn all_entries(&self) -> &[NetworkLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(url: &str, outcome: &str) -> NetworkLogEntry {
        NetworkLogEntry {
            timestamp: Utc::now(),
            url: url.to_string(),
            outcome: outcome.to_string(),
        }
    }

    #[test]
    fn round_trips_through_jsonl() {
        let dir = tempdir().unwrap();
        let path = network_log_path(dir.path());

        let mut log = NetworkLog::new();
        log.record(sample("https://registry-1.docker.io/v2/library/alpine/manifests/3.19", "pkg:docker/library/alpine@3.19"));
        log.record(sample("https://files.pythonhosted.org/packages/x/requests-2.31.0-py3-none-any.whl", "pkg:pypi/requests@2.31.0"));
        log.write_to_file(&path).unwrap();

        let reloaded = NetworkLog::read_from_file(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.all_entries()[1].outcome, "pkg:pypi/requests@2.31.0");
    }

    #[test]
    fn write_appends_rather_than_truncates() {
        let dir = tempdir().unwrap();
        let path = network_log_path(dir.path());

        let mut first = NetworkLog::new();
        first.record(sample("https://a", "skipped"));
        first.write_to_file(&path).unwrap();

        let mut second = NetworkLog::new();
        second.record(sample("https://b", "unclassified"));
        second.write_to_file(&path).unwrap();

        let combined = NetworkLog::read_from_file(&path).unwrap();
        assert_eq!(combined.len(), 2);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let path = network_log_path(dir.path());
        let log = NetworkLog::read_from_file(&path).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn filters_entries_by_url() {
        let mut log = NetworkLog::new();
        log.record(sample("https://a", "skipped"));
        log.record(sample("https://b", "unclassified"));
        log.record(sample("https://a", "pkg:generic/a@1"));
        assert_eq!(log.entries_for_url("https://a").len(), 2);
    }
}
