//! Deduplicated record of processed request lines.
//!
//! Records are kept with set semantics: an exact duplicate line is stored
//! once. Export order is first-insertion order, so two runs that see the
//! same traffic produce identical reports.

use crate::error::{ProxyError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;

#[derive(Default)]
struct Records {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

#[derive(Default)]
pub struct RequestLog {
    records: Mutex<Records>,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `line` unless an identical record exists. Returns whether it was new.
    pub fn record(&self, line: impl Into<String>) -> bool {
        let line = line.into();
        let mut records = self.records.lock();
        if records.seen.contains(&line) {
            return false;
        }
        records.seen.insert(line.clone());
        records.ordered.push(line);
        true
    }

    pub fn export(&self) -> Vec<String> {
        self.records.lock().ordered.clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every record to `path`, one per line, replacing the file.
    pub async fn write_report(&self, path: &Path) -> Result<usize> {
        let lines = self.export();
        let mut contents = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in &lines {
            contents.push_str(line);
            contents.push('\n');
        }

        tokio::fs::write(path, contents)
            .await
            .map_err(|source| ProxyError::Report {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(lines.len())
    }
}
