use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;
const BUFFER_SIZE: usize = 64 * 1024;

/// Set of hostnames whose requests are rejected before any origin contact.
///
/// Matching is exact string equality: no wildcards, no subdomain matching and
/// no case folding.
#[derive(Default)]
pub struct Blocklist {
    hosts: RwLock<HashSet<String>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `host`. Returns `false` if it was already present.
    pub fn add(&self, host: impl Into<String>) -> bool {
        self.hosts.write().insert(host.into())
    }

    pub fn contains(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        self.hosts.read().contains(host)
    }

    /// Sorted snapshot of the current members.
    pub fn list(&self) -> BTreeSet<String> {
        self.hosts.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    /// Add every host listed in `path`, one per line. Blank lines and lines
    /// starting with `#` are skipped. Returns the number of hosts added.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for blocklist file: {:?}", path))?;

        if metadata.len() > MAX_FILE_SIZE {
            anyhow::bail!("blocklist file too large: {:?}", path);
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open blocklist file: {:?}", path))?;
        let reader = BufReader::with_capacity(BUFFER_SIZE, file);

        let mut parsed = Vec::new();
        let mut raw_count = 0;
        for line in reader.lines() {
            let line = line.with_context(|| format!("Failed to read blocklist file: {:?}", path))?;
            raw_count += 1;
            if let Some(host) = parse_host_line(&line) {
                parsed.push(host.to_string());
            }
        }

        let added = {
            let mut hosts = self.hosts.write();
            parsed.into_iter().filter(|h| hosts.insert(h.clone())).count()
        };

        tracing::info!(
            "Loaded blocklist: {} new hosts from {} lines ({:?})",
            added,
            raw_count,
            path
        );

        Ok(added)
    }
}

fn parse_host_line(line: &str) -> Option<&str> {
    let host = line.trim();
    if host.is_empty() || host.starts_with('#') {
        return None;
    }
    host.split_whitespace().next()
}
