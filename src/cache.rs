//! In-memory response cache for conditional GET.
//!
//! Entries are keyed by the raw request URL string and carry the origin's
//! `Last-Modified` validator. There is no eviction, expiry or size bound:
//! an entry lives until it is overwritten or the process exits.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A cached origin body plus the validator it was served with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub body: Bytes,
    pub last_modified: String,
}

impl CacheEntry {
    pub fn new(body: impl Into<Bytes>, last_modified: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            last_modified: last_modified.into(),
        }
    }
}

#[derive(Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<CacheEntry> {
        self.entries.read().get(url).cloned()
    }

    /// Store `entry` under `url`, replacing any previous entry.
    pub fn put(&self, url: impl Into<String>, entry: CacheEntry) {
        self.entries.write().insert(url.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
