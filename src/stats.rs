use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Default)]
pub struct Stats {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub blocked: AtomicU64,
    pub tunnels: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_stores: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total: u64,
    pub active: u64,
    pub blocked: u64,
    pub tunnels: u64,
    pub cache_hits: u64,
    pub cache_stores: u64,
    pub failed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn connection_start(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_end(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            tunnels: self.tunnels.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_stores: self.cache_stores.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    pub fn print(&self) {
        let s = self.snapshot();
        info!(
            "stats: total={} active={} blocked={} tunnels={} cache_hits={} cache_stores={} failed={} in={}KB out={}KB",
            s.total,
            s.active,
            s.blocked,
            s.tunnels,
            s.cache_hits,
            s.cache_stores,
            s.failed,
            s.bytes_in / 1_000,
            s.bytes_out / 1_000,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_initialization() {
        let stats = Stats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_connection_tracking() {
        let stats = Stats::new();
        stats.connection_start();
        stats.connection_start();
        stats.connection_end();
        Stats::add(&stats.bytes_in, 10);

        let s = stats.snapshot();
        assert_eq!(s.total, 2);
        assert_eq!(s.active, 1);
        assert_eq!(s.bytes_in, 10);
    }
}
