// Pipeline counters
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Serializable view of [`PipelineStats`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: f64,
    pub requests_total: u64,
    pub generations_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate_percent: f64,
    pub remote_downloads: u64,
    pub remote_uploads: u64,
    pub rate_limited: u64,
    pub short_circuited: u64,
    pub errors_total: u64,
    pub requests_per_minute: f64,
}

/// Lock-free counters shared by foreground callers and the worker
pub struct PipelineStats {
    start_time: Instant,
    requests: AtomicU64,
    generations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    remote_downloads: AtomicU64,
    remote_uploads: AtomicU64,
    rate_limited: AtomicU64,
    short_circuited: AtomicU64,
    errors: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            remote_downloads: AtomicU64::new(0),
            remote_uploads: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generation(&self) {
        self.generations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_download(&self) {
        self.remote_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_upload(&self) {
        self.remote_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_short_circuit(&self) {
        self.short_circuited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime = self.start_time.elapsed().as_secs_f64();
        let requests = self.requests.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        StatsSnapshot {
            uptime_seconds: uptime,
            requests_total: requests,
            generations_total: self.generations.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate_percent: if lookups > 0 {
                hits as f64 / lookups as f64 * 100.0
            } else {
                0.0
            },
            remote_downloads: self.remote_downloads.load(Ordering::Relaxed),
            remote_uploads: self.remote_uploads.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            errors_total: self.errors.load(Ordering::Relaxed),
            requests_per_minute: if uptime > 0.0 {
                requests as f64 / uptime * 60.0
            } else {
                0.0
            },
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate() {
        let stats = PipelineStats::new();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_miss();
        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 3);
        assert!((snap.cache_hit_rate_percent - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_snapshot_has_zero_rate() {
        let snap = PipelineStats::new().snapshot();
        assert_eq!(snap.requests_total, 0);
        assert_eq!(snap.cache_hit_rate_percent, 0.0);
    }
}
