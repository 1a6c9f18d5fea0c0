// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Ambient, in-process counters for the cache. Not the product's excluded
//! external metrics/tracing sinks (spec.md §1) — just the same kind of
//! atomic bookkeeping the teacher's `BlobcacheMetrics` does
//! (`self.metrics.total.inc()`, `self.metrics.partial_hits.inc()` in
//! `cache/filecache/cache_entry.rs`), scoped to this crate's own read path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking cache behavior over the life of a `CacheHandler`.
#[derive(Default)]
pub struct CacheMetrics {
    reads_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fallbacks: AtomicU64,
    evictions: AtomicU64,
    bytes_downloaded: AtomicU64,
    download_failures: AtomicU64,
    checksum_mismatches: AtomicU64,
}

/// Point-in-time snapshot of `CacheMetrics`, safe to log or serialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheMetricsSnapshot {
    pub reads_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fallbacks: u64,
    pub evictions: u64,
    pub bytes_downloaded: u64,
    pub download_failures: u64,
    pub checksum_mismatches: u64,
}

impl CacheMetrics {
    /// Create a fresh, zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_reads_total(&self) {
        self.reads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fallbacks(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_download_failures(&self) {
        self.download_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_checksum_mismatches(&self) {
        self.checksum_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of all counters for logging.
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            reads_total: self.reads_total.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            download_failures: self.download_failures.load(Ordering::Relaxed),
            checksum_mismatches: self.checksum_mismatches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let m = CacheMetrics::new();
        m.inc_reads_total();
        m.inc_reads_total();
        m.inc_cache_hits();
        m.add_bytes_downloaded(4096);
        m.inc_evictions(3);

        let snap = m.snapshot();
        assert_eq!(snap.reads_total, 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.bytes_downloaded, 4096);
        assert_eq!(snap.evictions, 3);
    }
}
