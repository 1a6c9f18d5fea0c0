// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Disk-utilisation calculator (C7): admission accounting in on-disk bytes
//! rather than logical bytes, for callers whose LRU budget is expressed that
//! way. Optional sidecar; spec.md §4.7.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::file_info::FileInfo;

/// Tracks on-disk byte usage of the cache directory via an incremental
/// counter (`files_size`, kept current by the handler's insert/evict calls)
/// and a periodic authoritative rescan (`scanned_size`).
pub struct DiskUtilCalculator {
    cache_dir: PathBuf,
    block_size: u64,
    scan_frequency: std::time::Duration,
    /// When `true`, the periodic scan walks every file and is authoritative;
    /// `files_size` is then informational only. When `false`, the scan
    /// counts only directory-entry bytes and `files_size` supplies the file
    /// contribution (spec.md §4.7).
    include_files: bool,
    files_size: AtomicI64,
    scanned_size: AtomicI64,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiskUtilCalculator {
    /// Construct a calculator for `config.cache_dir`, not yet ticking.
    pub fn new(config: &CacheConfig, include_files: bool) -> Self {
        DiskUtilCalculator {
            cache_dir: PathBuf::from(&config.cache_dir),
            block_size: config.volume_block_size.max(1),
            scan_frequency: std::time::Duration::from_secs(config.scan_frequency_seconds.max(1)),
            include_files,
            files_size: AtomicI64::new(0),
            scanned_size: AtomicI64::new(0),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Speculative on-disk size of `entry`: sparse entries use their
    /// downloaded-bytes total, non-sparse entries their full declared size;
    /// either way rounded up to the filesystem block size.
    pub fn size_of(&self, entry: &FileInfo) -> u64 {
        let raw = entry.size();
        ((raw + self.block_size - 1) / self.block_size) * self.block_size
    }

    /// Account for a newly-admitted entry.
    pub fn insert_entry(&self, entry: &FileInfo) {
        self.add_delta(self.size_of(entry) as i64);
    }

    /// Account for an evicted or invalidated entry.
    pub fn evict_entry(&self, entry: &FileInfo) {
        self.add_delta(-(self.size_of(entry) as i64));
    }

    /// Apply a signed delta to the incremental counter, saturating at zero.
    pub fn add_delta(&self, delta: i64) {
        self.files_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some((cur + delta).max(0))
            })
            .ok();
    }

    /// Best current estimate of total cache bytes on disk.
    pub fn total_bytes(&self) -> u64 {
        if self.include_files {
            self.scanned_size.load(Ordering::Acquire).max(0) as u64
        } else {
            let dir_bytes = self.scanned_size.load(Ordering::Acquire).max(0) as u64;
            let files_bytes = self.files_size.load(Ordering::Acquire).max(0) as u64;
            dir_bytes + files_bytes
        }
    }

    /// Spawn the periodic rescan ticker on `runtime`. Calling this more than
    /// once replaces the previous ticker (the old one is left to exit on its
    /// own cancellation check); callers should `stop()` first if that
    /// matters.
    pub fn start(self: &std::sync::Arc<Self>, runtime: &tokio::runtime::Runtime) {
        let this = self.clone();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(this.scan_frequency);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => this.rescan(),
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the background ticker and wait for it to exit.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Walk the cache directory and recompute `scanned_size`. When
    /// `include_files` is set the walk sums regular-file sizes and is
    /// authoritative; otherwise it sums only directory-entry metadata bytes,
    /// leaving file contributions to the incremental counter.
    fn rescan(&self) {
        let total = Self::walk(&self.cache_dir, self.include_files).unwrap_or(0);
        self.scanned_size.store(total as i64, Ordering::Release);
    }

    fn walk(dir: &std::path::Path, include_files: bool) -> std::io::Result<u64> {
        let mut total = 0u64;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                total += meta.len();
                total += Self::walk(&entry.path(), include_files)?;
            } else if include_files {
                total += meta.len();
            }
        }
        Ok(total)
    }
}
