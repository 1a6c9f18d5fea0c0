// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Cache configuration. Parsing the on-disk config file is an external
//! collaborator's job (spec.md §1); this module only owns the
//! `Deserialize`-able shape and its defaults, the role the teacher's
//! `nydus_api::CacheConfigV2` plays for `FsCacheMgr::new`.

use serde::Deserialize;

/// The §6 "Configuration (enumerated)" fields of spec.md, collected into one
/// value so the cache handler can be constructed from a single config
/// rather than a long argument list.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Chunk size for the `ByteRangeMap` and, by construction, for download
    /// chunking (spec.md §9: these must be kept equal).
    pub chunk_size_mb: u64,

    /// Global byte budget enforced by the LRU index.
    pub max_lru_size_bytes: u64,

    /// Window size served by one remote reader in sequential mode.
    pub sequential_read_size_mb: u64,

    /// Whether a job may fan out across multiple concurrent workers.
    pub enable_parallel_downloads: bool,

    /// Worker count per job when parallel downloads are enabled.
    pub parallel_downloads_per_file: usize,

    /// Global cap on parallel-download concurrency across all jobs.
    pub max_parallel_downloads: usize,

    /// Width of one parallel-mode download range.
    pub download_chunk_size_mb: u64,

    /// Buffer size used for buffered (non-`O_DIRECT`) writes.
    pub write_buffer_size: usize,

    /// Whether to attempt `O_DIRECT` for parallel downloads.
    pub enable_o_direct: bool,

    /// Whether to verify CRC32C after a successful download.
    pub enable_crc: bool,

    /// Root directory backing the on-disk cache layout.
    pub cache_dir: String,

    /// Permission bits for created cache files.
    pub file_perm: u32,

    /// Permission bits for created cache directories.
    pub dir_perm: u32,

    /// Interval between disk-utilisation rescans.
    pub scan_frequency_seconds: u64,

    /// Filesystem block size used to round up on-disk size estimates.
    pub volume_block_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            chunk_size_mb: 1,
            max_lru_size_bytes: 20 << 30, // 20 GiB
            sequential_read_size_mb: 16,
            enable_parallel_downloads: false,
            parallel_downloads_per_file: 4,
            max_parallel_downloads: 32,
            download_chunk_size_mb: 8,
            write_buffer_size: 1 << 20,
            enable_o_direct: false,
            enable_crc: false,
            cache_dir: String::from("/var/cache/blobcache"),
            file_perm: 0o600,
            dir_perm: 0o700,
            scan_frequency_seconds: 30,
            volume_block_size: 4096,
        }
    }
}

impl CacheConfig {
    /// Parse a `CacheConfig` from a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Parse a `CacheConfig` from a JSON document.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Chunk size in bytes, equal for the `ByteRangeMap` and the download
    /// job (spec.md §9 "Chunk-size coupling").
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * (1 << 20)
    }

    /// Sequential window size in bytes.
    pub fn sequential_read_size_bytes(&self) -> u64 {
        self.sequential_read_size_mb * (1 << 20)
    }

    /// Parallel-mode download chunk size in bytes.
    pub fn download_chunk_size_bytes(&self) -> u64 {
        self.download_chunk_size_mb * (1 << 20)
    }
}
