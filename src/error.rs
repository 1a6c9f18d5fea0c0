// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Crate-wide error type for the blob cache.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Opaque error kinds surfaced to callers of the cache.
///
/// Wording here is not a stable API: callers should match on variant, not on
/// the `Display` string.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The `CacheHandle`'s underlying file handle is gone; the handle was
    /// used after `close()` or construction failed.
    #[error("invalid file handle")]
    InvalidFileHandle,

    /// The download job backing a read is `Invalid` or `Failed`.
    #[error("invalid file download job")]
    InvalidFileDownloadJob,

    /// The index entry backing a completed (self-removed) job is missing or
    /// stale.
    #[error("invalid file info cache")]
    InvalidFileInfoCache,

    /// A positional read against the cache file returned fewer bytes than
    /// expected, other than a normal end-of-object short read.
    #[error("error reading from cache file handle: {0}")]
    ErrInReadingFileHandle(io::Error),

    /// The cache cannot serve this request promptly; the caller must read
    /// directly from the remote store.
    #[error("cache cannot serve the request, fall back to GCS")]
    FallbackToGCS,

    /// An index entry exists for this generation but the backing file is
    /// missing on disk: the index/file invariant was broken.
    #[error("file not present in cache")]
    FileNotPresentInCache,

    /// A random read against an object with no cache entry and
    /// `cache_for_range_read == false`; building a handle would only cost
    /// work for no benefit.
    #[error("cache handle not required for random read")]
    CacheHandleNotRequiredForRandomRead,

    /// A single entry's weight exceeds the LRU's `max_size`.
    #[error("entry too large for the cache (weight {weight}, max {max_size})")]
    EntryTooLarge {
        /// Weight computed for the rejected entry.
        weight: u64,
        /// The LRU's configured budget.
        max_size: u64,
    },

    /// `update_without_changing_order`/similar was called for a key absent
    /// from the index.
    #[error("entry does not exist")]
    EntryNotExist,

    /// `ObjectKey` was constructed with an empty bucket or object name.
    #[error("invalid key attributes: bucket and object name must be non-empty")]
    InvalidKeyAttributes,

    /// The requested read offset falls outside `[0, object_size)`.
    #[error("wrong offset requested: {offset} (object size {size})")]
    WrongOffset {
        /// Offset the caller asked to read from.
        offset: u64,
        /// Size of the object as known to the caller.
        size: u64,
    },

    /// A download was asked to wait for a watermark beyond the object's
    /// declared size.
    #[error("watermark {watermark} exceeds file size {file_size}")]
    WatermarkBeyondFileSize {
        /// Requested watermark.
        watermark: u64,
        /// Declared size of the object.
        file_size: u64,
    },

    /// A cached file failed its CRC32C integrity check after download.
    #[error("crc32c mismatch for cached object: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum declared by the remote object metadata.
        expected: u32,
        /// Checksum computed over the downloaded file.
        actual: u32,
    },

    /// A reader's context was cancelled while waiting on a download
    /// watermark; does not mutate job state.
    #[error("download wait cancelled")]
    Cancelled,

    /// Wrapper for filesystem/backend I/O failures that don't fit a more
    /// specific variant above.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Wrapper for failures reported by the remote object store.
    #[error("remote store error: {0}")]
    Remote(#[from] anyhow::Error),
}
