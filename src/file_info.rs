// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! `FileInfo`: the LRU's payload type, tracking one cached object's download
//! progress. Spec.md §3 "FileInfo".

use std::sync::Arc;

use crate::key::ObjectKey;
use crate::range_map::ByteRangeMap;

/// Sentinel value of `offset` in sparse mode; `downloaded_ranges` is
/// authoritative instead. Spec.md §3.
pub const SPARSE_OFFSET_SENTINEL: u64 = u64::MAX;

/// Metadata tracked per cached object: identity, generation, and download
/// progress.
#[derive(Clone)]
pub struct FileInfo {
    key: ObjectKey,
    generation: i64,
    file_size: u64,
    /// Prefix length downloaded contiguously from byte 0, in non-sparse
    /// mode. `SPARSE_OFFSET_SENTINEL` in sparse mode.
    offset: u64,
    downloaded_ranges: Option<Arc<ByteRangeMap>>,
}

impl FileInfo {
    /// Construct a fresh, non-sparse `FileInfo` with no bytes downloaded.
    pub fn new(key: ObjectKey, generation: i64, file_size: u64) -> Self {
        FileInfo {
            key,
            generation,
            file_size,
            offset: 0,
            downloaded_ranges: None,
        }
    }

    /// Construct a fresh sparse `FileInfo`, backed by a `ByteRangeMap` of the
    /// given chunk size.
    pub fn new_sparse(key: ObjectKey, generation: i64, file_size: u64, chunk_size: u64) -> Self {
        FileInfo {
            key,
            generation,
            file_size,
            offset: SPARSE_OFFSET_SENTINEL,
            downloaded_ranges: Some(Arc::new(ByteRangeMap::new(file_size, chunk_size))),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn sparse(&self) -> bool {
        self.downloaded_ranges.is_some()
    }

    pub fn downloaded_ranges(&self) -> Option<&Arc<ByteRangeMap>> {
        self.downloaded_ranges.as_ref()
    }

    /// Prefix offset in non-sparse mode. In sparse mode, returns the
    /// sentinel; callers that care about sparse progress should use
    /// `size()`/`downloaded_ranges()` instead.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Set the contiguous prefix offset (non-sparse mode only).
    ///
    /// Invariant: `0 <= offset <= file_size`.
    pub fn set_offset(&mut self, offset: u64) {
        debug_assert!(!self.sparse(), "set_offset used on a sparse FileInfo");
        debug_assert!(offset <= self.file_size);
        self.offset = offset.min(self.file_size);
    }

    /// Logical size of the cached content so far: `file_size` in non-sparse
    /// mode, or the sum of present chunk bytes in sparse mode.
    pub fn size(&self) -> u64 {
        match &self.downloaded_ranges {
            Some(ranges) => ranges.total_bytes(),
            None => self.file_size,
        }
    }

    /// Whether `[0, required)` is present on disk: `offset >= required` in
    /// non-sparse mode, or every chunk covering that prefix in sparse mode.
    /// Used to re-validate an entry against a read's required byte range
    /// (spec.md §4.6).
    pub fn has_downloaded_prefix(&self, required: u64) -> bool {
        match &self.downloaded_ranges {
            Some(ranges) => ranges.contains_range(0, required),
            None => self.offset >= required,
        }
    }

    /// Whether the object is fully downloaded: sparse-mode completion is
    /// fixed as "every chunk covered" (spec.md §9, Open Question (a)), never
    /// an `offset` comparison.
    pub fn is_complete(&self) -> bool {
        match &self.downloaded_ranges {
            Some(ranges) => ranges.is_complete(),
            None => self.offset >= self.file_size,
        }
    }
}
