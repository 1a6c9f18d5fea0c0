// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Chunk-granular presence tracking over `[0, file_size)`. See spec.md §4.1.

use std::collections::BTreeSet;
use std::sync::RwLock;

/// Default chunk size used when a caller doesn't care to match it to the
/// download chunk size explicitly. Spec.md §4.1: "default 1 MiB, configurable
/// to match the download chunk size".
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;

struct State {
    present: BTreeSet<u64>,
    total_bytes: u64,
}

/// Tracks which chunk-aligned ranges of a sparse file of known size are
/// present on disk.
///
/// All mutation and inspection goes through a single `RwLock`, mirroring the
/// single-lock-per-structure discipline the teacher applies to its own
/// shared caches (`FsCacheMgr::blobs: Arc<RwLock<HashMap<...>>>`).
pub struct ByteRangeMap {
    chunk_size: u64,
    file_size: u64,
    state: RwLock<State>,
}

impl ByteRangeMap {
    /// Create a map for a file of `file_size` bytes, tracked in units of
    /// `chunk_size` bytes. `chunk_size` must be non-zero.
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        assert!(chunk_size > 0, "chunk_size must be non-zero");
        ByteRangeMap {
            chunk_size,
            file_size,
            state: RwLock::new(State {
                present: BTreeSet::new(),
                total_bytes: 0,
            }),
        }
    }

    /// Create a map using [`DEFAULT_CHUNK_SIZE`].
    pub fn with_default_chunk_size(file_size: u64) -> Self {
        Self::new(file_size, DEFAULT_CHUNK_SIZE)
    }

    /// Configured chunk size.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Size of the file this map describes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    fn chunk_id_of(&self, offset: u64) -> u64 {
        offset / self.chunk_size
    }

    /// True byte width of chunk `id`; the last chunk may be short.
    pub fn chunk_size_of(&self, id: u64) -> u64 {
        let start = id * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        end.saturating_sub(start)
    }

    fn last_chunk_id(&self) -> u64 {
        if self.file_size == 0 {
            0
        } else {
            (self.file_size - 1) / self.chunk_size
        }
    }

    fn covering_chunk_ids(&self, start: u64, end: u64) -> impl Iterator<Item = u64> {
        let (first, last) = if start >= end {
            (1, 0) // empty range -> empty RangeInclusive
        } else {
            let last_inclusive_byte = end - 1;
            (
                self.chunk_id_of(start),
                self.chunk_id_of(last_inclusive_byte.min(self.file_size.saturating_sub(1))),
            )
        };
        first..=last
    }

    /// Mark every chunk overlapping `[start, end)` as present. Returns the
    /// number of newly-added bytes (accounting for a possibly short last
    /// chunk), i.e. the delta to `total_bytes()`.
    ///
    /// No-op (returns 0) for an empty range (`start >= end`).
    pub fn add_range(&self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        let mut state = self.state.write().unwrap();
        let mut added = 0u64;
        for id in self.covering_chunk_ids(start, end) {
            if state.present.insert(id) {
                added += self.chunk_size_of(id);
            }
        }
        state.total_bytes += added;
        added
    }

    /// True iff every chunk covering `[start, end)` is present. An empty
    /// range is trivially contained.
    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        let state = self.state.read().unwrap();
        self.covering_chunk_ids(start, end)
            .all(|id| state.present.contains(&id))
    }

    /// Ordered ids of chunks covering `[start, end)` that are not yet
    /// present. Empty iff `contains_range(start, end)`.
    pub fn missing_chunks(&self, start: u64, end: u64) -> Vec<u64> {
        let state = self.state.read().unwrap();
        self.covering_chunk_ids(start, end)
            .filter(|id| !state.present.contains(id))
            .collect()
    }

    /// Total bytes tracked as present. Equals the sum of `chunk_size_of(id)`
    /// over every chunk id added via `add_range`.
    pub fn total_bytes(&self) -> u64 {
        self.state.read().unwrap().total_bytes
    }

    /// Reset to empty.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap();
        state.present.clear();
        state.total_bytes = 0;
    }

    /// Merged, chunk-aligned `[start, end)` spans of present chunks, for
    /// debugging/inspection. Adjacent present chunks are coalesced into one
    /// span.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        let state = self.state.read().unwrap();
        let mut spans: Vec<(u64, u64)> = Vec::new();
        let mut prev_id: Option<u64> = None;
        for &id in state.present.iter() {
            let start = id * self.chunk_size;
            let end = start + self.chunk_size_of(id);
            match (prev_id, spans.last_mut()) {
                (Some(p), Some(last)) if p + 1 == id => {
                    last.1 = end;
                }
                _ => spans.push((start, end)),
            }
            prev_id = Some(id);
        }
        spans
    }

    /// Whether every chunk of the file is present — the sparse-mode
    /// definition of "fully downloaded" (spec.md §9, Open Question (a)).
    pub fn is_complete(&self) -> bool {
        let state = self.state.read().unwrap();
        state.present.len() as u64 == self.last_chunk_id() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_range_tracks_total_bytes_with_short_last_chunk() {
        let map = ByteRangeMap::new(25, 10); // chunks: [0,10) [10,20) [20,25)
        let added = map.add_range(0, 12);
        assert_eq!(added, 20); // chunk 0 (10 bytes) + chunk 1 (10 bytes)
        assert_eq!(map.total_bytes(), 20);

        let added2 = map.add_range(18, 25);
        assert_eq!(added2, 5); // chunk 1 already present, chunk 2 is short (5 bytes)
        assert_eq!(map.total_bytes(), 25);
    }

    #[test]
    fn add_range_returns_zero_on_overlap() {
        let map = ByteRangeMap::new(100, 10);
        map.add_range(0, 10);
        assert_eq!(map.add_range(0, 10), 0);
        assert_eq!(map.add_range(5, 8), 0);
    }

    #[test]
    fn contains_range_round_trips_with_add_range() {
        let map = ByteRangeMap::new(100, 10);
        assert!(map.contains_range(5, 5)); // empty range trivially contained
        assert!(!map.contains_range(0, 10));
        map.add_range(0, 30);
        assert!(map.contains_range(0, 30));
        assert!(map.contains_range(5, 25));
        assert!(!map.contains_range(0, 40));
    }

    #[test]
    fn missing_chunks_empty_iff_contains_range() {
        let map = ByteRangeMap::new(100, 10);
        assert_eq!(map.missing_chunks(0, 30), vec![0, 1, 2]);
        map.add_range(0, 20);
        assert_eq!(map.missing_chunks(0, 30), vec![2]);
        map.add_range(20, 30);
        assert!(map.missing_chunks(0, 30).is_empty());
        assert!(map.contains_range(0, 30));
    }

    #[test]
    fn clear_resets_state() {
        let map = ByteRangeMap::new(100, 10);
        map.add_range(0, 50);
        assert_eq!(map.total_bytes(), 50);
        map.clear();
        assert_eq!(map.total_bytes(), 0);
        assert!(map.missing_chunks(0, 50).len() > 0);
    }

    #[test]
    fn ranges_merges_adjacent_chunks() {
        let map = ByteRangeMap::new(100, 10);
        map.add_range(0, 20);
        map.add_range(40, 50);
        let mut ranges = map.ranges();
        ranges.sort();
        assert_eq!(ranges, vec![(0, 20), (40, 50)]);
    }

    #[test]
    fn is_complete_requires_every_chunk() {
        let map = ByteRangeMap::new(25, 10);
        assert!(!map.is_complete());
        map.add_range(0, 20);
        assert!(!map.is_complete());
        map.add_range(20, 25);
        assert!(map.is_complete());
    }

    #[test]
    fn chunk_size_of_reports_short_last_chunk() {
        let map = ByteRangeMap::new(25, 10);
        assert_eq!(map.chunk_size_of(0), 10);
        assert_eq!(map.chunk_size_of(1), 10);
        assert_eq!(map.chunk_size_of(2), 5);
    }
}
