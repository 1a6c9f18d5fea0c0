// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Cache handle (C6): the per-open read path. Spec.md §4.6.
//!
//! Not thread-safe by design (spec.md §9 "Handle is single-threaded") — each
//! FUSE-style open gets its own handle, so its mutable fields use plain
//! `Cell`/`RefCell` rather than atomics or a mutex.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bucket::MinObject;
use crate::error::{Error, Result};
use crate::handler::Index;
use crate::job::{Job, JobState, JobStatus, READ_CHUNK};
use crate::key::ObjectKey;
use crate::metrics::CacheMetrics;

/// Per-open read path bound to one cache file, one (possibly already
/// self-removed) download job, and the index that backs both.
pub struct CacheHandle {
    file: Option<File>,
    job: RefCell<Option<Arc<Job>>>,
    index: Arc<Index>,
    key: ObjectKey,
    cache_file_for_range_read: bool,
    is_sequential: Cell<bool>,
    prev_offset: Cell<u64>,
    metrics: Arc<CacheMetrics>,
}

impl CacheHandle {
    /// Construct a handle. `is_sequential` starts `true` iff `initial_offset
    /// == 0` (spec.md §4.6).
    pub fn new(
        file: File,
        job: Option<Arc<Job>>,
        index: Arc<Index>,
        key: ObjectKey,
        cache_file_for_range_read: bool,
        initial_offset: i64,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        CacheHandle {
            file: Some(file),
            job: RefCell::new(job),
            index,
            key,
            cache_file_for_range_read,
            is_sequential: Cell::new(initial_offset == 0),
            prev_offset: Cell::new(initial_offset.max(0) as u64),
            metrics,
        }
    }

    /// Read up to `dst.len()` bytes starting at `offset`, serving from the
    /// local cache file once the required prefix is present, waiting for the
    /// background job when the access pattern is sequential, or signalling
    /// fallback to the remote store otherwise. Returns `(n_read, cache_hit)`.
    pub async fn read(
        &self,
        reader_cancel: Option<CancellationToken>,
        obj: &MinObject,
        offset: u64,
        dst: &mut [u8],
    ) -> Result<(usize, bool)> {
        let file = self.file.as_ref().ok_or(Error::InvalidFileHandle)?;
        if offset >= obj.size {
            return Err(Error::WrongOffset {
                offset,
                size: obj.size,
            });
        }

        let prev = self.prev_offset.get();
        let sequential =
            self.is_sequential.get() && offset >= prev && offset <= prev.saturating_add(READ_CHUNK);
        self.is_sequential.set(sequential);
        let wait_for_download = sequential;

        let required = (offset + dst.len() as u64).min(obj.size);
        let job = self.job.borrow().clone();

        let cache_hit = match job {
            Some(job) => {
                if !sequential && !self.cache_file_for_range_read {
                    self.should_read_from_cache(&job.get_status(), required)?;
                }

                // Captured before driving the job: whether this call's own
                // download progress was needed at all, or the range was
                // already there from earlier (background or prior reads)
                // activity. Spec.md §9 Open Question (b) fixes this as the
                // stricter rule rather than re-deriving a hit from a status
                // that `download()` itself just forced past `required`.
                let cache_hit = job.get_status().offset as u64 >= required;

                self.prev_offset.set(offset);
                let status = job.download(required, wait_for_download, reader_cancel).await?;
                self.should_read_from_cache(&status, required)?;
                cache_hit
            }
            None => {
                // The job completed and self-removed; the index is now the
                // sole source of truth for whether the range is present.
                let info = self
                    .index
                    .look_up_without_changing_order(&self.key)
                    .ok_or(Error::InvalidFileInfoCache)?;
                if info.generation() != obj.generation || info.offset() != obj.size {
                    return Err(Error::InvalidFileInfoCache);
                }
                self.prev_offset.set(offset);
                true
            }
        };

        let want = (required - offset) as usize;
        let n = Self::positional_read(file, offset, &mut dst[..want])?;

        // Re-validate the index entry now that the physical read is done,
        // with an LRU touch this time so active reads promote the entry.
        // This bracket is not redundant with the pre-read check: it catches
        // eviction or a generation bump racing in mid-read (spec.md §4.6
        // "Rationale").
        let info = self
            .index
            .look_up(&self.key)
            .ok_or(Error::InvalidFileInfoCache)?;
        if info.generation() != obj.generation || !info.has_downloaded_prefix(required) {
            return Err(Error::InvalidFileInfoCache);
        }

        if cache_hit {
            self.metrics.inc_cache_hits();
        } else {
            self.metrics.inc_cache_misses();
        }
        self.metrics.inc_reads_total();

        Ok((n, cache_hit))
    }

    /// `status.err.is_some()` or `state ∈ {Invalid, Failed}` is an
    /// invalidation signal; `offset < required` means the cache can't serve
    /// the request promptly and the caller must fall back to the remote
    /// store. Spec.md §4.6.
    fn should_read_from_cache(&self, status: &JobStatus, required: u64) -> Result<()> {
        if status.err.is_some() || matches!(status.state, JobState::Invalid | JobState::Failed) {
            return Err(Error::InvalidFileDownloadJob);
        }
        if (status.offset as u64) < required {
            self.metrics.inc_fallbacks();
            return Err(Error::FallbackToGCS);
        }
        Ok(())
    }

    /// Positional read of `dst.len()` bytes at `offset`. A short read whose
    /// count equals the caller's own buffer exhaustion against the object
    /// tail is normal; any other short read signals external truncation of
    /// the cache file (spec.md §4.6).
    fn positional_read(file: &File, offset: u64, dst: &mut [u8]) -> Result<usize> {
        let fd = file.as_raw_fd();
        let mut read = 0usize;
        while read < dst.len() {
            match nix::sys::uio::pread(fd, &mut dst[read..], (offset + read as u64) as i64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::ErrInReadingFileHandle(std::io::Error::from(e)));
                }
            }
        }
        if read < dst.len() {
            return Err(Error::ErrInReadingFileHandle(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "cache file shorter than expected prefix",
            )));
        }
        Ok(read)
    }

    /// Close the handle. Idempotent: closing twice is a no-op, not an error.
    pub fn close(&mut self) {
        self.file = None;
        self.job.borrow_mut().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::file_info::FileInfo;
    use crate::handler::FileInfoWeigher;
    use crate::job::{Job, JobParams};
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    fn min_object(size: u64, generation: i64) -> MinObject {
        MinObject {
            name: "obj".into(),
            size,
            generation,
            crc32c: None,
            content_encoding: None,
        }
    }

    fn index() -> Arc<Index> {
        Arc::new(Index::new(u64::MAX, FileInfoWeigher))
    }

    fn cache_file(dir: &TempDir, contents: &[u8]) -> File {
        let path = dir.path().join("obj");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        File::open(&path).unwrap()
    }

    #[tokio::test]
    async fn job_absent_path_requires_matching_generation_and_offset() {
        let dir = TempDir::new().unwrap();
        let file = cache_file(&dir, &[1u8; 10]);
        let index = index();
        let key = ObjectKey::new("b", "obj").unwrap();

        let mut info = FileInfo::new(key.clone(), 1, 10);
        info.set_offset(10);
        index.insert(key.clone(), info).unwrap();

        let handle = CacheHandle::new(
            file,
            None,
            index,
            key,
            true,
            0,
            Arc::new(CacheMetrics::new()),
        );
        let obj = min_object(10, 1);
        let mut buf = [0u8; 5];
        let (n, hit) = handle.read(None, &obj, 0, &mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert!(hit);
        assert_eq!(&buf, &[1u8; 5]);
    }

    #[tokio::test]
    async fn job_absent_path_errors_on_stale_index_entry() {
        let dir = TempDir::new().unwrap();
        let file = cache_file(&dir, &[1u8; 10]);
        let index = index();
        let key = ObjectKey::new("b", "obj").unwrap();
        // No entry at all in the index.
        let handle = CacheHandle::new(
            file,
            None,
            index,
            key,
            true,
            0,
            Arc::new(CacheMetrics::new()),
        );
        let obj = min_object(10, 1);
        let mut buf = [0u8; 5];
        let err = handle.read(None, &obj, 0, &mut buf).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFileInfoCache));
    }

    #[tokio::test]
    async fn rejects_offset_at_or_beyond_object_size() {
        let dir = TempDir::new().unwrap();
        let file = cache_file(&dir, &[0u8; 4]);
        let index = index();
        let key = ObjectKey::new("b", "obj").unwrap();
        let handle = CacheHandle::new(
            file,
            None,
            index,
            key,
            true,
            0,
            Arc::new(CacheMetrics::new()),
        );
        let obj = min_object(4, 1);
        let mut buf = [0u8; 1];
        let err = handle.read(None, &obj, 4, &mut buf).await.unwrap_err();
        assert!(matches!(err, Error::WrongOffset { .. }));
    }

    fn null_job(file_size: u64) -> Arc<Job> {
        struct NullBucket;
        #[async_trait::async_trait]
        impl crate::bucket::Bucket for NullBucket {
            fn name(&self) -> &str {
                "b"
            }
            async fn new_reader(
                &self,
                _req: crate::bucket::ReaderRequest<'_>,
            ) -> Result<crate::bucket::ObjectReader> {
                Ok(Box::pin(tokio::io::empty()))
            }
        }
        let runtime = Arc::new(tokio::runtime::Runtime::new().unwrap());
        let key = ObjectKey::new("b", "obj").unwrap();
        let params = JobParams {
            key,
            generation: 1,
            file_size,
            object_crc32c: None,
            content_encoding_gzip: false,
            file_path: std::path::PathBuf::from("/tmp/unused-handle-test"),
            file_perm: 0o600,
            bucket: Arc::new(NullBucket),
            config: Arc::new(CacheConfig::default()),
            semaphore: Arc::new(Semaphore::new(4)),
            runtime,
            metrics: Arc::new(CacheMetrics::new()),
            on_progress: Arc::new(|_| Ok(())),
            on_range_written: Arc::new(|_, _| Ok(())),
            on_corrupt: Arc::new(|| {}),
        };
        Job::new(params, Arc::new(|| {}))
    }

    #[tokio::test]
    async fn random_read_without_range_caching_falls_back_before_downloading() {
        let dir = TempDir::new().unwrap();
        let file = cache_file(&dir, &[0u8; 16]);
        let index = index();
        let key = ObjectKey::new("b", "obj").unwrap();
        let info = FileInfo::new(key.clone(), 1, 16);
        index.insert(key.clone(), info).unwrap();

        let job = null_job(16);
        let handle = CacheHandle::new(
            file,
            Some(job.clone()),
            index,
            key,
            false, // cache_file_for_range_read = false
            8,     // initial_offset != 0 -> random from the start
            Arc::new(CacheMetrics::new()),
        );
        let obj = min_object(16, 1);
        let mut buf = [0u8; 4];
        let err = handle.read(None, &obj, 8, &mut buf).await.unwrap_err();
        assert!(matches!(err, Error::FallbackToGCS));
        assert_eq!(job.get_status().state, JobState::NotStarted);
    }
}
