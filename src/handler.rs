// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Cache handler (C5): atomically co-manages the LRU index, the on-disk file
//! layout, and the job manager for one cache instance. Spec.md §4.5.

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::bucket::{Bucket, MinObject};
use crate::config::CacheConfig;
use crate::disk_util::DiskUtilCalculator;
use crate::error::{Error, Result};
use crate::file_info::FileInfo;
use crate::handle::CacheHandle;
use crate::job::JobParams;
use crate::job_manager::JobManager;
use crate::key::ObjectKey;
use crate::lru::{LruIndex, Weigh};
use crate::metrics::CacheMetrics;

/// Weighs a `FileInfo` by its declared object size — the admission cost the
/// LRU budget tracks is "bytes of remote object this entry is allowed to
/// cache", not current progress.
pub(crate) struct FileInfoWeigher;

impl Weigh<FileInfo> for FileInfoWeigher {
    fn weigh(&self, value: &FileInfo) -> u64 {
        value.file_size()
    }
}

/// Concrete LRU index type shared with `CacheHandle`, which needs to name it
/// to hold a reference without re-deriving the weigher.
pub(crate) type Index = LruIndex<ObjectKey, FileInfo, FileInfoWeigher>;

/// Owns one cache instance: the index, the job manager, and the on-disk
/// layout under `config.cache_dir`. Spec.md §3 "CacheHandler manages the
/// triple (index entry, on-disk file, job) as one atomic unit".
pub struct CacheHandler {
    config: Arc<CacheConfig>,
    index: Arc<Index>,
    job_manager: JobManager,
    semaphore: Arc<Semaphore>,
    runtime: Arc<tokio::runtime::Runtime>,
    metrics: Arc<CacheMetrics>,
    disk_util: Option<Arc<DiskUtilCalculator>>,
    /// Serializes the insertion-with-eviction and invalidation sequences
    /// that must appear atomic to concurrent callers, on top of the index's
    /// and job manager's own per-structure locks (spec.md §4.5).
    lock: Mutex<()>,
}

impl CacheHandler {
    pub fn new(
        config: Arc<CacheConfig>,
        runtime: Arc<tokio::runtime::Runtime>,
        metrics: Arc<CacheMetrics>,
        disk_util: Option<Arc<DiskUtilCalculator>>,
    ) -> Self {
        let max_size = config.max_lru_size_bytes;
        let max_parallel = config.max_parallel_downloads.max(1);
        CacheHandler {
            index: Arc::new(LruIndex::new(max_size, FileInfoWeigher)),
            job_manager: JobManager::new(),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            runtime,
            metrics,
            disk_util,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Obtain a `CacheHandle` for reading `obj` through the cache, creating
    /// or revalidating its index entry as needed. Implements the algorithm
    /// of spec.md §4.5 exactly:
    ///
    /// 1. A random read against an object with no existing entry and
    ///    `cache_for_range_read == false` is refused outright — building a
    ///    handle would only cost work with no payoff.
    /// 2. If an entry exists at the same generation, its file must already
    ///    be on disk.
    /// 3. An older generation is evicted and replaced; a newer one refuses
    ///    the caller (its view of the object is stale).
    /// 4. Absent an entry, one is inserted fresh, running cleanup for
    ///    whatever the insertion evicted.
    pub fn get_cache_handle(
        &self,
        obj: &MinObject,
        bucket: Arc<dyn Bucket>,
        cache_for_range_read: bool,
        initial_offset: i64,
    ) -> Result<CacheHandle> {
        let key = ObjectKey::new(bucket.name(), obj.name.clone())?;
        let _guard = self.lock.lock().unwrap();

        if !cache_for_range_read
            && initial_offset != 0
            && self.index.look_up_without_changing_order(&key).is_none()
        {
            return Err(Error::CacheHandleNotRequiredForRandomRead);
        }

        match self.index.look_up_without_changing_order(&key) {
            Some(info) if info.generation() == obj.generation => {
                if !key.file_path(&self.config.cache_dir).exists() {
                    return Err(Error::FileNotPresentInCache);
                }
            }
            Some(info) if info.generation() < obj.generation => {
                self.index.erase(&key);
                self.cleanup_entry(&key, &info);
                self.insert_fresh(&key, obj)?;
            }
            Some(info) if info.generation() > obj.generation => {
                return Err(Error::InvalidFileInfoCache);
            }
            Some(_) => unreachable!("generation comparisons are exhaustive"),
            None => {
                self.insert_fresh(&key, obj)?;
            }
        }

        let path = key.file_path(&self.config.cache_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(
                    parent,
                    std::fs::Permissions::from_mode(self.config.dir_perm),
                );
            }
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .create(true)
            .open(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(self.config.file_perm));
        }

        let job = self.job_manager.create_if_absent(key.clone(), |k| {
            self.job_params(k, obj, path.clone(), bucket.clone())
        });

        Ok(CacheHandle::new(
            file,
            Some(job),
            self.index.clone(),
            key,
            cache_for_range_read,
            initial_offset,
            self.metrics.clone(),
        ))
    }

    /// Invalidate the cache entry for `(object_name, bucket_name)`, if any:
    /// truncating and unlinking its file is mandatory, not best-effort
    /// (spec.md §4.5 "Invalidation").
    pub fn invalidate_cache(&self, object_name: &str, bucket_name: &str) -> Result<()> {
        let key = ObjectKey::new(bucket_name, object_name)?;
        let _guard = self.lock.lock().unwrap();
        if let Some(info) = self.index.erase(&key) {
            self.cleanup_entry(&key, &info);
        }
        Ok(())
    }

    /// Tear down every cache entry and remove the cache directory.
    /// Idempotent.
    pub fn destroy(&self) {
        let _guard = self.lock.lock().unwrap();
        self.job_manager.destroy();
        for (key, info) in self.index.drain() {
            self.remove_file(&key, &info);
        }
        let _ = std::fs::remove_dir_all(&self.config.cache_dir);
    }

    fn insert_fresh(&self, key: &ObjectKey, obj: &MinObject) -> Result<()> {
        let info = if obj.has_content_encoding_gzip() {
            FileInfo::new_sparse(
                key.clone(),
                obj.generation,
                obj.size,
                self.config.chunk_size_bytes(),
            )
        } else {
            FileInfo::new(key.clone(), obj.generation, obj.size)
        };
        let evicted = self.index.insert(key.clone(), info.clone())?;
        if let Some(util) = &self.disk_util {
            util.insert_entry(&info);
        }
        for info in &evicted {
            self.metrics.inc_evictions(1);
            self.cleanup_entry(info.key(), info);
        }
        Ok(())
    }

    fn cleanup_entry(&self, key: &ObjectKey, info: &FileInfo) {
        self.job_manager.invalidate_and_remove(key);
        self.remove_file(key, info);
    }

    fn remove_file(&self, key: &ObjectKey, info: &FileInfo) {
        let path = key.file_path(&self.config.cache_dir);
        if let Some(util) = &self.disk_util {
            util.evict_entry(info);
        }
        if let Ok(file) = std::fs::OpenOptions::new().write(true).open(&path) {
            let _ = file.set_len(0);
        }
        let _ = std::fs::remove_file(&path);
    }

    fn job_params(
        &self,
        key: ObjectKey,
        obj: &MinObject,
        file_path: std::path::PathBuf,
        bucket: Arc<dyn Bucket>,
    ) -> JobParams {
        let index = self.index.clone();
        let progress_key = key.clone();
        let on_progress = Arc::new(move |offset: u64| -> Result<()> {
            let mut info = index
                .look_up_without_changing_order(&progress_key)
                .ok_or(Error::EntryNotExist)?;
            // Sparse entries track progress through `downloaded_ranges`
            // instead (see `on_range_written` below); `set_offset` panics on
            // a sparse `FileInfo` and would stomp its sentinel either way.
            if !info.sparse() {
                info.set_offset(offset);
                index.update_without_changing_order(&progress_key, info)?;
            }
            Ok(())
        });

        let index = self.index.clone();
        let range_key = key.clone();
        let on_range_written = Arc::new(move |start: u64, end: u64| -> Result<()> {
            let info = index
                .look_up_without_changing_order(&range_key)
                .ok_or(Error::EntryNotExist)?;
            if let Some(ranges) = info.downloaded_ranges() {
                ranges.add_range(start, end);
            }
            Ok(())
        });

        let index = self.index.clone();
        let corrupt_key = key.clone();
        let cache_dir = self.config.cache_dir.clone();
        let on_corrupt = Arc::new(move || {
            if let Some(info) = index.erase(&corrupt_key) {
                let path = corrupt_key.file_path(&cache_dir);
                if let Ok(file) = std::fs::OpenOptions::new().write(true).open(&path) {
                    let _ = file.set_len(0);
                }
                let _ = std::fs::remove_file(&path);
                let _ = info; // already accounted for via index.erase's weight bookkeeping
            }
        });

        JobParams {
            key,
            generation: obj.generation,
            file_size: obj.size,
            object_crc32c: obj.crc32c,
            content_encoding_gzip: obj.has_content_encoding_gzip(),
            file_path,
            file_perm: self.config.file_perm,
            bucket,
            config: self.config.clone(),
            semaphore: self.semaphore.clone(),
            runtime: self.runtime.clone(),
            metrics: self.metrics.clone(),
            on_progress,
            on_range_written,
            on_corrupt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{ByteRange, ObjectReader, ReaderRequest};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct StaticBucket(Vec<u8>);

    #[async_trait]
    impl Bucket for StaticBucket {
        fn name(&self) -> &str {
            "bucket"
        }
        async fn new_reader(&self, req: ReaderRequest<'_>) -> Result<ObjectReader> {
            let ByteRange { start, limit } = req.range;
            let slice = self.0[start as usize..limit as usize].to_vec();
            Ok(Box::pin(std::io::Cursor::new(slice)))
        }
    }

    fn handler(dir: &TempDir) -> (CacheHandler, Arc<tokio::runtime::Runtime>) {
        let runtime = Arc::new(tokio::runtime::Runtime::new().unwrap());
        let mut config = CacheConfig::default();
        config.cache_dir = dir.path().to_string_lossy().into_owned();
        let handler = CacheHandler::new(
            Arc::new(config),
            runtime.clone(),
            Arc::new(CacheMetrics::new()),
            None,
        );
        (handler, runtime)
    }

    #[test]
    fn random_read_without_entry_is_refused() {
        let dir = TempDir::new().unwrap();
        let (h, _rt) = handler(&dir);
        let obj = MinObject {
            name: "o".into(),
            size: 10,
            generation: 1,
            crc32c: None,
            content_encoding: None,
        };
        let bucket: Arc<dyn Bucket> = Arc::new(StaticBucket(vec![0u8; 10]));
        let err = h
            .get_cache_handle(&obj, bucket, false, 5)
            .unwrap_err();
        assert!(matches!(err, Error::CacheHandleNotRequiredForRandomRead));
    }

    #[test]
    fn fresh_insert_then_same_generation_reuses_entry() {
        let dir = TempDir::new().unwrap();
        let (h, _rt) = handler(&dir);
        let obj = MinObject {
            name: "o".into(),
            size: 10,
            generation: 1,
            crc32c: None,
            content_encoding: None,
        };
        let bucket: Arc<dyn Bucket> = Arc::new(StaticBucket(vec![0u8; 10]));
        h.get_cache_handle(&obj, bucket.clone(), true, 0).unwrap();
        assert_eq!(h.index.len(), 1);
        h.get_cache_handle(&obj, bucket, true, 0).unwrap();
        assert_eq!(h.index.len(), 1); // no duplicate entry
    }

    #[test]
    fn newer_generation_refuses_caller_with_stale_view() {
        let dir = TempDir::new().unwrap();
        let (h, _rt) = handler(&dir);
        let old = MinObject {
            name: "o".into(),
            size: 10,
            generation: 1,
            crc32c: None,
            content_encoding: None,
        };
        let bucket: Arc<dyn Bucket> = Arc::new(StaticBucket(vec![0u8; 10]));
        h.get_cache_handle(&old, bucket.clone(), true, 0).unwrap();

        let stale_caller = MinObject {
            generation: 0,
            ..old.clone()
        };
        let err = h
            .get_cache_handle(&stale_caller, bucket, true, 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFileInfoCache));
    }

    #[test]
    fn destroy_removes_cache_dir() {
        let dir = TempDir::new().unwrap();
        let (h, _rt) = handler(&dir);
        let obj = MinObject {
            name: "o".into(),
            size: 10,
            generation: 1,
            crc32c: None,
            content_encoding: None,
        };
        let bucket: Arc<dyn Bucket> = Arc::new(StaticBucket(vec![0u8; 10]));
        h.get_cache_handle(&obj, bucket, true, 0).unwrap();
        h.destroy();
        assert!(!dir.path().exists());
        h.destroy(); // idempotent
    }
}
