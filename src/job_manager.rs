// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Job manager (C4): at-most-one `Job` per object, keyed by `ObjectKey`.
//! Spec.md §4.4.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::job::{Job, JobParams};
use crate::key::ObjectKey;

/// Owns the map from object identity to its (at most one) in-flight or
/// completed `Job`. A `Job` removes itself from this map on reaching a
/// terminal state, so a present entry always means "not yet terminal or not
/// yet self-removed" — callers must not assume a `Some` return is still
/// downloading.
#[derive(Default)]
pub struct JobManager {
    jobs: Arc<Mutex<HashMap<ObjectKey, Arc<Job>>>>,
}

impl JobManager {
    pub fn new() -> Self {
        JobManager {
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of jobs currently registered (including ones not yet started).
    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the job currently registered for `key`, if any.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Job>> {
        self.jobs.lock().unwrap().get(key).cloned()
    }

    /// Return the job registered for `key`, constructing and registering one
    /// via `build` if absent. `build` is only invoked when no job already
    /// exists, preserving the at-most-one-job-per-object invariant even
    /// under concurrent callers racing on the same key.
    pub fn create_if_absent(
        &self,
        key: ObjectKey,
        build: impl FnOnce(ObjectKey) -> JobParams,
    ) -> Arc<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get(&key) {
            return job.clone();
        }
        let params = build(key.clone());
        let job = Job::new(params, self.remove_self_callback(key.clone()));
        jobs.insert(key, job.clone());
        job
    }

    fn remove_self_callback(&self, key: ObjectKey) -> Arc<dyn Fn() + Send + Sync> {
        let jobs = self.jobs.clone();
        Arc::new(move || {
            jobs.lock().unwrap().remove(&key);
        })
    }

    /// Fetch the job for `key`, if any, and drive it to `Invalid`. The
    /// manager's own map lock is released *before* calling `job.invalidate()`
    /// — `invalidate()` runs the job's `remove_self` callback, which
    /// re-acquires this same lock, so holding it across the call would
    /// deadlock (spec.md §5 "lock ordering").
    pub fn invalidate_and_remove(&self, key: &ObjectKey) {
        let job = self.jobs.lock().unwrap().get(key).cloned();
        if let Some(job) = job {
            job.invalidate();
        }
    }

    /// Invalidate every registered job. Used by `CacheHandler::destroy`.
    pub fn destroy(&self) {
        let all: Vec<Arc<Job>> = self.jobs.lock().unwrap().values().cloned().collect();
        for job in all {
            job.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{Bucket, ObjectReader, ReaderRequest};
    use crate::config::CacheConfig;
    use crate::error::Result;
    use crate::metrics::CacheMetrics;
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    struct NullBucket;

    #[async_trait]
    impl Bucket for NullBucket {
        fn name(&self) -> &str {
            "bucket"
        }
        async fn new_reader(&self, _req: ReaderRequest<'_>) -> Result<ObjectReader> {
            Ok(Box::pin(tokio::io::empty()))
        }
    }

    fn params(key: ObjectKey, runtime: Arc<tokio::runtime::Runtime>) -> JobParams {
        JobParams {
            key,
            generation: 1,
            file_size: 0,
            object_crc32c: None,
            content_encoding_gzip: false,
            file_path: std::path::PathBuf::from("/tmp/unused"),
            file_perm: 0o600,
            bucket: Arc::new(NullBucket),
            config: Arc::new(CacheConfig::default()),
            semaphore: Arc::new(Semaphore::new(4)),
            runtime,
            metrics: Arc::new(CacheMetrics::new()),
            on_progress: Arc::new(|_| Ok(())),
            on_range_written: Arc::new(|_, _| Ok(())),
            on_corrupt: Arc::new(|| {}),
        }
    }

    #[test]
    fn create_if_absent_returns_same_job_for_same_key() {
        let runtime = Arc::new(tokio::runtime::Runtime::new().unwrap());
        let mgr = JobManager::new();
        let key = ObjectKey::new("b", "o").unwrap();

        let mut build_calls = 0;
        let rt = runtime.clone();
        let job1 = mgr.create_if_absent(key.clone(), |k| {
            build_calls += 1;
            params(k, rt.clone())
        });
        let job2 = mgr.create_if_absent(key.clone(), |k| {
            build_calls += 1;
            params(k, rt.clone())
        });
        assert_eq!(build_calls, 1);
        assert!(Arc::ptr_eq(&job1, &job2));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn invalidate_and_remove_drops_map_entry() {
        let runtime = Arc::new(tokio::runtime::Runtime::new().unwrap());
        let mgr = JobManager::new();
        let key = ObjectKey::new("b", "o").unwrap();
        let rt = runtime.clone();
        mgr.create_if_absent(key.clone(), |k| params(k, rt.clone()));
        assert_eq!(mgr.len(), 1);

        mgr.invalidate_and_remove(&key);
        assert!(mgr.is_empty());
        assert!(mgr.get(&key).is_none());
    }

    #[test]
    fn invalidate_and_remove_on_absent_key_is_a_no_op() {
        let mgr = JobManager::new();
        let key = ObjectKey::new("b", "o").unwrap();
        mgr.invalidate_and_remove(&key); // must not panic
        assert!(mgr.is_empty());
    }
}
