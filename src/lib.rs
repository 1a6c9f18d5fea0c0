// Copyright 2021 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A read-through disk cache for immutable remote blob objects.
//!
//! Sits between a FUSE-style read path and a remote object store, laying out
//! one file per cached object on disk. The four components that do the hard
//! work are the LRU index (`lru`), the per-object download job (`job`), the
//! job manager enforcing at-most-one job per object (`job_manager`), and the
//! cache handler (`handler`) that atomically co-manages all three together
//! with a per-open cache handle (`handle`) driving the read path.

#[macro_use]
extern crate log;

pub mod bucket;
pub mod config;
mod disk_util;
pub mod error;
mod file_info;
mod handle;
pub mod handler;
mod job;
mod job_manager;
pub mod key;
mod lru;
pub mod metrics;
mod range_map;

pub use bucket::{Bucket, MinObject, ObjectReader, ReadHandle, ReaderRequest};
pub use config::CacheConfig;
pub use disk_util::DiskUtilCalculator;
pub use error::{Error, Result};
pub use file_info::FileInfo;
pub use handle::CacheHandle;
pub use handler::CacheHandler;
pub use job::{Job, JobState, JobStatus};
pub use job_manager::JobManager;
pub use key::ObjectKey;
pub use lru::{LruIndex, Weigh};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use range_map::ByteRangeMap;
