// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Identity of a cached object: `(bucket_name, object_name)`, stable for the
//! lifetime of an index entry. See spec.md §3 "ObjectKey".

use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Identifies an object in a remote bucket, independent of generation.
///
/// Two `ObjectKey`s with the same bucket and object name refer to the same
/// logical object across generations; the generation lives in `FileInfo`
/// alongside it, not here, because eviction and invalidation key off object
/// identity first and compare generations second (spec.md §4.5).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    bucket_name: String,
    object_name: String,
}

impl ObjectKey {
    /// Construct a new `ObjectKey`. Fails if either component is empty.
    pub fn new(bucket_name: impl Into<String>, object_name: impl Into<String>) -> Result<Self> {
        let bucket_name = bucket_name.into();
        let object_name = object_name.into();
        if bucket_name.is_empty() || object_name.is_empty() {
            return Err(Error::InvalidKeyAttributes);
        }
        Ok(ObjectKey {
            bucket_name,
            object_name,
        })
    }

    /// Bucket component.
    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    /// Object component.
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Concatenated `bucket_name ++ object_name` form, with an optional
    /// caller-carried creation-time epoch spliced between them. Used as the
    /// index/job-manager map key and as input to the on-disk path.
    pub fn stringify(&self, creation_time_epoch: Option<i64>) -> String {
        match creation_time_epoch {
            Some(epoch) => format!("{}{}{}", self.bucket_name, epoch, self.object_name),
            None => format!("{}{}", self.bucket_name, self.object_name),
        }
    }

    /// On-disk location of the cache file for this key: `<cache_dir>/<bucket>/<object>`.
    pub fn file_path(&self, cache_dir: &str) -> PathBuf {
        PathBuf::from(cache_dir)
            .join(&self.bucket_name)
            .join(&self.object_name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket_name, self.object_name)
    }
}
