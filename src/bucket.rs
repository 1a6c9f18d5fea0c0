// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! External collaborator contracts consumed by the download job: the remote
//! object store client and the minimal object metadata it returns. Spec.md
//! §1 places the full remote-store client out of scope; this module states
//! only the slice of it the cache actually calls, the way the teacher's
//! `cache/mod.rs` states `BlobBackend`/`BlobReader` rather than importing a
//! full registry/OSS client.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;

/// The minimal object metadata the cache needs from the remote store.
/// Spec.md §6 "`MinObject` consumed".
#[derive(Debug, Clone)]
pub struct MinObject {
    pub name: String,
    pub size: u64,
    pub generation: i64,
    pub crc32c: Option<u32>,
    pub content_encoding: Option<String>,
}

impl MinObject {
    /// Whether the object is served gzip-content-encoded by the remote
    /// store; such objects can't be range-read meaningfully and the
    /// download job should fetch them as one continuous stream.
    pub fn has_content_encoding_gzip(&self) -> bool {
        self.content_encoding
            .as_deref()
            .map(|v| v.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false)
    }
}

/// A byte range `[start, limit)` requested from a bucket reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub limit: u64,
}

/// Parameters for `Bucket::new_reader`. Spec.md §6.
pub struct ReaderRequest<'a> {
    pub name: &'a str,
    pub generation: i64,
    pub range: ByteRange,
    pub read_compressed: bool,
}

/// A streaming handle opened by `Bucket::new_reader`, satisfying both
/// `AsyncRead` and ordinary closing-on-drop semantics.
pub type ObjectReader = std::pin::Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// An opaque, backend-specific handle letting a job resume the same remote
/// session across successive chunks of one file, returned by
/// `new_reader_with_read_handle`. The cache treats it as opaque and only
/// threads it back into the next call.
pub trait ReadHandle: Send {}

/// The slice of the remote object store client the download job depends on.
/// Spec.md §6 "`Bucket` consumed by the job".
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Name of the bucket.
    fn name(&self) -> &str;

    /// Open a streaming reader for `req.range` of the named object at the
    /// given generation.
    async fn new_reader(&self, req: ReaderRequest<'_>) -> Result<ObjectReader>;

    /// Same as `new_reader`, but lets the job supply (and receive back) an
    /// opaque session-resume handle to amortise reader construction across
    /// successive chunks of the same file. Buckets that don't support
    /// session resumption can fall back to `new_reader`.
    async fn new_reader_with_read_handle(
        &self,
        req: ReaderRequest<'_>,
        _resume: Option<Box<dyn ReadHandle>>,
    ) -> Result<(ObjectReader, Option<Box<dyn ReadHandle>>)> {
        let reader = self.new_reader(req).await?;
        Ok((reader, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_detection_is_case_insensitive() {
        let mut obj = MinObject {
            name: "o".into(),
            size: 0,
            generation: 1,
            crc32c: None,
            content_encoding: Some("GZIP".into()),
        };
        assert!(obj.has_content_encoding_gzip());
        obj.content_encoding = Some("identity".into());
        assert!(!obj.has_content_encoding_gzip());
        obj.content_encoding = None;
        assert!(!obj.has_content_encoding_gzip());
    }
}
