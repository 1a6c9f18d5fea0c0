// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Download job (C3): background fetch of one object into one on-disk file,
//! publishing progress to waiting readers. See spec.md §4.3.
//!
//! The job never talks to the index or the job manager directly — per the
//! "Cyclic callbacks" design note in spec.md §9, it only holds callbacks
//! (identity = object key) handed to it at construction, so it doesn't need
//! a back-pointer to either.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::bucket::{Bucket, ByteRange, ReaderRequest};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::key::ObjectKey;
use crate::metrics::CacheMetrics;

/// Size of one sequential-mode read chunk. Spec.md §4.3.
pub const READ_CHUNK: u64 = 8 << 20;

/// A job's lifecycle state. Spec.md §4.3 state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    Downloading,
    Completed,
    Failed,
    Invalid,
}

impl JobState {
    /// Terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Invalid)
    }
}

/// A monotonically-advancing snapshot of a job's progress. Spec.md §3
/// "JobStatus".
#[derive(Clone)]
pub struct JobStatus {
    pub state: JobState,
    /// Prefix length valid for the cached file on disk. Frozen once the job
    /// reaches `Failed` or `Invalid`; equals `file_size` once `Completed`.
    pub offset: i64,
    pub err: Option<Arc<Error>>,
}

impl JobStatus {
    fn not_started() -> Self {
        JobStatus {
            state: JobState::NotStarted,
            offset: 0,
            err: None,
        }
    }
}

struct Subscriber {
    watermark: i64,
    sink: oneshot::Sender<JobStatus>,
}

/// Called with the new contiguous offset every time it advances; returns an
/// error if the backing index entry is gone (an eviction signal, not a
/// payload failure — the job reacts by going `Invalid`).
pub type ProgressCallback = Arc<dyn Fn(u64) -> Result<()> + Send + Sync>;

/// Called whenever a physical byte range has been written to the cache file,
/// in whatever order the download mode produces it. Sparse entries fold this
/// directly into their `ByteRangeMap`; non-sparse entries ignore it (they are
/// tracked by `ProgressCallback` instead). Spec.md §3 "downloaded_ranges",
/// §4.3.
pub type RangeWrittenCallback = Arc<dyn Fn(u64, u64) -> Result<()> + Send + Sync>;

/// Called by the job's own CRC check on mismatch: erase the index entry and
/// truncate+unlink the backing file. Owned by the handler, not the job.
pub type CorruptionCallback = Arc<dyn Fn() + Send + Sync>;

/// Called exactly once, when the job reaches any terminal state, to remove
/// it from the job manager's map.
pub type RemoveSelfCallback = Arc<dyn Fn() + Send + Sync>;

/// Construction parameters for a `Job`, bundled to keep `Job::new` readable.
pub struct JobParams {
    pub key: ObjectKey,
    pub generation: i64,
    pub file_size: u64,
    pub object_crc32c: Option<u32>,
    /// Whether the remote store serves this object gzip-content-encoded.
    /// Threaded into `ReaderRequest::read_compressed` so the bucket reader
    /// knows not to transparently decompress (spec.md §6 "honours
    /// compressed-encoding hint").
    pub content_encoding_gzip: bool,
    pub file_path: PathBuf,
    pub file_perm: u32,
    pub bucket: Arc<dyn Bucket>,
    pub config: Arc<CacheConfig>,
    pub semaphore: Arc<Semaphore>,
    pub runtime: Arc<tokio::runtime::Runtime>,
    pub metrics: Arc<CacheMetrics>,
    pub on_progress: ProgressCallback,
    pub on_range_written: RangeWrittenCallback,
    pub on_corrupt: CorruptionCallback,
}

/// Background fetch of one object into one on-disk file. See spec.md §4.3.
pub struct Job {
    key: ObjectKey,
    generation: i64,
    file_size: u64,
    object_crc32c: Option<u32>,
    content_encoding_gzip: bool,
    file_path: PathBuf,
    file_perm: u32,
    bucket: Arc<dyn Bucket>,
    config: Arc<CacheConfig>,
    semaphore: Arc<Semaphore>,
    runtime: Arc<tokio::runtime::Runtime>,
    metrics: Arc<CacheMetrics>,
    on_progress: ProgressCallback,
    on_range_written: RangeWrittenCallback,
    on_corrupt: CorruptionCallback,

    status: Mutex<JobStatus>,
    subscribers: Mutex<Vec<Subscriber>>,
    cancel: CancellationToken,
    remove_self: Mutex<Option<RemoveSelfCallback>>,
    started: AtomicI64, // 0 = not yet spawned, 1 = spawned; guards single spawn
}

impl Job {
    /// Construct a fresh job in state `NotStarted`. Does not spawn anything
    /// until the first `download()` call.
    pub fn new(params: JobParams, remove_self: RemoveSelfCallback) -> Arc<Self> {
        Arc::new(Job {
            key: params.key,
            generation: params.generation,
            file_size: params.file_size,
            object_crc32c: params.object_crc32c,
            content_encoding_gzip: params.content_encoding_gzip,
            file_path: params.file_path,
            file_perm: params.file_perm,
            bucket: params.bucket,
            config: params.config,
            semaphore: params.semaphore,
            runtime: params.runtime,
            metrics: params.metrics,
            on_progress: params.on_progress,
            on_range_written: params.on_range_written,
            on_corrupt: params.on_corrupt,
            status: Mutex::new(JobStatus::not_started()),
            subscribers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            remove_self: Mutex::new(Some(remove_self)),
            started: AtomicI64::new(0),
        })
    }

    /// Object this job is fetching.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Generation this job is pinned to.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Snapshot of the current status.
    pub fn get_status(&self) -> JobStatus {
        self.status.lock().unwrap().clone()
    }

    /// Drive (and optionally wait for) download progress to `watermark`.
    ///
    /// `reader_cancel`, if given, is the *calling reader's* context — distinct
    /// from the job's own internal cancellation (`invalidate`). Cancelling it
    /// returns `Error::Cancelled` to this caller only; the job keeps running
    /// for other subscribers (spec.md §5 "Cancellation and timeouts").
    pub async fn download(
        self: &Arc<Self>,
        watermark: u64,
        wait: bool,
        reader_cancel: Option<CancellationToken>,
    ) -> Result<JobStatus> {
        if watermark > self.file_size {
            return Err(Error::WatermarkBeyondFileSize {
                watermark,
                file_size: self.file_size,
            });
        }
        let watermark = watermark as i64;

        if self.started.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) == Ok(0) {
            self.status.lock().unwrap().state = JobState::Downloading;
            self.spawn_background_task();
        }

        let snapshot = self.get_status();
        if snapshot.state.is_terminal() || snapshot.offset >= watermark {
            return Ok(snapshot);
        }
        if !wait {
            return Ok(snapshot);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut subs = self.subscribers.lock().unwrap();
            let current = self.status.lock().unwrap().clone();
            if current.state.is_terminal() || current.offset >= watermark {
                return Ok(current);
            }
            subs.push(Subscriber { watermark, sink: tx });
        }

        match reader_cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                res = rx => res.map_err(|_| Error::Cancelled),
            },
            None => rx.await.map_err(|_| Error::Cancelled),
        }
    }

    /// Cancel any in-flight background task and drive the job to `Invalid`.
    /// Idempotent and safe to call concurrently; a job that already reached
    /// a terminal state (by racing with its own background task) is left
    /// alone.
    pub fn invalidate(&self) {
        self.cancel.cancel();
        self.finish(JobState::Invalid, None);
    }

    /// First caller to reach a terminal state wins; later callers (whether
    /// the background task or a concurrent `invalidate()`) are no-ops. This
    /// is what makes `invalidate()` idempotent and keeps `remove_self`
    /// firing exactly once (spec.md §4.3, §8 "At-most-one job").
    fn finish(&self, state: JobState, err: Option<Error>) {
        let snapshot = {
            let mut status = self.status.lock().unwrap();
            if status.state.is_terminal() {
                return;
            }
            status.state = state;
            status.err = err.map(Arc::new);
            status.clone()
        };

        let subs = std::mem::take(&mut *self.subscribers.lock().unwrap());
        for sub in subs {
            let _ = sub.sink.send(snapshot.clone());
        }

        if let Some(cb) = self.remove_self.lock().unwrap().take() {
            cb();
        }
    }

    /// Persist a new contiguous offset, notify satisfied subscribers, and
    /// react to a vanished index entry by going `Invalid` (spec.md §4.3
    /// "update_status_offset").
    fn update_status_offset(&self, new_offset: u64) -> Result<()> {
        if let Err(e) = (self.on_progress)(new_offset) {
            self.finish(JobState::Invalid, None);
            return Err(e);
        }

        {
            let mut status = self.status.lock().unwrap();
            if status.offset < new_offset as i64 {
                status.offset = new_offset as i64;
            }
        }

        let ready = {
            let mut subs = self.subscribers.lock().unwrap();
            let (ready, pending): (Vec<_>, Vec<_>) = subs
                .drain(..)
                .partition(|s| s.watermark <= new_offset as i64);
            *subs = pending;
            ready
        };
        if !ready.is_empty() {
            let snapshot = self.get_status();
            for sub in ready {
                let _ = sub.sink.send(snapshot.clone());
            }
        }
        Ok(())
    }

    /// Report that `[start, end)` has just been written to the cache file,
    /// regardless of whether it extends the contiguous frontier. Sparse
    /// entries fold this straight into their `ByteRangeMap`; non-sparse
    /// entries are tracked by `update_status_offset` instead, so this is a
    /// no-op for them on the handler side. A vanished index entry is the
    /// same eviction signal as in `update_status_offset`.
    fn record_range_written(&self, start: u64, end: u64) -> Result<()> {
        if let Err(e) = (self.on_range_written)(start, end) {
            self.finish(JobState::Invalid, None);
            return Err(e);
        }
        Ok(())
    }

    fn spawn_background_task(self: &Arc<Self>) {
        let job = self.clone();
        self.runtime.spawn(async move {
            job.run_background().await;
        });
    }

    async fn run_background(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.run_download_body() => res,
        };

        match outcome {
            Ok(()) => {
                if self.config.enable_crc {
                    if let Err(e) = self.verify_checksum() {
                        error!("cache file checksum mismatch for {}: {}", self.key, e);
                        self.metrics.inc_checksum_mismatches();
                        (self.on_corrupt)();
                        self.finish(JobState::Failed, Some(e));
                        return;
                    }
                }
                self.metrics.add_bytes_downloaded(self.file_size);
                self.finish(JobState::Completed, None);
            }
            Err(Error::Cancelled) => {
                self.finish(JobState::Invalid, None);
            }
            Err(e) => {
                warn!("download failed for {}: {}", self.key, e);
                self.metrics.inc_download_failures();
                self.finish(JobState::Failed, Some(e));
            }
        }
    }

    async fn run_download_body(self: &Arc<Self>) -> Result<()> {
        if self.config.enable_parallel_downloads {
            self.run_parallel().await
        } else {
            self.run_sequential().await
        }
    }

    /// Open the cache file for writing, truncating it: `O_TRUNC | O_WRONLY`
    /// per spec.md §4.3. `want_direct` additionally requests `O_DIRECT`; on
    /// `EINVAL` (filesystem doesn't support it) this falls back to a
    /// buffered open rather than failing the job.
    fn open_cache_file_for_write(&self, want_direct: bool) -> Result<std::fs::File> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let direct_file = if want_direct {
            #[cfg(target_os = "linux")]
            {
                use std::os::unix::fs::OpenOptionsExt;
                match OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .custom_flags(libc::O_DIRECT)
                    .open(&self.file_path)
                {
                    Ok(f) => Some(f),
                    Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                        warn!(
                            "O_DIRECT unsupported for {}, falling back to buffered I/O",
                            self.file_path.display()
                        );
                        None
                    }
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            #[cfg(not(target_os = "linux"))]
            {
                None
            }
        } else {
            None
        };

        let file = match direct_file {
            Some(f) => f,
            None => OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.file_path)?,
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(self.file_perm));
        }
        Ok(file)
    }

    /// *Sequential mode.* One remote reader per `sequential_read_size`
    /// window, `READ_CHUNK`-sized writes within it (spec.md §4.3).
    async fn run_sequential(&self) -> Result<()> {
        use tokio::io::AsyncReadExt;

        let file = self.open_cache_file_for_write(false)?;
        let window = self.config.sequential_read_size_bytes().max(READ_CHUNK);
        let mut window_start = 0u64;

        while window_start < self.file_size {
            let window_end = (window_start + window).min(self.file_size);
            let mut reader = self
                .bucket
                .new_reader(ReaderRequest {
                    name: self.key.object_name(),
                    generation: self.generation,
                    range: ByteRange {
                        start: window_start,
                        limit: window_end,
                    },
                    read_compressed: self.content_encoding_gzip,
                })
                .await?;

            let mut pos = window_start;
            let mut buf = vec![0u8; READ_CHUNK as usize];
            while pos < window_end {
                let to_read = (READ_CHUNK.min(window_end - pos)) as usize;
                reader.read_exact(&mut buf[..to_read]).await?;
                pwrite_all(&file, &buf[..to_read], pos)?;
                let new_pos = pos + to_read as u64;
                self.record_range_written(pos, new_pos)?;
                self.update_status_offset(new_pos)?;
                pos = new_pos;
            }
            window_start = window_end;
        }
        Ok(())
    }

    /// *Parallel mode.* Dispatches `download_chunk_size`-wide ranges across
    /// `parallel_downloads_per_file` workers, tracking the contiguous prefix
    /// grown by out-of-order completions (spec.md §4.3).
    async fn run_parallel(self: &Arc<Self>) -> Result<()> {
        let chunk = self.config.download_chunk_size_bytes().max(1);
        let num_workers = self.config.parallel_downloads_per_file.max(1);
        let want_direct = self.config.enable_o_direct;
        let file = Arc::new(self.open_cache_file_for_write(want_direct)?);

        let (tx, rx) = tokio::sync::mpsc::channel::<ByteRange>(num_workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let frontier = Arc::new(Mutex::new(RangeFrontier::new()));
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let dispatcher_file_size = self.file_size;
        let dispatcher = self.runtime.spawn(async move {
            let mut start = 0u64;
            while start < dispatcher_file_size {
                let end = (start + chunk).min(dispatcher_file_size);
                if tx.send(ByteRange { start, limit: end }).await.is_err() {
                    break;
                }
                start = end;
            }
        });

        let mut workers = Vec::with_capacity(num_workers);
        for worker_idx in 0..num_workers {
            let rx = rx.clone();
            let frontier = frontier.clone();
            let first_error = first_error.clone();
            let file = file.clone();
            let semaphore = self.semaphore.clone();
            let job = self.clone();

            workers.push(self.runtime.spawn(async move {
                // The first worker of a job never waits on the global
                // semaphore, so one job is never starved behind others.
                let _permit = if worker_idx == 0 {
                    None
                } else {
                    semaphore.acquire_owned().await.ok()
                };

                loop {
                    let range = { rx.lock().await.recv().await };
                    let range = match range {
                        Some(r) => r,
                        None => break,
                    };

                    let fetched = fetch_range(
                        &*job.bucket,
                        job.key.object_name(),
                        job.generation,
                        range,
                        job.content_encoding_gzip,
                    )
                    .await;
                    let bytes = match fetched {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            first_error.lock().unwrap().get_or_insert(e);
                            break;
                        }
                    };
                    if let Err(e) = pwrite_all(&file, &bytes, range.start) {
                        first_error.lock().unwrap().get_or_insert(e);
                        break;
                    }
                    if let Err(e) = job.record_range_written(range.start, range.limit) {
                        first_error.lock().unwrap().get_or_insert(e);
                        break;
                    }

                    let grown = frontier.lock().unwrap().insert(range.start, range.limit);
                    if let Some(r) = grown {
                        if let Err(e) = job.update_status_offset(r) {
                            first_error.lock().unwrap().get_or_insert(e);
                            break;
                        }
                    }
                }
            }));
        }

        let _ = dispatcher.await;
        for w in workers {
            let _ = w.await;
        }

        if let Some(e) = first_error.lock().unwrap().take() {
            return Err(e);
        }

        // `O_DIRECT` writes may overshoot to the write-alignment boundary.
        file.set_len(self.file_size)?;
        Ok(())
    }

    fn verify_checksum(&self) -> Result<()> {
        let expected = match self.object_crc32c {
            Some(c) => c,
            None => return Ok(()),
        };
        let file = OpenOptions::new().read(true).open(&self.file_path)?;
        let mut crc: u32 = 0;
        let mut buf = vec![0u8; 1 << 20];
        let mut pos = 0u64;
        while pos < self.file_size {
            let want = (buf.len() as u64).min(self.file_size - pos) as usize;
            let n = nix::sys::uio::pread(file.as_raw_fd(), &mut buf[..want], pos as i64)
                .map_err(|e| Error::Io(io::Error::from(e)))?;
            if n == 0 {
                break;
            }
            crc = crc32c::crc32c_append(crc, &buf[..n]);
            pos += n as u64;
        }
        if crc != expected {
            return Err(Error::ChecksumMismatch {
                expected,
                actual: crc,
            });
        }
        Ok(())
    }
}

/// Fetch one byte range from the bucket into an owned buffer.
async fn fetch_range(
    bucket: &dyn Bucket,
    object_name: &str,
    generation: i64,
    range: ByteRange,
    read_compressed: bool,
) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut reader = bucket
        .new_reader(ReaderRequest {
            name: object_name,
            generation,
            range,
            read_compressed,
        })
        .await?;
    let want = (range.limit - range.start) as usize;
    let mut buf = vec![0u8; want];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Positional write, retrying on `EINTR`, mirroring the teacher's
/// `persist_chunk` in `cache/filecache/cache_entry.rs`.
fn pwrite_all(file: &std::fs::File, buf: &[u8], offset: u64) -> Result<()> {
    let fd = file.as_raw_fd();
    let mut written = 0usize;
    while written < buf.len() {
        match nix::sys::uio::pwrite(fd, &buf[written..], (offset + written as u64) as i64) {
            Ok(n) => written += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::Io(io::Error::from(e))),
        }
    }
    Ok(())
}

/// Tracks completed byte ranges folded in arbitrary order and reports the
/// contiguous prefix `[0, R)` grown from the origin (spec.md §4.3
/// "range_map"). A simplified single `BTreeMap<start, end>` stands in for
/// the spec's described start→end/end→start double index: range lookups by
/// start already give us both merge directions via `range()` queries.
struct RangeFrontier {
    ranges: BTreeMap<u64, u64>,
    frontier: u64,
}

impl RangeFrontier {
    fn new() -> Self {
        RangeFrontier {
            ranges: BTreeMap::new(),
            frontier: 0,
        }
    }

    fn frontier(&self) -> u64 {
        self.frontier
    }

    /// Fold in `[start, end)`, merging with touching neighbors. Returns
    /// `Some(new_frontier)` if the contiguous prefix from 0 grew.
    fn insert(&mut self, start: u64, end: u64) -> Option<u64> {
        let mut s = start;
        let mut e = end;

        if let Some((&ps, &pe)) = self.ranges.range(..=s).next_back() {
            if pe >= s {
                s = s.min(ps);
                e = e.max(pe);
                self.ranges.remove(&ps);
            }
        }
        let overlapping: Vec<u64> = self
            .ranges
            .range(s..=e)
            .map(|(&k, _)| k)
            .collect();
        for k in overlapping {
            if let Some(v) = self.ranges.remove(&k) {
                e = e.max(v);
            }
        }
        self.ranges.insert(s, e);

        if s == 0 && e > self.frontier {
            self.frontier = e;
            Some(e)
        } else {
            None
        }
    }
}
