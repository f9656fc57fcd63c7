//! Segment downloads
//!
//! Handles:
//! - One persistent IO session per group, reused for every segment
//! - Ephemeral sessions for the manifest
//! - Local (`file://`) resources, used in place
//! - Per group worker tasks feeding results back to the control task
//! - 404 retry / expiry / end-of-stream policy

use crate::{
    clock::{parse_server_time, DATE_HEADER, SERVER_UTC_HEADER},
    io::{is_local_url, DashIo, IoHandle},
    scheduler::SegmentDescriptor,
    types::ByteRange,
    Error, Result,
};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

/// A completed transfer
#[derive(Debug, Clone)]
pub struct FetchedResource {
    /// Cache entry holding the body (the file path for local resources)
    pub cache_name: String,
    /// Final URL, after redirects
    pub url: Url,
    pub bytes: u64,
    /// Wall time of the whole transfer
    pub elapsed: Duration,
    /// Body throughput, as measured by the IO layer when it can
    pub bytes_per_sec: u64,
    /// Server clock from `Server-UTC` / `Date`
    pub server_time: Option<DateTime<Utc>>,
    /// Local time the response completed
    pub completed_at: DateTime<Utc>,
    pub mime: Option<String>,
    /// Used in place, never copied nor deleted
    pub local: bool,
}

async fn fetch_local(url: &Url) -> Result<FetchedResource> {
    let path = url
        .to_file_path()
        .map_err(|_| Error::transport(format!("not a local path: {url}")))?;
    let metadata = tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::SegmentNotFound {
            url: url.to_string(),
        },
        _ => Error::Io(e),
    })?;
    Ok(FetchedResource {
        cache_name: path.to_string_lossy().into_owned(),
        url: url.clone(),
        bytes: metadata.len(),
        elapsed: Duration::ZERO,
        bytes_per_sec: 0,
        server_time: None,
        completed_at: Utc::now(),
        mime: None,
        local: true,
    })
}

async fn transfer(io: &dyn DashIo, handle: IoHandle, url: &Url) -> Result<FetchedResource> {
    let started = Instant::now();
    io.init(handle).await?;
    io.run(handle).await?;
    let elapsed = started.elapsed();

    let cache_name = io
        .get_cache_name(handle)
        .ok_or_else(|| Error::transport(format!("no cache entry for {url}")))?;
    let bytes = io.get_bytes_done(handle);
    let bytes_per_sec = match io.get_bytes_per_sec(handle) {
        0 if !elapsed.is_zero() => (bytes as f64 / elapsed.as_secs_f64()) as u64,
        rate => rate,
    };
    let server_time = parse_server_time(
        io.get_header_value(handle, SERVER_UTC_HEADER).as_deref(),
        io.get_header_value(handle, DATE_HEADER).as_deref(),
    );

    Ok(FetchedResource {
        cache_name,
        url: io.get_url(handle).unwrap_or_else(|| url.clone()),
        bytes,
        elapsed,
        bytes_per_sec,
        server_time,
        completed_at: Utc::now(),
        mime: io.get_mime(handle),
        local: false,
    })
}

/// Fetch a resource through a throwaway session
///
/// Used for the manifest (`group = None`).
#[instrument(skip(io), fields(url = %url))]
pub async fn fetch_once(
    io: &dyn DashIo,
    url: &Url,
    range: Option<ByteRange>,
    group: Option<usize>,
) -> Result<FetchedResource> {
    if is_local_url(url) {
        return fetch_local(url).await;
    }
    let handle = io.create(false, url, group)?;
    let result = async {
        io.set_range(handle, range, false)?;
        transfer(io, handle, url).await
    }
    .await;
    io.del(handle);
    result
}

/// Drives the IO session of one group
pub struct DownloadCoordinator {
    io: Arc<dyn DashIo>,
    group: usize,
    handle: Mutex<Option<IoHandle>>,
}

impl DownloadCoordinator {
    pub fn new(io: Arc<dyn DashIo>, group: usize) -> Self {
        Self {
            io,
            group,
            handle: Mutex::new(None),
        }
    }

    pub fn group(&self) -> usize {
        self.group
    }

    /// Persistent session, created on first use
    pub fn handle(&self) -> Option<IoHandle> {
        *self.handle.lock()
    }

    fn prepare(&self, url: &Url, range: Option<ByteRange>) -> Result<IoHandle> {
        let mut slot = self.handle.lock();
        let handle = match *slot {
            Some(handle) => {
                self.io.setup_from_url(handle, url, Some(self.group))?;
                handle
            }
            None => {
                let handle = self.io.create(true, url, Some(self.group))?;
                debug!(group = self.group, %handle, "Group download session created");
                *slot = Some(handle);
                handle
            }
        };
        self.io.set_range(handle, range, range.is_some())?;
        Ok(handle)
    }

    /// Download one segment (or init segment) into the cache
    #[instrument(skip(self), fields(group = self.group, url = %url))]
    pub async fn fetch(&self, url: &Url, range: Option<ByteRange>) -> Result<FetchedResource> {
        if is_local_url(url) {
            return fetch_local(url).await;
        }
        let handle = self.prepare(url, range)?;
        transfer(self.io.as_ref(), handle, url).await
    }

    /// Cancel the transfer in flight, if any
    pub fn abort(&self) {
        if let Some(handle) = *self.handle.lock() {
            self.io.abort(handle);
        }
    }

    /// Release the persistent session
    pub fn release(&self) {
        if let Some(handle) = self.handle.lock().take() {
            self.io.abort(handle);
            self.io.del(handle);
            debug!(group = self.group, %handle, "Group download session released");
        }
    }
}

impl Drop for DownloadCoordinator {
    fn drop(&mut self) {
        self.release();
    }
}

/// What a job downloads
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// Init segment of a representation
    Init { representation: usize },
    /// Media segment
    Media {
        representation: usize,
        segment: SegmentDescriptor,
    },
}

/// Work item sent to a group worker
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    /// Group epoch at dispatch; results of older epochs are dropped
    pub epoch: u64,
    pub kind: JobKind,
    pub url: Url,
    pub range: Option<ByteRange>,
}

impl DownloadJob {
    pub fn representation(&self) -> usize {
        match &self.kind {
            JobKind::Init { representation } | JobKind::Media { representation, .. } => {
                *representation
            }
        }
    }

    pub fn is_init(&self) -> bool {
        matches!(self.kind, JobKind::Init { .. })
    }
}

/// Result of a job, sent back to the control task
#[derive(Debug)]
pub struct DownloadOutcome {
    pub group: usize,
    pub job: DownloadJob,
    pub result: Result<FetchedResource>,
}

/// Control side of a group worker task
pub struct GroupWorker {
    group: usize,
    jobs: mpsc::UnboundedSender<DownloadJob>,
    coordinator: Arc<DownloadCoordinator>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl GroupWorker {
    /// Spawn the worker task of a group
    pub fn spawn(
        group: usize,
        io: Arc<dyn DashIo>,
        results: mpsc::UnboundedSender<DownloadOutcome>,
        cancel: CancellationToken,
    ) -> Self {
        let coordinator = Arc::new(DownloadCoordinator::new(io, group));
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(
            coordinator.clone(),
            jobs_rx,
            results,
            cancel.clone(),
        ));
        Self {
            group,
            jobs,
            coordinator,
            cancel,
            task: Some(task),
        }
    }

    pub fn group(&self) -> usize {
        self.group
    }

    /// Queue a job
    pub fn submit(&self, job: DownloadJob) -> Result<()> {
        self.jobs.send(job).map_err(|_| Error::SessionClosed)
    }

    /// Cancel the transfer in flight without stopping the worker
    pub fn abort_current(&self) {
        self.coordinator.abort();
    }

    /// Stop the worker and wait for it
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.coordinator.abort();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(group = self.group, error = %e, "Group worker ended abnormally");
            }
        }
        self.coordinator.release();
    }
}

impl Drop for GroupWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(
    coordinator: Arc<DownloadCoordinator>,
    mut jobs: mpsc::UnboundedReceiver<DownloadJob>,
    results: mpsc::UnboundedSender<DownloadOutcome>,
    cancel: CancellationToken,
) {
    let group = coordinator.group();
    debug!(group, "Group worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                coordinator.abort();
                Err(Error::Aborted)
            }
            result = coordinator.fetch(&job.url, job.range) => result,
        };

        if results.send(DownloadOutcome { group, job, result }).is_err() {
            break;
        }
    }
    debug!(group, "Group worker stopped");
}

/// What to do after a failed segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Ask again after the delay
    Retry(Duration),
    /// Skip the segment
    Lost,
    /// The group has no more segments
    EndOfStream,
}

/// Consecutive failure bookkeeping of a group
#[derive(Debug, Clone)]
pub struct FailureTracker {
    retry_after: Duration,
    expire_after: Duration,
    max_consecutive: u32,
    /// UTC time of the first 404 of the current segment
    first_not_found: Option<DateTime<Utc>>,
    consecutive_lost: u32,
    /// Failures counted once end-of-stream detection started
    eos_failures: u32,
}

/// Failures after end-of-stream detection started that end the group
const EOS_CONFIRMATIONS: u32 = 2;

impl FailureTracker {
    pub fn new(retry_after: Duration, expire_after: Duration, max_consecutive: u32) -> Self {
        Self {
            retry_after,
            expire_after,
            max_consecutive,
            first_not_found: None,
            consecutive_lost: 0,
            eos_failures: 0,
        }
    }

    pub fn set_retry_after(&mut self, retry_after: Duration) {
        self.retry_after = retry_after;
    }

    pub fn set_expire_after(&mut self, expire_after: Duration) {
        self.expire_after = expire_after;
    }

    pub fn consecutive_lost(&self) -> u32 {
        self.consecutive_lost
    }

    /// Is a missing segment being waited for
    pub fn is_waiting(&self) -> bool {
        self.first_not_found.is_some()
    }

    /// A segment arrived
    pub fn on_success(&mut self) {
        self.first_not_found = None;
        self.consecutive_lost = 0;
        self.eos_failures = 0;
    }

    /// The server answered "not found"
    ///
    /// Live segments are retried until `expire_after` of UTC clock time has
    /// passed since the first 404; static ones are lost right away.
    pub fn on_not_found(&mut self, now: DateTime<Utc>, dynamic: bool) -> FailureAction {
        if !dynamic {
            return self.register_lost();
        }
        let first = *self.first_not_found.get_or_insert(now);
        let waited = now - first;
        let expire = TimeDelta::from_std(self.expire_after).unwrap_or_else(|_| TimeDelta::zero());
        if waited >= expire && waited > TimeDelta::zero() {
            self.first_not_found = None;
            return self.register_lost();
        }
        FailureAction::Retry(self.retry_after)
    }

    /// Any other transport failure
    pub fn on_error(&mut self) -> FailureAction {
        self.first_not_found = None;
        self.register_lost()
    }

    fn register_lost(&mut self) -> FailureAction {
        self.consecutive_lost += 1;
        if self.consecutive_lost > self.max_consecutive {
            self.eos_failures += 1;
            if self.eos_failures >= EOS_CONFIRMATIONS {
                warn!(
                    lost = self.consecutive_lost,
                    "Too many consecutive failures, assuming end of stream"
                );
                return FailureAction::EndOfStream;
            }
        }
        FailureAction::Lost
    }
}
