//! Dash Session - Main orchestrator of a streaming client
//!
//! Coordinates:
//! - Manifest loading, validation and refresh
//! - Period setup, switch and teardown
//! - Group controllers and their download workers
//! - Buffering state and event delivery
//! - The player facing API (segment locations, selection, seeking)
//!
//! One control task per open session owns every group controller. Calls from
//! the player either read state shared behind per group locks or queue a
//! request for the control task.

use crate::{
    buffer::{BufferingChange, BufferingState, GroupLevel},
    clock::UtcClock,
    config::DashConfig,
    download::{fetch_once, DownloadOutcome, FetchedResource, GroupWorker},
    events::{DashEvent, DashEventHandler},
    group::{GroupController, GroupShared, GroupUserData},
    io::DashIo,
    manifest::{check_mpd_root_type, detect_manifest_type, Manifest, ManifestParser, ManifestType},
    period::{period_drained, PeriodManager},
    scheduler::{LiveWindow, PeriodContext},
    types::{
        BufferInfo, PeriodState, PeriodSwitchStatus, QualityInfo, ResyncOutcome, SegmentLocation,
        SessionId,
    },
    Error, Result,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Representation designated by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityRef<'a> {
    Index(usize),
    Id(&'a str),
}

/// Work queued for the control task by the player facing API
#[derive(Debug)]
enum ControlRequest {
    /// Re-run a tick (segment consumed, group selection changed)
    Wake,
    Seek(Duration),
    SwitchQuality {
        up: bool,
        immediate: bool,
    },
    SelectQuality {
        group: usize,
        index: usize,
        force: bool,
    },
    RequestPeriodSwitch,
    SetGroupDone {
        group: usize,
        done: bool,
    },
    Resync {
        latest: String,
        earliest: Option<String>,
        reply: oneshot::Sender<Result<ResyncOutcome>>,
    },
    ConfigChanged,
}

/// State shared between the API and the control task
struct SessionShared {
    id: SessionId,
    config: RwLock<DashConfig>,
    io: Arc<dyn DashIo>,
    parser: Arc<dyn ManifestParser>,
    handler: Arc<dyn DashEventHandler>,
    url: RwLock<Option<Url>>,
    manifest: RwLock<Option<Arc<Manifest>>>,
    groups: RwLock<Vec<Arc<GroupShared>>>,
    clock: Mutex<UtcClock>,
    period_index: AtomicUsize,
    switch_status: Arc<AtomicU8>,
    in_setup: AtomicBool,
    /// Timeshift position of the first selected live group (ms)
    timeshift_ms: AtomicU64,
    /// Buffering target and level, for `get_buffer_info`
    buffer_target_ms: AtomicU64,
    period_state: Mutex<Option<watch::Receiver<PeriodState>>>,
}

impl SessionShared {
    fn emit(&self, event: &DashEvent) -> Result<()> {
        debug!(session_id = %self.id, event = event.name(), "Dash event");
        self.handler.on_dash_event(event)
    }

    /// Deliver an event whose rejection changes nothing
    fn notify(&self, event: &DashEvent) {
        if let Err(e) = self.emit(event) {
            warn!(event = event.name(), error = %e, "Event handler returned an error");
        }
    }

    fn config(&self) -> DashConfig {
        self.config.read().clone()
    }

    fn group(&self, index: usize) -> Result<Arc<GroupShared>> {
        self.groups
            .read()
            .get(index)
            .cloned()
            .ok_or(Error::InvalidGroup(index))
    }

    fn switch_status(&self) -> PeriodSwitchStatus {
        PeriodSwitchStatus::from_code(self.switch_status.load(Ordering::Acquire))
    }

    /// Fetch, validate and parse a manifest
    #[instrument(skip(self), fields(url = %url))]
    async fn load_manifest(&self, url: &Url) -> Result<Arc<Manifest>> {
        let config = self.config();
        let fetched = fetch_once(self.io.as_ref(), url, None, None)
            .await
            .map_err(|e| Error::ManifestFetch(e.to_string()))?;

        let content = if fetched.local {
            tokio::fs::read(&fetched.cache_name)
                .await
                .map_err(|e| Error::ManifestFetch(e.to_string()))?
        } else {
            let bytes = self.io.read_cache_file(&fetched.cache_name).await;
            if !config.keep_files {
                self.io.delete_cache_file(&fetched.cache_name);
            }
            bytes.map_err(|e| Error::ManifestFetch(e.to_string()))?.to_vec()
        };

        match detect_manifest_type(&fetched.url, fetched.mime.as_deref(), Some(&content)) {
            Some(ManifestType::Dash) => {
                if !check_mpd_root_type(&content) {
                    return Err(Error::InvalidManifest("root element is not MPD".into()));
                }
            }
            Some(ManifestType::Hls) => {}
            None => {
                return Err(Error::UnsupportedManifest {
                    mime: fetched.mime.unwrap_or_else(|| "unknown".into()),
                })
            }
        }

        let manifest = self
            .parser
            .parse(&content, &fetched.url)
            .map_err(|e| match e {
                Error::ManifestParse(_) | Error::InvalidManifest(_) => e,
                other => Error::ManifestParse(other.to_string()),
            })?;
        if manifest.periods.is_empty() {
            return Err(Error::InvalidManifest("manifest has no period".into()));
        }

        if config.enable_utc_drift_compensation {
            if let Some(server) = fetched.server_time {
                self.clock.lock().set_server_time(server, fetched.completed_at);
            }
        }

        info!(
            periods = manifest.periods.len(),
            dynamic = manifest.is_dynamic(),
            bytes = content.len(),
            "Manifest loaded"
        );
        Ok(Arc::new(manifest))
    }
}

/// Handle on the running control task
struct ControlHandle {
    requests: mpsc::UnboundedSender<ControlRequest>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Adaptive streaming session over a single manifest
pub struct DashSession {
    shared: Arc<SessionShared>,
    control: Mutex<Option<ControlHandle>>,
}

impl DashSession {
    /// Create a session; nothing is fetched before [`open`](Self::open)
    pub fn new(
        config: DashConfig,
        io: Arc<dyn DashIo>,
        parser: Arc<dyn ManifestParser>,
        handler: Arc<dyn DashEventHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let clock = UtcClock::new(config.utc_shift_ms);
        Ok(Self {
            shared: Arc::new(SessionShared {
                id: SessionId::new(),
                config: RwLock::new(config),
                io,
                parser,
                handler,
                url: RwLock::new(None),
                manifest: RwLock::new(None),
                groups: RwLock::new(Vec::new()),
                clock: Mutex::new(clock),
                period_index: AtomicUsize::new(0),
                switch_status: Arc::new(AtomicU8::new(0)),
                in_setup: AtomicBool::new(false),
                timeshift_ms: AtomicU64::new(0),
                buffer_target_ms: AtomicU64::new(0),
                period_state: Mutex::new(None),
            }),
            control: Mutex::new(None),
        })
    }

    /// Get session ID
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn is_open(&self) -> bool {
        self.control.lock().is_some()
    }

    /// Load a manifest and start the control task
    ///
    /// Any failure is reported with [`DashEvent::ManifestInitError`] and
    /// leaves the session closed.
    #[instrument(skip(self), fields(session_id = %self.shared.id))]
    pub async fn open(&self, url: &Url) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyOpen);
        }
        info!(url = %url, "Opening session");

        let manifest = match self.shared.load_manifest(url).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "Manifest initialization failed");
                self.shared.notify(&DashEvent::ManifestInitError {
                    code: e.error_code().to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let period = if manifest.is_dynamic() {
            let elapsed = manifest
                .availability_start_time
                .and_then(|ast| (self.shared.clock.lock().now() - ast).to_std().ok())
                .unwrap_or_default();
            manifest
                .period_index_at(elapsed)
                .unwrap_or(manifest.periods.len() - 1)
        } else {
            0
        };

        let mut periods = PeriodManager::new(self.shared.switch_status.clone());
        *self.shared.period_state.lock() = Some(periods.subscribe());
        periods.load(period, Duration::ZERO)?;

        *self.shared.url.write() = Some(url.clone());
        *self.shared.manifest.write() = Some(manifest.clone());
        self.shared.period_index.store(period, Ordering::Release);
        self.shared.in_setup.store(true, Ordering::Release);

        let mut control = self.control.lock();
        if control.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let config = self.shared.config();
        let control_loop = ControlLoop {
            shared: self.shared.clone(),
            manifest,
            periods,
            groups: Vec::new(),
            workers: Vec::new(),
            results_tx,
            results_rx,
            requests: requests_rx,
            cancel: cancel.clone(),
            buffering: BufferingState::new(Duration::from_millis(config.user_buffer_time_ms)),
            last_refresh: Instant::now(),
            refresh_forced: false,
            playback_created: false,
        };
        let task = tokio::spawn(control_loop.run());
        *control = Some(ControlHandle {
            requests,
            cancel,
            task,
        });
        info!(period, "Session opened");
        Ok(())
    }

    /// Stop the control task, abort downloads and tear the period down
    #[instrument(skip(self), fields(session_id = %self.shared.id))]
    pub async fn close(&self) -> Result<()> {
        let handle = self.control.lock().take().ok_or(Error::NotOpen)?;
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!(error = %e, "Control task ended abnormally");
        }
        *self.shared.manifest.write() = None;
        *self.shared.url.write() = None;
        self.shared.groups.write().clear();
        self.shared.in_setup.store(false, Ordering::Release);
        info!("Session closed");
        Ok(())
    }

    fn send(&self, request: ControlRequest) -> Result<()> {
        let control = self.control.lock();
        let handle = control.as_ref().ok_or(Error::NotOpen)?;
        handle.requests.send(request).map_err(|_| Error::SessionClosed)
    }

    fn manifest(&self) -> Result<Arc<Manifest>> {
        self.shared.manifest.read().clone().ok_or(Error::NotOpen)
    }

    // ========================================================================
    // Segment access
    // ========================================================================

    /// Location of the next segment ready in a group
    pub fn get_next_segment_location(&self, group: usize) -> Result<SegmentLocation> {
        if self.shared.switch_status() == PeriodSwitchStatus::InProgress {
            return Err(Error::PeriodSwitchInProgress);
        }
        let shared = self.shared.group(group)?;
        shared.with_buffer(|b| {
            if b.is_buffering() {
                return Err(Error::BufferEmpty { group });
            }
            b.next_location()
        })
    }

    /// The player consumed the head segment of a group
    pub fn discard_segment(&self, group: usize) -> Result<()> {
        if self.shared.switch_status() == PeriodSwitchStatus::InProgress {
            return Err(Error::PeriodSwitchInProgress);
        }
        let shared = self.shared.group(group)?;
        let io = self.shared.io.as_ref();
        let discarded = shared.with_buffer(|b| b.discard(io));
        if discarded.is_none() {
            return Err(Error::BufferEmpty { group });
        }
        shared.clear_switch_forced();
        self.send(ControlRequest::Wake)
    }

    /// Segments ready in a group, and whether the group reached its end
    pub fn get_num_segments_ready(&self, group: usize) -> Result<(usize, bool)> {
        Ok(self.shared.group(group)?.with_buffer(|b| b.num_ready()))
    }

    pub fn get_max_segments_in_cache(&self, group: usize) -> Result<usize> {
        Ok(self.shared.group(group)?.with_buffer(|b| b.max_segments()))
    }

    /// Was the last switch of a group done by dropping buffered segments
    pub fn segment_switch_forced(&self, group: usize) -> Result<bool> {
        Ok(self.shared.group(group)?.switch_forced())
    }

    /// Does the head segment of a group restart a looping schedule
    pub fn group_loop_detected(&self, group: usize) -> Result<bool> {
        Ok(self
            .shared
            .group(group)?
            .with_buffer(|b| b.front().is_some_and(|s| s.loop_detected)))
    }

    /// Start time of the segment the player is about to get
    pub fn group_current_segment_start_time(&self, group: usize) -> Result<Duration> {
        let shared = self.shared.group(group)?;
        Ok(shared
            .with_buffer(|b| b.front().map(|s| s.start))
            .unwrap_or_else(|| shared.next_segment_start()))
    }

    // ========================================================================
    // Groups and qualities
    // ========================================================================

    pub fn get_group_count(&self) -> usize {
        self.shared.groups.read().len()
    }

    /// Select or deselect a group
    ///
    /// Selecting a group deselects its alternates.
    pub fn group_select(&self, group: usize, select: bool) -> Result<()> {
        if select && !self.is_group_selectable(group) {
            debug!(group, "Group disabled by configuration, not selected");
            return Ok(());
        }
        {
            let groups = self.shared.groups.read();
            let shared = groups.get(group).ok_or(Error::InvalidGroup(group))?;
            shared.set_selected(select);
            if select {
                for alternate in shared.alternates() {
                    if let Some(other) = groups.get(*alternate) {
                        other.set_selected(false);
                    }
                }
            }
        }
        debug!(group, select, "Group selection changed");
        match self.send(ControlRequest::Wake) {
            Err(Error::NotOpen) => Ok(()),
            other => other,
        }
    }

    pub fn is_group_selected(&self, group: usize) -> bool {
        self.shared.group(group).is_ok_and(|g| g.is_selected())
    }

    /// Allowed by `debug_group_index`
    pub fn is_group_selectable(&self, group: usize) -> bool {
        self.shared.config.read().group_enabled(group)
    }

    pub fn set_group_udta(&self, group: usize, udta: Option<GroupUserData>) -> Result<()> {
        self.shared.group(group)?.set_udta(udta);
        Ok(())
    }

    pub fn get_group_udta(&self, group: usize) -> Option<GroupUserData> {
        self.shared.group(group).ok()?.udta()
    }

    pub fn get_num_qualities(&self, group: usize) -> Result<usize> {
        Ok(self.shared.group(group)?.num_qualities())
    }

    pub fn get_quality_info(&self, group: usize, index: usize) -> Result<QualityInfo> {
        self.shared
            .group(group)?
            .quality(index)
            .ok_or(Error::InvalidRepresentation { group, index })
    }

    /// Active representation of a group
    pub fn get_active_quality(&self, group: usize) -> Result<usize> {
        Ok(self.shared.group(group)?.active_representation())
    }

    /// Bandwidth estimate of a group in bps
    pub fn get_download_rate(&self, group: usize) -> Result<u64> {
        Ok(self.shared.group(group)?.download_rate())
    }

    /// Step every selected group one representation up or down
    pub fn switch_quality(&self, up: bool, immediate: bool) -> Result<()> {
        self.send(ControlRequest::SwitchQuality { up, immediate })
    }

    /// Make a representation active in a group
    pub fn group_select_quality(&self, group: usize, quality: QualityRef<'_>) -> Result<()> {
        let shared = self.shared.group(group)?;
        let index = match quality {
            QualityRef::Index(index) if index < shared.num_qualities() => index,
            QualityRef::Index(index) => return Err(Error::InvalidRepresentation { group, index }),
            QualityRef::Id(id) => shared
                .qualities()
                .iter()
                .position(|q| q.id == id)
                .ok_or(Error::InvalidRepresentation {
                    group,
                    index: usize::MAX,
                })?,
        };
        self.send(ControlRequest::SelectQuality {
            group,
            index,
            force: false,
        })
    }

    pub fn set_group_done(&self, group: usize, done: bool) -> Result<()> {
        self.shared.group(group)?;
        self.send(ControlRequest::SetGroupDone { group, done })
    }

    // ========================================================================
    // Periods and timeline
    // ========================================================================

    pub fn get_period_switch_status(&self) -> PeriodSwitchStatus {
        self.shared.switch_status()
    }

    /// Ask for the next period to start
    pub fn request_period_switch(&self) -> Result<()> {
        self.send(ControlRequest::RequestPeriodSwitch)
    }

    pub fn in_period_setup(&self) -> bool {
        self.shared.in_setup.load(Ordering::Acquire)
    }

    pub fn in_last_period(&self) -> bool {
        match self.shared.manifest.read().as_ref() {
            Some(manifest) => {
                self.shared.period_index.load(Ordering::Acquire) + 1 >= manifest.periods.len()
            }
            None => true,
        }
    }

    pub fn period_state(&self) -> PeriodState {
        self.shared
            .period_state
            .lock()
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(PeriodState::Idle)
    }

    /// Subscribe to period state changes of the open session
    pub fn subscribe_period_state(&self) -> Option<watch::Receiver<PeriodState>> {
        self.shared.period_state.lock().clone()
    }

    pub fn get_duration(&self) -> Option<Duration> {
        self.manifest().ok()?.duration()
    }

    /// Start of the current period on the presentation timeline
    pub fn get_period_start(&self) -> Duration {
        self.manifest()
            .map(|m| m.period_start(self.shared.period_index.load(Ordering::Acquire)))
            .unwrap_or_default()
    }

    pub fn get_period_duration(&self) -> Option<Duration> {
        self.manifest()
            .ok()?
            .period_duration(self.shared.period_index.load(Ordering::Acquire))
    }

    pub fn is_dynamic_mpd(&self) -> bool {
        self.manifest().is_ok_and(|m| m.is_dynamic())
    }

    pub fn get_min_buffer_time(&self) -> Duration {
        self.manifest().map(|m| m.min_buffer_time).unwrap_or_default()
    }

    pub fn get_url(&self) -> Option<Url> {
        self.shared.url.read().clone()
    }

    /// Distance from the live position to playback (dynamic only)
    pub fn get_timeshift_buffer_pos(&self) -> Duration {
        Duration::from_millis(self.shared.timeshift_ms.load(Ordering::Relaxed))
    }

    /// Local clock minus server clock, in milliseconds
    pub fn get_utc_drift_estimate(&self) -> i64 {
        self.shared.clock.lock().drift_ms()
    }

    /// Buffering target and lowest buffered duration across selected groups
    pub fn get_buffer_info(&self) -> BufferInfo {
        let media_buffer_ms = self
            .shared
            .groups
            .read()
            .iter()
            .filter(|g| g.is_selected())
            .map(|g| g.with_buffer(|b| b.buffered_duration()).as_millis() as u64)
            .min()
            .unwrap_or(0);
        BufferInfo {
            total_buffer_ms: self.shared.buffer_target_ms.load(Ordering::Relaxed),
            media_buffer_ms,
        }
    }

    /// Seek to a presentation time
    ///
    /// Static presentations may switch period; live ones reposition inside the
    /// timeshift window of the current period.
    #[instrument(skip(self))]
    pub fn seek(&self, time: Duration) -> Result<()> {
        let manifest = self.manifest()?;
        if !manifest.is_dynamic() {
            let target = manifest
                .period_index_at(time)
                .unwrap_or(manifest.periods.len() - 1);
            if target != self.shared.period_index.load(Ordering::Acquire) {
                // Players must stop consuming before this call returns
                self.shared
                    .switch_status
                    .store(PeriodSwitchStatus::InProgress.code(), Ordering::Release);
            }
        }
        self.send(ControlRequest::Seek(time))
    }

    /// Check the download position against the segment window announced by
    /// the host (segment names as served)
    pub async fn resync_to_segment(
        &self,
        latest: &str,
        earliest: Option<&str>,
    ) -> Result<ResyncOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlRequest::Resync {
            latest: latest.to_string(),
            earliest: earliest.map(str::to_string),
            reply,
        })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn config(&self) -> DashConfig {
        self.shared.config()
    }

    /// Replace the configuration of a running session
    pub fn set_config(&self, config: DashConfig) -> Result<()> {
        self.update_config(|c| *c = config)
    }

    fn update_config(&self, update: impl FnOnce(&mut DashConfig)) -> Result<()> {
        let mut config = self.shared.config();
        update(&mut config);
        config.validate()?;
        self.shared.clock.lock().set_shift_ms(config.utc_shift_ms);
        *self.shared.config.write() = config;
        match self.send(ControlRequest::ConfigChanged) {
            Err(Error::NotOpen) => Ok(()),
            other => other,
        }
    }

    pub fn set_user_buffer(&self, ms: u64) -> Result<()> {
        self.update_config(|c| c.user_buffer_time_ms = ms)
    }

    pub fn set_idle_interval(&self, ms: u64) -> Result<()> {
        self.update_config(|c| c.idle_interval_ms = ms)
    }

    /// Restrict selection to one group (-1 = all)
    pub fn debug_group(&self, index: i32) -> Result<()> {
        self.update_config(|c| c.debug_group_index = index)
    }

    pub fn enable_utc_drift_compensation(&self, enable: bool) -> Result<()> {
        self.update_config(|c| c.enable_utc_drift_compensation = enable)
    }

    pub fn set_utc_shift(&self, shift_ms: i64) -> Result<()> {
        self.update_config(|c| c.utc_shift_ms = shift_ms)
    }

    pub fn set_max_resolution(&self, width: u32, height: u32, bpp: u32) -> Result<()> {
        self.update_config(|c| {
            c.max_width = width;
            c.max_height = height;
            c.max_bpp = bpp;
        })
    }

    pub fn set_automatic_switching(&self, auto_switch_count: u32) -> Result<()> {
        self.update_config(|c| c.auto_switch_count = auto_switch_count)
    }

    pub fn set_switching_probe_count(&self, count: u32) -> Result<()> {
        self.update_config(|c| c.abr.probe_times_before_switch = count)
    }

    pub fn set_agressive_adaptation(&self, aggressive: bool) -> Result<()> {
        self.update_config(|c| c.abr.aggressive = aggressive)
    }

    pub fn set_speed(&self, speed: f64) -> Result<()> {
        self.update_config(|c| c.speed = speed)
    }
}

impl Drop for DashSession {
    fn drop(&mut self) {
        if let Some(handle) = self.control.get_mut().take() {
            handle.cancel.cancel();
        }
    }
}

/// What woke the control task
enum Wakeup {
    Cancelled,
    Request(Option<ControlRequest>),
    Outcome(Option<DownloadOutcome>),
    Timer,
}

/// The control task of an open session
struct ControlLoop {
    shared: Arc<SessionShared>,
    manifest: Arc<Manifest>,
    periods: PeriodManager,
    groups: Vec<GroupController>,
    /// One worker per group, same order as `groups`
    workers: Vec<GroupWorker>,
    results_tx: mpsc::UnboundedSender<DownloadOutcome>,
    results_rx: mpsc::UnboundedReceiver<DownloadOutcome>,
    requests: mpsc::UnboundedReceiver<ControlRequest>,
    cancel: CancellationToken,
    buffering: BufferingState,
    last_refresh: Instant,
    refresh_forced: bool,
    /// CreatePlayback was delivered for the current groups
    playback_created: bool,
}

impl ControlLoop {
    async fn run(mut self) {
        debug!(session_id = %self.shared.id, "Control task started");
        loop {
            self.tick().await;
            if self.periods.is_terminated() {
                break;
            }

            let wait = self.next_wakeup();
            let wakeup = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wakeup::Cancelled,
                request = self.requests.recv() => Wakeup::Request(request),
                outcome = self.results_rx.recv() => Wakeup::Outcome(outcome),
                _ = tokio::time::sleep(wait) => Wakeup::Timer,
            };
            match wakeup {
                Wakeup::Cancelled | Wakeup::Request(None) => break,
                Wakeup::Request(Some(request)) => self.handle_request(request),
                Wakeup::Outcome(Some(outcome)) => self.handle_outcome(outcome),
                Wakeup::Outcome(None) | Wakeup::Timer => {}
            }
        }

        self.teardown_groups().await;
        self.periods.terminate();
        self.shared.in_setup.store(false, Ordering::Release);
        debug!(session_id = %self.shared.id, "Control task stopped");
    }

    fn next_wakeup(&self) -> Duration {
        let idle = Duration::from_millis(self.shared.config.read().idle_interval_ms);
        let now = Instant::now();
        self.groups
            .iter()
            .filter(|g| g.shared().is_selected() && !g.has_pending() && !g.is_done())
            .filter_map(|g| g.retry_at())
            .map(|at| at.saturating_duration_since(now))
            .min()
            .map_or(idle, |wait| wait.min(idle))
    }

    fn live_window(&self) -> Option<LiveWindow> {
        PeriodContext::from_manifest(&self.manifest, self.periods.current())
            .live_window(self.shared.clock.lock().now())
    }

    fn emit_all(&self, events: Vec<DashEvent>) {
        for event in &events {
            self.shared.notify(event);
        }
    }

    async fn tick(&mut self) {
        loop {
            match self.periods.state() {
                PeriodState::SetupPending => self.setup_period().await,
                PeriodState::SwitchRequested | PeriodState::Switching => self.switch_period().await,
                PeriodState::Active => break,
                _ => return,
            }
        }

        if self.refresh_due() {
            if let Err(e) = self.refresh_manifest().await {
                warn!(error = %e, "Manifest refresh failed");
            }
        }

        let mut events = Vec::new();
        self.dispatch_jobs(&mut events);
        if let Some(window) = self.live_window() {
            let mut reported = false;
            for group in self.groups.iter_mut().filter(|g| g.shared().is_selected()) {
                group.update_timeshift(&window, &mut events);
                if !reported {
                    self.shared
                        .timeshift_ms
                        .store(group.timeshift_position(&window), Ordering::Relaxed);
                    reported = true;
                }
            }
        }
        self.update_buffering(&mut events);
        self.emit_all(events);

        let groups: Vec<Arc<GroupShared>> = self.groups.iter().map(|g| g.shared().clone()).collect();
        let next = self.periods.current() + 1;
        if next < self.manifest.periods.len() && period_drained(&groups) {
            info!(period = self.periods.current(), next, "Period drained, moving on");
            if let Err(e) = self.periods.request_switch(next, Duration::ZERO, false) {
                warn!(error = %e, "Implicit period switch refused");
            }
        }
    }

    fn dispatch_jobs(&mut self, events: &mut Vec<DashEvent>) {
        let now = Instant::now();
        let window = self.live_window();
        for (group, worker) in self.groups.iter_mut().zip(&self.workers) {
            if let Some(job) = group.next_job(now, window.as_ref(), events) {
                debug!(group = group.index(), url = %job.url, init = job.is_init(), "Download dispatched");
                if let Err(e) = worker.submit(job) {
                    warn!(group = group.index(), error = %e, "Group worker gone");
                }
            }
        }
    }

    fn update_buffering(&mut self, events: &mut Vec<DashEvent>) {
        let levels: Vec<GroupLevel> = self
            .groups
            .iter()
            .filter(|g| g.shared().is_selected())
            .map(|g| g.shared().with_buffer(|b| GroupLevel::of(b)))
            .collect();
        if self.shared.config.read().enable_buffering {
            match self.buffering.update(&levels) {
                Some(BufferingChange::Progress { buffered, target }) => {
                    self.shared
                        .buffer_target_ms
                        .store(target.as_millis() as u64, Ordering::Relaxed);
                    events.push(DashEvent::Buffering {
                        buffered_ms: buffered.as_millis() as u64,
                        target_ms: target.as_millis() as u64,
                    });
                }
                Some(BufferingChange::Done) => {
                    info!("Buffering done");
                    events.push(DashEvent::BufferDone);
                }
                None => {}
            }
        } else {
            self.buffering.stop();
        }
        let active = self.buffering.is_active();
        for group in &self.groups {
            group.shared().with_buffer(|b| b.set_buffering(active));
        }
    }

    fn fail_setup(&mut self, error: Error) {
        warn!(period = self.periods.current(), error = %error, "Period setup failed");
        self.shared.notify(&DashEvent::PeriodSetupError {
            code: error.error_code().to_string(),
            message: error.to_string(),
        });
        self.periods.terminate();
        self.shared.in_setup.store(false, Ordering::Release);
    }

    /// Build, select, start and announce the groups of the current period
    #[instrument(skip(self), fields(period = self.periods.current()))]
    async fn setup_period(&mut self) {
        let period = self.periods.current();
        self.shared.in_setup.store(true, Ordering::Release);
        self.shared.period_index.store(period, Ordering::Release);
        if let Err(e) = self.periods.begin_setup() {
            self.fail_setup(e);
            return;
        }

        let config = self.shared.config();
        let now = self.shared.clock.lock().now();
        let Some(sets) = self.manifest.periods.get(period).map(|p| p.adaptation_sets.len()) else {
            self.fail_setup(Error::NoSuchPeriod(period));
            return;
        };
        let built: Result<Vec<GroupController>> = (0..sets)
            .map(|index| {
                GroupController::new(index, &self.manifest, period, &config, self.shared.io.as_ref(), now)
            })
            .collect();
        let mut groups = match built {
            Ok(groups) if !groups.is_empty() => groups,
            Ok(_) => {
                self.fail_setup(Error::PeriodSetup(format!("period {period} has no adaptation set")));
                return;
            }
            Err(e) => {
                self.fail_setup(Error::PeriodSetup(e.to_string()));
                return;
            }
        };

        // Default selection: every enabled group not excluded by an earlier one
        let mut excluded = vec![false; groups.len()];
        for group in &groups {
            let index = group.index();
            if excluded[index] || !config.group_enabled(index) {
                continue;
            }
            group.shared().set_selected(true);
            for &alternate in group.shared().alternates() {
                if let Some(flag) = excluded.get_mut(alternate) {
                    *flag = true;
                }
            }
        }

        *self.shared.groups.write() = groups.iter().map(|g| g.shared().clone()).collect();
        self.shared.notify(&DashEvent::SelectGroups);

        let window = self.live_window();
        let start = self.periods.start_position();
        for group in &mut groups {
            group.start(window.as_ref(), start, &config);
        }
        self.workers = groups
            .iter()
            .map(|g| {
                GroupWorker::spawn(
                    g.index(),
                    self.shared.io.clone(),
                    self.results_tx.clone(),
                    self.cancel.child_token(),
                )
            })
            .collect();
        self.groups = groups;

        if let Err(e) = self.shared.emit(&DashEvent::CreatePlayback) {
            self.teardown_groups().await;
            self.fail_setup(e);
            return;
        }
        self.playback_created = true;

        self.buffering
            .set_user_buffer(Duration::from_millis(config.user_buffer_time_ms));
        if config.enable_buffering {
            self.buffering.start();
        }
        if let Err(e) = self.periods.activate() {
            self.fail_setup(e);
            return;
        }
        self.shared.in_setup.store(false, Ordering::Release);
        self.last_refresh = Instant::now();
        info!(period, groups = self.groups.len(), "Period active");
    }

    /// Tear the current groups down and move to the pending period
    async fn switch_period(&mut self) {
        if self.periods.state() == PeriodState::SwitchRequested {
            if let Err(e) = self.periods.begin_switch() {
                warn!(error = %e, "Cannot start period switch");
                self.periods.terminate();
                return;
            }
        }
        self.teardown_groups().await;
        match self.periods.finish_switch() {
            Ok(next) if next < self.manifest.periods.len() => {
                info!(period = next, "Switching period");
            }
            Ok(next) => self.fail_setup(Error::NoSuchPeriod(next)),
            Err(e) => self.fail_setup(e),
        }
    }

    /// Stop workers, drop in-flight results and flush every group
    async fn teardown_groups(&mut self) {
        if self.playback_created {
            self.shared.notify(&DashEvent::DestroyPlayback);
            self.playback_created = false;
        }
        for worker in self.workers.drain(..) {
            worker.shutdown().await;
        }

        let keep_files = self.shared.config.read().keep_files;
        let io = self.shared.io.as_ref();
        while let Ok(outcome) = self.results_rx.try_recv() {
            if let Ok(resource) = outcome.result {
                if !resource.local && !keep_files {
                    io.delete_cache_file(&resource.cache_name);
                }
            }
        }
        for group in self.groups.drain(..) {
            group.shared().with_buffer(|b| b.flush(io, false));
            if !keep_files {
                for init in group.init_cache_entries().filter(|i| !i.local) {
                    io.delete_cache_file(&init.cache_name);
                }
            }
        }
        self.shared.groups.write().clear();
        self.buffering.stop();
        debug!(period = self.periods.current(), "Groups torn down");
    }

    fn refresh_due(&self) -> bool {
        if !self.manifest.is_dynamic() {
            return false;
        }
        if self.manifest.is_local() && !self.shared.config.read().allow_local_mpd_update {
            return false;
        }
        if self.refresh_forced {
            return true;
        }
        self.manifest
            .minimum_update_period
            .is_some_and(|period| self.last_refresh.elapsed() >= period)
    }

    #[instrument(skip(self))]
    async fn refresh_manifest(&mut self) -> Result<()> {
        self.refresh_forced = false;
        self.last_refresh = Instant::now();
        let url = self
            .shared
            .url
            .read()
            .clone()
            .unwrap_or_else(|| self.manifest.location.clone());
        let manifest = self.shared.load_manifest(&url).await?;

        let current = self.periods.current();
        let period_id = self.manifest.periods.get(current).and_then(|p| p.id.clone());
        let period = period_id
            .and_then(|id| manifest.periods.iter().position(|p| p.id.as_deref() == Some(id.as_str())))
            .unwrap_or_else(|| current.min(manifest.periods.len() - 1));

        let now = self.shared.clock.lock().now();
        for group in &mut self.groups {
            if let Err(e) = group.refresh(&manifest, period, now) {
                warn!(group = group.index(), error = %e, "Group kept its previous schedule");
            }
        }
        *self.shared.manifest.write() = Some(manifest.clone());
        self.manifest = manifest;
        debug!(period, "Manifest refreshed");
        Ok(())
    }

    fn handle_outcome(&mut self, outcome: DownloadOutcome) {
        let DownloadOutcome { group, job, result } = outcome;
        let config = self.shared.config.read().clone();
        if config.enable_utc_drift_compensation {
            if let Ok(FetchedResource {
                server_time: Some(server),
                completed_at,
                ..
            }) = &result
            {
                self.shared.clock.lock().set_server_time(*server, *completed_at);
            }
        }

        let io = self.shared.io.as_ref();
        let Some(controller) = self.groups.get_mut(group) else {
            if let Ok(resource) = result {
                if !resource.local && !config.keep_files {
                    io.delete_cache_file(&resource.cache_name);
                }
            }
            return;
        };
        let utc_now = self.shared.clock.lock().now();
        let mut events = Vec::new();
        controller.on_outcome(job, result, utc_now, io, &mut events);
        self.update_buffering(&mut events);
        self.emit_all(events);
    }

    fn abort_worker(&self, group: usize) {
        if let Some(worker) = self.workers.get(group) {
            worker.abort_current();
        }
    }

    fn handle_request(&mut self, request: ControlRequest) {
        let io = self.shared.io.clone();
        let mut events = Vec::new();
        match request {
            ControlRequest::Wake => {}
            ControlRequest::Seek(time) => self.seek(time),
            ControlRequest::SwitchQuality { up, immediate } => {
                for i in 0..self.groups.len() {
                    if !self.groups[i].shared().is_selected() {
                        continue;
                    }
                    match self.groups[i].step_quality(up, immediate, io.as_ref(), &mut events) {
                        Ok(true) => self.abort_worker(i),
                        Ok(false) => {}
                        Err(e) => warn!(group = i, error = %e, "Quality switch refused"),
                    }
                }
            }
            ControlRequest::SelectQuality { group, index, force } => {
                let result = match self.groups.get_mut(group) {
                    Some(controller) => controller.switch_quality(index, force, io.as_ref(), &mut events),
                    None => Err(Error::InvalidGroup(group)),
                };
                match result {
                    Ok(true) => self.abort_worker(group),
                    Ok(false) => {}
                    Err(e) => warn!(group, error = %e, "Quality selection refused"),
                }
            }
            ControlRequest::RequestPeriodSwitch => {
                let next = self.periods.current() + 1;
                if next < self.manifest.periods.len() {
                    if let Err(e) = self.periods.request_switch(next, Duration::ZERO, false) {
                        warn!(error = %e, "Period switch refused");
                    }
                } else {
                    debug!("Already in the last period");
                }
            }
            ControlRequest::SetGroupDone { group, done } => {
                if let Some(controller) = self.groups.get_mut(group) {
                    controller.set_done(done);
                }
            }
            ControlRequest::Resync {
                latest,
                earliest,
                reply,
            } => {
                let outcome = self.resync(&latest, earliest.as_deref());
                let _ = reply.send(outcome);
            }
            ControlRequest::ConfigChanged => {
                let config = self.shared.config();
                self.buffering
                    .set_user_buffer(Duration::from_millis(config.user_buffer_time_ms));
                if !config.enable_utc_drift_compensation {
                    self.shared.clock.lock().reset_drift();
                }
                for group in &mut self.groups {
                    group.apply_config(&config, io.as_ref(), &mut events);
                    if !config.group_enabled(group.index()) {
                        group.shared().set_selected(false);
                    }
                }
            }
        }
        self.emit_all(events);
    }

    fn seek(&mut self, time: Duration) {
        let io = self.shared.io.clone();
        let current = self.periods.current();

        let position = match self.live_window() {
            Some(window) => window.clip(time),
            None => {
                let target = self
                    .manifest
                    .period_index_at(time)
                    .unwrap_or(self.manifest.periods.len() - 1);
                let offset = time.saturating_sub(self.manifest.period_start(target));
                if target != current {
                    info!(from = current, to = target, "Seek crosses a period boundary");
                    if let Err(e) = self.periods.request_switch(target, offset, true) {
                        warn!(error = %e, "Seek period switch refused");
                        self.shared
                            .switch_status
                            .store(PeriodSwitchStatus::None.code(), Ordering::Release);
                    }
                    return;
                }
                offset
            }
        };

        info!(position_ms = position.as_millis() as u64, "Seeking");
        for i in 0..self.groups.len() {
            if self.groups[i].seek(position, io.as_ref()) {
                self.abort_worker(i);
            }
        }
        if self.shared.config.read().enable_buffering {
            self.buffering.start();
        }
    }

    fn resync(&mut self, latest: &str, earliest: Option<&str>) -> Result<ResyncOutcome> {
        let mut result = None;
        for i in 0..self.groups.len() {
            if !self.groups[i].shared().is_selected() {
                continue;
            }
            let Some(outcome) = self.groups[i].resync(latest, earliest) else {
                continue;
            };
            match outcome {
                ResyncOutcome::Jumped { .. } => {
                    if self.groups[i].cancel_pending() {
                        self.abort_worker(i);
                    }
                }
                ResyncOutcome::Refreshed | ResyncOutcome::LoopDetected => {
                    self.refresh_forced = true;
                }
                ResyncOutcome::TooEarly | ResyncOutcome::InRange => {}
            }
            result.get_or_insert(outcome);
        }
        result.ok_or_else(|| Error::Resync(format!("{latest} matches no group template")))
    }
}
