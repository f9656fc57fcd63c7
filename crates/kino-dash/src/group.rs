//! Group controller
//!
//! Coordinates, for one adaptation set of the current period:
//! - Representation schedules and the download cursor
//! - Rate adaptation through a [`RepresentationSelector`]
//! - Job dispatch and handling of download outcomes
//! - Live tune-in, timeshift expiry, manifest refresh and resync
//!
//! The controller lives on the session control task. What the player reads
//! from other threads sits in [`GroupShared`].

use crate::{
    abr::{apply_device_constraints, initial_pick, RepresentationSelector, SwitchDecision},
    buffer::{BufferedSegment, GroupBuffer, InitLocation},
    config::DashConfig,
    download::{DownloadJob, FailureAction, FailureTracker, FetchedResource, JobKind},
    events::DashEvent,
    io::{CodecQuery, DashIo},
    manifest::Manifest,
    scheduler::{
        Availability, LiveWindow, RepresentationSchedule, SegmentAnchor, SegmentDescriptor,
        TemplateArgs,
    },
    types::{ByteRange, QualityInfo, ResyncOutcome},
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Opaque value the host attaches to a group
pub type GroupUserData = Arc<dyn Any + Send + Sync>;

/// Segments a resync tolerates behind the latest one when no earliest is given
const RESYNC_DEFAULT_RANGE: i64 = 4;
/// How far behind the earliest segment a resync still jumps instead of refreshing
const RESYNC_JUMP_MARGIN: u64 = 5;

/// Group state visible to the player thread
pub struct GroupShared {
    index: usize,
    buffer: Mutex<GroupBuffer>,
    selected: AtomicBool,
    active: AtomicUsize,
    qualities: RwLock<Vec<QualityInfo>>,
    /// Bandwidth estimate (bps)
    download_rate: AtomicU64,
    switch_forced: AtomicBool,
    /// Start of the next segment to download (ms, period relative)
    next_start_ms: AtomicU64,
    /// Alternate groups deselected when this one is selected
    alternates: Vec<usize>,
    udta: Mutex<Option<GroupUserData>>,
}

impl std::fmt::Debug for GroupShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupShared")
            .field("index", &self.index)
            .field("selected", &self.is_selected())
            .field("active", &self.active_representation())
            .field("alternates", &self.alternates)
            .finish_non_exhaustive()
    }
}

impl GroupShared {
    fn new(
        index: usize,
        buffer: GroupBuffer,
        qualities: Vec<QualityInfo>,
        active: usize,
        alternates: Vec<usize>,
    ) -> Self {
        Self {
            index,
            buffer: Mutex::new(buffer),
            selected: AtomicBool::new(false),
            active: AtomicUsize::new(active),
            qualities: RwLock::new(qualities),
            download_rate: AtomicU64::new(0),
            switch_forced: AtomicBool::new(false),
            next_start_ms: AtomicU64::new(0),
            alternates,
            udta: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_selected(&self) -> bool {
        self.selected.load(Ordering::Acquire)
    }

    pub(crate) fn set_selected(&self, selected: bool) {
        self.selected.store(selected, Ordering::Release);
    }

    /// Groups excluded by selecting this one
    pub fn alternates(&self) -> &[usize] {
        &self.alternates
    }

    pub fn active_representation(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn qualities(&self) -> Vec<QualityInfo> {
        self.qualities.read().clone()
    }

    pub fn num_qualities(&self) -> usize {
        self.qualities.read().len()
    }

    pub fn quality(&self, index: usize) -> Option<QualityInfo> {
        self.qualities.read().get(index).cloned()
    }

    /// Bandwidth estimate in bps
    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    /// Was the representation switched with already buffered data dropped
    pub fn switch_forced(&self) -> bool {
        self.switch_forced.load(Ordering::Acquire)
    }

    pub(crate) fn clear_switch_forced(&self) {
        self.switch_forced.store(false, Ordering::Release);
    }

    pub fn next_segment_start(&self) -> Duration {
        Duration::from_millis(self.next_start_ms.load(Ordering::Relaxed))
    }

    /// Run `f` with the group buffer locked
    pub fn with_buffer<T>(&self, f: impl FnOnce(&mut GroupBuffer) -> T) -> T {
        f(&mut self.buffer.lock())
    }

    pub fn set_udta(&self, udta: Option<GroupUserData>) {
        *self.udta.lock() = udta;
    }

    pub fn udta(&self) -> Option<GroupUserData> {
        self.udta.lock().clone()
    }

    fn publish(&self, qualities: &[QualityInfo], active: usize) {
        *self.qualities.write() = qualities.to_vec();
        self.active.store(active, Ordering::Release);
    }
}

/// Timeshift distance used at live tune-in
///
/// `initial_time_shift_percent` of the timeshift depth when set, else the
/// user buffer capped to the depth.
pub fn tune_in_shift(config: &DashConfig, window: &LiveWindow) -> Duration {
    let depth = window.time_shift_buffer_depth.unwrap_or_default();
    if config.initial_time_shift_percent > 0 {
        depth.mul_f64(f64::from(config.initial_time_shift_percent.min(100)) / 100.0)
    } else {
        Duration::from_millis(config.user_buffer_time_ms).min(depth)
    }
}

/// Decide how to react to the segment window advertised by the host
///
/// `next_number` is the number we are about to download.
pub fn resync_decision(
    next_number: u64,
    start_number: u64,
    latest: u64,
    earliest: Option<u64>,
) -> ResyncOutcome {
    let diff = next_number as i64 - latest as i64;
    if diff == 1 {
        return ResyncOutcome::TooEarly;
    }
    let range_in = match earliest {
        Some(earliest) => latest as i64 - earliest as i64,
        None => RESYNC_DEFAULT_RANGE,
    };
    if latest <= start_number {
        return ResyncOutcome::LoopDetected;
    }
    if diff < 0 {
        if diff + range_in >= 0 {
            return ResyncOutcome::InRange;
        }
        if let Some(earliest) = earliest {
            if next_number + RESYNC_JUMP_MARGIN >= earliest {
                return ResyncOutcome::Jumped { number: latest };
            }
        }
    }
    ResyncOutcome::Refreshed
}

fn build_schedules(
    manifest: &Manifest,
    period_index: usize,
    group: usize,
    count: usize,
    now: DateTime<Utc>,
) -> Result<Vec<RepresentationSchedule>> {
    (0..count)
        .map(|rep| RepresentationSchedule::new(manifest, period_index, group, rep, now))
        .collect()
}

/// Controller of one group
pub struct GroupController {
    index: usize,
    shared: Arc<GroupShared>,
    schedules: Vec<RepresentationSchedule>,
    qualities: Vec<QualityInfo>,
    selector: RepresentationSelector,
    failures: FailureTracker,
    /// Index of the next segment to download in the active schedule
    cursor: u64,
    /// Period relative start of that segment
    next_start: Duration,
    init_cache: HashMap<usize, InitLocation>,
    pending: Option<DownloadJob>,
    retry_at: Option<Instant>,
    /// Bumped whenever in-flight work must be ignored
    epoch: u64,
    dynamic: bool,
    keep_files: bool,
    cache_duration: Duration,
    min_buffer_time: Duration,
    /// The schedule wrapped, flag the next buffered segment
    pending_loop: bool,
    last_timeshift_secs: Option<u64>,
}

impl GroupController {
    /// Build the controller of adaptation set `index` of a period
    ///
    /// Applies device constraints and host codec support, then the initial
    /// representation pick.
    pub fn new(
        index: usize,
        manifest: &Manifest,
        period_index: usize,
        config: &DashConfig,
        io: &dyn DashIo,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let period = manifest
            .periods
            .get(period_index)
            .ok_or(Error::NoSuchPeriod(period_index))?;
        let set = period
            .adaptation_sets
            .get(index)
            .ok_or(Error::InvalidGroup(index))?;
        if set.representations.is_empty() {
            return Err(Error::NoSuitableRepresentation { group: index });
        }

        let schedules = build_schedules(manifest, period_index, index, set.representations.len(), now)?;
        let mut qualities: Vec<QualityInfo> = set
            .representations
            .iter()
            .zip(&schedules)
            .map(|(rep, schedule)| QualityInfo {
                id: rep.id.clone(),
                bandwidth: rep.bandwidth,
                mime: rep.mime_type.clone().or_else(|| set.mime_type.clone()),
                codecs: rep.codecs.clone(),
                resolution: rep.resolution,
                frame_rate: rep.frame_rate,
                sample_rate: rep.sample_rate,
                channels: rep.channels,
                quality_ranking: rep.quality_ranking,
                average_duration: schedule.segment_duration(),
                is_selected: false,
                disabled: false,
            })
            .collect();
        Self::constrain(&mut qualities, config, io);

        let mut selector = RepresentationSelector::new(config);
        let active = selector
            .start(config.first_select_mode, &qualities)
            .ok_or(Error::NoSuitableRepresentation { group: index })?;
        qualities[active].is_selected = true;

        let alternates = period
            .adaptation_sets
            .iter()
            .enumerate()
            .filter(|(other, other_set)| *other != index && set.excludes(other_set))
            .map(|(other, _)| other)
            .collect();

        let cache_duration = Duration::from_millis(config.max_cache_duration_ms);
        let mut buffer = GroupBuffer::new(index, config.keep_files);
        buffer.configure(
            cache_duration,
            manifest.min_buffer_time,
            schedules[active].segment_duration(),
        );

        info!(
            group = index,
            representations = qualities.len(),
            active = %qualities[active].id,
            bandwidth = qualities[active].bandwidth,
            "Group created"
        );

        let shared = Arc::new(GroupShared::new(
            index,
            buffer,
            qualities.clone(),
            active,
            alternates,
        ));

        Ok(Self {
            index,
            shared,
            schedules,
            qualities,
            selector,
            failures: FailureTracker::new(
                Duration::from_millis(config.min_timeout_between_404_ms),
                Duration::from_millis(config.segment_expire_after_ms),
                config.max_consecutive_failures,
            ),
            cursor: 0,
            next_start: Duration::ZERO,
            init_cache: HashMap::new(),
            pending: None,
            retry_at: None,
            epoch: 0,
            dynamic: manifest.is_dynamic(),
            keep_files: config.keep_files,
            cache_duration,
            min_buffer_time: manifest.min_buffer_time,
            pending_loop: false,
            last_timeshift_secs: None,
        })
    }

    fn constrain(qualities: &mut [QualityInfo], config: &DashConfig, io: &dyn DashIo) {
        apply_device_constraints(
            qualities,
            config.max_width,
            config.max_height,
            config.max_bpp,
            |q| {
                io.codec_supported(&CodecQuery {
                    mime: q.mime.as_deref(),
                    codecs: q.codecs.as_deref(),
                    resolution: q.resolution,
                    frame_rate: q.frame_rate,
                    sample_rate: q.sample_rate,
                    channels: q.channels,
                })
            },
        );
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn shared(&self) -> &Arc<GroupShared> {
        &self.shared
    }

    pub fn active(&self) -> usize {
        self.selector.active()
    }

    pub fn qualities(&self) -> &[QualityInfo] {
        &self.qualities
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// `$Number$` of the next segment to download
    pub fn next_number(&self) -> u64 {
        self.schedules[self.active()].start_number() + self.cursor
    }

    pub fn next_start(&self) -> Duration {
        self.next_start
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn is_done(&self) -> bool {
        self.shared.with_buffer(|b| b.is_done())
    }

    pub fn set_done(&mut self, done: bool) {
        self.shared.with_buffer(|b| b.set_done(done));
        if done {
            self.retry_at = None;
        }
    }

    fn mark_done(&mut self) {
        info!(group = self.index, "Group reached end of stream");
        self.set_done(true);
    }

    fn set_cursor(&mut self, cursor: u64) {
        self.cursor = cursor;
        if let Ok(Some(segment)) = self.schedules[self.active()].segment(cursor) {
            self.next_start = segment.start;
        }
        self.shared
            .next_start_ms
            .store(self.next_start.as_millis() as u64, Ordering::Relaxed);
    }

    /// Move the cursor to the segment of the active schedule containing `time`
    fn relocate(&mut self, time: Duration) {
        let schedule = &self.schedules[self.active()];
        let cursor = schedule
            .index_for_time(time)
            .or_else(|| schedule.segment_count())
            .unwrap_or(self.cursor);
        self.set_cursor(cursor);
    }

    /// Position the cursor for the first download
    ///
    /// `window` is the live window of dynamic presentations; static ones start
    /// at `start` (period relative).
    #[instrument(skip(self, window, config), fields(group = self.index))]
    pub fn start(&mut self, window: Option<&LiveWindow>, start: Duration, config: &DashConfig) {
        let active = self.active();
        match window {
            Some(window) => {
                let shift = tune_in_shift(config, window);
                let cursor = self.schedules[active].live_start_index(window, shift);
                self.set_cursor(cursor);
                info!(
                    group = self.index,
                    number = self.next_number(),
                    start_ms = self.next_start.as_millis() as u64,
                    shift_ms = shift.as_millis() as u64,
                    "Live tune-in"
                );
            }
            None => self.relocate(start),
        }
    }

    fn dispatch(&mut self, kind: JobKind, url: url::Url, range: Option<ByteRange>) -> DownloadJob {
        let job = DownloadJob {
            epoch: self.epoch,
            kind,
            url,
            range,
        };
        self.pending = Some(job.clone());
        job
    }

    /// Next download of this group, if one is due
    pub fn next_job(
        &mut self,
        now: Instant,
        window: Option<&LiveWindow>,
        events: &mut Vec<DashEvent>,
    ) -> Option<DownloadJob> {
        if self.pending.is_some() || !self.shared.is_selected() || self.is_done() {
            return None;
        }
        if let Some(at) = self.retry_at {
            if now < at {
                return None;
            }
            self.retry_at = None;
        }

        let active = self.active();
        if !self.init_cache.contains_key(&active) {
            match self.schedules[active].init_segment() {
                Ok(Some(init)) => {
                    return Some(self.dispatch(
                        JobKind::Init {
                            representation: active,
                        },
                        init.url,
                        init.byte_range,
                    ))
                }
                Ok(None) => {}
                Err(e) => warn!(group = self.index, error = %e, "Cannot resolve init segment"),
            }
        }

        let segment = loop {
            let segment = match self.schedules[active].segment(self.cursor) {
                Ok(Some(segment)) => segment,
                Ok(None) => {
                    if self.schedules[active].is_looping() && self.cursor > 0 {
                        info!(group = self.index, "Segment list exhausted, looping");
                        self.pending_loop = true;
                        self.set_cursor(0);
                        continue;
                    }
                    // Live timelines grow with the next manifest refresh
                    if !self.dynamic {
                        self.mark_done();
                    }
                    return None;
                }
                Err(e) => {
                    warn!(group = self.index, index = self.cursor, error = %e, "Cannot resolve segment, skipping");
                    self.set_cursor(self.cursor + 1);
                    return None;
                }
            };

            let Some(window) = window else {
                break segment;
            };
            match window.availability(&segment) {
                Availability::Available => break segment,
                Availability::NotYet(wait) => {
                    debug!(
                        group = self.index,
                        number = segment.number,
                        wait_ms = wait.as_millis() as u64,
                        "Segment not yet available"
                    );
                    self.retry_at = Some(now + wait);
                    return None;
                }
                Availability::Expired => {
                    let earliest = self.schedules[active]
                        .earliest_available_index(window)
                        .max(self.cursor + 1);
                    warn!(
                        group = self.index,
                        number = segment.number,
                        jump_to = earliest,
                        "Segment fell out of the timeshift buffer"
                    );
                    events.push(DashEvent::TimeshiftOverflow { group: self.index });
                    self.set_cursor(earliest);
                }
            }
        };

        if !self.shared.with_buffer(|b| b.admit(segment.duration)) {
            return None;
        }

        let url = segment.url.clone();
        let range = segment.byte_range;
        Some(self.dispatch(
            JobKind::Media {
                representation: active,
                segment,
            },
            url,
            range,
        ))
    }

    fn discard_resource(&self, io: &dyn DashIo, resource: &FetchedResource) {
        if !resource.local && !self.keep_files {
            io.delete_cache_file(&resource.cache_name);
        }
    }

    /// Handle the result of a job
    ///
    /// Returns true when a media segment was added to the buffer.
    pub fn on_outcome(
        &mut self,
        job: DownloadJob,
        result: Result<FetchedResource>,
        utc_now: DateTime<Utc>,
        io: &dyn DashIo,
        events: &mut Vec<DashEvent>,
    ) -> bool {
        if job.epoch != self.epoch {
            if let Ok(resource) = &result {
                self.discard_resource(io, resource);
            }
            debug!(group = self.index, epoch = job.epoch, "Stale download ignored");
            return false;
        }
        self.pending = None;

        match (job.kind, result) {
            (JobKind::Init { representation }, Ok(resource)) => {
                debug!(group = self.index, representation, cache = %resource.cache_name, "Init segment ready");
                self.init_cache.insert(
                    representation,
                    InitLocation {
                        cache_name: resource.cache_name,
                        byte_range: if resource.local { job.range } else { None },
                        local: resource.local,
                    },
                );
                false
            }
            (JobKind::Init { .. }, Err(error)) => {
                self.on_init_failure(error, utc_now, events);
                false
            }
            (JobKind::Media { representation, segment }, Ok(resource)) => {
                self.on_segment(representation, segment, resource, job.range, io, events)
            }
            (JobKind::Media { segment, .. }, Err(error)) => {
                self.on_segment_failure(&segment, error, utc_now, events);
                false
            }
        }
    }

    fn on_init_failure(&mut self, error: Error, utc_now: DateTime<Utc>, events: &mut Vec<DashEvent>) {
        if matches!(error, Error::Aborted) {
            return;
        }
        if error.is_not_found() {
            if let FailureAction::Retry(after) = self.failures.on_not_found(utc_now, self.dynamic) {
                self.retry_at = Some(Instant::now() + after);
                return;
            }
        }
        warn!(group = self.index, error = %error, "Init segment unavailable, stopping group");
        events.push(DashEvent::DownloadError {
            group: self.index,
            code: error.error_code().to_string(),
            message: error.to_string(),
        });
        self.mark_done();
    }

    fn on_segment(
        &mut self,
        representation: usize,
        segment: SegmentDescriptor,
        resource: FetchedResource,
        range: Option<ByteRange>,
        io: &dyn DashIo,
        events: &mut Vec<DashEvent>,
    ) -> bool {
        self.failures.on_success();
        let entry = BufferedSegment {
            cache_name: resource.cache_name.clone(),
            url: segment.url.clone(),
            byte_range: if resource.local { range } else { None },
            start: segment.start,
            duration: segment.duration,
            number: segment.number,
            representation,
            init: self.init_cache.get(&representation).cloned(),
            local: resource.local,
            loop_detected: self.pending_loop,
        };
        if let Err(e) = self.shared.with_buffer(|b| b.push(entry)) {
            warn!(group = self.index, error = %e, "Downloaded segment dropped");
            self.discard_resource(io, &resource);
            return false;
        }
        self.pending_loop = false;

        if representation == self.active() {
            self.set_cursor(segment.index + 1);
        } else {
            // Switched while this segment was in flight
            self.relocate(segment.start + segment.duration);
        }
        self.next_start = segment.start + segment.duration;
        self.shared
            .next_start_ms
            .store(self.next_start.as_millis() as u64, Ordering::Relaxed);

        if !resource.local {
            if resource.bytes_per_sec > 0 {
                self.selector.record_rate(resource.bytes_per_sec);
            } else {
                self.selector.record_measurement(resource.bytes, resource.elapsed);
            }
            self.shared
                .download_rate
                .store(self.selector.bandwidth_estimate(), Ordering::Relaxed);
            if let Some(decision) = self.selector.on_segment_complete(&self.qualities) {
                self.apply_switch(decision, events);
            }
        }

        debug!(
            group = self.index,
            number = segment.number,
            bytes = resource.bytes,
            "Segment buffered"
        );
        events.push(DashEvent::SegmentAvailable { group: self.index });
        true
    }

    fn on_segment_failure(
        &mut self,
        segment: &SegmentDescriptor,
        error: Error,
        utc_now: DateTime<Utc>,
        events: &mut Vec<DashEvent>,
    ) {
        let action = match &error {
            Error::Aborted => return,
            e if e.is_not_found() => self.failures.on_not_found(utc_now, self.dynamic),
            e => {
                warn!(group = self.index, url = %segment.url, error = %e, "Segment download failed");
                if self.shared.with_buffer(|b| b.is_empty()) {
                    events.push(DashEvent::DownloadError {
                        group: self.index,
                        code: e.error_code().to_string(),
                        message: e.to_string(),
                    });
                }
                self.failures.on_error()
            }
        };
        match action {
            FailureAction::Retry(after) => {
                debug!(group = self.index, number = segment.number, retry_ms = after.as_millis() as u64, "Segment not found, retrying");
                self.retry_at = Some(Instant::now() + after);
            }
            FailureAction::Lost => {
                warn!(group = self.index, number = segment.number, url = %segment.url, "Segment lost");
                self.next_start = segment.start + segment.duration;
                self.set_cursor(segment.index + 1);
                if let Some(decision) = self.selector.degrade(&self.qualities) {
                    self.apply_switch(decision, events);
                }
            }
            FailureAction::EndOfStream => self.mark_done(),
        }
    }

    fn apply_switch(&mut self, decision: SwitchDecision, events: &mut Vec<DashEvent>) {
        let SwitchDecision { from, to, reason } = decision;
        if let Some(q) = self.qualities.get_mut(from) {
            q.is_selected = false;
        }
        self.qualities[to].is_selected = true;
        self.shared.publish(&self.qualities, to);
        self.shared.with_buffer(|b| {
            b.configure(
                self.cache_duration,
                self.min_buffer_time,
                self.schedules[to].segment_duration(),
            )
        });
        self.relocate(self.next_start);

        info!(
            group = self.index,
            from = %self.qualities[from].id,
            to = %self.qualities[to].id,
            bandwidth = self.qualities[to].bandwidth,
            ?reason,
            "Quality switch"
        );
        events.push(DashEvent::QualitySwitch {
            group: self.index,
            from,
            to,
            bandwidth: self.qualities[to].bandwidth,
        });
    }

    /// Drop the job in flight; returns true when the worker should abort it
    pub fn cancel_pending(&mut self) -> bool {
        self.epoch += 1;
        self.retry_at = None;
        self.pending.take().is_some()
    }

    /// Switch to a representation requested by the host
    ///
    /// With `force`, buffered segments after the one being played are
    /// dropped and downloading restarts right after it. Returns true when the
    /// download in flight must be aborted.
    pub fn switch_quality(
        &mut self,
        target: usize,
        force: bool,
        io: &dyn DashIo,
        events: &mut Vec<DashEvent>,
    ) -> Result<bool> {
        if target >= self.qualities.len() {
            return Err(Error::InvalidRepresentation {
                group: self.index,
                index: target,
            });
        }
        let Some(decision) = self.selector.set_active(target) else {
            return Ok(false);
        };
        self.apply_switch(decision, events);
        if !force {
            return Ok(false);
        }

        let resume = self.shared.with_buffer(|b| {
            b.flush(io, true);
            b.back().map(|s| s.end())
        });
        let abort = self.cancel_pending();
        self.relocate(resume.unwrap_or(self.next_start));
        self.shared.switch_forced.store(true, Ordering::Release);
        Ok(abort)
    }

    /// Step every selected group one representation up or down
    pub fn step_quality(
        &mut self,
        up: bool,
        force: bool,
        io: &dyn DashIo,
        events: &mut Vec<DashEvent>,
    ) -> Result<bool> {
        match crate::abr::step(&self.qualities, self.active(), up) {
            Some(target) => self.switch_quality(target, force, io, events),
            None => Ok(false),
        }
    }

    /// Reposition after a seek (period relative)
    ///
    /// Returns true when the download in flight must be aborted.
    pub fn seek(&mut self, time: Duration, io: &dyn DashIo) -> bool {
        let buffered = self.shared.with_buffer(|b| {
            matches!(b.buffered_range(), Some((start, end)) if time >= start && time < end)
        });
        if buffered {
            let dropped = self.shared.with_buffer(|b| b.drop_before(time, io));
            debug!(group = self.index, dropped, "Seek inside buffered range");
            return false;
        }

        let abort = self.cancel_pending();
        self.shared.with_buffer(|b| {
            b.flush(io, false);
            b.reset();
        });
        self.failures.on_success();
        self.relocate(time);
        info!(group = self.index, number = self.next_number(), "Group repositioned");
        abort
    }

    /// Rebuild schedules from a refreshed manifest and re-anchor the cursor
    #[instrument(skip(self, manifest), fields(group = self.index))]
    pub fn refresh(&mut self, manifest: &Manifest, period_index: usize, now: DateTime<Utc>) -> Result<()> {
        let active = self.active();
        let anchor = self.schedules[active]
            .segment(self.cursor)
            .ok()
            .flatten()
            .map(|segment| SegmentAnchor::from(&segment));
        let schedules = build_schedules(manifest, period_index, self.index, self.schedules.len(), now)?;
        self.schedules = schedules;
        self.min_buffer_time = manifest.min_buffer_time;

        let relocated = anchor.and_then(|anchor| self.schedules[active].locate(&anchor));
        match relocated {
            Some(cursor) => self.set_cursor(cursor),
            None => self.relocate(self.next_start),
        }
        debug!(group = self.index, number = self.next_number(), "Cursor re-anchored after refresh");
        Ok(())
    }

    /// Check our position against the segment window advertised by the host
    ///
    /// Names are matched against the active media template. Returns None when
    /// the names carry no recognizable `$Number$`.
    pub fn resync(&mut self, latest: &str, earliest: Option<&str>) -> Option<ResyncOutcome> {
        let active = self.active();
        let schedule = &self.schedules[active];
        let template = schedule.media_template()?;
        let args = TemplateArgs {
            representation_id: schedule.representation_id(),
            number: None,
            time: None,
            bandwidth: Some(self.qualities[active].bandwidth),
        };
        let earliest = earliest.and_then(|name| template.extract_number(name, &args));
        let latest = template.extract_number(latest, &args).or(earliest)?;
        let start_number = schedule.start_number();

        let outcome = resync_decision(self.next_number(), start_number, latest, earliest);
        match outcome {
            ResyncOutcome::Jumped { number } => {
                self.set_cursor(number.saturating_sub(start_number));
            }
            ResyncOutcome::LoopDetected => self.pending_loop = true,
            _ => {}
        }
        info!(group = self.index, latest, ?earliest, ?outcome, "Resync");
        Some(outcome)
    }

    /// Apply runtime configuration changes
    pub fn apply_config(&mut self, config: &DashConfig, io: &dyn DashIo, events: &mut Vec<DashEvent>) {
        self.selector.set_auto_switch_count(config.auto_switch_count);
        self.selector.set_disable_switching(config.disable_switching);
        self.selector.set_speed(config.speed);
        self.selector.set_aggressive(config.abr.aggressive);
        self.selector.set_probe_count(config.abr.probe_times_before_switch);
        self.failures
            .set_retry_after(Duration::from_millis(config.min_timeout_between_404_ms));
        self.failures
            .set_expire_after(Duration::from_millis(config.segment_expire_after_ms));
        self.keep_files = config.keep_files;
        self.cache_duration = Duration::from_millis(config.max_cache_duration_ms);

        Self::constrain(&mut self.qualities, config, io);
        let active = self.active();
        self.shared.with_buffer(|b| {
            b.set_keep_files(config.keep_files);
            b.configure(
                self.cache_duration,
                self.min_buffer_time,
                self.schedules[active].segment_duration(),
            );
        });
        if self.qualities[active].disabled {
            if let Some(target) = initial_pick(config.first_select_mode, &self.qualities) {
                if let Some(decision) = self.selector.set_active(target) {
                    self.apply_switch(decision, events);
                    return;
                }
            }
        }
        self.shared.publish(&self.qualities, active);
    }

    /// Distance from the live position to the playback position, in ms
    pub fn timeshift_position(&self, window: &LiveWindow) -> u64 {
        let position = self
            .shared
            .with_buffer(|b| b.front().map(|s| s.start))
            .unwrap_or(self.next_start);
        window.elapsed().saturating_sub(position).as_millis() as u64
    }

    /// Report the timeshift position when it moved by at least a second
    pub fn update_timeshift(&mut self, window: &LiveWindow, events: &mut Vec<DashEvent>) {
        let position_ms = self.timeshift_position(window);
        let secs = position_ms / 1000;
        if self.last_timeshift_secs != Some(secs) {
            self.last_timeshift_secs = Some(secs);
            events.push(DashEvent::TimeshiftUpdate {
                group: self.index,
                position_ms,
            });
        }
    }

    /// Cache entries of init segments, for teardown
    pub fn init_cache_entries(&self) -> impl Iterator<Item = &InitLocation> {
        self.init_cache.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;
    use crate::manifest::{
        AdaptationSet, ManifestType, Period, PresentationType, Representation, SegmentAddressing,
        SegmentList, SegmentTemplate, SegmentUrl,
    };
    use chrono::TimeDelta;
    use url::Url;

    fn create_test_representations() -> Vec<Representation> {
        let template = || {
            SegmentAddressing::Template(
                SegmentTemplate::numbered("$RepresentationID$/seg-$Number$.m4s", 1000, 2000)
                    .with_initialization("$RepresentationID$/init.mp4"),
            )
        };
        vec![
            Representation::new("low", 500_000, template()),
            Representation::new("high", 2_000_000, template()),
        ]
    }

    fn create_test_manifest(presentation: PresentationType) -> Manifest {
        let mut manifest = Manifest::new(
            ManifestType::Dash,
            presentation,
            Url::parse("https://cdn.example.com/show/manifest.mpd").unwrap(),
        );
        manifest.min_buffer_time = Duration::from_secs(6);
        match presentation {
            PresentationType::Static => {
                manifest.media_presentation_duration = Some(Duration::from_secs(20));
            }
            PresentationType::Dynamic => {
                manifest.availability_start_time = Some(Utc::now() - TimeDelta::seconds(100));
                manifest.time_shift_buffer_depth = Some(Duration::from_secs(30));
                manifest.min_buffer_time = Duration::from_secs(2);
            }
        }
        manifest.periods = vec![Period::new(vec![AdaptationSet::new(
            create_test_representations(),
        )])];
        manifest
    }

    fn fetched(cache_name: &str, bytes: u64, bytes_per_sec: u64) -> FetchedResource {
        FetchedResource {
            cache_name: cache_name.to_string(),
            url: Url::parse("https://cdn.example.com/x").unwrap(),
            bytes,
            elapsed: Duration::from_millis(100),
            bytes_per_sec,
            server_time: None,
            completed_at: Utc::now(),
            mime: None,
            local: false,
        }
    }

    fn controller(presentation: PresentationType, config: &DashConfig) -> GroupController {
        let manifest = create_test_manifest(presentation);
        let io = MemoryIo::new();
        let mut group = GroupController::new(0, &manifest, 0, config, &io, Utc::now()).unwrap();
        group.shared().set_selected(true);
        group
    }

    /// Dispatch and complete the init segment, return the first media job
    fn first_media_job(group: &mut GroupController, io: &MemoryIo) -> DownloadJob {
        let mut events = Vec::new();
        let init = group.next_job(Instant::now(), None, &mut events).unwrap();
        assert!(init.is_init());
        group.on_outcome(init, Ok(fetched("init", 10, 0)), Utc::now(), io, &mut events);
        group.next_job(Instant::now(), None, &mut events).unwrap()
    }

    #[test]
    fn test_init_then_media() {
        let io = MemoryIo::new();
        let mut group = controller(PresentationType::Static, &DashConfig::default());
        assert_eq!(group.active(), 0);

        let job = first_media_job(&mut group, &io);
        assert_eq!(job.url.as_str(), "https://cdn.example.com/show/low/seg-1.m4s");
        // One job in flight at a time
        assert!(group.next_job(Instant::now(), None, &mut Vec::new()).is_none());

        let mut events = Vec::new();
        assert!(group.on_outcome(job, Ok(fetched("seg1", 10_000, 0)), Utc::now(), &io, &mut events));
        assert_eq!(events, vec![DashEvent::SegmentAvailable { group: 0 }]);
        assert_eq!(group.next_number(), 2);

        let location = group.shared().with_buffer(|b| b.next_location()).unwrap();
        assert_eq!(location.cache_name, "seg1");
        assert_eq!(location.start_time, Duration::ZERO);
    }

    #[test]
    fn test_static_not_found_skips_segment() {
        let io = MemoryIo::new();
        let mut group = controller(PresentationType::Static, &DashConfig::default());
        let job = first_media_job(&mut group, &io);

        let mut events = Vec::new();
        let missing = Err(Error::SegmentNotFound { url: job.url.to_string() });
        assert!(!group.on_outcome(job, missing, Utc::now(), &io, &mut events));
        assert_eq!(group.next_number(), 2);
        assert!(group.retry_at().is_none());
    }

    #[test]
    fn test_transport_error_without_buffer_is_reported() {
        let io = MemoryIo::new();
        let mut group = controller(PresentationType::Static, &DashConfig::default());
        let job = first_media_job(&mut group, &io);

        let mut events = Vec::new();
        let failure = Err(Error::SegmentFetch {
            url: job.url.to_string(),
            reason: "connection reset".into(),
        });
        group.on_outcome(job, failure, Utc::now(), &io, &mut events);
        assert!(matches!(
            events.as_slice(),
            [DashEvent::DownloadError { group: 0, code, .. }] if code == "SEGMENT_FETCH"
        ));
        assert_eq!(group.next_number(), 2);
    }

    #[test]
    fn test_live_segment_lost_after_expiry() {
        let io = MemoryIo::new();
        let config = DashConfig {
            initial_time_shift_percent: 50,
            ..Default::default()
        };
        let manifest = create_test_manifest(PresentationType::Dynamic);
        let mut group = GroupController::new(0, &manifest, 0, &config, &io, Utc::now()).unwrap();
        group.shared().set_selected(true);

        let window = crate::scheduler::PeriodContext::from_manifest(&manifest, 0)
            .live_window(Utc::now())
            .unwrap();
        group.start(Some(&window), Duration::ZERO, &config);
        // 100s produced, 15s behind: segment around 85s (number 43)
        let start_ms = group.next_start().as_millis() as u64;
        assert!((83_000..=87_000).contains(&start_ms), "start {start_ms}");

        let mut events = Vec::new();
        let init = group.next_job(Instant::now(), Some(&window), &mut events).unwrap();
        group.on_outcome(init, Ok(fetched("init", 10, 0)), Utc::now(), &io, &mut events);
        let job = group.next_job(Instant::now(), Some(&window), &mut events).unwrap();
        let number = group.next_number();

        let t0 = Utc::now();
        let not_found = || Err(Error::SegmentNotFound { url: "x".into() });
        group.on_outcome(job.clone(), not_found(), t0, &io, &mut events);
        assert_eq!(group.next_number(), number);
        assert!(group.retry_at().is_some());

        // Same segment asked again once the live clock moved 200ms
        group.pending = Some(job.clone());
        group.on_outcome(job, not_found(), t0 + TimeDelta::milliseconds(200), &io, &mut events);
        assert_eq!(group.next_number(), number + 1);
    }

    #[test]
    fn test_forced_switch_drops_buffered_segments() {
        let io = MemoryIo::new();
        let mut group = controller(PresentationType::Static, &DashConfig::default());
        let mut events = Vec::new();

        let mut job = first_media_job(&mut group, &io);
        for n in 1..=2 {
            group.on_outcome(job, Ok(fetched(&format!("seg{n}"), 1000, 0)), Utc::now(), &io, &mut events);
            job = group.next_job(Instant::now(), None, &mut events).unwrap();
        }
        assert_eq!(group.shared().with_buffer(|b| b.len()), 2);

        events.clear();
        let abort = group.switch_quality(1, true, &io, &mut events).unwrap();
        assert!(abort);
        assert_eq!(
            events,
            vec![DashEvent::QualitySwitch { group: 0, from: 0, to: 1, bandwidth: 2_000_000 }]
        );
        assert!(group.shared().switch_forced());
        assert_eq!(group.shared().with_buffer(|b| b.len()), 1);
        // Restart right after the kept head, on the new representation
        assert_eq!(group.next_number(), 2);

        // The aborted job comes back and is ignored
        assert!(!group.on_outcome(job, Ok(fetched("seg3", 1000, 0)), Utc::now(), &io, &mut events));

        let init = group.next_job(Instant::now(), None, &mut events).unwrap();
        assert_eq!(init.url.as_str(), "https://cdn.example.com/show/high/init.mp4");
    }

    #[test]
    fn test_switch_during_download_keeps_timeline() {
        let io = MemoryIo::new();
        let mut group = controller(PresentationType::Static, &DashConfig::default());
        let mut events = Vec::new();
        let job = first_media_job(&mut group, &io);

        let abort = group.switch_quality(1, false, &io, &mut events).unwrap();
        assert!(!abort);
        assert!(group.on_outcome(job, Ok(fetched("low1", 1000, 1_000_000)), Utc::now(), &io, &mut events));
        assert_eq!(group.next_number(), 2);

        let init = group.next_job(Instant::now(), None, &mut events).unwrap();
        assert_eq!(init.url.as_str(), "https://cdn.example.com/show/high/init.mp4");
        group.on_outcome(init, Ok(fetched("high-init", 10, 1_000_000)), Utc::now(), &io, &mut events);

        let job = group.next_job(Instant::now(), None, &mut events).unwrap();
        assert_eq!(job.url.as_str(), "https://cdn.example.com/show/high/seg-2.m4s");
        group.on_outcome(job, Ok(fetched("high2", 1000, 1_000_000)), Utc::now(), &io, &mut events);

        let buffered: Vec<(usize, Duration)> = group
            .shared()
            .with_buffer(|b| b.iter().map(|s| (s.representation, s.start)).collect());
        assert_eq!(
            buffered,
            vec![(0, Duration::ZERO), (1, Duration::from_secs(2))]
        );
    }

    #[test]
    fn test_throughput_switch_relocates_cursor() {
        let io = MemoryIo::new();
        let mut group = controller(PresentationType::Static, &DashConfig::default());
        let mut events = Vec::new();
        let job = first_media_job(&mut group, &io);

        // 5 Mbps measured: 2 Mbps fits the safety margin
        group.on_outcome(job, Ok(fetched("seg1", 200_000, 625_000)), Utc::now(), &io, &mut events);
        assert!(events.contains(&DashEvent::QualitySwitch { group: 0, from: 0, to: 1, bandwidth: 2_000_000 }));
        assert_eq!(group.active(), 1);
        assert_eq!(group.shared().active_representation(), 1);
        assert_eq!(group.next_number(), 2);
        assert!(group.shared().quality(1).unwrap().is_selected);
    }

    #[test]
    fn test_looping_list() {
        let io = MemoryIo::new();
        let mut manifest = create_test_manifest(PresentationType::Static);
        let list = SegmentList {
            timescale: 1,
            duration: 2,
            segments: vec![
                SegmentUrl { media: Some("a.m4s".into()), range: None },
                SegmentUrl { media: Some("b.m4s".into()), range: None },
            ],
            looping: true,
            ..Default::default()
        };
        manifest.periods[0].adaptation_sets[0].representations =
            vec![Representation::new("list", 100_000, SegmentAddressing::List(list))];
        let config = DashConfig::default();
        let mut group = GroupController::new(0, &manifest, 0, &config, &io, Utc::now()).unwrap();
        group.shared().set_selected(true);

        let mut events = Vec::new();
        for name in ["a", "b"] {
            let job = group.next_job(Instant::now(), None, &mut events).unwrap();
            assert!(job.url.as_str().ends_with(&format!("{name}.m4s")));
            group.on_outcome(job, Ok(fetched(name, 10, 0)), Utc::now(), &io, &mut events);
            group.shared().with_buffer(|b| b.discard(&io));
        }
        let job = group.next_job(Instant::now(), None, &mut events).unwrap();
        assert!(job.url.as_str().ends_with("a.m4s"));
        group.on_outcome(job, Ok(fetched("a2", 10, 0)), Utc::now(), &io, &mut events);
        assert!(group.shared().with_buffer(|b| b.front().unwrap().loop_detected));
    }

    #[test]
    fn test_static_end_of_stream() {
        let io = MemoryIo::new();
        let config = DashConfig {
            max_cache_duration_ms: 60_000,
            ..Default::default()
        };
        let mut group = controller(PresentationType::Static, &config);
        let mut events = Vec::new();
        let mut job = first_media_job(&mut group, &io);
        // 20s of 2s segments
        for n in 1..=10 {
            group.on_outcome(job, Ok(fetched(&format!("seg{n}"), 10, 0)), Utc::now(), &io, &mut events);
            match group.next_job(Instant::now(), None, &mut events) {
                Some(next) => job = next,
                None => break,
            }
        }
        assert!(group.is_done());
        assert_eq!(group.shared().with_buffer(|b| b.num_ready()), (10, true));
    }

    #[test]
    fn test_seek_outside_buffer_repositions() {
        let io = MemoryIo::new();
        let mut group = controller(PresentationType::Static, &DashConfig::default());
        let mut events = Vec::new();
        let job = first_media_job(&mut group, &io);
        group.on_outcome(job, Ok(fetched("seg1", 10, 0)), Utc::now(), &io, &mut events);

        assert!(!group.seek(Duration::from_secs(11), &io));
        assert_eq!(group.next_number(), 6);
        assert!(group.shared().with_buffer(|b| b.is_empty()));
    }

    #[test]
    fn test_resync_decision() {
        // Next segment is right after the latest one
        assert_eq!(resync_decision(11, 1, 10, None), ResyncOutcome::TooEarly);
        // Slightly behind, within the sender window
        assert_eq!(resync_decision(8, 1, 10, Some(5)), ResyncOutcome::InRange);
        assert_eq!(resync_decision(7, 1, 10, None), ResyncOutcome::InRange);
        // Far behind but close to the earliest segment
        assert_eq!(
            resync_decision(2, 1, 20, Some(6)),
            ResyncOutcome::Jumped { number: 20 }
        );
        // Too far behind
        assert_eq!(resync_decision(2, 1, 100, Some(90)), ResyncOutcome::Refreshed);
        // Numbering restarted
        assert_eq!(resync_decision(50, 10, 3, None), ResyncOutcome::LoopDetected);
    }

    #[test]
    fn test_resync_from_segment_names() {
        let mut group = controller(PresentationType::Static, &DashConfig::default());
        let outcome = group
            .resync("low/seg-9.m4s", Some("https://cdn.example.com/show/low/seg-4.m4s"))
            .unwrap();
        assert_eq!(outcome, ResyncOutcome::Jumped { number: 9 });
        assert_eq!(group.next_number(), 9);
        assert!(group.resync("unrelated.ts", None).is_none());
    }

    #[test]
    fn test_tune_in_shift() {
        let now = Utc::now();
        let window = LiveWindow {
            now,
            availability_start_time: now - TimeDelta::seconds(100),
            period_start: Duration::ZERO,
            time_shift_buffer_depth: Some(Duration::from_secs(30)),
            presentation_delay: Duration::from_secs(2),
        };
        let config = DashConfig {
            initial_time_shift_percent: 50,
            ..Default::default()
        };
        assert_eq!(tune_in_shift(&config, &window), Duration::from_secs(15));

        let config = DashConfig {
            user_buffer_time_ms: 60_000,
            ..Default::default()
        };
        assert_eq!(tune_in_shift(&config, &window), Duration::from_secs(30));
    }
}
