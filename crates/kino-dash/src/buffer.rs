//! Segment buffering
//!
//! Handles:
//! - Per group FIFO of downloaded segments waiting for the player
//! - Count and duration bounds of the cache
//! - Cache file eviction once the player consumed a segment
//! - The session wide buffering state (`BUFFERING` / `BUFFER_DONE`)

use crate::{
    io::DashIo,
    types::{ByteRange, SegmentLocation},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Where the init segment of a representation was cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitLocation {
    pub cache_name: String,
    pub byte_range: Option<ByteRange>,
    /// Local file used in place
    pub local: bool,
}

/// Buffered segment waiting for the player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedSegment {
    /// Local cache entry (or local file path)
    pub cache_name: String,
    /// URL the segment was fetched from
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    /// Start relative to the period start
    pub start: Duration,
    pub duration: Duration,
    /// `$Number$` of the segment
    pub number: u64,
    /// Representation the segment belongs to
    pub representation: usize,
    /// Init segment of that representation
    pub init: Option<InitLocation>,
    /// Served from local storage, never deleted
    pub local: bool,
    /// First segment after the schedule wrapped around
    pub loop_detected: bool,
}

impl BufferedSegment {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Number of cache slots for a group
///
/// `ceil(max(cache duration, minBufferTime) / segment duration)`, at least one.
pub fn max_segments_in_cache(
    max_cache_duration: Duration,
    min_buffer_time: Duration,
    segment_duration: Duration,
) -> usize {
    let window = max_cache_duration.max(min_buffer_time);
    if segment_duration.is_zero() {
        return 1;
    }
    let slots = window.as_nanos().div_ceil(segment_duration.as_nanos());
    (slots as usize).max(1)
}

/// Ready queue of one group
#[derive(Debug)]
pub struct GroupBuffer {
    /// Group index, for logs and errors
    group: usize,
    segments: VecDeque<BufferedSegment>,
    max_segments: usize,
    /// Duration bound of the queue
    max_duration: Duration,
    /// Nominal segment duration of the active representation
    segment_duration: Duration,
    /// Duration of the last segment admission refused
    refused: Option<Duration>,
    buffered: Duration,
    keep_files: bool,
    /// Representation of the last consumed segment
    prev_active_rep: Option<usize>,
    done: bool,
    buffering: bool,
}

impl GroupBuffer {
    pub fn new(group: usize, keep_files: bool) -> Self {
        Self {
            group,
            segments: VecDeque::new(),
            max_segments: 1,
            max_duration: Duration::ZERO,
            segment_duration: Duration::ZERO,
            refused: None,
            buffered: Duration::ZERO,
            keep_files,
            prev_active_rep: None,
            done: false,
            buffering: false,
        }
    }

    /// Size the cache from the effective cache duration and segment duration
    pub fn configure(
        &mut self,
        max_cache_duration: Duration,
        min_buffer_time: Duration,
        segment_duration: Duration,
    ) {
        self.max_segments =
            max_segments_in_cache(max_cache_duration, min_buffer_time, segment_duration);
        self.max_duration = max_cache_duration.max(min_buffer_time);
        self.segment_duration = segment_duration;
        self.refused = None;
        debug!(
            group = self.group,
            max_segments = self.max_segments,
            max_duration_ms = self.max_duration.as_millis() as u64,
            "Group cache configured"
        );
    }

    pub fn set_keep_files(&mut self, keep_files: bool) {
        self.keep_files = keep_files;
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Duration bound of the queue
    pub fn capacity(&self) -> Duration {
        self.max_duration
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total duration of the queued segments
    pub fn buffered_duration(&self) -> Duration {
        self.buffered
    }

    /// Can a segment of this duration be admitted
    ///
    /// An empty queue always admits one segment, even one longer than the
    /// duration bound, so `buffered_duration` may exceed `capacity` by at most
    /// that single segment.
    pub fn has_room(&self, duration: Duration) -> bool {
        self.segments.is_empty()
            || (self.segments.len() < self.max_segments
                && self.buffered + duration <= self.max_duration)
    }

    /// Admission check for the next download, remembered by `is_full`
    pub fn admit(&mut self, duration: Duration) -> bool {
        let admitted = self.has_room(duration);
        self.refused = (!admitted).then_some(duration);
        admitted
    }

    /// No further segment fits
    ///
    /// Exact negation of admission for the nominal segment duration, or for
    /// the last refused one.
    pub fn is_full(&self) -> bool {
        !self.segments.is_empty()
            && (!self.has_room(self.segment_duration)
                || self.refused.is_some_and(|d| !self.has_room(d)))
    }

    /// Append a downloaded segment
    pub fn push(&mut self, segment: BufferedSegment) -> Result<()> {
        if !self.has_room(segment.duration) {
            return Err(Error::BufferOverflow { group: self.group });
        }
        self.buffered += segment.duration;
        debug!(
            group = self.group,
            number = segment.number,
            representation = segment.representation,
            buffered_ms = self.buffered.as_millis() as u64,
            "Segment buffered"
        );
        self.segments.push_back(segment);
        Ok(())
    }

    pub fn front(&self) -> Option<&BufferedSegment> {
        self.segments.front()
    }

    pub fn back(&self) -> Option<&BufferedSegment> {
        self.segments.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedSegment> {
        self.segments.iter()
    }

    /// Location of the next segment for the player
    pub fn next_location(&self) -> Result<SegmentLocation> {
        let head = self
            .segments
            .front()
            .ok_or(Error::BufferEmpty { group: self.group })?;
        let switched = self
            .prev_active_rep
            .is_some_and(|prev| prev != head.representation);
        Ok(SegmentLocation {
            cache_name: head.cache_name.clone(),
            byte_range: head.byte_range,
            original_url: head.url.clone(),
            start_time: head.start,
            duration: head.duration,
            representation_index: head.representation,
            switching_index: switched.then_some(head.representation),
            switching_init: switched
                .then(|| head.init.as_ref().map(|i| i.cache_name.clone()))
                .flatten(),
            switching_init_range: switched
                .then(|| head.init.as_ref().and_then(|i| i.byte_range))
                .flatten(),
        })
    }

    /// Pop the head once the player consumed it
    ///
    /// The cache file is deleted right away unless files are kept or the
    /// segment is a local file.
    #[instrument(skip(self, io), fields(group = self.group))]
    pub fn discard(&mut self, io: &dyn DashIo) -> Option<BufferedSegment> {
        let segment = self.segments.pop_front()?;
        self.buffered = self.buffered.saturating_sub(segment.duration);
        self.prev_active_rep = Some(segment.representation);
        self.evict(io, &segment);
        Some(segment)
    }

    fn evict(&self, io: &dyn DashIo, segment: &BufferedSegment) {
        if self.keep_files || segment.local {
            return;
        }
        io.delete_cache_file(&segment.cache_name);
        debug!(group = self.group, cache = %segment.cache_name, "Cache file evicted");
    }

    /// Drop queued segments, keeping the head when `keep_head` is set
    pub fn flush(&mut self, io: &dyn DashIo, keep_head: bool) -> Vec<BufferedSegment> {
        let keep = usize::from(keep_head).min(self.segments.len());
        let removed: Vec<BufferedSegment> = self.segments.drain(keep..).collect();
        for segment in &removed {
            self.buffered = self.buffered.saturating_sub(segment.duration);
            self.evict(io, segment);
        }
        if !removed.is_empty() {
            debug!(group = self.group, removed = removed.len(), keep_head, "Group cache flushed");
        }
        removed
    }

    /// Drop queued segments ending at or before `time` (seek inside the queue)
    pub fn drop_before(&mut self, time: Duration, io: &dyn DashIo) -> usize {
        let mut dropped = 0;
        while self.segments.front().is_some_and(|s| s.end() <= time) {
            if let Some(segment) = self.segments.pop_front() {
                self.buffered = self.buffered.saturating_sub(segment.duration);
                self.evict(io, &segment);
                dropped += 1;
            }
        }
        dropped
    }

    /// Segments ready for the player, and whether the group reached its end
    pub fn num_ready(&self) -> (usize, bool) {
        if self.buffering {
            (0, self.done)
        } else {
            (self.segments.len(), self.done)
        }
    }

    /// Presentation range covered by the queue
    pub fn buffered_range(&self) -> Option<(Duration, Duration)> {
        Some((self.segments.front()?.start, self.segments.back()?.end()))
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_done(&mut self, done: bool) {
        self.done = done;
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    pub fn set_buffering(&mut self, buffering: bool) {
        self.buffering = buffering;
    }

    /// Representation of the last consumed segment
    pub fn prev_active_rep(&self) -> Option<usize> {
        self.prev_active_rep
    }

    /// Forget the consumption history (new period, seek)
    pub fn reset(&mut self) {
        self.prev_active_rep = None;
        self.done = false;
    }
}

/// Fill level of one selected group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLevel {
    pub buffered: Duration,
    pub capacity: Duration,
    pub full: bool,
    pub done: bool,
    pub empty: bool,
}

impl GroupLevel {
    pub fn of(buffer: &GroupBuffer) -> Self {
        Self {
            buffered: buffer.buffered_duration(),
            capacity: buffer.capacity(),
            full: buffer.is_full(),
            done: buffer.is_done(),
            empty: buffer.is_empty(),
        }
    }
}

/// Change of the session buffering state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingChange {
    /// Still (or newly) buffering
    Progress { buffered: Duration, target: Duration },
    Done,
}

/// Session wide buffering state
///
/// While buffering, the groups report no segment ready. Buffering ends once
/// every selected group holds the target, is full, or is done.
#[derive(Debug, Clone, Default)]
pub struct BufferingState {
    active: bool,
    /// Player buffer target (zero = fill the cache)
    user_buffer: Duration,
    last_reported: Option<Duration>,
}

impl BufferingState {
    pub fn new(user_buffer: Duration) -> Self {
        Self {
            user_buffer,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_user_buffer(&mut self, user_buffer: Duration) {
        self.user_buffer = user_buffer;
    }

    /// Enter buffering (period start, seek)
    pub fn start(&mut self) {
        self.active = true;
        self.last_reported = None;
    }

    pub fn stop(&mut self) {
        self.active = false;
        self.last_reported = None;
    }

    fn target(&self, levels: &[GroupLevel]) -> Duration {
        if !self.user_buffer.is_zero() {
            return self.user_buffer;
        }
        levels
            .iter()
            .map(|l| l.capacity)
            .min()
            .unwrap_or_default()
    }

    /// Re-evaluate after any buffer change
    pub fn update(&mut self, levels: &[GroupLevel]) -> Option<BufferingChange> {
        let pending: Vec<&GroupLevel> = levels.iter().filter(|l| !l.done).collect();
        let target = self.target(levels);

        if !self.active {
            let underrun = !self.user_buffer.is_zero() && pending.iter().any(|l| l.empty);
            if !underrun {
                return None;
            }
            self.start();
        }

        let satisfied = pending.iter().all(|l| l.full || l.buffered >= target);
        if satisfied {
            self.stop();
            return Some(BufferingChange::Done);
        }

        let buffered = pending
            .iter()
            .map(|l| l.buffered)
            .min()
            .unwrap_or_default();
        if self.last_reported == Some(buffered) {
            return None;
        }
        self.last_reported = Some(buffered);
        Some(BufferingChange::Progress { buffered, target })
    }
}
