//! Segment scheduling
//!
//! Handles:
//! - Explicit segment lists (optionally looping)
//! - `$Number$` templates with a constant duration
//! - `$Time$` / `SegmentTimeline` templates with `@r` expansion
//! - Reverse lookups (time to index, name to number) and cursor re-anchoring
//!   after a manifest refresh
//!
//! A [`RepresentationSchedule`] is built from an immutable manifest snapshot
//! and never mutated; the group controller owns the cursor.

mod live;
mod template;

pub use live::{Availability, LiveWindow, TUNE_IN_NEXT_SEGMENT_MARGIN};
pub use template::{Identifier, TemplateArgs, TemplatePart, UrlTemplate};

use crate::{
    manifest::{Manifest, SegmentAddressing, SegmentUrl, TimelineEntry},
    types::ByteRange,
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Convert timescale ticks to a duration
pub fn ticks_to_duration(ticks: u64, timescale: u64) -> Duration {
    let timescale = timescale.max(1) as u128;
    let nanos = ticks as u128 * 1_000_000_000 / timescale;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// Convert a duration to timescale ticks, rounding to the nearest tick
pub fn duration_to_ticks(duration: Duration, timescale: u64) -> u64 {
    let timescale = timescale.max(1) as u128;
    let ticks = (duration.as_nanos() * timescale + 500_000_000) / 1_000_000_000;
    ticks.min(u64::MAX as u128) as u64
}

/// Timing context of the period a schedule belongs to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodContext {
    /// Period start on the presentation timeline
    pub start: Duration,
    pub duration: Option<Duration>,
    pub dynamic: bool,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub time_shift_buffer_depth: Option<Duration>,
    pub min_buffer_time: Duration,
    pub suggested_presentation_delay: Option<Duration>,
}

impl PeriodContext {
    pub fn from_manifest(manifest: &Manifest, period_index: usize) -> Self {
        Self {
            start: manifest.period_start(period_index),
            duration: manifest.period_duration(period_index),
            dynamic: manifest.is_dynamic(),
            availability_start_time: manifest.availability_start_time,
            time_shift_buffer_depth: manifest.time_shift_buffer_depth,
            min_buffer_time: manifest.min_buffer_time,
            suggested_presentation_delay: manifest.suggested_presentation_delay,
        }
    }

    /// Live window at `now`, None for static presentations
    pub fn live_window(&self, now: DateTime<Utc>) -> Option<LiveWindow> {
        if !self.dynamic {
            return None;
        }
        Some(LiveWindow {
            now,
            availability_start_time: self.availability_start_time?,
            period_start: self.start,
            time_shift_buffer_depth: self.time_shift_buffer_depth,
            presentation_delay: self.min_buffer_time
                + self.suggested_presentation_delay.unwrap_or_default(),
        })
    }
}

/// One resolved segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Position in the representation's segment sequence
    pub index: u64,
    /// `$Number$` of the segment
    pub number: u64,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    /// Start relative to the period start
    pub start: Duration,
    pub duration: Duration,
    /// Start in timescale units (`$Time$`)
    pub media_time: u64,
}

/// Initialization segment location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSegment {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
}

/// What identifies a segment across manifest refreshes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentAnchor {
    pub number: u64,
    pub media_time: u64,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
}

impl From<&SegmentDescriptor> for SegmentAnchor {
    fn from(segment: &SegmentDescriptor) -> Self {
        Self {
            number: segment.number,
            media_time: segment.media_time,
            url: segment.url.clone(),
            byte_range: segment.byte_range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimelineSegment {
    time: u64,
    duration: u64,
}

#[derive(Debug, Clone)]
enum ScheduleKind {
    List {
        timescale: u64,
        duration: u64,
        start_number: u64,
        initialization: Option<SegmentUrl>,
        segments: Vec<SegmentUrl>,
        looping: bool,
    },
    Number {
        media: UrlTemplate,
        initialization: Option<UrlTemplate>,
        timescale: u64,
        duration: u64,
        start_number: u64,
        presentation_time_offset: u64,
    },
    Timeline {
        media: UrlTemplate,
        initialization: Option<UrlTemplate>,
        timescale: u64,
        start_number: u64,
        presentation_time_offset: u64,
        segments: Vec<TimelineSegment>,
    },
}

/// Resolved addressing of one representation within one period
#[derive(Debug, Clone)]
pub struct RepresentationSchedule {
    representation_id: String,
    bandwidth: u64,
    base: Url,
    period: PeriodContext,
    kind: ScheduleKind,
}

/// Expand `S` entries, `@r < 0` runs until the next explicit start or `horizon`
fn expand_timeline(entries: &[TimelineEntry], horizon: Option<u64>) -> Vec<TimelineSegment> {
    let mut out = Vec::new();
    let mut time = 0u64;
    for (i, entry) in entries.iter().enumerate() {
        if let Some(start) = entry.start {
            time = start;
        }
        if entry.duration == 0 {
            continue;
        }
        let repeat = if entry.repeat >= 0 {
            entry.repeat as u64
        } else {
            let until = entries
                .get(i + 1)
                .and_then(|next| next.start)
                .or(horizon)
                .unwrap_or(time + entry.duration);
            until.saturating_sub(time).div_ceil(entry.duration).saturating_sub(1)
        };
        for _ in 0..=repeat {
            out.push(TimelineSegment {
                time,
                duration: entry.duration,
            });
            time += entry.duration;
        }
    }
    out
}

impl RepresentationSchedule {
    /// Build the schedule of one representation
    ///
    /// `now` bounds open-ended timeline runs of dynamic presentations.
    pub fn new(
        manifest: &Manifest,
        period_index: usize,
        set_index: usize,
        rep_index: usize,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let period = manifest
            .periods
            .get(period_index)
            .ok_or(Error::NoSuchPeriod(period_index))?;
        let set = period
            .adaptation_sets
            .get(set_index)
            .ok_or(Error::InvalidGroup(set_index))?;
        let rep = set
            .representations
            .get(rep_index)
            .ok_or(Error::InvalidRepresentation {
                group: set_index,
                index: rep_index,
            })?;

        let context = PeriodContext::from_manifest(manifest, period_index);
        let base = manifest.representation_base(period, set, rep)?;

        let kind = match &rep.addressing {
            SegmentAddressing::List(list) => ScheduleKind::List {
                timescale: list.timescale.max(1),
                duration: list.duration,
                start_number: list.start_number,
                initialization: list.initialization.clone(),
                segments: list.segments.clone(),
                looping: list.looping,
            },
            SegmentAddressing::Template(template) => {
                let timescale = template.timescale.max(1);
                let media = UrlTemplate::parse(&template.media)?;
                let initialization = template
                    .initialization
                    .as_deref()
                    .map(UrlTemplate::parse)
                    .transpose()?;
                match (&template.timeline, template.duration) {
                    (Some(timeline), _) => {
                        let horizon = context
                            .duration
                            .map(|d| {
                                template.presentation_time_offset + duration_to_ticks(d, timescale)
                            })
                            .or_else(|| {
                                let window = context.live_window(now)?;
                                Some(
                                    template.presentation_time_offset
                                        + duration_to_ticks(window.elapsed(), timescale),
                                )
                            });
                        ScheduleKind::Timeline {
                            media,
                            initialization,
                            timescale,
                            start_number: template.start_number,
                            presentation_time_offset: template.presentation_time_offset,
                            segments: expand_timeline(&timeline.entries, horizon),
                        }
                    }
                    (None, Some(duration)) if duration > 0 => ScheduleKind::Number {
                        media,
                        initialization,
                        timescale,
                        duration,
                        start_number: template.start_number,
                        presentation_time_offset: template.presentation_time_offset,
                    },
                    _ => {
                        return Err(Error::InvalidManifest(format!(
                            "template of representation {} has neither duration nor timeline",
                            rep.id
                        )))
                    }
                }
            }
        };

        Ok(Self {
            representation_id: rep.id.clone(),
            bandwidth: rep.bandwidth,
            base,
            period: context,
            kind,
        })
    }

    pub fn representation_id(&self) -> &str {
        &self.representation_id
    }

    pub fn period(&self) -> &PeriodContext {
        &self.period
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Media template, for template addressing
    pub fn media_template(&self) -> Option<&UrlTemplate> {
        match &self.kind {
            ScheduleKind::Number { media, .. } | ScheduleKind::Timeline { media, .. } => Some(media),
            ScheduleKind::List { .. } => None,
        }
    }

    pub fn start_number(&self) -> u64 {
        match &self.kind {
            ScheduleKind::List { start_number, .. }
            | ScheduleKind::Number { start_number, .. }
            | ScheduleKind::Timeline { start_number, .. } => *start_number,
        }
    }

    /// Explicit list that restarts once exhausted
    pub fn is_looping(&self) -> bool {
        matches!(self.kind, ScheduleKind::List { looping: true, .. })
    }

    fn args(&self, number: Option<u64>, time: Option<u64>) -> TemplateArgs<'_> {
        TemplateArgs {
            representation_id: &self.representation_id,
            number,
            time,
            bandwidth: Some(self.bandwidth),
        }
    }

    /// Number of segments, None when unbounded (live without period end)
    pub fn segment_count(&self) -> Option<u64> {
        match &self.kind {
            ScheduleKind::List { segments, .. } => Some(segments.len() as u64),
            ScheduleKind::Timeline { segments, .. } => Some(segments.len() as u64),
            ScheduleKind::Number {
                timescale, duration, ..
            } => {
                let period = self.period.duration?;
                Some(duration_to_ticks(period, *timescale).div_ceil(*duration))
            }
        }
    }

    /// Average segment duration
    pub fn segment_duration(&self) -> Duration {
        match &self.kind {
            ScheduleKind::List {
                timescale,
                duration,
                segments,
                ..
            } => {
                if *duration > 0 {
                    ticks_to_duration(*duration, *timescale)
                } else {
                    match (self.period.duration, segments.len()) {
                        (Some(period), n) if n > 0 => period / n as u32,
                        _ => Duration::ZERO,
                    }
                }
            }
            ScheduleKind::Number {
                timescale, duration, ..
            } => ticks_to_duration(*duration, *timescale),
            ScheduleKind::Timeline {
                timescale,
                segments,
                ..
            } => {
                if segments.is_empty() {
                    return Duration::ZERO;
                }
                let total: u64 = segments.iter().map(|s| s.duration).sum();
                ticks_to_duration(total / segments.len() as u64, *timescale)
            }
        }
    }

    /// Resolve the segment at `index`, None past the end
    pub fn segment(&self, index: u64) -> Result<Option<SegmentDescriptor>> {
        if let Some(count) = self.segment_count() {
            if index >= count {
                return Ok(None);
            }
        }
        let descriptor = match &self.kind {
            ScheduleKind::List {
                timescale,
                start_number,
                segments,
                ..
            } => {
                let entry = &segments[index as usize];
                let duration = self.segment_duration();
                let step = duration_to_ticks(duration, *timescale);
                let url = match &entry.media {
                    Some(media) => self.base.join(media)?,
                    None => self.base.clone(),
                };
                SegmentDescriptor {
                    index,
                    number: start_number + index,
                    url,
                    byte_range: entry.range,
                    start: duration * index as u32,
                    duration,
                    media_time: step * index,
                }
            }
            ScheduleKind::Number {
                media,
                timescale,
                duration,
                start_number,
                presentation_time_offset,
                ..
            } => {
                let number = start_number + index;
                let media_time = presentation_time_offset + index * duration;
                let path = media.resolve(&self.args(Some(number), Some(media_time)));
                SegmentDescriptor {
                    index,
                    number,
                    url: self.base.join(&path)?,
                    byte_range: None,
                    start: ticks_to_duration(index * duration, *timescale),
                    duration: ticks_to_duration(*duration, *timescale),
                    media_time,
                }
            }
            ScheduleKind::Timeline {
                media,
                timescale,
                start_number,
                presentation_time_offset,
                segments,
                ..
            } => {
                let segment = segments[index as usize];
                let number = start_number + index;
                let path = media.resolve(&self.args(Some(number), Some(segment.time)));
                SegmentDescriptor {
                    index,
                    number,
                    url: self.base.join(&path)?,
                    byte_range: None,
                    start: ticks_to_duration(
                        segment.time.saturating_sub(*presentation_time_offset),
                        *timescale,
                    ),
                    duration: ticks_to_duration(segment.duration, *timescale),
                    media_time: segment.time,
                }
            }
        };
        Ok(Some(descriptor))
    }

    /// Initialization segment, if the representation has one
    pub fn init_segment(&self) -> Result<Option<InitSegment>> {
        match &self.kind {
            ScheduleKind::List { initialization, .. } => {
                let Some(init) = initialization else {
                    return Ok(None);
                };
                let url = match &init.media {
                    Some(media) => self.base.join(media)?,
                    None => self.base.clone(),
                };
                Ok(Some(InitSegment {
                    url,
                    byte_range: init.range,
                }))
            }
            ScheduleKind::Number { initialization, .. }
            | ScheduleKind::Timeline { initialization, .. } => {
                let Some(init) = initialization else {
                    return Ok(None);
                };
                let path = init.resolve(&self.args(None, None));
                Ok(Some(InitSegment {
                    url: self.base.join(&path)?,
                    byte_range: None,
                }))
            }
        }
    }

    /// Index of the segment containing `time` (relative to the period start)
    ///
    /// Times past the last known segment map to None.
    pub fn index_for_time(&self, time: Duration) -> Option<u64> {
        let index = match &self.kind {
            ScheduleKind::List { .. } => {
                let duration = self.segment_duration();
                if duration.is_zero() {
                    0
                } else {
                    (time.as_nanos() / duration.as_nanos()) as u64
                }
            }
            ScheduleKind::Number {
                timescale, duration, ..
            } => duration_to_ticks(time, *timescale) / duration,
            ScheduleKind::Timeline {
                timescale,
                presentation_time_offset,
                segments,
                ..
            } => {
                let ticks = presentation_time_offset + duration_to_ticks(time, *timescale);
                let after = segments.partition_point(|s| s.time <= ticks);
                if after == 0 {
                    return if segments.is_empty() { None } else { Some(0) };
                }
                let candidate = &segments[after - 1];
                if ticks >= candidate.time + candidate.duration && after == segments.len() {
                    return None;
                }
                (after - 1) as u64
            }
        };
        match self.segment_count() {
            Some(count) if index >= count => None,
            _ => Some(index),
        }
    }

    /// Index of a previously scheduled segment in this (refreshed) schedule
    pub fn locate(&self, anchor: &SegmentAnchor) -> Option<u64> {
        match &self.kind {
            ScheduleKind::Number { start_number, .. } => anchor.number.checked_sub(*start_number),
            ScheduleKind::Timeline { segments, .. } => {
                let index = segments.partition_point(|s| s.time < anchor.media_time);
                (index < segments.len()).then_some(index as u64)
            }
            ScheduleKind::List { segments, .. } => segments
                .iter()
                .position(|entry| {
                    let url = match &entry.media {
                        Some(media) => self.base.join(media).ok(),
                        None => Some(self.base.clone()),
                    };
                    url.as_ref() == Some(&anchor.url) && entry.range == anchor.byte_range
                })
                .map(|i| i as u64),
        }
    }

    /// Live tune-in index
    ///
    /// Starts `shift` behind the live position, clipped into the availability
    /// window.
    pub fn live_start_index(&self, window: &LiveWindow, shift: Duration) -> u64 {
        let target = window.clip(window.elapsed().saturating_sub(shift));
        let mut index = match self.index_for_time(target) {
            Some(index) => index,
            None => self.segment_count().map(|c| c.saturating_sub(1)).unwrap_or(0),
        };
        if let ScheduleKind::Number {
            timescale, duration, ..
        } = &self.kind
        {
            let next_start = ticks_to_duration((index + 1) * duration, *timescale);
            if next_start.saturating_sub(target) <= TUNE_IN_NEXT_SEGMENT_MARGIN
                && self.segment_count().map_or(true, |c| index + 1 < c)
            {
                index += 1;
            }
        }
        index
    }

    /// Index of the first segment still inside the timeshift window
    pub fn earliest_available_index(&self, window: &LiveWindow) -> u64 {
        self.index_for_time(window.window_start()).unwrap_or(0)
    }

    /// Index of the last segment completely available at the live edge
    pub fn live_edge_index(&self, window: &LiveWindow) -> Option<u64> {
        let edge = window.live_edge();
        let index = self.index_for_time(edge).or_else(|| self.segment_count()?.checked_sub(1))?;
        let segment = self.segment(index).ok()??;
        if segment.start + segment.duration <= edge {
            Some(index)
        } else {
            index.checked_sub(1)
        }
    }
}
