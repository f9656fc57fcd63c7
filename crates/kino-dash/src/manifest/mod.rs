//! Manifest model consumed by the streaming client
//!
//! The grammar (MPD XML, M3U8) lives outside this crate: a [`ManifestParser`]
//! turns fetched bytes into an immutable [`Manifest`] snapshot, which the
//! session replaces wholesale on every refresh.

mod root;

pub use root::{check_mpd_root_type, root_element_name};

use crate::{types::ByteRange, Resolution, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// MIME types announcing a DASH manifest
pub const DASH_MIME_TYPES: &[&str] = &[
    "application/dash+xml",
    "video/vnd.3gpp.mpd",
    "audio/vnd.3gpp.mpd",
    "video/vnd.mpeg.dash.mpd",
    "audio/vnd.mpeg.dash.mpd",
];

/// MIME types announcing an HLS playlist
pub const HLS_MIME_TYPES: &[&str] = &[
    "video/x-mpegurl",
    "audio/x-mpegurl",
    "application/x-mpegurl",
    "application/vnd.apple.mpegurl",
];

/// Manifest types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestType {
    Hls,
    Dash,
}

/// Static (on demand) or dynamic (live) presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationType {
    #[default]
    Static,
    Dynamic,
}

/// Parsed manifest snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Type of manifest
    pub manifest_type: ManifestType,
    /// Static or dynamic
    pub presentation: PresentationType,
    /// Where the manifest was fetched from
    pub location: Url,
    /// Manifest level BaseURL
    pub base_url: Option<String>,
    /// Program title
    pub title: Option<String>,
    /// Anchor of the live timeline
    pub availability_start_time: Option<DateTime<Utc>>,
    /// Total duration (static presentations)
    pub media_presentation_duration: Option<Duration>,
    /// Minimum buffer the client should hold
    pub min_buffer_time: Duration,
    /// Refresh interval (dynamic presentations)
    pub minimum_update_period: Option<Duration>,
    /// Depth of the timeshift window
    pub time_shift_buffer_depth: Option<Duration>,
    /// Distance to keep from the live edge
    pub suggested_presentation_delay: Option<Duration>,
    /// Ordered periods
    pub periods: Vec<Period>,
}

/// A manifest time interval with its own adaptation sets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Period {
    pub id: Option<String>,
    /// Start relative to the presentation start
    pub start: Option<Duration>,
    pub duration: Option<Duration>,
    pub base_url: Option<String>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

/// A set of interchangeable representations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptationSet {
    pub id: Option<u32>,
    /// Alternate group: 0 excludes every other set, N > 0 excludes sets
    /// sharing N, absent or negative has no effect
    pub group: Option<i32>,
    pub content_type: Option<String>,
    pub mime_type: Option<String>,
    pub lang: Option<String>,
    pub base_url: Option<String>,
    pub representations: Vec<Representation>,
}

/// One encoded variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Representation {
    pub id: String,
    /// Declared bandwidth in bps
    pub bandwidth: u64,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub mime_type: Option<String>,
    pub codecs: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    /// Lower is better
    pub quality_ranking: Option<u32>,
    pub base_url: Option<String>,
    pub addressing: SegmentAddressing,
}

/// How segments of a representation are located
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SegmentAddressing {
    /// Finite list of media URLs or byte ranges
    List(SegmentList),
    /// `$Number$` / `$Time$` template, optionally driven by a timeline
    Template(SegmentTemplate),
}

/// Explicit segment list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentList {
    pub timescale: u64,
    /// Duration of every segment in timescale units
    pub duration: u64,
    pub start_number: u64,
    pub initialization: Option<SegmentUrl>,
    pub segments: Vec<SegmentUrl>,
    /// Restart from the first entry once the list is exhausted
    pub looping: bool,
}

/// One entry of a segment list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUrl {
    /// Relative or absolute media URL (None = the representation base URL)
    pub media: Option<String>,
    pub range: Option<ByteRange>,
}

/// Segment template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentTemplate {
    pub media: String,
    pub initialization: Option<String>,
    pub timescale: u64,
    /// Constant segment duration in timescale units (number mode)
    pub duration: Option<u64>,
    pub start_number: u64,
    pub presentation_time_offset: u64,
    pub timeline: Option<SegmentTimeline>,
}

/// Run-length encoded segment timeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentTimeline {
    pub entries: Vec<TimelineEntry>,
}

/// One `S` element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Explicit start (`@t`)
    pub start: Option<u64>,
    /// Duration (`@d`)
    pub duration: u64,
    /// Extra repetitions (`@r`), negative repeats until the next entry or period end
    pub repeat: i64,
}

/// Trait for manifest parsers
pub trait ManifestParser: Send + Sync {
    /// Parse fetched manifest bytes
    fn parse(&self, content: &[u8], location: &Url) -> Result<Manifest>;
}

impl Manifest {
    /// Create an empty manifest snapshot
    pub fn new(manifest_type: ManifestType, presentation: PresentationType, location: Url) -> Self {
        Self {
            manifest_type,
            presentation,
            location,
            base_url: None,
            title: None,
            availability_start_time: None,
            media_presentation_duration: None,
            min_buffer_time: Duration::ZERO,
            minimum_update_period: None,
            time_shift_buffer_depth: None,
            suggested_presentation_delay: None,
            periods: Vec::new(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.presentation == PresentationType::Dynamic
    }

    /// Start of a period on the presentation timeline
    pub fn period_start(&self, index: usize) -> Duration {
        let mut start = Duration::ZERO;
        for (i, period) in self.periods.iter().enumerate().take(index + 1) {
            if let Some(explicit) = period.start {
                start = explicit;
            }
            if i == index {
                break;
            }
            match self.period_duration(i) {
                Some(duration) => start += duration,
                None => break,
            }
        }
        start
    }

    /// Duration of a period, when it can be known
    pub fn period_duration(&self, index: usize) -> Option<Duration> {
        let period = self.periods.get(index)?;
        if let Some(duration) = period.duration {
            return Some(duration);
        }
        let own_start = period.start.unwrap_or_else(|| {
            if index == 0 {
                Duration::ZERO
            } else {
                self.period_start(index)
            }
        });
        if let Some(next_start) = self.periods.get(index + 1).and_then(|p| p.start) {
            return Some(next_start.saturating_sub(own_start));
        }
        if index + 1 == self.periods.len() {
            return self
                .media_presentation_duration
                .map(|total| total.saturating_sub(own_start));
        }
        None
    }

    /// Index of the period containing a presentation time
    pub fn period_index_at(&self, time: Duration) -> Option<usize> {
        (0..self.periods.len()).find(|&i| {
            let start = self.period_start(i);
            match self.period_duration(i) {
                Some(duration) => time >= start && time < start + duration,
                None => time >= start,
            }
        })
    }

    /// Total presentation duration
    pub fn duration(&self) -> Option<Duration> {
        self.media_presentation_duration.or_else(|| {
            let last = self.periods.len().checked_sub(1)?;
            Some(self.period_start(last) + self.period_duration(last)?)
        })
    }

    /// Base URL of a representation, resolved through the BaseURL chain
    pub fn representation_base(
        &self,
        period: &Period,
        set: &AdaptationSet,
        rep: &Representation,
    ) -> Result<Url> {
        let mut base = self.location.clone();
        for part in [
            self.base_url.as_deref(),
            period.base_url.as_deref(),
            set.base_url.as_deref(),
            rep.base_url.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            base = base.join(part)?;
        }
        Ok(base)
    }

    /// Manifest served from the local filesystem
    pub fn is_local(&self) -> bool {
        self.location.scheme() == "file"
    }
}

impl Period {
    pub fn new(adaptation_sets: Vec<AdaptationSet>) -> Self {
        Self {
            adaptation_sets,
            ..Default::default()
        }
    }
}

impl AdaptationSet {
    pub fn new(representations: Vec<Representation>) -> Self {
        Self {
            representations,
            ..Default::default()
        }
    }

    /// Is `other` an alternate excluded by selecting this set
    pub fn excludes(&self, other: &AdaptationSet) -> bool {
        match self.group {
            Some(0) => true,
            Some(group) if group > 0 => other.group == Some(group),
            _ => false,
        }
    }
}

impl Representation {
    pub fn new(id: impl Into<String>, bandwidth: u64, addressing: SegmentAddressing) -> Self {
        Self {
            id: id.into(),
            bandwidth,
            resolution: None,
            frame_rate: None,
            mime_type: None,
            codecs: None,
            sample_rate: None,
            channels: None,
            quality_ranking: None,
            base_url: None,
            addressing,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }

    pub fn with_codecs(mut self, codecs: impl Into<String>) -> Self {
        self.codecs = Some(codecs.into());
        self
    }
}

impl SegmentTemplate {
    /// Number based template with a constant duration
    pub fn numbered(media: impl Into<String>, timescale: u64, duration: u64) -> Self {
        Self {
            media: media.into(),
            timescale,
            duration: Some(duration),
            start_number: 1,
            ..Default::default()
        }
    }

    /// Timeline based template
    pub fn timeline(media: impl Into<String>, timescale: u64, entries: Vec<TimelineEntry>) -> Self {
        Self {
            media: media.into(),
            timescale,
            start_number: 1,
            timeline: Some(SegmentTimeline { entries }),
            ..Default::default()
        }
    }

    pub fn with_initialization(mut self, init: impl Into<String>) -> Self {
        self.initialization = Some(init.into());
        self
    }
}

impl TimelineEntry {
    pub fn new(start: Option<u64>, duration: u64, repeat: i64) -> Self {
        Self {
            start,
            duration,
            repeat,
        }
    }
}

fn mime_essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// Is this a DASH manifest MIME type
pub fn is_dash_mime(mime: &str) -> bool {
    let essence = mime_essence(mime);
    DASH_MIME_TYPES.iter().any(|m| *m == essence)
}

/// Is this an HLS playlist MIME type
pub fn is_hls_mime(mime: &str) -> bool {
    let essence = mime_essence(mime);
    HLS_MIME_TYPES.iter().any(|m| *m == essence)
}

/// Detect manifest type from MIME, URL or content
pub fn detect_manifest_type(
    url: &Url,
    mime: Option<&str>,
    content: Option<&[u8]>,
) -> Option<ManifestType> {
    if let Some(mime) = mime {
        if is_dash_mime(mime) {
            return Some(ManifestType::Dash);
        }
        if is_hls_mime(mime) {
            return Some(ManifestType::Hls);
        }
    }

    // Check URL extension
    let path = url.path().to_lowercase();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        return Some(ManifestType::Hls);
    }
    if path.ends_with(".mpd") {
        return Some(ManifestType::Dash);
    }

    // Check content if available
    if let Some(content) = content {
        let head = &content[..content.len().min(1024)];
        if String::from_utf8_lossy(head).trim_start_matches('\u{feff}').trim_start().starts_with("#EXTM3U") {
            return Some(ManifestType::Hls);
        }
        if check_mpd_root_type(content) {
            return Some(ManifestType::Dash);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(id: &str, bandwidth: u64) -> Representation {
        Representation::new(
            id,
            bandwidth,
            SegmentAddressing::Template(SegmentTemplate::numbered("$RepresentationID$/$Number$.m4s", 1000, 2000)),
        )
    }

    fn create_test_manifest() -> Manifest {
        let mut manifest = Manifest::new(
            ManifestType::Dash,
            PresentationType::Static,
            Url::parse("https://cdn.example.com/live/stream.mpd").unwrap(),
        );
        manifest.media_presentation_duration = Some(Duration::from_secs(100));
        let mut first = Period::new(vec![AdaptationSet::new(vec![numbered("v1", 500_000)])]);
        first.duration = Some(Duration::from_secs(40));
        let second = Period::new(vec![AdaptationSet::new(vec![numbered("v1", 500_000)])]);
        manifest.periods = vec![first, second];
        manifest
    }

    #[test]
    fn test_period_timing() {
        let manifest = create_test_manifest();
        assert_eq!(manifest.period_start(0), Duration::ZERO);
        assert_eq!(manifest.period_start(1), Duration::from_secs(40));
        assert_eq!(manifest.period_duration(1), Some(Duration::from_secs(60)));
        assert_eq!(manifest.period_index_at(Duration::from_secs(10)), Some(0));
        assert_eq!(manifest.period_index_at(Duration::from_secs(45)), Some(1));
        assert_eq!(manifest.period_index_at(Duration::from_secs(200)), None);
        assert_eq!(manifest.duration(), Some(Duration::from_secs(100)));
    }

    #[test]
    fn test_base_url_chain() {
        let mut manifest = create_test_manifest();
        manifest.base_url = Some("https://edge.example.com/content/".into());
        let mut set = manifest.periods[0].adaptation_sets[0].clone();
        set.base_url = Some("video/".into());
        let rep = set.representations[0].clone();
        let base = manifest
            .representation_base(&manifest.periods[0], &set, &rep)
            .unwrap();
        assert_eq!(base.as_str(), "https://edge.example.com/content/video/");
    }

    #[test]
    fn test_alternate_groups() {
        let mut a = AdaptationSet::new(vec![]);
        let mut b = AdaptationSet::new(vec![]);
        let mut c = AdaptationSet::new(vec![]);
        a.group = Some(1);
        b.group = Some(1);
        c.group = Some(2);
        assert!(a.excludes(&b));
        assert!(!a.excludes(&c));

        a.group = Some(0);
        assert!(a.excludes(&c));

        a.group = Some(-1);
        assert!(!a.excludes(&b));
    }

    #[test]
    fn test_detect_manifest_type() {
        let url = Url::parse("https://example.com/manifest").unwrap();
        assert_eq!(
            detect_manifest_type(&url, Some("application/dash+xml; charset=utf-8"), None),
            Some(ManifestType::Dash)
        );
        assert_eq!(
            detect_manifest_type(&url, Some("application/vnd.apple.mpegurl"), None),
            Some(ManifestType::Hls)
        );
        assert_eq!(
            detect_manifest_type(&url, None, Some(b"#EXTM3U\n#EXT-X-VERSION:3")),
            Some(ManifestType::Hls)
        );
        assert_eq!(
            detect_manifest_type(&url, Some("text/plain"), Some(b"<?xml version=\"1.0\"?><MPD/>")),
            Some(ManifestType::Dash)
        );

        let mpd = Url::parse("https://example.com/a.mpd").unwrap();
        assert_eq!(detect_manifest_type(&mpd, None, None), Some(ManifestType::Dash));
        assert_eq!(detect_manifest_type(&url, None, Some(b"hello")), None);
    }
}
