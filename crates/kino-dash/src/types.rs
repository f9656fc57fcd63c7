//! Core types for Kino DASH

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Unique identifier for a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns quality tier name
    pub fn quality_name(&self) -> &'static str {
        match self.height {
            0..=240 => "240p",
            241..=360 => "360p",
            361..=480 => "480p",
            481..=720 => "720p",
            721..=1080 => "1080p",
            1081..=1440 => "1440p",
            _ => "4K",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Inclusive byte range inside a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// How the first representation of each group is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstSelectMode {
    /// Worst quality ranking
    LowestQuality,
    /// Best quality ranking
    HighestQuality,
    /// Smallest declared bandwidth
    #[default]
    LowestBandwidth,
    /// Largest declared bandwidth
    HighestBandwidth,
}

impl std::fmt::Display for FirstSelectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirstSelectMode::LowestQuality => write!(f, "lowest-quality"),
            FirstSelectMode::HighestQuality => write!(f, "highest-quality"),
            FirstSelectMode::LowestBandwidth => write!(f, "lowest-bandwidth"),
            FirstSelectMode::HighestBandwidth => write!(f, "highest-bandwidth"),
        }
    }
}

/// Period switch status as seen by the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodSwitchStatus {
    #[default]
    None,
    /// A switch has been asked for and will happen at the next tick
    Requested,
    /// Groups are being torn down; players must stop consuming
    InProgress,
}

impl PeriodSwitchStatus {
    /// Numeric code (0 none, 1 requested, 2 in progress)
    pub fn code(&self) -> u8 {
        match self {
            PeriodSwitchStatus::None => 0,
            PeriodSwitchStatus::Requested => 1,
            PeriodSwitchStatus::InProgress => 2,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => PeriodSwitchStatus::Requested,
            2 => PeriodSwitchStatus::InProgress,
            _ => PeriodSwitchStatus::None,
        }
    }
}

impl std::fmt::Display for PeriodSwitchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeriodSwitchStatus::None => write!(f, "none"),
            PeriodSwitchStatus::Requested => write!(f, "requested"),
            PeriodSwitchStatus::InProgress => write!(f, "in-progress"),
        }
    }
}

/// Period lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeriodState {
    /// No manifest loaded
    Idle,
    /// Manifest loaded, period groups not yet built
    SetupPending,
    /// Groups built, init segments downloading
    SettingUp,
    /// Segments flowing
    Active,
    /// Switch asked for, groups still running
    SwitchRequested,
    /// Groups being torn down
    Switching,
    /// Presentation over or setup failed
    Terminated,
}

impl PeriodState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: PeriodState) -> bool {
        use PeriodState::*;
        matches!(
            (self, target),
            // From Idle
            (Idle, SetupPending) |
            // From SetupPending
            (SetupPending, SettingUp) | (SetupPending, Terminated) |
            // From SettingUp
            (SettingUp, Active) | (SettingUp, Terminated) |
            // From Active
            (Active, SwitchRequested) | (Active, Switching) | (Active, Terminated) |
            // From SwitchRequested
            (SwitchRequested, Switching) | (SwitchRequested, Active) | (SwitchRequested, Terminated) |
            // From Switching
            (Switching, SetupPending) | (Switching, Terminated) |
            // From Terminated
            (Terminated, Idle)
        )
    }
}

impl std::fmt::Display for PeriodState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeriodState::Idle => write!(f, "idle"),
            PeriodState::SetupPending => write!(f, "setup-pending"),
            PeriodState::SettingUp => write!(f, "setting-up"),
            PeriodState::Active => write!(f, "active"),
            PeriodState::SwitchRequested => write!(f, "switch-requested"),
            PeriodState::Switching => write!(f, "switching"),
            PeriodState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Description of one representation, as reported to the player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityInfo {
    /// Representation id
    pub id: String,
    /// Declared bandwidth in bps
    pub bandwidth: u64,
    /// MIME type
    pub mime: Option<String>,
    /// Codec string
    pub codecs: Option<String>,
    /// Video resolution
    pub resolution: Option<Resolution>,
    /// Frame rate
    pub frame_rate: Option<f64>,
    /// Audio sample rate
    pub sample_rate: Option<u32>,
    /// Audio channel count
    pub channels: Option<u32>,
    /// Quality ranking (lower is better)
    pub quality_ranking: Option<u32>,
    /// Average segment duration
    pub average_duration: Duration,
    /// Currently the active representation of its group
    pub is_selected: bool,
    /// Excluded by device constraints or codec support
    pub disabled: bool,
}

/// Buffer occupancy in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    /// Configured buffering target
    pub total_buffer_ms: u64,
    /// Lowest buffered duration across selected groups
    pub media_buffer_ms: u64,
}

/// Where the player finds the next segment of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLocation {
    /// Local cache name (or local file path)
    pub cache_name: String,
    /// Byte range inside the cache file, when the segment shares a file
    pub byte_range: Option<ByteRange>,
    /// URL the segment was fetched from
    pub original_url: Url,
    /// Segment start time relative to the period start
    pub start_time: Duration,
    /// Segment duration
    pub duration: Duration,
    /// Representation this segment belongs to
    pub representation_index: usize,
    /// Set when the representation differs from the previously consumed segment
    pub switching_index: Option<usize>,
    /// Init segment cache name of the new representation on a switch
    pub switching_init: Option<String>,
    /// Init segment byte range of the new representation on a switch
    pub switching_init_range: Option<ByteRange>,
}

/// Result of an explicit segment resync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncOutcome {
    /// Our next segment is the one right after the latest known one
    TooEarly,
    /// Our position is within the advertised window
    InRange,
    /// We were late and jumped to the latest segment
    Jumped { number: u64 },
    /// Too far off, a manifest refresh was forced
    Refreshed,
    /// The server numbering restarted, a refresh was forced
    LoopDetected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_state_transitions() {
        assert!(PeriodState::Idle.can_transition_to(PeriodState::SetupPending));
        assert!(PeriodState::SettingUp.can_transition_to(PeriodState::Active));
        assert!(PeriodState::Active.can_transition_to(PeriodState::Switching));
        assert!(PeriodState::Switching.can_transition_to(PeriodState::SetupPending));

        assert!(!PeriodState::Idle.can_transition_to(PeriodState::Active));
        assert!(!PeriodState::Switching.can_transition_to(PeriodState::Active));
        assert!(!PeriodState::Terminated.can_transition_to(PeriodState::Active));
    }

    #[test]
    fn test_switch_status_codes() {
        for status in [
            PeriodSwitchStatus::None,
            PeriodSwitchStatus::Requested,
            PeriodSwitchStatus::InProgress,
        ] {
            assert_eq!(PeriodSwitchStatus::from_code(status.code()), status);
        }
        assert_eq!(PeriodSwitchStatus::from_code(9), PeriodSwitchStatus::None);
    }

    #[test]
    fn test_byte_range() {
        let range = ByteRange::new(100, 199);
        assert_eq!(range.len(), 100);
        assert_eq!(range.to_string(), "100-199");
    }
}
