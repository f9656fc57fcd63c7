//! Session configuration
//!
//! Everything here can be set at construction and most of it changed at
//! runtime through the session setters.

use crate::{types::FirstSelectMode, Error, Result};
use serde::{Deserialize, Serialize};

/// Rate adaptation tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    /// Fraction of the measured throughput a representation may use (0.0-1.0]
    pub throughput_safety_factor: f64,
    /// EWMA weight of the newest throughput sample
    pub ewma_alpha: f64,
    /// Consecutive up-switch decisions required before switching up
    pub probe_times_before_switch: u32,
    /// Switch up as soon as throughput allows it
    pub aggressive: bool,
    /// Number of throughput samples kept
    pub max_history: usize,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            throughput_safety_factor: 0.8,
            ewma_alpha: 0.2,
            probe_times_before_switch: 1,
            aggressive: false,
            max_history: 20,
        }
    }
}

/// Streaming session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashConfig {
    /// Target cache duration per group (ms, 0 = follow the manifest minBufferTime)
    pub max_cache_duration_ms: u64,
    /// Re-evaluate the representation every N segments (0 = every segment)
    pub auto_switch_count: u32,
    /// Keep downloaded files after the player discarded them
    pub keep_files: bool,
    /// Never switch away from the initial representation
    pub disable_switching: bool,
    /// Initial representation pick
    pub first_select_mode: FirstSelectMode,
    /// Hold segments back until the buffering target is reached
    pub enable_buffering: bool,
    /// Tune-in position inside the timeshift window (percent from the live edge)
    pub initial_time_shift_percent: u32,
    /// Control loop idle interval (ms)
    pub idle_interval_ms: u64,
    /// Player buffer target (ms, 0 = cache size)
    pub user_buffer_time_ms: u64,
    /// Delay before retrying a segment that returned 404 (ms)
    pub min_timeout_between_404_ms: u64,
    /// Time after which a missing live segment is declared lost (ms)
    pub segment_expire_after_ms: u64,
    /// Maximum video width (0 = unlimited)
    pub max_width: u32,
    /// Maximum video height (0 = unlimited)
    pub max_height: u32,
    /// Maximum bits per pixel (0 = unlimited)
    pub max_bpp: u32,
    /// Only this group is selectable (-1 = all)
    pub debug_group_index: i32,
    /// Shift applied to the availability start time (ms)
    pub utc_shift_ms: i64,
    /// Estimate the server clock from response headers
    pub enable_utc_drift_compensation: bool,
    /// Refresh manifests loaded from local files
    pub allow_local_mpd_update: bool,
    /// Playback speed, the measured download rate is divided by |speed|
    pub speed: f64,
    /// Consecutive lost segments before end-of-stream detection starts
    pub max_consecutive_failures: u32,
    /// Rate adaptation tuning
    pub abr: AbrConfig,
}

impl Default for DashConfig {
    fn default() -> Self {
        Self {
            max_cache_duration_ms: 0,
            auto_switch_count: 0,
            keep_files: false,
            disable_switching: false,
            first_select_mode: FirstSelectMode::LowestBandwidth,
            enable_buffering: true,
            initial_time_shift_percent: 0,
            idle_interval_ms: 1000,
            user_buffer_time_ms: 0,
            min_timeout_between_404_ms: 500,
            segment_expire_after_ms: 100,
            max_width: 0,
            max_height: 0,
            max_bpp: 0,
            debug_group_index: -1,
            utc_shift_ms: 0,
            enable_utc_drift_compensation: false,
            allow_local_mpd_update: false,
            speed: 1.0,
            max_consecutive_failures: 20,
            abr: AbrConfig::default(),
        }
    }
}

impl DashConfig {
    /// Load a configuration from JSON, missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DashConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.initial_time_shift_percent > 100 {
            return Err(Error::InvalidConfig(format!(
                "initial_time_shift_percent must be <= 100, got {}",
                self.initial_time_shift_percent
            )));
        }
        if !(self.speed.is_finite() && self.speed != 0.0) {
            return Err(Error::InvalidConfig(format!(
                "speed must be non-zero, got {}",
                self.speed
            )));
        }
        let safety = self.abr.throughput_safety_factor;
        if !(safety > 0.0 && safety <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "throughput_safety_factor must be in (0, 1], got {safety}"
            )));
        }
        if !(self.abr.ewma_alpha > 0.0 && self.abr.ewma_alpha <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "ewma_alpha must be in (0, 1], got {}",
                self.abr.ewma_alpha
            )));
        }
        if self.idle_interval_ms == 0 {
            return Err(Error::InvalidConfig("idle_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Is the given group allowed by `debug_group_index`
    pub fn group_enabled(&self, group: usize) -> bool {
        self.debug_group_index < 0 || self.debug_group_index as usize == group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DashConfig::default();
        assert_eq!(config.idle_interval_ms, 1000);
        assert_eq!(config.min_timeout_between_404_ms, 500);
        assert_eq!(config.segment_expire_after_ms, 100);
        assert_eq!(config.debug_group_index, -1);
        assert_eq!(config.first_select_mode, FirstSelectMode::LowestBandwidth);
        assert!(config.enable_buffering);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = DashConfig::from_json(
            r#"{ "keep_files": true, "abr": { "throughput_safety_factor": 0.9 } }"#,
        )
        .unwrap();
        assert!(config.keep_files);
        assert_eq!(config.abr.throughput_safety_factor, 0.9);
        assert_eq!(config.abr.probe_times_before_switch, 1);
        assert_eq!(config.idle_interval_ms, 1000);
    }

    #[test]
    fn test_validation() {
        let config = DashConfig {
            initial_time_shift_percent: 150,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DashConfig {
            speed: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = DashConfig::default();
        config.abr.throughput_safety_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_group() {
        let config = DashConfig {
            debug_group_index: 1,
            ..Default::default()
        };
        assert!(!config.group_enabled(0));
        assert!(config.group_enabled(1));
        assert!(DashConfig::default().group_enabled(7));
    }
}
