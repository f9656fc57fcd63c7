//! Representation selection
//!
//! Throughput driven rate adaptation per group:
//! - Initial pick by [`FirstSelectMode`]
//! - EWMA throughput estimate over the completed segment downloads
//! - Highest representation fitting `estimate x safety factor`, with a probe
//!   count before switching up and immediate down switches
//! - Periodic re-evaluation every `auto_switch_count` segments
//! - Device constraints (resolution, bits per pixel, codec support)

use crate::{
    config::{AbrConfig, DashConfig},
    types::{FirstSelectMode, QualityInfo},
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Bandwidth measurement sample
#[derive(Debug, Clone)]
pub struct BandwidthMeasurement {
    /// Bytes downloaded
    pub bytes: u64,
    /// Body transfer time
    pub duration: Duration,
    /// Timestamp
    pub timestamp: Instant,
}

impl BandwidthMeasurement {
    /// Calculate throughput in bits per second
    pub fn throughput_bps(&self) -> u64 {
        if self.duration.as_secs_f64() > 0.0 {
            ((self.bytes as f64 * 8.0) / self.duration.as_secs_f64()) as u64
        } else {
            0
        }
    }
}

/// Why the active representation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// Throughput estimate
    Throughput,
    /// Periodic `auto_switch_count` evaluation
    Periodic,
    /// Segment lost
    Degrade,
    /// Explicit request from the host
    Manual,
}

/// A change of the active representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchDecision {
    pub from: usize,
    pub to: usize,
    pub reason: SwitchReason,
}

/// Bits per pixel implied by a codec string
pub fn bits_per_pixel(codecs: Option<&str>) -> u32 {
    let Some(codecs) = codecs else { return 8 };
    let high_bit_depth = codecs.split(',').map(str::trim).any(|codec| {
        codec.starts_with("hvc1.2")
            || codec.starts_with("hev1.2")
            || codec.starts_with("avc1.6E")
            || codec.starts_with("avc1.6e")
    });
    if high_bit_depth {
        10
    } else {
        8
    }
}

/// Disable representations above the device limits
///
/// `decodable` reports host codec support. At least one representation
/// (the lowest bandwidth one) always stays enabled.
pub fn apply_device_constraints(
    qualities: &mut [QualityInfo],
    max_width: u32,
    max_height: u32,
    max_bpp: u32,
    decodable: impl Fn(&QualityInfo) -> bool,
) {
    for quality in qualities.iter_mut() {
        let too_wide = max_width > 0
            && quality.resolution.is_some_and(|r| r.width > max_width);
        let too_high = max_height > 0
            && quality.resolution.is_some_and(|r| r.height > max_height);
        let too_deep = max_bpp > 0 && bits_per_pixel(quality.codecs.as_deref()) > max_bpp;
        let undecodable = !decodable(&*quality);
        quality.disabled = too_wide || too_high || too_deep || undecodable;
    }

    if qualities.iter().all(|q| q.disabled) {
        if let Some(lowest) = lowest_bandwidth(qualities, |_| true) {
            qualities[lowest].disabled = false;
        }
    }
}

fn lowest_bandwidth(qualities: &[QualityInfo], keep: impl Fn(&QualityInfo) -> bool) -> Option<usize> {
    qualities
        .iter()
        .enumerate()
        .filter(|(_, q)| keep(*q))
        .min_by_key(|(i, q)| (q.bandwidth, *i))
        .map(|(i, _)| i)
}

/// Pick the starting representation of a group
pub fn initial_pick(mode: FirstSelectMode, qualities: &[QualityInfo]) -> Option<usize> {
    let enabled = |q: &QualityInfo| !q.disabled;
    let has_ranking = qualities.iter().any(|q| q.quality_ranking.is_some());
    let candidates = qualities.iter().enumerate().filter(|(_, q)| enabled(*q));

    match mode {
        FirstSelectMode::LowestBandwidth => lowest_bandwidth(qualities, enabled),
        FirstSelectMode::HighestBandwidth => candidates
            .max_by_key(|(i, q)| (q.bandwidth, std::cmp::Reverse(*i)))
            .map(|(i, _)| i),
        FirstSelectMode::HighestQuality if has_ranking => candidates
            .min_by_key(|(i, q)| (q.quality_ranking.unwrap_or(u32::MAX), *i))
            .map(|(i, _)| i),
        FirstSelectMode::LowestQuality if has_ranking => candidates
            .max_by_key(|(i, q)| (q.quality_ranking.unwrap_or(0), std::cmp::Reverse(*i)))
            .map(|(i, _)| i),
        FirstSelectMode::HighestQuality => initial_pick(FirstSelectMode::HighestBandwidth, qualities),
        FirstSelectMode::LowestQuality => initial_pick(FirstSelectMode::LowestBandwidth, qualities),
    }
}

/// Neighbouring representation by bandwidth
///
/// Up: smallest bandwidth above the current one. Down: largest below.
/// Equal bandwidths resolve to the lowest index.
pub fn step(qualities: &[QualityInfo], current: usize, up: bool) -> Option<usize> {
    let current_bw = qualities.get(current)?.bandwidth;
    let candidates = qualities
        .iter()
        .enumerate()
        .filter(|(i, q)| *i != current && !q.disabled);
    if up {
        candidates
            .filter(|(_, q)| q.bandwidth > current_bw)
            .min_by_key(|(i, q)| (q.bandwidth, *i))
            .map(|(i, _)| i)
    } else {
        candidates
            .filter(|(_, q)| q.bandwidth < current_bw)
            .max_by_key(|(i, q)| (q.bandwidth, std::cmp::Reverse(*i)))
            .map(|(i, _)| i)
    }
}

/// Highest representation whose bandwidth fits the budget, lowest index on ties
fn best_fit(qualities: &[QualityInfo], budget: u64) -> Option<usize> {
    qualities
        .iter()
        .enumerate()
        .filter(|(_, q)| !q.disabled && q.bandwidth <= budget)
        .max_by_key(|(i, q)| (q.bandwidth, std::cmp::Reverse(*i)))
        .map(|(i, _)| i)
        .or_else(|| lowest_bandwidth(qualities, |q| !q.disabled))
}

/// Per group representation selector
#[derive(Debug, Clone)]
pub struct RepresentationSelector {
    config: AbrConfig,
    /// Bandwidth history
    bandwidth_history: VecDeque<BandwidthMeasurement>,
    /// Current bandwidth estimate (bps)
    bandwidth_estimate: u64,
    /// Newest sample (bps)
    last_sample: u64,
    active: usize,
    auto_switch_count: u32,
    segments_since_evaluation: u32,
    /// Consecutive decisions to go up
    up_probes: u32,
    disable_switching: bool,
    speed: f64,
}

impl RepresentationSelector {
    pub fn new(config: &DashConfig) -> Self {
        Self {
            config: config.abr.clone(),
            bandwidth_history: VecDeque::with_capacity(config.abr.max_history),
            bandwidth_estimate: 0,
            last_sample: 0,
            active: 0,
            auto_switch_count: config.auto_switch_count,
            segments_since_evaluation: 0,
            up_probes: 0,
            disable_switching: config.disable_switching,
            speed: config.speed,
        }
    }

    /// Active representation index
    pub fn active(&self) -> usize {
        self.active
    }

    /// Apply the initial pick
    pub fn start(&mut self, mode: FirstSelectMode, qualities: &[QualityInfo]) -> Option<usize> {
        let pick = initial_pick(mode, qualities)?;
        self.active = pick;
        self.segments_since_evaluation = 0;
        self.up_probes = 0;
        Some(pick)
    }

    /// Force the active representation (manual selection)
    pub fn set_active(&mut self, index: usize) -> Option<SwitchDecision> {
        let from = self.active;
        self.active = index;
        self.segments_since_evaluation = 0;
        self.up_probes = 0;
        (from != index).then_some(SwitchDecision {
            from,
            to: index,
            reason: SwitchReason::Manual,
        })
    }

    pub fn set_auto_switch_count(&mut self, count: u32) {
        self.auto_switch_count = count;
        self.segments_since_evaluation = 0;
    }

    pub fn set_probe_count(&mut self, count: u32) {
        self.config.probe_times_before_switch = count;
    }

    pub fn set_aggressive(&mut self, aggressive: bool) {
        self.config.aggressive = aggressive;
    }

    pub fn set_disable_switching(&mut self, disable: bool) {
        self.disable_switching = disable;
    }

    pub fn set_speed(&mut self, speed: f64) {
        if speed.is_finite() && speed != 0.0 {
            self.speed = speed;
        }
    }

    /// Get current bandwidth estimate
    pub fn bandwidth_estimate(&self) -> u64 {
        self.bandwidth_estimate
    }

    /// Record a completed segment body
    #[instrument(skip(self))]
    pub fn record_measurement(&mut self, bytes: u64, duration: Duration) {
        let measurement = BandwidthMeasurement {
            bytes,
            duration,
            timestamp: Instant::now(),
        };
        let sample = measurement.throughput_bps();
        if sample == 0 {
            return;
        }
        self.push_sample(measurement, sample);
    }

    /// Record the transfer rate reported by the IO layer
    pub fn record_rate(&mut self, bytes_per_sec: u64) {
        if bytes_per_sec == 0 {
            return;
        }
        let measurement = BandwidthMeasurement {
            bytes: bytes_per_sec,
            duration: Duration::from_secs(1),
            timestamp: Instant::now(),
        };
        let sample = measurement.throughput_bps();
        self.push_sample(measurement, sample);
    }

    fn push_sample(&mut self, measurement: BandwidthMeasurement, sample: u64) {
        // Playing faster consumes media faster than real time
        let sample = (sample as f64 / self.speed.abs()) as u64;

        if self.bandwidth_history.len() >= self.config.max_history.max(1) {
            self.bandwidth_history.pop_front();
        }
        self.bandwidth_history.push_back(measurement);
        self.last_sample = sample;

        if self.bandwidth_estimate == 0 {
            self.bandwidth_estimate = sample;
        } else {
            let alpha = self.config.ewma_alpha;
            self.bandwidth_estimate =
                ((self.bandwidth_estimate as f64 * (1.0 - alpha)) + (sample as f64 * alpha)) as u64;
        }

        debug!(
            throughput_mbps = sample as f64 / 1_000_000.0,
            estimate_mbps = self.bandwidth_estimate as f64 / 1_000_000.0,
            "Bandwidth measurement recorded"
        );
    }

    fn budget(&self, throughput: u64) -> u64 {
        (throughput as f64 * self.config.throughput_safety_factor) as u64
    }

    /// Decide the representation of the next segment
    ///
    /// Called once per completed media segment, after its measurement was
    /// recorded.
    #[instrument(skip(self, qualities), fields(active = self.active))]
    pub fn on_segment_complete(&mut self, qualities: &[QualityInfo]) -> Option<SwitchDecision> {
        if self.disable_switching || qualities.len() < 2 || self.bandwidth_estimate == 0 {
            return None;
        }

        if self.auto_switch_count > 0 {
            self.segments_since_evaluation += 1;
            if self.segments_since_evaluation < self.auto_switch_count {
                return None;
            }
            self.segments_since_evaluation = 0;

            if let Some(up) = step(qualities, self.active, true) {
                if qualities[up].bandwidth <= self.budget(self.last_sample) {
                    return self.switch_to(up, SwitchReason::Periodic);
                }
            }
            let target = best_fit(qualities, self.budget(self.bandwidth_estimate))?;
            return self.switch_to(target, SwitchReason::Periodic);
        }

        let target = best_fit(qualities, self.budget(self.bandwidth_estimate))?;
        let active_bw = qualities.get(self.active).map(|q| q.bandwidth).unwrap_or(0);
        let target_bw = qualities[target].bandwidth;

        if target_bw > active_bw {
            self.up_probes += 1;
            if !self.config.aggressive && self.up_probes < self.config.probe_times_before_switch {
                debug!(probes = self.up_probes, "Up-switch probe");
                return None;
            }
        }
        self.switch_to(target, SwitchReason::Throughput)
    }

    /// One step down after a lost segment
    pub fn degrade(&mut self, qualities: &[QualityInfo]) -> Option<SwitchDecision> {
        if self.disable_switching {
            return None;
        }
        let down = step(qualities, self.active, false)?;
        self.switch_to(down, SwitchReason::Degrade)
    }

    fn switch_to(&mut self, target: usize, reason: SwitchReason) -> Option<SwitchDecision> {
        self.up_probes = 0;
        if target == self.active {
            return None;
        }
        let from = self.active;
        self.active = target;
        debug!(from, to = target, ?reason, "Representation switch");
        Some(SwitchDecision {
            from,
            to: target,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    fn quality(id: &str, bandwidth: u64) -> QualityInfo {
        QualityInfo {
            id: id.to_string(),
            bandwidth,
            mime: Some("video/mp4".into()),
            codecs: Some("avc1.64001f".into()),
            resolution: None,
            frame_rate: None,
            sample_rate: None,
            channels: None,
            quality_ranking: None,
            average_duration: Duration::from_secs(2),
            is_selected: false,
            disabled: false,
        }
    }

    fn create_test_qualities() -> Vec<QualityInfo> {
        let mut low = quality("360p", 800_000);
        low.resolution = Some(Resolution::new(640, 360));
        let mut mid = quality("720p", 2_800_000);
        mid.resolution = Some(Resolution::new(1280, 720));
        let mut high = quality("1080p", 5_000_000);
        high.resolution = Some(Resolution::new(1920, 1080));
        vec![mid, low, high]
    }

    fn selector(config: DashConfig) -> RepresentationSelector {
        RepresentationSelector::new(&config)
    }

    #[test]
    fn test_initial_pick() {
        let mut qualities = create_test_qualities();
        assert_eq!(initial_pick(FirstSelectMode::LowestBandwidth, &qualities), Some(1));
        assert_eq!(initial_pick(FirstSelectMode::HighestBandwidth, &qualities), Some(2));
        // No rankings: quality falls back to bandwidth
        assert_eq!(initial_pick(FirstSelectMode::HighestQuality, &qualities), Some(2));

        qualities[0].quality_ranking = Some(1);
        qualities[1].quality_ranking = Some(3);
        qualities[2].quality_ranking = Some(2);
        assert_eq!(initial_pick(FirstSelectMode::HighestQuality, &qualities), Some(0));
        assert_eq!(initial_pick(FirstSelectMode::LowestQuality, &qualities), Some(1));

        qualities[1].disabled = true;
        assert_eq!(initial_pick(FirstSelectMode::LowestBandwidth, &qualities), Some(0));
    }

    #[test]
    fn test_ties_resolve_to_lowest_index() {
        let qualities = vec![quality("a", 1_000_000), quality("b", 1_000_000), quality("c", 500_000)];
        assert_eq!(initial_pick(FirstSelectMode::HighestBandwidth, &qualities), Some(0));
        assert_eq!(best_fit(&qualities, 2_000_000), Some(0));
        assert_eq!(step(&qualities, 2, true), Some(0));
    }

    #[test]
    fn test_throughput_selection() {
        let qualities = create_test_qualities();
        let mut abr = selector(DashConfig::default());
        abr.start(FirstSelectMode::LowestBandwidth, &qualities);

        // 10 Mbps, 80% safety: 1080p fits
        abr.record_measurement(1_250_000, Duration::from_secs(1));
        let decision = abr.on_segment_complete(&qualities).unwrap();
        assert_eq!(decision.to, 2);
        assert_eq!(decision.reason, SwitchReason::Throughput);

        // Estimate collapses: immediate down switch
        let mut low = selector(DashConfig::default());
        low.start(FirstSelectMode::HighestBandwidth, &qualities);
        low.record_measurement(125_000, Duration::from_secs(1));
        assert_eq!(low.on_segment_complete(&qualities).unwrap().to, 1);
    }

    #[test]
    fn test_probe_count_before_up_switch() {
        let qualities = create_test_qualities();
        let mut config = DashConfig::default();
        config.abr.probe_times_before_switch = 3;
        let mut abr = selector(config);
        abr.start(FirstSelectMode::LowestBandwidth, &qualities);

        for _ in 0..2 {
            abr.record_measurement(1_250_000, Duration::from_secs(1));
            assert!(abr.on_segment_complete(&qualities).is_none());
        }
        abr.record_measurement(1_250_000, Duration::from_secs(1));
        assert_eq!(abr.on_segment_complete(&qualities).unwrap().to, 2);

        let mut aggressive = selector(DashConfig {
            abr: AbrConfig {
                probe_times_before_switch: 3,
                aggressive: true,
                ..Default::default()
            },
            ..Default::default()
        });
        aggressive.start(FirstSelectMode::LowestBandwidth, &qualities);
        aggressive.record_measurement(1_250_000, Duration::from_secs(1));
        assert!(aggressive.on_segment_complete(&qualities).is_some());
    }

    #[test]
    fn test_periodic_evaluation() {
        let qualities = vec![quality("low", 500_000), quality("high", 2_000_000)];
        let mut abr = selector(DashConfig {
            auto_switch_count: 3,
            ..Default::default()
        });
        abr.start(FirstSelectMode::LowestBandwidth, &qualities);

        // 600 kbps, 600 kbps, then 5 Mbps
        for (segment, bytes) in [(1, 75_000u64), (2, 75_000), (3, 625_000)] {
            abr.record_measurement(bytes, Duration::from_secs(1));
            let decision = abr.on_segment_complete(&qualities);
            if segment < 3 {
                assert!(decision.is_none(), "switched after segment {segment}");
            } else {
                let decision = decision.unwrap();
                assert_eq!(decision.to, 1);
                assert_eq!(decision.reason, SwitchReason::Periodic);
            }
        }
        assert_eq!(abr.active(), 1);
    }

    #[test]
    fn test_disable_switching_and_speed() {
        let qualities = create_test_qualities();
        let mut frozen = selector(DashConfig {
            disable_switching: true,
            ..Default::default()
        });
        frozen.start(FirstSelectMode::LowestBandwidth, &qualities);
        frozen.record_measurement(1_250_000, Duration::from_secs(1));
        assert!(frozen.on_segment_complete(&qualities).is_none());
        assert!(frozen.degrade(&qualities).is_none());

        let mut fast = selector(DashConfig::default());
        fast.set_speed(-2.0);
        fast.record_rate(1_250_000);
        assert_eq!(fast.bandwidth_estimate(), 5_000_000);
    }

    #[test]
    fn test_degrade_steps_down_once() {
        let qualities = create_test_qualities();
        let mut abr = selector(DashConfig::default());
        abr.start(FirstSelectMode::HighestBandwidth, &qualities);
        assert_eq!(abr.degrade(&qualities).unwrap().to, 0);
        assert_eq!(abr.degrade(&qualities).unwrap().to, 1);
        assert!(abr.degrade(&qualities).is_none());
    }

    #[test]
    fn test_device_constraints() {
        let mut qualities = create_test_qualities();
        qualities[2].codecs = Some("hvc1.2.4.L153.B0".into());
        assert_eq!(bits_per_pixel(qualities[2].codecs.as_deref()), 10);
        assert_eq!(bits_per_pixel(Some("avc1.6E0028")), 10);
        assert_eq!(bits_per_pixel(None), 8);

        apply_device_constraints(&mut qualities, 1280, 0, 0, |_| true);
        assert!(!qualities[0].disabled);
        assert!(qualities[2].disabled);

        apply_device_constraints(&mut qualities, 0, 0, 8, |_| true);
        assert!(qualities[2].disabled);
        assert!(!qualities[0].disabled);

        // Everything excluded: the lowest bandwidth one survives
        apply_device_constraints(&mut qualities, 100, 100, 0, |_| true);
        assert!(!qualities[1].disabled);
        assert!(qualities[0].disabled && qualities[2].disabled);
    }
}
