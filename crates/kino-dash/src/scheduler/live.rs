//! Live availability window

use super::SegmentDescriptor;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A tune-in lands on the next segment when it starts this close to the target
pub const TUNE_IN_NEXT_SEGMENT_MARGIN: Duration = Duration::from_millis(330);

/// Availability of a segment at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// Becomes available after the given wait
    NotYet(Duration),
    /// Fell out of the timeshift buffer
    Expired,
}

/// Snapshot of a dynamic period's timeline at `now`
///
/// All positions are relative to the period start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveWindow {
    pub now: DateTime<Utc>,
    pub availability_start_time: DateTime<Utc>,
    pub period_start: Duration,
    pub time_shift_buffer_depth: Option<Duration>,
    /// minBufferTime plus the suggested presentation delay
    pub presentation_delay: Duration,
}

impl LiveWindow {
    /// Time produced so far in this period
    pub fn elapsed(&self) -> Duration {
        (self.now - self.availability_start_time)
            .to_std()
            .unwrap_or_default()
            .saturating_sub(self.period_start)
    }

    /// Oldest position still inside the timeshift buffer
    pub fn window_start(&self) -> Duration {
        match self.time_shift_buffer_depth {
            Some(depth) => self.elapsed().saturating_sub(depth),
            None => Duration::ZERO,
        }
    }

    /// Position playback should aim for
    pub fn live_edge(&self) -> Duration {
        self.elapsed()
            .saturating_sub(self.presentation_delay)
            .max(self.window_start())
    }

    /// Clamp a position into `[window_start, live_edge]`
    pub fn clip(&self, position: Duration) -> Duration {
        position.max(self.window_start()).min(self.live_edge())
    }

    /// Wall clock time at which a segment is complete on the server
    pub fn available_at(&self, segment: &SegmentDescriptor) -> DateTime<Utc> {
        let end = self.period_start + segment.start + segment.duration;
        self.availability_start_time
            + chrono::TimeDelta::from_std(end).unwrap_or_else(|_| chrono::TimeDelta::zero())
    }

    pub fn availability(&self, segment: &SegmentDescriptor) -> Availability {
        let end = segment.start + segment.duration;
        let elapsed = self.elapsed();
        if end > elapsed {
            return Availability::NotYet(end - elapsed);
        }
        if self.time_shift_buffer_depth.is_some() && end < self.window_start() {
            return Availability::Expired;
        }
        Availability::Available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use url::Url;

    fn window(elapsed_secs: i64) -> LiveWindow {
        let now = Utc::now();
        LiveWindow {
            now,
            availability_start_time: now - TimeDelta::seconds(elapsed_secs),
            period_start: Duration::from_secs(10),
            time_shift_buffer_depth: Some(Duration::from_secs(20)),
            presentation_delay: Duration::from_secs(4),
        }
    }

    fn segment(start: u64) -> SegmentDescriptor {
        SegmentDescriptor {
            index: 0,
            number: 1,
            url: Url::parse("https://cdn.example.com/1.m4s").unwrap(),
            byte_range: None,
            start: Duration::from_secs(start),
            duration: Duration::from_secs(2),
            media_time: 0,
        }
    }

    #[test]
    fn test_window_bounds() {
        let window = window(70);
        assert_eq!(window.elapsed(), Duration::from_secs(60));
        assert_eq!(window.window_start(), Duration::from_secs(40));
        assert_eq!(window.live_edge(), Duration::from_secs(56));
        assert_eq!(window.clip(Duration::from_secs(5)), Duration::from_secs(40));
        assert_eq!(window.clip(Duration::from_secs(59)), Duration::from_secs(56));
    }

    #[test]
    fn test_availability() {
        let window = window(70);
        assert_eq!(window.availability(&segment(50)), Availability::Available);
        assert_eq!(
            window.availability(&segment(59)),
            Availability::NotYet(Duration::from_secs(1))
        );
        assert_eq!(window.availability(&segment(30)), Availability::Expired);
        assert_eq!(
            window.available_at(&segment(59)),
            window.availability_start_time + TimeDelta::seconds(71)
        );
    }

    #[test]
    fn test_before_period_start() {
        let window = window(5);
        assert_eq!(window.elapsed(), Duration::ZERO);
        assert!(matches!(
            window.availability(&segment(0)),
            Availability::NotYet(_)
        ));
    }
}
