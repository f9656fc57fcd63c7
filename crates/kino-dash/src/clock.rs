//! UTC clock used for live timeline computations

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tracing::info;

/// Response header carrying the server time in milliseconds since the epoch
pub const SERVER_UTC_HEADER: &str = "Server-UTC";
/// Standard HTTP date header, used when `Server-UTC` is absent
pub const DATE_HEADER: &str = "Date";

#[derive(Debug, Clone, Copy, Default)]
pub struct UtcClock {
    /// User supplied shift of the availability start time
    shift: TimeDelta,
    /// How much the local clock is ahead of the server clock
    drift: TimeDelta,
}

impl UtcClock {
    pub fn new(shift_ms: i64) -> Self {
        Self {
            shift: TimeDelta::milliseconds(shift_ms),
            drift: TimeDelta::zero(),
        }
    }

    /// Current time on the corrected timeline
    pub fn now(&self) -> DateTime<Utc> {
        self.correct(Utc::now())
    }

    /// Apply shift and drift to a local timestamp
    pub fn correct(&self, local: DateTime<Utc>) -> DateTime<Utc> {
        local - self.shift - self.drift
    }

    pub fn set_shift_ms(&mut self, shift_ms: i64) {
        self.shift = TimeDelta::milliseconds(shift_ms);
    }

    /// Current drift estimate in milliseconds
    pub fn drift_ms(&self) -> i64 {
        self.drift.num_milliseconds()
    }

    /// Record a server timestamp observed when a response completed locally
    pub fn set_server_time(&mut self, server_now: DateTime<Utc>, local_now: DateTime<Utc>) {
        self.drift = local_now - server_now;
        info!(
            drift_milliseconds = %self.drift.num_milliseconds(),
            "Clock drift estimated from server time {}", server_now
        );
    }

    pub fn reset_drift(&mut self) {
        self.drift = TimeDelta::zero();
    }
}

/// Server time from a `Server-UTC` value, else an RFC 2822 `Date` value
pub fn parse_server_time(server_utc: Option<&str>, date: Option<&str>) -> Option<DateTime<Utc>> {
    if let Some(ms) = server_utc.and_then(|v| v.trim().parse::<i64>().ok()) {
        if let Some(time) = Utc.timestamp_millis_opt(ms).single() {
            return Some(time);
        }
    }
    date.and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_correction() {
        let mut clock = UtcClock::new(0);
        let local = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 2).unwrap();
        let server = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        clock.set_server_time(server, local);
        assert_eq!(clock.drift_ms(), 2000);
        assert_eq!(clock.correct(local), server);

        clock.reset_drift();
        assert_eq!(clock.correct(local), local);
    }

    #[test]
    fn test_shift() {
        let clock = UtcClock::new(500);
        let local = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(clock.correct(local), local - TimeDelta::milliseconds(500));
    }

    #[test]
    fn test_parse_server_time() {
        let from_ms = parse_server_time(Some("1714564800000"), None).unwrap();
        assert_eq!(from_ms, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());

        let from_date = parse_server_time(None, Some("Wed, 01 May 2024 12:00:00 GMT")).unwrap();
        assert_eq!(from_date, from_ms);

        // Garbage Server-UTC falls back to Date
        let fallback = parse_server_time(Some("soon"), Some("Wed, 01 May 2024 12:00:00 GMT"));
        assert_eq!(fallback, Some(from_ms));

        assert!(parse_server_time(None, None).is_none());
    }
}
