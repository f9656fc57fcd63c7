//! Session events delivered to the host player
//!
//! Events are the only way the running session reports anything: lifecycle
//! (manifest, period setup and teardown), buffering, segment availability,
//! quality switches, timeshift updates and group-local download errors.

use crate::{types::SessionId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Session event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DashEvent {
    /// Manifest could not be fetched, parsed or validated
    ManifestInitError { code: String, message: String },

    /// Groups of the new period are known, the host may select them now
    SelectGroups,

    /// Period setup failed, the session stops
    PeriodSetupError { code: String, message: String },

    /// Groups are set up, the host should create its playback chain
    CreatePlayback,

    /// Groups are about to be torn down
    DestroyPlayback,

    /// Buffering in progress
    Buffering {
        /// Lowest buffered duration across selected groups
        buffered_ms: u64,
        /// Target the session waits for
        target_ms: u64,
    },

    /// Buffering target reached
    BufferDone,

    /// A new segment is ready in a group
    SegmentAvailable { group: usize },

    /// Active representation of a group changed
    QualitySwitch {
        group: usize,
        from: usize,
        to: usize,
        bandwidth: u64,
    },

    /// Timeshift position of a live group moved
    TimeshiftUpdate { group: usize, position_ms: u64 },

    /// Playback of a live group fell out of the timeshift buffer
    TimeshiftOverflow { group: usize },

    /// A segment failed and the group has nothing buffered to fall back on
    DownloadError {
        group: usize,
        code: String,
        message: String,
    },
}

impl DashEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            DashEvent::ManifestInitError { .. } => "MANIFEST_INIT_ERROR",
            DashEvent::SelectGroups => "SELECT_GROUPS",
            DashEvent::PeriodSetupError { .. } => "PERIOD_SETUP_ERROR",
            DashEvent::CreatePlayback => "CREATE_PLAYBACK",
            DashEvent::DestroyPlayback => "DESTROY_PLAYBACK",
            DashEvent::Buffering { .. } => "BUFFERING",
            DashEvent::BufferDone => "BUFFER_DONE",
            DashEvent::SegmentAvailable { .. } => "SEGMENT_AVAILABLE",
            DashEvent::QualitySwitch { .. } => "QUALITY_SWITCH",
            DashEvent::TimeshiftUpdate { .. } => "TIMESHIFT_UPDATE",
            DashEvent::TimeshiftOverflow { .. } => "TIMESHIFT_OVERFLOW",
            DashEvent::DownloadError { .. } => "DOWNLOAD_ERROR",
        }
    }

    /// Group the event refers to, if any
    pub fn group(&self) -> Option<usize> {
        match self {
            DashEvent::SegmentAvailable { group }
            | DashEvent::QualitySwitch { group, .. }
            | DashEvent::TimeshiftUpdate { group, .. }
            | DashEvent::TimeshiftOverflow { group }
            | DashEvent::DownloadError { group, .. } => Some(*group),
            _ => None,
        }
    }
}

/// Receives session events
///
/// Called from the session's control task, so implementations must not
/// block. Returning an error for [`DashEvent::CreatePlayback`] aborts the
/// period setup; errors for other events are logged and ignored.
pub trait DashEventHandler: Send + Sync {
    fn on_dash_event(&self, event: &DashEvent) -> Result<()>;
}

impl<F> DashEventHandler for F
where
    F: Fn(&DashEvent) -> Result<()> + Send + Sync,
{
    fn on_dash_event(&self, event: &DashEvent) -> Result<()> {
        self(event)
    }
}

/// Event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashEventRecord {
    /// Session ID
    pub session_id: SessionId,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Sequence number
    pub sequence: u64,
    /// The event
    #[serde(flatten)]
    pub event: DashEvent,
}

/// Forwards events over an unbounded channel
pub struct ChannelEventHandler {
    session_id: SessionId,
    sequence: AtomicU64,
    event_tx: mpsc::UnboundedSender<DashEventRecord>,
}

impl ChannelEventHandler {
    /// Create a handler and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DashEventRecord>) {
        Self::with_session_id(SessionId::new())
    }

    pub fn with_session_id(
        session_id: SessionId,
    ) -> (Self, mpsc::UnboundedReceiver<DashEventRecord>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id,
                sequence: AtomicU64::new(0),
                event_tx,
            },
            event_rx,
        )
    }
}

impl DashEventHandler for ChannelEventHandler {
    fn on_dash_event(&self, event: &DashEvent) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let record = DashEventRecord {
            session_id: self.session_id,
            timestamp: Utc::now(),
            sequence,
            event: event.clone(),
        };
        if self.event_tx.send(record).is_err() {
            debug!(event = event.name(), "Event receiver dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_event_serialization() {
        let event = DashEvent::QualitySwitch {
            group: 1,
            from: 0,
            to: 2,
            bandwidth: 2_000_000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "quality_switch");
        assert_eq!(json["to"], 2);

        let back: DashEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.name(), "QUALITY_SWITCH");
        assert_eq!(back.group(), Some(1));
        assert_eq!(DashEvent::SelectGroups.group(), None);
    }

    #[test]
    fn test_channel_handler_sequence() {
        let (handler, mut rx) = ChannelEventHandler::new();
        handler.on_dash_event(&DashEvent::SelectGroups).unwrap();
        handler.on_dash_event(&DashEvent::CreatePlayback).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.event, DashEvent::CreatePlayback);
        assert_eq!(first.session_id, second.session_id);

        drop(rx);
        assert!(handler.on_dash_event(&DashEvent::BufferDone).is_ok());
    }

    #[test]
    fn test_closure_handler() {
        let handler = |event: &DashEvent| match event {
            DashEvent::CreatePlayback => Err(Error::HandlerRejected {
                event: event.name().into(),
                reason: "no decoder".into(),
            }),
            _ => Ok(()),
        };
        assert!(handler.on_dash_event(&DashEvent::SelectGroups).is_ok());
        assert!(handler.on_dash_event(&DashEvent::CreatePlayback).is_err());
    }
}
