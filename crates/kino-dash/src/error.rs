//! Error types for Kino DASH

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for streaming client operations
pub type Result<T> = std::result::Result<T, Error>;

/// How an error affects the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Aborts the affected lifecycle stage (manifest load, period setup)
    Fatal,
    /// Retried or absorbed by buffered content
    Recoverable,
    /// Handled by moving to a lower bitrate
    Degrade,
    /// Segment numbering mismatch, needs explicit resync
    Desync,
}

/// Streaming client error types
#[derive(Error, Debug)]
pub enum Error {
    // Manifest errors
    #[error("Failed to fetch manifest: {0}")]
    ManifestFetch(String),

    #[error("Failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Unsupported manifest type: {mime}")]
    UnsupportedManifest { mime: String },

    // Period errors
    #[error("Period setup failed: {0}")]
    PeriodSetup(String),

    #[error("No period at index {0}")]
    NoSuchPeriod(usize),

    #[error("Period switch in progress")]
    PeriodSwitchInProgress,

    // Segment errors
    #[error("Segment not found: {url}")]
    SegmentNotFound { url: String },

    #[error("Failed to fetch segment {url}: {reason}")]
    SegmentFetch { url: String, reason: String },

    #[error("Segment lost: {url}")]
    SegmentLost { url: String },

    #[error("Invalid segment template: {0}")]
    InvalidTemplate(String),

    #[error("End of stream")]
    EndOfStream,

    // Buffer errors
    #[error("No segment ready in group {group}")]
    BufferEmpty { group: usize },

    #[error("Segment cache full for group {group}")]
    BufferOverflow { group: usize },

    // Group errors
    #[error("Invalid group index: {0}")]
    InvalidGroup(usize),

    #[error("Invalid representation {index} in group {group}")]
    InvalidRepresentation { group: usize, index: usize },

    #[error("No suitable representation in group {group}")]
    NoSuitableRepresentation { group: usize },

    #[error("Resync failed: {0}")]
    Resync(String),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Download aborted")]
    Aborted,

    #[error("Unknown IO handle: {0}")]
    UnknownHandle(u64),

    #[cfg(feature = "http")]
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid period state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Event handler rejected {event}: {reason}")]
    HandlerRejected { event: String, reason: String },

    // Session errors
    #[error("Session is not open")]
    NotOpen,

    #[error("Session is already open")]
    AlreadyOpen,

    #[error("Session closed")]
    SessionClosed,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Returns true for a "not there yet" answer from the server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::SegmentNotFound { .. })
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SegmentNotFound { .. }
                | Error::SegmentFetch { .. }
                | Error::SegmentLost { .. }
                | Error::Transport(_)
                | Error::Aborted
                | Error::BufferEmpty { .. }
                | Error::BufferOverflow { .. }
                | Error::PeriodSwitchInProgress
        ) || self.is_network()
    }

    /// Returns true if this error ends the affected lifecycle stage
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ManifestFetch(_)
            | Error::ManifestParse(_)
            | Error::InvalidManifest(_)
            | Error::UnsupportedManifest { .. }
            | Error::PeriodSetup(_)
            | Error::HandlerRejected { .. } => ErrorClass::Fatal,
            Error::SegmentLost { .. } => ErrorClass::Degrade,
            Error::Resync(_) => ErrorClass::Desync,
            _ => ErrorClass::Recoverable,
        }
    }

    #[cfg(feature = "http")]
    fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    #[cfg(not(feature = "http"))]
    fn is_network(&self) -> bool {
        false
    }

    /// Returns the error code reported with events
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::ManifestFetch(_) => "MANIFEST_FETCH",
            Error::ManifestParse(_) => "MANIFEST_PARSE",
            Error::InvalidManifest(_) => "INVALID_MANIFEST",
            Error::UnsupportedManifest { .. } => "UNSUPPORTED_MANIFEST",
            Error::PeriodSetup(_) => "PERIOD_SETUP",
            Error::NoSuchPeriod(_) => "NO_PERIOD",
            Error::PeriodSwitchInProgress => "PERIOD_SWITCH",
            Error::SegmentNotFound { .. } => "SEGMENT_NOT_FOUND",
            Error::SegmentFetch { .. } => "SEGMENT_FETCH",
            Error::SegmentLost { .. } => "SEGMENT_LOST",
            Error::InvalidTemplate(_) => "INVALID_TEMPLATE",
            Error::EndOfStream => "END_OF_STREAM",
            Error::BufferEmpty { .. } => "BUFFER_EMPTY",
            Error::BufferOverflow { .. } => "BUFFER_OVERFLOW",
            Error::InvalidGroup(_) => "INVALID_GROUP",
            Error::InvalidRepresentation { .. } => "INVALID_REPRESENTATION",
            Error::NoSuitableRepresentation { .. } => "NO_REPRESENTATION",
            Error::Resync(_) => "RESYNC",
            Error::Transport(_) => "TRANSPORT",
            Error::Aborted => "ABORTED",
            Error::UnknownHandle(_) => "UNKNOWN_HANDLE",
            #[cfg(feature = "http")]
            Error::Network(_) => "NETWORK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::InvalidStateTransition { .. } => "INVALID_STATE",
            Error::HandlerRejected { .. } => "HANDLER_REJECTED",
            Error::NotOpen => "NOT_OPEN",
            Error::AlreadyOpen => "ALREADY_OPEN",
            Error::SessionClosed => "SESSION_CLOSED",
            Error::Internal(_) => "INTERNAL",
            Error::Io(_) => "IO",
            Error::Url(_) => "URL",
            Error::Json(_) => "JSON",
        }
    }
}
