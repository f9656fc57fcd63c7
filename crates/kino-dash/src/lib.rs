//! Kino DASH - Adaptive Streaming Client Core for Kino
//!
//! This crate drives the download side of an adaptive streaming player:
//! - Manifest loading, validation and live refresh
//! - Period setup, switching and teardown
//! - Segment scheduling for lists, templates and timelines
//! - Per group download workers over a pluggable IO layer
//! - Adaptive bitrate selection and bounded segment caches
//! - Buffering and session events for the host player
//!
//! Manifest parsing is left to a [`ManifestParser`] supplied by the host.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Kino DASH                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Manifest   │  │    Period    │  │    Event     │           │
//! │  │    Model     │  │   Manager    │  │   Handler    │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │    Dash     │                              │
//! │                    │   Session   │                              │
//! │                    └──────┬──────┘                              │
//! │                           │  one per adaptation set             │
//! │                    ┌──────┴──────┐                              │
//! │                    │    Group    │                              │
//! │                    │ Controller  │                              │
//! │                    └──────┬──────┘                              │
//! │         ┌─────────────────┼─────────────────┐                   │
//! │  ┌──────┴───────┐  ┌──────┴───────┐  ┌──────┴───────┐           │
//! │  │   Segment    │  │ Representat. │  │    Group     │           │
//! │  │  Scheduler   │  │   Selector   │  │    Buffer    │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │  Download   │──── DashIo (HTTP / memory)   │
//! │                    │   Workers   │                              │
//! │                    └─────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod clock;
pub mod manifest;
pub mod scheduler;
pub mod io;
pub mod download;
pub mod buffer;
pub mod abr;
pub mod events;
pub mod group;
pub mod period;
pub mod session;

pub use error::{Error, Result};
pub use types::*;
pub use config::{AbrConfig, DashConfig};
pub use manifest::{Manifest, ManifestParser, ManifestType, PresentationType};
pub use io::{DashIo, IoHandle, MemoryIo};
#[cfg(feature = "http")]
pub use io::HttpIo;
pub use abr::RepresentationSelector;
pub use buffer::GroupBuffer;
pub use events::{ChannelEventHandler, DashEvent, DashEventHandler, DashEventRecord};
pub use group::GroupUserData;
pub use period::PeriodManager;
pub use session::{DashSession, QualityRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library with default configuration
pub fn init() {
    tracing::info!(version = VERSION, "Kino DASH initialized");
}
