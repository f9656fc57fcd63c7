//! Transport boundary
//!
//! The client never talks HTTP itself. Every manifest, init segment and media
//! segment goes through a [`DashIo`] implementation injected at session
//! construction:
//! - [`HttpIo`] (feature `http`): reqwest client writing bodies to a cache directory
//! - [`MemoryIo`]: resources served from memory, for tests and hosts that
//!   already hold the media

#[cfg(feature = "http")]
mod http;
mod memory;

#[cfg(feature = "http")]
pub use http::HttpIo;
pub use memory::MemoryIo;

use crate::{types::ByteRange, Resolution, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Opaque download session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoHandle(pub u64);

impl std::fmt::Display for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "io#{}", self.0)
    }
}

/// Representation properties the host is asked to decode
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecQuery<'a> {
    pub mime: Option<&'a str>,
    pub codecs: Option<&'a str>,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
}

/// Download sessions used by the client
///
/// `group` is `None` for session-global resources (the manifest). A failed
/// `init`/`run` reports a missing resource as [`Error::SegmentNotFound`] and
/// a cancelled transfer as [`Error::Aborted`].
///
/// [`Error::SegmentNotFound`]: crate::Error::SegmentNotFound
/// [`Error::Aborted`]: crate::Error::Aborted
#[async_trait]
pub trait DashIo: Send + Sync {
    /// Create a download session; persistent sessions are reused across segments
    fn create(&self, persistent: bool, url: &Url, group: Option<usize>) -> Result<IoHandle>;

    /// Release a session
    fn del(&self, handle: IoHandle);

    /// Cancel the transfer in flight on a session, if any
    fn abort(&self, handle: IoHandle);

    /// Point an existing session at a new resource
    fn setup_from_url(&self, handle: IoHandle, url: &Url, group: Option<usize>) -> Result<()>;

    /// Restrict the next transfer to a byte range (None = whole resource)
    fn set_range(
        &self,
        handle: IoHandle,
        range: Option<ByteRange>,
        discontinue_cache: bool,
    ) -> Result<()>;

    /// Open the transfer and receive the response headers
    async fn init(&self, handle: IoHandle) -> Result<()>;

    /// Complete the transfer into the cache
    async fn run(&self, handle: IoHandle) -> Result<()>;

    /// Final URL of the resource, after redirects
    fn get_url(&self, handle: IoHandle) -> Option<Url>;

    /// Cache entry holding the last transferred body
    fn get_cache_name(&self, handle: IoHandle) -> Option<String>;

    fn get_mime(&self, handle: IoHandle) -> Option<String>;

    fn get_header_value(&self, handle: IoHandle, name: &str) -> Option<String>;

    /// Local time at which the last transfer started
    fn get_utc_start_time(&self, handle: IoHandle) -> Option<DateTime<Utc>>;

    /// Body throughput of the last transfer
    fn get_bytes_per_sec(&self, handle: IoHandle) -> u64;

    fn get_total_size(&self, handle: IoHandle) -> Option<u64>;

    fn get_bytes_done(&self, handle: IoHandle) -> u64;

    /// Remove a cache entry once the player consumed it
    fn delete_cache_file(&self, cache_name: &str);

    /// Read a cache entry back (manifests are parsed from here)
    async fn read_cache_file(&self, cache_name: &str) -> Result<Bytes> {
        Ok(Bytes::from(tokio::fs::read(cache_name).await?))
    }

    /// Can the host decode this representation
    fn codec_supported(&self, _query: &CodecQuery<'_>) -> bool {
        true
    }
}

/// Is this URL served from the local filesystem
pub fn is_local_url(url: &Url) -> bool {
    url.scheme() == "file"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_url() {
        assert!(is_local_url(&Url::parse("file:///tmp/seg.m4s").unwrap()));
        assert!(!is_local_url(&Url::parse("https://cdn.example.com/seg.m4s").unwrap()));
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(IoHandle(7).to_string(), "io#7");
    }
}
