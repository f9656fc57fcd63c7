//! In-memory transport

use super::{DashIo, IoHandle};
use crate::{types::ByteRange, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
struct Resource {
    body: Bytes,
    mime: Option<String>,
    headers: Vec<(String, String)>,
    /// Reported throughput, overrides the latency based figure
    bytes_per_sec: Option<u64>,
}

#[derive(Debug, Default)]
struct Session {
    url: Option<Url>,
    range: Option<ByteRange>,
    opened: Option<Resource>,
    cache_name: Option<String>,
    bytes_done: u64,
    total_size: Option<u64>,
    bytes_per_sec: u64,
    started: Option<DateTime<Utc>>,
    aborted: bool,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    next_cache: u64,
    resources: HashMap<String, Resource>,
    transport_failures: HashMap<String, u32>,
    sessions: HashMap<u64, Session>,
    cache: HashMap<String, Bytes>,
    deleted: Vec<String>,
    requests: Vec<String>,
}

/// Serves registered resources from memory and records what the client did
///
/// Unknown URLs answer "not found", which is how a live segment that is not
/// produced yet looks to the client.
#[derive(Debug, Default)]
pub struct MemoryIo {
    state: Mutex<State>,
    latency: Duration,
}

fn key(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl MemoryIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every transfer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn insert(&self, url: &str, body: impl Into<Bytes>) {
        self.insert_resource(url, body.into(), None);
    }

    pub fn insert_with_mime(&self, url: &str, body: impl Into<Bytes>, mime: &str) {
        self.insert_resource(url, body.into(), Some(mime.to_string()));
    }

    fn insert_resource(&self, url: &str, body: Bytes, mime: Option<String>) {
        self.state.lock().resources.insert(
            key(url),
            Resource {
                body,
                mime,
                headers: Vec::new(),
                bytes_per_sec: None,
            },
        );
    }

    /// Remove a resource, further requests answer "not found"
    pub fn remove(&self, url: &str) {
        self.state.lock().resources.remove(&key(url));
    }

    /// Add a response header to a registered resource
    pub fn set_header(&self, url: &str, name: &str, value: &str) {
        if let Some(resource) = self.state.lock().resources.get_mut(&key(url)) {
            resource.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// Throughput reported for transfers of a registered resource
    pub fn set_bytes_per_sec(&self, url: &str, bytes_per_sec: u64) {
        if let Some(resource) = self.state.lock().resources.get_mut(&key(url)) {
            resource.bytes_per_sec = Some(bytes_per_sec);
        }
    }

    /// Fail the next `times` requests of a URL with a transport error
    pub fn fail_transport(&self, url: &str, times: u32) {
        self.state.lock().transport_failures.insert(key(url), times);
    }

    /// URLs requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    /// Cache entries removed through `delete_cache_file`
    pub fn deleted_cache_files(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    /// Cache entries still present
    pub fn cached_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().cache.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sessions created and not yet released
    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

#[async_trait]
impl DashIo for MemoryIo {
    fn create(&self, _persistent: bool, url: &Url, _group: Option<usize>) -> Result<IoHandle> {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let id = state.next_handle;
        state.sessions.insert(
            id,
            Session {
                url: Some(url.clone()),
                ..Default::default()
            },
        );
        Ok(IoHandle(id))
    }

    fn del(&self, handle: IoHandle) {
        self.state.lock().sessions.remove(&handle.0);
    }

    fn abort(&self, handle: IoHandle) {
        if let Some(session) = self.state.lock().sessions.get_mut(&handle.0) {
            session.aborted = true;
        }
    }

    fn setup_from_url(&self, handle: IoHandle, url: &Url, _group: Option<usize>) -> Result<()> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?;
        session.url = Some(url.clone());
        session.range = None;
        session.opened = None;
        session.aborted = false;
        Ok(())
    }

    fn set_range(
        &self,
        handle: IoHandle,
        range: Option<ByteRange>,
        _discontinue_cache: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?;
        session.range = range;
        Ok(())
    }

    async fn init(&self, handle: IoHandle) -> Result<()> {
        let mut state = self.state.lock();
        let url = state
            .sessions
            .get(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?
            .url
            .clone()
            .ok_or_else(|| Error::transport("session has no URL"))?;
        let url_key = url.to_string();
        state.requests.push(url_key.clone());

        if let Some(remaining) = state.transport_failures.get_mut(&url_key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::SegmentFetch {
                    url: url_key,
                    reason: "connection reset".into(),
                });
            }
        }

        let resource = state
            .resources
            .get(&url_key)
            .cloned()
            .ok_or_else(|| Error::SegmentNotFound {
                url: url_key.clone(),
            })?;
        if let Some(session) = state.sessions.get_mut(&handle.0) {
            session.total_size = Some(resource.body.len() as u64);
            session.opened = Some(resource);
            session.started = Some(Utc::now());
            session.aborted = false;
        }
        Ok(())
    }

    async fn run(&self, handle: IoHandle) -> Result<()> {
        let opened = self
            .state
            .lock()
            .sessions
            .get(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?
            .opened
            .is_some();
        if !opened {
            self.init(handle).await?;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock();
        state.next_cache += 1;
        let cache_name = format!("memory://cache/{}", state.next_cache);
        let session = state
            .sessions
            .get_mut(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?;
        if session.aborted {
            session.opened = None;
            return Err(Error::Aborted);
        }
        let resource = session
            .opened
            .take()
            .ok_or_else(|| Error::transport("transfer was not opened"))?;

        let body = match session.range {
            Some(range) => {
                let len = resource.body.len() as u64;
                let start = range.start.min(len) as usize;
                let end = range.end.saturating_add(1).min(len) as usize;
                resource.body.slice(start..end.max(start))
            }
            None => resource.body.clone(),
        };
        session.bytes_done = body.len() as u64;
        session.bytes_per_sec = resource.bytes_per_sec.unwrap_or_else(|| {
            let secs = self.latency.as_secs_f64();
            if secs > 0.0 {
                (body.len() as f64 / secs) as u64
            } else {
                0
            }
        });
        session.cache_name = Some(cache_name.clone());
        debug!(cache = %cache_name, bytes = body.len(), "Memory transfer complete");
        state.cache.insert(cache_name, body);
        Ok(())
    }

    fn get_url(&self, handle: IoHandle) -> Option<Url> {
        self.state.lock().sessions.get(&handle.0)?.url.clone()
    }

    fn get_cache_name(&self, handle: IoHandle) -> Option<String> {
        self.state.lock().sessions.get(&handle.0)?.cache_name.clone()
    }

    fn get_mime(&self, handle: IoHandle) -> Option<String> {
        let state = self.state.lock();
        let url = state.sessions.get(&handle.0)?.url.as_ref()?.to_string();
        state.resources.get(&url)?.mime.clone()
    }

    fn get_header_value(&self, handle: IoHandle, name: &str) -> Option<String> {
        let state = self.state.lock();
        let url = state.sessions.get(&handle.0)?.url.as_ref()?.to_string();
        state
            .resources
            .get(&url)?
            .headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    fn get_utc_start_time(&self, handle: IoHandle) -> Option<DateTime<Utc>> {
        self.state.lock().sessions.get(&handle.0)?.started
    }

    fn get_bytes_per_sec(&self, handle: IoHandle) -> u64 {
        self.state
            .lock()
            .sessions
            .get(&handle.0)
            .map(|s| s.bytes_per_sec)
            .unwrap_or(0)
    }

    fn get_total_size(&self, handle: IoHandle) -> Option<u64> {
        self.state.lock().sessions.get(&handle.0)?.total_size
    }

    fn get_bytes_done(&self, handle: IoHandle) -> u64 {
        self.state
            .lock()
            .sessions
            .get(&handle.0)
            .map(|s| s.bytes_done)
            .unwrap_or(0)
    }

    fn delete_cache_file(&self, cache_name: &str) {
        let mut state = self.state.lock();
        if state.cache.remove(cache_name).is_some() {
            state.deleted.push(cache_name.to_string());
        }
    }

    async fn read_cache_file(&self, cache_name: &str) -> Result<Bytes> {
        self.state.lock().cache.get(cache_name).cloned().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no cache entry {cache_name}"),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_transfer_and_delete() {
        let io = MemoryIo::new();
        io.insert_with_mime("https://cdn.example.com/a.m4s", &b"0123456789"[..], "video/mp4");

        let handle = io.create(true, &url("https://cdn.example.com/a.m4s"), Some(0)).unwrap();
        io.set_range(handle, Some(ByteRange::new(2, 5)), false).unwrap();
        io.run(handle).await.unwrap();

        assert_eq!(io.get_bytes_done(handle), 4);
        assert_eq!(io.get_total_size(handle), Some(10));
        assert_eq!(io.get_mime(handle).as_deref(), Some("video/mp4"));

        let cache = io.get_cache_name(handle).unwrap();
        assert_eq!(io.read_cache_file(&cache).await.unwrap(), Bytes::from_static(b"2345"));

        io.delete_cache_file(&cache);
        assert_eq!(io.deleted_cache_files(), vec![cache.clone()]);
        assert!(io.cached_files().is_empty());
        assert!(io.read_cache_file(&cache).await.is_err());
    }

    #[tokio::test]
    async fn test_not_found_and_transport_failures() {
        let io = MemoryIo::new();
        let handle = io.create(true, &url("https://cdn.example.com/b.m4s"), Some(0)).unwrap();
        let err = io.run(handle).await.unwrap_err();
        assert!(err.is_not_found());

        io.insert("https://cdn.example.com/b.m4s", &b"ok"[..]);
        io.fail_transport("https://cdn.example.com/b.m4s", 1);
        io.setup_from_url(handle, &url("https://cdn.example.com/b.m4s"), Some(0)).unwrap();
        assert!(matches!(io.run(handle).await, Err(Error::SegmentFetch { .. })));
        io.setup_from_url(handle, &url("https://cdn.example.com/b.m4s"), Some(0)).unwrap();
        assert!(io.run(handle).await.is_ok());
        assert_eq!(io.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_abort() {
        let io = MemoryIo::new();
        io.insert("https://cdn.example.com/c.m4s", &b"ok"[..]);
        let handle = io.create(true, &url("https://cdn.example.com/c.m4s"), None).unwrap();
        io.init(handle).await.unwrap();
        io.abort(handle);
        assert!(matches!(io.run(handle).await, Err(Error::Aborted)));

        io.del(handle);
        assert_eq!(io.open_sessions(), 0);
    }
}
