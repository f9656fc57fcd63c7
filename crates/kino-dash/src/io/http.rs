//! reqwest transport writing bodies into a cache directory

use super::{is_local_url, DashIo, IoHandle};
use crate::{types::ByteRange, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE, RANGE},
    Client, Response, StatusCode,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

struct HttpSession {
    url: Url,
    range: Option<ByteRange>,
    cancel: CancellationToken,
    response: Option<Response>,
    headers: HeaderMap,
    final_url: Option<Url>,
    mime: Option<String>,
    cache_name: Option<String>,
    started: Option<DateTime<Utc>>,
    bytes_done: u64,
    total_size: Option<u64>,
    bytes_per_sec: u64,
}

impl HttpSession {
    fn new(url: Url) -> Self {
        Self {
            url,
            range: None,
            cancel: CancellationToken::new(),
            response: None,
            headers: HeaderMap::new(),
            final_url: None,
            mime: None,
            cache_name: None,
            started: None,
            bytes_done: 0,
            total_size: None,
            bytes_per_sec: 0,
        }
    }
}

/// HTTP transport backed by reqwest
///
/// Every completed body lands in its own file under the cache directory;
/// `delete_cache_file` only ever removes files inside that directory.
pub struct HttpIo {
    client: Client,
    cache_dir: PathBuf,
    sessions: Mutex<HashMap<u64, HttpSession>>,
    next_handle: AtomicU64,
    next_cache: AtomicU64,
}

fn cache_file_stem(url: &Url) -> String {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("resource");
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl HttpIo {
    /// Create a transport with a default client
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Self::with_client(client, cache_dir)
    }

    /// Create a transport with a preconfigured client
    pub fn with_client(client: Client, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            client,
            cache_dir,
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            next_cache: AtomicU64::new(1),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn request_parts(&self, handle: IoHandle) -> Result<(Url, Option<ByteRange>, CancellationToken)> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?;
        Ok((session.url.clone(), session.range, session.cancel.clone()))
    }

    async fn send(&self, url: &Url, range: Option<ByteRange>) -> Result<Response> {
        let mut request = self.client.get(url.as_str());
        if let Some(range) = range {
            request = request.header(RANGE, format!("bytes={range}"));
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(Error::SegmentNotFound {
                url: url.to_string(),
            }),
            status if !status.is_success() => Err(Error::SegmentFetch {
                url: url.to_string(),
                reason: status.to_string(),
            }),
            _ => Ok(response),
        }
    }

    fn with_session<T>(&self, handle: IoHandle, f: impl FnOnce(&HttpSession) -> T) -> Option<T> {
        self.sessions.lock().get(&handle.0).map(f)
    }
}

#[async_trait]
impl DashIo for HttpIo {
    fn create(&self, _persistent: bool, url: &Url, _group: Option<usize>) -> Result<IoHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(id, HttpSession::new(url.clone()));
        Ok(IoHandle(id))
    }

    fn del(&self, handle: IoHandle) {
        if let Some(session) = self.sessions.lock().remove(&handle.0) {
            session.cancel.cancel();
        }
    }

    fn abort(&self, handle: IoHandle) {
        if let Some(session) = self.sessions.lock().get(&handle.0) {
            debug!(handle = %handle, url = %session.url, "Aborting transfer");
            session.cancel.cancel();
        }
    }

    fn setup_from_url(&self, handle: IoHandle, url: &Url, _group: Option<usize>) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?;
        session.url = url.clone();
        session.range = None;
        session.response = None;
        session.cancel = CancellationToken::new();
        Ok(())
    }

    fn set_range(
        &self,
        handle: IoHandle,
        range: Option<ByteRange>,
        _discontinue_cache: bool,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?;
        session.range = range;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn init(&self, handle: IoHandle) -> Result<()> {
        let (url, range, cancel) = self.request_parts(handle)?;
        let started = Utc::now();

        if is_local_url(&url) {
            let path = url
                .to_file_path()
                .map_err(|_| Error::transport(format!("not a file path: {url}")))?;
            let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::SegmentNotFound {
                        url: url.to_string(),
                    }
                } else {
                    Error::Io(e)
                }
            })?;
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&handle.0)
                .ok_or(Error::UnknownHandle(handle.0))?;
            session.total_size = Some(metadata.len());
            session.final_url = Some(url);
            session.started = Some(started);
            return Ok(());
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Aborted),
            response = self.send(&url, range) => response?,
        };

        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?;
        session.headers = response.headers().clone();
        session.final_url = Some(response.url().clone());
        session.mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        session.total_size = response.content_length();
        session.started = Some(started);
        session.bytes_done = 0;
        session.response = Some(response);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn run(&self, handle: IoHandle) -> Result<()> {
        let (url, _, cancel) = self.request_parts(handle)?;

        if is_local_url(&url) {
            self.init(handle).await?;
            let path = url
                .to_file_path()
                .map_err(|_| Error::transport(format!("not a file path: {url}")))?;
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(&handle.0)
                .ok_or(Error::UnknownHandle(handle.0))?;
            session.bytes_done = session.total_size.unwrap_or(0);
            session.cache_name = Some(path.to_string_lossy().into_owned());
            return Ok(());
        }

        let pending = self
            .sessions
            .lock()
            .get_mut(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?
            .response
            .take();
        let mut response = match pending {
            Some(response) => response,
            None => {
                self.init(handle).await?;
                self.sessions
                    .lock()
                    .get_mut(&handle.0)
                    .and_then(|s| s.response.take())
                    .ok_or_else(|| Error::transport("response vanished"))?
            }
        };

        let index = self.next_cache.fetch_add(1, Ordering::Relaxed);
        let path = self
            .cache_dir
            .join(format!("{index:08}-{}", cache_file_stem(&url)));
        let mut file = tokio::fs::File::create(&path).await?;
        let written = write_body(&mut response, &mut file, &cancel).await;
        drop(file);
        let (bytes_done, elapsed) = match written {
            Ok(written) => written,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %rm, "Failed to remove partial cache file");
                }
                return Err(e);
            }
        };

        let bytes_per_sec = if elapsed.as_secs_f64() > 0.0 {
            (bytes_done as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };

        debug!(
            url = %url,
            bytes = bytes_done,
            duration_ms = elapsed.as_millis(),
            "Transfer complete"
        );

        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&handle.0)
            .ok_or(Error::UnknownHandle(handle.0))?;
        session.bytes_done = bytes_done;
        session.bytes_per_sec = bytes_per_sec;
        session.cache_name = Some(path.to_string_lossy().into_owned());
        Ok(())
    }

    fn get_url(&self, handle: IoHandle) -> Option<Url> {
        self.with_session(handle, |s| s.final_url.clone().unwrap_or_else(|| s.url.clone()))
    }

    fn get_cache_name(&self, handle: IoHandle) -> Option<String> {
        self.with_session(handle, |s| s.cache_name.clone()).flatten()
    }

    fn get_mime(&self, handle: IoHandle) -> Option<String> {
        self.with_session(handle, |s| s.mime.clone()).flatten()
    }

    fn get_header_value(&self, handle: IoHandle, name: &str) -> Option<String> {
        self.with_session(handle, |s| {
            s.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .flatten()
    }

    fn get_utc_start_time(&self, handle: IoHandle) -> Option<DateTime<Utc>> {
        self.with_session(handle, |s| s.started).flatten()
    }

    fn get_bytes_per_sec(&self, handle: IoHandle) -> u64 {
        self.with_session(handle, |s| s.bytes_per_sec).unwrap_or(0)
    }

    fn get_total_size(&self, handle: IoHandle) -> Option<u64> {
        self.with_session(handle, |s| s.total_size).flatten()
    }

    fn get_bytes_done(&self, handle: IoHandle) -> u64 {
        self.with_session(handle, |s| s.bytes_done).unwrap_or(0)
    }

    fn delete_cache_file(&self, cache_name: &str) {
        let path = Path::new(cache_name);
        if !path.starts_with(&self.cache_dir) {
            warn!(cache = cache_name, "Refusing to delete file outside the cache directory");
            return;
        }
        // Inline: callers expect the file gone on return
        match std::fs::remove_file(path) {
            Ok(()) => debug!(cache = cache_name, "Cache file deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(cache = cache_name, error = %e, "Failed to delete cache file"),
        }
    }
}

/// Stream a response body into `file`, returning bytes written and the time
/// since the first byte
async fn write_body(
    response: &mut Response,
    file: &mut tokio::fs::File,
    cancel: &CancellationToken,
) -> Result<(u64, Duration)> {
    let mut bytes_done = 0u64;
    let mut first_byte: Option<Instant> = None;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Aborted),
            chunk = response.chunk() => chunk?,
        };
        let Some(chunk) = chunk else { break };
        first_byte.get_or_insert_with(Instant::now);
        file.write_all(&chunk).await?;
        bytes_done += chunk.len() as u64;
    }
    file.flush().await?;
    Ok((bytes_done, first_byte.map(|t| t.elapsed()).unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_into_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/video/seg-1.m4s"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"segment_data_1".to_vec())
                    .insert_header("Content-Type", "video/mp4")
                    .insert_header("Server-UTC", "1714564800000"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let io = HttpIo::new(dir.path()).unwrap();
        let url = Url::parse(&format!("{}/video/seg-1.m4s", server.uri())).unwrap();
        let handle = io.create(true, &url, Some(0)).unwrap();
        io.init(handle).await.unwrap();
        io.run(handle).await.unwrap();

        assert_eq!(io.get_mime(handle).as_deref(), Some("video/mp4"));
        assert_eq!(
            io.get_header_value(handle, "server-utc").as_deref(),
            Some("1714564800000")
        );
        assert_eq!(io.get_bytes_done(handle), 14);

        let cache = io.get_cache_name(handle).unwrap();
        assert!(cache.ends_with("seg-1.m4s"));
        assert_eq!(std::fs::read(&cache).unwrap(), b"segment_data_1");

        io.delete_cache_file(&cache);
        assert!(!Path::new(&cache).exists());
    }

    #[tokio::test]
    async fn test_range_and_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/movie.mp4"))
            .and(header("Range", "bytes=0-3"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"moov".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let io = HttpIo::new(dir.path()).unwrap();
        let url = Url::parse(&format!("{}/movie.mp4", server.uri())).unwrap();
        let handle = io.create(true, &url, Some(0)).unwrap();
        io.set_range(handle, Some(ByteRange::new(0, 3)), false).unwrap();
        io.run(handle).await.unwrap();
        assert_eq!(io.get_bytes_done(handle), 4);

        let missing = Url::parse(&format!("{}/live/seg-99.m4s", server.uri())).unwrap();
        io.setup_from_url(handle, &missing, Some(0)).unwrap();
        let err = io.run(handle).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_local_files_are_not_copied() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("local.m4s");
        std::fs::write(&media, b"local").unwrap();

        let io = HttpIo::new(dir.path().join("cache")).unwrap();
        let url = Url::from_file_path(&media).unwrap();
        let handle = io.create(false, &url, None).unwrap();
        io.run(handle).await.unwrap();
        assert_eq!(io.get_bytes_done(handle), 5);
        assert_eq!(
            io.get_cache_name(handle).unwrap(),
            media.to_string_lossy().into_owned()
        );

        // Outside the cache directory: never removed
        io.delete_cache_file(&media.to_string_lossy());
        assert!(media.exists());
    }

    #[tokio::test]
    async fn test_abort_before_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let io = HttpIo::new(dir.path()).unwrap();
        let url = Url::parse("http://127.0.0.1:9/never.m4s").unwrap();
        let handle = io.create(true, &url, Some(0)).unwrap();
        io.abort(handle);
        assert!(matches!(io.init(handle).await, Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn test_truncated_body_leaves_no_cache_file() {
        // Announces 100 bytes, sends 10, then hangs up
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: video/mp4\r\nContent-Length: 100\r\n\r\n0123456789")
                .await
                .unwrap();
            socket.flush().await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let io = HttpIo::new(dir.path()).unwrap();
        let url = Url::parse(&format!("http://{addr}/live/seg-7.m4s")).unwrap();
        let handle = io.create(true, &url, Some(0)).unwrap();
        assert!(io.run(handle).await.is_err());

        assert!(io.get_cache_name(handle).is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
