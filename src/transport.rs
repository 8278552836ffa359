//! Byte transport for the engine: HTTP with a shared connection pool, and the
//! cache-backed wrapper used for on-demand content

use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::errors::TransportError;
use crate::request::ContentKind;

/// Byte range of a read. `length: None` reads to the end of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ByteRange {
    pub start: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub const FULL: ByteRange = ByteRange { start: 0, length: None };

    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length: Some(length) }
    }

    pub fn starting_at(start: u64) -> Self {
        Self { start, length: None }
    }

    pub fn is_empty(&self) -> bool {
        self.length == Some(0)
    }

    /// Value for the HTTP `Range` header, `None` for a whole-resource read.
    /// Empty ranges never reach the network, see [`HttpDataSource`].
    pub fn header_value(&self) -> Option<String> {
        match (self.start, self.length) {
            (0, None) => None,
            (start, None) => Some(format!("bytes={}-", start)),
            (start, Some(len)) => Some(format!("bytes={}-{}", start, start + len.saturating_sub(1))),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.length {
            Some(len) => write!(f, "{}+{}", self.start, len),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// Source of media bytes handed to the engine
pub trait DataSource: Send + Sync {
    fn read(&self, uri: &str, range: ByteRange) -> Result<Vec<u8>, TransportError>;
}

/// Running count of bytes received from the network, shared by all sources
#[derive(Debug, Clone, Default)]
pub struct BandwidthMeter {
    received: Arc<AtomicU64>,
}

impl BandwidthMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Applies to receiving the response and its body
    pub read_timeout_secs: u64,
    /// Applies to sending the request
    pub write_timeout_secs: u64,
    /// Attempts per read when the connection itself fails
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_idle_connections: usize,
    pub max_idle_connections_per_host: usize,
    pub chunk_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "XtremePlayback/1.0".to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            max_attempts: 3,
            retry_delay_ms: 500,
            max_idle_connections: 20,
            max_idle_connections_per_host: 10,
            chunk_size: 64 * 1024, // 64KB chunks
        }
    }
}

/// Network source backed by a pooled ureq agent.
///
/// Cloning is cheap and shares the connection pool, so one instance can serve
/// every session and the rest of the application.
#[derive(Clone)]
pub struct HttpDataSource {
    agent: ureq::Agent,
    config: HttpConfig,
    meter: BandwidthMeter,
}

impl HttpDataSource {
    pub fn new(config: HttpConfig, meter: BandwidthMeter) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_connect(Some(Duration::from_secs(config.connect_timeout_secs)))
            .timeout_send_request(Some(Duration::from_secs(config.write_timeout_secs)))
            .timeout_send_body(Some(Duration::from_secs(config.write_timeout_secs)))
            .timeout_recv_response(Some(Duration::from_secs(config.read_timeout_secs)))
            .timeout_recv_body(Some(Duration::from_secs(config.read_timeout_secs)))
            .max_idle_connections(config.max_idle_connections)
            .max_idle_connections_per_host(config.max_idle_connections_per_host)
            .http_status_as_error(false)
            .build()
            .new_agent();

        Self { agent, config, meter }
    }

    pub fn meter(&self) -> &BandwidthMeter {
        &self.meter
    }

    fn try_read(&self, uri: &str, range: ByteRange) -> Result<Vec<u8>, TransportError> {
        let mut request = self.agent.get(uri).header("User-Agent", &self.config.user_agent);
        let ranged = range.header_value();
        if let Some(value) = &ranged {
            request = request.header("Range", value.as_str());
        }

        let response = request.call()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::InvalidResponseCode(status.as_u16()));
        }

        let mut reader = response.into_body().into_reader();

        // A server that ignores Range answers 200 with the whole resource
        if ranged.is_some() && status.as_u16() != 206 && range.start > 0 {
            debug!("{} ignored the Range header, skipping {} bytes", uri, range.start);
            let skipped = io::copy(&mut (&mut reader).take(range.start), &mut io::sink())?;
            self.meter.record(skipped);
            if skipped < range.start {
                return Ok(Vec::new());
            }
        }

        let mut reader: Box<dyn Read> = match range.length {
            Some(len) => Box::new(reader.take(len)),
            None => Box::new(reader),
        };

        let mut data = Vec::new();
        let mut buffer = vec![0u8; self.config.chunk_size];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    data.extend_from_slice(&buffer[..n]);
                    self.meter.record(n as u64);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(data)
    }
}

impl DataSource for HttpDataSource {
    fn read(&self, uri: &str, range: ByteRange) -> Result<Vec<u8>, TransportError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_read(uri, range) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_transient() && attempts < self.config.max_attempts => {
                    debug!("Retrying {} after connection failure ({}/{}): {}", uri, attempts, self.config.max_attempts, e);
                    std::thread::sleep(Duration::from_millis(self.config.retry_delay_ms));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Serves reads from the media cache when possible. Cache trouble of any kind
/// is logged and bypassed; only upstream errors reach the caller.
pub struct CachedDataSource {
    upstream: Arc<dyn DataSource>,
    cache: Arc<dyn CacheStore>,
}

impl CachedDataSource {
    pub fn new(upstream: Arc<dyn DataSource>, cache: Arc<dyn CacheStore>) -> Self {
        Self { upstream, cache }
    }
}

impl DataSource for CachedDataSource {
    fn read(&self, uri: &str, range: ByteRange) -> Result<Vec<u8>, TransportError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let key = CacheKey::new(uri, range);
        match self.cache.get(&key) {
            Ok(Some(data)) => {
                debug!("Cache hit for {} [{}]", uri, range);
                return Ok(data);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring media cache for {} [{}]: {}", uri, range, e),
        }

        let data = self.upstream.read(uri, range)?;
        if let Err(e) = self.cache.put(&key, &data) {
            warn!("Could not cache {} [{}]: {}", uri, range, e);
        }
        Ok(data)
    }
}

/// Pick the data source for a content kind. Live streams always go straight
/// to the network; on-demand items go through the cache when one is available.
pub fn data_source_for(
    kind: ContentKind,
    upstream: Arc<dyn DataSource>,
    cache: Option<Arc<dyn CacheStore>>,
) -> Arc<dyn DataSource> {
    match (kind, cache) {
        (ContentKind::Live, _) | (_, None) => upstream,
        (_, Some(cache)) => Arc::new(CachedDataSource::new(upstream, cache)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::errors::CacheError;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    /// Loopback HTTP server answering every connection with `respond(head)`.
    /// Request heads are kept, lowercased, in arrival order.
    struct TestServer {
        url: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl TestServer {
        fn start<F>(respond: F) -> Self
        where
            F: Fn(&str) -> Vec<u8> + Send + 'static,
        {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let url = format!("http://{}/movie/u/p/1.mp4", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&requests);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let head = read_head(&mut stream);
                    seen.lock().unwrap().push(head.clone());
                    let _ = stream.write_all(&respond(&head));
                }
            });
            Self { url, requests }
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(1) => head.push(byte[0]),
                _ => break,
            }
        }
        String::from_utf8_lossy(&head).to_lowercase()
    }

    fn response(status: &str, body: &[u8]) -> Vec<u8> {
        let mut out =
            format!("HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", status, body.len()).into_bytes();
        out.extend_from_slice(body);
        out
    }

    fn quick_config() -> HttpConfig {
        HttpConfig { read_timeout_secs: 1, retry_delay_ms: 50, ..HttpConfig::default() }
    }

    struct CountingSource {
        reads: AtomicUsize,
        fail_with: Option<u16>,
    }

    impl CountingSource {
        fn new() -> Self {
            Self { reads: AtomicUsize::new(0), fail_with: None }
        }
    }

    impl DataSource for CountingSource {
        fn read(&self, uri: &str, range: ByteRange) -> Result<Vec<u8>, TransportError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(code) = self.fail_with {
                return Err(TransportError::InvalidResponseCode(code));
            }
            Ok(format!("{}@{}", uri, range).into_bytes())
        }
    }

    struct CorruptCache;

    impl CacheStore for CorruptCache {
        fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Corrupt(key.id()))
        }
        fn put(&self, key: &CacheKey, _data: &[u8]) -> Result<(), CacheError> {
            Err(CacheError::Corrupt(key.id()))
        }
        fn remove(&self, _key: &CacheKey) -> Result<(), CacheError> {
            Ok(())
        }
        fn used_bytes(&self) -> u64 {
            0
        }
        fn capacity(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_range_header() {
        assert_eq!(ByteRange::FULL.header_value(), None);
        assert_eq!(ByteRange::starting_at(100).header_value().as_deref(), Some("bytes=100-"));
        assert_eq!(ByteRange::new(0, 1024).header_value().as_deref(), Some("bytes=0-1023"));
    }

    #[test]
    fn test_http_read_counts_received_bytes() {
        let server = TestServer::start(|_| response("200 OK", b"0123456789"));
        let meter = BandwidthMeter::new();
        let source = HttpDataSource::new(quick_config(), meter.clone());

        let data = source.read(&server.url, ByteRange::FULL).unwrap();
        assert_eq!(data, b"0123456789".to_vec());
        assert_eq!(meter.total_bytes(), 10);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].contains("user-agent: xtremeplayback/1.0"));
        assert!(!requests[0].contains("range:"));
    }

    #[test]
    fn test_partial_content_is_returned_as_is() {
        let server = TestServer::start(|_| response("206 Partial Content", b"567"));
        let source = HttpDataSource::new(quick_config(), BandwidthMeter::new());

        let data = source.read(&server.url, ByteRange::new(5, 3)).unwrap();
        assert_eq!(data, b"567".to_vec());
        assert!(server.requests()[0].contains("range: bytes=5-7"));
    }

    #[test]
    fn test_server_ignoring_range_still_yields_requested_bytes() {
        let server = TestServer::start(|_| response("200 OK", b"0123456789"));
        let meter = BandwidthMeter::new();
        let source = HttpDataSource::new(quick_config(), meter.clone());

        assert_eq!(source.read(&server.url, ByteRange::new(5, 3)).unwrap(), b"567".to_vec());
        // Skipped bytes still crossed the network
        assert_eq!(meter.total_bytes(), 8);
        assert_eq!(source.read(&server.url, ByteRange::starting_at(8)).unwrap(), b"89".to_vec());
        assert!(source.read(&server.url, ByteRange::new(20, 4)).unwrap().is_empty());
    }

    #[test]
    fn test_cached_range_from_server_ignoring_range() {
        let server = TestServer::start(|_| response("200 OK", b"0123456789"));
        let upstream = Arc::new(HttpDataSource::new(quick_config(), BandwidthMeter::new()));
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(1024));
        let source = data_source_for(ContentKind::Vod, upstream, Some(cache.clone()));

        source.read(&server.url, ByteRange::new(2, 4)).unwrap();
        let cached = cache.get(&CacheKey::new(&server.url, ByteRange::new(2, 4))).unwrap();
        assert_eq!(cached, Some(b"2345".to_vec()));
    }

    #[test]
    fn test_http_status_is_not_retried() {
        let server = TestServer::start(|_| response("404 Not Found", b"missing"));
        let source = HttpDataSource::new(quick_config(), BandwidthMeter::new());

        let err = source.read(&server.url, ByteRange::FULL).unwrap_err();
        assert!(matches!(err, TransportError::InvalidResponseCode(404)));
        assert_eq!(server.requests().len(), 1);
    }

    #[test]
    fn test_refused_connection_is_retried() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let config = HttpConfig { max_attempts: 3, retry_delay_ms: 100, ..quick_config() };
        let source = HttpDataSource::new(config, BandwidthMeter::new());

        let started = Instant::now();
        let err = source.read(&format!("http://127.0.0.1:{}/live/u/p/1.ts", port), ByteRange::FULL).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)), "{:?}", err);
        // Two pauses between three attempts
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_timeout_is_not_retried() {
        let server = TestServer::start(|_| {
            thread::sleep(Duration::from_secs(3));
            response("200 OK", b"late")
        });
        let config = HttpConfig { retry_delay_ms: 1000, ..quick_config() };
        let source = HttpDataSource::new(config, BandwidthMeter::new());

        let started = Instant::now();
        let err = source.read(&server.url, ByteRange::FULL).unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(server.requests().len(), 1);
    }

    #[test]
    fn test_empty_range_skips_the_network() {
        let server = TestServer::start(|_| response("200 OK", b"0123456789"));
        let source = HttpDataSource::new(quick_config(), BandwidthMeter::new());

        assert!(ByteRange::new(4, 0).is_empty());
        assert!(source.read(&server.url, ByteRange::new(4, 0)).unwrap().is_empty());
        assert!(server.requests().is_empty());
    }

    #[test]
    fn test_second_read_is_served_from_cache() {
        let upstream = Arc::new(CountingSource::new());
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(1024 * 1024));
        let source = data_source_for(ContentKind::Vod, upstream.clone(), Some(cache.clone()));

        let first = source.read("http://x.test/movie/u/p/1.mp4", ByteRange::new(0, 10)).unwrap();
        let second = source.read("http://x.test/movie/u/p/1.mp4", ByteRange::new(0, 10)).unwrap();
        assert_eq!(first, second);
        assert_eq!(upstream.reads.load(Ordering::SeqCst), 1);

        // A different range is a different entry
        source.read("http://x.test/movie/u/p/1.mp4", ByteRange::new(10, 10)).unwrap();
        assert_eq!(upstream.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_live_bypasses_cache() {
        let upstream = Arc::new(CountingSource::new());
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(1024 * 1024));
        let source = data_source_for(ContentKind::Live, upstream.clone(), Some(cache.clone()));

        source.read("http://x.test/live/u/p/1.m3u8", ByteRange::FULL).unwrap();
        source.read("http://x.test/live/u/p/1.m3u8", ByteRange::FULL).unwrap();
        assert_eq!(upstream.reads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_corrupt_cache_falls_back_to_network() {
        let upstream = Arc::new(CountingSource::new());
        let cache: Arc<dyn CacheStore> = Arc::new(CorruptCache);
        let source = data_source_for(ContentKind::Vod, upstream.clone(), Some(cache));

        let data = source.read("http://x.test/movie/u/p/9.mkv", ByteRange::new(0, 4)).unwrap();
        assert_eq!(data, b"http://x.test/movie/u/p/9.mkv@0+4".to_vec());
        assert_eq!(upstream.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upstream_errors_propagate() {
        let upstream = Arc::new(CountingSource { reads: AtomicUsize::new(0), fail_with: Some(404) });
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(1024));
        let source = data_source_for(ContentKind::Series, upstream, Some(cache.clone()));

        let err = source.read("http://x.test/series/u/p/2.mp4", ByteRange::FULL).unwrap_err();
        assert!(matches!(err, TransportError::InvalidResponseCode(404)));
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_meter_accumulates() {
        let meter = BandwidthMeter::new();
        let shared = meter.clone();
        meter.record(1000);
        shared.record(24);
        assert_eq!(meter.total_bytes(), 1024);
    }
}
