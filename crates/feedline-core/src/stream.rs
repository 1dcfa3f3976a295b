//! Long-lived HTTP filter stream with stall detection.
//!
//! Uses async reqwest internally with tokio::time::timeout per read,
//! but presents a sync `BufRead` so the controller stays single-threaded.
//! Reconnection policy lives here, not in the controller.

use std::io::{self, BufRead, BufReader, Read};
use std::pin::Pin;
use std::sync::LazyLock;
use std::task::Context;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, ReadBuf};

use crate::credentials::Credentials;
use crate::error::IngestError;
use crate::retry::{reconnect_delay, sleep_unless_shutdown};
use crate::shutdown::ShutdownFlag;
use crate::source::{process_lines, SourceExit, SourceStats, StreamListener, StreamSource};

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default stall timeout; upstream sends keep-alives well inside this window
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Default consecutive failed connection attempts before giving up
pub const DEFAULT_MAX_RECONNECTS: u32 = 10;

/// Default filter endpoint
pub const DEFAULT_STREAM_URL: &str = "https://stream.twitter.com/1.1/statuses/filter.json";

/// Line buffer for the stream reader (64KB)
const STREAM_BUF_SIZE: usize = 64 * 1024;

/// Error types for stream operations
#[derive(Debug)]
pub enum StreamError {
    /// HTTP error with optional status code
    Http {
        status: Option<u16>,
        message: String,
    },
    /// I/O error (read stall, connection reset)
    Io(std::io::Error),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl StreamError {
    /// Create HTTP error from reqwest error
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_builder() {
            return Self::Io(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()));
        }
        Self::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }

    /// Status code the upstream answered with, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => *status,
            Self::Io(_) => None,
        }
    }

    /// 420 (legacy "enhance your calm") and 429 both mean rate limited.
    pub fn is_rate_limit(&self) -> bool {
        self.status().is_some_and(is_rate_limit_code)
    }

    /// Whether reconnecting may help without asking the listener.
    ///
    /// Dropped connections and stalls are retried by the source. HTTP statuses
    /// go to the listener, and a malformed request can never succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => status.is_none(),
            Self::Io(e) => e.kind() != io::ErrorKind::InvalidInput,
        }
    }
}

/// Whether an upstream error code signals rate limiting.
pub fn is_rate_limit_code(code: u16) -> bool {
    matches!(code, 420 | 429)
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("feedline/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build HTTP client")
});

/// Get shared HTTP client.
pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("feedline-http")
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Filter criteria sent upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterParams {
    /// Account identifiers to follow
    pub follow: Vec<String>,
    /// Search terms to track
    pub track: Vec<String>,
    /// Language codes
    pub languages: Vec<String>,
    /// Bounding boxes (`lon,lat,lon,lat`)
    pub locations: Vec<String>,
}

impl FilterParams {
    /// No follow/track/locations criterion; languages alone do not select anything.
    pub fn is_empty(&self) -> bool {
        self.follow.is_empty() && self.track.is_empty() && self.locations.is_empty()
    }

    /// Comma-joined query parameters, omitting empty lists.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        [
            ("follow", &self.follow),
            ("track", &self.track),
            ("language", &self.languages),
            ("locations", &self.locations),
        ]
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(key, values)| (key, values.join(",")))
        .collect()
    }
}

/// Connection settings for [`HttpStreamSource`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub filter: FilterParams,
    pub read_timeout: Duration,
    pub max_reconnects: u32,
}

/// Buffered reader over the streaming response body
pub type StreamReader = BufReader<TimeoutReader>;

/// Open the filter stream.
///
/// Non-2xx answers come back as `StreamError::Http` with the status set.
pub fn open_stream(
    config: &StreamConfig,
    credentials: &Credentials,
) -> Result<StreamReader, StreamError> {
    let reader = SHARED_RUNTIME.handle().block_on(async {
        let response = SHARED_CLIENT
            .get(&config.url)
            .query(&config.filter.query())
            .bearer_auth(&credentials.access_token)
            .header("x-api-key", &credentials.api_key)
            .send()
            .await
            .map_err(|e| StreamError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Http {
                status: Some(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let stream = response.bytes_stream();
        let async_reader = tokio_util::io::StreamReader::new(
            stream.map(|result| result.map_err(io::Error::other)),
        );
        Ok::<_, StreamError>(TimeoutReader::new(
            Box::pin(async_reader),
            config.read_timeout,
        ))
    })?;

    Ok(BufReader::with_capacity(STREAM_BUF_SIZE, reader))
}

/// Async-to-sync bridge with read timeout.
///
/// If no data arrives within the timeout, returns `TimedOut`, which the
/// source treats as a dropped connection.
pub struct TimeoutReader {
    inner: Pin<Box<dyn AsyncRead + Send + Sync>>,
    timeout: Duration,
}

impl TimeoutReader {
    fn new(inner: Pin<Box<dyn AsyncRead + Send + Sync>>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.timeout;
        SHARED_RUNTIME.handle().block_on(async {
            let read_future = async {
                let mut read_buf = ReadBuf::new(buf);
                std::future::poll_fn(|cx: &mut Context<'_>| {
                    Pin::as_mut(&mut self.inner).poll_read(cx, &mut read_buf)
                })
                .await?;
                Ok::<_, io::Error>(read_buf.filled().len())
            };

            match tokio::time::timeout(timeout, read_future).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("read timeout ({}s with no data)", timeout.as_secs()),
                )),
            }
        })
    }
}

/// Opens one connection to the upstream stream.
pub trait Connector {
    /// Endpoint description for logs.
    fn describe(&self) -> String;

    fn connect(&mut self) -> Result<Box<dyn BufRead>, StreamError>;
}

/// [`Connector`] for the HTTP filter endpoint.
pub struct HttpConnector {
    config: StreamConfig,
    credentials: Credentials,
}

impl HttpConnector {
    pub fn new(config: StreamConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
        }
    }
}

impl Connector for HttpConnector {
    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn connect(&mut self) -> Result<Box<dyn BufRead>, StreamError> {
        Ok(Box::new(open_stream(&self.config, &self.credentials)?))
    }
}

/// Live filter stream.
///
/// HTTP error statuses go to [`StreamListener::on_error`] and the source
/// reconnects with backoff while the listener answers `true`. Retryable
/// transport failures (refused or dropped connections, read stalls) are
/// retried up to `max_reconnects` consecutive attempts. Anything else ends
/// the source with an error.
pub struct HttpStreamSource {
    connector: Box<dyn Connector>,
    max_reconnects: u32,
    backoff: fn(u32) -> Duration,
    shutdown: ShutdownFlag,
    stats: SourceStats,
}

impl HttpStreamSource {
    pub fn new(config: StreamConfig, credentials: Credentials, shutdown: ShutdownFlag) -> Self {
        let max_reconnects = config.max_reconnects;
        Self::with_connector(
            Box::new(HttpConnector::new(config, credentials)),
            max_reconnects,
            shutdown,
        )
    }

    pub fn with_connector(
        connector: Box<dyn Connector>,
        max_reconnects: u32,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            connector,
            max_reconnects,
            backoff: reconnect_delay,
            shutdown,
            stats: SourceStats::default(),
        }
    }

    /// Replace the reconnect delay schedule.
    pub fn with_backoff(mut self, backoff: fn(u32) -> Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Read lines until the connection drops. `Ok(None)` means reconnect.
    fn consume(
        &mut self,
        reader: Box<dyn BufRead>,
        listener: &mut dyn StreamListener,
    ) -> Result<Option<SourceExit>, IngestError> {
        match process_lines(reader, listener, &mut self.stats, self.shutdown) {
            Ok(SourceExit::Exhausted) => {
                log::warn!("Stream closed by upstream");
                Ok(None)
            }
            Ok(exit) => Ok(Some(exit)),
            Err(IngestError::Stream(e)) => {
                if handle_failure(e, listener)? {
                    Ok(None)
                } else {
                    Ok(Some(SourceExit::Stopped))
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// Classify a connection or read failure. `Ok(true)` means reconnect.
fn handle_failure(e: StreamError, listener: &mut dyn StreamListener) -> Result<bool, IngestError> {
    if e.is_retryable() {
        log::warn!("Connection lost: {e}");
        return Ok(true);
    }
    match e.status() {
        Some(code) => {
            if e.is_rate_limit() {
                log::warn!("Rate limited by upstream (HTTP {code})");
            } else {
                log::warn!("Upstream refused connection: {e}");
            }
            Ok(listener.on_error(code))
        }
        None => Err(IngestError::Stream(e)),
    }
}

impl StreamSource for HttpStreamSource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn run(&mut self, listener: &mut dyn StreamListener) -> Result<SourceExit, IngestError> {
        let mut failures = 0u32;
        loop {
            if self.shutdown.is_requested() {
                return Ok(SourceExit::Interrupted);
            }

            log::info!("Connecting to {}", self.connector.describe());
            match self.connector.connect() {
                Ok(reader) => {
                    log::info!("Connected; streaming");
                    let before = self.stats.lines;
                    if let Some(exit) = self.consume(reader, listener)? {
                        return Ok(exit);
                    }
                    if self.stats.lines > before {
                        failures = 0;
                    }
                }
                Err(e) => {
                    if !handle_failure(e, listener)? {
                        return Ok(SourceExit::Stopped);
                    }
                }
            }

            failures += 1;
            self.stats.reconnects += 1;
            if failures > self.max_reconnects {
                return Err(IngestError::Stream(StreamError::Http {
                    status: None,
                    message: format!(
                        "giving up after {} failed connection attempts",
                        self.max_reconnects
                    ),
                }));
            }
            let delay = (self.backoff)(failures);
            log::info!(
                "Reconnecting in {}s (attempt {failures}/{})",
                delay.as_secs(),
                self.max_reconnects
            );
            if !sleep_unless_shutdown(delay, self.shutdown) {
                return Ok(SourceExit::Interrupted);
            }
        }
    }

    fn stats(&self) -> &SourceStats {
        &self.stats
    }
}
