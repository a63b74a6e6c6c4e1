//! Transport collaborator.
//!
//! The engine only needs "give me the bytes at this URL". [`FetchClient`]
//! is that seam; [`HttpFetchClient`] implements it over reqwest and
//! [`MemoryFetchClient`] serves canned documents for tests and embedding.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Body {
        body: Bytes,
        /// The server's `Last-Modified` header, if it sent a parseable one.
        last_modified: Option<DateTime<Utc>>,
    },
    /// The server answered `304 Not Modified` to an `If-Modified-Since` hint.
    NotModified,
}

impl Fetched {
    pub fn body(body: impl Into<Bytes>) -> Self {
        Fetched::Body {
            body: body.into(),
            last_modified: None,
        }
    }
}

/// Transport-level failure. Non-2xx responses and connection problems are
/// treated alike: the cycle fails and the next scheduled tick retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{url}: {cause}")]
pub struct TransportError {
    pub url: String,
    pub status: Option<u16>,
    pub cause: String,
    timed_out: bool,
}

impl TransportError {
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status: Some(status),
            cause: format!("HTTP status {}", status),
            timed_out: false,
        }
    }

    pub fn connection(url: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: None,
            cause: cause.into(),
            timed_out: false,
        }
    }

    pub fn timeout(url: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: None,
            cause: cause.into(),
            timed_out: true,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }

    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(url, err.to_string())
        } else {
            Self {
                url: url.to_string(),
                status: err.status().map(|s| s.as_u16()),
                cause: err.to_string(),
                timed_out: false,
            }
        }
    }
}

/// Fetches documents by URL.
#[async_trait]
pub trait FetchClient: Send + Sync {
    /// Fetch `url`. When `if_modified_since` is given the client may answer
    /// [`Fetched::NotModified`]. Callers only pass a `last_modified` value
    /// the same server returned earlier, never a local clock reading.
    async fn fetch(
        &self,
        url: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<Fetched, TransportError>;
}

/// Settings for [`HttpFetchClient`].
#[derive(Debug, Clone)]
pub struct HttpFetchConfig {
    pub user_agent: String,
    /// Upper bound for a single request; per-repository deadlines are
    /// enforced by the worker on top of this.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Responses larger than this are rejected.
    pub max_body_bytes: usize,
    /// Host names resolved to fixed addresses instead of through DNS.
    pub connect_to: BTreeMap<String, SocketAddr>,
}

impl HttpFetchConfig {
    pub fn with_connect_to(mut self, connect_to: BTreeMap<String, SocketAddr>) -> Self {
        self.connect_to = connect_to;
        self
    }
}

impl Default for HttpFetchConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("rrdpsync/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            max_body_bytes: 256 * 1024 * 1024, // 256 MB
            connect_to: BTreeMap::new(),
        }
    }
}

/// reqwest-backed fetch client (rustls).
pub struct HttpFetchClient {
    http: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpFetchClient {
    pub fn new(config: &HttpFetchConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout);
        for (host, addr) in &config.connect_to {
            builder = builder.resolve(host, *addr);
        }
        let http = builder
            .build()
            .map_err(|e| TransportError::connection("", format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            max_body_bytes: config.max_body_bytes,
        })
    }

    fn too_large(&self, url: &str) -> TransportError {
        TransportError::connection(
            url,
            format!("response exceeds {} bytes", self.max_body_bytes),
        )
    }
}

#[async_trait]
impl FetchClient for HttpFetchClient {
    async fn fetch(
        &self,
        url: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<Fetched, TransportError> {
        let mut request = self.http.get(url);
        if let Some(since) = if_modified_since {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, http_date(since));
        }

        let mut resp = request
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(url, e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        if !status.is_success() {
            return Err(TransportError::status(url, status.as_u16()));
        }
        let last_modified = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        if resp
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(self.too_large(url));
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| TransportError::from_reqwest(url, e))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(self.too_large(url));
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(url, bytes = body.len(), "fetched");
        Ok(Fetched::Body {
            body: body.freeze(),
            last_modified,
        })
    }
}

/// RFC 7231 IMF-fixdate.
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

#[derive(Debug, Clone)]
enum CannedResponse {
    Body {
        body: Bytes,
        last_modified: Option<DateTime<Utc>>,
    },
    Status(u16),
    NotModified,
}

/// In-memory fetch client serving canned responses by URL.
///
/// Unknown URLs answer 404. Every request is recorded. Bodies inserted
/// with a `last_modified` time answer 304 to a request whose
/// `If-Modified-Since` is not older, like an HTTP server would.
#[derive(Default)]
pub struct MemoryFetchClient {
    responses: Mutex<HashMap<String, CannedResponse>>,
    requests: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MemoryFetchClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response, e.g. to keep a cycle in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        lock(&self.responses).insert(
            url.into(),
            CannedResponse::Body {
                body: body.into(),
                last_modified: None,
            },
        );
    }

    pub fn insert_with_last_modified(
        &self,
        url: impl Into<String>,
        body: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        lock(&self.responses).insert(
            url.into(),
            CannedResponse::Body {
                body: body.into(),
                last_modified: Some(last_modified),
            },
        );
    }

    pub fn fail_with_status(&self, url: impl Into<String>, status: u16) {
        lock(&self.responses).insert(url.into(), CannedResponse::Status(status));
    }

    pub fn not_modified(&self, url: impl Into<String>) {
        lock(&self.responses).insert(url.into(), CannedResponse::NotModified);
    }

    pub fn remove(&self, url: &str) {
        lock(&self.responses).remove(url);
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        lock(&self.requests).iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl FetchClient for MemoryFetchClient {
    async fn fetch(
        &self,
        url: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<Fetched, TransportError> {
        lock(&self.requests).push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = lock(&self.responses).get(url).cloned();
        match response {
            Some(CannedResponse::Body {
                last_modified: Some(modified),
                ..
            }) if if_modified_since.is_some_and(|since| modified <= since) => {
                Ok(Fetched::NotModified)
            }
            Some(CannedResponse::Body {
                body,
                last_modified,
            }) => Ok(Fetched::Body {
                body,
                last_modified,
            }),
            Some(CannedResponse::NotModified) => Ok(Fetched::NotModified),
            Some(CannedResponse::Status(status)) => Err(TransportError::status(url, status)),
            None => Err(TransportError::status(url, 404)),
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
