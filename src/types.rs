use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

/// One request representation.
///
/// A request produces at least one of these per attempt (the original plus
/// each adapted/retried variant); representations are append-only history on
/// the owning request and the last one is "current".
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body.into());
        request
    }

    pub fn with_header(
        mut self,
        name: http::header::HeaderName,
        value: http::header::HeaderValue,
    ) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Response metadata snapshot reported by the transport.
///
/// Body bytes travel separately through the chunk events; this carries only
/// what every variant needs to make decisions (validation, destination
/// resolution, progress totals).
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Option<Url>,
    /// Transport-reported expected body length, when known.
    pub expected_content_length: Option<u64>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            url: None,
            expected_content_length: None,
        }
    }

    pub fn with_expected_content_length(mut self, length: u64) -> Self {
        self.expected_content_length = Some(length);
        self
    }
}

/// Per-attempt transport metrics, index-aligned with the task history.
#[derive(Clone, Debug)]
pub struct TransportMetrics {
    pub started_at: Instant,
    pub duration: Duration,
    pub request_bytes_sent: u64,
    pub response_bytes_received: u64,
}

impl TransportMetrics {
    pub fn started(started_at: Instant) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            request_bytes_sent: 0,
            response_bytes_received: 0,
        }
    }
}

/// Basic credential attached via `authenticate`, rendered into the debug
/// command and available to transports for challenge responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Decision returned by a response-arrival hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Continue receiving the body.
    Allow,
    /// Move the request to `cancelled`; the transport is expected to abort
    /// on its own rather than being torn down synchronously.
    Cancel,
}

/// Redirect policy collaborator. At most one per request.
pub trait RedirectHandler: Send + Sync {
    /// Return the request to follow the redirect with, or `None` to stop
    /// and deliver the redirect response as-is.
    fn redirect(
        &self,
        request: &HttpRequest,
        response: &HttpResponse,
        proposed: HttpRequest,
    ) -> Option<HttpRequest>;
}

/// Cache policy collaborator. At most one per request.
pub trait CachedResponseHandler: Send + Sync {
    /// Whether the transport may store this response in its cache.
    fn should_cache(&self, response: &HttpResponse) -> bool;
}
