use std::time::Duration;

use http::HeaderMap;

use crate::request::Request;

/// Session-side collaborator owned weakly by every request.
///
/// The delegate decides whether attaching the first response serializer
/// auto-resumes the request, receives the cleanup hook after terminal
/// processing, and owns the deferred-work mechanism for delayed retries.
/// When the delegate has been dropped, requests fall back to finishing
/// instead of retrying and skip the cleanup hook.
pub trait RequestDelegate: Send + Sync {
    /// Whether attaching the first response serializer resumes the request.
    fn start_immediately(&self) -> bool {
        true
    }

    /// Called exactly once after all serializer completions have fired.
    fn cleanup_after(&self, _request: &Request) {}

    /// Schedule a fresh attempt, optionally after a delay.
    ///
    /// The default implementation defers through the request itself; session
    /// pools that coalesce or rate-limit retries override this.
    fn retry_request(&self, request: Request, delay: Option<Duration>) {
        request.retry_after(delay);
    }

    /// Session-scope headers, merged into the debug command rendering only.
    fn session_headers(&self) -> HeaderMap {
        HeaderMap::new()
    }
}
