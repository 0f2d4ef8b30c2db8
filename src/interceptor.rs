use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::errors::{Error, Result};
use crate::types::HttpRequest;

/// Outcome of an interceptor's retry decision.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    DoNotRetry,
    /// Finish, substituting the recorded error with this one.
    DoNotRetryWithError(Error),
    Retry,
    RetryWithDelay(Duration),
}

impl RetryDecision {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::RetryWithDelay(delay) => Some(*delay),
            _ => None,
        }
    }

    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry | RetryDecision::RetryWithDelay(_))
    }
}

/// Everything the retry coordinator knows about the failed attempt.
#[derive(Clone, Debug)]
pub struct RetryContext {
    /// Current (most recent) request representation, when one was produced
    /// before the failure.
    pub request: Option<HttpRequest>,
    /// Retries already performed; `0` on the first failure.
    pub retry_count: u32,
    pub error: Error,
}

/// Request adaptation plus asynchronous retry decisioning.
///
/// `adapt` runs on the underlying context before every task creation,
/// including retries. `retry_decision` runs after a transport attempt ends
/// with a retry-candidate error; the returned future is awaited off the
/// underlying context and its decision is applied back on it.
pub trait Interceptor: Send + Sync {
    fn adapt(&self, request: HttpRequest) -> Result<HttpRequest> {
        Ok(request)
    }

    fn retry_decision(&self, context: RetryContext) -> BoxFuture<'static, RetryDecision>;
}

/// Adapter-only interceptor wrapping a closure; never retries.
pub struct Adapter<F>(F);

impl<F> Adapter<F>
where
    F: Fn(HttpRequest) -> Result<HttpRequest> + Send + Sync,
{
    pub fn new(adapt: F) -> Self {
        Self(adapt)
    }
}

impl<F> Interceptor for Adapter<F>
where
    F: Fn(HttpRequest) -> Result<HttpRequest> + Send + Sync,
{
    fn adapt(&self, request: HttpRequest) -> Result<HttpRequest> {
        (self.0)(request)
    }

    fn retry_decision(&self, _context: RetryContext) -> BoxFuture<'static, RetryDecision> {
        Box::pin(async { RetryDecision::DoNotRetry })
    }
}
