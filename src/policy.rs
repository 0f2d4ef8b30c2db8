use std::time::Duration;

use futures_util::future::BoxFuture;
use http::{Method, StatusCode};

use crate::errors::Error;
use crate::interceptor::{Interceptor, RetryContext, RetryDecision};

/// Ready-made retry interceptor with jittered exponential backoff.
///
/// Retries retry-candidate errors up to `retry_limit` times; responses that
/// made it far enough to be validated never reach an interceptor, so the
/// policy only classifies transport-level failures and the request method.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub retry_limit: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Whether POST attempts may be retried. Non-idempotent by default.
    pub retry_post: bool,
    /// Status codes considered retryable when the transport surfaces one in
    /// a completion failure (advisory; transports encode status in the error
    /// message, the engine itself does not inspect responses here).
    pub retryable_statuses: Vec<StatusCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            base_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            retry_post: false,
            retryable_statuses: vec![
                StatusCode::REQUEST_TIMEOUT,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(retry_limit: u32) -> Self {
        Self {
            retry_limit,
            ..Default::default()
        }
    }

    /// Never retry anything; useful for predictable tests.
    pub fn disabled() -> Self {
        Self {
            retry_limit: 0,
            ..Default::default()
        }
    }

    pub fn retrying_post(mut self) -> Self {
        self.retry_post = true;
        self
    }

    /// Jittered exponential backoff for the given attempt (1-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = if attempt == 0 {
            0
        } else {
            (attempt - 1).min(10)
        };
        let base = self.base_backoff.saturating_mul(2u32.saturating_pow(exp));
        let capped = std::cmp::min(base, self.max_backoff);
        let jitter = 0.5 + fastrand::f64(); // 0.5x .. 1.5x
        let seconds = (capped.as_secs_f64() * jitter).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }

    fn allow_for_method(&self, method: Option<&Method>) -> bool {
        match method {
            Some(method) if *method == Method::POST => self.retry_post,
            _ => true,
        }
    }

    fn decide(&self, context: &RetryContext) -> RetryDecision {
        if context.retry_count >= self.retry_limit {
            return RetryDecision::DoNotRetry;
        }
        if !context.error.is_retry_candidate() {
            return RetryDecision::DoNotRetry;
        }
        if !self.allow_for_method(context.request.as_ref().map(|r| &r.method)) {
            return RetryDecision::DoNotRetry;
        }
        RetryDecision::RetryWithDelay(self.backoff_delay(context.retry_count + 1))
    }

    /// Whether a transport should consider `status` retryable under this
    /// policy; provided for transports that map statuses into task errors.
    pub fn should_retry_status(&self, method: &Method, status: StatusCode) -> bool {
        self.retryable_statuses.contains(&status) && self.allow_for_method(Some(method))
    }
}

impl Interceptor for RetryPolicy {
    fn retry_decision(&self, context: RetryContext) -> BoxFuture<'static, RetryDecision> {
        let decision = self.decide(&context);
        Box::pin(async move { decision })
    }
}

/// Interceptor that substitutes a fixed error instead of retrying; the
/// `DoNotRetryWithError` path in one piece.
pub struct ErrorSubstitutingInterceptor(pub Error);

impl Interceptor for ErrorSubstitutingInterceptor {
    fn retry_decision(&self, _context: RetryContext) -> BoxFuture<'static, RetryDecision> {
        let error = self.0.clone();
        Box::pin(async move { RetryDecision::DoNotRetryWithError(error) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TaskErrorKind;
    use url::Url;

    fn context(retry_count: u32, error: Error) -> RetryContext {
        RetryContext {
            request: Some(crate::types::HttpRequest::get(
                Url::parse("https://example.com/resource").expect("static url"),
            )),
            retry_count,
            error,
        }
    }

    #[test]
    fn backoff_respects_max_and_jitter() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(2),
            ..Default::default()
        };
        for attempt in 1..=8 {
            let delay = policy.backoff_delay(attempt);
            assert!(delay <= policy.max_backoff);
            assert!(delay >= Duration::from_millis(250));
        }
    }

    #[test]
    fn stops_at_retry_limit() {
        let policy = RetryPolicy::new(2);
        let err = Error::task(TaskErrorKind::Timeout, "deadline elapsed");
        assert!(policy.decide(&context(0, err.clone())).should_retry());
        assert!(policy.decide(&context(1, err.clone())).should_retry());
        assert!(!policy.decide(&context(2, err)).should_retry());
    }

    #[test]
    fn post_is_not_retried_unless_opted_in() {
        let err = Error::task(TaskErrorKind::Connect, "refused");
        let mut ctx = context(0, err);
        ctx.request.as_mut().expect("request").method = Method::POST;

        assert!(!RetryPolicy::new(2).decide(&ctx).should_retry());
        assert!(RetryPolicy::new(2).retrying_post().decide(&ctx).should_retry());
    }

    #[test]
    fn cancellation_never_retries() {
        let policy = RetryPolicy::new(5);
        let decision = policy.decide(&context(0, Error::ExplicitlyCancelled));
        assert!(!decision.should_retry());
    }
}
