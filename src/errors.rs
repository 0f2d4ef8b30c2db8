use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Convenience alias for fallible engine results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared, cloneable underlying cause.
///
/// Terminal snapshots are handed to every response-serializer completion, so
/// the error type must be `Clone`; sources are reference-counted to keep it
/// cheap.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Broad transport failure kinds for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// The transport reported the task was cancelled.
    Cancelled,
    Timeout,
    Connect,
    /// Protocol-level failure (malformed framing, unexpected close).
    Protocol,
    Other,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskErrorKind::Cancelled => "task cancelled",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::Connect => "connect",
            TaskErrorKind::Protocol => "protocol",
            TaskErrorKind::Other => "transport",
        };
        write!(f, "{label}")
    }
}

/// Unified error type surfaced by the engine.
///
/// The first error recorded on a request wins and is never overwritten by a
/// later, less specific one; the only sanctioned substitution is an
/// interceptor returning a replacement error from its retry decision.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The cancellation sentinel, recorded by `cancel()` when no more
    /// specific error exists.
    #[error("request was explicitly cancelled")]
    ExplicitlyCancelled,

    /// The request factory failed to produce a request representation.
    #[error("request construction failed: {source}")]
    RequestCreation { source: SharedError },

    /// An interceptor rejected the request during adaptation.
    #[error("request adaptation failed: {source}")]
    RequestAdaptation { source: SharedError },

    /// The upload source factory failed to resolve an uploadable.
    #[error("uploadable resolution failed: {source}")]
    UploadableResolution { source: SharedError },

    /// Transport-level failure (task creation, early failure, or completion
    /// failure).
    #[error("{kind}: {message}")]
    Task {
        kind: TaskErrorKind,
        message: String,
    },

    /// A `validate` rule rejected the response.
    #[error("response validation failed: {source}")]
    ResponseValidation { source: SharedError },

    /// A response serializer failed to decode the terminal snapshot.
    #[error("response serialization failed: {source}")]
    ResponseSerialization { source: SharedError },

    /// A stream consumer returned an error while processing a chunk.
    #[error("stream consumer failed: {source}")]
    StreamConsumer { source: SharedError },

    /// Moving a finished download into its destination failed.
    #[error("moving downloaded file failed: {source}")]
    DownloadedFileMove { source: SharedError },
}

impl Error {
    pub fn request_creation(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::RequestCreation {
            source: source.into().into(),
        }
    }

    pub fn request_adaptation(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::RequestAdaptation {
            source: source.into().into(),
        }
    }

    pub fn uploadable_resolution(
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::UploadableResolution {
            source: source.into().into(),
        }
    }

    pub fn task(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self::Task {
            kind,
            message: message.into(),
        }
    }

    pub fn response_validation(
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ResponseValidation {
            source: source.into().into(),
        }
    }

    pub fn response_serialization(
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ResponseSerialization {
            source: source.into().into(),
        }
    }

    pub fn stream_consumer(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::StreamConsumer {
            source: source.into().into(),
        }
    }

    pub fn downloaded_file_move(
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::DownloadedFileMove {
            source: source.into().into(),
        }
    }

    /// Whether this error represents a cancellation, either the explicit
    /// sentinel or a transport task cancelled underneath us.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::ExplicitlyCancelled
                | Error::Task {
                    kind: TaskErrorKind::Cancelled,
                    ..
                }
        )
    }

    /// Whether the retry coordinator may present this error to an
    /// interceptor.
    ///
    /// Validation and serialization failures are discovered only after the
    /// transport attempt has been judged complete, and cancellation is a
    /// caller decision; none of them retry.
    pub fn is_retry_candidate(&self) -> bool {
        !matches!(
            self,
            Error::ResponseValidation { .. }
                | Error::ResponseSerialization { .. }
                | Error::StreamConsumer { .. }
        ) && !self.is_cancellation()
    }
}
