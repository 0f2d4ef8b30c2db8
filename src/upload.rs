use std::ops::Deref;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_core::Stream;

use crate::data::{append_typed_response, DataCore};
use crate::errors::{Error, Result};
use crate::queue::SerialQueue;
use crate::request::{Request, RequestConfig, Variant};
use crate::serializer::{BytesSerializer, DataResponse, JsonSerializer, ResponseSerializer, StringSerializer};
use crate::types::HttpRequest;

type BoxedStdError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed byte stream used by stream-backed uploadables.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Single-use byte stream wrapper.
///
/// Stream uploadables can only be read once, which is why the resolved
/// uploadable is discarded on retry and re-resolved from the factory.
pub struct UploadStream {
    inner: Mutex<Option<ByteStream>>,
}

impl UploadStream {
    pub fn new(stream: impl Stream<Item = std::io::Result<Bytes>> + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Some(Box::pin(stream))),
        }
    }

    /// Take the underlying stream.
    ///
    /// # Panics
    /// Panics if the stream was already taken; stream uploadables are
    /// single-use and consuming one twice is a caller contract violation.
    pub fn take(&self) -> ByteStream {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("upload stream already consumed; stream uploadables are single-use")
    }
}

impl std::fmt::Debug for UploadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UploadStream")
    }
}

/// The source of an upload body, resolved once per attempt.
#[derive(Debug)]
pub enum Uploadable {
    Bytes(Bytes),
    File {
        path: PathBuf,
        /// Delete the file during terminal cleanup.
        remove_on_completion: bool,
    },
    Stream(UploadStream),
}

type UploadableFactory =
    Box<dyn Fn() -> std::result::Result<Uploadable, BoxedStdError> + Send + Sync>;

pub(crate) struct UploadCore {
    factory: UploadableFactory,
    resolved: crate::protected::Protected<Option<Arc<Uploadable>>>,
    /// Response-body buffering; uploads read the server reply exactly like
    /// a buffered data request.
    body: DataCore,
}

impl UploadCore {
    fn new(factory: UploadableFactory) -> Self {
        Self {
            factory,
            resolved: crate::protected::Protected::default(),
            body: DataCore::new(),
        }
    }

    pub(crate) fn body(&self) -> &DataCore {
        &self.body
    }

    /// Resolve the uploadable for the coming attempt; runs after request
    /// adaptation and before task creation, every attempt.
    pub(crate) fn resolve(&self) -> Result<Arc<Uploadable>> {
        match (self.factory)() {
            Ok(uploadable) => {
                let uploadable = Arc::new(uploadable);
                self.resolved.write(|slot| *slot = Some(uploadable.clone()));
                Ok(uploadable)
            }
            Err(source) => Err(Error::uploadable_resolution(source)),
        }
    }

    pub(crate) fn resolved(&self) -> Option<Arc<Uploadable>> {
        self.resolved.read(Clone::clone)
    }

    pub(crate) fn reset(&self) {
        self.resolved.write(|slot| *slot = None);
        self.body.reset();
    }

    /// Delete a file-backed source flagged for removal; runs after the base
    /// cleanup.
    pub(crate) fn cleanup(&self, _request: &Request) {
        let Some(uploadable) = self.resolved() else {
            return;
        };
        if let Uploadable::File {
            path,
            remove_on_completion: true,
        } = uploadable.as_ref()
        {
            if let Err(_err) = std::fs::remove_file(path) {
                #[cfg(feature = "tracing")]
                tracing::warn!(path = %path.display(), error = %_err, "failed to remove upload source");
            }
        }
    }
}

/// Request variant that sends a lazily resolved body and buffers the reply.
#[derive(Clone)]
pub struct UploadRequest {
    core: Request,
}

impl Deref for UploadRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.core
    }
}

impl UploadRequest {
    pub fn new(
        config: RequestConfig,
        factory: impl Fn() -> std::result::Result<HttpRequest, BoxedStdError> + Send + Sync + 'static,
        uploadable: impl Fn() -> std::result::Result<Uploadable, BoxedStdError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let core = Request::build(
            config,
            Some(Box::new(factory)),
            Variant::Upload(UploadCore::new(Box::new(uploadable))),
        );
        Self { core }
    }

    fn upload_core(&self) -> &UploadCore {
        match &self.core.inner.variant {
            Variant::Upload(core) => core,
            _ => unreachable!("upload request constructed with upload variant"),
        }
    }

    /// The uploadable resolved for the current attempt, if any.
    pub fn uploadable(&self) -> Option<Arc<Uploadable>> {
        self.upload_core().resolved()
    }

    /// Server reply bytes buffered so far.
    pub fn data(&self) -> Option<Bytes> {
        self.upload_core().body().buffered()
    }

    /// Append a validation rule against the terminal reply.
    pub fn validate(
        &self,
        rule: impl Fn(
                Option<&HttpRequest>,
                &crate::types::HttpResponse,
                Option<&Bytes>,
            ) -> std::result::Result<(), BoxedStdError>
            + Send
            + Sync
            + 'static,
    ) -> &Self {
        self.upload_core().body().push_validator(Arc::new(rule));
        self
    }

    pub fn response<S, F>(&self, serializer: S, handler: F) -> &Self
    where
        S: ResponseSerializer,
        F: FnOnce(DataResponse<S::Output>) + Send + 'static,
    {
        self.response_on(self.core.callback_queue(), serializer, handler)
    }

    pub fn response_on<S, F>(&self, queue: SerialQueue, serializer: S, handler: F) -> &Self
    where
        S: ResponseSerializer,
        F: FnOnce(DataResponse<S::Output>) + Send + 'static,
    {
        append_typed_response(&self.core, queue, serializer, handler);
        self
    }

    pub fn response_bytes(&self, handler: impl FnOnce(DataResponse<Bytes>) + Send + 'static) -> &Self {
        self.response(BytesSerializer, handler)
    }

    pub fn response_string(
        &self,
        handler: impl FnOnce(DataResponse<String>) + Send + 'static,
    ) -> &Self {
        self.response(StringSerializer, handler)
    }

    pub fn response_json<T, F>(&self, handler: F) -> &Self
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        F: FnOnce(DataResponse<T>) + Send + 'static,
    {
        self.response(JsonSerializer::<T>::new(), handler)
    }
}
