use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;

use crate::errors::Error;
use crate::progress::Progress;
use crate::protected::Protected;
use crate::queue::SerialQueue;
use crate::request::{Request, RequestConfig, Variant};
use crate::serializer::{BytesSerializer, DataResponse, JsonSerializer, ResponseSerializer, StringSerializer};
use crate::types::{HttpRequest, HttpResponse, ResponseDisposition};

type BoxedStdError = Box<dyn std::error::Error + Send + Sync>;

type DispositionHandler = Arc<dyn Fn(&HttpResponse) -> ResponseDisposition + Send + Sync>;

pub(crate) type Validator = Arc<
    dyn Fn(Option<&HttpRequest>, &HttpResponse, Option<&Bytes>) -> Result<(), BoxedStdError>
        + Send
        + Sync,
>;

#[derive(Default)]
struct DataMutableState {
    /// Accumulated body bytes for the current attempt.
    data: Option<Vec<u8>>,
    disposition: Option<DispositionHandler>,
    validators: Vec<Validator>,
}

/// Buffered-body variant state: one growing buffer per attempt plus the
/// response-arrival and validation hooks.
pub(crate) struct DataCore {
    state: Protected<DataMutableState>,
}

impl DataCore {
    pub(crate) fn new() -> Self {
        Self {
            state: Protected::default(),
        }
    }

    pub(crate) fn did_receive(&self, request: &Request, chunk: Bytes) {
        let completed = self.state.write(|s| {
            let buffer = s.data.get_or_insert_with(Vec::new);
            buffer.extend_from_slice(&chunk);
            buffer.len() as u64
        });
        let total = request
            .response()
            .and_then(|r| r.expected_content_length);
        request.set_download_progress(Progress::new(completed, total));
    }

    pub(crate) fn buffered(&self) -> Option<Bytes> {
        self.state
            .read(|s| s.data.as_ref().map(|d| Bytes::from(d.clone())))
    }

    pub(crate) fn disposition(&self) -> Option<DispositionHandler> {
        self.state.read(|s| s.disposition.clone())
    }

    fn set_disposition(&self, handler: DispositionHandler) {
        self.state.write(|s| {
            assert!(
                s.disposition.is_none(),
                "response disposition hook may only be set once per request"
            );
            s.disposition = Some(handler);
        });
    }

    pub(crate) fn push_validator(&self, validator: Validator) {
        self.state.write(|s| s.validators.push(validator));
    }

    /// Run every validator against the terminal response and buffer.
    /// Failures record a validation error, which never overwrites an
    /// existing terminal error and never retries.
    pub(crate) fn run_validators(&self, request: &Request) {
        let validators = self.state.read(|s| s.validators.clone());
        if validators.is_empty() {
            return;
        }
        let Some(response) = request.response() else {
            return;
        };
        let data = self.buffered();
        let current = request.current_request();
        for validator in validators {
            match validator(current.as_ref(), &response, data.as_ref()) {
                Ok(()) => request.notify_validation(&Ok(())),
                Err(source) => {
                    let error = Error::response_validation(source);
                    request.notify_validation(&Err(error.clone()));
                    request.record_error(&error);
                }
            }
        }
    }

    pub(crate) fn reset(&self) {
        self.state.write(|s| s.data = None);
    }
}

/// Buffered body bytes for the variant owning one (data and upload).
pub(crate) fn buffered_body(request: &Request) -> Option<Bytes> {
    match &request.inner.variant {
        Variant::Data(core) => core.buffered(),
        Variant::Upload(core) => core.body().buffered(),
        _ => None,
    }
}

/// Append a typed response serializer plus its completion handler to any
/// request with a buffered body.
pub(crate) fn append_typed_response<S, F>(
    request: &Request,
    queue: SerialQueue,
    serializer: S,
    handler: F,
) where
    S: ResponseSerializer,
    F: FnOnce(DataResponse<S::Output>) + Send + 'static,
{
    request.append_response_serializer(Box::new(move |request: &Request| {
        let snapshot = request.terminal_snapshot();
        let data = buffered_body(request);
        let result = serializer.serialize(
            snapshot.request.as_ref(),
            snapshot.response.as_ref(),
            data.as_ref(),
            snapshot.error.as_ref(),
        );
        let response = DataResponse {
            request: snapshot.request,
            response: snapshot.response,
            data,
            retry_count: snapshot.retry_count,
            result,
        };
        request.response_serializer_did_complete(Box::new(move || {
            queue.dispatch(move || handler(response));
        }));
    }));
}

/// Request variant that accumulates the response body in memory.
#[derive(Clone)]
pub struct DataRequest {
    core: Request,
}

impl Deref for DataRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.core
    }
}

impl DataRequest {
    pub fn new(
        config: RequestConfig,
        factory: impl Fn() -> Result<HttpRequest, BoxedStdError> + Send + Sync + 'static,
    ) -> Self {
        let core = Request::build(
            config,
            Some(Box::new(factory)),
            Variant::Data(DataCore::new()),
        );
        Self { core }
    }

    fn data_core(&self) -> &DataCore {
        match &self.core.inner.variant {
            Variant::Data(core) => core,
            _ => unreachable!("data request constructed with data variant"),
        }
    }

    /// Body bytes buffered so far for the current attempt.
    pub fn data(&self) -> Option<Bytes> {
        self.data_core().buffered()
    }

    /// Inspect each intermediate response as it arrives and decide whether
    /// to continue. Returning [`ResponseDisposition::Cancel`] moves the
    /// request to `cancelled` without tearing the task down synchronously.
    pub fn on_response(
        &self,
        handler: impl Fn(&HttpResponse) -> ResponseDisposition + Send + Sync + 'static,
    ) -> &Self {
        self.data_core().set_disposition(Arc::new(handler));
        self
    }

    /// Append a validation rule evaluated once the terminal error and
    /// response are known, before serializers run.
    pub fn validate(
        &self,
        rule: impl Fn(Option<&HttpRequest>, &HttpResponse, Option<&Bytes>) -> Result<(), BoxedStdError>
            + Send
            + Sync
            + 'static,
    ) -> &Self {
        self.data_core().push_validator(Arc::new(rule));
        self
    }

    /// Validate that the terminal status code is in the 2xx range.
    pub fn validate_success_status(&self) -> &Self {
        self.validate(|_, response, _| {
            if response.status.is_success() {
                Ok(())
            } else {
                Err(format!("unacceptable status code {}", response.status).into())
            }
        })
    }

    /// Run `serializer` against the terminal snapshot and deliver the typed
    /// outcome on the default callback queue.
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
