//! The request lifecycle engine.
//!
//! A [`Request`] owns one logical request from construction to cleanup:
//! building a representation, adapting it, creating a transport task per
//! attempt, collecting progress and metrics, deciding retries, running the
//! response-serializer pipeline, and tearing down exactly once.
//!
//! ## Contexts
//!
//! All state-mutating event methods run on the underlying [`SerialQueue`];
//! transports reach it through [`TaskEvents`], which dispatches every event
//! there. Public control methods are callable from any thread: they take the
//! state lock directly and schedule side effects onto the underlying queue
//! from within the locked section. Response serializers run on a separate
//! serialization queue, one at a time, strictly after the attempt's terminal
//! error and response are fixed.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::curl::curl_representation;
use crate::data::DataCore;
use crate::delegate::RequestDelegate;
use crate::download::DownloadCore;
use crate::errors::{Error, TaskErrorKind};
use crate::interceptor::{Interceptor, RetryContext, RetryDecision};
use crate::monitor::EventMonitor;
use crate::progress::Progress;
use crate::protected::Protected;
use crate::queue::SerialQueue;
use crate::socket::{Message, SocketCore};
use crate::stream::StreamCore;
use crate::transport::{TaskState, Transport, TransportTask};
use crate::types::{
    CachedResponseHandler, Credential, HttpRequest, HttpResponse, RedirectHandler,
    ResponseDisposition, TransportMetrics,
};
use crate::upload::UploadCore;

/// Lifecycle state of a request.
///
/// `cancelled` is absorbing; `finished` may only reopen to `resumed`, which
/// happens when a response serializer is appended after processing has
/// already completed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Initialized,
    Resumed,
    Suspended,
    Cancelled,
    Finished,
}

impl State {
    pub(crate) fn can_transition_to(self, to: State) -> bool {
        match (self, to) {
            (State::Initialized, _) => true,
            (State::Resumed, State::Suspended) | (State::Suspended, State::Resumed) => true,
            (State::Resumed | State::Suspended, State::Cancelled | State::Finished) => true,
            (State::Finished, State::Resumed) => true,
            _ => false,
        }
    }
}

/// Produces the initial request representation for each attempt.
pub type RequestFactory = Box<
    dyn Fn() -> std::result::Result<HttpRequest, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

type SerializerJob = Box<dyn FnOnce(&Request) + Send>;
type CompletionJob = Box<dyn FnOnce() + Send>;
type ProgressHandler = (SerialQueue, Arc<dyn Fn(Progress) + Send + Sync>);
type RequestCreatedHandler = (SerialQueue, Arc<dyn Fn(&HttpRequest) + Send + Sync>);
type TaskCreatedHandler = (SerialQueue, Arc<dyn Fn(Arc<dyn TransportTask>) + Send + Sync>);

/// Everything mutable on a request, guarded by one lock.
#[derive(Default)]
struct MutableState {
    state: State,
    /// Every representation produced: original plus each adapted/retried
    /// variant. The last element is current.
    requests: Vec<HttpRequest>,
    /// Every transport task created, one per attempt.
    tasks: Vec<Arc<dyn TransportTask>>,
    /// Per-attempt metrics, index-aligned with `tasks` once attempts
    /// complete.
    metrics: Vec<TransportMetrics>,
    retry_count: u32,
    /// First-set-wins terminal error.
    error: Option<Error>,
    response: Option<HttpResponse>,
    credential: Option<Credential>,
    redirect_handler: Option<Arc<dyn RedirectHandler>>,
    cached_response_handler: Option<Arc<dyn CachedResponseHandler>>,
    response_serializers: VecDeque<SerializerJob>,
    response_serializer_completions: Vec<CompletionJob>,
    serializer_processing_finished: bool,
    is_finishing: bool,
    cleanup_ran: bool,
    finish_handlers: Vec<CompletionJob>,
    upload_progress: Progress,
    download_progress: Progress,
    upload_progress_handler: Option<ProgressHandler>,
    download_progress_handler: Option<ProgressHandler>,
    request_created_handler: Option<RequestCreatedHandler>,
    task_created_handler: Option<TaskCreatedHandler>,
}

/// Construction-time collaborators shared by every variant.
pub struct RequestConfig {
    pub transport: Arc<dyn Transport>,
    /// Serial context for lifecycle events; a fresh queue when `None`.
    pub underlying_queue: Option<SerialQueue>,
    /// Serial context for response serializers; a fresh queue when `None`.
    pub serialization_queue: Option<SerialQueue>,
    /// Default context for user callbacks; a fresh queue when `None`.
    pub callback_queue: Option<SerialQueue>,
    pub interceptor: Option<Arc<dyn Interceptor>>,
    pub monitor: Option<Arc<dyn EventMonitor>>,
    pub delegate: Option<Weak<dyn RequestDelegate>>,
}

impl RequestConfig {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            underlying_queue: None,
            serialization_queue: None,
            callback_queue: None,
            interceptor: None,
            monitor: None,
            delegate: None,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn EventMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Store a weak reference to the delegate; the caller keeps it alive.
    pub fn with_delegate<D: RequestDelegate + 'static>(mut self, delegate: &Arc<D>) -> Self {
        let delegate: Arc<dyn RequestDelegate> = delegate.clone();
        let weak: Weak<dyn RequestDelegate> = Arc::downgrade(&delegate);
        self.delegate = Some(weak);
        self
    }
}

pub(crate) struct RequestInner {
    id: Uuid,
    underlying_queue: SerialQueue,
    serialization_queue: SerialQueue,
    callback_queue: SerialQueue,
    transport: Arc<dyn Transport>,
    factory: Option<RequestFactory>,
    interceptor: Option<Arc<dyn Interceptor>>,
    monitor: Option<Arc<dyn EventMonitor>>,
    delegate: Option<Weak<dyn RequestDelegate>>,
    state: Protected<MutableState>,
    pub(crate) variant: Variant,
}

/// The closed set of request specializations sharing this engine.
pub(crate) enum Variant {
    Data(DataCore),
    Stream(StreamCore),
    Download(DownloadCore),
    Upload(UploadCore),
    Socket(SocketCore),
}

impl Variant {
    fn reset(&self) {
        match self {
            Variant::Data(core) => core.reset(),
            Variant::Stream(core) => core.reset(),
            Variant::Download(core) => core.reset(),
            Variant::Upload(core) => core.reset(),
            Variant::Socket(core) => core.reset(),
        }
    }

    fn filter_completion_error(&self, error: Option<Error>) -> Option<Error> {
        match self {
            Variant::Socket(core) => core.filter_completion_error(error),
            _ => error,
        }
    }

    fn did_complete(&self, request: &Request, error: Option<&Error>) {
        if let Variant::Socket(core) = self {
            core.did_complete(request, error);
        }
    }

    fn cleanup(&self, request: &Request) {
        match self {
            Variant::Upload(core) => core.cleanup(request),
            Variant::Socket(core) => core.abort_heartbeat(),
            _ => {}
        }
    }
}

/// Cheap cloneable handle to one logical request.
///
/// Equality and hashing use the request's unique id.
#[derive(Clone)]
pub struct Request {
    pub(crate) inner: Arc<RequestInner>,
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Request {}

impl std::hash::Hash for Request {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Terminal request/response/error snapshot observed by every serializer and
/// completion of one finish cycle.
pub(crate) struct Snapshot {
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub error: Option<Error>,
    pub retry_count: u32,
}

impl Request {
    pub(crate) fn build(
        config: RequestConfig,
        factory: Option<RequestFactory>,
        variant: Variant,
    ) -> Self {
        let underlying_queue = config
            .underlying_queue
            .unwrap_or_else(|| SerialQueue::new("reqflow.underlying"));
        let serialization_queue = config
            .serialization_queue
            .unwrap_or_else(|| SerialQueue::new("reqflow.serialization"));
        let callback_queue = config
            .callback_queue
            .unwrap_or_else(|| SerialQueue::new("reqflow.callbacks"));

        let request = Self {
            inner: Arc::new(RequestInner {
                id: Uuid::new_v4(),
                underlying_queue,
                serialization_queue,
                callback_queue,
                transport: config.transport,
                factory,
                interceptor: config.interceptor,
                monitor: config.monitor,
                delegate: config.delegate,
                state: Protected::new(MutableState::default()),
                variant,
            }),
        };

        let this = request.clone();
        request
            .inner
            .underlying_queue
            .dispatch(move || this.perform());
        request
    }

    // MARK: identity and accessors

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> State {
        self.inner.state.read(|s| s.state)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == State::Cancelled
    }

    pub fn is_resumed(&self) -> bool {
        self.state() == State::Resumed
    }

    pub fn is_suspended(&self) -> bool {
        self.state() == State::Suspended
    }

    pub fn is_finished(&self) -> bool {
        self.state() == State::Finished
    }

    pub fn error(&self) -> Option<Error> {
        self.inner.state.read(|s| s.error.clone())
    }

    pub fn response(&self) -> Option<HttpResponse> {
        self.inner.state.read(|s| s.response.clone())
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.state.read(|s| s.retry_count)
    }

    /// Every representation produced so far; the last element is current.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.inner.state.read(|s| s.requests.clone())
    }

    pub fn current_request(&self) -> Option<HttpRequest> {
        self.inner.state.read(|s| s.requests.last().cloned())
    }

    pub fn first_request(&self) -> Option<HttpRequest> {
        self.inner.state.read(|s| s.requests.first().cloned())
    }

    /// Number of transport tasks created so far (one per attempt).
    pub fn task_count(&self) -> usize {
        self.inner.state.read(|s| s.tasks.len())
    }

    pub fn metrics(&self) -> Vec<TransportMetrics> {
        self.inner.state.read(|s| s.metrics.clone())
    }

    pub fn upload_progress_value(&self) -> Progress {
        self.inner.state.read(|s| s.upload_progress)
    }

    pub fn download_progress_value(&self) -> Progress {
        self.inner.state.read(|s| s.download_progress)
    }

    pub fn credential_value(&self) -> Option<Credential> {
        self.inner.state.read(|s| s.credential.clone())
    }

    pub fn redirect_handler_value(&self) -> Option<Arc<dyn RedirectHandler>> {
        self.inner.state.read(|s| s.redirect_handler.clone())
    }

    pub fn cached_response_handler_value(&self) -> Option<Arc<dyn CachedResponseHandler>> {
        self.inner.state.read(|s| s.cached_response_handler.clone())
    }

    pub(crate) fn callback_queue(&self) -> SerialQueue {
        self.inner.callback_queue.clone()
    }

    pub(crate) fn underlying_queue(&self) -> SerialQueue {
        self.inner.underlying_queue.clone()
    }

    fn delegate(&self) -> Option<Arc<dyn RequestDelegate>> {
        self.inner.delegate.as_ref().and_then(Weak::upgrade)
    }

    fn notify(&self, f: impl FnOnce(&dyn EventMonitor)) {
        if let Some(monitor) = &self.inner.monitor {
            f(monitor.as_ref());
        }
    }

    pub(crate) fn terminal_snapshot(&self) -> Snapshot {
        self.inner.state.read(|s| Snapshot {
            request: s.requests.last().cloned(),
            response: s.response.clone(),
            error: s.error.clone(),
            retry_count: s.retry_count,
        })
    }

    /// Render the current representation as a `curl` command for debugging.
    pub fn debug_command(&self) -> String {
        let (request, credential) = self
            .inner
            .state
            .read(|s| (s.requests.last().cloned(), s.credential.clone()));
        let Some(request) = request else {
            return "$ curl command could not be created: no request representation".to_string();
        };
        let session_headers = self
            .delegate()
            .map(|d| d.session_headers())
            .unwrap_or_default();
        curl_representation(&request, &session_headers, credential.as_ref())
    }

    // MARK: public control API

    /// Resume the request and its current task, if any.
    pub fn resume(&self) -> &Self {
        self.inner.state.write(|s| {
            if !s.state.can_transition_to(State::Resumed) {
                return;
            }
            s.state = State::Resumed;
            #[cfg(feature = "tracing")]
            tracing::trace!(id = %self.inner.id, "request resumed");
            let this = self.clone();
            self.inner.underlying_queue.dispatch(move || this.did_resume());
            let Some(task) = s.tasks.last() else { return };
            if task.state() == TaskState::Completed {
                return;
            }
            task.resume();
            let this = self.clone();
            self.inner
                .underlying_queue
                .dispatch(move || this.did_resume_task());
        });
        self
    }

    /// Suspend the request and its current task, if any.
    pub fn suspend(&self) -> &Self {
        self.inner.state.write(|s| {
            if !s.state.can_transition_to(State::Suspended) {
                return;
            }
            s.state = State::Suspended;
            #[cfg(feature = "tracing")]
            tracing::trace!(id = %self.inner.id, "request suspended");
            let this = self.clone();
            self.inner
                .underlying_queue
                .dispatch(move || this.did_suspend());
            let Some(task) = s.tasks.last() else { return };
            if task.state() == TaskState::Completed {
                return;
            }
            task.suspend();
            let this = self.clone();
            self.inner
                .underlying_queue
                .dispatch(move || this.did_suspend_task());
        });
        self
    }

    /// Cancel the request. Sets the cancellation sentinel unless a more
    /// specific error was already recorded; teardown and `finish` are
    /// asynchronous.
    pub fn cancel(&self) -> &Self {
        self.cancel_with_teardown(false);
        self
    }

    pub(crate) fn cancel_with_teardown(&self, capture_resume_data: bool) {
        self.inner.state.write(|s| {
            if !s.state.can_transition_to(State::Cancelled) {
                return;
            }
            s.state = State::Cancelled;
            if s.error.is_none() {
                s.error = Some(Error::ExplicitlyCancelled);
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(id = %self.inner.id, "request cancelled");
            let this = self.clone();
            self.inner.underlying_queue.dispatch(move || this.did_cancel());

            match s.tasks.last() {
                Some(task) if task.state() != TaskState::Completed => {
                    let task = task.clone();
                    // Resume first so the transport still gathers metrics
                    // for the attempt being torn down.
                    task.resume();
                    if capture_resume_data {
                        if let Variant::Download(core) = &self.inner.variant {
                            let this = self.clone();
                            let core_resume = core.resume_capture_slot();
                            task.cancel_producing_resume_data(Box::new(move |data| {
                                if let Some(data) = data {
                                    core_resume.write(|slot| *slot = Some(data));
                                }
                                let queue = this.inner.underlying_queue.clone();
                                queue.dispatch(move || this.did_cancel_task());
                            }));
                            return;
                        }
                    }
                    task.cancel();
                    let this = self.clone();
                    self.inner
                        .underlying_queue
                        .dispatch(move || this.did_cancel_task());
                }
                _ => {
                    let this = self.clone();
                    self.inner
                        .underlying_queue
                        .dispatch(move || this.finish(None));
                }
            }
        });
    }

    /// Structured socket close: transitions to `cancelled` without recording
    /// the sentinel error (a clean close is not a failure) and closes the
    /// task with the given code and reason.
    pub(crate) fn cancel_for_close(&self, code: u16, reason: Option<String>) {
        self.inner.state.write(|s| {
            if !s.state.can_transition_to(State::Cancelled) {
                return;
            }
            s.state = State::Cancelled;
            let this = self.clone();
            self.inner.underlying_queue.dispatch(move || this.did_cancel());
            match s.tasks.last() {
                Some(task) if task.state() != TaskState::Completed => {
                    task.close(code, reason.clone());
                    let this = self.clone();
                    self.inner
                        .underlying_queue
                        .dispatch(move || this.did_cancel_task());
                }
                _ => {
                    let this = self.clone();
                    self.inner
                        .underlying_queue
                        .dispatch(move || this.finish(None));
                }
            }
        });
    }

    /// Cancel without touching the task; used when a disposition hook
    /// rejects a response and the transport is expected to abort on its own.
    pub(crate) fn cancel_without_teardown(&self) {
        self.inner.state.write(|s| {
            if !s.state.can_transition_to(State::Cancelled) {
                return;
            }
            s.state = State::Cancelled;
            if s.error.is_none() {
                s.error = Some(Error::ExplicitlyCancelled);
            }
            let this = self.clone();
            self.inner.underlying_queue.dispatch(move || this.did_cancel());
        });
    }

    // MARK: handler registration

    /// Attach a basic credential. Setting a second credential is a caller
    /// contract violation.
    pub fn authenticate(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> &Self {
        self.credential(Credential::new(username, password))
    }

    pub fn credential(&self, credential: Credential) -> &Self {
        self.inner.state.write(|s| {
            assert!(
                s.credential.is_none(),
                "credential may only be set once per request"
            );
            s.credential = Some(credential);
        });
        self
    }

    /// Attach the redirect policy. Setting a second handler is a caller
    /// contract violation.
    pub fn redirect_handler(&self, handler: Arc<dyn RedirectHandler>) -> &Self {
        self.inner.state.write(|s| {
            assert!(
                s.redirect_handler.is_none(),
                "redirect handler may only be set once per request"
            );
            s.redirect_handler = Some(handler);
        });
        self
    }

    /// Attach the cache policy. Setting a second handler is a caller
    /// contract violation.
    pub fn cached_response_handler(&self, handler: Arc<dyn CachedResponseHandler>) -> &Self {
        self.inner.state.write(|s| {
            assert!(
                s.cached_response_handler.is_none(),
                "cached-response handler may only be set once per request"
            );
            s.cached_response_handler = Some(handler);
        });
        self
    }

    /// Observe upload progress on the default callback queue. Registering a
    /// new handler discards the previous one.
    pub fn upload_progress(&self, handler: impl Fn(Progress) + Send + Sync + 'static) -> &Self {
        self.upload_progress_on(self.inner.callback_queue.clone(), handler)
    }

    pub fn upload_progress_on(
        &self,
        queue: SerialQueue,
        handler: impl Fn(Progress) + Send + Sync + 'static,
    ) -> &Self {
        self.inner
            .state
            .write(|s| s.upload_progress_handler = Some((queue, Arc::new(handler))));
        self
    }

    /// Observe download progress on the default callback queue. Registering
    /// a new handler discards the previous one.
    pub fn download_progress(&self, handler: impl Fn(Progress) + Send + Sync + 'static) -> &Self {
        self.download_progress_on(self.inner.callback_queue.clone(), handler)
    }

    pub fn download_progress_on(
        &self,
        queue: SerialQueue,
        handler: impl Fn(Progress) + Send + Sync + 'static,
    ) -> &Self {
        self.inner
            .state
            .write(|s| s.download_progress_handler = Some((queue, Arc::new(handler))));
        self
    }

    /// Observe every final (post-adaptation) representation as it is
    /// created, including retries. Replaces any previous handler.
    pub fn on_request_created(
        &self,
        handler: impl Fn(&HttpRequest) + Send + Sync + 'static,
    ) -> &Self {
        let queue = self.inner.callback_queue.clone();
        self.inner
            .state
            .write(|s| s.request_created_handler = Some((queue, Arc::new(handler))));
        self
    }

    /// Observe every transport task as it is created, including retries.
    /// Replaces any previous handler.
    pub fn on_task_created(
        &self,
        handler: impl Fn(Arc<dyn TransportTask>) + Send + Sync + 'static,
    ) -> &Self {
        let queue = self.inner.callback_queue.clone();
        self.inner
            .state
            .write(|s| s.task_created_handler = Some((queue, Arc::new(handler))));
        self
    }

    /// Run a one-shot handler at terminal cleanup; runs immediately when
    /// cleanup has already happened.
    pub fn on_finish(&self, handler: impl FnOnce() + Send + 'static) -> &Self {
        let leftover = self.inner.state.write(|s| {
            if s.cleanup_ran {
                Some(handler)
            } else {
                s.finish_handlers.push(Box::new(handler));
                None
            }
        });
        if let Some(handler) = leftover {
            handler();
        }
        self
    }

    /// Wait until terminal cleanup has run.
    pub async fn wait_until_finished(&self) {
        let (tx, rx) = oneshot::channel();
        self.on_finish(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    // MARK: attempt pipeline (underlying queue)

    pub(crate) fn perform(&self) {
        if self.is_cancelled() {
            return;
        }
        // Downloads continuing from resume data have no request to build.
        if let Variant::Download(core) = &self.inner.variant {
            if core.has_resume_source() {
                self.attempt_task_creation(None);
                return;
            }
        }
        let Some(factory) = &self.inner.factory else {
            return;
        };
        match factory() {
            Ok(request) => self.did_create_initial_request(request),
            Err(source) => self.did_fail_to_create_request(Error::request_creation(source)),
        }
    }

    fn did_create_initial_request(&self, request: HttpRequest) {
        self.inner.state.write(|s| s.requests.push(request.clone()));
        self.notify(|m| m.request_did_create_initial_request(self, &request));
        if self.is_cancelled() {
            return;
        }
        match &self.inner.interceptor {
            Some(interceptor) => match interceptor.adapt(request) {
                Ok(adapted) => self.did_adapt_request(adapted),
                Err(err) => self.did_fail_to_adapt(Error::RequestAdaptation {
                    source: Arc::new(err),
                }),
            },
            None => self.did_create_request(request),
        }
    }

    fn did_adapt_request(&self, adapted: HttpRequest) {
        self.inner.state.write(|s| s.requests.push(adapted.clone()));
        self.notify(|m| m.request_did_adapt_request(self, &adapted));
        self.did_create_request(adapted);
    }

    fn did_fail_to_adapt(&self, error: Error) {
        self.record_error(&error);
        self.notify(|m| m.request_did_fail_to_adapt_request(self, &error));
        self.retry_or_finish();
    }

    fn did_fail_to_create_request(&self, error: Error) {
        self.record_error(&error);
        self.notify(|m| m.request_did_fail_to_create_request(self, &error));
        self.retry_or_finish();
    }

    fn did_create_request(&self, request: HttpRequest) {
        let handler = self.inner.state.read(|s| s.request_created_handler.clone());
        if let Some((queue, handler)) = handler {
            let representation = request.clone();
            queue.dispatch(move || handler(&representation));
        }
        if self.is_cancelled() {
            return;
        }
        self.attempt_task_creation(Some(request));
    }

    fn attempt_task_creation(&self, request: Option<HttpRequest>) {
        let events = TaskEvents {
            inner: Arc::downgrade(&self.inner),
        };
        let transport = &self.inner.transport;
        let result = match (&self.inner.variant, request.as_ref()) {
            (Variant::Download(core), _) if core.has_resume_source() => {
                transport.download_task_resuming(core.resume_source(), events)
            }
            (Variant::Data(_), Some(request)) => transport.data_task(request, events),
            (Variant::Stream(_), Some(request)) => transport.data_task(request, events),
            (Variant::Download(_), Some(request)) => transport.download_task(request, events),
            (Variant::Upload(core), Some(request)) => match core.resolve() {
                Ok(uploadable) => {
                    self.notify(|m| m.request_did_create_uploadable(self));
                    transport.upload_task(request, uploadable, events)
                }
                Err(error) => {
                    self.record_error(&error);
                    self.notify(|m| m.request_did_fail_to_create_uploadable(self, &error));
                    self.retry_or_finish();
                    return;
                }
            },
            (Variant::Socket(_), Some(request)) => transport.socket_task(request, events),
            (_, None) => Err(Error::task(
                TaskErrorKind::Other,
                "attempt started without a request representation",
            )),
        };
        match result {
            Ok(task) => self.did_create_task(task),
            Err(error) => {
                self.record_error(&error);
                self.retry_or_finish();
            }
        }
    }

    pub(crate) fn did_create_task(&self, task: Arc<dyn TransportTask>) {
        self.inner.state.write(|s| {
            // Resume-data attempts have no built representation; keep the
            // history non-empty when the transport can report one.
            if s.requests.is_empty() {
                if let Some(request) = task.current_request() {
                    s.requests.push(request);
                }
            }
            s.tasks.push(task.clone());
        });
        if let Variant::Socket(core) = &self.inner.variant {
            core.flush_pending(&task);
        }
        self.notify(|m| m.request_did_create_task(self));
        let handler = self.inner.state.read(|s| s.task_created_handler.clone());
        if let Some((queue, handler)) = handler {
            let task = task.clone();
            queue.dispatch(move || handler(task));
        }
        self.update_states_for_task(task);
    }

    fn update_states_for_task(&self, task: Arc<dyn TransportTask>) {
        self.inner.state.write(|s| match s.state {
            State::Initialized | State::Finished => {}
            State::Resumed => {
                task.resume();
                let this = self.clone();
                self.inner
                    .underlying_queue
                    .dispatch(move || this.did_resume_task());
            }
            State::Suspended => {
                task.suspend();
                let this = self.clone();
                self.inner
                    .underlying_queue
                    .dispatch(move || this.did_suspend_task());
            }
            State::Cancelled => {
                task.resume();
                task.cancel();
                let this = self.clone();
                self.inner
                    .underlying_queue
                    .dispatch(move || this.did_cancel_task());
            }
        });
    }

    // MARK: lifecycle notifications (underlying queue)

    fn did_resume(&self) {
        self.notify(|m| m.request_did_resume(self));
    }

    fn did_resume_task(&self) {
        self.notify(|m| m.request_did_resume_task(self));
    }

    fn did_suspend(&self) {
        self.notify(|m| m.request_did_suspend(self));
    }

    fn did_suspend_task(&self) {
        self.notify(|m| m.request_did_suspend_task(self));
    }

    fn did_cancel(&self) {
        self.notify(|m| m.request_did_cancel(self));
    }

    fn did_cancel_task(&self) {
        self.notify(|m| m.request_did_cancel_task(self));
    }

    // MARK: transport event API (underlying queue)

    pub(crate) fn did_receive_response(&self, response: HttpResponse) {
        self.inner.state.write(|s| s.response = Some(response.clone()));
        self.notify(|m| m.request_did_receive_response(self, &response));
        let disposition = match &self.inner.variant {
            Variant::Data(core) => core.disposition(),
            Variant::Stream(core) => core.disposition(),
            Variant::Upload(core) => core.body().disposition(),
            _ => None,
        };
        if let Some(handler) = disposition {
            if handler(&response) == ResponseDisposition::Cancel {
                self.cancel_without_teardown();
            }
        }
    }

    pub(crate) fn did_receive_data(&self, chunk: Bytes) {
        match &self.inner.variant {
            Variant::Data(core) => core.did_receive(self, chunk),
            Variant::Stream(core) => core.did_receive(self, chunk),
            Variant::Upload(core) => core.body().did_receive(self, chunk),
            _ => {}
        }
    }

    pub(crate) fn did_send_body_data(&self, completed: u64, total: Option<u64>) {
        self.set_upload_progress(Progress::new(completed, total));
    }

    pub(crate) fn did_write_download_data(&self, completed: u64, total: Option<u64>) {
        self.set_download_progress(Progress::new(completed, total));
    }

    pub(crate) fn set_upload_progress(&self, progress: Progress) {
        let handler = self.inner.state.write(|s| {
            s.upload_progress = progress;
            s.upload_progress_handler.clone()
        });
        if let Some((queue, handler)) = handler {
            queue.dispatch(move || handler(progress));
        }
    }

    pub(crate) fn set_download_progress(&self, progress: Progress) {
        let handler = self.inner.state.write(|s| {
            s.download_progress = progress;
            s.download_progress_handler.clone()
        });
        if let Some((queue, handler)) = handler {
            queue.dispatch(move || handler(progress));
        }
    }

    pub(crate) fn did_finish_downloading(&self, temporary: PathBuf) {
        if let Variant::Download(core) = &self.inner.variant {
            core.did_finish_downloading(self, temporary);
        }
        self.notify(|m| m.request_did_finish_downloading(self));
    }

    pub(crate) fn did_gather_metrics(&self, metrics: TransportMetrics) {
        self.inner.state.write(|s| s.metrics.push(metrics.clone()));
        self.notify(|m| m.request_did_gather_metrics(self, &metrics));
    }

    pub(crate) fn did_fail_task_early(&self, error: Error) {
        self.record_error(&error);
        self.retry_or_finish();
    }

    pub(crate) fn did_complete_task(&self, error: Option<Error>) {
        let error = self.inner.variant.filter_completion_error(error);
        if let Some(error) = &error {
            self.record_error(error);
        }
        match &self.inner.variant {
            Variant::Data(core) => core.run_validators(self),
            Variant::Upload(core) => core.body().run_validators(self),
            _ => {}
        }
        let terminal = self.error();
        self.notify(|m| m.request_did_complete_task(self, terminal.as_ref()));
        self.inner.variant.did_complete(self, terminal.as_ref());
        self.retry_or_finish();
    }

    pub(crate) fn did_connect_socket(&self, protocol: Option<String>) {
        if let Variant::Socket(core) = &self.inner.variant {
            core.did_connect(self, protocol);
        }
    }

    pub(crate) fn did_receive_socket_message(&self, message: Message) {
        if let Variant::Socket(core) = &self.inner.variant {
            core.did_receive_message(self, message);
        }
    }

    pub(crate) fn did_disconnect_socket(&self, code: u16, reason: Option<String>) {
        if let Variant::Socket(core) = &self.inner.variant {
            core.did_disconnect(self, code, reason);
        }
    }

    pub(crate) fn record_error(&self, error: &Error) {
        self.inner.state.write(|s| {
            if s.error.is_none() {
                s.error = Some(error.clone());
            }
        });
    }

    pub(crate) fn notify_stream_consumer_failed(&self, error: &Error) {
        self.notify(|m| m.stream_consumer_failed(self, error));
    }

    pub(crate) fn notify_validation(&self, result: &Result<(), Error>) {
        self.notify(|m| m.request_did_validate(self, result));
    }

    pub(crate) fn notify_socket_event(&self, event: &crate::socket::SocketEvent) {
        self.notify(|m| m.socket_event(self, event));
    }

    pub(crate) fn current_task(&self) -> Option<Arc<dyn TransportTask>> {
        self.inner.state.read(|s| s.tasks.last().cloned())
    }

    // MARK: retry coordinator (underlying queue)

    pub(crate) fn retry_or_finish(&self) {
        let Some(error) = self.error() else {
            self.finish(None);
            return;
        };
        if self.is_cancelled() || !error.is_retry_candidate() {
            self.finish(None);
            return;
        }
        let Some(interceptor) = self.inner.interceptor.clone() else {
            self.finish(None);
            return;
        };
        let Some(delegate) = self.delegate() else {
            self.finish(None);
            return;
        };
        let context = RetryContext {
            request: self.current_request(),
            retry_count: self.retry_count(),
            error,
        };
        let future = interceptor.retry_decision(context);
        let this = self.clone();
        tokio::spawn(async move {
            let decision = future.await;
            #[cfg(feature = "tracing")]
            tracing::debug!(id = %this.inner.id, ?decision, "retry decision");
            let queue = this.inner.underlying_queue.clone();
            queue.dispatch(move || match decision {
                RetryDecision::DoNotRetry => this.finish(None),
                RetryDecision::DoNotRetryWithError(error) => this.finish(Some(error)),
                RetryDecision::Retry => delegate.retry_request(this.clone(), None),
                RetryDecision::RetryWithDelay(delay) => {
                    delegate.retry_request(this.clone(), Some(delay));
                }
            });
        });
    }

    /// Schedule a fresh attempt after an optional delay. Used by the default
    /// delegate implementation; custom delegates may call it too.
    pub fn retry_after(&self, delay: Option<Duration>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let queue = this.inner.underlying_queue.clone();
            queue.dispatch(move || {
                if this.is_cancelled() {
                    return;
                }
                this.prepare_for_retry();
                this.perform();
            });
        });
    }

    fn prepare_for_retry(&self) {
        self.notify(|m| m.request_is_retrying(self));
        self.inner.state.write(|s| s.retry_count += 1);
        self.reset();
    }

    /// Clear per-attempt state so the next attempt starts clean.
    fn reset(&self) {
        self.inner.state.write(|s| {
            s.error = None;
            s.is_finishing = false;
            s.upload_progress = Progress::default();
            s.download_progress = Progress::default();
        });
        self.inner.variant.reset();
    }

    // MARK: response serialization pipeline

    pub(crate) fn append_response_serializer(&self, job: SerializerJob) {
        let reprocess = self.inner.state.write(|s| {
            s.response_serializers.push_back(job);
            if s.state == State::Finished {
                s.state = State::Resumed;
            }
            if s.serializer_processing_finished {
                s.serializer_processing_finished = false;
                true
            } else {
                false
            }
        });
        if reprocess {
            let this = self.clone();
            self.inner
                .underlying_queue
                .dispatch(move || this.process_next_response_serializer());
        }
        // Attaching a serializer auto-resumes when the delegate asks for it.
        let this = self.clone();
        self.inner.underlying_queue.dispatch(move || {
            if this.delegate().is_some_and(|d| d.start_immediately()) {
                this.resume();
            }
        });
    }

    /// Mark the attempt terminal and start the serializer queue. Idempotent
    /// within one attempt.
    pub(crate) fn finish(&self, substituted_error: Option<Error>) {
        let already_finishing = self.inner.state.write(|s| {
            if s.is_finishing {
                return true;
            }
            s.is_finishing = true;
            if let Some(error) = substituted_error {
                s.error = Some(error);
            }
            false
        });
        if already_finishing {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(id = %self.inner.id, "request finishing");
        let this = self.clone();
        self.inner
            .underlying_queue
            .dispatch(move || this.process_next_response_serializer());
    }

    fn process_next_response_serializer(&self) {
        let job = self
            .inner
            .state
            .write(|s| s.response_serializers.pop_front());
        match job {
            Some(job) => {
                let this = self.clone();
                self.inner
                    .serialization_queue
                    .dispatch(move || job(&this));
            }
            None => {
                let completions = self.inner.state.write(|s| {
                    let completions = std::mem::take(&mut s.response_serializer_completions);
                    if s.state.can_transition_to(State::Finished) {
                        s.state = State::Finished;
                    }
                    s.serializer_processing_finished = true;
                    s.is_finishing = false;
                    completions
                });
                // Completions run outside the lock so they may safely
                // re-enter the request, e.g. cancel from within a completion.
                for completion in completions {
                    completion();
                }
                self.notify(|m| m.request_did_finish(self));
                self.cleanup();
            }
        }
    }

    /// Called by a serializer job once its user completion is ready; the
    /// completion is drained after the whole queue has run.
    pub(crate) fn response_serializer_did_complete(&self, completion: CompletionJob) {
        self.inner
            .state
            .write(|s| s.response_serializer_completions.push(completion));
        let this = self.clone();
        self.inner
            .underlying_queue
            .dispatch(move || this.process_next_response_serializer());
    }

    fn cleanup(&self) {
        let handlers = self.inner.state.write(|s| {
            if s.cleanup_ran {
                None
            } else {
                s.cleanup_ran = true;
                Some(std::mem::take(&mut s.finish_handlers))
            }
        });
        let Some(handlers) = handlers else { return };
        for handler in handlers {
            handler();
        }
        if let Some(delegate) = self.delegate() {
            delegate.cleanup_after(self);
        }
        self.inner.variant.cleanup(self);
    }
}

/// Weak, cloneable handle a transport task uses to report lifecycle events.
///
/// Every event is dispatched onto the owning request's underlying queue;
/// events after the request has been dropped are silently discarded.
#[derive(Clone)]
pub struct TaskEvents {
    inner: Weak<RequestInner>,
}

impl TaskEvents {
    fn dispatch(&self, f: impl FnOnce(&Request) + Send + 'static) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let request = Request { inner };
        let queue = request.inner.underlying_queue.clone();
        queue.dispatch(move || f(&request));
    }

    /// Whether the owning request has been cancelled (or dropped); polled by
    /// transports that abort cooperatively.
    pub fn is_cancelled(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => Request { inner }.is_cancelled(),
            None => true,
        }
    }

    pub fn received_response(&self, response: HttpResponse) {
        self.dispatch(move |r| r.did_receive_response(response));
    }

    pub fn received_data(&self, chunk: Bytes) {
        self.dispatch(move |r| r.did_receive_data(chunk));
    }

    pub fn sent_body_data(&self, completed: u64, total: Option<u64>) {
        self.dispatch(move |r| r.did_send_body_data(completed, total));
    }

    pub fn wrote_download_data(&self, completed: u64, total: Option<u64>) {
        self.dispatch(move |r| r.did_write_download_data(completed, total));
    }

    pub fn finished_downloading_to(&self, temporary: PathBuf) {
        self.dispatch(move |r| r.did_finish_downloading(temporary));
    }

    pub fn gathered_metrics(&self, metrics: TransportMetrics) {
        self.dispatch(move |r| r.did_gather_metrics(metrics));
    }

    /// Report a failure before the attempt could complete normally.
    pub fn failed_early(&self, error: Error) {
        self.dispatch(move |r| r.did_fail_task_early(error));
    }

    /// Report the end of the attempt. Exactly one completion per task.
    pub fn completed(&self, error: Option<Error>) {
        self.dispatch(move |r| r.did_complete_task(error));
    }

    pub fn socket_connected(&self, protocol: Option<String>) {
        self.dispatch(move |r| r.did_connect_socket(protocol));
    }

    pub fn socket_received_message(&self, message: Message) {
        self.dispatch(move |r| r.did_receive_socket_message(message));
    }

    pub fn socket_disconnected(&self, code: u16, reason: Option<String>) {
        self.dispatch(move |r| r.did_disconnect_socket(code, reason));
    }
}
