//! Streaming-body variant.
//!
//! Chunks fan out to every registered consumer and optionally mirror into a
//! byte channel. Completion delivery is deferred while any consumer is still
//! processing a chunk, so a consumer never observes completion before one of
//! its own in-flight chunk invocations has returned.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::Error;
use crate::protected::Protected;
use crate::queue::SerialQueue;
use crate::request::{Request, RequestConfig, RequestInner, Variant};
use crate::types::{HttpRequest, HttpResponse, ResponseDisposition};

type BoxedStdError = Box<dyn std::error::Error + Send + Sync>;

type DispositionHandler = Arc<dyn Fn(&HttpResponse) -> ResponseDisposition + Send + Sync>;

type ConsumerHandler = Arc<dyn Fn(StreamPayload) -> Result<(), BoxedStdError> + Send + Sync>;

/// Event delivered to a stream consumer.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(Bytes),
    Complete(StreamCompletion),
}

/// Terminal summary delivered to each consumer exactly once.
#[derive(Clone, Debug)]
pub struct StreamCompletion {
    pub response: Option<HttpResponse>,
    pub error: Option<Error>,
}

/// One stream event plus a weak cancellation token, so a consumer can stop
/// the whole stream without holding a strong reference to the request.
pub struct StreamPayload {
    pub event: StreamEvent,
    pub token: StreamCancellationToken,
}

/// Weakly-linked cancel handle handed to every consumer invocation.
#[derive(Clone)]
pub struct StreamCancellationToken {
    inner: Weak<RequestInner>,
}

impl StreamCancellationToken {
    pub(crate) fn new(request: &Request) -> Self {
        Self {
            inner: Arc::downgrade(&request.inner),
        }
    }

    /// Cancel the owning request; a no-op once the request is gone.
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            Request { inner }.cancel();
        }
    }
}

#[derive(Clone)]
struct Consumer {
    queue: SerialQueue,
    handler: ConsumerHandler,
}

#[derive(Default)]
struct StreamMutableState {
    sink: Option<mpsc::UnboundedSender<Bytes>>,
    consumers: Vec<Consumer>,
    /// Consumer invocations currently running or queued for a chunk.
    executing: usize,
    /// Completion deliveries held back until `executing` returns to zero.
    queued_completions: Vec<Box<dyn FnOnce() + Send>>,
    disposition: Option<DispositionHandler>,
}

pub(crate) struct StreamCore {
    state: Protected<StreamMutableState>,
    cancel_on_error: bool,
}

impl StreamCore {
    pub(crate) fn new(cancel_on_error: bool) -> Self {
        Self {
            state: Protected::default(),
            cancel_on_error,
        }
    }

    pub(crate) fn disposition(&self) -> Option<DispositionHandler> {
        self.state.read(|s| s.disposition.clone())
    }

    pub(crate) fn did_receive(&self, request: &Request, chunk: Bytes) {
        let (consumers, sink) = self.state.write(|s| {
            s.executing += s.consumers.len();
            (s.consumers.clone(), s.sink.clone())
        });
        if let Some(sink) = sink {
            let _ = sink.send(chunk.clone());
        }
        for consumer in consumers {
            let request = request.clone();
            let chunk = chunk.clone();
            let handler = consumer.handler.clone();
            let cancel_on_error = self.cancel_on_error;
            consumer.queue.dispatch(move || {
                let token = StreamCancellationToken::new(&request);
                let result = handler(StreamPayload {
                    event: StreamEvent::Chunk(chunk),
                    token,
                });
                if let Err(source) = result {
                    let error = Error::stream_consumer(source);
                    request.notify_stream_consumer_failed(&error);
                    if cancel_on_error {
                        // Record the specific consumer error before the
                        // sentinel can take the slot.
                        request.record_error(&error);
                        request.cancel();
                    }
                }
                stream_core(&request).consumer_finished();
            });
        }
    }

    fn consumer_finished(&self) {
        let ready = self.state.write(|s| {
            s.executing = s.executing.saturating_sub(1);
            if s.executing == 0 {
                std::mem::take(&mut s.queued_completions)
            } else {
                Vec::new()
            }
        });
        for completion in ready {
            completion();
        }
    }

    fn enqueue_completion(&self, completion: Box<dyn FnOnce() + Send>) {
        let ready = self.state.write(move |s| {
            if s.executing > 0 {
                s.queued_completions.push(completion);
                None
            } else {
                Some(completion)
            }
        });
        if let Some(completion) = ready {
            completion();
        }
    }

    pub(crate) fn reset(&self) {
        // Consumers, the sink binding, and in-flight bookkeeping survive a
        // retry; there is no buffered body to discard.
    }
}

fn stream_core(request: &Request) -> &StreamCore {
    match &request.inner.variant {
        Variant::Stream(core) => core,
        _ => unreachable!("stream consumer registered on stream variant"),
    }
}

/// Request variant that delivers body chunks to consumers as they arrive.
#[derive(Clone)]
pub struct StreamRequest {
    core: Request,
}

impl Deref for StreamRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.core
    }
}

impl StreamRequest {
    pub fn new(
        config: RequestConfig,
        factory: impl Fn() -> Result<HttpRequest, BoxedStdError> + Send + Sync + 'static,
    ) -> Self {
        Self::with_options(config, factory, false)
    }

    /// `automatically_cancel_on_stream_error` promotes consumer errors to
    /// request cancellation; otherwise they surface only through the event
    /// monitor.
    pub fn with_options(
        config: RequestConfig,
        factory: impl Fn() -> Result<HttpRequest, BoxedStdError> + Send + Sync + 'static,
        automatically_cancel_on_stream_error: bool,
    ) -> Self {
        let core = Request::build(
            config,
            Some(Box::new(factory)),
            Variant::Stream(StreamCore::new(automatically_cancel_on_stream_error)),
        );
        Self { core }
    }

    fn stream_core(&self) -> &StreamCore {
        stream_core(&self.core)
    }

    /// Register a consumer on the default callback queue.
    pub fn stream(
        &self,
        consumer: impl Fn(StreamPayload) -> Result<(), BoxedStdError> + Send + Sync + 'static,
    ) -> &Self {
        self.stream_on(self.core.callback_queue(), consumer)
    }

    /// Register a consumer on a caller-supplied queue. The consumer receives
    /// every chunk and, after the request finishes, exactly one
    /// [`StreamEvent::Complete`] that is never delivered while one of its
    /// chunk invocations is still running.
    pub fn stream_on(
        &self,
        queue: SerialQueue,
        consumer: impl Fn(StreamPayload) -> Result<(), BoxedStdError> + Send + Sync + 'static,
    ) -> &Self {
        let consumer = Consumer {
            queue,
            handler: Arc::new(consumer),
        };
        self.stream_core()
            .state
            .write(|s| s.consumers.push(consumer.clone()));

        // Completion rides the serializer pipeline so it observes the same
        // terminal snapshot as every other completion of this finish cycle.
        self.core
            .append_response_serializer(Box::new(move |request: &Request| {
                let snapshot = request.terminal_snapshot();
                let completion = StreamCompletion {
                    response: snapshot.response,
                    error: snapshot.error,
                };
                let request_handle = request.clone();
                let deliver: Box<dyn FnOnce() + Send> = Box::new(move || {
                    let token = StreamCancellationToken::new(&request_handle);
                    let handler = consumer.handler.clone();
                    consumer.queue.dispatch(move || {
                        let _ = handler(StreamPayload {
                            event: StreamEvent::Complete(completion),
                            token,
                        });
                    });
                });
                stream_core(request).enqueue_completion(deliver);
                request.response_serializer_did_complete(Box::new(|| {}));
            }));
        self
    }

    /// Mirror every chunk into an unbounded channel and return the receiver.
    /// May be bound once per request.
    pub fn byte_channel(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stream_core().state.write(|s| {
            assert!(
                s.sink.is_none(),
                "byte channel may only be bound once per request"
            );
            s.sink = Some(tx);
        });
        rx
    }

    /// Inspect each intermediate response; returning
    /// [`ResponseDisposition::Cancel`] cancels the stream.
    pub fn on_response(
        &self,
        handler: impl Fn(&HttpResponse) -> ResponseDisposition + Send + Sync + 'static,
    ) -> &Self {
        self.stream_core().state.write(|s| {
            assert!(
                s.disposition.is_none(),
                "response disposition hook may only be set once per request"
            );
            s.disposition = Some(Arc::new(handler));
        });
        self
    }
}
