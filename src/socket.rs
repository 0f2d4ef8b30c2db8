//! Bidirectional socket variant.
//!
//! Wraps a message task: sends issued before the task exists are queued and
//! flushed in order on creation, incoming events fan out to every handler
//! through a pluggable message serializer, an optional heartbeat pings on an
//! interval (rescheduling only on a successful pong), and `close` performs a
//! structured cancel that is not reported as an error.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::errors::{Error, Result};
use crate::protected::Protected;
use crate::queue::SerialQueue;
use crate::request::{Request, RequestConfig, Variant};
use crate::transport::{SendCompletion, TaskState, TransportTask};
use crate::types::HttpRequest;

type BoxedStdError = Box<dyn std::error::Error + Send + Sync>;

/// Well-known close codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
}

/// One socket message in either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Event fanned out to every registered handler.
#[derive(Clone, Debug)]
pub enum SocketEvent {
    Connected { protocol: Option<String> },
    /// A message that passed the serializer's decode step.
    Message(Message),
    /// The serializer rejected an incoming message; the socket stays up.
    SerializerFailed(Error),
    Disconnected { code: u16, reason: Option<String> },
    /// The underlying task finished; terminal unless the request retries.
    Completed { error: Option<Error> },
}

/// Decode step applied to every incoming message before fan-out.
pub trait MessageSerializer: Send + Sync {
    fn decode(&self, message: Message) -> Result<Message>;
}

/// Serializer that hands messages through untouched.
pub struct PassthroughMessageSerializer;

impl MessageSerializer for PassthroughMessageSerializer {
    fn decode(&self, message: Message) -> Result<Message> {
        Ok(message)
    }
}

/// Construction options for a socket request.
pub struct SocketOptions {
    /// Heartbeat interval; no heartbeat when `None`.
    pub ping_interval: Option<Duration>,
    pub message_serializer: Arc<dyn MessageSerializer>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            ping_interval: None,
            message_serializer: Arc::new(PassthroughMessageSerializer),
        }
    }
}

#[derive(Clone)]
struct Handler {
    queue: SerialQueue,
    handler: Arc<dyn Fn(SocketEvent) + Send + Sync>,
}

struct SocketMutableState {
    /// Sends issued before the task exists, flushed in order on creation.
    pending_sends: Vec<(Message, SendCompletion)>,
    handlers: Vec<Handler>,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
    close_intent: Option<(u16, Option<String>)>,
}

impl Default for SocketMutableState {
    fn default() -> Self {
        Self {
            pending_sends: Vec::new(),
            handlers: Vec::new(),
            heartbeat: None,
            close_intent: None,
        }
    }
}

pub(crate) struct SocketCore {
    serializer: Arc<dyn MessageSerializer>,
    ping_interval: Option<Duration>,
    state: Protected<SocketMutableState>,
}

impl SocketCore {
    fn new(options: SocketOptions) -> Self {
        Self {
            serializer: options.message_serializer,
            ping_interval: options.ping_interval,
            state: Protected::default(),
        }
    }

    fn fan_out(&self, request: &Request, event: SocketEvent) {
        request.notify_socket_event(&event);
        let handlers = self.state.read(|s| s.handlers.clone());
        for entry in handlers {
            let event = event.clone();
            let handler = entry.handler.clone();
            entry.queue.dispatch(move || handler(event));
        }
    }

    pub(crate) fn flush_pending(&self, task: &Arc<dyn TransportTask>) {
        let pending = self.state.write(|s| std::mem::take(&mut s.pending_sends));
        for (message, completion) in pending {
            task.send_message(message, completion);
        }
    }

    pub(crate) fn did_connect(&self, request: &Request, protocol: Option<String>) {
        self.fan_out(request, SocketEvent::Connected { protocol });
        let Some(interval) = self.ping_interval else {
            return;
        };
        let weak = Arc::downgrade(&request.inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                let request = Request { inner };
                let Some(task) = request.current_task() else { break };
                if task.state() == TaskState::Completed {
                    break;
                }
                let (tx, rx) = oneshot::channel();
                task.send_ping(Box::new(move |result| {
                    let _ = tx.send(result);
                }));
                match rx.await {
                    // Reschedule only after a successful pong.
                    Ok(Ok(())) => continue,
                    // A failed ping or send cancels the heartbeat.
                    _ => break,
                }
            }
        });
        let previous = self.state.write(|s| s.heartbeat.replace(handle));
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(crate) fn did_receive_message(&self, request: &Request, message: Message) {
        match self.serializer.decode(message) {
            Ok(decoded) => self.fan_out(request, SocketEvent::Message(decoded)),
            Err(error) => self.fan_out(request, SocketEvent::SerializerFailed(error)),
        }
    }

    pub(crate) fn did_disconnect(&self, request: &Request, code: u16, reason: Option<String>) {
        self.fan_out(request, SocketEvent::Disconnected { code, reason });
    }

    pub(crate) fn did_complete(&self, request: &Request, error: Option<&Error>) {
        self.abort_heartbeat();
        self.fan_out(
            request,
            SocketEvent::Completed {
                error: error.cloned(),
            },
        );
    }

    /// A cancellation reported after a structured close is expected and not
    /// an error; any other failure is preserved.
    pub(crate) fn filter_completion_error(&self, error: Option<Error>) -> Option<Error> {
        let closing = self.state.read(|s| s.close_intent.is_some());
        match error {
            Some(error) if closing && error.is_cancellation() => None,
            other => other,
        }
    }

    pub(crate) fn abort_heartbeat(&self) {
        if let Some(handle) = self.state.write(|s| s.heartbeat.take()) {
            handle.abort();
        }
    }

    fn record_close_intent(&self, code: u16, reason: Option<String>) {
        self.state.write(|s| s.close_intent = Some((code, reason)));
    }

    pub(crate) fn reset(&self) {
        self.abort_heartbeat();
        self.state.write(|s| s.close_intent = None);
    }
}

/// Request variant wrapping a bidirectional message task.
#[derive(Clone)]
pub struct SocketRequest {
    core: Request,
}

impl Deref for SocketRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.core
    }
}

impl SocketRequest {
    pub fn new(
        config: RequestConfig,
        factory: impl Fn() -> std::result::Result<HttpRequest, BoxedStdError> + Send + Sync + 'static,
        options: SocketOptions,
    ) -> Self {
        let core = Request::build(
            config,
            Some(Box::new(factory)),
            Variant::Socket(SocketCore::new(options)),
        );
        Self { core }
    }

    fn socket_core(&self) -> &SocketCore {
        match &self.core.inner.variant {
            Variant::Socket(core) => core,
            _ => unreachable!("socket request constructed with socket variant"),
        }
    }

    /// Register an event handler on the default callback queue.
    pub fn on_event(&self, handler: impl Fn(SocketEvent) + Send + Sync + 'static) -> &Self {
        self.on_event_on(self.core.callback_queue(), handler)
    }

    pub fn on_event_on(
        &self,
        queue: SerialQueue,
        handler: impl Fn(SocketEvent) + Send + Sync + 'static,
    ) -> &Self {
        self.socket_core().state.write(|s| {
            s.handlers.push(Handler {
                queue,
                handler: Arc::new(handler),
            });
        });
        self
    }

    /// Register a handler for JSON text messages decoded into `T`. Decode
    /// failures surface as [`SocketEvent::SerializerFailed`] to this handler
    /// only; other event kinds are ignored.
    pub fn on_json_message<T, F>(&self, handler: F) -> &Self
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(std::result::Result<T, Error>) + Send + Sync + 'static,
    {
        self.on_event(move |event| match event {
            SocketEvent::Message(Message::Text(text)) => {
                let decoded = serde_json::from_str(&text)
                    .map_err(Error::response_serialization);
                handler(decoded);
            }
            SocketEvent::Message(Message::Binary(bytes)) => {
                let decoded = serde_json::from_slice(&bytes)
                    .map_err(Error::response_serialization);
                handler(decoded);
            }
            SocketEvent::SerializerFailed(error) => handler(Err(error)),
            _ => {}
        })
    }

    /// Send a message, queueing it in order if the task does not exist yet.
    pub fn send(&self, message: Message, completion: impl FnOnce(Result<()>) + Send + 'static) {
        let this = self.clone();
        // Serialize against task creation so queued sends flush in order.
        self.core.underlying_queue().dispatch(move || {
            let task = this
                .core
                .current_task()
                .filter(|t| t.state() != TaskState::Completed);
            match task {
                Some(task) => task.send_message(message, Box::new(completion)),
                None => this
                    .socket_core()
                    .state
                    .write(|s| s.pending_sends.push((message, Box::new(completion)))),
            }
        });
    }

    /// Structured close: cancels the heartbeat, closes the task, and treats
    /// the resulting cancellation as a clean shutdown rather than an error.
    pub fn close(&self, code: u16, reason: Option<String>) -> &Self {
        let core = self.socket_core();
        core.abort_heartbeat();
        core.record_close_intent(code, reason.clone());
        self.core.cancel_for_close(code, reason);
        self
    }
}
