//! The transport collaborator boundary.
//!
//! The engine never touches sockets or framing; it asks a [`Transport`] for
//! an opaque task per attempt and receives lifecycle events back through the
//! [`TaskEvents`](crate::request::TaskEvents) handle it passed in. One task
//! is created per attempt, including retries.

use std::sync::Arc;

use bytes::Bytes;

use crate::errors::{Error, Result, TaskErrorKind};
use crate::request::TaskEvents;
use crate::socket::Message;
use crate::types::HttpRequest;
use crate::upload::Uploadable;

/// Transport-reported task state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Created but not yet started, or paused.
    Suspended,
    Running,
    /// Cancellation requested but the completion event has not fired yet.
    Cancelling,
    Completed,
}

/// Completion callback for socket sends and pings.
pub type SendCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// Completion callback for resume-data capture.
pub type ResumeDataCompletion = Box<dyn FnOnce(Option<Bytes>) + Send>;

/// One transport attempt.
///
/// Capability methods beyond the shared lifecycle have default bodies so a
/// plain data transport does not need to stub download or socket behavior;
/// the engine only invokes the capabilities matching the variant that
/// created the task.
pub trait TransportTask: Send + Sync {
    fn resume(&self);
    fn suspend(&self);
    fn cancel(&self);
    fn state(&self) -> TaskState;

    /// The representation the transport is currently executing, when it can
    /// report one (it may differ from the engine's current representation
    /// after transport-level redirects).
    fn current_request(&self) -> Option<HttpRequest> {
        None
    }

    /// Cancel while asking the transport for resume data. Transports without
    /// resumable downloads complete with `None` and cancel normally.
    fn cancel_producing_resume_data(&self, completion: ResumeDataCompletion) {
        completion(None);
        self.cancel();
    }

    /// Send one message over a bidirectional task.
    fn send_message(&self, _message: Message, completion: SendCompletion) {
        completion(Err(Error::task(
            TaskErrorKind::Other,
            "task does not support messages",
        )));
    }

    /// Send a ping and report whether the matching pong arrived.
    fn send_ping(&self, completion: SendCompletion) {
        completion(Err(Error::task(
            TaskErrorKind::Other,
            "task does not support pings",
        )));
    }

    /// Close a bidirectional task with a code and optional reason.
    fn close(&self, _code: u16, _reason: Option<String>) {
        self.cancel();
    }
}

/// Factory for transport tasks, one method per request variant.
///
/// Every factory receives the weak [`TaskEvents`] handle the created task
/// must report lifecycle events through. Factories the transport does not
/// support fail with a transport error, which the engine routes through the
/// retry coordinator exactly like any other creation failure.
pub trait Transport: Send + Sync {
    fn data_task(&self, request: &HttpRequest, events: TaskEvents)
        -> Result<Arc<dyn TransportTask>>;

    fn download_task(
        &self,
        _request: &HttpRequest,
        _events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        Err(unsupported("downloads"))
    }

    fn download_task_resuming(
        &self,
        _resume_data: Bytes,
        _events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        Err(unsupported("resumable downloads"))
    }

    fn upload_task(
        &self,
        _request: &HttpRequest,
        _uploadable: Arc<Uploadable>,
        _events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        Err(unsupported("uploads"))
    }

    fn socket_task(
        &self,
        _request: &HttpRequest,
        _events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        Err(unsupported("sockets"))
    }
}

fn unsupported(what: &str) -> Error {
    Error::task(
        TaskErrorKind::Other,
        format!("transport does not support {what}"),
    )
}
