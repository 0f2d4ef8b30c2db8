//! Test doubles for the engine: a scriptable transport, a recording event
//! monitor, and a simple delegate. Used by this crate's own tests and
//! available to downstream test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::StatusCode;

use crate::delegate::RequestDelegate;
use crate::errors::{Error, Result, TaskErrorKind};
use crate::monitor::EventMonitor;
use crate::request::{Request, TaskEvents};
use crate::socket::{Message, SocketEvent};
use crate::transport::{
    ResumeDataCompletion, SendCompletion, TaskState, Transport, TransportTask,
};
use crate::types::{HttpRequest, HttpResponse, TransportMetrics};
use crate::upload::Uploadable;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn metrics(bytes_received: u64) -> TransportMetrics {
    TransportMetrics {
        started_at: Instant::now(),
        duration: Duration::from_millis(1),
        request_bytes_sent: 0,
        response_bytes_received: bytes_received,
    }
}

/// Scripted result of one mock attempt.
pub enum MockOutcome {
    /// Deliver the response, the body chunks, metrics, and a clean
    /// completion as soon as the task is resumed.
    Success {
        response: HttpResponse,
        body: Vec<Bytes>,
    },
    /// Write `contents` to a temporary file, report it downloaded, and
    /// complete cleanly.
    DownloadSuccess {
        response: HttpResponse,
        contents: Bytes,
    },
    /// Gather metrics and complete with `error`.
    Failure { error: Error },
    /// Fail task creation itself; no task is produced.
    FailCreation { error: Error },
    /// Create the task but emit nothing; the test drives events through the
    /// [`MockTask`] handle.
    Manual,
}

impl MockOutcome {
    pub fn ok_with_body(body: &[u8]) -> Self {
        MockOutcome::Success {
            response: HttpResponse::new(StatusCode::OK)
                .with_expected_content_length(body.len() as u64),
            body: vec![Bytes::copy_from_slice(body)],
        }
    }

    pub fn timeout() -> Self {
        MockOutcome::Failure {
            error: Error::task(TaskErrorKind::Timeout, "mock deadline elapsed"),
        }
    }
}

/// Scriptable [`Transport`] producing one [`MockTask`] per attempt.
pub struct MockTransport {
    outcomes: Mutex<VecDeque<MockOutcome>>,
    tasks: Mutex<Vec<Arc<MockTask>>>,
    uploadables: Mutex<Vec<Arc<Uploadable>>>,
    resume_blob: Mutex<Option<Bytes>>,
    resume_requests: Mutex<Vec<Bytes>>,
    pongs: Mutex<VecDeque<bool>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_outcomes(Vec::new())
    }

    pub fn with_outcomes(outcomes: Vec<MockOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            tasks: Mutex::new(Vec::new()),
            uploadables: Mutex::new(Vec::new()),
            resume_blob: Mutex::new(None),
            resume_requests: Mutex::new(Vec::new()),
            pongs: Mutex::new(VecDeque::new()),
        })
    }

    pub fn enqueue(&self, outcome: MockOutcome) {
        lock(&self.outcomes).push_back(outcome);
    }

    /// Resume data handed out by `cancel_producing_resume_data`.
    pub fn set_resume_data(&self, data: Bytes) {
        *lock(&self.resume_blob) = Some(data);
    }

    /// Scripted ping outcomes, consumed one per heartbeat.
    pub fn script_pongs(&self, results: impl IntoIterator<Item = bool>) {
        lock(&self.pongs).extend(results);
    }

    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn task(&self, index: usize) -> Arc<MockTask> {
        lock(&self.tasks)[index].clone()
    }

    pub fn last_task(&self) -> Arc<MockTask> {
        lock(&self.tasks)
            .last()
            .expect("no mock task created yet")
            .clone()
    }

    /// Uploadables resolved per attempt, in order.
    pub fn uploadables(&self) -> Vec<Arc<Uploadable>> {
        lock(&self.uploadables).clone()
    }

    /// Resume blobs attempts were created from, in order.
    pub fn resume_requests(&self) -> Vec<Bytes> {
        lock(&self.resume_requests).clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        lock(&self.outcomes)
            .pop_front()
            .unwrap_or(MockOutcome::Success {
                response: HttpResponse::new(StatusCode::OK),
                body: Vec::new(),
            })
    }

    fn create_task(
        &self,
        events: TaskEvents,
        upload_total: Option<u64>,
    ) -> Result<Arc<dyn TransportTask>> {
        let outcome = self.next_outcome();
        if let MockOutcome::FailCreation { error } = outcome {
            return Err(error);
        }
        let task = Arc::new(MockTask {
            state: Mutex::new(TaskState::Suspended),
            events,
            outcome: Mutex::new(Some(outcome)),
            completed: AtomicBool::new(false),
            upload_total,
            resume_blob: lock(&self.resume_blob).clone(),
            sent_messages: Mutex::new(Vec::new()),
            pongs: Mutex::new(lock(&self.pongs).clone()),
            pings: Mutex::new(0),
            closed_with: Mutex::new(None),
        });
        lock(&self.tasks).push(task.clone());
        Ok(task)
    }
}

impl Transport for MockTransport {
    fn data_task(
        &self,
        _request: &HttpRequest,
        events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        self.create_task(events, None)
    }

    fn download_task(
        &self,
        _request: &HttpRequest,
        events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        self.create_task(events, None)
    }

    fn download_task_resuming(
        &self,
        resume_data: Bytes,
        events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        lock(&self.resume_requests).push(resume_data);
        self.create_task(events, None)
    }

    fn upload_task(
        &self,
        _request: &HttpRequest,
        uploadable: Arc<Uploadable>,
        events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        let total = match uploadable.as_ref() {
            Uploadable::Bytes(bytes) => Some(bytes.len() as u64),
            Uploadable::File { path, .. } => std::fs::metadata(path).ok().map(|m| m.len()),
            Uploadable::Stream(_) => None,
        };
        lock(&self.uploadables).push(uploadable);
        self.create_task(events, total)
    }

    fn socket_task(
        &self,
        _request: &HttpRequest,
        events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        self.create_task(events, None)
    }
}

/// One scripted transport attempt.
pub struct MockTask {
    state: Mutex<TaskState>,
    events: TaskEvents,
    outcome: Mutex<Option<MockOutcome>>,
    completed: AtomicBool,
    upload_total: Option<u64>,
    resume_blob: Option<Bytes>,
    pub sent_messages: Mutex<Vec<Message>>,
    pongs: Mutex<VecDeque<bool>>,
    pings: Mutex<u32>,
    pub closed_with: Mutex<Option<(u16, Option<String>)>>,
}

impl MockTask {
    fn drive(&self) {
        let Some(outcome) = lock(&self.outcome).take() else {
            return;
        };
        match outcome {
            MockOutcome::Success { response, body } => {
                if let Some(total) = self.upload_total {
                    self.events.sent_body_data(total, Some(total));
                }
                self.events.received_response(response);
                let mut received = 0u64;
                for chunk in body {
                    received += chunk.len() as u64;
                    self.events.received_data(chunk);
                }
                self.events.gathered_metrics(metrics(received));
                self.complete_with(None);
            }
            MockOutcome::DownloadSuccess { response, contents } => {
                self.events.received_response(response);
                let len = contents.len() as u64;
                self.events.wrote_download_data(len, Some(len));
                let temporary =
                    std::env::temp_dir().join(format!("reqflow-mock-{}", uuid::Uuid::new_v4()));
                std::fs::write(&temporary, &contents).expect("write mock download");
                self.events.finished_downloading_to(temporary);
                self.events.gathered_metrics(metrics(len));
                self.complete_with(None);
            }
            MockOutcome::Failure { error } => {
                self.events.gathered_metrics(metrics(0));
                self.complete_with(Some(error));
            }
            MockOutcome::FailCreation { .. } | MockOutcome::Manual => {}
        }
    }

    /// Emit a completion exactly once, marking the task completed.
    pub fn complete_with(&self, error: Option<Error>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.state) = TaskState::Completed;
        self.events.completed(error);
    }

    /// Emit a completion without the once-guard; lets tests exercise the
    /// engine's own idempotence.
    pub fn emit_completed(&self, error: Option<Error>) {
        *lock(&self.state) = TaskState::Completed;
        self.events.completed(error);
    }

    /// Report a pre-completion failure.
    pub fn fail_early(&self, error: Error) {
        self.events.failed_early(error);
    }

    /// Pings observed so far.
    pub fn ping_count(&self) -> u32 {
        *lock(&self.pings)
    }

    /// Manual driving helpers for socket tests.
    pub fn connect(&self, protocol: Option<String>) {
        self.events.socket_connected(protocol);
    }

    pub fn push_message(&self, message: Message) {
        self.events.socket_received_message(message);
    }

    pub fn disconnect(&self, code: u16, reason: Option<String>) {
        self.events.socket_disconnected(code, reason);
    }

    /// Manual driving helpers for data tests.
    pub fn push_response(&self, response: HttpResponse) {
        self.events.received_response(response);
    }

    pub fn push_chunk(&self, chunk: Bytes) {
        self.events.received_data(chunk);
    }

    pub fn push_metrics(&self) {
        self.events.gathered_metrics(metrics(0));
    }
}

impl TransportTask for MockTask {
    fn resume(&self) {
        let should_drive = {
            let mut state = lock(&self.state);
            match *state {
                TaskState::Suspended => {
                    *state = TaskState::Running;
                    true
                }
                _ => false,
            }
        };
        if should_drive {
            self.drive();
        }
    }

    fn suspend(&self) {
        let mut state = lock(&self.state);
        if *state == TaskState::Running {
            *state = TaskState::Suspended;
        }
    }

    fn cancel(&self) {
        if *lock(&self.state) == TaskState::Completed {
            return;
        }
        *lock(&self.state) = TaskState::Cancelling;
        self.events.gathered_metrics(metrics(0));
        self.complete_with(Some(Error::task(TaskErrorKind::Cancelled, "mock cancelled")));
    }

    fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    fn cancel_producing_resume_data(&self, completion: ResumeDataCompletion) {
        completion(self.resume_blob.clone());
        self.cancel();
    }

    fn send_message(&self, message: Message, completion: SendCompletion) {
        lock(&self.sent_messages).push(message);
        completion(Ok(()));
    }

    fn send_ping(&self, completion: SendCompletion) {
        *lock(&self.pings) += 1;
        let pong = lock(&self.pongs).pop_front().unwrap_or(true);
        if pong {
            completion(Ok(()));
        } else {
            completion(Err(Error::task(TaskErrorKind::Timeout, "mock pong lost")));
        }
    }

    fn close(&self, code: u16, reason: Option<String>) {
        *lock(&self.closed_with) = Some((code, reason.clone()));
        self.events.socket_disconnected(code, reason);
        self.events.gathered_metrics(metrics(0));
        self.complete_with(Some(Error::task(
            TaskErrorKind::Cancelled,
            "mock socket closed",
        )));
    }
}

/// Event monitor that records the name of every event it sees.
#[derive(Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.events).iter().any(|e| e == name)
    }

    fn record(&self, name: &str) {
        lock(&self.events).push(name.to_string());
    }
}

impl EventMonitor for RecordingMonitor {
    fn request_did_create_initial_request(&self, _: &Request, _: &HttpRequest) {
        self.record("did_create_initial_request");
    }

    fn request_did_adapt_request(&self, _: &Request, _: &HttpRequest) {
        self.record("did_adapt_request");
    }

    fn request_did_fail_to_create_request(&self, _: &Request, _: &Error) {
        self.record("did_fail_to_create_request");
    }

    fn request_did_create_task(&self, _: &Request) {
        self.record("did_create_task");
    }

    fn request_did_resume(&self, _: &Request) {
        self.record("did_resume");
    }

    fn request_did_suspend(&self, _: &Request) {
        self.record("did_suspend");
    }

    fn request_did_cancel(&self, _: &Request) {
        self.record("did_cancel");
    }

    fn request_did_finish(&self, _: &Request) {
        self.record("did_finish");
    }

    fn request_did_gather_metrics(&self, _: &Request, _: &TransportMetrics) {
        self.record("did_gather_metrics");
    }

    fn request_did_complete_task(&self, _: &Request, _: Option<&Error>) {
        self.record("did_complete_task");
    }

    fn request_did_validate(&self, _: &Request, result: &std::result::Result<(), Error>) {
        self.record(if result.is_ok() {
            "did_validate_ok"
        } else {
            "did_validate_err"
        });
    }

    fn request_is_retrying(&self, _: &Request) {
        self.record("is_retrying");
    }

    fn stream_consumer_failed(&self, _: &Request, _: &Error) {
        self.record("stream_consumer_failed");
    }

    fn socket_event(&self, _: &Request, event: &SocketEvent) {
        let name = match event {
            SocketEvent::Connected { .. } => "socket_connected",
            SocketEvent::Message(_) => "socket_message",
            SocketEvent::SerializerFailed(_) => "socket_serializer_failed",
            SocketEvent::Disconnected { .. } => "socket_disconnected",
            SocketEvent::Completed { .. } => "socket_completed",
        };
        self.record(name);
    }
}

/// Delegate with configurable auto-start and a cleanup counter.
pub struct TestDelegate {
    start_immediately: bool,
    cleanups: Mutex<u32>,
}

impl TestDelegate {
    pub fn new(start_immediately: bool) -> Arc<Self> {
        Arc::new(Self {
            start_immediately,
            cleanups: Mutex::new(0),
        })
    }

    pub fn cleanup_count(&self) -> u32 {
        *lock(&self.cleanups)
    }
}

impl RequestDelegate for TestDelegate {
    fn start_immediately(&self) -> bool {
        self.start_immediately
    }

    fn cleanup_after(&self, _request: &Request) {
        *lock(&self.cleanups) += 1;
    }
}
