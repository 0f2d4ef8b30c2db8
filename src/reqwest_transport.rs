//! Reference [`Transport`] implementation over [`reqwest`].
//!
//! Covers data, download, and upload tasks; socket tasks are left to a
//! dedicated collaborator since `reqwest` does not speak WebSocket. Each
//! task drives one HTTP exchange on a spawned tokio task and reports
//! lifecycle events through [`TaskEvents`]. Redirect and cookie policy
//! belong to the configured `reqwest::Client`, not to this adapter.
//!
//! Suspension is only honored before the first resume: `reqwest` cannot
//! pause an in-flight exchange, so suspending a running task is a no-op.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use crate::errors::{Error, Result, TaskErrorKind};
use crate::request::TaskEvents;
use crate::transport::{TaskState, Transport, TransportTask};
use crate::types::{HttpRequest, HttpResponse, TransportMetrics};
use crate::upload::Uploadable;

/// Transport adapter over a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build with a default client configuration.
    pub fn with_default_client() -> Result<Self> {
        let client = reqwest::Client::builder().build().map_err(|err| {
            Error::task(
                TaskErrorKind::Connect,
                format!("failed to build http client: {err}"),
            )
        })?;
        Ok(Self::new(client))
    }

    fn make_task(
        &self,
        request: &HttpRequest,
        events: TaskEvents,
        kind: TaskKind,
    ) -> Result<Arc<dyn TransportTask>> {
        Ok(Arc::new(ReqwestTask {
            state: Arc::new(Mutex::new(TaskState::Suspended)),
            cancel: Arc::new(Notify::new()),
            driver: Mutex::new(Some(Driver {
                client: self.client.clone(),
                request: request.clone(),
                events,
                kind,
            })),
        }))
    }
}

impl Transport for ReqwestTransport {
    fn data_task(
        &self,
        request: &HttpRequest,
        events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        self.make_task(request, events, TaskKind::Data)
    }

    fn download_task(
        &self,
        request: &HttpRequest,
        events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        self.make_task(request, events, TaskKind::Download)
    }

    fn upload_task(
        &self,
        request: &HttpRequest,
        uploadable: Arc<Uploadable>,
        events: TaskEvents,
    ) -> Result<Arc<dyn TransportTask>> {
        self.make_task(request, events, TaskKind::Upload(uploadable))
    }
}

enum TaskKind {
    Data,
    Download,
    Upload(Arc<Uploadable>),
}

struct Driver {
    client: reqwest::Client,
    request: HttpRequest,
    events: TaskEvents,
    kind: TaskKind,
}

struct ReqwestTask {
    state: Arc<Mutex<TaskState>>,
    cancel: Arc<Notify>,
    driver: Mutex<Option<Driver>>,
}

impl TransportTask for ReqwestTask {
    fn resume(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != TaskState::Suspended {
                return;
            }
            *state = TaskState::Running;
        }
        let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let (received, error) = run(&driver, &cancel).await;
            *state.lock().unwrap_or_else(|e| e.into_inner()) = TaskState::Completed;
            driver.events.gathered_metrics(TransportMetrics {
                started_at: started,
                duration: started.elapsed(),
                request_bytes_sent: body_len(&driver),
                response_bytes_received: received,
            });
            driver.events.completed(error);
        });
    }

    fn suspend(&self) {
        // In-flight exchanges cannot be paused; only a never-resumed task
        // stays suspended.
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == TaskState::Completed {
            return;
        }
        if *state == TaskState::Running {
            *state = TaskState::Cancelling;
        }
        self.cancel.notify_waiters();
        self.cancel.notify_one();
    }

    fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_request(&self) -> Option<HttpRequest> {
        self.driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|d| d.request.clone())
    }
}

fn body_len(driver: &Driver) -> u64 {
    match &driver.kind {
        TaskKind::Upload(uploadable) => match uploadable.as_ref() {
            Uploadable::Bytes(bytes) => bytes.len() as u64,
            _ => 0,
        },
        _ => driver
            .request
            .body
            .as_ref()
            .map(|b| b.len() as u64)
            .unwrap_or(0),
    }
}

fn cancelled_error() -> Error {
    Error::task(TaskErrorKind::Cancelled, "task cancelled")
}

fn transport_error(err: reqwest::Error) -> Error {
    let kind = if err.is_timeout() {
        TaskErrorKind::Timeout
    } else if err.is_connect() {
        TaskErrorKind::Connect
    } else {
        TaskErrorKind::Other
    };
    Error::task(kind, err.to_string())
}

fn snapshot(response: &reqwest::Response) -> HttpResponse {
    HttpResponse {
        status: response.status(),
        headers: response.headers().clone(),
        url: Some(response.url().clone()),
        expected_content_length: response.content_length(),
    }
}

async fn run(driver: &Driver, cancel: &Notify) -> (u64, Option<Error>) {
    let request = match build_request(driver).await {
        Ok(request) => request,
        Err(error) => return (0, Some(error)),
    };

    let response = tokio::select! {
        _ = cancel.notified() => return (0, Some(cancelled_error())),
        result = driver.client.execute(request) => match result {
            Ok(response) => response,
            Err(err) => return (0, Some(transport_error(err))),
        },
    };

    if let TaskKind::Upload(uploadable) = &driver.kind {
        if let Uploadable::Bytes(bytes) = uploadable.as_ref() {
            let total = bytes.len() as u64;
            driver.events.sent_body_data(total, Some(total));
        }
    }
    driver.events.received_response(snapshot(&response));

    match &driver.kind {
        TaskKind::Download => stream_to_file(driver, response, cancel).await,
        _ => stream_to_events(driver, response, cancel).await,
    }
}

async fn build_request(driver: &Driver) -> Result<reqwest::Request> {
    let builder = driver
        .client
        .request(driver.request.method.clone(), driver.request.url.clone())
        .headers(driver.request.headers.clone());

    let builder = match &driver.kind {
        TaskKind::Upload(uploadable) => match uploadable.as_ref() {
            Uploadable::Bytes(bytes) => builder.body(bytes.clone()),
            Uploadable::File { path, .. } => {
                // Loaded into memory; a streaming file body would need the
                // file length for retries anyway.
                let contents = tokio::fs::read(path).await.map_err(|err| {
                    Error::task(
                        TaskErrorKind::Other,
                        format!("failed to read upload file: {err}"),
                    )
                })?;
                builder.body(contents)
            }
            Uploadable::Stream(stream) => builder.body(reqwest::Body::wrap_stream(stream.take())),
        },
        _ => match &driver.request.body {
            Some(body) => builder.body(body.clone()),
            None => builder,
        },
    };

    builder.build().map_err(transport_error)
}

async fn stream_to_events(
    driver: &Driver,
    response: reqwest::Response,
    cancel: &Notify,
) -> (u64, Option<Error>) {
    let mut stream = response.bytes_stream();
    let mut received = 0u64;
    loop {
        let chunk = tokio::select! {
            _ = cancel.notified() => return (received, Some(cancelled_error())),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                received += bytes.len() as u64;
                driver.events.received_data(bytes);
                if driver.events.is_cancelled() {
                    return (received, Some(cancelled_error()));
                }
            }
            Some(Err(err)) => return (received, Some(transport_error(err))),
            None => return (received, None),
        }
    }
}

async fn stream_to_file(
    driver: &Driver,
    response: reqwest::Response,
    cancel: &Notify,
) -> (u64, Option<Error>) {
    let expected = response.content_length();
    let temporary: PathBuf =
        std::env::temp_dir().join(format!("reqflow-download-{}", uuid::Uuid::new_v4()));
    let mut file = match tokio::fs::File::create(&temporary).await {
        Ok(file) => file,
        Err(err) => {
            return (
                0,
                Some(Error::task(
                    TaskErrorKind::Other,
                    format!("failed to create temporary file: {err}"),
                )),
            );
        }
    };

    let mut stream = response.bytes_stream();
    let mut received = 0u64;
    loop {
        let chunk = tokio::select! {
            _ = cancel.notified() => return (received, Some(cancelled_error())),
            chunk = stream.next() => chunk,
        };
        let bytes: Bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => return (received, Some(transport_error(err))),
            None => break,
        };
        if let Err(err) = file.write_all(&bytes).await {
            return (
                received,
                Some(Error::task(
                    TaskErrorKind::Other,
                    format!("failed to write download: {err}"),
                )),
            );
        }
        received += bytes.len() as u64;
        driver.events.wrote_download_data(received, expected);
        if driver.events.is_cancelled() {
            return (received, Some(cancelled_error()));
        }
    }

    if let Err(err) = file.flush().await {
        return (
            received,
            Some(Error::task(
                TaskErrorKind::Other,
                format!("failed to flush download: {err}"),
            )),
        );
    }
    driver.events.finished_downloading_to(temporary);
    (received, None)
}
