//! Upload variant tests: per-attempt source resolution, resolution failure
//! routing, cleanup removal, and single-use streams.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use reqflow::testing::{MockOutcome, MockTransport, TestDelegate};
use reqflow::{
    Error, HttpRequest, RequestConfig, RetryPolicy, UploadRequest, UploadStream, Uploadable,
};
use url::Url;

fn factory() -> impl Fn() -> Result<HttpRequest, Box<dyn std::error::Error + Send + Sync>>
       + Send
       + Sync
       + 'static {
    || {
        Ok(HttpRequest::new(
            http::Method::PUT,
            Url::parse("https://example.com/blob").expect("static url"),
        ))
    }
}

fn fast_policy(retry_limit: u32) -> Arc<RetryPolicy> {
    Arc::new(RetryPolicy {
        retry_limit,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        retry_post: true,
        ..Default::default()
    })
}

async fn finished(request: &reqflow::Request) {
    tokio::time::timeout(Duration::from_secs(5), request.wait_until_finished())
        .await
        .expect("request should finish");
}

#[tokio::test]
async fn bytes_uploadable_reaches_the_transport_and_reports_progress() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::ok_with_body(b"stored")]);
    let request = UploadRequest::new(
        RequestConfig::new(transport.clone()),
        factory(),
        || Ok(Uploadable::Bytes(Bytes::from_static(b"payload-bytes"))),
    );
    request.resume();
    finished(&request).await;

    assert!(request.error().is_none());
    assert_eq!(request.data().as_deref(), Some(b"stored".as_slice()));
    let uploadables = transport.uploadables();
    assert_eq!(uploadables.len(), 1);
    assert!(matches!(
        uploadables[0].as_ref(),
        Uploadable::Bytes(bytes) if bytes == "payload-bytes"
    ));
    let progress = request.upload_progress_value();
    assert_eq!(progress.completed, 13);
    assert_eq!(progress.total, Some(13));
}

#[tokio::test]
async fn uploadable_is_re_resolved_on_every_retry() {
    let delegate = TestDelegate::new(false);
    let transport = MockTransport::with_outcomes(vec![
        MockOutcome::timeout(),
        MockOutcome::ok_with_body(b"ok"),
    ]);
    let resolutions = Arc::new(Mutex::new(0u32));
    let counting = resolutions.clone();
    let request = UploadRequest::new(
        RequestConfig::new(transport.clone())
            .with_interceptor(fast_policy(1))
            .with_delegate(&delegate),
        factory(),
        move || {
            *counting.lock().expect("lock") += 1;
            Ok(Uploadable::Bytes(Bytes::from_static(b"fresh")))
        },
    );
    request.resume();
    finished(&request).await;

    assert_eq!(request.retry_count(), 1);
    assert!(request.error().is_none());
    // One resolution per attempt; single-use sources depend on this.
    assert_eq!(*resolutions.lock().expect("lock"), 2);
    assert_eq!(transport.uploadables().len(), 2);
}

#[tokio::test]
async fn resolution_failure_routes_through_the_retry_coordinator() {
    let delegate = TestDelegate::new(false);
    let transport = MockTransport::with_outcomes(vec![MockOutcome::ok_with_body(b"late ok")]);
    let calls = Arc::new(Mutex::new(0u32));
    let counting = calls.clone();
    let request = UploadRequest::new(
        RequestConfig::new(transport.clone())
            .with_interceptor(fast_policy(1))
            .with_delegate(&delegate),
        factory(),
        move || {
            let mut calls = counting.lock().expect("lock");
            *calls += 1;
            if *calls == 1 {
                Err("source not ready".into())
            } else {
                Ok(Uploadable::Bytes(Bytes::from_static(b"ready")))
            }
        },
    );
    request.resume();
    finished(&request).await;

    assert_eq!(*calls.lock().expect("lock"), 2);
    assert_eq!(request.retry_count(), 1);
    assert!(request.error().is_none());
    // The failed resolution never created a task.
    assert_eq!(transport.task_count(), 1);
}

#[tokio::test]
async fn unrecovered_resolution_failure_is_the_terminal_error() {
    let delegate = TestDelegate::new(false);
    let transport = MockTransport::new();
    let request = UploadRequest::new(
        RequestConfig::new(transport.clone()).with_delegate(&delegate),
        factory(),
        || Err("missing source".into()),
    );
    request.resume();
    finished(&request).await;

    assert!(matches!(
        request.error(),
        Some(Error::UploadableResolution { .. })
    ));
    assert_eq!(transport.task_count(), 0);
}

#[tokio::test]
async fn file_source_flagged_for_removal_is_deleted_on_cleanup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("outgoing.bin");
    std::fs::write(&source, b"upload me").expect("seed source file");

    let transport = MockTransport::with_outcomes(vec![MockOutcome::ok_with_body(b"ok")]);
    let path = source.clone();
    let request = UploadRequest::new(
        RequestConfig::new(transport),
        factory(),
        move || {
            Ok(Uploadable::File {
                path: path.clone(),
                remove_on_completion: true,
            })
        },
    );
    request.resume();
    finished(&request).await;

    assert!(request.error().is_none());
    assert!(!source.exists(), "source file should be removed by cleanup");
}

#[tokio::test]
async fn file_source_without_the_flag_survives_cleanup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("keep.bin");
    std::fs::write(&source, b"keep me").expect("seed source file");

    let transport = MockTransport::with_outcomes(vec![MockOutcome::ok_with_body(b"ok")]);
    let path = source.clone();
    let request = UploadRequest::new(
        RequestConfig::new(transport),
        factory(),
        move || {
            Ok(Uploadable::File {
                path: path.clone(),
                remove_on_completion: false,
            })
        },
    );
    request.resume();
    finished(&request).await;

    assert!(source.exists());
}

#[tokio::test]
#[should_panic(expected = "single-use")]
async fn taking_an_upload_stream_twice_is_a_contract_violation() {
    let stream = UploadStream::new(futures_util::stream::iter(vec![Ok(Bytes::from_static(
        b"chunk",
    ))]));
    let _first = stream.take();
    let _second = stream.take();
}
