//! Lifecycle state machine tests: legal edges, absorbing cancellation, and
//! task forwarding.

use std::time::Duration;

use reqflow::testing::{MockOutcome, MockTransport, RecordingMonitor, TestDelegate};
use reqflow::{DataRequest, Error, HttpRequest, RequestConfig, State, TaskState, TransportTask};
use url::Url;

fn factory() -> impl Fn() -> Result<HttpRequest, Box<dyn std::error::Error + Send + Sync>>
       + Send
       + Sync
       + 'static {
    || Ok(HttpRequest::get(Url::parse("https://example.com/resource").expect("static url")))
}

async fn finished(request: &reqflow::Request) {
    tokio::time::timeout(Duration::from_secs(5), request.wait_until_finished())
        .await
        .expect("request should finish");
}

#[tokio::test]
async fn resume_suspend_cycle_updates_request_and_task() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = DataRequest::new(RequestConfig::new(transport.clone()), factory());
    assert_eq!(request.state(), State::Initialized);

    request.resume();
    assert_eq!(request.state(), State::Resumed);
    // Let the attempt pipeline create the task.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.task_count(), 1);
    assert_eq!(transport.task(0).state(), TaskState::Running);

    request.suspend();
    assert_eq!(request.state(), State::Suspended);
    assert_eq!(transport.task(0).state(), TaskState::Suspended);

    request.resume();
    assert_eq!(request.state(), State::Resumed);
    assert_eq!(transport.task(0).state(), TaskState::Running);
}

#[tokio::test]
async fn cancelled_is_absorbing() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = DataRequest::new(RequestConfig::new(transport.clone()), factory());
    request.resume();
    tokio::time::sleep(Duration::from_millis(20)).await;

    request.cancel();
    assert_eq!(request.state(), State::Cancelled);

    request.resume();
    request.suspend();
    assert_eq!(request.state(), State::Cancelled);

    finished(&request).await;
    assert_eq!(request.state(), State::Cancelled);
    assert!(matches!(request.error(), Some(Error::ExplicitlyCancelled)));
}

#[tokio::test]
async fn cancel_before_any_task_finishes_with_sentinel() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = DataRequest::new(RequestConfig::new(transport.clone()), factory());

    // The attempt pipeline has not run yet on this single-threaded runtime,
    // so no task exists when cancel takes the lock.
    request.cancel();
    assert_eq!(request.state(), State::Cancelled);
    assert!(matches!(request.error(), Some(Error::ExplicitlyCancelled)));

    finished(&request).await;
    assert_eq!(transport.task_count(), 0);
    assert_eq!(request.task_count(), 0);
}

#[tokio::test]
async fn duplicate_resume_is_a_no_op() {
    let monitor = RecordingMonitor::new();
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = DataRequest::new(
        RequestConfig::new(transport.clone()).with_monitor(monitor.clone()),
        factory(),
    );

    request.resume();
    request.resume();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let resumes = monitor
        .events()
        .iter()
        .filter(|e| *e == "did_resume")
        .count();
    assert_eq!(resumes, 1);
}

#[tokio::test]
async fn monitor_observes_pipeline_order() {
    let monitor = RecordingMonitor::new();
    let transport = MockTransport::with_outcomes(vec![MockOutcome::ok_with_body(b"ok")]);
    let request = DataRequest::new(
        RequestConfig::new(transport.clone()).with_monitor(monitor.clone()),
        factory(),
    );
    request.resume();
    finished(&request).await;

    let events = monitor.events();
    let index_of = |name: &str| {
        events
            .iter()
            .position(|e| e == name)
            .unwrap_or_else(|| panic!("missing event {name}: {events:?}"))
    };
    assert!(index_of("did_create_initial_request") < index_of("did_create_task"));
    assert!(index_of("did_create_task") < index_of("did_gather_metrics"));
    assert!(index_of("did_gather_metrics") < index_of("did_complete_task"));
    assert!(index_of("did_complete_task") < index_of("did_finish"));
}

#[tokio::test]
async fn metrics_are_index_aligned_with_tasks() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::ok_with_body(b"payload")]);
    let request = DataRequest::new(RequestConfig::new(transport.clone()), factory());
    request.resume();
    finished(&request).await;

    assert_eq!(request.task_count(), 1);
    assert_eq!(request.metrics().len(), 1);
    assert_eq!(request.metrics()[0].response_bytes_received, 7);
}

#[tokio::test]
async fn start_immediately_resumes_on_first_serializer() {
    let delegate = TestDelegate::new(true);
    let transport = MockTransport::with_outcomes(vec![MockOutcome::ok_with_body(b"auto")]);
    let request = DataRequest::new(
        RequestConfig::new(transport.clone()).with_delegate(&delegate),
        factory(),
    );

    let (tx, rx) = tokio::sync::oneshot::channel();
    request.response_bytes(move |response| {
        let _ = tx.send(response.result.map(|b| b.to_vec()));
    });

    // No explicit resume; attaching the handler starts the request.
    let body = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("handler should run")
        .expect("sender kept alive")
        .expect("request should succeed");
    assert_eq!(body, b"auto");
    assert_eq!(delegate.cleanup_count(), 1);
}

#[tokio::test]
async fn debug_command_renders_current_request() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = DataRequest::new(RequestConfig::new(transport.clone()), factory());
    request.authenticate("user", "secret");
    request.resume();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let rendered = request.debug_command();
    assert!(rendered.contains("curl -v"));
    assert!(rendered.contains("-u 'user':'secret'"));
    assert!(rendered.contains("'https://example.com/resource'"));
}

#[tokio::test]
#[should_panic(expected = "credential may only be set once")]
async fn double_authenticate_is_a_contract_violation() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = DataRequest::new(RequestConfig::new(transport), factory());
    request.authenticate("a", "b");
    request.authenticate("c", "d");
}

#[tokio::test]
async fn requests_are_equal_by_identity() {
    let transport = MockTransport::new();
    let first = DataRequest::new(RequestConfig::new(transport.clone()), factory());
    let second = DataRequest::new(RequestConfig::new(transport), factory());

    let first_clone = (*first).clone();
    assert_eq!(*first, first_clone);
    assert_ne!(*first, *second);

    let mut set = std::collections::HashSet::new();
    set.insert((*first).clone());
    set.insert(first_clone);
    set.insert((*second).clone());
    assert_eq!(set.len(), 2);
}
