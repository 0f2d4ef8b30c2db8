//! Socket variant tests: pending-send flushing, message decode fan-out,
//! heartbeat rescheduling, and structured close semantics.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use reqflow::testing::{MockOutcome, MockTransport, RecordingMonitor, TestDelegate};
use reqflow::{
    close_code, HttpRequest, Message, MessageSerializer, RequestConfig, RetryPolicy, SocketEvent,
    SocketOptions, SocketRequest, State,
};
use serde::Deserialize;
use url::Url;

fn factory() -> impl Fn() -> Result<HttpRequest, Box<dyn std::error::Error + Send + Sync>>
       + Send
       + Sync
       + 'static {
    || Ok(HttpRequest::get(Url::parse("wss://example.com/live").expect("static url")))
}

async fn finished(request: &reqflow::Request) {
    tokio::time::timeout(Duration::from_secs(5), request.wait_until_finished())
        .await
        .expect("request should finish");
}

#[tokio::test]
async fn sends_before_the_task_exists_flush_in_order() {
    let delegate = TestDelegate::new(false);
    // The first attempt fails to create a task; sends issued during the
    // retry delay are queued and must flush once the second attempt's task
    // exists.
    let transport = MockTransport::with_outcomes(vec![
        MockOutcome::FailCreation {
            error: reqflow::Error::task(reqflow::TaskErrorKind::Connect, "socket refused"),
        },
        MockOutcome::Manual,
    ]);
    let policy = Arc::new(RetryPolicy {
        retry_limit: 1,
        base_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(50),
        ..Default::default()
    });
    let request = SocketRequest::new(
        RequestConfig::new(transport.clone())
            .with_interceptor(policy)
            .with_delegate(&delegate),
        factory(),
        SocketOptions::default(),
    );
    request.resume();
    tokio::time::sleep(Duration::from_millis(10)).await;

    request.send(Message::Text("first".into()), |_| {});
    request.send(Message::Text("second".into()), |_| {});
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(transport.task_count(), 1);
    let sent = transport.task(0).sent_messages.lock().expect("lock").clone();
    assert_eq!(
        sent,
        vec![
            Message::Text("first".into()),
            Message::Text("second".into())
        ]
    );
}

#[tokio::test]
async fn events_fan_out_through_the_message_serializer() {
    struct TextOnly;
    impl MessageSerializer for TextOnly {
        fn decode(&self, message: Message) -> reqflow::Result<Message> {
            match message {
                Message::Text(_) => Ok(message),
                Message::Binary(_) => Err(reqflow::Error::response_serialization(
                    "binary frames are not accepted",
                )),
            }
        }
    }

    let monitor = RecordingMonitor::new();
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = SocketRequest::new(
        RequestConfig::new(transport.clone()).with_monitor(monitor.clone()),
        factory(),
        SocketOptions {
            message_serializer: Arc::new(TextOnly),
            ..Default::default()
        },
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recording = seen.clone();
    request.on_event(move |event| {
        let label = match event {
            SocketEvent::Connected { .. } => "connected".to_string(),
            SocketEvent::Message(Message::Text(text)) => format!("text:{text}"),
            SocketEvent::Message(Message::Binary(_)) => "binary".to_string(),
            SocketEvent::SerializerFailed(_) => "serializer-failed".to_string(),
            SocketEvent::Disconnected { code, .. } => format!("disconnected:{code}"),
            SocketEvent::Completed { error } => format!("completed:{}", error.is_some()),
        };
        recording.lock().expect("lock").push(label);
    });
    request.resume();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let task = transport.task(0);
    task.connect(Some("chat-v2".into()));
    task.push_message(Message::Text("hello".into()));
    task.push_message(Message::Binary(Bytes::from_static(b"\x01\x02")));
    task.push_metrics();
    task.complete_with(None);
    finished(&request).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        *seen.lock().expect("lock"),
        vec![
            "connected".to_string(),
            "text:hello".to_string(),
            "serializer-failed".to_string(),
            "completed:false".to_string(),
        ]
    );
    assert!(monitor.contains("socket_serializer_failed"));
}

#[tokio::test]
async fn json_messages_decode_into_typed_values() {
    #[derive(Deserialize, Debug, PartialEq)]
    struct Tick {
        seq: u32,
    }

    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = SocketRequest::new(
        RequestConfig::new(transport.clone()),
        factory(),
        SocketOptions::default(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recording = seen.clone();
    request.on_json_message::<Tick, _>(move |decoded| {
        recording
            .lock()
            .expect("lock")
            .push(decoded.map_err(|e| e.to_string()));
    });
    request.resume();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let task = transport.task(0);
    task.push_message(Message::Text("{\"seq\":1}".into()));
    task.push_message(Message::Text("{\"seq\":".into()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], Ok(Tick { seq: 1 }));
    assert!(seen[1].is_err());
}

#[tokio::test]
async fn heartbeat_reschedules_on_pong_and_stops_on_failure() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    // First ping answered, second lost; the heartbeat must not fire again.
    transport.script_pongs([true, false]);
    let request = SocketRequest::new(
        RequestConfig::new(transport.clone()),
        factory(),
        SocketOptions {
            ping_interval: Some(Duration::from_millis(20)),
            ..Default::default()
        },
    );
    request.resume();
    tokio::time::sleep(Duration::from_millis(10)).await;

    transport.task(0).connect(None);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(transport.task(0).ping_count(), 2);
}

#[tokio::test]
async fn close_is_a_clean_shutdown_not_an_error() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = SocketRequest::new(
        RequestConfig::new(transport.clone()),
        factory(),
        SocketOptions::default(),
    );

    let completions = Arc::new(Mutex::new(Vec::new()));
    let recording = completions.clone();
    request.on_event(move |event| {
        if let SocketEvent::Completed { error } = event {
            recording.lock().expect("lock").push(error.is_some());
        }
    });
    request.resume();
    tokio::time::sleep(Duration::from_millis(20)).await;
    transport.task(0).connect(None);

    request.close(close_code::NORMAL, Some("done listening".into()));
    finished(&request).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(request.state(), State::Cancelled);
    // The task failed "due to cancellation", but a structured close clears
    // that before it reaches the terminal error.
    assert!(request.error().is_none());
    assert_eq!(
        *transport.task(0).closed_with.lock().expect("lock"),
        Some((close_code::NORMAL, Some("done listening".into())))
    );
    assert_eq!(*completions.lock().expect("lock"), vec![false]);
}

#[tokio::test]
async fn plain_cancel_still_records_the_sentinel() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = SocketRequest::new(
        RequestConfig::new(transport.clone()),
        factory(),
        SocketOptions::default(),
    );
    request.resume();
    tokio::time::sleep(Duration::from_millis(20)).await;

    request.cancel();
    finished(&request).await;

    assert!(matches!(
        request.error(),
        Some(reqflow::Error::ExplicitlyCancelled)
    ));
}
