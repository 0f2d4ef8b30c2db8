//! Streaming variant tests: fan-out, completion ordering under in-flight
//! consumers, error promotion, and the cancellation token.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use reqflow::testing::{MockOutcome, MockTransport, RecordingMonitor};
use reqflow::{
    Error, HttpRequest, HttpResponse, RequestConfig, SerialQueue, State, StreamEvent,
    StreamRequest,
};
use url::Url;

fn factory() -> impl Fn() -> Result<HttpRequest, Box<dyn std::error::Error + Send + Sync>>
       + Send
       + Sync
       + 'static {
    || Ok(HttpRequest::get(Url::parse("https://example.com/events").expect("static url")))
}

async fn finished(request: &reqflow::Request) {
    tokio::time::timeout(Duration::from_secs(5), request.wait_until_finished())
        .await
        .expect("request should finish");
}

#[tokio::test]
async fn chunks_fan_out_to_every_consumer() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Success {
        response: HttpResponse::new(http::StatusCode::OK),
        body: vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")],
    }]);
    let request = StreamRequest::new(RequestConfig::new(transport), factory());

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    for sink in [first.clone(), second.clone()] {
        request.stream(move |payload| {
            match payload.event {
                StreamEvent::Chunk(bytes) => sink.lock().expect("lock").push(bytes.to_vec()),
                StreamEvent::Complete(completion) => {
                    assert!(completion.error.is_none());
                    sink.lock().expect("lock").push(b"<done>".to_vec());
                }
            }
            Ok(())
        });
    }
    request.resume();
    finished(&request).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let expected = vec![b"one".to_vec(), b"two".to_vec(), b"<done>".to_vec()];
    assert_eq!(*first.lock().expect("lock"), expected);
    assert_eq!(*second.lock().expect("lock"), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completion_waits_for_an_in_flight_consumer() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Success {
        response: HttpResponse::new(http::StatusCode::OK),
        body: vec![Bytes::from_static(b"slow-chunk")],
    }]);
    let request = StreamRequest::new(RequestConfig::new(transport), factory());

    let order = Arc::new(Mutex::new(Vec::new()));
    let recording = order.clone();
    let queue = SerialQueue::new("test.slow-consumer");
    request.stream_on(queue, move |payload| {
        match payload.event {
            StreamEvent::Chunk(_) => {
                // Keep this consumer mid-invocation while the request
                // finishes on the underlying queue.
                std::thread::sleep(Duration::from_millis(100));
                recording.lock().expect("lock").push("chunk");
            }
            StreamEvent::Complete(_) => recording.lock().expect("lock").push("complete"),
        }
        Ok(())
    });
    request.resume();
    finished(&request).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The completion event must never overtake the in-flight chunk.
    assert_eq!(*order.lock().expect("lock"), vec!["chunk", "complete"]);
}

#[tokio::test]
async fn consumer_error_is_non_fatal_without_opt_in() {
    let monitor = RecordingMonitor::new();
    let transport = MockTransport::with_outcomes(vec![MockOutcome::ok_with_body(b"x")]);
    let request = StreamRequest::new(
        RequestConfig::new(transport).with_monitor(monitor.clone()),
        factory(),
    );
    request.stream(|payload| match payload.event {
        StreamEvent::Chunk(_) => Err("consumer rejected chunk".into()),
        StreamEvent::Complete(_) => Ok(()),
    });
    request.resume();
    finished(&request).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(monitor.contains("stream_consumer_failed"));
    assert!(request.error().is_none());
    assert_ne!(request.state(), State::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_error_promotes_to_cancellation_when_opted_in() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = StreamRequest::with_options(
        RequestConfig::new(transport.clone()),
        factory(),
        true,
    );
    request.stream(|payload| match payload.event {
        StreamEvent::Chunk(_) => Err("poisoned chunk".into()),
        StreamEvent::Complete(_) => Ok(()),
    });
    request.resume();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = transport.task(0);
    task.push_chunk(Bytes::from_static(b"bad"));
    finished(&request).await;

    assert_eq!(request.state(), State::Cancelled);
    // The specific consumer error wins over the cancellation sentinel.
    assert!(matches!(request.error(), Some(Error::StreamConsumer { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_token_cancels_the_stream() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Manual]);
    let request = StreamRequest::new(RequestConfig::new(transport.clone()), factory());
    request.stream(|payload| {
        if let StreamEvent::Chunk(_) = payload.event {
            payload.token.cancel();
        }
        Ok(())
    });
    request.resume();
    tokio::time::sleep(Duration::from_millis(50)).await;

    transport.task(0).push_chunk(Bytes::from_static(b"first"));
    finished(&request).await;

    assert_eq!(request.state(), State::Cancelled);
    assert!(matches!(request.error(), Some(Error::ExplicitlyCancelled)));
}

#[tokio::test]
async fn byte_channel_mirrors_every_chunk() {
    let transport = MockTransport::with_outcomes(vec![MockOutcome::Success {
        response: HttpResponse::new(http::StatusCode::OK),
        body: vec![Bytes::from_static(b"alpha"), Bytes::from_static(b"beta")],
    }]);
    let request = StreamRequest::new(RequestConfig::new(transport), factory());
    let mut mirrored = request.byte_channel();
    request.resume();
    finished(&request).await;

    assert_eq!(
        mirrored.recv().await.expect("first chunk"),
        Bytes::from_static(b"alpha")
    );
    assert_eq!(
        mirrored.recv().await.expect("second chunk"),
        Bytes::from_static(b"beta")
    );
}
