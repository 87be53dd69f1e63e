//! Integration tests over real HTTP
//!
//! These tests spin up a local hub and connect to it with the HTTP transport.

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use mercure_client::testing::{wait_for, TestHub};
use mercure_client::{
    BackoffPolicy, ConnectOptions, ConnectionState, DeltaTracker, StreamConnection, StreamError,
    TopicRegistry,
};
use pretty_assertions::assert_eq;
use serde_json::json;

const TOPIC: &str = "https://api.local/posts/1";
const TIMEOUT: Duration = Duration::from_secs(5);

fn retrying() -> ConnectOptions {
    ConnectOptions::new().with_backoff(BackoffPolicy::constant(Duration::from_millis(50)))
}

async fn subscribers(hub: &TestHub, n: usize) {
    assert!(
        wait_for(|| async { hub.subscriber_count() >= n }, TIMEOUT).await,
        "hub never saw {n} subscriber(s)"
    );
}

async fn next(conn: &mut StreamConnection) -> mercure_client::Event {
    tokio::time::timeout(TIMEOUT, conn.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("stream ended")
}

#[tokio::test]
async fn test_receive_typed_event() {
    let hub = TestHub::start().await.unwrap();
    let mut conn = StreamConnection::open(&hub.topic_url(TOPIC), retrying()).unwrap();
    subscribers(&hub, 1).await;

    hub.publish(TOPIC, Some("update"), "urn:uuid:1", r#"{"@id":"/posts/1","title":"Hello"}"#);

    let event = next(&mut conn).await;
    assert_eq!(event.event_type, "update");
    assert_eq!(event.id, "urn:uuid:1");
    assert_eq!(event.parsed_data, vec![json!({"@id": "/posts/1", "title": "Hello"})]);
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_multiline_data_is_split_into_lines() {
    let hub = TestHub::start().await.unwrap();
    let mut conn = StreamConnection::open(&hub.topic_url(TOPIC), retrying()).unwrap();
    subscribers(&hub, 1).await;

    hub.publish(TOPIC, None, "", "{\"a\":1}\n{\"b\":2}");

    let event = next(&mut conn).await;
    assert_eq!(event.event_type, "message");
    assert_eq!(event.data_lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    assert_eq!(event.parsed_data.len(), 2);
}

#[tokio::test]
async fn test_reconnect_resumes_from_last_event_id() {
    let hub = TestHub::start().await.unwrap();
    let mut conn = StreamConnection::open(&hub.topic_url(TOPIC), retrying()).unwrap();
    subscribers(&hub, 1).await;

    hub.publish(TOPIC, Some("create"), "e1", r#"{"@id":"/posts/1"}"#);
    assert_eq!(next(&mut conn).await.id, "e1");

    // Missed while disconnected, replayed on resumption
    hub.disconnect_all();
    hub.publish(TOPIC, Some("update"), "e2", r#"{"@id":"/posts/1"}"#);

    let event = next(&mut conn).await;
    assert_eq!(event.id, "e2");
    assert_eq!(event.event_type, "update");

    let requests = hub.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].last_event_id, None);
    assert_eq!(requests[1].last_event_id.as_deref(), Some("e1"));
    assert_eq!(requests[1].topics, vec![TOPIC.to_string()]);
}

#[tokio::test]
async fn test_rejected_subscription_exhausts_schedule() {
    let hub = TestHub::start().await.unwrap();
    hub.reject_with(Some(StatusCode::SERVICE_UNAVAILABLE));

    let options =
        ConnectOptions::new().with_backoff(BackoffPolicy::schedule(["20ms", "20ms", "stop"]));
    let conn = StreamConnection::open(&hub.topic_url(TOPIC), options).unwrap();

    let status = tokio::time::timeout(TIMEOUT, conn.wait_for_state(ConnectionState::Failed))
        .await
        .unwrap();
    assert_eq!(hub.requests().len(), 3);
    assert_eq!(
        status.last_error,
        Some(StreamError::Exhausted {
            attempts: 2,
            cause: Box::new(StreamError::server(503, "subscription rejected")),
        })
    );
}

#[tokio::test]
async fn test_non_event_stream_response_is_an_error() {
    let routes = Router::new().route("/plain", get(|| async { "hello" }));
    let hub = TestHub::start_with_routes(routes).await.unwrap();

    let url = format!("{}/plain", hub.base_url());
    let conn = StreamConnection::open(&url, ConnectOptions::default()).unwrap();

    let status = tokio::time::timeout(TIMEOUT, conn.wait_for_state(ConnectionState::Failed))
        .await
        .unwrap();
    match status.last_error {
        Some(StreamError::Exhausted { cause, .. }) => {
            assert!(matches!(*cause, StreamError::ContentType(ref ct) if ct.starts_with("text/plain")));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_bearer_token_sent_with_credentials() {
    let hub = TestHub::start().await.unwrap();
    let options = retrying().with_credentials(true).with_bearer_token("subscriber-jwt");
    let _conn = StreamConnection::open(&hub.topic_url(TOPIC), options).unwrap();
    subscribers(&hub, 1).await;

    assert_eq!(
        hub.requests()[0].authorization.as_deref(),
        Some("Bearer subscriber-jwt")
    );
}

#[tokio::test]
async fn test_close_detaches_from_hub() {
    let hub = TestHub::start().await.unwrap();
    let conn = StreamConnection::open(&hub.topic_url(TOPIC), retrying()).unwrap();
    subscribers(&hub, 1).await;

    conn.close();
    assert_eq!(conn.state(), ConnectionState::Closed);

    // The hub notices the dropped response on its next write
    let detached = wait_for(
        || async {
            hub.publish(TOPIC, None, "", "{}");
            hub.subscriber_count() == 0
        },
        TIMEOUT,
    )
    .await;
    assert!(detached);
    assert_eq!(hub.requests().len(), 1);
}

#[tokio::test]
async fn test_delta_tracker_over_fragment_topics() {
    let hub = TestHub::start().await.unwrap();
    let tracker =
        DeltaTracker::track_fragments(&hub.topic_url("https://api.local/posts"), retrying())
            .unwrap();
    let mut changes = tracker.changes();
    subscribers(&hub, 2).await;

    hub.publish("https://api.local/posts#create", None, "c1", r#"{"@id":"/posts/7"}"#);
    hub.publish("https://api.local/posts#delete", None, "d1", r#"{"@id":"/posts/3"}"#);

    tokio::time::timeout(TIMEOUT, changes.wait_for(|v| *v >= 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tracker.inserted(), vec!["/posts/7"]);
    assert_eq!(tracker.deleted(), vec!["/posts/3"]);
}

#[tokio::test]
async fn test_topic_registry_over_http() {
    let hub = TestHub::start().await.unwrap();
    let registry = TopicRegistry::new(hub.endpoints().unwrap(), retrying()).unwrap();

    let mut events = registry.for_topic(TOPIC);
    subscribers(&hub, 1).await;

    hub.publish(TOPIC, Some("delete"), "urn:uuid:5", r#"{"@id":"/posts/1"}"#);
    let event = tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, "delete");
    assert_eq!(event.last_event_id, "urn:uuid:5");
    assert_eq!(event.resource_id.as_deref(), Some("/posts/1"));
}
