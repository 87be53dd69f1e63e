//! TopicRegistry and SignalRegistry tests

use std::time::Duration;

use mercure_client::testing::{wait_for, ScriptedTransport};
use mercure_client::{
    ConnectOptions, ConnectionState, HubEndpoints, SignalRegistry, StreamError, TopicEvent,
    TopicRegistry,
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast::error::RecvError;

const TOPIC: &str = "https://api.local/posts/{id}";

fn endpoints() -> HubEndpoints {
    HubEndpoints::new("https://hub.local", "/.well-known/mercure", "https://api.local").unwrap()
}

#[tokio::test]
async fn test_same_topic_shares_one_connection() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept_next();
    let registry =
        TopicRegistry::with_transport(endpoints(), transport.clone(), ConnectOptions::default());

    let mut first = registry.for_topic(TOPIC);
    let mut second = registry.for_topic(TOPIC);
    transport.wait_for_opens(1).await;
    assert_eq!(
        transport.urls(),
        vec!["https://hub.local/.well-known/mercure?topic=https%3A%2F%2Fapi.local%2Fposts%2F%7Bid%7D"]
    );

    feed.send("event: update\nid: urn:uuid:9\ndata: {\"@id\":\"/posts/3\",\"title\":\"x\"}\n\n");

    let expected = TopicEvent {
        last_event_id: "urn:uuid:9".into(),
        event_type: "update".into(),
        resource_id: Some("/posts/3".into()),
    };
    assert_eq!(first.recv().await.unwrap(), expected);
    assert_eq!(second.recv().await.unwrap(), expected);
    assert_eq!(transport.open_count(), 1);
    assert_eq!(registry.topics(), vec![TOPIC.to_string()]);
}

#[tokio::test]
async fn test_last_event_id_carries_over_untagged_frames() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept_next();
    let registry =
        TopicRegistry::with_transport(endpoints(), transport.clone(), ConnectOptions::default());
    let mut events = registry.for_topic(TOPIC);

    feed.send("event: create\nid: 1\ndata: {\"@id\":\"/posts/1\"}\n\n");
    feed.send("event: delete\ndata: {\"@id\":\"/posts/1\"}\n\n");

    assert_eq!(events.recv().await.unwrap().last_event_id, "1");
    let deleted = events.recv().await.unwrap();
    assert_eq!(deleted.event_type, "delete");
    assert_eq!(deleted.last_event_id, "1");
}

#[tokio::test]
async fn test_release_closes_and_forgets() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept_next();
    let _again = transport.accept_next();
    let registry =
        TopicRegistry::with_transport(endpoints(), transport.clone(), ConnectOptions::default());

    let _events = registry.for_topic(TOPIC);
    transport.wait_for_opens(1).await;
    assert!(registry.contains(TOPIC));

    assert!(registry.release(TOPIC));
    assert!(!registry.release(TOPIC));
    feed.closed().await;
    assert!(registry.status(TOPIC).is_none());

    let _events = registry.for_topic(TOPIC);
    transport.wait_for_opens(2).await;
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test]
async fn test_status_and_shutdown() {
    let transport = ScriptedTransport::new();
    let posts = transport.accept_next();
    let books = transport.accept_next();
    let registry =
        TopicRegistry::with_transport(endpoints(), transport.clone(), ConnectOptions::default());

    let _a = registry.for_topic(&registry.endpoints().topic("/posts/{id}"));
    let _b = registry.for_topic(&registry.endpoints().topic("/books/{id}"));
    transport.wait_for_opens(2).await;

    let all_open = wait_for(
        || async {
            registry
                .topics()
                .iter()
                .all(|t| registry.status(t).map(|s| s.state) == Some(ConnectionState::Open))
        },
        Duration::from_secs(1),
    )
    .await;
    assert!(all_open);

    registry.shutdown();
    posts.closed().await;
    books.closed().await;
    assert!(registry.topics().is_empty());
}

#[tokio::test]
async fn test_failed_topic_ends_receivers_and_reopens() {
    let transport = ScriptedTransport::new();
    transport.fail_next(StreamError::server(503, "unavailable"));
    let registry =
        TopicRegistry::with_transport(endpoints(), transport.clone(), ConnectOptions::default());

    let mut events = registry.for_topic(TOPIC);
    let ended = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap();
    assert_eq!(ended, Err(RecvError::Closed));

    let status = registry.status(TOPIC).unwrap();
    assert_eq!(status.state, ConnectionState::Failed);
    assert!(matches!(
        status.last_error,
        Some(StreamError::Exhausted { attempts: 0, .. })
    ));
    assert!(!registry.contains(TOPIC));
    assert!(registry.topics().is_empty());

    let feed = transport.accept_next();
    let mut events = registry.for_topic(TOPIC);
    transport.wait_for_opens(2).await;
    feed.send("event: create\nid: 2\ndata: {\"@id\":\"/posts/2\"}\n\n");

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.resource_id.as_deref(), Some("/posts/2"));
    assert!(registry.contains(TOPIC));
    assert_eq!(registry.status(TOPIC).map(|s| s.state), Some(ConnectionState::Open));
}

#[test]
fn test_signals_by_resource() {
    let signals: SignalRegistry = SignalRegistry::new();
    signals.signal(3).raise();
    assert!(signals.signal(3).get());
    assert!(signals.unlink(&3));
    assert!(!signals.signal(3).get());
}
