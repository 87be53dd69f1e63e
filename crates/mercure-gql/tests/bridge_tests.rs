//! Subscription bridge tests
//!
//! Registration responses come from a canned executor; selection streams are
//! fed through a scripted transport. The last test runs everything over HTTP.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::post;
use axum::{Json, Router};
use mercure_client::testing::{wait_for, ScriptedTransport, TestHub};
use mercure_client::{BackoffPolicy, ConnectOptions, StreamError};
use mercure_gql::{
    BridgeError, GraphQlRequest, GraphQlResponse, HttpExecutor, RequestExecutor, ResultStream,
    SubscriptionBridge, SubscriptionResult, UrlRewrite,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

const TIMEOUT: Duration = Duration::from_secs(5);

const POSTS: &str = "subscription OnPost { posts { mercureUrl title } }";
const POSTS_AND_COMMENTS: &str =
    "subscription OnActivity { posts { mercureUrl } comments { mercureUrl } }";

/// Answers every request with the same outcome
struct Canned {
    outcome: Result<Value, BridgeError>,
    requests: AtomicUsize,
}

impl Canned {
    fn data(response: Value) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(response),
            requests: AtomicUsize::new(0),
        })
    }

    fn error(error: BridgeError) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(error),
            requests: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RequestExecutor for Canned {
    async fn execute(&self, _request: &GraphQlRequest) -> mercure_gql::Result<GraphQlResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match &self.outcome {
            Ok(response) => Ok(serde_json::from_value(response.clone()).unwrap()),
            Err(e) => Err(e.clone()),
        }
    }
}

/// Never answers; records when the pending request starts and is dropped
struct Hanging {
    started: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
}

struct AbortFlag(Arc<AtomicBool>);

impl Drop for AbortFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RequestExecutor for Hanging {
    async fn execute(&self, _request: &GraphQlRequest) -> mercure_gql::Result<GraphQlResponse> {
        let _flag = AbortFlag(self.aborted.clone());
        self.started.store(true, Ordering::SeqCst);
        futures::future::pending::<()>().await;
        unreachable!()
    }
}

fn bridge(executor: Arc<dyn RequestExecutor>, transport: &Arc<ScriptedTransport>) -> SubscriptionBridge {
    SubscriptionBridge::new(executor)
        .unwrap()
        .with_transport(transport.clone())
        .with_rewrite(UrlRewrite::new("http://internal/", "http://public/"))
}

async fn next(results: &mut ResultStream) -> Option<mercure_gql::Result<SubscriptionResult>> {
    tokio::time::timeout(TIMEOUT, results.next_result())
        .await
        .expect("timed out waiting for result")
}

fn data(result: SubscriptionResult) -> Value {
    Value::Object(result.data)
}

#[tokio::test]
async fn test_patch_merges_into_rewritten_selection() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept_next();
    let executor = Canned::data(json!({
        "data": {"posts": {"mercureUrl": "http://internal/hub?topic=x", "title": "old"}}
    }));

    let (mut results, _teardown) =
        bridge(executor.clone(), &transport).subscribe(GraphQlRequest::new(POSTS));
    transport.wait_for_opens(1).await;
    assert_eq!(transport.urls(), vec!["http://public/hub?topic=x"]);

    feed.send("event: gqlsubs\ndata: {\"title\":\"new\"}\n\n");

    let result = next(&mut results).await.unwrap().unwrap();
    assert_eq!(
        data(result),
        json!({"posts": {"mercureUrl": "http://internal/hub?topic=x", "title": "new"}})
    );
    assert_eq!(executor.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_only_subscription_patches_are_applied() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept_next();
    let executor = Canned::data(json!({
        "data": {"posts": {"mercureUrl": "http://internal/hub?topic=x", "title": "old"}}
    }));

    let (mut results, _teardown) =
        bridge(executor, &transport).subscribe(GraphQlRequest::new(POSTS));
    transport.wait_for_opens(1).await;

    feed.send("event: update\ndata: {\"title\":\"ignored\"}\n\n");
    feed.send("data: {\"title\":\"ignored too\"}\n\n");
    feed.send("event: gqlsubs\ndata: {\"title\":\"first\"}\n\n");
    feed.send("event: gqlsubs\ndata: {\"views\":3}\n\n");

    let first = next(&mut results).await.unwrap().unwrap();
    assert_eq!(first.selection("posts").unwrap()["title"], "first");

    let second = next(&mut results).await.unwrap().unwrap();
    assert_eq!(
        second.selection("posts"),
        Some(&json!({"mercureUrl": "http://internal/hub?topic=x", "title": "first", "views": 3}))
    );
}

#[tokio::test]
async fn test_alias_is_the_result_key() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept_next();
    let executor = Canned::data(json!({
        "data": {"mine": {"mercureUrl": "http://internal/hub?topic=mine"}}
    }));

    let (mut results, _teardown) = bridge(executor, &transport)
        .subscribe(GraphQlRequest::new("subscription { mine: posts { mercureUrl } }"));
    transport.wait_for_opens(1).await;

    feed.send("event: gqlsubs\ndata: {\"title\":\"x\"}\n\n");
    let result = next(&mut results).await.unwrap().unwrap();
    assert_eq!(result.selection("mine").unwrap()["title"], "x");
}

#[tokio::test]
async fn test_missing_stream_url_fails_whole_subscription() {
    let transport = ScriptedTransport::new();
    let executor = Canned::data(json!({
        "data": {
            "posts": {"mercureUrl": "http://internal/hub?topic=posts"},
            "comments": {"id": 1}
        }
    }));

    let (mut results, _teardown) =
        bridge(executor, &transport).subscribe(GraphQlRequest::new(POSTS_AND_COMMENTS));

    assert_eq!(
        next(&mut results).await,
        Some(Err(BridgeError::MissingStreamUrl {
            selection: "comments".into()
        }))
    );
    assert_eq!(next(&mut results).await, None);
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test]
async fn test_executor_failure_is_terminal() {
    let transport = ScriptedTransport::new();
    let executor = Canned::error(BridgeError::Status {
        status: 503,
        message: "unavailable".into(),
    });

    let (mut results, _teardown) =
        bridge(executor.clone(), &transport).subscribe(GraphQlRequest::new(POSTS));

    let error = next(&mut results).await.unwrap().unwrap_err();
    assert!(error.is_terminal());
    assert_eq!(
        error,
        BridgeError::Status {
            status: 503,
            message: "unavailable".into()
        }
    );
    assert_eq!(next(&mut results).await, None);
    assert_eq!(transport.open_count(), 0);
    assert_eq!(executor.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_errors_without_data() {
    let transport = ScriptedTransport::new();
    let executor = Canned::data(json!({"data": null, "errors": [{"message": "denied"}]}));

    let (mut results, _teardown) =
        bridge(executor, &transport).subscribe(GraphQlRequest::new(POSTS));

    assert_eq!(
        next(&mut results).await,
        Some(Err(BridgeError::GraphQl(vec!["denied".into()])))
    );
    assert_eq!(next(&mut results).await, None);
}

#[tokio::test]
async fn test_invalid_document_skips_request() {
    let transport = ScriptedTransport::new();
    let executor = Canned::data(json!({"data": {}}));

    let (mut results, _teardown) = bridge(executor.clone(), &transport)
        .subscribe(GraphQlRequest::new(POSTS).with_operation_name("Missing"));

    assert!(matches!(
        next(&mut results).await,
        Some(Err(BridgeError::Document(_)))
    ));
    assert_eq!(executor.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_selections_absent_from_data_are_skipped() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept_next();
    let executor = Canned::data(json!({
        "data": {"posts": {"mercureUrl": "http://internal/hub?topic=posts"}}
    }));

    let (mut results, _teardown) =
        bridge(executor, &transport).subscribe(GraphQlRequest::new(POSTS_AND_COMMENTS));
    transport.wait_for_opens(1).await;

    feed.send("event: gqlsubs\ndata: {\"n\":1}\n\n");
    let result = next(&mut results).await.unwrap().unwrap();
    assert_eq!(result.selection("posts").unwrap()["n"], 1);
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn test_teardown_aborts_pending_request() {
    let transport = ScriptedTransport::new();
    let started = Arc::new(AtomicBool::new(false));
    let aborted = Arc::new(AtomicBool::new(false));
    let executor = Arc::new(Hanging {
        started: started.clone(),
        aborted: aborted.clone(),
    });

    let (mut results, teardown) =
        bridge(executor, &transport).subscribe(GraphQlRequest::new(POSTS));
    assert!(wait_for(|| async { started.load(Ordering::SeqCst) }, TIMEOUT).await);
    assert!(!aborted.load(Ordering::SeqCst));

    teardown.teardown();
    teardown.teardown();
    assert!(teardown.is_torn_down());

    assert!(wait_for(|| async { aborted.load(Ordering::SeqCst) }, TIMEOUT).await);
    assert_eq!(next(&mut results).await, None);
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test]
async fn test_teardown_closes_every_stream() {
    let transport = ScriptedTransport::new();
    let posts = transport.accept_next();
    let comments = transport.accept_next();
    let executor = Canned::data(json!({
        "data": {
            "posts": {"mercureUrl": "http://internal/hub?topic=posts"},
            "comments": {"mercureUrl": "http://internal/hub?topic=comments"}
        }
    }));

    let (mut results, teardown) =
        bridge(executor, &transport).subscribe(GraphQlRequest::new(POSTS_AND_COMMENTS));
    transport.wait_for_opens(2).await;
    assert!(wait_for(|| async { transport.live_streams() == 2 }, TIMEOUT).await);

    teardown.teardown();

    tokio::time::timeout(TIMEOUT, posts.closed()).await.unwrap();
    tokio::time::timeout(TIMEOUT, comments.closed()).await.unwrap();
    assert!(wait_for(|| async { transport.live_streams() == 0 }, TIMEOUT).await);
    assert_eq!(next(&mut results).await, None);

    // Late patches go nowhere
    assert!(!posts.send("event: gqlsubs\ndata: {\"title\":\"late\"}\n\n"));
}

#[tokio::test]
async fn test_dropping_results_tears_down() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept_next();
    let executor = Canned::data(json!({
        "data": {"posts": {"mercureUrl": "http://internal/hub?topic=posts"}}
    }));

    let (results, teardown) = bridge(executor, &transport).subscribe(GraphQlRequest::new(POSTS));
    transport.wait_for_opens(1).await;

    drop(results);
    assert!(teardown.is_torn_down());
    tokio::time::timeout(TIMEOUT, feed.closed()).await.unwrap();
}

#[tokio::test]
async fn test_failed_selection_leaves_others_running() {
    let transport = ScriptedTransport::new();
    let posts = transport.accept_next();
    let comments = transport.accept_next();
    let executor = Canned::data(json!({
        "data": {
            "posts": {"mercureUrl": "http://internal/hub?topic=posts"},
            "comments": {"mercureUrl": "http://internal/hub?topic=comments"}
        }
    }));

    let (mut results, _teardown) = bridge(executor, &transport)
        .with_options(ConnectOptions::new().with_backoff(BackoffPolicy::Never))
        .subscribe(GraphQlRequest::new(POSTS_AND_COMMENTS));
    transport.wait_for_opens(2).await;

    posts.fail(StreamError::Connection("reset".into()));

    let error = next(&mut results).await.unwrap().unwrap_err();
    assert!(!error.is_terminal());
    assert_eq!(
        error,
        BridgeError::Stream {
            selection: "posts".into(),
            error: StreamError::Exhausted {
                attempts: 0,
                cause: Box::new(StreamError::Connection("reset".into())),
            },
        }
    );

    comments.send("event: gqlsubs\ndata: {\"count\":2}\n\n");
    let result = next(&mut results).await.unwrap().unwrap();
    assert_eq!(result.selection("comments").unwrap()["count"], 2);

    // Last selection gone, so the subscription is over
    comments.fail(StreamError::Connection("reset".into()));
    assert!(matches!(
        next(&mut results).await,
        Some(Err(BridgeError::Stream { ref selection, .. })) if selection == "comments"
    ));
    assert_eq!(next(&mut results).await, None);
}

#[tokio::test]
async fn test_subscription_over_http() {
    const TOPIC: &str = "https://api.local/posts/1";

    let routes = Router::new().route(
        "/graphql",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["operationName"], "OnPost");
            Json(json!({
                "data": {"posts": {
                    "mercureUrl": "http://caddy/.well-known/mercure?topic=https%3A%2F%2Fapi.local%2Fposts%2F1",
                    "title": "old"
                }}
            }))
        }),
    );
    let hub = TestHub::start_with_routes(routes).await.unwrap();

    let executor = HttpExecutor::new(&format!("{}/graphql", hub.base_url())).unwrap();
    let bridge = SubscriptionBridge::new(Arc::new(executor))
        .unwrap()
        .with_rewrite(UrlRewrite::new("http://caddy", hub.base_url()));

    let (mut results, teardown) =
        bridge.subscribe(GraphQlRequest::new(POSTS).with_operation_name("OnPost"));
    assert!(wait_for(|| async { hub.subscriber_count() >= 1 }, TIMEOUT).await);
    assert_eq!(hub.requests()[0].topics, vec![TOPIC.to_string()]);

    hub.publish(TOPIC, Some("gqlsubs"), "urn:uuid:1", r#"{"title":"new"}"#);

    let result = next(&mut results).await.unwrap().unwrap();
    assert_eq!(result.selection("posts").unwrap()["title"], "new");

    teardown.teardown();
    assert_eq!(next(&mut results).await, None);
}
