//! Test utilities for mercure-client
//!
//! - [`ScriptedTransport`]: an in-memory [`Transport`] whose opens succeed or
//!   fail in a scripted order. Combine with `#[tokio::test(start_paused = true)]`
//!   to drive reconnect schedules without waiting.
//! - [`TestHub`]: a small hub served by axum on a random local port, for tests
//!   that go through real HTTP.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use url::Url;

use crate::config::{ConfigError, HubEndpoints};
use crate::connection::{ConnectOptions, LAST_EVENT_ID_PARAM};
use crate::error::{Result, StreamError};
use crate::transport::{ByteStream, Transport};

// =============================================================================
// Scripted transport
// =============================================================================

enum Step {
    Accept(mpsc::UnboundedReceiver<Result<Bytes>>),
    Fail(StreamError),
    Hang,
}

/// One call to [`Transport::open`]
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub url: Url,
    pub at: Instant,
    /// Token that would have been sent
    pub bearer_token: Option<String>,
}

/// Feeds bytes into a stream accepted by a [`ScriptedTransport`]
#[derive(Debug)]
pub struct FeedHandle {
    tx: mpsc::UnboundedSender<Result<Bytes>>,
}

impl FeedHandle {
    /// Push raw SSE text; returns false once the reader is gone
    pub fn send(&self, text: &str) -> bool {
        self.tx.send(Ok(Bytes::from(text.to_string()))).is_ok()
    }

    /// Fail the stream with a transport error
    pub fn fail(&self, err: StreamError) -> bool {
        self.tx.send(Err(err)).is_ok()
    }

    /// End the stream cleanly (server closed the response)
    pub fn end(self) {}

    /// Whether the reading side dropped the stream
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until the reading side drops the stream
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory transport answering opens from a script
///
/// Opens beyond the script fail with a connection error.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    opens: Mutex<Vec<OpenRecord>>,
    open_count: watch::Sender<usize>,
    live: Arc<AtomicUsize>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            opens: Mutex::new(Vec::new()),
            open_count: watch::channel(0).0,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept the next open; the returned handle feeds its body
    pub fn accept_next(&self) -> FeedHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().push_back(Step::Accept(rx));
        FeedHandle { tx }
    }

    /// Fail the next open with `err`
    pub fn fail_next(&self, err: StreamError) {
        self.script.lock().push_back(Step::Fail(err));
    }

    /// Never resolve the next open
    pub fn hang_next(&self) {
        self.script.lock().push_back(Step::Hang);
    }

    /// Every open so far, in order
    pub fn opens(&self) -> Vec<OpenRecord> {
        self.opens.lock().clone()
    }

    /// URLs of every open so far
    pub fn urls(&self) -> Vec<String> {
        self.opens.lock().iter().map(|o| o.url.to_string()).collect()
    }

    pub fn open_count(&self) -> usize {
        *self.open_count.borrow()
    }

    /// Streams handed out and not yet dropped
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` opens happened
    pub async fn wait_for_opens(&self, n: usize) {
        let mut rx = self.open_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &Url, options: &ConnectOptions) -> Result<ByteStream> {
        let step = self.script.lock().pop_front();
        self.opens.lock().push(OpenRecord {
            url: url.clone(),
            at: Instant::now(),
            bearer_token: options
                .bearer_token
                .clone()
                .filter(|_| options.with_credentials),
        });
        self.open_count.send_modify(|count| *count += 1);

        match step {
            Some(Step::Accept(rx)) => {
                let guard = LiveGuard::new(self.live.clone());
                Ok(UnboundedReceiverStream::new(rx)
                    .map(move |chunk| {
                        let _live = &guard;
                        chunk
                    })
                    .boxed())
            }
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => std::future::pending().await,
            None => Err(StreamError::Connection("no scripted response".into())),
        }
    }
}

// =============================================================================
// Test hub
// =============================================================================

/// Subscription path served by [`TestHub`]
pub const HUB_PATH: &str = "/.well-known/mercure";

/// An update published on a [`TestHub`]
#[derive(Debug, Clone, PartialEq)]
pub struct HubUpdate {
    pub topic: String,
    pub id: String,
    pub event_type: Option<String>,
    pub data: String,
}

/// A subscription request received by a [`TestHub`]
#[derive(Debug, Clone, PartialEq)]
pub struct HubRequest {
    pub topics: Vec<String>,
    pub last_event_id: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone)]
enum HubMessage {
    Update(HubUpdate),
    Disconnect,
}

struct HubState {
    tx: broadcast::Sender<HubMessage>,
    history: Mutex<Vec<HubUpdate>>,
    requests: Mutex<Vec<HubRequest>>,
    reject: Mutex<Option<StatusCode>>,
}

impl HubState {
    /// Updates published after `last_event_id` on any of `topics`
    fn replay(&self, topics: &[String], last_event_id: &str) -> Vec<HubUpdate> {
        let history = self.history.lock();
        let start = history
            .iter()
            .position(|u| u.id == last_event_id)
            .map(|i| i + 1)
            .unwrap_or(history.len());
        history[start..]
            .iter()
            .filter(|u| topics.contains(&u.topic))
            .cloned()
            .collect()
    }
}

/// A hub served on a random local port that shuts down when dropped
pub struct TestHub {
    pub addr: SocketAddr,
    state: Arc<HubState>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestHub {
    /// Start a hub serving [`HUB_PATH`]
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with_routes(Router::new()).await
    }

    /// Start a hub that also serves `routes` (e.g. a GraphQL endpoint)
    pub async fn start_with_routes(routes: Router) -> std::io::Result<Self> {
        let (tx, _) = broadcast::channel(256);
        let state = Arc::new(HubState {
            tx,
            history: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            reject: Mutex::new(None),
        });

        let router = Router::new()
            .route(HUB_PATH, get(subscribe))
            .with_state(state.clone())
            .merge(routes);

        // Bind to any available port
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // Give server a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Get the base URL of the hub
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Endpoints pointing at this hub
    pub fn endpoints(&self) -> std::result::Result<HubEndpoints, ConfigError> {
        HubEndpoints::new(&self.base_url(), HUB_PATH, "")
    }

    /// Subscription URL for one topic
    pub fn topic_url(&self, topic: &str) -> String {
        let mut url = format!("{}{}?topic=", self.base_url(), HUB_PATH);
        url.extend(url::form_urlencoded::byte_serialize(topic.as_bytes()));
        url
    }

    /// Publish an update to every matching subscriber
    pub fn publish(&self, topic: &str, event_type: Option<&str>, id: &str, data: &str) {
        let update = HubUpdate {
            topic: topic.to_string(),
            id: id.to_string(),
            event_type: event_type.map(str::to_string),
            data: data.to_string(),
        };
        self.state.history.lock().push(update.clone());
        let _ = self.state.tx.send(HubMessage::Update(update));
    }

    /// End every open subscription response
    pub fn disconnect_all(&self) {
        let _ = self.state.tx.send(HubMessage::Disconnect);
    }

    /// Answer subsequent subscriptions with `status` (None to accept again)
    pub fn reject_with(&self, status: Option<StatusCode>) {
        *self.state.reject.lock() = status;
    }

    /// Subscription requests received so far
    pub fn requests(&self) -> Vec<HubRequest> {
        self.state.requests.lock().clone()
    }

    /// Number of currently attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.state.tx.receiver_count()
    }

    /// Shutdown the hub gracefully
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn subscribe(
    State(state): State<Arc<HubState>>,
    headers: axum::http::HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let topics: Vec<String> = params
        .iter()
        .filter(|(key, _)| key == "topic")
        .map(|(_, value)| value.clone())
        .collect();
    let last_event_id = params
        .iter()
        .find(|(key, _)| key == LAST_EVENT_ID_PARAM)
        .map(|(_, value)| value.clone());

    state.requests.lock().push(HubRequest {
        topics: topics.clone(),
        last_event_id: last_event_id.clone(),
        authorization: headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    if let Some(status) = *state.reject.lock() {
        return (status, "subscription rejected").into_response();
    }
    if topics.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing topic selector").into_response();
    }

    // Subscribe before replaying so nothing falls in between
    let live = BroadcastStream::new(state.tx.subscribe());
    let replay = last_event_id
        .map(|id| state.replay(&topics, &id))
        .unwrap_or_default();

    let live = live
        .take_while(|message| {
            futures::future::ready(!matches!(message, Ok(HubMessage::Disconnect)))
        })
        .filter_map(move |message| {
            let update = match message {
                Ok(HubMessage::Update(update)) if topics.contains(&update.topic) => Some(update),
                _ => None,
            };
            futures::future::ready(update)
        });

    let stream = futures::stream::iter(replay)
        .chain(live)
        .map(|update| Ok::<_, Infallible>(to_sse(update)));

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn to_sse(update: HubUpdate) -> SseEvent {
    let mut event = SseEvent::default().data(update.data);
    if !update.id.is_empty() {
        event = event.id(update.id);
    }
    if let Some(event_type) = update.event_type {
        event = event.event(event_type);
    }
    event
}

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_open_order() {
        let transport = ScriptedTransport::new();
        transport.fail_next(StreamError::Timeout);
        let feed = transport.accept_next();

        let url = Url::parse("http://hub.local/").unwrap();
        let options = ConnectOptions::default();

        assert!(matches!(
            transport.open(&url, &options).await,
            Err(StreamError::Timeout)
        ));

        let stream = transport.open(&url, &options).await.unwrap();
        assert_eq!(transport.live_streams(), 1);
        assert!(!feed.is_closed());

        drop(stream);
        assert_eq!(transport.live_streams(), 0);
        assert!(feed.is_closed());

        assert!(matches!(
            transport.open(&url, &options).await,
            Err(StreamError::Connection(_))
        ));
        assert_eq!(transport.open_count(), 3);
    }

    #[test]
    fn test_hub_replay() {
        let (tx, _) = broadcast::channel(4);
        let state = HubState {
            tx,
            history: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            reject: Mutex::new(None),
        };
        for (topic, id) in [("a", "1"), ("b", "2"), ("a", "3")] {
            state.history.lock().push(HubUpdate {
                topic: topic.into(),
                id: id.into(),
                event_type: None,
                data: "{}".into(),
            });
        }

        let topics = vec!["a".to_string()];
        let ids: Vec<_> = state.replay(&topics, "1").into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["3"]);
        assert!(state.replay(&topics, "unknown").is_empty());
    }
}
