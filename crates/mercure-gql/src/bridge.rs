//! GraphQL subscriptions over Mercure
//!
//! The API answers a subscription request once, with one `mercureUrl` per
//! top-level selection. The bridge opens one stream per selection and turns
//! every `gqlsubs` patch into a new full result:
//!
//! ```text
//! subscribe(request)
//!   └─ driver ── execute ──► data { posts: { mercureUrl, .. }, .. }
//!        │                        │ rewrite + open per selection
//!        │          StreamMap<selection, StreamConnection>
//!        │                        │ gqlsubs → merge_patch(selection)
//!        └── results ◄── mpsc ◄───┘
//! ```
//!
//! Nothing is published before the request resolves, and the initial
//! response itself is not published.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use mercure_client::event::GQL_SUBSCRIPTION;
use mercure_client::{
    Closer, ConnectOptions, ConnectionState, ConnectionStatus, Event, HttpTransport,
    StreamConnection, StreamError, Transport,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use url::Url;

use crate::config::{default_connect_options, BridgeConfig};
use crate::document::top_level_selections;
use crate::error::{BridgeError, Result};
use crate::executor::{HttpExecutor, OperationLog, RequestExecutor};
use crate::rewrite::UrlRewrite;
use crate::types::{GraphQlRequest, SubscriptionResult, STREAM_URL_FIELD};

/// Capacity of the result channel
const RESULT_BUFFER: usize = 64;

/// Turns GraphQL subscription requests into live result streams
pub struct SubscriptionBridge {
    executor: Arc<dyn RequestExecutor>,
    transport: Arc<dyn Transport>,
    rewrite: Option<UrlRewrite>,
    options: ConnectOptions,
}

impl SubscriptionBridge {
    /// Create a bridge using `executor` and HTTP streams.
    ///
    /// Selection streams retry after 1s, 2s, then every 5s forever (plus up to
    /// 500ms jitter) and never send credentials.
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Result<Self> {
        let transport = HttpTransport::new().map_err(|e| BridgeError::Request(e.to_string()))?;
        Ok(Self {
            executor,
            transport: Arc::new(transport),
            rewrite: None,
            options: default_connect_options(),
        })
    }

    /// Create a bridge from configuration, with operation logging enabled
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let executor = HttpExecutor::with_config(
            &config.endpoint,
            config.request_timeout(),
            config.bearer_token.as_deref(),
        )?;
        let executor = OperationLog::new("bridge", executor);

        let mut bridge = Self::new(Arc::new(executor))?.with_options(config.connect_options());
        bridge.rewrite = config.rewrite.clone();
        Ok(bridge)
    }

    /// Open selection streams over a custom transport
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Rewrite advertised stream URLs from `from` to `to`
    pub fn with_rewrite(mut self, rewrite: UrlRewrite) -> Self {
        self.rewrite = Some(rewrite);
        self
    }

    /// Connection options for selection streams; credentials are always off
    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options.with_credentials(false);
        self
    }

    /// Start a subscription.
    ///
    /// Must be called from within a tokio runtime. Dropping the returned
    /// [`ResultStream`] tears the subscription down as well.
    pub fn subscribe(&self, request: GraphQlRequest) -> (ResultStream, Teardown) {
        let (results_tx, results) = mpsc::channel(RESULT_BUFFER);
        let shared = Arc::new(Shared {
            cancel: CancellationToken::new(),
            closers: Mutex::new(Vec::new()),
        });

        let span = info_span!(
            "subscription",
            operation = request.operation_name.as_deref().unwrap_or("<anonymous>")
        );
        let driver = Driver {
            executor: self.executor.clone(),
            transport: self.transport.clone(),
            rewrite: self.rewrite.clone(),
            options: self.options.clone(),
            request,
            results_tx,
            shared: shared.clone(),
        };
        tokio::spawn(driver.run().instrument(span));

        (
            ResultStream {
                results,
                shared: shared.clone(),
            },
            Teardown { shared },
        )
    }
}

impl std::fmt::Debug for SubscriptionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionBridge")
            .field("rewrite", &self.rewrite)
            .field("options", &self.options)
            .finish()
    }
}

struct Shared {
    cancel: CancellationToken,
    /// Closers of every stream opened so far
    closers: Mutex<Vec<Closer>>,
}

impl Shared {
    fn teardown(&self) {
        self.cancel.cancel();
        for closer in self.closers.lock().drain(..) {
            closer.close();
        }
    }

    /// Track a new stream; closes it right away if already torn down
    fn register(&self, closer: Closer) -> bool {
        let mut closers = self.closers.lock();
        if self.cancel.is_cancelled() {
            closer.close();
            return false;
        }
        closers.push(closer);
        true
    }
}

/// Handle that ends a subscription
///
/// Closes every selection stream and aborts the registration request if it
/// is still in flight. Safe to call any number of times.
#[derive(Clone)]
pub struct Teardown {
    shared: Arc<Shared>,
}

impl Teardown {
    pub fn teardown(&self) {
        self.shared.teardown();
    }

    pub fn is_torn_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

/// Live results of one subscription
///
/// Yields the full merged result after every patch. Terminal errors are
/// yielded once, after which the stream ends. A failed selection stream
/// yields [`BridgeError::Stream`] and the other selections carry on.
pub struct ResultStream {
    results: mpsc::Receiver<Result<SubscriptionResult>>,
    shared: Arc<Shared>,
}

impl ResultStream {
    /// Next result, or `None` once the subscription is over
    pub async fn next_result(&mut self) -> Option<Result<SubscriptionResult>> {
        StreamExt::next(self).await
    }
}

impl Stream for ResultStream {
    type Item = Result<SubscriptionResult>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.shared.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.results.poll_recv(cx)
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

enum SelectionItem {
    Event(Event),
    /// Stream ended; status read right after the last event
    Ended(ConnectionStatus),
}

struct Driver {
    executor: Arc<dyn RequestExecutor>,
    transport: Arc<dyn Transport>,
    rewrite: Option<UrlRewrite>,
    options: ConnectOptions,
    request: GraphQlRequest,
    results_tx: mpsc::Sender<Result<SubscriptionResult>>,
    shared: Arc<Shared>,
}

impl Driver {
    async fn run(self) {
        let cancel = self.shared.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => debug!("Subscription torn down"),
            outcome = self.drive() => {
                if let Err(e) = outcome {
                    warn!(error = %e, "Subscription failed");
                }
            }
        }
    }

    async fn drive(&self) -> Result<()> {
        let (mut result, streams) = match self.register().await {
            Ok(registered) => registered,
            Err(e) => {
                let _ = self.results_tx.send(Err(e.clone())).await;
                return Err(e);
            }
        };

        let mut selections = StreamMap::new();
        for (key, url) in streams {
            let conn = StreamConnection::open_with(self.transport.clone(), url, self.options.clone());
            if !self.shared.register(conn.closer()) {
                return Ok(());
            }
            selections.insert(key, selection_stream(conn));
        }

        if selections.is_empty() {
            info!("No live selections");
            return Ok(());
        }

        while let Some((key, item)) = selections.next().await {
            match item {
                SelectionItem::Event(event) => {
                    if !self.apply(&mut result, &key, &event) {
                        continue;
                    }
                    if self.results_tx.send(Ok(result.clone())).await.is_err() {
                        debug!("Result receiver dropped");
                        break;
                    }
                }
                SelectionItem::Ended(status) if status.state == ConnectionState::Failed => {
                    let error = status.last_error.unwrap_or(StreamError::Closed);
                    warn!(selection = %key, error = %error, "Selection stream failed");
                    let failure = BridgeError::Stream {
                        selection: key,
                        error,
                    };
                    if self.results_tx.send(Err(failure)).await.is_err() {
                        break;
                    }
                }
                SelectionItem::Ended(status) => {
                    debug!(selection = %key, state = ?status.state, "Selection stream ended");
                }
            }
        }

        Ok(())
    }

    /// Submit the request and resolve every selection's stream URL.
    ///
    /// Either every selection resolves or nothing is opened.
    async fn register(&self) -> Result<(SubscriptionResult, Vec<(String, Url)>)> {
        let selections =
            top_level_selections(&self.request.query, self.request.operation_name.as_deref())?;

        let response = self.executor.execute(&self.request).await?;
        let Some(data) = response.data else {
            if response.errors.is_empty() {
                return Err(BridgeError::InvalidResponse("response has no data".into()));
            }
            return Err(BridgeError::GraphQl(
                response.errors.into_iter().map(|e| e.message).collect(),
            ));
        };
        if !response.errors.is_empty() {
            warn!(errors = response.errors.len(), "Subscription response carries errors");
        }

        let mut streams = Vec::with_capacity(selections.len());
        for selection in &selections {
            let key = selection.response_key();
            let Some(value) = data.get(key) else {
                warn!(selection = key, "Selection missing from response data");
                continue;
            };
            streams.push((key.to_string(), self.stream_url(key, value)?));
        }

        let result = SubscriptionResult {
            data,
            errors: response.errors,
        };
        Ok((result, streams))
    }

    fn stream_url(&self, key: &str, value: &Value) -> Result<Url> {
        let advertised = value
            .get(STREAM_URL_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::MissingStreamUrl {
                selection: key.to_string(),
            })?;

        let url = match &self.rewrite {
            Some(rewrite) => rewrite.apply(advertised),
            None => advertised.to_string(),
        };
        debug!(selection = key, advertised, %url, "Resolved stream URL");

        Url::parse(&url).map_err(|e| BridgeError::InvalidStreamUrl {
            selection: key.to_string(),
            url,
            reason: e.to_string(),
        })
    }

    /// Merge a patch event into `result`; false when nothing changed
    fn apply(&self, result: &mut SubscriptionResult, key: &str, event: &Event) -> bool {
        if !event.is(GQL_SUBSCRIPTION) {
            trace!(selection = key, event_type = %event.event_type, "Ignoring event");
            return false;
        }
        let Some(patch) = event.first_data() else {
            warn!(selection = key, "Patch event without JSON data");
            return false;
        };
        if !result.merge_patch(key, patch) {
            warn!(selection = key, "Patch is not an object or selection is not an object");
            return false;
        }
        trace!(selection = key, id = %event.id, "Applied patch");
        true
    }
}

fn selection_stream(conn: StreamConnection) -> BoxStream<'static, SelectionItem> {
    let status = conn.watch_status();
    conn.map(SelectionItem::Event)
        .chain(stream::once(async move {
            SelectionItem::Ended(status.borrow().clone())
        }))
        .boxed()
}
