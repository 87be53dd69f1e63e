//! Resumable event-stream connection
//!
//! A [`StreamConnection`] owns one physical connection to one URL and keeps it
//! alive according to its [`BackoffPolicy`]. All transitions run on a single
//! driver task, so the state machine is evaluated strictly sequentially:
//!
//! ```text
//! StreamConnection::open(url, options)
//!   └─ spawns driver ──► CONNECTING ──► OPEN ──(error)──► RETRYING ──(delay)──► CONNECTING
//!        │                                   │                  └──(stop)──► FAILED
//!        ├── events  ◄── mpsc ◄──────────────┘
//!        └── status  ◄── watch (state, attempt, lastEventID, lastError)
//! ```
//!
//! `close()` moves the connection to CLOSED from any state.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::{with_jitter, Backoff, BackoffPolicy};
use crate::error::{Result, StreamError};
use crate::event::Event;
use crate::parser::{FrameParser, DEFAULT_MAX_LINE};
use crate::reachability::NetworkState;
use crate::transport::{ByteStream, HttpTransport, Transport};

/// Query parameter carrying the resumption position
pub const LAST_EVENT_ID_PARAM: &str = "lastEventID";

/// Default connect timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default capacity of the event channel
const DEFAULT_BUFFER: usize = 256;

/// Lifecycle state of a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Open,
    Retrying,
    Closed,
    Failed,
}

/// Snapshot published after every transition
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Retry counter, reset to 0 on every successful open
    pub attempt: u32,
    /// Most recent non-empty event id
    pub last_event_id: String,
    pub last_error: Option<StreamError>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connecting,
            attempt: 0,
            last_event_id: String::new(),
            last_error: None,
        }
    }
}

/// Options for a single connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Send credentials (the bearer token) with the request
    pub with_credentials: bool,
    pub bearer_token: Option<String>,
    pub backoff: BackoffPolicy,
    /// Upper bound of the uniform jitter added to every retry delay
    pub jitter: Duration,
    pub connect_timeout: Duration,
    /// Capacity of the event channel
    pub buffer: usize,
    /// Longest accepted unterminated line
    pub max_line: usize,
    /// Debounced network reachability, if the environment reports it
    pub reachability: Option<watch::Receiver<NetworkState>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            with_credentials: false,
            bearer_token: None,
            backoff: BackoffPolicy::default(),
            jitter: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer: DEFAULT_BUFFER,
            max_line: DEFAULT_MAX_LINE,
            reachability: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.with_credentials = with_credentials;
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reachability(mut self, reachability: watch::Receiver<NetworkState>) -> Self {
        self.reachability = Some(reachability);
        self
    }
}

/// Build the URL used to (re)open a stream.
///
/// A non-empty `last_event_id` is appended as the `lastEventID` query
/// parameter, URL-encoded.
pub fn resumption_url(base: &Url, last_event_id: &str) -> Url {
    let mut url = base.clone();
    if !last_event_id.is_empty() {
        url.query_pairs_mut()
            .append_pair(LAST_EVENT_ID_PARAM, last_event_id);
    }
    url
}

struct Shared {
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
}

impl Shared {
    fn close(&self) {
        self.cancel.cancel();
        self.status.send_if_modified(|status| {
            if status.state == ConnectionState::Closed {
                return false;
            }
            status.state = ConnectionState::Closed;
            true
        });
    }

    /// Close on drop: a FAILED connection keeps its final status
    fn release(&self) {
        self.cancel.cancel();
        self.status.send_if_modified(|status| match status.state {
            ConnectionState::Closed | ConnectionState::Failed => false,
            _ => {
                status.state = ConnectionState::Closed;
                true
            }
        });
    }
}

/// Cloneable handle that closes a connection from elsewhere
#[derive(Clone)]
pub struct Closer {
    shared: Arc<Shared>,
}

impl Closer {
    /// Close the connection (idempotent)
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A live, resumable event stream
///
/// Implements `Stream<Item = Event>`. The stream ends when the connection is
/// closed or fails for good; inspect [`status`](Self::status) to tell which.
pub struct StreamConnection {
    url: Url,
    events: mpsc::Receiver<Event>,
    status: watch::Receiver<ConnectionStatus>,
    shared: Arc<Shared>,
}

impl StreamConnection {
    /// Open a connection over HTTP.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(url: &str, options: ConnectOptions) -> Result<Self> {
        let url = Url::parse(url)?;
        let transport = HttpTransport::new()?;
        Ok(Self::open_with(Arc::new(transport), url, options))
    }

    /// Open a connection over a custom transport
    pub fn open_with(transport: Arc<dyn Transport>, url: Url, options: ConnectOptions) -> Self {
        let (events_tx, events) = mpsc::channel(options.buffer.max(1));
        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let shared = Arc::new(Shared {
            status: status_tx,
            cancel: CancellationToken::new(),
        });

        let driver = Driver {
            transport,
            base_url: url.clone(),
            parser: FrameParser::with_max_line(options.max_line),
            reachability: options.reachability.clone(),
            options,
            events_tx,
            shared: shared.clone(),
            last_event_id: String::new(),
            attempt: 0,
        };
        tokio::spawn(driver.run());

        Self {
            url,
            events,
            status,
            shared,
        }
    }

    /// Stream URL as given to `open` (without resumption parameter)
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Current status snapshot
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn attempt(&self) -> u32 {
        self.status.borrow().attempt
    }

    pub fn last_event_id(&self) -> String {
        self.status.borrow().last_event_id.clone()
    }

    pub fn last_error(&self) -> Option<StreamError> {
        self.status.borrow().last_error.clone()
    }

    /// Observe status changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `f`
    pub async fn wait_for<F>(&self, f: F) -> ConnectionStatus
    where
        F: FnMut(&ConnectionStatus) -> bool,
    {
        let mut rx = self.status.clone();
        // The sender lives in `self.shared`, so the channel cannot close here
        let status = match rx.wait_for(f).await {
            Ok(status) => ConnectionStatus::clone(&status),
            Err(_) => self.status(),
        };
        status
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for_state(&self, state: ConnectionState) -> ConnectionStatus {
        self.wait_for(|s| s.state == state).await
    }

    /// Get the next event.
    ///
    /// Returns `None` once the connection is closed or failed.
    pub async fn next_event(&mut self) -> Option<Event> {
        StreamExt::next(self).await
    }

    /// Close the connection.
    ///
    /// Idempotent and safe in any state: cancels a pending reconnect timer,
    /// releases the transport and leaves the state at CLOSED.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Handle for closing this connection after it has been moved
    pub fn closer(&self) -> Closer {
        Closer {
            shared: self.shared.clone(),
        }
    }
}

impl Stream for StreamConnection {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.shared.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("url", &self.url.as_str())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

enum Phase {
    Connect,
    Open(ByteStream),
    Backoff(Duration),
    Offline,
    Done,
}

struct Driver {
    transport: Arc<dyn Transport>,
    base_url: Url,
    options: ConnectOptions,
    parser: FrameParser,
    events_tx: mpsc::Sender<Event>,
    shared: Arc<Shared>,
    reachability: Option<watch::Receiver<NetworkState>>,
    last_event_id: String,
    attempt: u32,
}

impl Driver {
    async fn run(mut self) {
        let mut phase = match &self.reachability {
            Some(rx) if *rx.borrow() == NetworkState::Offline => Phase::Offline,
            _ => Phase::Connect,
        };

        loop {
            phase = match phase {
                Phase::Connect => self.connect().await,
                Phase::Open(stream) => self.pump(stream).await,
                Phase::Backoff(delay) => self.backoff(delay).await,
                Phase::Offline => self.offline().await,
                Phase::Done => break,
            };
        }

        debug!(url = %self.base_url, "Stream driver finished");
    }

    /// Apply a change to the published status unless the caller closed us
    fn publish(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        self.shared.status.send_if_modified(|status| {
            if status.state == ConnectionState::Closed {
                return false;
            }
            f(status);
            true
        });
    }

    async fn connect(&mut self) -> Phase {
        let url = resumption_url(&self.base_url, &self.last_event_id);
        let attempt = self.attempt;
        self.publish(|s| {
            s.state = ConnectionState::Connecting;
            s.attempt = attempt;
        });
        debug!(%url, attempt, "Opening event stream");

        let cancel = self.shared.cancel.clone();
        let result = {
            let open = self.transport.open(&url, &self.options);
            tokio::pin!(open);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Phase::Done,
                    state = next_reachability(&mut self.reachability) => {
                        if state == NetworkState::Offline {
                            return Phase::Offline;
                        }
                    }
                    result = &mut open => break result,
                }
            }
        };

        match result {
            Ok(stream) => {
                info!(%url, "Event stream open");
                self.attempt = 0;
                self.publish(|s| {
                    s.state = ConnectionState::Open;
                    s.attempt = 0;
                    s.last_error = None;
                });
                Phase::Open(stream)
            }
            Err(e) => self.on_error(e),
        }
    }

    async fn pump(&mut self, mut stream: ByteStream) -> Phase {
        let cancel = self.shared.cancel.clone();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Phase::Done,
                state = next_reachability(&mut self.reachability) => {
                    if state == NetworkState::Offline {
                        return Phase::Offline;
                    }
                    continue;
                }
                chunk = stream.next() => chunk,
            };

            let events = match chunk {
                Some(Ok(bytes)) => match self.parser.feed(bytes) {
                    Ok(events) => events,
                    Err(e) => {
                        drop(stream);
                        return self.on_error(e.into());
                    }
                },
                Some(Err(e)) => {
                    drop(stream);
                    return self.on_error(e);
                }
                None => {
                    drop(stream);
                    return self.on_error(StreamError::Closed);
                }
            };

            for event in events {
                // Record the position before handing the event out
                if event.has_id() {
                    self.last_event_id = event.id.clone();
                    let id = event.id.clone();
                    self.publish(|s| s.last_event_id = id);
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Phase::Done,
                    sent = self.events_tx.send(event) => {
                        if sent.is_err() {
                            return Phase::Done;
                        }
                    }
                }
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Phase {
        debug!(url = %self.base_url, attempt = self.attempt, ?delay, "Reconnect scheduled");
        let cancel = self.shared.cancel.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Phase::Done,
                state = next_reachability(&mut self.reachability) => {
                    if state == NetworkState::Offline {
                        return Phase::Offline;
                    }
                }
                _ = &mut sleep => return Phase::Connect,
            }
        }
    }

    async fn offline(&mut self) -> Phase {
        info!(url = %self.base_url, "Network offline, stream suspended");
        self.parser.reset();
        self.attempt = 0;
        self.publish(|s| {
            s.state = ConnectionState::Retrying;
            s.attempt = 0;
            s.last_error = Some(StreamError::Offline);
        });

        let cancel = self.shared.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Phase::Done,
                state = next_reachability(&mut self.reachability) => {
                    if state == NetworkState::Online {
                        info!(url = %self.base_url, "Network back online, reconnecting");
                        self.attempt = 1;
                        return Phase::Connect;
                    }
                }
            }
        }
    }

    fn on_error(&mut self, err: StreamError) -> Phase {
        self.parser.reset();
        let next = self.attempt.saturating_add(1);
        warn!(url = %self.base_url, attempt = next, error = %err, "Event stream error");

        match self.options.backoff.next(next) {
            Ok(Backoff::Retry(delay)) => {
                self.attempt = next;
                self.publish(|s| {
                    s.state = ConnectionState::Retrying;
                    s.attempt = next;
                    s.last_error = Some(err);
                });
                Phase::Backoff(with_jitter(delay, self.options.jitter))
            }
            Ok(Backoff::Stop) => {
                let failure = StreamError::Exhausted {
                    attempts: self.attempt,
                    cause: Box::new(err),
                };
                error!(url = %self.base_url, error = %failure, "Event stream failed");
                self.fail(failure)
            }
            Err(e) => {
                let failure = StreamError::BadPolicy(e);
                error!(url = %self.base_url, error = %failure, "Event stream failed");
                self.fail(failure)
            }
        }
    }

    fn fail(&mut self, failure: StreamError) -> Phase {
        self.publish(|s| {
            s.state = ConnectionState::Failed;
            s.last_error = Some(failure);
        });
        Phase::Done
    }
}

/// Resolve with the next reachability value, or never when none is configured.
///
/// A dropped reachability source counts as online and stops being watched.
async fn next_reachability(rx: &mut Option<watch::Receiver<NetworkState>>) -> NetworkState {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    if receiver.changed().await.is_ok() {
        return *receiver.borrow_and_update();
    }
    *rx = None;
    NetworkState::Online
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumption_url_without_query() {
        let base = Url::parse("https://hub.local/.well-known/mercure").unwrap();
        assert_eq!(resumption_url(&base, ""), base);
        assert_eq!(
            resumption_url(&base, "urn:uuid:1").as_str(),
            "https://hub.local/.well-known/mercure?lastEventID=urn%3Auuid%3A1"
        );
    }

    #[test]
    fn test_resumption_url_with_query() {
        let base = Url::parse("https://hub.local/hub?topic=x").unwrap();
        assert_eq!(
            resumption_url(&base, "a b&c").as_str(),
            "https://hub.local/hub?topic=x&lastEventID=a+b%26c"
        );
    }

    #[test]
    fn test_resumption_does_not_accumulate() {
        let base = Url::parse("https://hub.local/hub?topic=x").unwrap();
        let first = resumption_url(&base, "1");
        let second = resumption_url(&base, "2");
        assert_eq!(first.as_str(), "https://hub.local/hub?topic=x&lastEventID=1");
        assert_eq!(second.as_str(), "https://hub.local/hub?topic=x&lastEventID=2");
    }

    #[test]
    fn test_options_builder() {
        let options = ConnectOptions::new()
            .with_backoff(BackoffPolicy::schedule(["1s"]))
            .with_jitter(Duration::from_millis(500))
            .with_bearer_token("jwt");
        assert!(!options.with_credentials);
        assert_eq!(options.jitter, Duration::from_millis(500));
        assert_eq!(options.bearer_token.as_deref(), Some("jwt"));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Retrying).unwrap(),
            "\"RETRYING\""
        );
    }
}
