//! Insert/delete tracking over typed resource events
//!
//! A [`DeltaTracker`] consumes one or more stream connections and records the
//! identifiers of created and deleted resources in two insertion-ordered sets.
//! The sets are not reconciled: an id created and then deleted inside the
//! tracked window appears in both. Tracking ends on [`DeltaTracker::stop`] or
//! once every connection has ended; a connection that failed for good is
//! reported by [`DeltaTracker::failure`].

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::connection::{
    Closer, ConnectOptions, ConnectionState, ConnectionStatus, StreamConnection,
};
use crate::error::{Result, StreamError};
use crate::event::{Event, CREATE, DELETE, MESSAGE, RESOURCE_ID_FIELD};
use crate::transport::{HttpTransport, Transport};

/// Set of ids that remembers insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OrderedSet {
    items: Vec<String>,
    #[serde(skip)]
    index: HashSet<String>,
}

impl OrderedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id`; returns false when it was already present
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.index.contains(&id) {
            return false;
        }
        self.index.insert(id.clone());
        self.items.push(id);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.items.clone()
    }
}

/// The pair of sets maintained by a tracker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeltaSets {
    pub inserted: OrderedSet,
    pub deleted: OrderedSet,
}

/// Which set an event feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Inserted,
    Deleted,
}

impl DeltaKind {
    /// Classify an event; untyped `message` events take `fallback`
    fn of(event: &Event, fallback: Option<DeltaKind>) -> Option<DeltaKind> {
        match event.event_type.as_str() {
            CREATE => Some(DeltaKind::Inserted),
            DELETE => Some(DeltaKind::Deleted),
            MESSAGE => fallback,
            _ => None,
        }
    }
}

enum Item {
    Event(Option<DeltaKind>, Event),
    /// A source connection ended (closed or failed)
    Ended(usize),
}

struct Inner {
    sets: RwLock<DeltaSets>,
    version: watch::Sender<u64>,
    cancel: CancellationToken,
    id_field: String,
}

impl Inner {
    fn apply(&self, event: &Event, fallback: Option<DeltaKind>) {
        let Some(kind) = DeltaKind::of(event, fallback) else {
            trace!(event_type = %event.event_type, "Ignoring event for delta tracking");
            return;
        };

        let Some(id) = event.resource_id(&self.id_field) else {
            warn!(
                event_type = %event.event_type,
                field = %self.id_field,
                "Event carries no resource identifier"
            );
            return;
        };

        let changed = {
            let mut sets = self.sets.write();
            // A stopped tracker must not change anymore
            if self.cancel.is_cancelled() {
                return;
            }
            match kind {
                DeltaKind::Inserted => sets.inserted.insert(id),
                DeltaKind::Deleted => sets.deleted.insert(id),
            }
        };

        if changed {
            debug!(?kind, id, "Delta recorded");
            self.bump();
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

/// Tracks created and deleted resource ids from live events
pub struct DeltaTracker {
    inner: Arc<Inner>,
    closers: Vec<Closer>,
    statuses: Vec<watch::Receiver<ConnectionStatus>>,
    changes: watch::Receiver<u64>,
}

impl DeltaTracker {
    /// Track `create`/`delete` events of one connection.
    ///
    /// Identifiers are read from the `@id` field of each event's first data value.
    pub fn track(connection: StreamConnection) -> Self {
        Self::track_with(connection, RESOURCE_ID_FIELD)
    }

    /// Track one connection, reading identifiers from `id_field`
    pub fn track_with(connection: StreamConnection, id_field: impl Into<String>) -> Self {
        Self::spawn(vec![(connection, None)], id_field.into())
    }

    /// Track a topic through its `#create` and `#delete` fragment topics.
    ///
    /// `topic_url` is a hub URL whose `topic` parameter is the last query
    /// parameter; the fragment is appended to it. Untyped events on each
    /// fragment stream count as creates and deletes respectively.
    pub fn track_fragments(topic_url: &str, options: ConnectOptions) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
        Self::track_fragments_with(transport, topic_url, options, RESOURCE_ID_FIELD)
    }

    /// [`track_fragments`](Self::track_fragments) over a custom transport
    pub fn track_fragments_with(
        transport: Arc<dyn Transport>,
        topic_url: &str,
        options: ConnectOptions,
        id_field: impl Into<String>,
    ) -> Result<Self> {
        let create_url = Url::parse(&fragment_url(topic_url, CREATE))?;
        let delete_url = Url::parse(&fragment_url(topic_url, DELETE))?;

        let creates = StreamConnection::open_with(transport.clone(), create_url, options.clone());
        let deletes = StreamConnection::open_with(transport, delete_url, options);

        Ok(Self::spawn(
            vec![
                (creates, Some(DeltaKind::Inserted)),
                (deletes, Some(DeltaKind::Deleted)),
            ],
            id_field.into(),
        ))
    }

    fn spawn(sources: Vec<(StreamConnection, Option<DeltaKind>)>, id_field: String) -> Self {
        let (version, changes) = watch::channel(0);
        let inner = Arc::new(Inner {
            sets: RwLock::new(DeltaSets::default()),
            version,
            cancel: CancellationToken::new(),
            id_field,
        });

        let closers = sources.iter().map(|(c, _)| c.closer()).collect();
        let statuses: Vec<_> = sources.iter().map(|(c, _)| c.watch_status()).collect();
        let merged: Vec<BoxStream<'static, Item>> = sources
            .into_iter()
            .enumerate()
            .map(|(index, (connection, fallback))| {
                connection
                    .map(move |e| Item::Event(fallback, e))
                    .chain(stream::once(async move { Item::Ended(index) }))
                    .boxed()
            })
            .collect();
        let mut merged = stream::select_all(merged);

        let task_inner = inner.clone();
        let task_statuses = statuses.clone();
        tokio::spawn(async move {
            let cancel = task_inner.cancel.clone();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    item = merged.next() => match item {
                        Some(Item::Event(fallback, event)) => task_inner.apply(&event, fallback),
                        Some(Item::Ended(index)) => {
                            let status = task_statuses[index].borrow().clone();
                            if status.state == ConnectionState::Failed {
                                warn!(error = ?status.last_error, "Tracked connection failed");
                                task_inner.bump();
                            }
                        }
                        None => {
                            // Every source ended
                            task_inner.cancel.cancel();
                            task_inner.bump();
                            break;
                        }
                    },
                }
            }
            debug!("Delta tracking finished");
        });

        Self {
            inner,
            closers,
            statuses,
            changes,
        }
    }

    /// Ids seen in `create` events, in arrival order
    pub fn inserted(&self) -> Vec<String> {
        self.inner.sets.read().inserted.to_vec()
    }

    /// Ids seen in `delete` events, in arrival order
    pub fn deleted(&self) -> Vec<String> {
        self.inner.sets.read().deleted.to_vec()
    }

    pub fn snapshot(&self) -> DeltaSets {
        self.inner.sets.read().clone()
    }

    /// Clear both sets; the underlying connections stay open
    pub fn reset(&self) {
        {
            let mut sets = self.inner.sets.write();
            sets.inserted.clear();
            sets.deleted.clear();
        }
        self.inner.version.send_modify(|v| *v += 1);
    }

    /// Version counter bumped on every change: new ids, resets, a tracked
    /// connection failing and tracking ending
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    /// False after [`stop`](Self::stop) or once every connection has ended
    pub fn is_tracking(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Status of every tracked connection
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Terminal error of the first tracked connection that failed
    pub fn failure(&self) -> Option<StreamError> {
        self.statuses.iter().find_map(|rx| {
            let status = rx.borrow();
            match status.state {
                ConnectionState::Failed => status.last_error.clone(),
                _ => None,
            }
        })
    }

    /// Stop tracking and close the underlying connections.
    ///
    /// The sets keep their last contents and never change afterwards.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        // Connections that already ended keep their final status
        for closer in self.closers.iter().filter(|c| !c.is_closed()) {
            closer.close();
        }
        // Wait out an update that raced with cancellation
        drop(self.inner.sets.write());
    }
}

impl Drop for DeltaTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fragment_url(topic_url: &str, fragment: &str) -> String {
    format!("{}%23{}", topic_url, fragment)
}
