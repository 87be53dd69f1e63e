//! Per-topic connection cache
//!
//! Opening the same topic twice shares one hub connection. Every subscriber
//! receives a [`TopicEvent`] per delivered frame through a broadcast channel.
//! When a connection fails for good its receivers end, [`TopicRegistry::status`]
//! keeps reporting the failure, and the next [`TopicRegistry::for_topic`] call
//! opens a fresh connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::config::HubEndpoints;
use crate::connection::{
    Closer, ConnectOptions, ConnectionState, ConnectionStatus, StreamConnection,
};
use crate::error::Result;
use crate::event::{Event, RESOURCE_ID_FIELD};
use crate::transport::{HttpTransport, Transport};

/// Default broadcast capacity per topic
const DEFAULT_CAPACITY: usize = 128;

/// Summary of one frame received on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEvent {
    /// Resumption position after this frame
    #[serde(rename = "lastEventID")]
    pub last_event_id: String,

    /// Frame type (`create`, `update`, `delete`, ...)
    #[serde(rename = "apiEventType")]
    pub event_type: String,

    /// Identifier of the affected resource, when the payload carries one
    #[serde(rename = "apiResourceID")]
    pub resource_id: Option<String>,
}

impl TopicEvent {
    fn from_event(event: &Event, last_event_id: String, id_field: &str) -> Self {
        Self {
            last_event_id,
            event_type: event.event_type.clone(),
            resource_id: event.resource_id(id_field).map(str::to_string),
        }
    }
}

type Topics = Arc<RwLock<HashMap<String, TopicEntry>>>;

struct TopicEntry {
    /// Distinguishes a reopened connection from the one it replaced
    generation: u64,
    /// `None` once the connection has ended
    sender: Option<broadcast::Sender<TopicEvent>>,
    closer: Closer,
    status: tokio::sync::watch::Receiver<ConnectionStatus>,
}

impl TopicEntry {
    fn subscribe(&self) -> Option<broadcast::Receiver<TopicEvent>> {
        self.sender.as_ref().map(broadcast::Sender::subscribe)
    }

    fn is_live(&self) -> bool {
        self.sender.is_some()
    }
}

/// Cache of hub connections keyed by topic
pub struct TopicRegistry {
    endpoints: HubEndpoints,
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    id_field: String,
    capacity: usize,
    generation: AtomicU64,
    topics: Topics,
}

impl TopicRegistry {
    /// Registry over HTTP
    pub fn new(endpoints: HubEndpoints, options: ConnectOptions) -> Result<Self> {
        let transport = HttpTransport::new()?;
        Ok(Self::with_transport(endpoints, Arc::new(transport), options))
    }

    /// Registry over a custom transport
    pub fn with_transport(
        endpoints: HubEndpoints,
        transport: Arc<dyn Transport>,
        options: ConnectOptions,
    ) -> Self {
        Self {
            endpoints,
            transport,
            options,
            id_field: RESOURCE_ID_FIELD.to_string(),
            capacity: DEFAULT_CAPACITY,
            generation: AtomicU64::new(0),
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Read resource identifiers from `field` instead of `@id`
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn endpoints(&self) -> &HubEndpoints {
        &self.endpoints
    }

    /// Subscribe to `topic`, opening its connection on first use.
    ///
    /// A topic whose connection has ended is reopened. Must be called from
    /// within a tokio runtime.
    pub fn for_topic(&self, topic: &str) -> broadcast::Receiver<TopicEvent> {
        if let Some(receiver) = self.topics.read().get(topic).and_then(TopicEntry::subscribe) {
            return receiver;
        }

        let mut topics = self.topics.write();
        // Another caller may have opened it between the two locks
        if let Some(receiver) = topics.get(topic).and_then(TopicEntry::subscribe) {
            return receiver;
        }
        if let Some(ended) = topics.remove(topic) {
            debug!(topic = %topic, state = ?ended.status.borrow().state, "Reopening ended topic");
        }

        let url = self.endpoints.subscribe_url(topic);
        let connection =
            StreamConnection::open_with(self.transport.clone(), url, self.options.clone());
        let (sender, receiver) = broadcast::channel(self.capacity);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        topics.insert(
            topic.to_string(),
            TopicEntry {
                generation,
                sender: Some(sender.clone()),
                closer: connection.closer(),
                status: connection.watch_status(),
            },
        );
        info!(topic = %topic, "Topic connection opened");

        tokio::spawn(forward(
            Forward {
                topic: topic.to_string(),
                generation,
                topics: self.topics.clone(),
                id_field: self.id_field.clone(),
            },
            connection,
            sender,
        ));

        receiver
    }

    /// Connection status of a cached topic.
    ///
    /// A topic that failed for good reports FAILED until it is reopened or
    /// released.
    pub fn status(&self, topic: &str) -> Option<ConnectionStatus> {
        self.topics
            .read()
            .get(topic)
            .map(|entry| entry.status.borrow().clone())
    }

    /// Topics with a live connection
    pub fn topics(&self) -> Vec<String> {
        self.topics
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Whether `topic` has a live connection
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.read().get(topic).is_some_and(TopicEntry::is_live)
    }

    /// Close and forget one topic; returns false if it was not cached
    pub fn release(&self, topic: &str) -> bool {
        match self.topics.write().remove(topic) {
            Some(entry) => {
                entry.closer.close();
                info!(topic = %topic, "Topic connection released");
                true
            }
            None => false,
        }
    }

    /// Close every cached connection
    pub fn shutdown(&self) {
        let entries: Vec<_> = self.topics.write().drain().collect();
        for (topic, entry) in entries {
            entry.closer.close();
            debug!(topic = %topic, "Topic connection closed");
        }
    }
}

impl Drop for TopicRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Forward {
    topic: String,
    generation: u64,
    topics: Topics,
    id_field: String,
}

async fn forward(
    ctx: Forward,
    mut connection: StreamConnection,
    sender: broadcast::Sender<TopicEvent>,
) {
    while let Some(event) = connection.next().await {
        let summary = TopicEvent::from_event(&event, connection.last_event_id(), &ctx.id_field);
        if sender.send(summary).is_err() {
            trace!(topic = %ctx.topic, "No subscribers for topic event");
        }
    }

    let status = connection.status();
    // Drop the registry's sender so receivers see the channel close
    if let Some(entry) = ctx.topics.write().get_mut(&ctx.topic) {
        if entry.generation == ctx.generation {
            entry.sender = None;
        }
    }

    match (status.state, &status.last_error) {
        (ConnectionState::Failed, Some(e)) => {
            warn!(topic = %ctx.topic, error = %e, "Topic connection failed")
        }
        (state, _) => debug!(topic = %ctx.topic, ?state, "Topic stream ended"),
    }
}
