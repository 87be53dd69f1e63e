//! Mercure live-update client
//!
//! Resumable Server-Sent Events connections to a Mercure hub, plus the
//! pieces built on top of them:
//!
//! - [`StreamConnection`]: one connection with a CONNECTING / OPEN / RETRYING /
//!   CLOSED / FAILED state machine, `lastEventID` resumption and a
//!   configurable [`BackoffPolicy`]
//! - [`FrameParser`]: incremental `text/event-stream` decoder
//! - [`DeltaTracker`]: ordered sets of created and deleted resource ids
//! - [`TopicRegistry`]: one shared connection per topic
//! - [`Reachability`]: debounced online/offline signal that suspends and
//!   resumes connections
//!
//! # Example
//!
//! ```rust,no_run
//! use mercure_client::{BackoffPolicy, ConnectOptions, StreamConnection};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = ConnectOptions::new()
//!         .with_backoff(BackoffPolicy::schedule(["1s", "2s", "infinite"]));
//!
//!     let mut conn = StreamConnection::open(
//!         "https://hub.example.com/.well-known/mercure?topic=https%3A%2F%2Fapi.example.com%2Fposts%2F%7Bid%7D",
//!         options,
//!     )?;
//!
//!     while let Some(event) = conn.next_event().await {
//!         println!("{} {} {:?}", event.event_type, event.id, event.parsed_data);
//!     }
//!
//!     println!("stream ended: {:?}", conn.status());
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! The `testing` module provides a scripted transport and a local hub:
//!
//! ```rust,ignore
//! use mercure_client::testing::ScriptedTransport;
//!
//! let transport = ScriptedTransport::new();
//! let feed = transport.accept_next();
//! let conn = StreamConnection::open_with(transport.clone(), url, options);
//! feed.send("id: 1\ndata: {}\n\n");
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod delta;
mod error;
pub mod event;
pub mod parser;
pub mod reachability;
pub mod signals;
pub mod testing;
pub mod topics;
pub mod transport;

pub use backoff::{Backoff, BackoffPolicy, PolicyError};
pub use config::{ConfigError, ConnectionConfig, HubConfig, HubEndpoints, LiveConfig};
pub use connection::{
    resumption_url, Closer, ConnectOptions, ConnectionState, ConnectionStatus, StreamConnection,
};
pub use delta::{DeltaSets, DeltaTracker, OrderedSet};
pub use error::{Result, StreamError};
pub use event::Event;
pub use parser::{FrameParser, ParseError};
pub use reachability::{DebounceConfig, NetworkState, Reachability};
pub use signals::{Signal, SignalRegistry};
pub use topics::{TopicEvent, TopicRegistry};
pub use transport::{ByteStream, HttpTransport, Transport};
