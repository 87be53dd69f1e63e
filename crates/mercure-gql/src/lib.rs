//! GraphQL subscriptions over Mercure
//!
//! A subscription is registered with one ordinary GraphQL request. The API
//! answers with a `mercureUrl` per top-level selection; [`SubscriptionBridge`]
//! follows those hub streams and yields the accumulated result after every
//! `gqlsubs` patch.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use mercure_gql::{BridgeConfig, GraphQlRequest, SubscriptionBridge};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::for_api("https://api.example.com")
//!         .with_rewrite("http://caddy/", "https://hub.example.com/");
//!     let bridge = SubscriptionBridge::from_config(&config)?;
//!
//!     let request = GraphQlRequest::new(
//!         "subscription OnPost { updatePostSubscribe(input: {id: \"/posts/1\"}) { post { title } mercureUrl } }",
//!     );
//!     let (mut results, teardown) = bridge.subscribe(request);
//!
//!     while let Some(result) = results.next().await {
//!         println!("{:?}", result?.data);
//!     }
//!
//!     teardown.teardown();
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod document;
mod error;
pub mod executor;
pub mod rewrite;
pub mod types;

pub use bridge::{ResultStream, SubscriptionBridge, Teardown};
pub use config::BridgeConfig;
pub use document::{top_level_selections, Operation, OperationKind, Selection};
pub use error::{BridgeError, Result};
pub use executor::{HttpExecutor, OperationLog, RequestExecutor};
pub use rewrite::UrlRewrite;
pub use types::{GraphQlError, GraphQlRequest, GraphQlResponse, SubscriptionResult};
