//! Error types for the subscription bridge

use mercure_client::{ConfigError, StreamError};
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by a subscription
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// Registration request could not be sent or completed
    #[error("Request failed: {0}")]
    Request(String),

    /// Endpoint answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Endpoint answered with something that is not a GraphQL response
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Response carried errors and no data
    #[error("GraphQL errors: {}", .0.join("; "))]
    GraphQl(Vec<String>),

    /// Request document could not be read
    #[error("Invalid document: {0}")]
    Document(String),

    /// A selection came back without a stream URL
    #[error("Selection '{selection}' has no mercureUrl")]
    MissingStreamUrl { selection: String },

    /// A selection advertised a URL that does not parse after rewriting
    #[error("Selection '{selection}' advertised an invalid stream URL '{url}': {reason}")]
    InvalidStreamUrl {
        selection: String,
        url: String,
        reason: String,
    },

    /// The stream feeding one selection failed for good
    #[error("Stream for selection '{selection}' failed: {error}")]
    Stream { selection: String, error: StreamError },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Whether the error ends the whole subscription.
    ///
    /// A failed selection stream only ends that selection.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Stream { .. })
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}
