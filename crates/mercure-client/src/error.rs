//! Error types for stream connections

use thiserror::Error;

use crate::backoff::PolicyError;
use crate::parser::ParseError;

/// Result type alias for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors observed by a stream connection
///
/// Values are published on status channels, so the type is `Clone` and carries
/// messages rather than foreign error values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    /// HTTP/connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect attempt timed out
    #[error("Connection timed out")]
    Timeout,

    /// Server answered with a non-success status
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Server answered with something other than an event stream
    #[error("Unexpected content type: {0}")]
    ContentType(String),

    /// Malformed frame boundary
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Server ended the response
    #[error("Stream closed by server")]
    Closed,

    /// Environment reported the network as unreachable
    #[error("Network offline")]
    Offline,

    /// Backoff policy gave up
    #[error("Retries exhausted after {attempts} attempt(s), last error: {cause}")]
    Exhausted {
        attempts: u32,
        cause: Box<StreamError>,
    },

    /// Backoff policy could not be evaluated
    #[error("Bad backoff configuration: {0}")]
    BadPolicy(#[from] PolicyError),

    /// Invalid stream URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl StreamError {
    /// Whether the error ends the connection for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::BadPolicy(_))
    }

    /// Create a server error from status code and message
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Connection(e.to_string())
        }
    }
}

impl From<url::ParseError> for StreamError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}
