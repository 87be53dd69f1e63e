//! Transport seam between a stream connection and the network
//!
//! [`StreamConnection`](crate::StreamConnection) only sees a [`Transport`]: a
//! factory for byte streams. The HTTP implementation speaks SSE over reqwest;
//! tests plug in a scripted transport instead.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::connection::ConnectOptions;
use crate::error::{Result, StreamError};

/// Body of an opened event stream
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Opens event streams
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a stream at `url`.
    ///
    /// Returning `Ok` is the "opened" signal: the server accepted the request
    /// and the body is ready to be read.
    async fn open(&self, url: &Url, options: &ConnectOptions) -> Result<ByteStream>;
}

/// SSE over HTTP
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with its own HTTP client
    pub fn new() -> Result<Self> {
        // No overall timeout: event streams are long-lived responses
        let client = Client::builder().build()?;
        Ok(Self { client })
    }

    /// Reuse an existing HTTP client (connection pool, default headers)
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &Url, options: &ConnectOptions) -> Result<ByteStream> {
        debug!(%url, "Connecting to event stream");

        let mut request = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");

        if options.with_credentials {
            if let Some(token) = &options.bearer_token {
                request = request.bearer_auth(token);
            }
        }

        let response = tokio::time::timeout(options.connect_timeout, request.send())
            .await
            .map_err(|_| StreamError::Timeout)??;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(StreamError::server(status, message));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            return Err(StreamError::ContentType(content_type));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StreamError::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_creation() {
        assert!(HttpTransport::new().is_ok());
    }
}
