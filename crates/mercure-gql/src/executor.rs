//! Request executor seam
//!
//! The bridge submits its registration request through a [`RequestExecutor`].
//! [`HttpExecutor`] POSTs JSON with reqwest; [`OperationLog`] wraps any
//! executor with operation/result tracing.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{BridgeError, Result};
use crate::types::{GraphQlRequest, GraphQlResponse};

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes GraphQL requests
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    async fn execute(&self, request: &GraphQlRequest) -> Result<GraphQlResponse>;
}

/// GraphQL over HTTP POST
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    endpoint: Url,
}

impl HttpExecutor {
    /// Create an executor for `endpoint` with default timeouts
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::with_config(endpoint, DEFAULT_TIMEOUT, None)
    }

    /// Create an executor with a request timeout and an optional bearer token
    pub fn with_config(
        endpoint: &str,
        timeout: Duration,
        bearer_token: Option<&str>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| BridgeError::Request(format!("Invalid auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self::with_client(client, parse_endpoint(endpoint)?))
    }

    /// Reuse an existing HTTP client
    pub fn with_client(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url> {
    Url::parse(endpoint).map_err(|e| BridgeError::Request(format!("Invalid endpoint {}: {}", endpoint, e)))
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    #[instrument(skip(self, request), fields(endpoint = %self.endpoint))]
    async fn execute(&self, request: &GraphQlRequest) -> Result<GraphQlResponse> {
        debug!("Submitting GraphQL request");
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(response, status).await);
        }

        response
            .json::<GraphQlResponse>()
            .await
            .map_err(|e| BridgeError::InvalidResponse(e.to_string()))
    }
}

async fn status_error(response: reqwest::Response, status: StatusCode) -> BridgeError {
    let message = match response.text().await {
        Ok(body) if !body.trim().is_empty() => body,
        _ => status
            .canonical_reason()
            .unwrap_or("Unknown status")
            .to_string(),
    };
    BridgeError::Status {
        status: status.as_u16(),
        message,
    }
}

/// Logs every operation and its result
pub struct OperationLog<E> {
    inner: E,
    name: String,
}

impl<E: RequestExecutor> OperationLog<E> {
    /// Wrap `inner`; `name` identifies the log in traces
    pub fn new(name: impl Into<String>, inner: E) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: RequestExecutor> RequestExecutor for OperationLog<E> {
    #[instrument(name = "operation", skip_all, fields(log = %self.name))]
    async fn execute(&self, request: &GraphQlRequest) -> Result<GraphQlResponse> {
        info!(
            operation = request.operation_name.as_deref().unwrap_or("<anonymous>"),
            has_variables = request.variables.is_some(),
            "Operation submitted"
        );
        let started = Instant::now();

        let result = self.inner.execute(request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => {
                let selections: Vec<&str> = response
                    .data
                    .iter()
                    .flat_map(|data| data.keys().map(String::as_str))
                    .collect();
                info!(
                    ?selections,
                    errors = response.errors.len(),
                    elapsed_ms,
                    "Operation result"
                );
            }
            Err(e) => warn!(error = %e, elapsed_ms, "Operation failed"),
        }

        result
    }
}
