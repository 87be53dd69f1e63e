//! Bridge configuration

use std::time::Duration;

use mercure_client::{BackoffPolicy, ConfigError, ConnectOptions, ConnectionConfig};
use serde::{Deserialize, Serialize};

use crate::rewrite::UrlRewrite;

/// GraphQL subscription bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// GraphQL endpoint receiving registration requests
    pub endpoint: String,

    /// Internal hub base → externally reachable hub base
    #[serde(default)]
    pub rewrite: Option<UrlRewrite>,

    /// Settings for the per-selection stream connections
    #[serde(default = "default_connection")]
    pub connection: ConnectionConfig,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Token for the registration request
    #[serde(default)]
    pub bearer_token: Option<String>,
}

/// Retry delays for selection streams: short first, then every 5s forever
pub const DEFAULT_BACKOFF: [&str; 4] = ["1s", "2s", "5s", "infinite"];

/// Escalating retries with up to half a second of jitter
fn default_connection() -> ConnectionConfig {
    ConnectionConfig {
        backoff: BackoffPolicy::schedule(DEFAULT_BACKOFF),
        jitter_ms: 500,
        ..ConnectionConfig::default()
    }
}

/// Selection stream options when no configuration is given
pub(crate) fn default_connect_options() -> ConnectOptions {
    default_connection().to_options()
}

fn default_request_timeout() -> u64 {
    30_000 // 30 seconds
}

impl BridgeConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            rewrite: None,
            connection: default_connection(),
            request_timeout_ms: default_request_timeout(),
            bearer_token: None,
        }
    }

    /// Configuration for the conventional `<api>/graphql` endpoint
    pub fn for_api(entrypoint: &str) -> Self {
        Self::new(format!("{}/graphql", entrypoint.trim_end_matches('/')))
    }

    pub fn with_rewrite(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rewrite = Some(UrlRewrite::new(from, to));
        self
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.connection.backoff.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.connection.backoff.validate()?;
        Ok(config)
    }

    /// Connection options for selection streams.
    ///
    /// Selection streams never send credentials.
    pub fn connect_options(&self) -> ConnectOptions {
        self.connection.to_options().with_credentials(false)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
