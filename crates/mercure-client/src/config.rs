//! Hub and connection configuration with YAML/TOML/JSON support

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::backoff::{BackoffPolicy, PolicyError};
use crate::connection::ConnectOptions;
use crate::event::RESOURCE_ID_FIELD;
use crate::reachability::DebounceConfig;

/// Live-update configuration
///
/// Can be loaded from YAML, TOML, JSON, or constructed programmatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Hub location and topic naming
    pub hub: HubConfig,

    /// Defaults for every stream connection
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Reachability debounce timings
    #[serde(default)]
    pub reachability: DebounceConfig,

    /// Payload field carrying resource identifiers
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_id_field() -> String {
    RESOURCE_ID_FIELD.to_string()
}

/// Hub location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Externally reachable hub origin (e.g. `https://hub.example.com:8443`)
    pub entrypoint: String,

    /// Subscription path on the hub
    #[serde(default = "default_well_known")]
    pub well_known_path: String,

    /// Prefix of topic IRIs published by the API
    #[serde(default)]
    pub topics_prefix: String,
}

fn default_well_known() -> String {
    "/.well-known/mercure".to_string()
}

/// Connection settings, converted into [`ConnectOptions`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Upper bound of retry jitter in milliseconds
    #[serde(default)]
    pub jitter_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub with_credentials: bool,

    /// Subscriber token sent when `with_credentials` is set
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            jitter_ms: 0,
            connect_timeout_ms: default_connect_timeout(),
            with_credentials: false,
            bearer_token: None,
        }
    }
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

impl ConnectionConfig {
    /// Build connection options from this configuration
    pub fn to_options(&self) -> ConnectOptions {
        ConnectOptions {
            with_credentials: self.with_credentials,
            bearer_token: self.bearer_token.clone(),
            backoff: self.backoff.clone(),
            jitter: Duration::from_millis(self.jitter_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..ConnectOptions::default()
        }
    }
}

impl LiveConfig {
    /// Minimal configuration for a hub
    pub fn new(entrypoint: impl Into<String>) -> Self {
        Self {
            hub: HubConfig {
                entrypoint: entrypoint.into(),
                well_known_path: default_well_known(),
                topics_prefix: String::new(),
            },
            connection: ConnectionConfig::default(),
            reachability: DebounceConfig::default(),
            id_field: default_id_field(),
        }
    }

    pub fn with_topics_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.hub.topics_prefix = prefix.into();
        self
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.connection.backoff = policy;
        self
    }

    /// Load configuration from a file, picking the format from its extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Check the hub URL and the backoff schedule
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoints()?;
        self.connection.backoff.validate()?;
        Ok(())
    }

    /// Resolved hub endpoints
    pub fn endpoints(&self) -> Result<HubEndpoints, ConfigError> {
        HubEndpoints::new(
            &self.hub.entrypoint,
            &self.hub.well_known_path,
            &self.hub.topics_prefix,
        )
    }
}

/// Resolved hub URLs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEndpoints {
    hub: Url,
    topics_prefix: String,
}

impl HubEndpoints {
    pub fn new(
        entrypoint: &str,
        well_known_path: &str,
        topics_prefix: &str,
    ) -> Result<Self, ConfigError> {
        let base = Url::parse(entrypoint)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", entrypoint, e)))?;
        let hub = base
            .join(well_known_path)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", well_known_path, e)))?;
        Ok(Self {
            hub,
            topics_prefix: topics_prefix.trim_end_matches('/').to_string(),
        })
    }

    /// The hub subscription URL without topics
    pub fn hub_url(&self) -> &Url {
        &self.hub
    }

    /// Topic IRI for an API path (`/posts/{id}` → `<prefix>/posts/{id}`)
    pub fn topic(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.topics_prefix, path)
        } else {
            format!("{}/{}", self.topics_prefix, path)
        }
    }

    /// Subscription URL for one topic
    pub fn subscribe_url(&self, topic: &str) -> Url {
        self.subscribe_url_many(&[topic])
    }

    /// Subscription URL for the topic of an API path
    pub fn topic_url(&self, path: &str) -> Url {
        self.subscribe_url(&self.topic(path))
    }

    /// Subscription URL for several topics (one `topic` parameter each)
    pub fn subscribe_url_many(&self, topics: &[&str]) -> Url {
        let mut url = self.hub.clone();
        {
            let mut query = url.query_pairs_mut();
            for topic in topics {
                query.append_pair("topic", topic);
            }
        }
        url
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid backoff policy: {0}")]
    Backoff(#[from] PolicyError),
}
