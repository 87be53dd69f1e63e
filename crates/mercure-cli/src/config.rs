//! Configuration file handling for mercure-cli

use anyhow::{Context, Result};
use mercure_client::{BackoffPolicy, ConnectionConfig, LiveConfig};
use mercure_gql::{BridgeConfig, UrlRewrite};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hub used when neither the command line nor the config file names one
pub const DEFAULT_HUB: &str = "http://localhost:3000";

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default hub entrypoint
    pub hub: Option<String>,
    /// Prefix turning API paths into topic IRIs
    pub topics_prefix: Option<String>,
    /// GraphQL endpoint for `subscribe`
    pub graphql_endpoint: Option<String>,
    /// Stream connection settings
    pub connection: Option<ConnectionConfig>,
    /// Hub URL rewrite for advertised subscription URLs
    pub rewrite: Option<UrlRewrite>,
    /// Print JSON lines instead of text
    pub json: Option<bool>,
    /// Disable colored output
    pub no_color: Option<bool>,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        if let Some(connection) = &config.connection {
            connection
                .backoff
                .validate()
                .with_context(|| format!("Invalid backoff in {}", path.display()))?;
        }
        Ok(config)
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("mercure-cli");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(&self, hub: Option<&str>, json: bool, no_color: bool) -> MergedConfig {
        MergedConfig {
            hub: hub
                .map(String::from)
                .or_else(|| self.hub.clone())
                .unwrap_or_else(|| DEFAULT_HUB.to_string()),
            topics_prefix: self.topics_prefix.clone().unwrap_or_default(),
            graphql_endpoint: self.graphql_endpoint.clone(),
            connection: self.connection.clone().unwrap_or_default(),
            rewrite: self.rewrite.clone(),
            json: json || self.json.unwrap_or(false),
            no_color: no_color || self.no_color.unwrap_or(false),
        }
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub hub: String,
    pub topics_prefix: String,
    pub graphql_endpoint: Option<String>,
    pub connection: ConnectionConfig,
    pub rewrite: Option<UrlRewrite>,
    pub json: bool,
    pub no_color: bool,
}

impl MergedConfig {
    /// Replace the backoff schedule, e.g. from `--backoff 1s,2s,infinite`
    pub fn override_backoff(&mut self, steps: &[String]) -> Result<()> {
        if steps.is_empty() {
            return Ok(());
        }
        let policy = BackoffPolicy::schedule(steps.iter().cloned());
        policy.validate().context("Invalid --backoff schedule")?;
        self.connection.backoff = policy;
        Ok(())
    }

    /// Live-update configuration for hub commands
    pub fn live(&self) -> Result<LiveConfig> {
        let mut config =
            LiveConfig::new(self.hub.clone()).with_topics_prefix(self.topics_prefix.clone());
        config.connection = self.connection.clone();
        config.validate().context("Invalid hub configuration")?;
        Ok(config)
    }

    /// Bridge configuration for `subscribe`; `endpoint` wins over the config file
    pub fn bridge(&self, endpoint: Option<&str>) -> Result<BridgeConfig> {
        let endpoint = endpoint
            .map(String::from)
            .or_else(|| self.graphql_endpoint.clone())
            .context("No GraphQL endpoint: pass --endpoint or set graphql_endpoint")?;

        let mut config = BridgeConfig::new(endpoint);
        config.rewrite = self.rewrite.clone();
        if self.connection.backoff != BackoffPolicy::Never {
            config.connection.backoff = self.connection.backoff.clone();
            config.connection.jitter_ms = self.connection.jitter_ms;
        }
        config.bearer_token = self.connection.bearer_token.clone();
        Ok(config)
    }
}
