//! mercure-cli - Command-line tool for Mercure live updates
//!
//! Watch raw hub streams, follow topics, accumulate create/delete deltas and
//! run GraphQL subscriptions delivered over the hub.

mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::output::OutputContext;

#[derive(Parser)]
#[command(name = "mercure-cli")]
#[command(author, version, about = "Mercure live-update CLI")]
#[command(propagate_version = true)]
struct Cli {
    /// Hub entrypoint
    #[arg(long, env = "MERCURE_HUB", global = true)]
    hub: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "MERCURE_CLI_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Print JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every event of one stream
    Watch {
        /// Stream URL, or an API path resolved against the hub
        url: String,

        /// Backoff schedule, e.g. "1s,2s,infinite"
        #[arg(long, value_delimiter = ',')]
        backoff: Vec<String>,
    },

    /// Follow one or more topics
    Topic {
        /// Topic IRIs, or API paths starting with '/'
        #[arg(required = true)]
        topics: Vec<String>,

        /// Backoff schedule, e.g. "1s,2s,infinite"
        #[arg(long, value_delimiter = ',')]
        backoff: Vec<String>,
    },

    /// Collect created and deleted resource ids
    Delta {
        /// Hub URL subscribing to the collection topic
        topic_url: String,

        /// Follow the #create and #delete fragment topics instead
        #[arg(long)]
        fragments: bool,

        /// Payload field carrying the resource id
        #[arg(long, default_value = "@id")]
        id_field: String,

        /// Backoff schedule, e.g. "1s,2s,infinite"
        #[arg(long, value_delimiter = ',')]
        backoff: Vec<String>,
    },

    /// Run a GraphQL subscription
    Subscribe {
        /// GraphQL endpoint
        #[arg(long)]
        endpoint: Option<String>,

        /// Subscription document, or @file
        #[arg(long)]
        query: String,

        /// Variables as JSON object
        #[arg(long)]
        variables: Option<String>,

        /// Operation to run when the document has several
        #[arg(long)]
        operation_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins unless --verbose
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let mut merged = config.merge_with_args(cli.hub.as_deref(), cli.json, cli.no_color);
    debug!(hub = %merged.hub, json = merged.json, "Configuration resolved");

    let ctx = OutputContext::new(merged.json, merged.no_color, cli.quiet);

    match &cli.command {
        Commands::Watch { url, backoff } => {
            merged.override_backoff(backoff)?;
            let live = merged.live()?;
            let url = if url.starts_with('/') {
                live.endpoints()?.topic_url(url).to_string()
            } else {
                url.clone()
            };
            commands::watch(&url, live.connection.to_options(), &ctx).await?;
        }

        Commands::Topic { topics, backoff } => {
            merged.override_backoff(backoff)?;
            let live = merged.live()?;
            let endpoints = live.endpoints().context("Invalid hub URL")?;
            commands::topic(endpoints, topics, live.connection.to_options(), &ctx).await?;
        }

        Commands::Delta {
            topic_url,
            fragments,
            id_field,
            backoff,
        } => {
            merged.override_backoff(backoff)?;
            let options = merged.connection.to_options();
            commands::delta(topic_url, *fragments, id_field, options, &ctx).await?;
        }

        Commands::Subscribe {
            endpoint,
            query,
            variables,
            operation_name,
        } => {
            let bridge = merged.bridge(endpoint.as_deref())?;
            let request = commands::subscribe::build_request(
                query,
                variables.as_deref(),
                operation_name.as_deref(),
            )?;
            commands::subscribe(&bridge, request, &ctx).await?;
        }
    }

    Ok(())
}
