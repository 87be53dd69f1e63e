//! Topic command - follow topics through a shared registry

use anyhow::{bail, Context, Result};
use mercure_client::{ConnectOptions, ConnectionState, HubEndpoints, TopicRegistry};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};

use crate::output::{OutputContext, TopicRow};

/// Print a row per event on any of `topics`
///
/// Topics starting with `/` are API paths and get the configured prefix.
pub async fn topic(
    endpoints: HubEndpoints,
    topics: &[String],
    options: ConnectOptions,
    ctx: &OutputContext,
) -> Result<()> {
    let registry =
        TopicRegistry::new(endpoints, options).context("Failed to create topic registry")?;

    let mut streams = StreamMap::new();
    let mut iris = Vec::with_capacity(topics.len());
    for topic in topics {
        let iri = if topic.starts_with('/') {
            registry.endpoints().topic(topic)
        } else {
            topic.clone()
        };
        ctx.info(&format!("Subscribed to {}", iri));
        streams.insert(iri.clone(), BroadcastStream::new(registry.for_topic(&iri)));
        iris.push(iri);
    }
    ctx.info("Press Ctrl+C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            next = streams.next() => match next {
                Some((topic, Ok(event))) => {
                    let row = TopicRow {
                        topic,
                        event_type: event.event_type,
                        resource: event.resource_id.unwrap_or_default(),
                        last_event_id: event.last_event_id,
                    };
                    print_row(&row, ctx);
                }
                Some((topic, Err(BroadcastStreamRecvError::Lagged(n)))) => {
                    ctx.error(&format!("{}: skipped {} event(s)", topic, n));
                }
                None => break,
            },
        }
    }

    let mut failed = 0;
    for topic in &iris {
        match registry.status(topic) {
            Some(status) if status.state == ConnectionState::Failed => {
                failed += 1;
                let reason = status.last_error.map(|e| e.to_string()).unwrap_or_default();
                ctx.error(&format!("{}: FAILED {}", topic, reason));
            }
            Some(status) => ctx.info(&format!("{}: {:?}", topic, status.state)),
            None => {}
        }
    }
    registry.shutdown();
    if failed > 0 {
        bail!("{} topic connection(s) failed", failed);
    }
    Ok(())
}

fn print_row(row: &TopicRow, ctx: &OutputContext) {
    if ctx.json {
        ctx.print_json(row);
    } else {
        println!(
            "{} [{}] {} ({})",
            row.topic, row.event_type, row.resource, row.last_event_id
        );
    }
}
