//! Delta command - accumulate created and deleted resources

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use mercure_client::{ConnectOptions, DeltaSets, DeltaTracker, HttpTransport, StreamConnection};

use crate::output::{DeltaRow, OutputContext};

/// Track creates and deletes until Ctrl+C, then print both sets
pub async fn delta(
    topic_url: &str,
    fragments: bool,
    id_field: &str,
    options: ConnectOptions,
    ctx: &OutputContext,
) -> Result<()> {
    let tracker = if fragments {
        let transport = Arc::new(HttpTransport::new()?);
        DeltaTracker::track_fragments_with(transport, topic_url, options, id_field)
            .with_context(|| format!("Failed to open fragment streams for {}", topic_url))?
    } else {
        let conn = StreamConnection::open(topic_url, options)
            .with_context(|| format!("Failed to open stream: {}", topic_url))?;
        DeltaTracker::track_with(conn, id_field)
    };
    let mut changes = tracker.changes();

    ctx.info(&format!("Tracking {}", topic_url));
    ctx.info("Press Ctrl+C to stop and print the delta");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(e) = tracker.failure() {
                    ctx.error(&format!("Stream failed: {}", e));
                }
                if !tracker.is_tracking() {
                    break;
                }
                let sets = tracker.snapshot();
                ctx.info(&format!(
                    "inserted={} deleted={}",
                    sets.inserted.len(),
                    sets.deleted.len()
                ));
            }
        }
    }

    let sets = tracker.snapshot();
    let failure = tracker.failure();
    tracker.stop();

    if ctx.json {
        ctx.print_json(&sets);
    } else {
        ctx.print_table(&rows(&sets));
    }
    if let Some(e) = failure {
        bail!("Tracking ended: {}", e);
    }
    Ok(())
}

fn rows(sets: &DeltaSets) -> Vec<DeltaRow> {
    let inserted = sets.inserted.iter().map(|id| DeltaRow {
        change: "inserted".to_string(),
        resource: id.to_string(),
    });
    let deleted = sets.deleted.iter().map(|id| DeltaRow {
        change: "deleted".to_string(),
        resource: id.to_string(),
    });
    inserted.chain(deleted).collect()
}
