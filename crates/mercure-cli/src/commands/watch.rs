//! Watch command - print every event of one stream

use anyhow::{bail, Context, Result};
use mercure_client::{ConnectOptions, ConnectionState, StreamConnection};

use crate::output::OutputContext;

/// Follow one event stream until Ctrl+C or until it fails for good
pub async fn watch(url: &str, options: ConnectOptions, ctx: &OutputContext) -> Result<()> {
    let mut conn = StreamConnection::open(url, options)
        .with_context(|| format!("Failed to open stream: {}", url))?;
    let mut status = conn.watch_status();

    ctx.info(&format!("Watching {}", conn.url()));
    ctx.info("Press Ctrl+C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                ctx.status(&current);
            }
            event = conn.next_event() => match event {
                Some(event) => ctx.event(&event),
                None => break,
            },
        }
    }

    let last = conn.status();
    conn.close();

    if last.state == ConnectionState::Failed {
        let reason = last
            .last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("Stream failed: {}", reason);
    }

    ctx.success(&format!("Stopped (last event ID: {})", display_id(&last.last_event_id)));
    Ok(())
}

fn display_id(id: &str) -> &str {
    if id.is_empty() {
        "none"
    } else {
        id
    }
}
