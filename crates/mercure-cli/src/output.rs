//! Output formatting for mercure-cli (text or JSON lines)

use colored::Colorize;
use mercure_client::{ConnectionState, ConnectionStatus, Event};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Context for output rendering
pub struct OutputContext {
    pub json: bool,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(json: bool, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { json, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg);
        }
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print one value as a JSON line
    pub fn print_json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(line) => println!("{}", line),
            Err(e) => self.error(&format!("Cannot encode output: {}", e)),
        }
    }

    /// Print rows as a table, or as a JSON array
    pub fn print_table<T: Tabled + Serialize>(&self, rows: &[T]) {
        if self.json {
            self.print_json(&rows);
        } else if rows.is_empty() {
            if !self.quiet {
                println!("No data");
            }
        } else {
            println!("{}", Table::new(rows));
        }
    }

    /// Print a received event
    pub fn event(&self, event: &Event) {
        if self.json {
            self.print_json(event);
            return;
        }
        let id = if event.has_id() { event.id.as_str() } else { "-" };
        println!(
            "{} {} {}",
            format!("[{}]", event.event_type).cyan().bold(),
            id.dimmed(),
            event.data_lines.join("\n")
        );
    }

    /// Print a connection status change (stderr, so stdout stays data only)
    pub fn status(&self, status: &ConnectionStatus) {
        if self.quiet {
            return;
        }
        let state = format!("{:?}", status.state).to_uppercase();
        let state = match status.state {
            ConnectionState::Open => state.green(),
            ConnectionState::Connecting => state.normal(),
            ConnectionState::Retrying => state.yellow(),
            ConnectionState::Closed => state.dimmed(),
            ConnectionState::Failed => state.red(),
        };
        match &status.last_error {
            Some(e) => eprintln!("{} attempt={} ({})", state, status.attempt, e),
            None => eprintln!("{} attempt={}", state, status.attempt),
        }
    }
}

/// Topic event display for topic command
#[derive(Debug, Tabled, Serialize)]
pub struct TopicRow {
    #[tabled(rename = "Topic")]
    pub topic: String,
    #[tabled(rename = "Type")]
    pub event_type: String,
    #[tabled(rename = "Resource")]
    pub resource: String,
    #[tabled(rename = "Last event ID")]
    pub last_event_id: String,
}

/// Delta display for delta command
#[derive(Debug, Tabled, Serialize)]
pub struct DeltaRow {
    #[tabled(rename = "Change")]
    pub change: String,
    #[tabled(rename = "Resource")]
    pub resource: String,
}
