//! SSE (Server-Sent Events) frame parser
//!
//! Parses the SSE wire format into [`Event`] values. Each `data:` line of a
//! frame is kept as its own entry; a blank line dispatches the frame.

use bytes::Bytes;
use thiserror::Error;
use tracing::{trace, warn};

use crate::event::{Event, MESSAGE};

/// Default upper bound for a single unterminated line
pub const DEFAULT_MAX_LINE: usize = 1024 * 1024;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Frame-level parse failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The server sent a line longer than the limit without a terminator
    #[error("line exceeds {limit} bytes without a terminator")]
    LineTooLong { limit: usize },
}

/// SSE parser state
#[derive(Debug)]
pub struct FrameParser {
    /// Buffer for incomplete lines
    buffer: Vec<u8>,
    /// Data lines of the frame being accumulated
    data_lines: Vec<String>,
    /// Current event type (if any)
    event_type: Option<String>,
    /// Id of the frame being accumulated (if any)
    frame_id: Option<String>,
    /// Last `retry:` hint from the server, in milliseconds
    retry_hint: Option<u64>,
    /// Whether the stream start (and a possible BOM) has been consumed
    started: bool,
    max_line: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Create a new parser
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }

    /// Create a parser with a custom line length limit
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            data_lines: Vec::new(),
            event_type: None,
            frame_id: None,
            retry_hint: None,
            started: false,
            max_line,
        }
    }

    /// Reconnection delay advertised by the server, if any
    pub fn retry_hint(&self) -> Option<u64> {
        self.retry_hint
    }

    /// Drop any partially received frame.
    ///
    /// Called when the transport is replaced; a new response starts clean.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.data_lines.clear();
        self.event_type = None;
        self.frame_id = None;
        self.started = false;
    }

    /// Feed bytes into the parser and extract any complete events
    pub fn feed(&mut self, bytes: Bytes) -> Result<Vec<Event>, ParseError> {
        let mut events = Vec::new();

        self.buffer.extend_from_slice(&bytes);

        if !self.started {
            if self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer) {
                return Ok(events);
            }
            if self.buffer.starts_with(BOM) {
                self.buffer.drain(..BOM.len());
            }
            self.started = true;
        }

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
            let line = &line[..line.len() - 1];

            // Handle \r\n line endings
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        if self.buffer.len() > self.max_line {
            self.buffer.clear();
            return Err(ParseError::LineTooLong {
                limit: self.max_line,
            });
        }

        Ok(events)
    }

    /// Process a single line of SSE data
    fn process_line(&mut self, line: &[u8]) -> Option<Event> {
        // Empty line signals end of event
        if line.is_empty() {
            return self.dispatch();
        }

        // Comment line (keepalive)
        if line.starts_with(b":") {
            trace!("SSE keepalive/comment");
            return None;
        }

        let line = match std::str::from_utf8(line) {
            Ok(s) => s,
            Err(_) => {
                warn!("Skipping SSE line with invalid UTF-8");
                return None;
            }
        };

        // Split on first colon
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event_type = Some(value.to_string()),
            "id" => {
                // Ids containing NUL are ignored per the SSE format
                if !value.contains('\0') {
                    self.frame_id = Some(value.to_string());
                }
            }
            "retry" => match value.parse::<u64>() {
                Ok(ms) => {
                    trace!(retry_ms = ms, "SSE retry hint");
                    self.retry_hint = Some(ms);
                }
                Err(_) => trace!("Ignoring malformed SSE retry: {}", value),
            },
            _ => trace!("SSE unknown field: {}", field),
        }

        None
    }

    /// Dispatch the accumulated frame
    fn dispatch(&mut self) -> Option<Event> {
        let event_type = self.event_type.take();
        let id = self.frame_id.take();

        if self.data_lines.is_empty() {
            return None;
        }

        let data_lines = std::mem::take(&mut self.data_lines);
        let event_type = event_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| MESSAGE.to_string());

        Some(Event::new(event_type, id.unwrap_or_default(), data_lines))
    }
}
