//! Reconnection backoff policies
//!
//! A policy maps a retry attempt number (starting at 1) to either a delay or a
//! stop signal. Schedules are written as duration specs such as
//! `["1s", "2s", "infinite"]`: a trailing `infinite` repeats the previous delay
//! forever and `stop` gives up at that attempt.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schedule entry that ends retrying
pub const STOP: &str = "stop";

const INFINITE: [&str; 3] = ["infinite", "infinity", "inf"];

/// Outcome of asking a policy about the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait this long, then reconnect
    Retry(Duration),
    /// Give up
    Stop,
}

/// A policy that could not be evaluated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("malformed duration spec '{0}'")]
    MalformedDuration(String),

    #[error("'infinite' at position {0} must be the last schedule entry")]
    InfiniteNotLast(usize),

    #[error("'infinite' has no preceding duration to repeat")]
    DanglingInfinite,
}

/// Retry policy for a stream connection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Never retry
    #[default]
    Never,

    /// Explicit per-attempt schedule of duration specs
    Schedule { steps: Vec<String> },

    /// Same delay on every attempt, forever
    Constant { delay_ms: u64 },

    /// Delay grows by `multiplier` per attempt up to `max_ms`
    Exponential {
        initial_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: u32,
        max_ms: u64,
        /// Stop after this many attempts (retry forever when unset)
        #[serde(default)]
        max_attempts: Option<u32>,
    },
}

fn default_multiplier() -> u32 {
    2
}

impl BackoffPolicy {
    /// Build a schedule policy from duration specs
    pub fn schedule<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Schedule {
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }

    /// Fixed delay policy
    pub fn constant(delay: Duration) -> Self {
        Self::Constant {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Decide what to do before retry `attempt` (1-based)
    pub fn next(&self, attempt: u32) -> Result<Backoff, PolicyError> {
        let attempt = attempt.max(1);
        match self {
            Self::Never => Ok(Backoff::Stop),
            Self::Schedule { steps } => schedule_next(steps, attempt),
            Self::Constant { delay_ms } => Ok(Backoff::Retry(Duration::from_millis(*delay_ms))),
            Self::Exponential {
                initial_ms,
                multiplier,
                max_ms,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max| attempt > max) {
                    return Ok(Backoff::Stop);
                }
                let factor = (*multiplier as u64).saturating_pow(attempt - 1);
                let delay = initial_ms.saturating_mul(factor).min(*max_ms);
                Ok(Backoff::Retry(Duration::from_millis(delay)))
            }
        }
    }

    /// Check every schedule entry up front
    pub fn validate(&self) -> Result<(), PolicyError> {
        if let Self::Schedule { steps } = self {
            for attempt in 1..=steps.len() as u32 {
                schedule_next(steps, attempt)?;
            }
        }
        Ok(())
    }
}

fn is_infinite(step: &str) -> bool {
    INFINITE.contains(&step.trim().to_ascii_lowercase().as_str())
}

fn is_stop(step: &str) -> bool {
    step.trim().eq_ignore_ascii_case(STOP)
}

fn schedule_next(steps: &[String], attempt: u32) -> Result<Backoff, PolicyError> {
    let Some(last) = steps.last() else {
        return Ok(Backoff::Stop);
    };

    let mut idx = (attempt - 1) as usize;
    if idx >= steps.len() {
        if !is_infinite(last) {
            return Ok(Backoff::Stop);
        }
        idx = steps.len() - 1;
    }

    evaluate_step(steps, idx)
}

fn evaluate_step(steps: &[String], idx: usize) -> Result<Backoff, PolicyError> {
    let step = &steps[idx];

    if is_stop(step) {
        return Ok(Backoff::Stop);
    }

    if is_infinite(step) {
        if idx + 1 != steps.len() {
            return Err(PolicyError::InfiniteNotLast(idx));
        }
        if idx == 0 {
            return Err(PolicyError::DanglingInfinite);
        }
        return evaluate_step(steps, idx - 1);
    }

    parse_duration(step).map(Backoff::Retry)
}

/// Parse a duration spec: `250ms`, `1s`, `1.5s`, `2m`, `1h`, or bare milliseconds.
///
/// Precision is one millisecond.
pub fn parse_duration(spec: &str) -> Result<Duration, PolicyError> {
    let malformed = || PolicyError::MalformedDuration(spec.to_string());

    let trimmed = spec.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number.parse().map_err(|_| malformed())?;
    let ms_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "ms" => 1.0,
        "s" | "sec" | "secs" => 1_000.0,
        "m" | "min" | "mins" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(malformed()),
    };

    let ms = (value * ms_per_unit).round();
    if !ms.is_finite() || ms < 0.0 || ms > u64::MAX as f64 {
        return Err(malformed());
    }
    Ok(Duration::from_millis(ms as u64))
}

/// Add a uniform random jitter in `[0, span)` to `delay`
pub fn with_jitter(delay: Duration, span: Duration) -> Duration {
    let span_us = span.as_micros() as u64;
    if span_us == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..span_us);
    delay + Duration::from_micros(extra)
}
