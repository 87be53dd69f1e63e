//! Debounced network reachability
//!
//! The environment reports raw online/offline flips through
//! [`Reachability::report`]. Connections observe the debounced value: a change
//! is published only after the raw signal has been quiet for a short period,
//! and never more often than the configured minimum interval. Flapping inside
//! the window collapses into at most one published change.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Network reachability as seen by the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Online,
    Offline,
}

impl From<bool> for NetworkState {
    fn from(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

/// Debounce timings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// The raw signal must be stable this long before it is published
    #[serde(default = "default_quiet_ms")]
    pub quiet_ms: u64,

    /// Minimum spacing between two published changes
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_ms: default_quiet_ms(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

fn default_quiet_ms() -> u64 {
    300
}

fn default_min_interval_ms() -> u64 {
    1_000
}

/// Owner of a debounced reachability signal
#[derive(Debug)]
pub struct Reachability {
    raw: watch::Sender<NetworkState>,
    debounced: watch::Receiver<NetworkState>,
    cancel: CancellationToken,
}

impl Reachability {
    /// Start debouncing from `initial`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(initial: NetworkState, config: DebounceConfig) -> Self {
        let (raw, raw_rx) = watch::channel(initial);
        let (debounced_tx, debounced) = watch::channel(initial);
        let cancel = CancellationToken::new();

        tokio::spawn(debounce(raw_rx, debounced_tx, config, cancel.clone()));

        Self {
            raw,
            debounced,
            cancel,
        }
    }

    /// Feed a raw signal from the environment
    pub fn report(&self, state: NetworkState) {
        self.raw.send_replace(state);
    }

    pub fn set_online(&self, online: bool) {
        self.report(online.into());
    }

    /// Debounced value, for [`ConnectOptions::with_reachability`](crate::ConnectOptions::with_reachability)
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.debounced.clone()
    }

    /// Currently published value
    pub fn current(&self) -> NetworkState {
        *self.debounced.borrow()
    }

    /// Stop debouncing. Subscribers keep the last published value.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Reachability {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn debounce(
    mut raw: watch::Receiver<NetworkState>,
    published: watch::Sender<NetworkState>,
    config: DebounceConfig,
    cancel: CancellationToken,
) {
    let quiet = Duration::from_millis(config.quiet_ms);
    let min_interval = Duration::from_millis(config.min_interval_ms);
    let mut last_publish: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = raw.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        // Wait until the raw signal settles
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = raw.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(quiet) => break,
            }
        }

        if let Some(at) = last_publish {
            let earliest = at + min_interval;
            if Instant::now() < earliest {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(earliest) => {}
                }
            }
        }

        let value = *raw.borrow_and_update();
        let changed = published.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });

        if changed {
            debug!(state = ?value, "Reachability changed");
            last_publish = Some(Instant::now());
        } else {
            debug!(state = ?value, "Reachability flap collapsed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stable_change_is_published() {
        let reach = Reachability::new(NetworkState::Online, DebounceConfig::default());
        let mut rx = reach.subscribe();

        reach.set_online(false);
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow(), NetworkState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flap_collapses() {
        let reach = Reachability::new(NetworkState::Online, DebounceConfig::default());
        let mut rx = reach.subscribe();

        reach.set_online(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        reach.set_online(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        reach.set_online(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        reach.set_online(true);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(reach.current(), NetworkState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_between_changes() {
        let reach = Reachability::new(NetworkState::Online, DebounceConfig::default());
        let mut rx = reach.subscribe();

        reach.set_online(false);
        rx.changed().await.unwrap();
        let first = Instant::now();

        reach.set_online(true);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NetworkState::Online);
        assert!(Instant::now() - first >= Duration::from_secs(1));
    }
}
