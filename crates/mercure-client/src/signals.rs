//! Keyed boolean signals
//!
//! A small registry of observable flags, e.g. "resource N changed since it was
//! last rendered". Looking a key up creates it lowered; unlinking forgets it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

/// An observable flag shared by everyone holding the same key
#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Set the flag; observers are woken only on an actual change
    pub fn set(&self, value: bool) {
        self.tx.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    pub fn raise(&self) {
        self.set(true);
    }

    pub fn lower(&self) {
        self.set(false);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Registry of signals by key
#[derive(Debug)]
pub struct SignalRegistry<K = u64> {
    signals: RwLock<HashMap<K, Signal>>,
}

impl<K> Default for SignalRegistry<K> {
    fn default() -> Self {
        Self {
            signals: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> SignalRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal for `key`, created lowered when absent
    pub fn signal(&self, key: K) -> Signal {
        if let Some(signal) = self.signals.read().get(&key) {
            return signal.clone();
        }
        self.signals.write().entry(key).or_insert_with(Signal::new).clone()
    }

    /// Forget `key`; returns false when it was not registered.
    ///
    /// Holders of the old signal keep it, but a later lookup starts fresh.
    pub fn unlink(&self, key: &K) -> bool {
        self.signals.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.signals.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.signals.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.read().is_empty()
    }
}
