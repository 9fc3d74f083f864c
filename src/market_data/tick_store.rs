// =============================================================================
// Tick Store: latest trade per symbol with change notification
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::debug;

use crate::callbacks::{CallbackId, CallbackList};
use crate::types::{normalize_symbol, Tick};

/// Holds the single most recent tick for every symbol seen so far.
///
/// Subscribers are notified after the map has been updated and the lock
/// released, so a subscriber may read the store from inside its callback.
pub struct TickStore {
    ticks: RwLock<HashMap<String, Tick>>,
    subscribers: CallbackList<Tick>,
}

impl TickStore {
    pub fn new() -> Self {
        Self::with_slow_callback_warn(Duration::from_millis(250))
    }

    pub fn with_slow_callback_warn(threshold: Duration) -> Self {
        Self {
            ticks: RwLock::new(HashMap::new()),
            subscribers: CallbackList::new("tick_store", threshold),
        }
    }

    /// Replace the stored tick for `tick.symbol()` and notify subscribers.
    pub fn update(&self, tick: Tick) {
        {
            let mut ticks = self.ticks.write();
            ticks.insert(tick.symbol().to_string(), tick.clone());
        }
        debug!(symbol = %tick.symbol(), price = %tick.price(), "latest tick updated");
        self.subscribers.dispatch(&tick);
    }

    /// Latest tick for `symbol` (case-insensitive), or `None` if none arrived.
    pub fn get(&self, symbol: &str) -> Option<Tick> {
        self.ticks.read().get(&normalize_symbol(symbol)).cloned()
    }

    /// Independent copy of the full symbol -> tick map.
    pub fn get_all(&self) -> HashMap<String, Tick> {
        self.ticks.read().clone()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.ticks.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn subscribe<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Tick) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribers.add(callback)
    }

    pub fn unsubscribe(&self, id: CallbackId) -> bool {
        self.subscribers.remove(id)
    }

    /// Drop the stored tick for one symbol, or for all symbols when `None`.
    pub fn clear(&self, symbol: Option<&str>) {
        let mut ticks = self.ticks.write();
        match symbol {
            Some(sym) => {
                ticks.remove(&normalize_symbol(sym));
            }
            None => ticks.clear(),
        }
    }

    pub fn len(&self) -> usize {
        self.ticks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.read().is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.ticks.read().contains_key(&normalize_symbol(symbol))
    }

    /// Subscriber failures since construction.
    pub fn subscriber_failures(&self) -> u64 {
        self.subscribers.failures()
    }
}

impl Default for TickStore {
    fn default() -> Self {
        Self::new()
    }
}
