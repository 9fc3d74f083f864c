// =============================================================================
// OHLC Aggregator: ticks in, closed fixed-interval candles out
// =============================================================================
//
// One in-progress candle per symbol plus a bounded FIFO history of closed
// candles.  A candle closes when:
//   1. a tick for the same symbol arrives in a later bucket, or
//   2. the boundary task wakes shortly after a wall-clock bucket boundary and
//      finds the candle's bucket already over (silent symbols), or
//   3. the aggregator is stopped (trailing candles are flushed).
//
// Locking: all candle state sits behind one mutex.  The closing logic lives
// on `AggregatorState` and only ever runs with that mutex held; the public
// methods take the lock once, run the core step, release it, and only then
// fan closed candles out to callbacks.  Callbacks can therefore read the
// aggregator without re-entering the lock.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callbacks::{CallbackId, CallbackList};
use crate::types::{floor_to_bucket, normalize_symbol, Candle, Tick};

// ---------------------------------------------------------------------------
// Settings & stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Bucket length of every candle.
    pub interval: Duration,
    /// Closed candles retained per symbol; the oldest is evicted first.
    pub history_size: usize,
    /// Added after each wall-clock boundary before stale candles are closed,
    /// so a tick stamped just before the boundary still lands in its candle.
    pub boundary_buffer: Duration,
    pub slow_callback_warn: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            history_size: 100,
            boundary_buffer: Duration::from_millis(100),
            slow_callback_warn: Duration::from_millis(250),
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub ticks_processed: u64,
    pub ticks_rejected: u64,
    pub candles_closed: u64,
    pub candles_force_closed: u64,
    pub callback_failures: u64,
}

#[derive(Default)]
struct Counters {
    ticks_processed: AtomicU64,
    ticks_rejected: AtomicU64,
    candles_closed: AtomicU64,
    candles_force_closed: AtomicU64,
}

// ---------------------------------------------------------------------------
// Core state (always accessed with the aggregator lock held)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AggregatorState {
    current: HashMap<String, Candle>,
    history: HashMap<String, VecDeque<Candle>>,
}

impl AggregatorState {
    /// Fold `tick` (already assigned to `bucket`). Returns the candle closed
    /// by this tick, if any. Errors leave the state untouched.
    fn ingest(&mut self, tick: &Tick, bucket: DateTime<Utc>, history_size: usize) -> Result<Option<Candle>> {
        let symbol = tick.symbol();

        match self.current.get(symbol).map(|c| c.timestamp) {
            None => {
                if let Some(last) = self.history.get(symbol).and_then(VecDeque::back) {
                    if bucket <= last.timestamp {
                        bail!(
                            "tick bucket {bucket} is not after last closed bucket {}",
                            last.timestamp
                        );
                    }
                }
                self.open(tick, bucket);
                Ok(None)
            }
            Some(open_bucket) if open_bucket < bucket => {
                let closed = self.close_current(symbol, history_size);
                self.open(tick, bucket);
                Ok(closed)
            }
            Some(open_bucket) if open_bucket == bucket => {
                if let Some(candle) = self.current.get_mut(symbol) {
                    candle.apply(tick)?;
                }
                Ok(None)
            }
            Some(open_bucket) => bail!("tick bucket {bucket} is before in-progress bucket {open_bucket}"),
        }
    }

    fn open(&mut self, tick: &Tick, bucket: DateTime<Utc>) {
        debug!(symbol = %tick.symbol(), bucket = %bucket, price = %tick.price(), "candle opened");
        self.current
            .insert(tick.symbol().to_string(), Candle::from_tick(tick, bucket));
    }

    /// Close the in-progress candle for `symbol`, append it to history and
    /// trim the history to `history_size`.
    fn close_current(&mut self, symbol: &str, history_size: usize) -> Option<Candle> {
        let mut candle = self.current.remove(symbol)?;
        candle.mark_closed();

        let ring = self
            .history
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(history_size + 1));
        ring.push_back(candle.clone());
        while ring.len() > history_size {
            ring.pop_front();
        }
        Some(candle)
    }

    /// Close every in-progress candle whose bucket starts before `cutoff`.
    fn close_stale(&mut self, cutoff: DateTime<Utc>, history_size: usize) -> Vec<Candle> {
        let mut stale: Vec<String> = self
            .current
            .iter()
            .filter(|(_, c)| c.timestamp < cutoff)
            .map(|(s, _)| s.clone())
            .collect();
        stale.sort();
        stale
            .iter()
            .filter_map(|s| self.close_current(s, history_size))
            .collect()
    }

    fn close_all(&mut self, history_size: usize) -> Vec<Candle> {
        let mut symbols: Vec<String> = self.current.keys().cloned().collect();
        symbols.sort();
        symbols
            .iter()
            .filter_map(|s| self.close_current(s, history_size))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// OhlcAggregator
// ---------------------------------------------------------------------------

/// Thread-safe candle builder shared via `Arc`.
pub struct OhlcAggregator {
    settings: AggregatorSettings,
    state: Mutex<AggregatorState>,
    /// Held from closing a candle until its callbacks return, so closes from
    /// different threads publish in the order they happened. Reentrant so a
    /// callback may feed ticks back in.
    publish_order: ReentrantMutex<()>,
    callbacks: CallbackList<Candle>,
    counters: Counters,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    boundary_task: Mutex<Option<JoinHandle<()>>>,
}

impl OhlcAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            callbacks: CallbackList::new("candles", settings.slow_callback_warn),
            settings,
            state: Mutex::new(AggregatorState::default()),
            publish_order: ReentrantMutex::new(()),
            counters: Counters::default(),
            running: AtomicBool::new(false),
            shutdown,
            boundary_task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// Register a consumer of closed candles.
    ///
    /// Callbacks see candles in close order: for each symbol, buckets arrive
    /// strictly increasing, whether closed by a tick or by the boundary task.
    pub fn add_candle_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Candle) -> Result<()> + Send + Sync + 'static,
    {
        self.callbacks.add(callback)
    }

    pub fn remove_candle_callback(&self, id: CallbackId) -> bool {
        self.callbacks.remove(id)
    }

    /// Fold one tick. Returns the candle this tick closed, if any.
    ///
    /// A tick older than the symbol's in-progress bucket, or belonging to a
    /// bucket that was already closed, is dropped and counted as rejected.
    pub fn process_tick(&self, tick: &Tick) -> Option<Candle> {
        let bucket = floor_to_bucket(tick.timestamp(), self.settings.interval);

        let _order = self.publish_order.lock();
        let outcome = {
            let mut state = self.state.lock();
            state.ingest(tick, bucket, self.settings.history_size)
        };

        match outcome {
            Ok(closed) => {
                self.counters.ticks_processed.fetch_add(1, Ordering::Relaxed);
                if let Some(candle) = &closed {
                    self.publish(candle);
                }
                closed
            }
            Err(e) => {
                self.counters.ticks_rejected.fetch_add(1, Ordering::Relaxed);
                error!(
                    symbol = %tick.symbol(),
                    trade_time = %tick.timestamp(),
                    error = %e,
                    "tick rejected"
                );
                None
            }
        }
    }

    /// Force-close every in-progress candle whose bucket ended before the
    /// bucket containing `now`. This is what the boundary task runs; it is
    /// public so the close can be driven without waiting for wall-clock time.
    pub fn close_stale_candles(&self, now: DateTime<Utc>) -> Vec<Candle> {
        let cutoff = floor_to_bucket(now, self.settings.interval);
        let _order = self.publish_order.lock();
        let closed = {
            let mut state = self.state.lock();
            state.close_stale(cutoff, self.settings.history_size)
        };
        if !closed.is_empty() {
            self.counters
                .candles_force_closed
                .fetch_add(closed.len() as u64, Ordering::Relaxed);
        }
        for candle in &closed {
            self.publish(candle);
        }
        closed
    }

    /// Force-close all in-progress candles regardless of their bucket.
    pub fn close_all_candles(&self) -> Vec<Candle> {
        let _order = self.publish_order.lock();
        let closed = {
            let mut state = self.state.lock();
            state.close_all(self.settings.history_size)
        };
        for candle in &closed {
            self.publish(candle);
        }
        closed
    }

    fn publish(&self, candle: &Candle) {
        self.counters.candles_closed.fetch_add(1, Ordering::Relaxed);
        info!(
            symbol = %candle.symbol,
            bucket = %candle.timestamp,
            open = %candle.open,
            high = %candle.high,
            low = %candle.low,
            close = %candle.close,
            volume = %candle.volume,
            ticks = candle.tick_count,
            "candle closed"
        );
        self.callbacks.dispatch(candle);
    }

    // -------------------------------------------------------------------------
    // Read accessors (copies only)
    // -------------------------------------------------------------------------

    pub fn get_current_candle(&self, symbol: &str) -> Option<Candle> {
        self.state.lock().current.get(&normalize_symbol(symbol)).cloned()
    }

    pub fn get_all_current_candles(&self) -> HashMap<String, Candle> {
        self.state.lock().current.clone()
    }

    /// Closed candles for `symbol`, oldest first. With `Some(n)` only the most
    /// recent `n` are returned.
    pub fn get_history(&self, symbol: &str, limit: Option<usize>) -> Vec<Candle> {
        let state = self.state.lock();
        match state.history.get(&normalize_symbol(symbol)) {
            Some(ring) => {
                let skip = limit.map_or(0, |n| ring.len().saturating_sub(n));
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Every symbol with an in-progress candle or closed history, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let state = self.state.lock();
        let set: HashSet<&String> = state.current.keys().chain(state.history.keys()).collect();
        let mut symbols: Vec<String> = set.into_iter().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            ticks_processed: self.counters.ticks_processed.load(Ordering::Relaxed),
            ticks_rejected: self.counters.ticks_rejected.load(Ordering::Relaxed),
            candles_closed: self.counters.candles_closed.load(Ordering::Relaxed),
            candles_force_closed: self.counters.candles_force_closed.load(Ordering::Relaxed),
            callback_failures: self.callbacks.failures(),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the boundary-enforcement task. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("aggregator already running");
            return;
        }
        self.shutdown.send_replace(false);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(run_boundary_task(Arc::clone(self), shutdown));
        *self.boundary_task.lock() = Some(handle);
        info!(
            interval_secs = self.settings.interval.as_secs(),
            history_size = self.settings.history_size,
            "OHLC aggregator started"
        );
    }

    /// Stop the boundary task, wait for it to exit, then flush every
    /// in-progress candle. Returns the flushed candles.
    pub async fn stop(&self) -> Vec<Candle> {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let handle = self.boundary_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "boundary task did not exit cleanly");
            }
        }

        let flushed = self.close_all_candles();
        info!(flushed = flushed.len(), "OHLC aggregator stopped");
        flushed
    }
}

// ---------------------------------------------------------------------------
// Boundary-enforcement task
// ---------------------------------------------------------------------------

/// Time from `now` until the next bucket boundary, plus `buffer`.
///
/// Computed from the wall clock on every cycle so sleep overshoot never
/// accumulates.
pub fn next_boundary_delay(now: DateTime<Utc>, interval: Duration, buffer: Duration) -> Duration {
    let step = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
    let now_ms = now.timestamp_millis();
    let into_bucket = now_ms.rem_euclid(step as i64) as u64;
    Duration::from_millis(step - into_bucket) + buffer
}

async fn run_boundary_task(aggregator: Arc<OhlcAggregator>, mut shutdown: watch::Receiver<bool>) {
    let interval = aggregator.settings.interval;
    let buffer = aggregator.settings.boundary_buffer;
    info!(buffer_ms = buffer.as_millis() as u64, "candle boundary task started");

    loop {
        if *shutdown.borrow() || !aggregator.is_running() {
            break;
        }

        let delay = next_boundary_delay(Utc::now(), interval, buffer);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if !aggregator.is_running() {
            break;
        }

        let closed = aggregator.close_stale_candles(Utc::now());
        if !closed.is_empty() {
            debug!(count = closed.len(), "boundary task force-closed stale candles");
        }
    }

    info!("candle boundary task stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn tick(symbol: &str, price: &str, size: &str, ts: DateTime<Utc>) -> Tick {
        Tick::new(symbol, dec(price), dec(size), ts, None).unwrap()
    }

    fn aggregator(history_size: usize) -> OhlcAggregator {
        OhlcAggregator::new(AggregatorSettings {
            history_size,
            ..AggregatorSettings::default()
        })
    }

    #[test]
    fn tick_in_next_minute_closes_previous_candle() {
        let agg = aggregator(100);
        assert!(agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 0, 5))).is_none());
        assert!(agg.process_tick(&tick("BTCUSDT", "105", "2", at(0, 0, 40))).is_none());

        let closed = agg
            .process_tick(&tick("BTCUSDT", "102", "0.5", at(0, 1, 10)))
            .expect("minute rolled");

        assert_eq!(closed.open, dec("100"));
        assert_eq!(closed.high, dec("105"));
        assert_eq!(closed.low, dec("100"));
        assert_eq!(closed.close, dec("105"));
        assert_eq!(closed.volume, dec("3"));
        assert_eq!(closed.tick_count, 2);
        assert_eq!(closed.timestamp, at(0, 0, 0));
        assert!(closed.is_closed);

        let current = agg.get_current_candle("BTCUSDT").unwrap();
        assert_eq!(current.timestamp, at(0, 1, 0));
        for price in [current.open, current.high, current.low, current.close] {
            assert_eq!(price, dec("102"));
        }
        assert!(!current.is_closed);
        assert_eq!(agg.get_history("BTCUSDT", None), vec![closed]);
    }

    #[test]
    fn symbols_are_aggregated_independently() {
        let agg = aggregator(100);
        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 0, 1)));
        agg.process_tick(&tick("ETHUSDT", "10", "1", at(0, 0, 2)));
        let closed = agg.process_tick(&tick("ETHUSDT", "11", "1", at(0, 1, 0))).unwrap();

        assert_eq!(closed.symbol, "ETHUSDT");
        assert_eq!(agg.get_current_candle("btcusdt").unwrap().timestamp, at(0, 0, 0));
        assert!(agg.get_history("BTCUSDT", None).is_empty());
        assert_eq!(agg.symbols(), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn history_is_bounded_and_evicts_oldest() {
        let agg = aggregator(3);
        for minute in 0..6 {
            agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, minute, 30)));
        }
        let history = agg.get_history("BTCUSDT", None);
        assert_eq!(history.len(), 3);
        let buckets: Vec<_> = history.iter().map(|c| c.timestamp).collect();
        assert_eq!(buckets, vec![at(0, 2, 0), at(0, 3, 0), at(0, 4, 0)]);

        let last_two = agg.get_history("BTCUSDT", Some(2));
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].timestamp, at(0, 3, 0));
        assert!(agg.get_history("BTCUSDT", Some(0)).is_empty());
        assert_eq!(agg.get_history("BTCUSDT", Some(50)).len(), 3);
    }

    #[test]
    fn silent_symbol_is_closed_by_boundary_scan() {
        let agg = aggregator(100);
        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 0, 10)));
        agg.process_tick(&tick("ETHUSDT", "10", "1", at(0, 1, 5)));

        // Still inside minute 0: nothing is stale.
        assert!(agg.close_stale_candles(at(0, 0, 59)).is_empty());

        // Shortly after the 00:01 boundary only the minute-0 candle closes.
        let closed = agg.close_stale_candles(at(0, 1, 0) + chrono::Duration::milliseconds(100));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].symbol, "BTCUSDT");
        assert_eq!(closed[0].tick_count, 1);
        assert!(agg.get_current_candle("BTCUSDT").is_none());
        assert!(agg.get_current_candle("ETHUSDT").is_some());

        // Running the scan again in the same minute closes nothing twice.
        assert!(agg.close_stale_candles(at(0, 1, 30)).is_empty());
        assert_eq!(agg.get_history("BTCUSDT", None).len(), 1);
        assert_eq!(agg.stats().candles_force_closed, 1);
    }

    #[test]
    fn late_tick_for_force_closed_bucket_is_rejected() {
        let agg = aggregator(100);
        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 0, 10)));
        agg.close_stale_candles(at(0, 1, 0));

        assert!(agg.process_tick(&tick("BTCUSDT", "99", "1", at(0, 0, 59))).is_none());
        assert!(agg.get_current_candle("BTCUSDT").is_none());
        assert_eq!(agg.stats().ticks_rejected, 1);

        agg.process_tick(&tick("BTCUSDT", "101", "1", at(0, 1, 2)));
        assert_eq!(agg.get_current_candle("BTCUSDT").unwrap().timestamp, at(0, 1, 0));
    }

    #[test]
    fn tick_before_in_progress_bucket_is_dropped() {
        let agg = aggregator(100);
        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 5, 0)));
        let before = agg.get_current_candle("BTCUSDT").unwrap();

        assert!(agg.process_tick(&tick("BTCUSDT", "1", "9", at(0, 4, 59))).is_none());

        assert_eq!(agg.get_current_candle("BTCUSDT").unwrap(), before);
        assert!(agg.get_history("BTCUSDT", None).is_empty());
        let stats = agg.stats();
        assert_eq!(stats.ticks_rejected, 1);
        assert_eq!(stats.ticks_processed, 1);
    }

    #[test]
    fn reconnect_gap_within_same_minute_keeps_one_candle() {
        let agg = aggregator(100);
        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 0, 10)));
        // connection dropped here; ticks resume later in the same minute
        agg.process_tick(&tick("BTCUSDT", "98", "1", at(0, 0, 50)));
        let current = agg.get_current_candle("BTCUSDT").unwrap();
        assert_eq!(current.tick_count, 2);
        assert!(agg.get_history("BTCUSDT", None).is_empty());

        // resumes two minutes later: minute 0 closes, minute 1 never existed
        let closed = agg.process_tick(&tick("BTCUSDT", "97", "1", at(0, 2, 5))).unwrap();
        assert_eq!(closed.timestamp, at(0, 0, 0));
        assert_eq!(agg.get_current_candle("BTCUSDT").unwrap().timestamp, at(0, 2, 0));
    }

    #[test]
    fn callbacks_see_closed_candle_and_can_read_back() {
        let agg = Arc::new(aggregator(100));
        let seen = Arc::new(Mutex::new(Vec::new()));

        agg.add_candle_callback(|_: &Candle| anyhow::bail!("strategy offline"));
        let reader = Arc::clone(&agg);
        let s = seen.clone();
        agg.add_candle_callback(move |c: &Candle| {
            let history = reader.get_history(&c.symbol, None);
            s.lock().push((c.timestamp, history.len()));
            Ok(())
        });

        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 0, 10)));
        agg.process_tick(&tick("BTCUSDT", "101", "1", at(0, 1, 10)));
        agg.close_stale_candles(at(0, 2, 0));

        assert_eq!(*seen.lock(), vec![(at(0, 0, 0), 1), (at(0, 1, 0), 2)]);
        let stats = agg.stats();
        assert_eq!(stats.callback_failures, 2);
        assert_eq!(stats.candles_closed, 2);
    }

    #[test]
    fn removed_candle_callback_is_not_invoked() {
        let agg = aggregator(100);
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let id = agg.add_candle_callback(move |_: &Candle| {
            h.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        assert!(agg.remove_candle_callback(id));

        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 0, 10)));
        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 1, 10)));
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn snapshots_do_not_alias_live_state() {
        let agg = aggregator(100);
        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 0, 10)));
        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 1, 10)));

        let history = agg.get_history("BTCUSDT", None);
        let current = agg.get_current_candle("BTCUSDT").unwrap();
        let all = agg.get_all_current_candles();

        agg.process_tick(&tick("BTCUSDT", "150", "4", at(0, 1, 20)));
        agg.process_tick(&tick("BTCUSDT", "90", "1", at(0, 2, 0)));

        assert_eq!(history.len(), 1);
        assert_eq!(current.high, dec("100"));
        assert_eq!(current.tick_count, 1);
        assert_eq!(all["BTCUSDT"].tick_count, 1);
        assert_eq!(agg.get_history("BTCUSDT", None).len(), 2);
    }

    #[test]
    fn close_all_flushes_every_symbol() {
        let agg = aggregator(100);
        agg.process_tick(&tick("BTCUSDT", "100", "1", at(0, 0, 10)));
        agg.process_tick(&tick("ETHUSDT", "10", "1", at(0, 0, 20)));

        let closed = agg.close_all_candles();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|c| c.is_closed));
        assert!(agg.get_all_current_candles().is_empty());
        assert!(agg.close_all_candles().is_empty());
    }

    #[test]
    fn next_boundary_delay_aligns_to_wall_clock() {
        let interval = Duration::from_secs(60);
        let buffer = Duration::from_millis(100);

        let d = next_boundary_delay(at(0, 0, 15), interval, buffer);
        assert_eq!(d, Duration::from_millis(45_100));

        let just_after = at(0, 1, 0) + chrono::Duration::milliseconds(100);
        let d = next_boundary_delay(just_after, interval, buffer);
        assert_eq!(d, Duration::from_millis(60_000));

        let d = next_boundary_delay(at(0, 2, 0), interval, Duration::ZERO);
        assert_eq!(d, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn start_and_stop_flushes_in_progress_candles() {
        let agg = Arc::new(aggregator(10));
        agg.start();
        agg.start();
        assert!(agg.is_running());

        agg.process_tick(&tick("BTCUSDT", "100", "1", Utc::now()));
        let flushed = tokio::time::timeout(Duration::from_secs(5), agg.stop())
            .await
            .expect("stop returns promptly");

        assert!(!agg.is_running());
        assert_eq!(flushed.len(), 1);
        assert_eq!(agg.get_history("BTCUSDT", None).len(), 1);
        assert!(agg.get_current_candle("BTCUSDT").is_none());
    }

    #[test]
    fn volume_overflow_is_rejected_without_touching_candle() {
        let agg = aggregator(10);
        let max = Decimal::MAX.to_string();
        agg.process_tick(&tick("BTCUSDT", "100", &max, at(0, 0, 1)));
        let before = agg.get_current_candle("BTCUSDT").unwrap();

        let closed = agg.process_tick(&tick("BTCUSDT", "200", &max, at(0, 0, 2)));

        assert!(closed.is_none());
        assert_eq!(agg.get_current_candle("BTCUSDT").unwrap(), before);
        let stats = agg.stats();
        assert_eq!(stats.ticks_rejected, 1);
        assert_eq!(stats.ticks_processed, 1);

        let closed = agg.close_all_candles();
        assert_eq!(closed[0].high, dec("100"));
        assert_eq!(closed[0].tick_count, 1);
    }

    #[test]
    fn concurrent_closes_publish_in_bucket_order() {
        let agg = Arc::new(aggregator(1_000));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        agg.add_candle_callback(move |c: &Candle| {
            s.lock().push(c.timestamp);
            Ok(())
        });

        let feeder = {
            let agg = agg.clone();
            std::thread::spawn(move || {
                for minute in 0..200i64 {
                    let ts = at(0, 0, 0) + chrono::Duration::minutes(minute);
                    agg.process_tick(&tick("BTCUSDT", "100", "1", ts));
                }
            })
        };
        let closer = {
            let agg = agg.clone();
            std::thread::spawn(move || {
                for minute in 0..200i64 {
                    agg.close_stale_candles(at(0, 0, 0) + chrono::Duration::minutes(minute + 1));
                }
            })
        };
        feeder.join().unwrap();
        closer.join().unwrap();
        agg.close_all_candles();

        let seen = seen.lock();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
        let history: Vec<_> = agg
            .get_history("BTCUSDT", None)
            .into_iter()
            .map(|c| c.timestamp)
            .collect();
        assert_eq!(history, *seen);
    }

    #[tokio::test]
    async fn boundary_task_closes_silent_candle() {
        let agg = Arc::new(OhlcAggregator::new(AggregatorSettings {
            interval: Duration::from_secs(1),
            history_size: 10,
            boundary_buffer: Duration::from_millis(50),
            slow_callback_warn: Duration::from_secs(1),
        }));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        agg.add_candle_callback(move |c: &Candle| {
            let _ = tx.send(c.clone());
            Ok(())
        });
        agg.start();

        agg.process_tick(&tick("BTCUSDT", "100", "1", Utc::now()));
        let closed = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("closed by the boundary task")
            .expect("channel open");

        assert!(closed.is_closed);
        assert_eq!(closed.tick_count, 1);
        assert!(agg.get_current_candle("BTCUSDT").is_none());
        assert_eq!(agg.stats().candles_force_closed, 1);
        assert_eq!(agg.get_history("BTCUSDT", None), vec![closed]);

        let flushed = tokio::time::timeout(Duration::from_secs(5), agg.stop()).await.unwrap();
        assert!(flushed.is_empty());
    }

    mod properties {
        use std::sync::Arc;

        use chrono::{TimeZone, Utc};
        use parking_lot::{Mutex, ReentrantMutex};
        use proptest::prelude::*;
        use rust_decimal::Decimal;

        use super::aggregator;
        use crate::types::{Candle, Tick};

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                .. ProptestConfig::default()
            })]

            #[test]
            fn candles_fold_ticks_and_never_overlap(
                steps in prop::collection::vec((0i64..90_000, 1i64..1_000_000, 0i64..10_000), 1..200),
                history_size in 1usize..20,
            ) {
                let agg = aggregator(history_size);
                let closed_log = Arc::new(Mutex::new(Vec::new()));
                let log = closed_log.clone();
                agg.add_candle_callback(move |c: &Candle| {
                    log.lock().push(c.clone());
                    Ok(())
                });

                let mut ts_ms = 1_700_000_000_000i64;
                let mut total_volume = Decimal::ZERO;
                for (gap, price, size) in &steps {
                    ts_ms += gap;
                    let ts = Utc.timestamp_millis_opt(ts_ms).unwrap();
                    let t = Tick::new("BTCUSDT", Decimal::new(*price, 2), Decimal::new(*size, 3), ts, None).unwrap();
                    total_volume += t.quantity();
                    agg.process_tick(&t);
                }
                agg.close_all_candles();

                let all = closed_log.lock().clone();
                prop_assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
                prop_assert_eq!(all.iter().map(|c| c.tick_count).sum::<u64>(), steps.len() as u64);
                prop_assert_eq!(all.iter().map(|c| c.volume).sum::<Decimal>(), total_volume);
                for c in &all {
                    prop_assert!(c.low <= c.open && c.low <= c.close && c.low <= c.high);
                    prop_assert!(c.high >= c.open && c.high >= c.close);
                    prop_assert_eq!(c.timestamp.timestamp_millis() % 60_000, 0);
                }

                let history = agg.get_history("BTCUSDT", None);
                prop_assert!(history.len() <= history_size);
                prop_assert_eq!(&history[..], &all[all.len() - history.len()..]);
                prop_assert_eq!(agg.stats().ticks_rejected, 0);
            }
        }
    }
}
