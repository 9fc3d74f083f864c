// =============================================================================
// Trade Stream Client: resilient multiplexed trade feed
// =============================================================================
//
// Keeps one combined-stream WebSocket open for the current symbol set
// (`<base>?streams=btcusdt@trade/ethusdt@trade`), decodes every text frame
// into a `Tick`, stores it in the `TickStore`, then fans it out to the tick
// callbacks (the aggregator, chiefly).
//
// Connection state machine:
//
//   Disconnected -> Connecting -> Streaming -> Disconnected -> ... -> Stopped
//
// Any transport failure, server close, or keepalive timeout drops back to
// Disconnected and retries after `reconnect_delay`, forever, while running.
// A change to the symbol set closes the socket on purpose and reconnects
// straight away with the new stream list.  `Stopped` is reached only through
// `stop()`.
//
// A frame that fails to decode is logged and counted; it never ends the
// connection.
// =============================================================================

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::callbacks::{CallbackId, CallbackList};
use crate::market_data::tick_store::TickStore;
use crate::types::{normalize_symbol, Tick};

// ---------------------------------------------------------------------------
// Settings, state, stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Combined-stream endpoint, without the `streams` query.
    pub base_url: String,
    pub reconnect_delay: Duration,
    /// Interval between outbound WebSocket pings.
    pub ping_interval: Duration,
    /// No inbound frame for this long is treated as a dead connection.
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub slow_callback_warn: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            base_url: "wss://stream.testnet.binance.vision/stream".to_string(),
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            slow_callback_warn: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub messages_received: u64,
    pub ticks_delivered: u64,
    pub decode_errors: u64,
    pub connections: u64,
    pub reconnects: u64,
    pub callback_failures: u64,
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    ticks_delivered: AtomicU64,
    decode_errors: AtomicU64,
    connections: AtomicU64,
    reconnects: AtomicU64,
}

/// Why a streaming session ended without an error.
enum SessionEnd {
    Shutdown,
    Resubscribe,
    ClosedByServer,
}

// ---------------------------------------------------------------------------
// StreamClient
// ---------------------------------------------------------------------------

pub struct StreamClient {
    settings: StreamSettings,
    tick_store: Arc<TickStore>,
    callbacks: CallbackList<Tick>,
    /// Upper-case symbols; the connection loop watches this for changes.
    symbols: watch::Sender<BTreeSet<String>>,
    state: RwLock<ConnectionState>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl StreamClient {
    pub fn new(settings: StreamSettings, tick_store: Arc<TickStore>, symbols: &[String]) -> Self {
        let initial: BTreeSet<String> = symbols
            .iter()
            .map(|s| normalize_symbol(s))
            .filter(|s| !s.is_empty())
            .collect();
        let (symbols, _) = watch::channel(initial);
        let (shutdown, _) = watch::channel(false);
        Self {
            callbacks: CallbackList::new("ticks", settings.slow_callback_warn),
            settings,
            tick_store,
            symbols,
            state: RwLock::new(ConnectionState::Disconnected),
            running: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Register a tick consumer. Safe to call before or after `start()`.
    pub fn add_tick_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Tick) -> Result<()> + Send + Sync + 'static,
    {
        self.callbacks.add(callback)
    }

    pub fn remove_tick_callback(&self, id: CallbackId) -> bool {
        self.callbacks.remove(id)
    }

    /// Add `symbol` to the stream set. Returns `false` if it was already
    /// subscribed. A live connection is re-established with the new set.
    pub fn subscribe(&self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return false;
        }
        let added = self.symbols.send_if_modified(|set| set.insert(symbol.clone()));
        if added {
            info!(symbol = %symbol, state = %self.state(), "symbol added to subscription list");
        }
        added
    }

    /// Remove `symbol` from the stream set. Returns `false` if it was not
    /// subscribed.
    pub fn unsubscribe(&self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        let removed = self.symbols.send_if_modified(|set| set.remove(&symbol));
        if removed {
            info!(symbol = %symbol, state = %self.state(), "symbol removed from subscription list");
        }
        removed
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.symbols.borrow().iter().cloned().collect()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            ticks_delivered: self.counters.ticks_delivered.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            connections: self.counters.connections.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            callback_failures: self.callbacks.failures(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            debug!(from = %prev, to = %next, "trade stream state change");
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Launch the connection loop and return immediately. No-op if running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("trade stream client is already running");
            return;
        }
        self.shutdown.send_replace(false);
        self.set_state(ConnectionState::Disconnected);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(Arc::clone(self).run(shutdown));
        *self.task.lock() = Some(handle);
        info!(symbols = ?self.subscribed_symbols(), "trade stream client started");
    }

    /// Signal shutdown and wait for the connection loop to exit. Once this
    /// returns no tick callback fires again.
    pub async fn stop(&self) {
        info!("stopping trade stream client");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "trade stream task did not exit cleanly");
            }
        }
        self.set_state(ConnectionState::Stopped);
        info!("trade stream client stopped");
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut symbols_rx = self.symbols.subscribe();
        let mut attempted = false;

        while self.is_running() {
            let symbols = symbols_rx.borrow_and_update().clone();
            let Some(url) = build_stream_url(&self.settings.base_url, &symbols) else {
                self.set_state(ConnectionState::Disconnected);
                info!("no symbols subscribed; waiting for a subscription");
                tokio::select! {
                    changed = symbols_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            if attempted {
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            attempted = true;

            self.set_state(ConnectionState::Connecting);
            let outcome = self
                .stream_session(&url, &symbols, &mut symbols_rx, &mut shutdown)
                .await;
            self.set_state(ConnectionState::Disconnected);

            let delay = match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Resubscribe) => {
                    info!("reconnecting to apply subscription change");
                    None
                }
                Ok(SessionEnd::ClosedByServer) => {
                    warn!("trade WebSocket closed by server");
                    Some(self.settings.reconnect_delay)
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "trade WebSocket error");
                    Some(self.settings.reconnect_delay)
                }
            };

            if !self.is_running() {
                break;
            }
            if let Some(delay) = delay {
                info!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        self.set_state(ConnectionState::Stopped);
        info!("trade stream loop exited");
    }

    /// One connect-and-read cycle. Returns when the socket is gone.
    async fn stream_session(
        &self,
        url: &str,
        symbols: &BTreeSet<String>,
        symbols_rx: &mut watch::Receiver<BTreeSet<String>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        info!(symbols = ?symbols, "connecting to trade WebSocket");

        let connect = tokio::time::timeout(self.settings.connect_timeout, connect_async(url));
        let (ws_stream, _response) = tokio::select! {
            res = connect => res
                .context("timed out connecting to trade WebSocket")?
                .context("failed to connect to trade WebSocket")?,
            _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
        };

        self.counters.connections.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Streaming);
        info!(streams = symbols.len(), "trade WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let mut ping = interval_at(Instant::now() + self.settings.ping_interval, self.settings.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    close_quietly(&mut write).await;
                    return Ok(SessionEnd::Shutdown);
                }
                changed = symbols_rx.changed() => {
                    if changed.is_err() {
                        close_quietly(&mut write).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                    close_quietly(&mut write).await;
                    return Ok(SessionEnd::Resubscribe);
                }
                _ = ping.tick() => {
                    let silent = last_inbound.elapsed();
                    if silent > self.settings.ping_timeout {
                        bail!("keepalive timeout: no frame for {} ms", silent.as_millis());
                    }
                    send_within(&mut write, Message::Ping(Vec::new()), self.settings.ping_timeout)
                        .await
                        .context("failed to send keepalive ping")?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_inbound = Instant::now();
                            if !self.is_running() {
                                return Ok(SessionEnd::Shutdown);
                            }
                            self.handle_message(&text);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(frame = ?frame, "close frame received");
                            return Ok(SessionEnd::ClosedByServer);
                        }
                        Some(Ok(_)) => {
                            // Ping / Pong / Binary: liveness only. tungstenite
                            // answers server pings itself.
                            last_inbound = Instant::now();
                        }
                        Some(Err(e)) => {
                            return Err(e).context("trade WebSocket read error");
                        }
                        None => return Ok(SessionEnd::ClosedByServer),
                    }
                }
            }
        }
    }

    /// Decode one raw frame and deliver it. Decode failures are logged and
    /// counted, never propagated. Returns whether a tick was delivered.
    pub fn handle_message(&self, text: &str) -> bool {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        match decode_trade_message(text) {
            Ok(tick) => {
                self.tick_store.update(tick.clone());
                self.callbacks.dispatch(&tick);
                self.counters.ticks_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %format!("{e:#}"), "failed to decode trade message");
                false
            }
        }
    }
}

/// Send one frame, failing if the sink does not accept it within `limit`.
async fn send_within<S>(write: &mut S, msg: Message, limit: Duration) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    match tokio::time::timeout(limit, write.send(msg)).await {
        Ok(sent) => sent.map_err(anyhow::Error::from),
        Err(_) => bail!("send stalled for {} ms", limit.as_millis()),
    }
}

async fn close_quietly<S>(write: &mut S)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let _ = tokio::time::timeout(Duration::from_secs(1), write.send(Message::Close(None))).await;
}

// ---------------------------------------------------------------------------
// URL & decoding
// ---------------------------------------------------------------------------

/// Build the combined-stream URL for `symbols`, or `None` when the set is
/// empty.
pub fn build_stream_url(base_url: &str, symbols: &BTreeSet<String>) -> Option<String> {
    if symbols.is_empty() {
        return None;
    }
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@trade", s.to_lowercase()))
        .collect();
    Some(format!("{base_url}?streams={}", streams.join("/")))
}

/// Parse one combined-stream trade message.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@trade",
///   "data": { "p": "37000.10", "q": "0.015", "T": 1700000000000, "t": 12345 } }
/// ```
pub fn decode_trade_message(text: &str) -> Result<Tick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;

    let stream = root["stream"].as_str().context("missing field stream")?;
    let (symbol, kind) = stream
        .split_once('@')
        .with_context(|| format!("malformed stream name {stream}"))?;
    if kind != "trade" || symbol.is_empty() {
        bail!("unexpected stream {stream}");
    }

    let data = &root["data"];
    if !data.is_object() {
        bail!("missing object field data");
    }

    let price = parse_decimal(&data["p"], "data.p")?;
    let quantity = parse_decimal(&data["q"], "data.q")?;
    let trade_time = data["T"].as_i64().context("missing field data.T")?;
    let timestamp = Utc
        .timestamp_millis_opt(trade_time)
        .single()
        .with_context(|| format!("trade time {trade_time} out of range"))?;
    let trade_id = data["t"].as_u64();

    Tick::new(symbol, price, quantity, timestamp, trade_id).context("invalid trade")
}

/// Binance sends decimals as JSON strings; plain numbers are accepted too.
fn parse_decimal(val: &serde_json::Value, name: &str) -> Result<Decimal> {
    let raw = match val {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => bail!("missing field {name}"),
        _ => bail!("field {name} has unexpected JSON type"),
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .with_context(|| format!("failed to parse {name} as decimal: {raw}"))
}
