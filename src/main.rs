// =============================================================================
// OHLC Stream: Main Entry Point
// =============================================================================
//
// Streams live trades for the configured symbols, keeps the latest tick per
// symbol and folds trades into 1-minute OHLC candles.  The config file is
// re-read periodically so symbols can be added or removed without a restart.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod callbacks;
mod market_data;
mod runtime_config;
mod types;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::market_data::{OhlcAggregator, StreamClient, TickStore};
use crate::runtime_config::RuntimeConfig;
use crate::types::{Candle, Tick};

const DEFAULT_CONFIG_PATH: &str = "runtime_config.json";
const STATUS_LOG_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("OHLC stream starting up");

    let config_path = PathBuf::from(
        std::env::var("OHLC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let symbols_override = std::env::var("OHLC_SYMBOLS").ok();

    let mut config = load_or_init_config(&config_path);
    if let Some(raw) = &symbols_override {
        config.apply_symbols_override(raw);
        info!(symbols = ?config.symbols, "symbols overridden from OHLC_SYMBOLS");
    }
    config.validate()?;

    if config.symbols.is_empty() {
        warn!("no symbols configured; the stream stays idle until one is added");
    }

    // ── 2. Components ────────────────────────────────────────────────────
    let tick_store = Arc::new(TickStore::with_slow_callback_warn(Duration::from_millis(
        config.slow_callback_warn_ms,
    )));
    let aggregator = Arc::new(OhlcAggregator::new(config.aggregator_settings()));
    let stream = Arc::new(StreamClient::new(
        config.stream_settings(),
        tick_store.clone(),
        &config.symbols,
    ));

    // ── 3. Wiring ────────────────────────────────────────────────────────
    tick_store.subscribe(|tick: &Tick| {
        debug!(
            symbol = %tick.symbol(),
            price = %tick.price(),
            qty = %tick.quantity(),
            "trade"
        );
        Ok(())
    });

    {
        let aggregator = aggregator.clone();
        stream.add_tick_callback(move |tick: &Tick| {
            aggregator.process_tick(tick);
            Ok(())
        });
    }

    aggregator.add_candle_callback(|candle: &Candle| {
        let json = serde_json::to_string(candle)?;
        debug!(candle = %json, "candle emitted");
        Ok(())
    });

    // ── 4. Start ─────────────────────────────────────────────────────────
    aggregator.start();
    stream.start();

    // ── 5. Status logger ─────────────────────────────────────────────────
    let status_task = {
        let stream = stream.clone();
        let aggregator = aggregator.clone();
        let tick_store = tick_store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(STATUS_LOG_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                let s = stream.stats();
                let a = aggregator.stats();
                info!(
                    state = %stream.state(),
                    symbols = ?stream.subscribed_symbols(),
                    messages = s.messages_received,
                    ticks = s.ticks_delivered,
                    decode_errors = s.decode_errors,
                    reconnects = s.reconnects,
                    candles_closed = a.candles_closed,
                    ticks_rejected = a.ticks_rejected,
                    callback_failures = s.callback_failures + a.callback_failures
                        + tick_store.subscriber_failures(),
                    "status"
                );
                for (symbol, candle) in aggregator.get_all_current_candles() {
                    let last = tick_store.get(&symbol).map(|t| t.price());
                    debug!(symbol = %symbol, candle = %candle, last_price = ?last, "in-progress candle");
                }
            }
        })
    };

    // ── 6. Config hot-reload (symbol changes) ────────────────────────────
    let reload_task = {
        let stream = stream.clone();
        let path = config_path.clone();
        let every = Duration::from_secs(config.config_reload_secs.max(1));
        let pinned = symbols_override.is_some();
        tokio::spawn(async move {
            if pinned {
                info!("symbols pinned by OHLC_SYMBOLS; config reload disabled");
                return;
            }
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !path.exists() {
                    continue;
                }
                match RuntimeConfig::load(&path) {
                    Ok(cfg) => {
                        let (added, removed) = apply_symbol_changes(&stream, &cfg.symbols);
                        if added + removed > 0 {
                            info!(added, removed, "symbol set updated from config");
                        }
                    }
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "config reload failed; keeping current symbols")
                    }
                }
            }
        })
    };

    info!("all subsystems running; press Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received; stopping gracefully");

    reload_task.abort();
    status_task.abort();

    stream.stop().await;
    let flushed = aggregator.stop().await;
    info!(flushed = flushed.len(), "final candles flushed");

    info!("OHLC stream shut down complete");
    Ok(())
}

/// Load the config at `path`. A missing file is created from defaults; an
/// unreadable or invalid one falls back to defaults without being touched.
fn load_or_init_config(path: &Path) -> RuntimeConfig {
    if !path.exists() {
        let config = RuntimeConfig::default();
        if let Err(e) = config.save(path) {
            error!(error = %format!("{e:#}"), "failed to write default config");
        }
        return config;
    }
    RuntimeConfig::load(path).unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "failed to load config, using defaults");
        RuntimeConfig::default()
    })
}

/// Bring the stream's subscription set in line with `desired`. Returns the
/// number of symbols added and removed.
fn apply_symbol_changes(stream: &StreamClient, desired: &[String]) -> (usize, usize) {
    let desired: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
    let current = stream.subscribed_symbols();

    let removed = current
        .iter()
        .filter(|s| !desired.contains(s.as_str()))
        .filter(|s| stream.unsubscribe(s))
        .count();
    let added = desired.iter().filter(|s| stream.subscribe(s)).count();
    (added, removed)
}
