// =============================================================================
// Runtime Configuration: feed, aggregation and keepalive settings
// =============================================================================
//
// Loaded from a JSON file with atomic tmp + rename persistence.  All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
//
// Components never read this struct directly: `main` converts it into explicit
// `StreamSettings` / `AggregatorSettings` values that are passed to their
// constructors, so tests can build independent instances with their own
// settings.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::aggregator::AggregatorSettings;
use crate::market_data::trade_stream::StreamSettings;
use crate::types::normalize_symbol;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_stream_url() -> String {
    "wss://stream.testnet.binance.vision/stream".to_string()
}

fn default_candle_interval_secs() -> u64 {
    60
}

fn default_candle_history_size() -> usize {
    100
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_ping_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_boundary_buffer_ms() -> u64 {
    100
}

fn default_slow_callback_warn_ms() -> u64 {
    250
}

fn default_config_reload_secs() -> u64 {
    30
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the candle service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed ---------------------------------------------------------------

    /// Symbols to stream, e.g. `BTCUSDT`.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Combined-stream endpoint; `?streams=...` is appended per connection.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// Fixed wait between a dropped connection and the next attempt.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// How often a WebSocket ping is sent.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Silence longer than this (no frame of any kind) kills the connection.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    // --- Aggregation --------------------------------------------------------

    /// Candle bucket length. One minute in production.
    #[serde(default = "default_candle_interval_secs")]
    pub candle_interval_secs: u64,

    /// Closed candles retained per symbol.
    #[serde(default = "default_candle_history_size")]
    pub candle_history_size: usize,

    /// Delay after each bucket boundary before stale candles are force-closed.
    #[serde(default = "default_boundary_buffer_ms")]
    pub boundary_buffer_ms: u64,

    // --- Operational --------------------------------------------------------

    /// Callbacks slower than this are reported.
    #[serde(default = "default_slow_callback_warn_ms")]
    pub slow_callback_warn_ms: u64,

    /// How often the config file is re-read for symbol changes.
    #[serde(default = "default_config_reload_secs")]
    pub config_reload_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            stream_url: default_stream_url(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            candle_interval_secs: default_candle_interval_secs(),
            candle_history_size: default_candle_history_size(),
            boundary_buffer_ms: default_boundary_buffer_ms(),
            slow_callback_warn_ms: default_slow_callback_warn_ms(),
            config_reload_secs: default_config_reload_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Symbols are normalised and de-duplicated; the result is validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config.normalize();
        config
            .validate()
            .with_context(|| format!("invalid runtime config in {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            interval_secs = config.candle_interval_secs,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Replace the symbol list from a comma-separated value such as the
    /// `OHLC_SYMBOLS` environment variable. Blank entries are ignored.
    pub fn apply_symbols_override(&mut self, raw: &str) {
        self.symbols = raw
            .split(',')
            .map(normalize_symbol)
            .filter(|s| !s.is_empty())
            .collect();
        self.normalize();
    }

    /// Upper-case and de-duplicate symbols, keeping first-seen order.
    pub fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.symbols = self
            .symbols
            .iter()
            .map(|s| normalize_symbol(s))
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
    }

    pub fn validate(&self) -> Result<()> {
        if self.candle_interval_secs == 0 {
            bail!("candle_interval_secs must be > 0");
        }
        if self.candle_history_size == 0 {
            bail!("candle_history_size must be > 0");
        }
        if self.ping_interval_secs == 0 {
            bail!("ping_interval_secs must be > 0");
        }
        if self.ping_timeout_secs <= self.ping_interval_secs {
            bail!(
                "ping_timeout_secs ({}) must exceed ping_interval_secs ({})",
                self.ping_timeout_secs,
                self.ping_interval_secs
            );
        }
        if self.stream_url.is_empty() {
            bail!("stream_url must not be empty");
        }
        Ok(())
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            base_url: self.stream_url.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            slow_callback_warn: Duration::from_millis(self.slow_callback_warn_ms),
        }
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            interval: Duration::from_secs(self.candle_interval_secs),
            history_size: self.candle_history_size,
            boundary_buffer: Duration::from_millis(self.boundary_buffer_ms),
            slow_callback_warn: Duration::from_millis(self.slow_callback_warn_ms),
        }
    }
}
