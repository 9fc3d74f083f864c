// =============================================================================
// Market data value types: trades (ticks) and OHLC candles
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalise a user- or exchange-supplied symbol to its canonical upper-case
/// form (`btcusdt` -> `BTCUSDT`).
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Floor `ts` to the start of the bucket of length `interval` it falls into.
///
/// Buckets are aligned to the Unix epoch, so a one-minute interval zeroes the
/// seconds and sub-second components.
pub fn floor_to_bucket(ts: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1);
    let ms = ts.timestamp_millis();
    let floored = ms - ms.rem_euclid(step);
    Utc.timestamp_millis_opt(floored).single().unwrap_or(ts)
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// One observed trade. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tick {
    symbol: String,
    price: Decimal,
    quantity: Decimal,
    timestamp: DateTime<Utc>,
    trade_id: Option<u64>,
}

impl Tick {
    /// Build a tick, normalising the symbol.
    ///
    /// Rejects an empty symbol, a non-positive price and a negative quantity.
    pub fn new(
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        timestamp: DateTime<Utc>,
        trade_id: Option<u64>,
    ) -> Result<Self> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            bail!("tick symbol is empty");
        }
        if price <= Decimal::ZERO {
            bail!("tick price must be positive, got {price}");
        }
        if quantity < Decimal::ZERO {
            bail!("tick quantity must be non-negative, got {quantity}");
        }
        Ok(Self {
            symbol,
            price,
            quantity,
            timestamp,
            trade_id,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn trade_id(&self) -> Option<u64> {
        self.trade_id
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// An OHLC candle for one bucket of one symbol.
///
/// `timestamp` is the bucket start. Only the aggregator mutates candles, and
/// only while `is_closed` is false; every copy handed out is a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub timestamp: DateTime<Utc>,
    pub volume: Decimal,
    pub tick_count: u64,
    pub is_closed: bool,
}

impl Candle {
    /// Open a new in-progress candle from the first tick of `bucket`.
    pub fn from_tick(tick: &Tick, bucket: DateTime<Utc>) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            timestamp: bucket,
            volume: tick.quantity,
            tick_count: 1,
            is_closed: false,
        }
    }

    /// Fold a tick belonging to this candle's bucket. On error the candle is
    /// left untouched.
    pub(crate) fn apply(&mut self, tick: &Tick) -> Result<()> {
        if self.is_closed {
            bail!("candle {}@{} is already closed", self.symbol, self.timestamp);
        }
        let volume = match self.volume.checked_add(tick.quantity) {
            Some(v) => v,
            None => bail!(
                "volume overflow folding {} into {} for {}",
                tick.quantity,
                self.volume,
                self.symbol
            ),
        };
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume = volume;
        self.tick_count += 1;
        Ok(())
    }

    pub(crate) fn mark_closed(&mut self) {
        debug_assert!(!self.is_closed, "candle closed twice");
        self.is_closed = true;
    }
}

impl std::fmt::Display for Candle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} O={} H={} L={} C={} V={} n={}",
            self.symbol,
            self.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.tick_count
        )
    }
}
