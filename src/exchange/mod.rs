// =============================================================================
// Exchange capability — uniform read/write over USDT-M linear perpetuals
// =============================================================================
//
// One polymorphic capability set over the venues we support. Venue-specific
// quirks (endpoint shapes, client-id parameter naming, stop-order type
// fallbacks) live inside `UsdtmClient`; everything above this trait is
// venue-agnostic.
//
// Failure semantics follow the adapter contract:
//   - funding rate degrades to 0.0
//   - open interest degrades to None
//   - position-mode / margin-mode / leverage setters are best-effort and
//     succeed silently when the venue does not support them
//   - a missing SL order id means the monitor must enforce SL by price
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod client;
pub mod rate_limit;

pub use client::UsdtmClient;

/// Supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Mexc,
}

impl Venue {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Some(Self::Binance),
            "bybit" => Some(Self::Bybit),
            "mexc" => Some(Self::Mexc),
            _ => None,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Mexc => "mexc",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// One OHLCV bar: `[ts_ms, open, high, low, close, volume]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Reduced ticker view used by the selector, builder, and monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    /// 24h quote-asset volume in USDT, when the venue reports it.
    pub quote_volume: Option<f64>,
}

impl Ticker {
    /// Last traded price, falling back to the bid/ask mid.
    pub fn last_price(&self) -> Option<f64> {
        if let Some(l) = self.last {
            if l > 0.0 {
                return Some(l);
            }
        }
        match (self.bid, self.ask) {
            (Some(b), Some(a)) if b > 0.0 && a > 0.0 => Some((b + a) / 2.0),
            _ => None,
        }
    }
}

/// Sizing constraints for a market.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketConstraints {
    pub min_notional_usdt: f64,
    pub min_qty: Option<f64>,
    pub qty_step: Option<f64>,
}

impl Default for MarketConstraints {
    fn default() -> Self {
        Self {
            min_notional_usdt: 5.0,
            min_qty: None,
            qty_step: None,
        }
    }
}

/// Order ids returned from bracket placement. Any leg may be missing when the
/// venue rejected or does not support it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BracketIds {
    pub entry_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub entry_avg_price: Option<f64>,
    pub entry_timestamp_ms: Option<i64>,
}

/// Normalized view of a fetched order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: String,
    /// Lower-cased venue status, e.g. "filled", "closed", "new", "canceled".
    pub status: String,
    pub avg_price: Option<f64>,
}

impl OrderStatus {
    pub fn is_filled(&self) -> bool {
        matches!(self.status.as_str(), "filled" | "closed")
    }
}

/// Uniform capability set over USDT-M futures venues.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Venue identifier, e.g. "binance".
    fn exchange_id(&self) -> &str;

    /// Active USDT-M perpetual symbols in compact user form (`BTCUSDT`):
    /// contract markets quoted and settled in USDT, not inverse.
    async fn list_active_usdtm_symbols(&self) -> anyhow::Result<Vec<String>>;

    /// Batch ticker fetch, keyed by user symbol. Symbols the venue does not
    /// report are simply absent from the map.
    async fn fetch_tickers(
        &self,
        symbols: &[String],
    ) -> anyhow::Result<std::collections::HashMap<String, Ticker>>;

    async fn fetch_ticker(&self, symbol: &str) -> anyhow::Result<Ticker>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        since_ms: Option<i64>,
    ) -> anyhow::Result<Vec<Ohlcv>>;

    /// Latest funding rate; 0.0 when unavailable.
    async fn fetch_funding_rate(&self, symbol: &str) -> f64;

    /// Open interest in contracts; None when unavailable.
    async fn fetch_open_interest(&self, symbol: &str) -> Option<f64>;

    /// `(equity_usdt, free_usdt)` for the USDT futures wallet.
    async fn fetch_usdt_balance(&self) -> anyhow::Result<(f64, f64)>;

    async fn market_constraints(&self, symbol: &str) -> anyhow::Result<MarketConstraints>;

    /// Best-effort: one-way (non-hedged) position mode.
    async fn set_oneway_mode(&self, symbol: &str);

    /// Best-effort: isolated margin.
    async fn set_isolated_margin(&self, symbol: &str);

    /// Best-effort: position leverage.
    async fn set_leverage(&self, symbol: &str, leverage: u32);

    /// Market entry + TP limit reduce-only + SL stop-market reduce-only.
    async fn place_entry_and_brackets(
        &self,
        symbol: &str,
        direction: crate::types::Direction,
        qty: f64,
        tp_price: f64,
        sl_price: f64,
        client_order_id: &str,
    ) -> anyhow::Result<BracketIds>;

    /// Fetch one order; None when it cannot be resolved.
    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Option<OrderStatus>;

    /// Cancel one order; false on failure (already gone, unsupported, ...).
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> bool;

    /// Signed position quantity (negative = short), 0.0 when flat/unknown.
    async fn fetch_position_qty(&self, symbol: &str) -> f64;
}

/// Parse a timeframe like "5m", "15m", "1h", "4h", "1d" into seconds.
/// Unknown inputs fall back to one minute.
pub fn tf_to_sec(tf: &str) -> i64 {
    let tf = tf.trim().to_lowercase();
    let (num, unit) = tf.split_at(tf.len().saturating_sub(1));
    let n: i64 = num.parse().unwrap_or(1);
    match unit {
        "m" => n * 60,
        "h" => n * 3_600,
        "d" => n * 86_400,
        _ => 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tf_parsing() {
        assert_eq!(tf_to_sec("5m"), 300);
        assert_eq!(tf_to_sec("15m"), 900);
        assert_eq!(tf_to_sec("1h"), 3600);
        assert_eq!(tf_to_sec("4h"), 14_400);
        assert_eq!(tf_to_sec("1d"), 86_400);
        assert_eq!(tf_to_sec("bogus"), 60);
    }

    #[test]
    fn ticker_last_price_falls_back_to_mid() {
        let t = Ticker {
            last: None,
            bid: Some(99.0),
            ask: Some(101.0),
            quote_volume: None,
        };
        assert_eq!(t.last_price(), Some(100.0));

        let t2 = Ticker::default();
        assert_eq!(t2.last_price(), None);
    }

    #[test]
    fn venue_parse() {
        assert_eq!(Venue::parse("Binance"), Some(Venue::Binance));
        assert_eq!(Venue::parse("bybit"), Some(Venue::Bybit));
        assert_eq!(Venue::parse("kraken"), None);
    }
}
