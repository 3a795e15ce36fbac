// =============================================================================
// Snapshot — immutable multi-timeframe market observation (schema v3)
// =============================================================================
//
// A snapshot is keyed on the last *closed* LTF bar and never mutated after
// construction. The id is a pure function of
// (exchange, symbol, ltf_tf, ltf_close_time, schema version), so rebuilding
// the same bar yields the same id in any process.
//
// Validation rejects outcome/decision leakage: a snapshot must never carry
// decision, execution, reward, or exit fields.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::errors::{DomainError, DomainResult};
use crate::indicators::structure::HhLlState;
use crate::types::Session;

pub const SCHEMA_VERSION: &str = "v3";

/// Keys that must never appear at the top level of a snapshot.
const FORBIDDEN_KEYS: [&str; 13] = [
    "decision",
    "execution_state",
    "reward_state",
    "risk_unit",
    "pnl",
    "pnl_raw",
    "pnl_r",
    "pnl_usdt",
    "exit_price",
    "exit_time_utc",
    "tp_price",
    "sl_price",
    "rr",
];

/// LTF volatility regime from ATR% thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolRegime {
    Dead,
    Normal,
    Expansion,
}

impl Default for VolRegime {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for VolRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dead => write!(f, "dead"),
            Self::Normal => write!(f, "normal"),
            Self::Expansion => write!(f, "expansion"),
        }
    }
}

/// HTF trend direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Flat,
}

impl Default for Trend {
    fn default() -> Self {
        Self::Flat
    }
}

/// HTF market regime: trending or ranging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    Trend,
    Range,
}

impl Default for MarketRegime {
    fn default() -> Self {
        Self::Range
    }
}

/// HTF volatility regime (coarser than the LTF one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HtfVolRegime {
    Normal,
    High,
}

impl Default for HtfVolRegime {
    fn default() -> Self {
        Self::Normal
    }
}

fn default_session() -> Session {
    Session::Asia
}

/// Last closed LTF bar plus derived volatility fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LtfPrice {
    #[serde(default)]
    pub open: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
    #[serde(default)]
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub range_pct: f64,
    #[serde(default)]
    pub atr_pct: f64,
    #[serde(default)]
    pub volatility_regime: VolRegime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroStructure {
    pub hh_ll_state: HhLlState,
    #[serde(default)]
    pub bos: bool,
    #[serde(default)]
    pub distance_to_structure: f64,
}

impl Default for MicroStructure {
    fn default() -> Self {
        Self {
            hh_ll_state: HhLlState::Hl,
            bos: false,
            distance_to_structure: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtfBlock {
    pub tf: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub price: LtfPrice,
    #[serde(default)]
    pub micro_structure: MicroStructure,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HtfBlock {
    #[serde(default)]
    pub trend: Trend,
    #[serde(default)]
    pub bos: bool,
    #[serde(default)]
    pub liquidity_state: Option<String>,
    #[serde(default)]
    pub market_regime: MarketRegime,
    #[serde(default)]
    pub volatility_regime: HtfVolRegime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBlock {
    #[serde(default = "default_session")]
    pub session: Session,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub funding_rate: f64,
    #[serde(default)]
    pub funding_zscore: f64,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub mid: Option<f64>,
    #[serde(default)]
    pub spread_pct: f64,
    #[serde(default)]
    pub daily_atr_pct: f64,
    #[serde(default)]
    pub daily_atr_ratio_30: f64,
}

impl Default for ContextBlock {
    fn default() -> Self {
        Self {
            session: Session::Asia,
            exchange: String::new(),
            funding_rate: 0.0,
            funding_zscore: 0.0,
            bid: None,
            ask: None,
            mid: None,
            spread_pct: 0.0,
            daily_atr_pct: 0.0,
            daily_atr_ratio_30: 0.0,
        }
    }
}

/// Immutable market snapshot, schema v3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: String,
    pub snapshot_id: String,
    pub snapshot_time_utc: i64,
    pub observer_time_utc: i64,
    pub symbol: String,
    pub ltf: LtfBlock,
    /// Required keys: "15m", "1h", "4h". BTreeMap keeps serialized order
    /// stable across runs.
    #[serde(default)]
    pub htf: BTreeMap<String, HtfBlock>,
    #[serde(default)]
    pub context: ContextBlock,
}

impl Snapshot {
    /// Deterministic snapshot id: first 20 hex chars of
    /// `sha1("{exchange}|{symbol}|{ltf_tf}|{ltf_close_time}|v3")`.
    pub fn compute_id(exchange: &str, symbol: &str, ltf_tf: &str, ltf_close_time: i64) -> String {
        let key = format!("{exchange}|{symbol}|{ltf_tf}|{ltf_close_time}|{SCHEMA_VERSION}");
        let digest = Sha1::digest(key.as_bytes());
        hex::encode(digest)[..20].to_string()
    }

    /// Validate and construct from a raw JSON value.
    ///
    /// Rejects: non-object input, forbidden (leakage) keys, wrong schema
    /// version, missing timestamps, `snapshot_time_utc > observer_time_utc`.
    pub fn from_value(value: serde_json::Value) -> DomainResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| DomainError::SnapshotInvalid("snapshot must be an object".into()))?;

        let forbidden: Vec<&str> = FORBIDDEN_KEYS
            .iter()
            .copied()
            .filter(|k| obj.contains_key(*k))
            .collect();
        if !forbidden.is_empty() {
            return Err(DomainError::SnapshotInvalid(format!(
                "forbidden fields present: {forbidden:?}"
            )));
        }

        if obj.get("schema_version").and_then(|v| v.as_str()) != Some(SCHEMA_VERSION) {
            return Err(DomainError::SnapshotInvalid(
                "schema_version must be 'v3'".into(),
            ));
        }

        let snap_time = obj
            .get("snapshot_time_utc")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DomainError::SnapshotInvalid("snapshot_time_utc missing".into()))?;
        let obs_time = obj
            .get("observer_time_utc")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DomainError::SnapshotInvalid("observer_time_utc missing".into()))?;
        if snap_time > obs_time {
            return Err(DomainError::SnapshotInvalid(
                "snapshot_time_utc must be <= observer_time_utc".into(),
            ));
        }
        if !obj.get("ltf").map(|v| v.is_object()).unwrap_or(false) {
            return Err(DomainError::SnapshotInvalid("ltf block missing".into()));
        }

        serde_json::from_value(value)
            .map_err(|e| DomainError::SnapshotInvalid(format!("malformed snapshot: {e}")))
    }

    /// The raw JSON form used for persistence and feature mapping.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("snapshot serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_value() -> serde_json::Value {
        serde_json::json!({
            "schema_version": "v3",
            "snapshot_id": "abc123",
            "snapshot_time_utc": 1_700_000_100,
            "observer_time_utc": 1_700_000_102,
            "symbol": "BTCUSDT",
            "ltf": {
                "tf": "5m",
                "timestamp": 1_700_000_100,
                "price": {
                    "open": 100.0, "high": 101.0, "low": 99.0, "close": 100.5,
                    "volume": 1234.0, "range_pct": 0.0199, "atr_pct": 0.004,
                    "volatility_regime": "normal"
                },
                "micro_structure": {
                    "hh_ll_state": "HH", "bos": true, "distance_to_structure": 0.002
                }
            },
            "htf": {
                "15m": {"trend": "up", "bos": false, "liquidity_state": null,
                         "market_regime": "trend", "volatility_regime": "normal"},
                "1h":  {"trend": "up", "bos": true, "liquidity_state": null,
                         "market_regime": "trend", "volatility_regime": "high"},
                "4h":  {"trend": "flat", "bos": false, "liquidity_state": null,
                         "market_regime": "range", "volatility_regime": "normal"}
            },
            "context": {
                "session": "ny", "exchange": "binance",
                "funding_rate": 0.0001, "funding_zscore": 0.5,
                "bid": 100.4, "ask": 100.6, "mid": 100.5, "spread_pct": 0.00199,
                "daily_atr_pct": 0.03, "daily_atr_ratio_30": 1.1
            }
        })
    }

    #[test]
    fn id_is_deterministic_sha1_prefix() {
        let id = Snapshot::compute_id("binance", "BTCUSDT", "5m", 1_700_000_100);
        assert_eq!(id.len(), 20);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // Pure function: same inputs, same id, across calls and processes.
        assert_eq!(id, Snapshot::compute_id("binance", "BTCUSDT", "5m", 1_700_000_100));
        // Expected digest of "binance|BTCUSDT|5m|1700000100|v3".
        let full = hex::encode(Sha1::digest(b"binance|BTCUSDT|5m|1700000100|v3"));
        assert_eq!(id, full[..20]);
    }

    #[test]
    fn id_changes_with_any_component() {
        let base = Snapshot::compute_id("binance", "BTCUSDT", "5m", 1_700_000_100);
        assert_ne!(base, Snapshot::compute_id("bybit", "BTCUSDT", "5m", 1_700_000_100));
        assert_ne!(base, Snapshot::compute_id("binance", "ETHUSDT", "5m", 1_700_000_100));
        assert_ne!(base, Snapshot::compute_id("binance", "BTCUSDT", "5m", 1_700_000_400));
    }

    #[test]
    fn valid_snapshot_parses() {
        let snap = Snapshot::from_value(sample_value()).unwrap();
        assert_eq!(snap.schema_version, "v3");
        assert_eq!(snap.symbol, "BTCUSDT");
        assert_eq!(snap.ltf.price.close, 100.5);
        assert_eq!(snap.htf.len(), 3);
        assert_eq!(snap.htf["1h"].trend, Trend::Up);
        assert_eq!(snap.context.session, Session::Ny);
    }

    #[test]
    fn forbidden_key_rejected() {
        let mut v = sample_value();
        v["decision"] = serde_json::json!({"direction": "LONG"});
        let err = Snapshot::from_value(v).unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }

    #[test]
    fn wrong_schema_version_rejected() {
        let mut v = sample_value();
        v["schema_version"] = serde_json::json!("v2");
        assert!(Snapshot::from_value(v).is_err());
    }

    #[test]
    fn time_ordering_enforced() {
        let mut v = sample_value();
        v["observer_time_utc"] = serde_json::json!(1_700_000_000);
        let err = Snapshot::from_value(v).unwrap_err();
        assert!(err.to_string().contains("observer_time_utc"));
    }

    #[test]
    fn value_roundtrip_preserves_snapshot() {
        let snap = Snapshot::from_value(sample_value()).unwrap();
        let snap2 = Snapshot::from_value(snap.to_value()).unwrap();
        assert_eq!(snap.snapshot_id, snap2.snapshot_id);
        assert_eq!(snap.ltf.price.atr_pct, snap2.ltf.price.atr_pct);
        assert_eq!(snap.htf["4h"].market_regime, snap2.htf["4h"].market_regime);
    }
}
