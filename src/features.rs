// =============================================================================
// Feature Mapper — declarative snapshot -> fixed-length numeric vector
// =============================================================================
//
// Driven by a YAML spec listing N features in order. Each feature is either:
//   - a JSON-path extraction (`path: $.a.b.c`) typed `float` or
//     `bool_to_float`, with a default for missing / non-finite values
//   - a one-hot dimension (`encode: {ref, value, timeframe?}`) that emits
//     1.0 iff the referenced snapshot field equals `value`
//
// Guarantees:
//   - fixed length (spec.output.feature_count)
//   - deterministic order (the spec's feature list order)
//   - all outputs finite (NaN/Inf coerced to the default)
//   - feature_hash = sha256(version|key1|...|keyN), stable across runs
//
// The mapper also re-checks the anti-leakage contract on its input: schema
// v3 only, forbidden outcome keys rejected.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::errors::{DomainError, DomainResult};

const FORBIDDEN_SNAPSHOT_KEYS: [&str; 13] = [
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

#[derive(Debug, Clone, Deserialize)]
pub struct EncodeRef {
    #[serde(rename = "ref")]
    pub reference: String,
    pub value: String,
    #[serde(default)]
    pub timeframe: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureItem {
    pub key: String,
    #[serde(default)]
    pub default_value: f64,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub encode: Option<EncodeRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncodingDef {
    #[serde(rename = "type")]
    pub encoding_type: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub feature_count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureSpec {
    #[serde(default = "default_version")]
    pub version: String,
    pub features: Vec<FeatureItem>,
    #[serde(default)]
    pub encodings: HashMap<String, EncodingDef>,
    #[serde(default)]
    pub output: OutputSpec,
}

fn default_version() -> String {
    "v1".to_string()
}

/// Output of one mapping: the vector plus the spec identity it was built by.
#[derive(Debug, Clone)]
pub struct FeatureOutput {
    pub features: Vec<f32>,
    pub feature_version: String,
    pub feature_hash: String,
}

pub struct FeatureMapper {
    spec: FeatureSpec,
    expected_count: usize,
    feature_hash: String,
}

fn is_finite(x: f64) -> bool {
    !(x.is_nan() || x.is_infinite())
}

/// Coerce a JSON value to float. Booleans intentionally fall back to the
/// default (they must go through `bool_to_float`).
fn safe_float(v: Option<&serde_json::Value>, default: f64) -> f64 {
    match v {
        Some(serde_json::Value::Number(n)) => {
            let f = n.as_f64().unwrap_or(default);
            if is_finite(f) {
                f
            } else {
                default
            }
        }
        Some(serde_json::Value::String(s)) => match s.parse::<f64>() {
            Ok(f) if is_finite(f) => f,
            _ => default,
        },
        _ => default,
    }
}

fn bool_to_float(v: Option<&serde_json::Value>, default: f64) -> f64 {
    match v {
        Some(serde_json::Value::Bool(true)) => 1.0,
        Some(serde_json::Value::Bool(false)) => 0.0,
        _ => default,
    }
}

/// Walk a `$.a.b.c` path through nested objects. `None` when any segment
/// is missing.
fn get_by_path<'a>(obj: &'a serde_json::Value, path: &str) -> DomainResult<Option<&'a serde_json::Value>> {
    let rest = path
        .strip_prefix("$.")
        .ok_or_else(|| DomainError::FeatureMapping(format!("path must start with $.: {path}")))?;
    let mut cur = obj;
    for part in rest.split('.') {
        match cur.get(part) {
            Some(v) => cur = v,
            None => return Ok(None),
        }
    }
    Ok(Some(cur))
}

impl FeatureMapper {
    /// Load a spec from a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> DomainResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DomainError::FeatureMapping(format!("feature spec not found: {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse a spec from YAML text.
    pub fn from_yaml(text: &str) -> DomainResult<Self> {
        let spec: FeatureSpec = serde_yaml::from_str(text)
            .map_err(|e| DomainError::FeatureMapping(format!("invalid feature spec: {e}")))?;
        Self::new(spec)
    }

    pub fn new(spec: FeatureSpec) -> DomainResult<Self> {
        if spec.features.is_empty() {
            return Err(DomainError::FeatureMapping(
                "feature spec must include a non-empty 'features' list".into(),
            ));
        }
        let expected_count = spec.output.feature_count.unwrap_or(spec.features.len());
        if expected_count == 0 {
            return Err(DomainError::FeatureMapping(
                "output.feature_count must be > 0".into(),
            ));
        }
        let keys: Vec<&str> = spec.features.iter().map(|f| f.key.as_str()).collect();
        let feature_hash = Self::compute_hash(&spec.version, &keys);
        Ok(Self {
            spec,
            expected_count,
            feature_hash,
        })
    }

    fn compute_hash(version: &str, keys: &[&str]) -> String {
        let payload = format!("{version}|{}", keys.join("|"));
        hex::encode(Sha256::digest(payload.as_bytes()))
    }

    pub fn feature_version(&self) -> &str {
        &self.spec.version
    }

    pub fn feature_hash(&self) -> &str {
        &self.feature_hash
    }

    pub fn feature_count(&self) -> usize {
        self.expected_count
    }

    fn assert_snapshot_ok(&self, snapshot: &serde_json::Value) -> DomainResult<()> {
        let obj = snapshot
            .as_object()
            .ok_or_else(|| DomainError::FeatureMapping("snapshot must be an object".into()))?;
        if obj.get("schema_version").and_then(|v| v.as_str()) != Some("v3") {
            return Err(DomainError::FeatureMapping(
                "snapshot.schema_version must be 'v3'".into(),
            ));
        }
        let overlap: Vec<&str> = FORBIDDEN_SNAPSHOT_KEYS
            .iter()
            .copied()
            .filter(|k| obj.contains_key(*k))
            .collect();
        if !overlap.is_empty() {
            return Err(DomainError::FeatureMapping(format!(
                "snapshot contains forbidden fields: {overlap:?}"
            )));
        }
        if !obj.contains_key("snapshot_time_utc") {
            return Err(DomainError::FeatureMapping(
                "snapshot_time_utc missing in snapshot".into(),
            ));
        }
        Ok(())
    }

    /// Map a snapshot JSON value to the fixed-length vector.
    pub fn map(&self, snapshot: &serde_json::Value) -> DomainResult<FeatureOutput> {
        self.assert_snapshot_ok(snapshot)?;

        let mut vec: Vec<f64> = Vec::with_capacity(self.spec.features.len());
        for item in &self.spec.features {
            let default = item.default_value;

            if let Some(path) = &item.path {
                let val = get_by_path(snapshot, path)?;
                let out = match item.value_type.as_deref() {
                    Some("bool_to_float") => bool_to_float(val, default),
                    _ => safe_float(val, default),
                };
                vec.push(out);
                continue;
            }

            if let Some(enc) = &item.encode {
                vec.push(self.encode_onehot(snapshot, enc, default)?);
                continue;
            }

            return Err(DomainError::FeatureMapping(format!(
                "feature item must have 'path' or 'encode' (key={})",
                item.key
            )));
        }

        if vec.len() != self.expected_count {
            return Err(DomainError::FeatureMapping(format!(
                "feature vector length {} != expected {}",
                vec.len(),
                self.expected_count
            )));
        }

        let features: Vec<f32> = vec
            .into_iter()
            .map(|x| if is_finite(x) { x as f32 } else { 0.0 })
            .collect();

        Ok(FeatureOutput {
            features,
            feature_version: self.spec.version.clone(),
            feature_hash: self.feature_hash.clone(),
        })
    }

    /// One one-hot dimension: 1.0 iff the referenced field equals the value.
    fn encode_onehot(
        &self,
        snapshot: &serde_json::Value,
        enc: &EncodeRef,
        default: f64,
    ) -> DomainResult<f64> {
        let Some(def) = self.spec.encodings.get(&enc.reference) else {
            return Ok(default);
        };
        if def.encoding_type != "one_hot" {
            return Ok(default);
        }

        let source: Option<&serde_json::Value> = match enc.reference.as_str() {
            "ltf_volatility_regime" => get_by_path(snapshot, "$.ltf.price.volatility_regime")?,
            "ltf_hh_ll_state" => get_by_path(snapshot, "$.ltf.micro_structure.hh_ll_state")?,
            "session" => get_by_path(snapshot, "$.context.session")?,
            r if r.starts_with("htf_") => {
                let Some(tf) = &enc.timeframe else {
                    return Ok(default);
                };
                let field = match r {
                    "htf_trend" => "trend",
                    "htf_market_regime" => "market_regime",
                    "htf_volatility_regime" => "volatility_regime",
                    "htf_liquidity_state" => "liquidity_state",
                    _ => return Ok(default),
                };
                snapshot.get("htf").and_then(|h| h.get(tf)).and_then(|o| o.get(field))
            }
            _ => return Ok(default),
        };

        Ok(match source.and_then(|v| v.as_str()) {
            Some(s) if s == enc.value => 1.0,
            _ => 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
version: vtest
output:
  feature_count: 6
encodings:
  ltf_volatility_regime:
    type: one_hot
    values: [dead, normal, expansion]
  htf_trend:
    type: one_hot
    values: [up, down, flat]
features:
  - key: ltf_atr_pct
    path: $.ltf.price.atr_pct
    type: float
    default_value: 0.0
  - key: ltf_bos
    path: $.ltf.micro_structure.bos
    type: bool_to_float
    default_value: 0.0
  - key: missing_field
    path: $.context.nonexistent
    type: float
    default_value: -1.0
  - key: vol_is_normal
    encode: { ref: ltf_volatility_regime, value: normal }
    default_value: 0.0
  - key: htf_1h_trend_up
    encode: { ref: htf_trend, value: up, timeframe: 1h }
    default_value: 0.0
  - key: htf_4h_trend_up
    encode: { ref: htf_trend, value: up, timeframe: 4h }
    default_value: 0.0
"#;

    fn snapshot() -> serde_json::Value {
        serde_json::json!({
            "schema_version": "v3",
            "snapshot_id": "x",
            "snapshot_time_utc": 1_700_000_100,
            "observer_time_utc": 1_700_000_101,
            "symbol": "BTCUSDT",
            "ltf": {
                "tf": "5m",
                "price": { "close": 100.0, "atr_pct": 0.004, "volatility_regime": "normal" },
                "micro_structure": { "hh_ll_state": "HH", "bos": true }
            },
            "htf": {
                "1h": { "trend": "up" },
                "4h": { "trend": "flat" }
            },
            "context": { "session": "asia" }
        })
    }

    #[test]
    fn maps_paths_onehots_and_defaults() {
        let mapper = FeatureMapper::from_yaml(SPEC).unwrap();
        let out = mapper.map(&snapshot()).unwrap();
        assert_eq!(out.features.len(), 6);
        assert!((out.features[0] - 0.004).abs() < 1e-7); // atr_pct
        assert_eq!(out.features[1], 1.0); // bos true
        assert_eq!(out.features[2], -1.0); // missing -> default
        assert_eq!(out.features[3], 1.0); // vol normal
        assert_eq!(out.features[4], 1.0); // 1h up
        assert_eq!(out.features[5], 0.0); // 4h flat != up
        assert!(out.features.iter().all(|f| f.is_finite()));
    }

    #[test]
    fn hash_is_stable_and_version_dependent() {
        let m1 = FeatureMapper::from_yaml(SPEC).unwrap();
        let m2 = FeatureMapper::from_yaml(SPEC).unwrap();
        assert_eq!(m1.feature_hash(), m2.feature_hash());
        assert_eq!(m1.feature_hash().len(), 64);

        let other = SPEC.replace("version: vtest", "version: vother");
        let m3 = FeatureMapper::from_yaml(&other).unwrap();
        assert_ne!(m1.feature_hash(), m3.feature_hash());
    }

    #[test]
    fn length_mismatch_rejected() {
        let bad = SPEC.replace("feature_count: 6", "feature_count: 7");
        let mapper = FeatureMapper::from_yaml(&bad).unwrap();
        let err = mapper.map(&snapshot()).unwrap_err();
        assert!(err.to_string().contains("length"));
    }

    #[test]
    fn forbidden_snapshot_key_rejected() {
        let mapper = FeatureMapper::from_yaml(SPEC).unwrap();
        let mut snap = snapshot();
        snap["tp_price"] = serde_json::json!(101.0);
        let err = mapper.map(&snap).unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }

    #[test]
    fn wrong_schema_rejected() {
        let mapper = FeatureMapper::from_yaml(SPEC).unwrap();
        let mut snap = snapshot();
        snap["schema_version"] = serde_json::json!("v2");
        assert!(mapper.map(&snap).is_err());
    }

    #[test]
    fn onehot_without_required_timeframe_defaults() {
        let spec = r#"
version: v1
encodings:
  htf_trend: { type: one_hot }
features:
  - key: no_tf
    encode: { ref: htf_trend, value: up }
    default_value: 0.5
"#;
        let mapper = FeatureMapper::from_yaml(spec).unwrap();
        let out = mapper.map(&snapshot()).unwrap();
        assert_eq!(out.features[0], 0.5);
    }

    #[test]
    fn bool_through_float_path_uses_default() {
        // A boolean read with type float must coerce to the default, never 1.0.
        let spec = r#"
version: v1
features:
  - key: bos_as_float
    path: $.ltf.micro_structure.bos
    type: float
    default_value: -9.0
"#;
        let mapper = FeatureMapper::from_yaml(spec).unwrap();
        let out = mapper.map(&snapshot()).unwrap();
        assert_eq!(out.features[0], -9.0);
    }

    #[test]
    fn default_spec_file_loads_and_matches_count() {
        let mapper = FeatureMapper::from_path(
            concat!(env!("CARGO_MANIFEST_DIR"), "/config/feature_spec_v1.yaml"),
        )
        .unwrap();
        let out = mapper.map(&snapshot()).unwrap();
        assert_eq!(out.features.len(), mapper.feature_count());
        assert!(out.features.iter().all(|f| f.is_finite()));
    }
}
