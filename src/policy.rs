// =============================================================================
// Policies — directional decisions with entry/SL/TP levels
// =============================================================================
//
// RulePolicy derives everything from the snapshot:
//   - direction from the 1h HTF trend (up -> LONG, anything else -> SHORT)
//   - SL distance from ATR% (atr_k * atr_pct * entry, floored at 0.1% of
//     entry when ATR is unavailable)
//   - RR from the LTF volatility regime, modulated by an ATR term and the
//     funding z-score, clamped to [rr_floor, rr_ceiling]
//
// HybridPolicy wraps the rule policy and multiplies its confidence by a
// model score in [0, 1] from the scorer.
//
// Policies never decide "no trade". Rejecting weak signals is the risk
// engine's job (min_confidence gate).
// =============================================================================

use tracing::debug;

use crate::decision::TradeDecision;
use crate::errors::DomainResult;
use crate::features::FeatureMapper;
use crate::scorer::Scorer;
use crate::snapshot::{Snapshot, Trend, VolRegime};
use crate::types::Direction;

/// Which confidence lands on the final decision in hybrid mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfMode {
    /// rule_confidence * model_score, clamped. The default.
    Mul,
    /// model_score alone.
    Model,
    /// rule_confidence alone.
    Rule,
}

impl ConfMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "model" => Self::Model,
            "rule" => Self::Rule,
            _ => Self::Mul,
        }
    }
}

/// Confidence components recorded in every decision-cycle row.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceParts {
    pub rule_confidence: Option<f64>,
    pub model_score: Option<f64>,
    pub final_confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RulePolicyConfig {
    /// Base RR per LTF volatility regime.
    pub rr_dead: f64,
    pub rr_normal: f64,
    pub rr_expansion: f64,
    /// ATR multiple for the SL distance.
    pub atr_k: f64,
    pub rr_floor: f64,
    pub rr_ceiling: f64,
    pub vol_weight: f64,
    pub atr_weight: f64,
    pub funding_weight: f64,
}

impl Default for RulePolicyConfig {
    fn default() -> Self {
        Self {
            rr_dead: 1.0,
            rr_normal: 2.0,
            rr_expansion: 3.0,
            atr_k: 1.0,
            rr_floor: 0.5,
            rr_ceiling: 10.0,
            vol_weight: 1.0,
            atr_weight: 1.0,
            funding_weight: 0.5,
        }
    }
}

/// Deterministic rule policy: same snapshot and config, same decision.
#[derive(Debug, Clone, Default)]
pub struct RulePolicy {
    cfg: RulePolicyConfig,
}

impl RulePolicy {
    pub fn new(cfg: RulePolicyConfig) -> Self {
        Self { cfg }
    }

    /// RR from the volatility regime, scaled by ATR strength and damped by
    /// positive funding pressure.
    fn compute_rr(&self, snapshot: &Snapshot) -> f64 {
        let base = match snapshot.ltf.price.volatility_regime {
            VolRegime::Dead => self.cfg.rr_dead,
            VolRegime::Normal => self.cfg.rr_normal,
            VolRegime::Expansion => self.cfg.rr_expansion,
        };
        let atr_pct = snapshot.ltf.price.atr_pct.max(0.0);
        let atr_term = 1.0 + self.cfg.atr_weight * (atr_pct * 100.0);
        let funding_adj = 1.0 - self.cfg.funding_weight * snapshot.context.funding_zscore;
        let rr = base * self.cfg.vol_weight * atr_term * funding_adj;
        rr.clamp(self.cfg.rr_floor, self.cfg.rr_ceiling)
    }

    pub fn decide(&self, snapshot: &Snapshot) -> DomainResult<TradeDecision> {
        let mut entry = snapshot.ltf.price.close;
        if entry <= 0.0 {
            // Placeholder snapshots carry a zero close; a decision is still
            // produced (the risk engine rejects anything built on it).
            entry = 1.0;
        }

        let atr_pct = snapshot.ltf.price.atr_pct;
        let sl_distance = if atr_pct > 0.0 {
            (self.cfg.atr_k * atr_pct * entry).max(1e-8)
        } else {
            (0.001 * entry).max(1e-8)
        };

        let rr = self.compute_rr(snapshot);

        let trend = snapshot.htf.get("1h").map(|h| h.trend).unwrap_or(Trend::Flat);
        let direction = if trend == Trend::Up {
            Direction::Long
        } else {
            Direction::Short
        };

        let (sl_price, tp_price) = match direction {
            Direction::Long => (entry - sl_distance, entry + rr * sl_distance),
            Direction::Short => (entry + sl_distance, entry - rr * sl_distance),
        };

        debug!(
            symbol = %snapshot.symbol,
            %direction,
            entry,
            sl_price,
            tp_price,
            rr,
            "rule decision"
        );

        TradeDecision::new(
            direction,
            entry,
            sl_price,
            tp_price,
            rr,
            Some(1.0),
            snapshot.snapshot_time_utc,
        )
    }
}

/// Rule policy for levels, model scorer for confidence.
pub struct HybridPolicy {
    rule: RulePolicy,
    mapper: FeatureMapper,
    scorer: Scorer,
}

impl HybridPolicy {
    pub fn new(rule: RulePolicy, mapper: FeatureMapper, scorer: Scorer) -> Self {
        Self {
            rule,
            mapper,
            scorer,
        }
    }

    fn model_score(&self, snapshot: &Snapshot) -> Option<f64> {
        match self.mapper.map(&snapshot.to_value()) {
            Ok(out) => Some(self.scorer.score(&out.features)),
            Err(e) => {
                debug!(error = %e, "feature mapping failed — no model score");
                None
            }
        }
    }

    pub fn decide(&self, snapshot: &Snapshot) -> DomainResult<TradeDecision> {
        let base = self.rule.decide(snapshot)?;
        let rule_conf = base.confidence.unwrap_or(1.0);
        let score = self.model_score(snapshot).unwrap_or(rule_conf);
        base.with_confidence((rule_conf * score).clamp(0.0, 1.0))
    }

    /// The individual confidence components, for the decision-cycle record.
    pub fn confidence_parts(&self, snapshot: &Snapshot) -> ConfidenceParts {
        let rule_confidence = self
            .rule
            .decide(snapshot)
            .ok()
            .map(|d| d.confidence.unwrap_or(1.0));
        let model_score = self.model_score(snapshot);
        let final_confidence = match (rule_confidence, model_score) {
            (Some(r), Some(m)) => Some((r * m).clamp(0.0, 1.0)),
            (Some(r), None) => Some(r),
            (None, Some(m)) => Some(m),
            (None, None) => None,
        };
        ConfidenceParts {
            rule_confidence,
            model_score,
            final_confidence,
        }
    }
}

/// The configured policy: plain rule or hybrid.
pub enum PolicyEngine {
    Rule(RulePolicy),
    Hybrid(HybridPolicy),
}

impl PolicyEngine {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rule(_) => "RulePolicy",
            Self::Hybrid(_) => "HybridPolicy",
        }
    }

    pub fn decide(&self, snapshot: &Snapshot) -> DomainResult<TradeDecision> {
        match self {
            Self::Rule(p) => p.decide(snapshot),
            Self::Hybrid(p) => p.decide(snapshot),
        }
    }

    pub fn confidence_parts(&self, snapshot: &Snapshot) -> ConfidenceParts {
        match self {
            Self::Rule(p) => {
                let rule_confidence = p.decide(snapshot).ok().map(|d| d.confidence.unwrap_or(1.0));
                ConfidenceParts {
                    rule_confidence,
                    model_score: None,
                    final_confidence: rule_confidence,
                }
            }
            Self::Hybrid(p) => p.confidence_parts(snapshot),
        }
    }

    /// Apply the configured confidence mode to a decision.
    pub fn apply_conf_mode(
        &self,
        decision: TradeDecision,
        parts: &ConfidenceParts,
        mode: ConfMode,
    ) -> DomainResult<TradeDecision> {
        let chosen = match mode {
            ConfMode::Mul => parts.final_confidence,
            ConfMode::Model => parts.model_score,
            ConfMode::Rule => parts.rule_confidence,
        };
        match chosen {
            Some(c) if decision.confidence != Some(c) => decision.with_confidence(c.clamp(0.0, 1.0)),
            _ => Ok(decision),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;

    fn snapshot(close: f64, atr_pct: f64, vol: &str, trend_1h: &str, funding_z: f64) -> Snapshot {
        Snapshot::from_value(serde_json::json!({
            "schema_version": "v3",
            "snapshot_id": "s1",
            "snapshot_time_utc": 1_700_000_100,
            "observer_time_utc": 1_700_000_102,
            "symbol": "BTCUSDT",
            "ltf": {
                "tf": "5m",
                "timestamp": 1_700_000_100,
                "price": {
                    "open": close, "high": close, "low": close, "close": close,
                    "volume": 10.0, "range_pct": 0.002, "atr_pct": atr_pct,
                    "volatility_regime": vol
                },
                "micro_structure": { "hh_ll_state": "HH", "bos": true, "distance_to_structure": 0.0 }
            },
            "htf": {
                "15m": { "trend": "up", "bos": false, "market_regime": "trend", "volatility_regime": "normal" },
                "1h":  { "trend": trend_1h, "bos": false, "market_regime": "trend", "volatility_regime": "normal" },
                "4h":  { "trend": "flat", "bos": false, "market_regime": "range", "volatility_regime": "normal" }
            },
            "context": {
                "session": "asia", "exchange": "binance",
                "funding_rate": 0.0001, "funding_zscore": funding_z,
                "spread_pct": 0.0002, "daily_atr_pct": 0.03, "daily_atr_ratio_30": 1.0
            }
        }))
        .unwrap()
    }

    #[test]
    fn long_when_1h_up_short_otherwise() {
        let p = RulePolicy::default();
        let d = p.decide(&snapshot(100.0, 0.004, "normal", "up", 0.0)).unwrap();
        assert_eq!(d.direction, Direction::Long);
        assert!(d.sl_price < 100.0 && d.tp_price > 100.0);

        let d = p.decide(&snapshot(100.0, 0.004, "normal", "down", 0.0)).unwrap();
        assert_eq!(d.direction, Direction::Short);
        assert!(d.sl_price > 100.0 && d.tp_price < 100.0);

        let d = p.decide(&snapshot(100.0, 0.004, "normal", "flat", 0.0)).unwrap();
        assert_eq!(d.direction, Direction::Short);
    }

    #[test]
    fn sl_distance_from_atr() {
        let p = RulePolicy::default();
        let d = p.decide(&snapshot(100.0, 0.004, "normal", "up", 0.0)).unwrap();
        // sl_distance = atr_k * atr_pct * entry = 0.4
        assert!((d.risk_unit - 0.4).abs() < 1e-9);
        // tp distance = rr * sl_distance
        assert!((d.tp_price - (100.0 + d.rr * 0.4)).abs() < 1e-9);
    }

    #[test]
    fn sl_floor_without_atr() {
        let p = RulePolicy::default();
        let d = p.decide(&snapshot(100.0, 0.0, "normal", "up", 0.0)).unwrap();
        // 0.1% floor
        assert!((d.risk_unit - 0.1).abs() < 1e-9);
    }

    #[test]
    fn rr_scales_with_vol_regime() {
        let p = RulePolicy::default();
        let dead = p.decide(&snapshot(100.0, 0.004, "dead", "up", 0.0)).unwrap();
        let normal = p.decide(&snapshot(100.0, 0.004, "normal", "up", 0.0)).unwrap();
        let expansion = p
            .decide(&snapshot(100.0, 0.004, "expansion", "up", 0.0))
            .unwrap();
        assert!(dead.rr < normal.rr && normal.rr < expansion.rr);
        // base 2.0 * atr_term (1 + 0.4) = 2.8 for the normal regime.
        assert!((normal.rr - 2.8).abs() < 1e-9);
    }

    #[test]
    fn positive_funding_z_damps_rr() {
        let p = RulePolicy::default();
        let neutral = p.decide(&snapshot(100.0, 0.004, "normal", "up", 0.0)).unwrap();
        let crowded = p.decide(&snapshot(100.0, 0.004, "normal", "up", 1.0)).unwrap();
        assert!(crowded.rr < neutral.rr);
    }

    #[test]
    fn rr_clamped_to_floor() {
        let p = RulePolicy::default();
        // Large positive z drives the raw rr negative; the floor holds.
        let d = p.decide(&snapshot(100.0, 0.004, "normal", "up", 5.0)).unwrap();
        assert!((d.rr - 0.5).abs() < 1e-9);
    }

    #[test]
    fn decision_is_deterministic() {
        let p = RulePolicy::default();
        let s = snapshot(100.0, 0.004, "normal", "up", 0.3);
        let a = p.decide(&s).unwrap();
        let b = p.decide(&s).unwrap();
        assert_eq!(a.entry_price, b.entry_price);
        assert_eq!(a.sl_price, b.sl_price);
        assert_eq!(a.tp_price, b.tp_price);
        assert_eq!(a.rr, b.rr);
    }

    #[test]
    fn hybrid_with_neutral_scorer_keeps_rule_confidence() {
        let mapper = crate::features::FeatureMapper::from_path(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/config/feature_spec_v1.yaml"
        ))
        .unwrap();
        let hybrid = HybridPolicy::new(RulePolicy::default(), mapper, Scorer::neutral());
        let s = snapshot(100.0, 0.004, "normal", "up", 0.0);
        let d = hybrid.decide(&s).unwrap();
        // neutral scorer -> 1.0 * rule confidence 1.0
        assert_eq!(d.confidence, Some(1.0));

        let parts = hybrid.confidence_parts(&s);
        assert_eq!(parts.rule_confidence, Some(1.0));
        assert_eq!(parts.model_score, Some(1.0));
        assert_eq!(parts.final_confidence, Some(1.0));
    }

    #[test]
    fn conf_mode_selection() {
        let p = PolicyEngine::Rule(RulePolicy::default());
        let s = snapshot(100.0, 0.004, "normal", "up", 0.0);
        let d = p.decide(&s).unwrap();
        let parts = ConfidenceParts {
            rule_confidence: Some(0.9),
            model_score: Some(0.5),
            final_confidence: Some(0.45),
        };
        let mul = p.apply_conf_mode(d.clone(), &parts, ConfMode::Mul).unwrap();
        assert_eq!(mul.confidence, Some(0.45));
        let model = p.apply_conf_mode(d.clone(), &parts, ConfMode::Model).unwrap();
        assert_eq!(model.confidence, Some(0.5));
        let rule = p.apply_conf_mode(d, &parts, ConfMode::Rule).unwrap();
        assert_eq!(rule.confidence, Some(0.9));
    }
}
