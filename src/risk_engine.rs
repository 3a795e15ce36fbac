// =============================================================================
// Risk Engine — deterministic position sizing for USDT-M linear futures
// =============================================================================
//
// Sizes a quantity from (account, market constraints, decision, config).
// RR/SL/TP generation stays inside the policies; this module only sizes.
//
// The procedure short-circuits on the first failing gate and reports the
// reason verbatim in the decision-cycle record:
//   1. confidence gate
//   2. account / stop-distance validation
//   3. risk budget (absolute USDT or % of equity)
//   4. qty from budget, floored to step, bumped to min_qty
//   5. optional max-notional cap
//   6. leverage / margin fitting (raise leverage, else scale qty down)
//   7. min-notional policy (skip | override_with_cap)
//
// qty is in base-asset units; notional = qty * entry; risk = qty * |entry-sl|.
// All arithmetic is deterministic; ties round down on the step.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::decision::TradeDecision;
use crate::exchange::MarketConstraints;

/// Account reading used for sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountState {
    pub equity_usdt: f64,
    pub free_usdt: f64,
}

/// Which way to resolve an order whose notional is under the venue minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinNotionalPolicy {
    Skip,
    OverrideWithCap,
}

impl Default for MinNotionalPolicy {
    fn default() -> Self {
        Self::Skip
    }
}

impl MinNotionalPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Some(Self::Skip),
            "override_with_cap" => Some(Self::OverrideWithCap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Risk budget as percent of equity, used when the absolute budget is unset.
    pub risk_per_trade_pct: f64,
    /// Absolute risk budget in USDT; takes precedence when > 0.
    pub risk_per_trade_usdt: Option<f64>,

    pub default_leverage: u32,
    pub max_leverage: u32,
    /// Fraction of free USDT usable as initial margin (e.g. 0.30).
    pub margin_utilization: f64,

    pub max_notional_usdt: Option<f64>,
    /// Cap initial margin per symbol as % of equity.
    pub max_exposure_pct_per_symbol: Option<f64>,

    pub min_notional_policy: MinNotionalPolicy,
    pub max_risk_multiplier_on_override: f64,
    pub max_risk_override_usdt: Option<f64>,

    pub min_confidence: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: 0.25,
            risk_per_trade_usdt: None,
            default_leverage: 3,
            max_leverage: 10,
            margin_utilization: 0.30,
            max_notional_usdt: None,
            max_exposure_pct_per_symbol: None,
            min_notional_policy: MinNotionalPolicy::Skip,
            max_risk_multiplier_on_override: 2.0,
            max_risk_override_usdt: None,
            min_confidence: 0.55,
        }
    }
}

/// Sizing result. `ok=false` carries the gate that rejected the trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPlan {
    pub ok: bool,
    pub reason: String,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub notional_usdt: Option<f64>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub risk_usdt: Option<f64>,
    #[serde(default)]
    pub risk_pct: Option<f64>,
}

impl RiskPlan {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            qty: None,
            notional_usdt: None,
            leverage: None,
            risk_usdt: None,
            risk_pct: None,
        }
    }
}

fn floor_to_step(x: f64, step: Option<f64>) -> f64 {
    match step {
        Some(s) if s > 0.0 => (x / s).floor() * s,
        _ => x,
    }
}

fn ceil_to_step(x: f64, step: Option<f64>) -> f64 {
    match step {
        Some(s) if s > 0.0 => (x / s).ceil() * s,
        _ => x,
    }
}

/// Bump to min_qty and re-align upward on the step.
fn apply_min_qty(qty: f64, constraints: &MarketConstraints) -> f64 {
    match constraints.min_qty {
        Some(mq) => ceil_to_step(qty.max(mq), constraints.qty_step),
        None => qty,
    }
}

pub struct RiskEngine {
    cfg: RiskConfig,
}

impl RiskEngine {
    pub fn new(cfg: RiskConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    /// Build a sizing plan. Never panics; every failure is a typed reason.
    pub fn build_plan(
        &self,
        account: &AccountState,
        constraints: &MarketConstraints,
        decision: &TradeDecision,
    ) -> RiskPlan {
        let cfg = &self.cfg;

        // 1. Confidence gate (absent confidence counts as 1.0).
        let conf = decision.confidence.unwrap_or(1.0);
        if conf < cfg.min_confidence {
            return RiskPlan::reject(format!("confidence<{}", cfg.min_confidence));
        }

        // 2. Account and stop distance.
        let equity = account.equity_usdt;
        let free = account.free_usdt;
        if !(equity > 0.0 && free > 0.0) {
            return RiskPlan::reject("account_balance_invalid");
        }

        let risk_budget = match cfg.risk_per_trade_usdt {
            Some(v) if v > 0.0 => v,
            _ => equity * (cfg.risk_per_trade_pct / 100.0),
        };
        if !(risk_budget > 0.0) {
            return RiskPlan::reject("risk_budget_invalid");
        }

        let entry = decision.entry_price;
        let stop_dist = (entry - decision.sl_price).abs();
        if !(stop_dist > 0.0) {
            return RiskPlan::reject("stop_distance_invalid");
        }

        // 3. Initial qty from the risk budget, floored to the step.
        let mut qty = floor_to_step(risk_budget / stop_dist, constraints.qty_step);
        qty = apply_min_qty(qty, constraints);
        if !(qty > 0.0) {
            return RiskPlan::reject("qty_invalid");
        }

        let min_notional = if constraints.min_notional_usdt > 0.0 {
            constraints.min_notional_usdt
        } else {
            5.0
        };

        // 4. Optional notional cap.
        if let Some(max_notional) = cfg.max_notional_usdt.filter(|v| *v > 0.0) {
            let cap_qty = floor_to_step(max_notional / entry, constraints.qty_step);
            qty = qty.min(cap_qty);
            qty = apply_min_qty(qty, constraints);
        }

        let mut notional = qty * entry;

        // 5. Leverage to satisfy the margin limit.
        let mut lev = cfg.default_leverage.clamp(1, cfg.max_leverage.max(1));

        let mut margin_limit = (cfg.margin_utilization * free).max(0.0);
        if let Some(pct) = cfg.max_exposure_pct_per_symbol.filter(|v| *v > 0.0) {
            margin_limit = margin_limit.min(equity * (pct / 100.0));
        }
        if margin_limit <= 0.0 {
            return RiskPlan::reject("margin_limit_invalid");
        }

        let mut margin_req = notional / lev as f64;
        if margin_req > margin_limit {
            // Raise leverage up to the cap first.
            let needed = (notional / margin_limit).ceil() as u32;
            lev = lev.max(needed.max(1).min(cfg.max_leverage));
            margin_req = notional / lev as f64;
        }
        if margin_req > margin_limit {
            // Still too large: scale qty down to fit.
            let qty_max = floor_to_step(margin_limit * lev as f64 / entry, constraints.qty_step);
            qty = qty.min(qty_max);
            qty = apply_min_qty(qty, constraints);
            notional = qty * entry;
            margin_req = notional / lev as f64;
        }
        if margin_req > margin_limit {
            return RiskPlan::reject("margin_too_high");
        }
        if !(qty > 0.0) {
            return RiskPlan::reject("qty_too_small_after_margin");
        }

        // 6. Min-notional policy.
        if notional < min_notional {
            if cfg.min_notional_policy != MinNotionalPolicy::OverrideWithCap {
                return RiskPlan::reject(format!("notional<{min_notional}"));
            }

            // Override: bump qty up to meet min notional (round UP on the step).
            let mut qty2 = ceil_to_step(min_notional / entry, constraints.qty_step);
            qty2 = apply_min_qty(qty2, constraints);
            let notional2 = qty2 * entry;
            let risk2 = qty2 * stop_dist;

            if risk2 > risk_budget * cfg.max_risk_multiplier_on_override {
                return RiskPlan::reject("min_notional_override_risk_too_high");
            }
            if let Some(cap) = cfg.max_risk_override_usdt {
                if risk2 > cap {
                    return RiskPlan::reject("min_notional_override_cap_exceeded");
                }
            }

            // Re-check margin with the current leverage, bumping to max if needed.
            let mut margin2 = notional2 / lev as f64;
            if margin2 > margin_limit {
                let needed2 = (notional2 / margin_limit).ceil() as u32;
                let lev2 = needed2.max(lev).min(cfg.max_leverage);
                margin2 = notional2 / lev2 as f64;
                if margin2 > margin_limit {
                    return RiskPlan::reject("min_notional_override_margin_too_high");
                }
                lev = lev2;
            }

            qty = qty2;
            notional = notional2;
        }

        // 7. Final risk figures.
        let risk_usdt = qty * stop_dist;
        let risk_pct = (risk_usdt / equity) * 100.0;

        RiskPlan {
            ok: true,
            reason: "ok".to_string(),
            qty: Some(qty),
            notional_usdt: Some(notional),
            leverage: Some(lev),
            risk_usdt: Some(risk_usdt),
            risk_pct: Some(risk_pct),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn decision(entry: f64, sl: f64, confidence: f64) -> TradeDecision {
        TradeDecision::new(
            Direction::Long,
            entry,
            sl,
            entry + 2.0 * (entry - sl).abs(),
            2.0,
            Some(confidence),
            1_700_000_100,
        )
        .unwrap()
    }

    fn account(equity: f64, free: f64) -> AccountState {
        AccountState {
            equity_usdt: equity,
            free_usdt: free,
        }
    }

    #[test]
    fn confidence_gate_rejects() {
        let engine = RiskEngine::new(RiskConfig::default());
        let plan = engine.build_plan(
            &account(100.0, 100.0),
            &MarketConstraints::default(),
            &decision(30_000.0, 29_970.0, 0.4),
        );
        assert!(!plan.ok);
        assert!(plan.reason.starts_with("confidence<"));
    }

    #[test]
    fn leverage_raised_to_fit_margin() {
        // equity=100, risk 0.25% -> budget 0.25; entry 30000, stop 30
        // -> qty 0.008333, notional 250. margin_limit = 0.3*100 = 30.
        // Default lev 3 needs 83.3 margin; raising to ceil(250/30)=9 fits.
        let engine = RiskEngine::new(RiskConfig::default());
        let plan = engine.build_plan(
            &account(100.0, 100.0),
            &MarketConstraints::default(),
            &decision(30_000.0, 29_970.0, 0.9),
        );
        assert!(plan.ok, "reason: {}", plan.reason);
        assert_eq!(plan.leverage, Some(9));
        let notional = plan.notional_usdt.unwrap();
        assert!((notional - 250.0).abs() < 1e-6);
        assert!((plan.risk_usdt.unwrap() - 0.25).abs() < 1e-9);
        // Margin requirement honored.
        assert!(notional / 9.0 <= 30.0 + 1e-9);
    }

    #[test]
    fn qty_scaled_down_when_leverage_capped() {
        // Same setup but max leverage 5: 250/5 = 50 > 30, so qty shrinks to
        // fit margin_limit * lev / entry = 30*5/30000 = 0.005.
        let cfg = RiskConfig {
            max_leverage: 5,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(cfg);
        let constraints = MarketConstraints {
            min_notional_usdt: 5.0,
            min_qty: None,
            qty_step: Some(0.001),
        };
        let plan = engine.build_plan(
            &account(100.0, 100.0),
            &constraints,
            &decision(30_000.0, 29_970.0, 0.9),
        );
        assert!(plan.ok, "reason: {}", plan.reason);
        assert_eq!(plan.leverage, Some(5));
        let qty = plan.qty.unwrap();
        assert!((qty - 0.005).abs() < 1e-12);
        assert!(plan.notional_usdt.unwrap() / 5.0 <= 30.0 + 1e-9);
    }

    #[test]
    fn min_notional_skip_rejects() {
        // Tiny budget: equity 20 -> budget 0.05; entry 30, stop 1 ->
        // qty 0.05, notional 1.5 < 5 with the default skip policy.
        let engine = RiskEngine::new(RiskConfig::default());
        let constraints = MarketConstraints {
            min_notional_usdt: 5.0,
            min_qty: None,
            qty_step: Some(0.01),
        };
        let plan = engine.build_plan(
            &account(20.0, 20.0),
            &constraints,
            &decision(30.0, 29.0, 0.9),
        );
        assert!(!plan.ok);
        assert_eq!(plan.reason, "notional<5");
    }

    #[test]
    fn min_notional_override_rejected_when_risk_blows_budget() {
        // Override path: qty2 = ceil(5/30, 0.01) = 0.17 -> risk 0.17 USDT,
        // which exceeds budget 0.05 * multiplier 2 = 0.10.
        let cfg = RiskConfig {
            min_notional_policy: MinNotionalPolicy::OverrideWithCap,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(cfg);
        let constraints = MarketConstraints {
            min_notional_usdt: 5.0,
            min_qty: None,
            qty_step: Some(0.01),
        };
        let plan = engine.build_plan(
            &account(20.0, 20.0),
            &constraints,
            &decision(30.0, 29.0, 0.9),
        );
        assert!(!plan.ok);
        assert_eq!(plan.reason, "min_notional_override_risk_too_high");
    }

    #[test]
    fn min_notional_override_accepts_within_cap() {
        // Wider stop so the override risk stays under the cap:
        // budget 0.25 (equity 100), entry 30, stop 1 -> qty 0.25,
        // notional 7.5 >= 5, no override needed; shrink equity to force it.
        let cfg = RiskConfig {
            min_notional_policy: MinNotionalPolicy::OverrideWithCap,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(cfg);
        let constraints = MarketConstraints {
            min_notional_usdt: 5.0,
            min_qty: None,
            qty_step: Some(0.01),
        };
        // equity 40 -> budget 0.1; qty 0.1 -> notional 3 < 5.
        // Override: qty2 = 0.17, risk2 = 0.17 <= 0.1*2 = 0.2 -> accept.
        let plan = engine.build_plan(
            &account(40.0, 40.0),
            &constraints,
            &decision(30.0, 29.0, 0.9),
        );
        assert!(plan.ok, "reason: {}", plan.reason);
        let qty = plan.qty.unwrap();
        assert!((qty - 0.17).abs() < 1e-9);
        assert!(plan.notional_usdt.unwrap() >= 5.0);
    }

    #[test]
    fn override_absolute_cap_applies() {
        let cfg = RiskConfig {
            min_notional_policy: MinNotionalPolicy::OverrideWithCap,
            max_risk_override_usdt: Some(0.05),
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(cfg);
        let constraints = MarketConstraints {
            min_notional_usdt: 5.0,
            min_qty: None,
            qty_step: Some(0.01),
        };
        let plan = engine.build_plan(
            &account(40.0, 40.0),
            &constraints,
            &decision(30.0, 29.0, 0.9),
        );
        assert!(!plan.ok);
        assert_eq!(plan.reason, "min_notional_override_cap_exceeded");
    }

    #[test]
    fn accepted_plan_respects_all_invariants() {
        let engine = RiskEngine::new(RiskConfig::default());
        let constraints = MarketConstraints {
            min_notional_usdt: 5.0,
            min_qty: Some(0.001),
            qty_step: Some(0.001),
        };
        let plan = engine.build_plan(
            &account(1_000.0, 800.0),
            &constraints,
            &decision(30_000.0, 29_850.0, 0.9),
        );
        assert!(plan.ok, "reason: {}", plan.reason);
        let qty = plan.qty.unwrap();
        let lev = plan.leverage.unwrap();
        // qty > 0 and step-aligned.
        assert!(qty > 0.0);
        let steps = qty / 0.001;
        assert!((steps - steps.round()).abs() < 1e-6);
        // Notional and margin invariants.
        let notional = plan.notional_usdt.unwrap();
        assert!(notional >= 5.0);
        assert!((1..=10).contains(&lev));
        assert!(notional / lev as f64 <= 0.30 * 800.0 + 1e-9);
    }

    #[test]
    fn invalid_account_rejected() {
        let engine = RiskEngine::new(RiskConfig::default());
        let plan = engine.build_plan(
            &account(0.0, 0.0),
            &MarketConstraints::default(),
            &decision(30_000.0, 29_970.0, 0.9),
        );
        assert!(!plan.ok);
        assert_eq!(plan.reason, "account_balance_invalid");
    }

    #[test]
    fn absolute_risk_budget_takes_precedence() {
        let cfg = RiskConfig {
            risk_per_trade_usdt: Some(1.0),
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(cfg);
        let plan = engine.build_plan(
            &account(100.0, 100.0),
            &MarketConstraints::default(),
            &decision(30_000.0, 29_900.0, 0.9),
        );
        assert!(plan.ok, "reason: {}", plan.reason);
        assert!((plan.risk_usdt.unwrap() - 1.0).abs() < 1e-9);
    }
}
