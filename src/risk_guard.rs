// =============================================================================
// Risk Guard — runtime circuit breakers evaluated before every open
// =============================================================================
//
// Gates, in order:
//   1. Cooldown        — seconds since the last exit
//   2. Trade Limit     — closed trades today
//   3. Daily Loss USDT — cumulative realized PnL today
//   4. Daily Loss %    — same, relative to current equity
//   5. Loss Streak     — most recent run of consecutive losing trades
//
// "Today" is the strict UTC calendar day of `now_utc`. The guard reads the
// closed-trade ledger; it holds no mutable state of its own, so a restart
// cannot desynchronize it.
//
// Paper mode leaves the guard off by default (RISK_GUARD_PAPER=1 opts in).
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::trade::TradeAggregate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskGuardConfig {
    pub max_daily_loss_usdt: Option<f64>,
    /// Percent of equity, e.g. 2.0 for 2 %.
    pub max_daily_loss_pct: Option<f64>,
    pub max_consecutive_losses: u32,
    pub cooldown_sec: i64,
    pub max_trades_per_day: Option<u32>,
}

impl Default for RiskGuardConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_usdt: None,
            max_daily_loss_pct: None,
            max_consecutive_losses: 3,
            cooldown_sec: 0,
            max_trades_per_day: None,
        }
    }
}

/// Outcome of one guard evaluation, with the metrics that tripped it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskGuardResult {
    pub ok: bool,
    pub reason: String,
    pub metrics: serde_json::Value,
}

impl RiskGuardResult {
    fn ok(metrics: serde_json::Value) -> Self {
        Self {
            ok: true,
            reason: "ok".into(),
            metrics,
        }
    }

    fn blocked(reason: &str, metrics: serde_json::Value) -> Self {
        warn!(reason, %metrics, "risk guard tripped");
        Self {
            ok: false,
            reason: reason.into(),
            metrics,
        }
    }
}

/// Realized PnL of a closed trade in USDT, falling back to per-unit PnL
/// scaled by qty when the USDT figure is missing.
fn trade_pnl_usdt(t: &TradeAggregate) -> f64 {
    let Some(reward) = &t.reward_state else {
        return 0.0;
    };
    if let Some(pu) = reward.pnl_usdt {
        return pu;
    }
    match t.execution_state.qty {
        Some(q) => q * reward.pnl_raw,
        None => reward.pnl_raw,
    }
}

pub struct RiskGuard {
    cfg: RiskGuardConfig,
}

impl RiskGuard {
    pub fn new(cfg: RiskGuardConfig) -> Self {
        Self { cfg }
    }

    /// Evaluate all gates over the closed-trade ledger.
    pub fn check(
        &self,
        closed_trades: &[TradeAggregate],
        now_utc: i64,
        equity_usdt: f64,
    ) -> RiskGuardResult {
        // Strict UTC day start for `now_utc`.
        let day_start_ts = now_utc - now_utc.rem_euclid(86_400);

        let mut closed: Vec<&TradeAggregate> = closed_trades
            .iter()
            .filter(|t| t.execution_state.exit_time_utc.is_some())
            .collect();
        closed.sort_by_key(|t| t.execution_state.exit_time_utc.unwrap_or(0));

        let today: Vec<&&TradeAggregate> = closed
            .iter()
            .filter(|t| t.execution_state.exit_time_utc.unwrap_or(0) >= day_start_ts)
            .collect();
        let pnl_today: f64 = today.iter().map(|t| trade_pnl_usdt(t)).sum();
        let n_today = today.len() as u32;

        // 1. Cooldown.
        if self.cfg.cooldown_sec > 0 {
            if let Some(last) = closed.last() {
                let last_exit = last.execution_state.exit_time_utc.unwrap_or(0);
                let since = now_utc - last_exit;
                if last_exit > 0 && since < self.cfg.cooldown_sec {
                    return RiskGuardResult::blocked(
                        "cooldown",
                        serde_json::json!({
                            "cooldown_sec": self.cfg.cooldown_sec,
                            "seconds_since_last_exit": since,
                        }),
                    );
                }
            }
        }

        // 2. Trades per day.
        if let Some(cap) = self.cfg.max_trades_per_day {
            if n_today >= cap {
                return RiskGuardResult::blocked(
                    "max_trades_per_day",
                    serde_json::json!({ "trades_today": n_today, "max_trades_per_day": cap }),
                );
            }
        }

        // 3. Daily loss, absolute.
        if let Some(cap) = self.cfg.max_daily_loss_usdt.filter(|v| *v > 0.0) {
            if pnl_today <= -cap.abs() {
                return RiskGuardResult::blocked(
                    "max_daily_loss_usdt",
                    serde_json::json!({ "pnl_today_usdt": pnl_today, "max_daily_loss_usdt": cap }),
                );
            }
        }

        // 4. Daily loss, percent of equity.
        if let Some(pct) = self.cfg.max_daily_loss_pct.filter(|v| *v > 0.0) {
            if equity_usdt > 0.0 {
                let cap = equity_usdt * (pct / 100.0);
                if pnl_today <= -cap.abs() {
                    return RiskGuardResult::blocked(
                        "max_daily_loss_pct",
                        serde_json::json!({
                            "pnl_today_usdt": pnl_today,
                            "cap_usdt": cap,
                            "max_daily_loss_pct": pct,
                        }),
                    );
                }
            }
        }

        // 5. Consecutive losses (most recent run).
        let max_streak = self.cfg.max_consecutive_losses;
        if max_streak > 0 {
            let mut streak: u32 = 0;
            for t in closed.iter().rev() {
                if trade_pnl_usdt(t) < 0.0 {
                    streak += 1;
                    if streak >= max_streak {
                        return RiskGuardResult::blocked(
                            "max_consecutive_losses",
                            serde_json::json!({
                                "loss_streak": streak,
                                "max_consecutive_losses": max_streak,
                            }),
                        );
                    }
                } else {
                    break;
                }
            }
        }

        RiskGuardResult::ok(serde_json::json!({
            "pnl_today_usdt": pnl_today,
            "trades_today": n_today,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::TradeDecision;
    use crate::trade::{ExecutionState, PolicyInfo, RewardState, TradeStatus};
    use crate::types::{Direction, ExitType};

    /// Closed trade exiting at `exit_ts` with realized `pnl_usdt`.
    fn closed_trade(exit_ts: i64, pnl_usdt: f64) -> TradeAggregate {
        let decision = TradeDecision::new(
            Direction::Long,
            100.0,
            99.0,
            102.0,
            2.0,
            Some(1.0),
            exit_ts - 600,
        )
        .unwrap();
        let mut t = TradeAggregate::create_open(
            format!("t-{exit_ts}"),
            "BTCUSDT",
            "snap",
            exit_ts - 600,
            decision,
            PolicyInfo::new(),
        );
        let mut e = ExecutionState::open();
        e.status = TradeStatus::Closed;
        e.entry_time_utc = Some(exit_ts - 600);
        e.entry_fill_price = Some(100.0);
        e.exit_time_utc = Some(exit_ts);
        e.exit_fill_price = Some(if pnl_usdt >= 0.0 { 102.0 } else { 99.0 });
        e.exit_type = Some(if pnl_usdt >= 0.0 { ExitType::Tp } else { ExitType::Sl });
        e.qty = Some(1.0);
        t.attach_execution(e).unwrap();
        t.attach_reward(RewardState {
            pnl_raw: pnl_usdt,
            pnl_r: pnl_usdt,
            mfe: 1.0,
            mae: 1.0,
            holding_seconds: 600,
            reward_version: "v1".into(),
            pnl_usdt: Some(pnl_usdt),
            risk_usdt: Some(1.0),
            qty: Some(1.0),
            fees_usdt: None,
            funding_usdt: None,
        })
        .unwrap();
        t
    }

    // Noon UTC on some day: day_start is now - 43200.
    const NOW: i64 = 1_700_000_100 - (1_700_000_100 % 86_400) + 43_200;

    #[test]
    fn all_clear_with_empty_ledger() {
        let guard = RiskGuard::new(RiskGuardConfig::default());
        let res = guard.check(&[], NOW, 1_000.0);
        assert!(res.ok);
        assert_eq!(res.reason, "ok");
    }

    #[test]
    fn cooldown_blocks_recent_exit() {
        let cfg = RiskGuardConfig {
            cooldown_sec: 900,
            ..Default::default()
        };
        let guard = RiskGuard::new(cfg);
        let trades = vec![closed_trade(NOW - 300, 1.0)];
        let res = guard.check(&trades, NOW, 1_000.0);
        assert!(!res.ok);
        assert_eq!(res.reason, "cooldown");

        // Past the window it clears.
        let trades = vec![closed_trade(NOW - 1_000, 1.0)];
        assert!(guard.check(&trades, NOW, 1_000.0).ok);
    }

    #[test]
    fn daily_trade_cap_counts_only_today() {
        let cfg = RiskGuardConfig {
            max_trades_per_day: Some(2),
            max_consecutive_losses: 0,
            ..Default::default()
        };
        let guard = RiskGuard::new(cfg);

        // Two trades yesterday do not count.
        let trades = vec![
            closed_trade(NOW - 86_400 - 100, 1.0),
            closed_trade(NOW - 86_400 - 50, 1.0),
        ];
        assert!(guard.check(&trades, NOW, 1_000.0).ok);

        // Two today trip the cap.
        let trades = vec![closed_trade(NOW - 7_200, 1.0), closed_trade(NOW - 3_600, 1.0)];
        let res = guard.check(&trades, NOW, 1_000.0);
        assert!(!res.ok);
        assert_eq!(res.reason, "max_trades_per_day");
    }

    #[test]
    fn daily_loss_usdt_blocks() {
        let cfg = RiskGuardConfig {
            max_daily_loss_usdt: Some(10.0),
            max_consecutive_losses: 0,
            ..Default::default()
        };
        let guard = RiskGuard::new(cfg);
        let trades = vec![closed_trade(NOW - 7_200, -6.0), closed_trade(NOW - 3_600, -5.0)];
        let res = guard.check(&trades, NOW, 1_000.0);
        assert!(!res.ok);
        assert_eq!(res.reason, "max_daily_loss_usdt");
    }

    #[test]
    fn daily_loss_pct_blocks() {
        let cfg = RiskGuardConfig {
            max_daily_loss_pct: Some(1.0),
            max_consecutive_losses: 0,
            ..Default::default()
        };
        let guard = RiskGuard::new(cfg);
        // Equity 1000 -> cap 10 USDT.
        let trades = vec![closed_trade(NOW - 3_600, -12.0)];
        let res = guard.check(&trades, NOW, 1_000.0);
        assert!(!res.ok);
        assert_eq!(res.reason, "max_daily_loss_pct");
    }

    #[test]
    fn loss_streak_blocks_and_win_resets() {
        let cfg = RiskGuardConfig {
            max_consecutive_losses: 3,
            ..Default::default()
        };
        let guard = RiskGuard::new(cfg);

        let trades = vec![
            closed_trade(NOW - 9_000, -1.0),
            closed_trade(NOW - 8_000, -1.0),
            closed_trade(NOW - 7_000, -1.0),
        ];
        let res = guard.check(&trades, NOW, 1_000.0);
        assert!(!res.ok);
        assert_eq!(res.reason, "max_consecutive_losses");

        // A win at the end of the run resets the streak.
        let trades = vec![
            closed_trade(NOW - 9_000, -1.0),
            closed_trade(NOW - 8_000, -1.0),
            closed_trade(NOW - 7_000, -1.0),
            closed_trade(NOW - 6_000, 2.0),
        ];
        assert!(guard.check(&trades, NOW, 1_000.0).ok);
    }

    #[test]
    fn losses_yesterday_do_not_count_toward_daily_loss() {
        let cfg = RiskGuardConfig {
            max_daily_loss_usdt: Some(10.0),
            max_consecutive_losses: 0,
            ..Default::default()
        };
        let guard = RiskGuard::new(cfg);
        let trades = vec![closed_trade(NOW - 86_400 - 100, -50.0)];
        assert!(guard.check(&trades, NOW, 1_000.0).ok);
    }
}
