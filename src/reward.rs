// =============================================================================
// Reward calculator — realized PnL, risk-normalized reward, MFE/MAE
// =============================================================================
//
// Precondition: the execution is CLOSED with both fills known.
//
// Fees/funding interpretation depends on whether qty is known:
//   - qty known (linear futures): pnl_usdt = qty * delta - fees - funding,
//     and pnl_raw stays the legacy per-unit form with per-unit costs
//   - qty unknown: fees/funding are already treated as per-unit values
//
// pnl_r = pnl_raw / risk_unit is always produced and is the label used by
// the supervised and RL datasets.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::decision::TradeDecision;
use crate::errors::{DomainError, DomainResult};
use crate::trade::{ExecutionState, RewardState, TradeStatus};
use crate::types::Direction;

/// One OHLC bar of the holding window, used for excursion metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OhlcBar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Maximum favorable / adverse excursion in price units over the window.
/// Both are non-negative magnitudes; an empty window yields (0, 0).
pub fn mfe_mae_from_ohlc(entry_price: f64, direction: Direction, bars: &[OhlcBar]) -> (f64, f64) {
    if bars.is_empty() {
        return (0.0, 0.0);
    }
    let max_high = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let min_low = bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);

    let (mfe, mae) = match direction {
        Direction::Long => (max_high - entry_price, entry_price - min_low),
        Direction::Short => (entry_price - min_low, max_high - entry_price),
    };
    (mfe.max(0.0), mae.max(0.0))
}

/// Compute the realized reward for a closed trade.
pub fn calculate_reward(
    decision: &TradeDecision,
    execution: &ExecutionState,
    ohlc_bars: &[OhlcBar],
) -> DomainResult<RewardState> {
    if execution.status != TradeStatus::Closed {
        return Err(DomainError::RewardPrecondition(
            "execution must be CLOSED".into(),
        ));
    }
    let entry_price = execution.entry_fill_price.ok_or_else(|| {
        DomainError::RewardPrecondition("entry_fill_price missing".into())
    })?;
    let exit_price = execution.exit_fill_price.ok_or_else(|| {
        DomainError::RewardPrecondition("exit_fill_price missing".into())
    })?;
    let entry_time = execution.entry_time_utc.ok_or_else(|| {
        DomainError::RewardPrecondition("entry_time_utc missing".into())
    })?;
    let exit_time = execution.exit_time_utc.ok_or_else(|| {
        DomainError::RewardPrecondition("exit_time_utc missing".into())
    })?;

    let fees = execution.fees_total;
    let funding = execution.funding_paid;
    let holding_seconds = exit_time - entry_time;

    let price_delta = (exit_price - entry_price) * decision.direction.sign();

    let mut pnl_usdt = None;
    let mut risk_usdt = None;
    let (fees_unit, funding_unit) = match execution.qty {
        Some(q) if q > 0.0 => {
            pnl_usdt = Some(q * price_delta - fees - funding);
            risk_usdt = Some(q * decision.risk_unit);
            (fees / q, funding / q)
        }
        _ => (fees, funding),
    };

    let pnl_raw = price_delta - (fees_unit + funding_unit);

    let risk_unit = decision.risk_unit;
    if !(risk_unit > 0.0) {
        return Err(DomainError::RewardPrecondition(
            "decision.risk_unit must be > 0".into(),
        ));
    }
    let pnl_r = pnl_raw / risk_unit;

    let (mfe, mae) = mfe_mae_from_ohlc(entry_price, decision.direction, ohlc_bars);

    Ok(RewardState {
        pnl_raw,
        pnl_r,
        mfe,
        mae,
        holding_seconds,
        reward_version: "v1".to_string(),
        pnl_usdt,
        risk_usdt,
        qty: execution.qty,
        fees_usdt: Some(fees),
        funding_usdt: Some(funding),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitType;

    fn decision(direction: Direction, entry: f64, sl: f64, tp: f64) -> TradeDecision {
        TradeDecision::new(direction, entry, sl, tp, 2.0, Some(1.0), 1_700_000_100).unwrap()
    }

    fn closed_execution(entry: f64, exit: f64, qty: Option<f64>, fees: f64) -> ExecutionState {
        let mut e = ExecutionState::open();
        e.status = TradeStatus::Closed;
        e.entry_time_utc = Some(1_700_000_101);
        e.entry_fill_price = Some(entry);
        e.exit_time_utc = Some(1_700_000_401);
        e.exit_fill_price = Some(exit);
        e.exit_type = Some(ExitType::Tp);
        e.fees_total = fees;
        e.qty = qty;
        e
    }

    fn window(entry: f64, hi: f64, lo: f64, close: f64) -> Vec<OhlcBar> {
        vec![
            OhlcBar { timestamp: 1_700_000_100, open: entry, high: entry, low: entry, close: entry },
            OhlcBar { timestamp: 1_700_000_400, open: entry, high: hi, low: lo, close },
        ]
    }

    #[test]
    fn paper_tp_long_reward() {
        // LONG entry=100 sl=99.8 tp=100.4 qty=1, est fees 0.12 (both sides).
        let d = decision(Direction::Long, 100.0, 99.8, 100.4);
        let e = closed_execution(100.0, 100.4, Some(1.0), 0.12);
        let r = calculate_reward(&d, &e, &window(100.0, 100.5, 99.9, 100.4)).unwrap();

        // pnl_usdt = 1 * 0.4 - 0.12 = 0.28, per-unit identical at qty=1.
        assert!((r.pnl_usdt.unwrap() - 0.28).abs() < 1e-12);
        assert!((r.pnl_raw - 0.28).abs() < 1e-12);
        // pnl_r = 0.28 / 0.2 = 1.4, i.e. roughly RR 2 minus fees.
        assert!((r.pnl_r - 1.4).abs() < 1e-9);
        assert!((r.risk_usdt.unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(r.holding_seconds, 300);
        assert_eq!(r.reward_version, "v1");
    }

    #[test]
    fn pnl_r_is_pnl_raw_over_risk_unit() {
        let d = decision(Direction::Long, 100.0, 99.5, 101.0);
        let e = closed_execution(100.0, 101.0, Some(2.0), 0.0);
        let r = calculate_reward(&d, &e, &[]).unwrap();
        assert!((r.pnl_r - r.pnl_raw / d.risk_unit).abs() < 1e-6);
        assert!((r.pnl_r - 2.0).abs() < 1e-9);
    }

    #[test]
    fn short_loss_is_negative() {
        // SHORT entry=100 exits higher at 100.5 -> losing trade.
        let d = decision(Direction::Short, 100.0, 100.5, 99.0);
        let e = closed_execution(100.0, 100.5, Some(1.0), 0.0);
        let r = calculate_reward(&d, &e, &window(100.0, 100.6, 99.8, 100.5)).unwrap();
        assert!(r.pnl_raw < 0.0);
        assert!((r.pnl_r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn fees_are_per_unit_when_qty_unknown() {
        let d = decision(Direction::Long, 100.0, 99.8, 100.4);
        let e = closed_execution(100.0, 100.4, None, 0.05);
        let r = calculate_reward(&d, &e, &[]).unwrap();
        assert!((r.pnl_raw - (0.4 - 0.05)).abs() < 1e-12);
        assert!(r.pnl_usdt.is_none());
        assert!(r.risk_usdt.is_none());
    }

    #[test]
    fn mfe_mae_long_non_negative() {
        let bars = window(100.0, 101.5, 99.2, 100.4);
        let (mfe, mae) = mfe_mae_from_ohlc(100.0, Direction::Long, &bars);
        assert!((mfe - 1.5).abs() < 1e-12);
        assert!((mae - 0.8).abs() < 1e-12);
        assert!(mfe >= 0.0 && mae >= 0.0);
    }

    #[test]
    fn mfe_mae_short_mirrors() {
        let bars = window(100.0, 100.6, 98.5, 99.0);
        let (mfe, mae) = mfe_mae_from_ohlc(100.0, Direction::Short, &bars);
        assert!((mfe - 1.5).abs() < 1e-12);
        assert!((mae - 0.6).abs() < 1e-12);
    }

    #[test]
    fn mfe_mae_empty_window_is_zero() {
        assert_eq!(mfe_mae_from_ohlc(100.0, Direction::Long, &[]), (0.0, 0.0));
    }

    #[test]
    fn open_execution_rejected() {
        let d = decision(Direction::Long, 100.0, 99.8, 100.4);
        let e = ExecutionState::open();
        assert!(calculate_reward(&d, &e, &[]).is_err());
    }
}
