// =============================================================================
// Average True Range (ATR) — trailing mean of true ranges
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR here is the simple mean of the last `period` TR values. Snapshots and
// the universe selector both use this definition, so the numbers stay
// comparable across the decision logs and the derived datasets.
//
// Default period: 14
// =============================================================================

use crate::exchange::Ohlcv;

/// Compute the most recent ATR value from a slice of OHLCV bars (oldest
/// first) as the mean of the last `period` true ranges.
///
/// Returns `None` when `period` is zero, when fewer than `period + 1` bars
/// are available (each TR needs a previous close), or when any intermediate
/// value is non-finite.
pub fn calculate_atr(bars: &[Ohlcv], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut trs: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        let tr = hl.max(hc).max(lc);
        if !tr.is_finite() {
            return None;
        }
        trs.push(tr);
    }

    let tail = &trs[trs.len() - period..];
    let atr = tail.iter().sum::<f64>() / period as f64;
    atr.is_finite().then_some(atr)
}

/// ATR as a fraction of the last close (e.g. 0.005 for 0.5 %).
///
/// Unitless, so volatility is comparable across assets with different price
/// scales.
pub fn calculate_atr_pct(bars: &[Ohlcv], period: usize) -> Option<f64> {
    let atr = calculate_atr(bars, period)?;
    let last_close = bars.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some(atr / last_close)
}
