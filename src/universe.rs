// =============================================================================
// Universe Selector — dynamic symbol universe over USDT-M perpetuals
// =============================================================================
//
// Pipeline per refresh:
//   1. enumerate active USDT-M symbols; drop stablecoin bases and the user
//      exclude list; force-include the user include list
//   2. bulk ticker scan: last price, quote volume, bid/ask spread
//   3. rank by liquidity, keep the top `max_candidates_by_liquidity`
//   4. per candidate: ATR% on `atr_tf`, funding rate, open interest; reject
//      low liquidity / wide spread / extreme funding / low volatility
//   5. composite score from liquidity, volatility (level + burst), volume
//      and OI acceleration, minus spread and funding penalties
//   6. greedy selection by descending score with pairwise log-return
//      correlation below `max_corr`
//   7. sticky keep: previously selected symbols that still score stay in
//   8. the caller falls back to a reference symbol when nothing survives
//
// Acceleration and z-score terms come from cached history (the universe
// cycle log); when history is missing the term degrades to neutral. Ties
// are broken by lexicographic symbol so the output is deterministic given
// identical venue data.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::exchange::Exchange;

pub const FALLBACK_SYMBOL: &str = "BTCUSDT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    pub target_symbols: usize,
    pub refresh_min: u64,

    pub min_quote_vol_usdt: f64,
    pub max_candidates_by_liquidity: usize,

    pub max_spread_pct: f64,
    pub max_abs_funding: f64,
    pub min_last_price: f64,

    pub atr_tf: String,
    pub atr_period: usize,
    pub atr_limit: u32,
    pub min_atr_pct: f64,

    pub max_corr: f64,
    pub corr_tf: String,
    pub corr_limit: u32,

    pub sticky_enabled: bool,
    pub sticky_keep: usize,

    pub history_points: usize,

    pub w_liq: f64,
    pub w_atr: f64,
    pub w_vol_burst: f64,
    pub w_vol_accel: f64,
    pub w_oi: f64,
    pub w_oi_accel: f64,
    pub w_fund_abs_pen: f64,
    pub w_fund_z_pen: f64,
    pub w_spread_pen: f64,

    pub exclude_bases: Vec<String>,
    pub include_symbols: Vec<String>,
    pub exclude_symbols: Vec<String>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            target_symbols: 8,
            refresh_min: 180,
            min_quote_vol_usdt: 20_000_000.0,
            max_candidates_by_liquidity: 160,
            max_spread_pct: 0.0030,
            max_abs_funding: 0.0030,
            min_last_price: 0.0,
            atr_tf: "1h".to_string(),
            atr_period: 14,
            atr_limit: 200,
            min_atr_pct: 0.004,
            max_corr: 0.85,
            corr_tf: "1h".to_string(),
            corr_limit: 250,
            sticky_enabled: true,
            sticky_keep: 2,
            history_points: 64,
            w_liq: 1.0,
            w_atr: 2.0,
            w_vol_burst: 0.7,
            w_vol_accel: 0.8,
            w_oi: 0.7,
            w_oi_accel: 0.6,
            w_fund_abs_pen: 1.2,
            w_fund_z_pen: 0.7,
            w_spread_pen: 1.0,
            exclude_bases: [
                "USDC", "BUSD", "TUSD", "FDUSD", "DAI", "USDP", "USDE", "USTC",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            include_symbols: Vec::new(),
            exclude_symbols: Vec::new(),
        }
    }
}

/// Scored candidate row, also the shape of the per-candidate cycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRow {
    pub symbol: String,
    pub quote_vol_usdt: f64,
    pub atr_tf: String,
    pub atr_pct: f64,
    pub atr_burst: Option<f64>,
    pub spread_pct: Option<f64>,
    pub funding_rate: f64,
    pub funding_z: Option<f64>,
    pub vol_accel: Option<f64>,
    pub open_interest: Option<f64>,
    pub oi_accel: Option<f64>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseReport {
    pub schema_version: String,
    pub timestamp_utc: i64,
    pub exchange: String,
    pub config: UniverseConfig,
    pub selected: Vec<CandidateRow>,
    pub candidates_scored: Vec<CandidateRow>,
    pub excluded: Vec<serde_json::Value>,
}

impl UniverseReport {
    /// Selected user symbols; never empty (reference-symbol fallback).
    pub fn selected_symbols(&self) -> Vec<String> {
        if self.selected.is_empty() {
            vec![FALLBACK_SYMBOL.to_string()]
        } else {
            self.selected.iter().map(|r| r.symbol.clone()).collect()
        }
    }

    /// One per-candidate row per refresh (negative samples included), used
    /// as AI training data for selection modeling.
    pub fn cycle_rows(&self) -> Vec<serde_json::Value> {
        let selected: HashSet<&str> = self.selected.iter().map(|r| r.symbol.as_str()).collect();
        self.candidates_scored
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                serde_json::json!({
                    "schema_version": "universe_cycle_v1",
                    "timestamp_utc": self.timestamp_utc,
                    "exchange": self.exchange,
                    "selector_version": self.schema_version,
                    "symbol": row.symbol,
                    "selected": if selected.contains(row.symbol.as_str()) { 1 } else { 0 },
                    "rank": idx + 1,
                    "target_symbols": self.config.target_symbols,
                    "quote_vol_usdt": row.quote_vol_usdt,
                    "atr_tf": row.atr_tf,
                    "atr_pct": row.atr_pct,
                    "atr_burst": row.atr_burst,
                    "spread_pct": row.spread_pct,
                    "funding_rate": row.funding_rate,
                    "funding_z": row.funding_z,
                    "vol_accel": row.vol_accel,
                    "open_interest": row.open_interest,
                    "oi_accel": row.oi_accel,
                    "score": row.score,
                })
            })
            .collect()
    }
}

/// Per-symbol metric history recovered from the universe cycle log.
#[derive(Debug, Clone, Default)]
pub struct SymbolHistory {
    pub funding_rate: Vec<f64>,
    pub atr_pct: Vec<f64>,
    pub quote_vol_usdt: Vec<f64>,
    pub open_interest: Vec<f64>,
}

/// The most recent metric row per symbol from the previous refresh.
#[derive(Debug, Clone, Default)]
pub struct PrevMetrics {
    pub funding_rate: Option<f64>,
    pub atr_pct: Option<f64>,
    pub quote_vol_usdt: Option<f64>,
    pub open_interest: Option<f64>,
}

fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Sample z-score of `x` against `series`; None below 8 points or with a
/// degenerate variance.
fn zscore(series: &[f64], x: f64) -> Option<f64> {
    if series.len() < 8 {
        return None;
    }
    let n = series.len() as f64;
    let mean = series.iter().sum::<f64>() / n;
    let var = series.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
    if var <= 1e-18 {
        return None;
    }
    Some((x - mean) / var.sqrt())
}

/// Log returns from closes; None below 10 usable returns.
fn log_returns(bars: &[crate::exchange::Ohlcv]) -> Option<Vec<f64>> {
    if bars.len() < 5 {
        return None;
    }
    let mut rets = Vec::with_capacity(bars.len() - 1);
    for w in bars.windows(2) {
        let (a, b) = (w[0].close, w[1].close);
        if a > 0.0 && b > 0.0 {
            rets.push((b / a).ln());
        }
    }
    (rets.len() >= 10).then_some(rets)
}

/// Pearson correlation over the overlapping tail; None below 12 points or
/// with zero variance.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 12 {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];
    let nf = n as f64;
    let ma = a.iter().sum::<f64>() / nf;
    let mb = b.iter().sum::<f64>() / nf;
    let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = b.iter().map(|x| (x - mb).powi(2)).sum();
    if va <= 0.0 || vb <= 0.0 {
        return None;
    }
    let cov: f64 = (0..n).map(|i| (a[i] - ma) * (b[i] - mb)).sum();
    Some(cov / (va * vb).sqrt())
}

fn base_of(symbol: &str) -> &str {
    symbol.strip_suffix("USDT").filter(|b| !b.is_empty()).unwrap_or(symbol)
}

struct LiquidityRow {
    symbol: String,
    quote_vol_usdt: f64,
    spread_pct: Option<f64>,
    forced: bool,
}

pub struct UniverseSelector {
    cfg: UniverseConfig,
}

impl UniverseSelector {
    pub fn new(cfg: UniverseConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &UniverseConfig {
        &self.cfg
    }

    pub async fn select(
        &self,
        ex: &dyn Exchange,
        prev_selected: &[String],
        history: &HashMap<String, SymbolHistory>,
        prev_metrics: &HashMap<String, PrevMetrics>,
    ) -> UniverseReport {
        let cfg = &self.cfg;
        let now = chrono::Utc::now().timestamp();

        let markets = ex.list_active_usdtm_symbols().await.unwrap_or_else(|e| {
            warn!(error = %e, "symbol enumeration failed");
            Vec::new()
        });

        let norm = |s: &str| s.trim().to_uppercase().replace('/', "");
        let include: HashSet<String> = cfg.include_symbols.iter().map(|s| norm(s)).collect();
        let exclude: HashSet<String> = cfg.exclude_symbols.iter().map(|s| norm(s)).collect();
        let stable_bases: HashSet<String> =
            cfg.exclude_bases.iter().map(|s| s.trim().to_uppercase()).collect();
        let prev: Vec<String> = prev_selected.iter().map(|s| norm(s)).collect();

        let mut candidates: BTreeMap<String, ()> =
            markets.iter().map(|m| (norm(m), ())).collect();
        for s in &include {
            candidates.insert(s.clone(), ());
        }
        for s in &exclude {
            candidates.remove(s);
        }
        let candidate_list: Vec<String> = candidates.into_keys().collect();

        let mut excluded: Vec<serde_json::Value> = Vec::new();
        let mut scored: Vec<CandidateRow> = Vec::new();

        // --- 2. Bulk ticker scan ---------------------------------------------
        let tickers = ex.fetch_tickers(&candidate_list).await.unwrap_or_else(|e| {
            warn!(error = %e, "bulk ticker fetch failed");
            HashMap::new()
        });

        let mut liq_rows: Vec<LiquidityRow> = Vec::new();
        for sym in &candidate_list {
            if stable_bases.contains(base_of(sym)) {
                excluded.push(serde_json::json!({"symbol": sym, "reason": "stablecoin_base"}));
                continue;
            }
            let Some(tk) = tickers.get(sym) else {
                excluded.push(serde_json::json!({"symbol": sym, "reason": "ticker_unavailable"}));
                continue;
            };
            let Some(last) = tk.last_price() else {
                excluded.push(serde_json::json!({"symbol": sym, "reason": "bad_last_price"}));
                continue;
            };
            if last < cfg.min_last_price && !include.contains(sym) {
                excluded.push(
                    serde_json::json!({"symbol": sym, "reason": "min_last_price", "last": last}),
                );
                continue;
            }
            let Some(qv) = tk.quote_volume else {
                excluded.push(serde_json::json!({"symbol": sym, "reason": "missing_quote_volume"}));
                continue;
            };
            let spread_pct = match (tk.bid, tk.ask) {
                (Some(b), Some(a)) if b > 0.0 && a >= b => {
                    let mid = (a + b) / 2.0;
                    (mid > 0.0).then(|| (a - b) / mid)
                }
                _ => None,
            };
            liq_rows.push(LiquidityRow {
                symbol: sym.clone(),
                quote_vol_usdt: qv,
                spread_pct,
                forced: false,
            });
        }

        // --- 3. Liquidity rank, top N ----------------------------------------
        liq_rows.sort_by(|a, b| {
            b.quote_vol_usdt
                .partial_cmp(&a.quote_vol_usdt)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        liq_rows.truncate(cfg.max_candidates_by_liquidity.max(10));

        for s in &include {
            if !liq_rows.iter().any(|r| &r.symbol == s) {
                liq_rows.push(LiquidityRow {
                    symbol: s.clone(),
                    quote_vol_usdt: 0.0,
                    spread_pct: None,
                    forced: true,
                });
            }
        }

        // --- 4./5. Metrics and score on the top set --------------------------
        for row in &liq_rows {
            let sym = &row.symbol;
            let qv = row.quote_vol_usdt;
            if qv < cfg.min_quote_vol_usdt && !row.forced {
                excluded.push(serde_json::json!({
                    "symbol": sym, "reason": "low_liquidity", "quote_vol_usdt": qv,
                }));
                continue;
            }
            if let Some(sp) = row.spread_pct {
                if sp > cfg.max_spread_pct && !row.forced {
                    excluded.push(serde_json::json!({
                        "symbol": sym, "reason": "wide_spread", "spread_pct": sp,
                    }));
                    continue;
                }
            }

            let funding = ex.fetch_funding_rate(sym).await;
            if cfg.max_abs_funding > 0.0 && funding.abs() > cfg.max_abs_funding && !row.forced {
                excluded.push(serde_json::json!({
                    "symbol": sym, "reason": "extreme_funding", "funding_rate": funding,
                }));
                continue;
            }

            let bars = match ex.fetch_ohlcv(sym, &cfg.atr_tf, cfg.atr_limit, None).await {
                Ok(b) => b,
                Err(e) => {
                    excluded.push(serde_json::json!({
                        "symbol": sym, "reason": format!("ohlcv_failed: {e}"),
                    }));
                    continue;
                }
            };
            let Some(atr_pct) = crate::indicators::atr::calculate_atr_pct(&bars, cfg.atr_period)
            else {
                excluded.push(serde_json::json!({"symbol": sym, "reason": "atr_unavailable"}));
                continue;
            };
            if atr_pct < cfg.min_atr_pct && !row.forced {
                excluded.push(serde_json::json!({
                    "symbol": sym, "reason": "low_volatility", "atr_pct": atr_pct,
                }));
                continue;
            }

            let oi = ex.fetch_open_interest(sym).await;

            let hist = history.get(sym);
            let prevm = prev_metrics.get(sym);

            // Funding z-score from cached history.
            let funding_z = hist.and_then(|h| {
                let tail_start = h.funding_rate.len().saturating_sub(cfg.history_points);
                zscore(&h.funding_rate[tail_start..], funding)
            });

            // Volume acceleration vs the previous refresh.
            let vol_accel = prevm
                .and_then(|p| p.quote_vol_usdt)
                .filter(|p| *p > 0.0)
                .map(|p| (qv - p) / p);

            // Volatility burst vs previous ATR%, else vs the history median.
            let atr_burst = prevm
                .and_then(|p| p.atr_pct)
                .filter(|p| *p > 1e-12)
                .map(|p| atr_pct / p)
                .or_else(|| {
                    let h = hist?;
                    if h.atr_pct.len() < 8 {
                        return None;
                    }
                    let tail_start = h.atr_pct.len().saturating_sub(cfg.history_points);
                    let mut tail: Vec<f64> = h.atr_pct[tail_start..].to_vec();
                    tail.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    let med = tail[tail.len() / 2];
                    (med > 1e-12).then(|| atr_pct / med)
                });

            // OI acceleration vs the previous refresh.
            let oi_accel = match (oi, prevm.and_then(|p| p.open_interest)) {
                (Some(cur), Some(p)) if p > 0.0 => Some((cur - p) / p),
                _ => None,
            };

            let liq_term = qv.max(1.0).log10();
            let oi_term = oi.map(|v| v.max(1.0).log10()).unwrap_or(0.0);
            let spread_pen = row.spread_pct.unwrap_or(0.0);
            let fund_z_abs = funding_z.map(f64::abs).unwrap_or(0.0);

            let v_acc = clamp(vol_accel.unwrap_or(0.0), -0.7, 3.0);
            let v_burst = clamp(atr_burst.unwrap_or(1.0), 0.3, 5.0);
            let oi_a = clamp(oi_accel.unwrap_or(0.0), -0.7, 3.0);

            let score = cfg.w_liq * liq_term
                + cfg.w_atr * atr_pct
                + cfg.w_vol_burst * v_burst
                + cfg.w_vol_accel * v_acc
                + cfg.w_oi * oi_term
                + cfg.w_oi_accel * oi_a
                - cfg.w_spread_pen * spread_pen * 100.0
                - cfg.w_fund_abs_pen * funding.abs() * 400.0
                - cfg.w_fund_z_pen * fund_z_abs * 0.5;

            scored.push(CandidateRow {
                symbol: sym.clone(),
                quote_vol_usdt: qv,
                atr_tf: cfg.atr_tf.clone(),
                atr_pct,
                atr_burst: atr_burst.map(|_| v_burst),
                spread_pct: row.spread_pct,
                funding_rate: funding,
                funding_z,
                vol_accel: vol_accel.map(|_| v_acc),
                open_interest: oi,
                oi_accel: oi_accel.map(|_| oi_a),
                score,
            });
        }

        // Descending score, lexicographic symbol on ties.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        // --- 6./7. Sticky keep + correlation-aware greedy selection ----------
        let mut selected: Vec<CandidateRow> = Vec::new();
        let mut ret_cache: HashMap<String, Option<Vec<f64>>> = HashMap::new();

        if cfg.sticky_enabled && !prev.is_empty() {
            let scored_syms: HashSet<&str> = scored.iter().map(|r| r.symbol.as_str()).collect();
            for sym in prev.iter().filter(|s| scored_syms.contains(s.as_str())).take(cfg.sticky_keep)
            {
                if let Some(row) = scored.iter().find(|r| &r.symbol == sym) {
                    debug!(symbol = %sym, "sticky keep");
                    selected.push(row.clone());
                }
            }
        }

        for row in &scored {
            if selected.len() >= cfg.target_symbols {
                break;
            }
            if selected.iter().any(|s| s.symbol == row.symbol) {
                continue;
            }

            let rets = self.returns_for(ex, &row.symbol, &mut ret_cache).await;
            let Some(rets) = rets else {
                excluded.push(
                    serde_json::json!({"symbol": row.symbol, "reason": "returns_unavailable"}),
                );
                continue;
            };

            let mut ok = true;
            let mut corr_with: BTreeMap<String, f64> = BTreeMap::new();
            let selected_syms: Vec<String> = selected.iter().map(|s| s.symbol.clone()).collect();
            for other in &selected_syms {
                let Some(other_rets) = self.returns_for(ex, other, &mut ret_cache).await else {
                    continue;
                };
                if let Some(c) = pearson(&rets, &other_rets) {
                    corr_with.insert(other.clone(), c);
                    if c.abs() > cfg.max_corr {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                excluded.push(serde_json::json!({
                    "symbol": row.symbol, "reason": "high_correlation", "corr_with": corr_with,
                }));
                continue;
            }
            selected.push(row.clone());
        }

        info!(
            exchange = ex.exchange_id(),
            scored = scored.len(),
            selected = selected.len(),
            excluded = excluded.len(),
            "universe selection complete"
        );

        let candidates_cap = (cfg.target_symbols * 20).max(50);
        scored.truncate(candidates_cap);
        excluded.truncate(400);

        UniverseReport {
            schema_version: "universe_v3".to_string(),
            timestamp_utc: now,
            exchange: ex.exchange_id().to_string(),
            config: cfg.clone(),
            selected,
            candidates_scored: scored,
            excluded,
        }
    }

    async fn returns_for(
        &self,
        ex: &dyn Exchange,
        symbol: &str,
        cache: &mut HashMap<String, Option<Vec<f64>>>,
    ) -> Option<Vec<f64>> {
        if let Some(cached) = cache.get(symbol) {
            return cached.clone();
        }
        let rets = match ex
            .fetch_ohlcv(symbol, &self.cfg.corr_tf, self.cfg.corr_limit, None)
            .await
        {
            Ok(bars) => log_returns(&bars),
            Err(_) => None,
        };
        cache.insert(symbol.to_string(), rets.clone());
        rets
    }
}

/// Rebuild per-symbol history and the latest metric row per symbol from the
/// universe cycle log (bounded to the most recent `max_rows` rows).
pub fn history_from_cycle_rows(
    rows: &[serde_json::Value],
    max_rows: usize,
) -> (HashMap<String, SymbolHistory>, HashMap<String, PrevMetrics>) {
    let start = rows.len().saturating_sub(max_rows);
    let rows = &rows[start..];

    let mut history: HashMap<String, SymbolHistory> = HashMap::new();
    for r in rows {
        let Some(sym) = r["symbol"].as_str() else { continue };
        let h = history.entry(sym.to_uppercase()).or_default();
        if let Some(v) = r["funding_rate"].as_f64() {
            h.funding_rate.push(v);
        }
        if let Some(v) = r["atr_pct"].as_f64() {
            h.atr_pct.push(v);
        }
        if let Some(v) = r["quote_vol_usdt"].as_f64() {
            h.quote_vol_usdt.push(v);
        }
        if let Some(v) = r["open_interest"].as_f64() {
            h.open_interest.push(v);
        }
    }

    let mut prev: HashMap<String, PrevMetrics> = HashMap::new();
    for r in rows.iter().rev() {
        let Some(sym) = r["symbol"].as_str() else { continue };
        let key = sym.to_uppercase();
        if prev.contains_key(&key) {
            continue;
        }
        prev.insert(
            key,
            PrevMetrics {
                funding_rate: r["funding_rate"].as_f64(),
                atr_pct: r["atr_pct"].as_f64(),
                quote_vol_usdt: r["quote_vol_usdt"].as_f64(),
                open_interest: r["open_interest"].as_f64(),
            },
        );
    }
    (history, prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{BracketIds, MarketConstraints, Ohlcv, OrderStatus, Ticker};
    use crate::types::Direction;
    use async_trait::async_trait;

    /// Deterministic stub venue. Symbols A/B share an identical return
    /// series (correlation 1.0); C uses a phase-shifted series orthogonal
    /// to A.
    struct StubExchange;

    fn series_bars(symbol: &str) -> Vec<Ohlcv> {
        let mut close = 100.0_f64;
        let mut bars = Vec::with_capacity(250);
        for i in 0..250i64 {
            let r = match symbol {
                // +,-,+,- ...
                "AAAUSDT" | "BBBUSDT" => {
                    if i % 2 == 0 {
                        0.01
                    } else {
                        -0.01
                    }
                }
                // +,+,-,- ... orthogonal to the pattern above
                _ => {
                    if (i / 2) % 2 == 0 {
                        0.01
                    } else {
                        -0.01
                    }
                }
            };
            close *= f64::exp(r);
            bars.push(Ohlcv {
                ts_ms: i * 3_600_000,
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume: 1000.0,
            });
        }
        bars
    }

    #[async_trait]
    impl Exchange for StubExchange {
        fn exchange_id(&self) -> &str {
            "stub"
        }

        async fn list_active_usdtm_symbols(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![
                "AAAUSDT".into(),
                "BBBUSDT".into(),
                "CCCUSDT".into(),
                "USDCUSDT".into(),
                "LOWUSDT".into(),
            ])
        }

        async fn fetch_tickers(
            &self,
            symbols: &[String],
        ) -> anyhow::Result<HashMap<String, Ticker>> {
            let mut out = HashMap::new();
            for s in symbols {
                let qv = match s.as_str() {
                    "AAAUSDT" => 5.0e8,
                    "BBBUSDT" => 4.0e8,
                    "CCCUSDT" => 3.0e8,
                    "USDCUSDT" => 9.0e8,
                    _ => 1.0e6,
                };
                out.insert(
                    s.clone(),
                    Ticker {
                        last: Some(100.0),
                        bid: Some(99.99),
                        ask: Some(100.01),
                        quote_volume: Some(qv),
                    },
                );
            }
            Ok(out)
        }

        async fn fetch_ticker(&self, symbol: &str) -> anyhow::Result<Ticker> {
            Ok(self
                .fetch_tickers(&[symbol.to_string()])
                .await?
                .remove(symbol)
                .unwrap())
        }

        async fn fetch_ohlcv(
            &self,
            symbol: &str,
            _timeframe: &str,
            limit: u32,
            _since_ms: Option<i64>,
        ) -> anyhow::Result<Vec<Ohlcv>> {
            let mut bars = series_bars(symbol);
            bars.truncate(limit as usize);
            Ok(bars)
        }

        async fn fetch_funding_rate(&self, _symbol: &str) -> f64 {
            0.0001
        }

        async fn fetch_open_interest(&self, _symbol: &str) -> Option<f64> {
            Some(1.0e6)
        }

        async fn fetch_usdt_balance(&self) -> anyhow::Result<(f64, f64)> {
            Ok((1000.0, 1000.0))
        }

        async fn market_constraints(&self, _symbol: &str) -> anyhow::Result<MarketConstraints> {
            Ok(MarketConstraints::default())
        }

        async fn set_oneway_mode(&self, _symbol: &str) {}
        async fn set_isolated_margin(&self, _symbol: &str) {}
        async fn set_leverage(&self, _symbol: &str, _leverage: u32) {}

        async fn place_entry_and_brackets(
            &self,
            _symbol: &str,
            _direction: Direction,
            _qty: f64,
            _tp_price: f64,
            _sl_price: f64,
            _client_order_id: &str,
        ) -> anyhow::Result<BracketIds> {
            Ok(BracketIds::default())
        }

        async fn fetch_order(&self, _symbol: &str, _order_id: &str) -> Option<OrderStatus> {
            None
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> bool {
            false
        }

        async fn fetch_position_qty(&self, _symbol: &str) -> f64 {
            0.0
        }
    }

    #[tokio::test]
    async fn correlated_candidate_rejected() {
        let selector = UniverseSelector::new(UniverseConfig::default());
        let report = selector
            .select(&StubExchange, &[], &HashMap::new(), &HashMap::new())
            .await;

        let selected = report.selected_symbols();
        // A wins on liquidity; B is correlation-identical to A and must be
        // rejected; C is orthogonal and joins.
        assert!(selected.contains(&"AAAUSDT".to_string()));
        assert!(selected.contains(&"CCCUSDT".to_string()));
        assert!(!selected.contains(&"BBBUSDT".to_string()));

        let high_corr = report
            .excluded
            .iter()
            .any(|e| e["symbol"] == "BBBUSDT" && e["reason"] == "high_correlation");
        assert!(high_corr, "excluded: {:?}", report.excluded);
    }

    #[tokio::test]
    async fn stablecoin_and_illiquid_excluded() {
        let selector = UniverseSelector::new(UniverseConfig::default());
        let report = selector
            .select(&StubExchange, &[], &HashMap::new(), &HashMap::new())
            .await;

        assert!(report
            .excluded
            .iter()
            .any(|e| e["symbol"] == "USDCUSDT" && e["reason"] == "stablecoin_base"));
        assert!(report
            .excluded
            .iter()
            .any(|e| e["symbol"] == "LOWUSDT" && e["reason"] == "low_liquidity"));
        // Selected symbols are USDT-quoted and respect the target bound.
        assert!(report.selected.len() <= report.config.target_symbols);
        for row in &report.selected {
            assert!(row.symbol.ends_with("USDT"));
        }
    }

    #[tokio::test]
    async fn sticky_keep_retains_previous_symbol() {
        let selector = UniverseSelector::new(UniverseConfig::default());
        // Previous selection favored C even though A outranks it.
        let prev = vec!["CCCUSDT".to_string()];
        let report = selector
            .select(&StubExchange, &prev, &HashMap::new(), &HashMap::new())
            .await;
        assert_eq!(report.selected[0].symbol, "CCCUSDT");
    }

    #[tokio::test]
    async fn cycle_rows_carry_selection_labels() {
        let selector = UniverseSelector::new(UniverseConfig::default());
        let report = selector
            .select(&StubExchange, &[], &HashMap::new(), &HashMap::new())
            .await;
        let rows = report.cycle_rows();
        assert_eq!(rows.len(), report.candidates_scored.len());
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row["rank"], i as i64 + 1);
            assert!(row["selected"] == 1 || row["selected"] == 0);
            assert_eq!(row["schema_version"], "universe_cycle_v1");
        }
        // The rejected correlated symbol appears as a negative sample.
        assert!(rows
            .iter()
            .any(|r| r["symbol"] == "BBBUSDT" && r["selected"] == 0));
    }

    #[test]
    fn zscore_requires_history_and_spread() {
        assert!(zscore(&[0.1; 5], 0.2).is_none());
        assert!(zscore(&[0.1; 20], 0.2).is_none()); // zero variance
        let series: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let z = zscore(&series, 19.0).unwrap();
        assert!(z > 1.0);
    }

    #[test]
    fn pearson_detects_identity_and_orthogonality() {
        let a: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 0.01 } else { -0.01 }).collect();
        let c: Vec<f64> = (0..100)
            .map(|i| if (i / 2) % 2 == 0 { 0.01 } else { -0.01 })
            .collect();
        assert!((pearson(&a, &a).unwrap() - 1.0).abs() < 1e-12);
        assert!(pearson(&a, &c).unwrap().abs() < 0.1);
    }

    #[test]
    fn history_rebuild_from_cycle_rows() {
        let rows = vec![
            serde_json::json!({"symbol": "aaausdt", "funding_rate": 0.001, "atr_pct": 0.01, "quote_vol_usdt": 1.0e8}),
            serde_json::json!({"symbol": "AAAUSDT", "funding_rate": 0.002, "atr_pct": 0.02, "quote_vol_usdt": 2.0e8, "open_interest": 5.0e5}),
        ];
        let (hist, prev) = history_from_cycle_rows(&rows, 5000);
        assert_eq!(hist["AAAUSDT"].funding_rate, vec![0.001, 0.002]);
        let p = &prev["AAAUSDT"];
        assert_eq!(p.funding_rate, Some(0.002));
        assert_eq!(p.open_interest, Some(5.0e5));
    }
}
