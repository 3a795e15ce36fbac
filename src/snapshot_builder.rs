// =============================================================================
// Snapshot Builder — venue data -> immutable multi-timeframe snapshot
// =============================================================================
//
// Timing discipline: only *closed* bars are observed. If the most recent bar
// is still open (now < open + tf) it is dropped, for the LTF and for every
// HTF. `snapshot_time_utc` is the LTF close time, so the snapshot id is a
// pure function of the closed bar and rebuilding within the same bar
// converges on the same id.
//
// Hard config lock: the LTF must be 5m and the HTF set must include
// {15m, 1h, 4h}. This prevents silent drift and look-ahead mistakes.
//
// Instance-scoped caches (rebuilt from venue data after a restart):
//   - funding history ring per symbol, last 200 samples; the z-score stays
//     0 until 20 samples have been seen
//   - daily ATR metrics per symbol, refreshed every 6 hours
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::exchange::{tf_to_sec, Exchange, Ohlcv};
use crate::indicators::atr::{calculate_atr, calculate_atr_pct};
use crate::indicators::sma::sma;
use crate::indicators::structure::{distance_to_structure, hh_ll_state};
use crate::snapshot::{
    ContextBlock, HtfBlock, HtfVolRegime, LtfBlock, LtfPrice, MarketRegime, MicroStructure,
    Snapshot, Trend, VolRegime,
};
use crate::types::Session;

const FUNDING_HISTORY_CAP: usize = 200;
const FUNDING_HISTORY_MIN: usize = 20;
const DAILY_CACHE_REFRESH_SEC: i64 = 6 * 60 * 60;

#[derive(Debug, Clone)]
pub struct SnapshotBuilderConfig {
    pub ltf_tf: String,
    pub htf_tfs: Vec<String>,
    pub atr_period: usize,
    pub vol_threshold_atr_pct: f64,
    pub ms_lookback: usize,
    pub ma_fast: usize,
    pub ma_slow: usize,
    pub htf_vol_threshold_atr_pct: f64,
}

impl Default for SnapshotBuilderConfig {
    fn default() -> Self {
        Self {
            ltf_tf: "5m".to_string(),
            htf_tfs: vec!["15m".to_string(), "1h".to_string(), "4h".to_string()],
            atr_period: 14,
            vol_threshold_atr_pct: 0.003,
            ms_lookback: 20,
            ma_fast: 20,
            ma_slow: 50,
            htf_vol_threshold_atr_pct: 0.01,
        }
    }
}

impl SnapshotBuilderConfig {
    /// Enforce the timeframe lock. Called at startup; a violation is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.ltf_tf.trim().to_lowercase() != "5m" {
            bail!("snapshot builder ltf_tf must be '5m' (got {:?})", self.ltf_tf);
        }
        let have: std::collections::HashSet<String> = self
            .htf_tfs
            .iter()
            .map(|t| t.trim().to_lowercase())
            .collect();
        for required in ["15m", "1h", "4h"] {
            if !have.contains(required) {
                bail!(
                    "snapshot builder htf_tfs must include 15m,1h,4h (got {:?})",
                    self.htf_tfs
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct DailyAtrEntry {
    ts: i64,
    daily_atr_pct: f64,
    daily_atr_ratio_30: f64,
}

pub struct SnapshotBuilder {
    exchange: Arc<dyn Exchange>,
    cfg: SnapshotBuilderConfig,
    funding_hist: Mutex<HashMap<String, VecDeque<f64>>>,
    daily_cache: Mutex<HashMap<String, DailyAtrEntry>>,
}

impl SnapshotBuilder {
    pub fn new(exchange: Arc<dyn Exchange>, cfg: SnapshotBuilderConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            exchange,
            cfg,
            funding_hist: Mutex::new(HashMap::new()),
            daily_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SnapshotBuilderConfig {
        &self.cfg
    }

    /// Build a snapshot for `symbol` using the wall clock.
    pub async fn build(&self, symbol: &str) -> Result<Snapshot> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.build_at(symbol, now_ms).await
    }

    /// Build a snapshot as observed at `now_ms`. Exposed separately so the
    /// closed-bar discipline is testable against a fixed clock.
    pub async fn build_at(&self, symbol: &str, now_ms: i64) -> Result<Snapshot> {
        let now_utc = now_ms / 1000;
        let ltf_tf = self.cfg.ltf_tf.clone();
        let tf_ms = tf_to_sec(&ltf_tf) * 1000;

        let mut ltf_bars = self
            .exchange
            .fetch_ohlcv(symbol, &ltf_tf, 220, None)
            .await
            .with_context(|| format!("LTF ohlcv fetch failed for {symbol}"))?;
        drop_open_bar(&mut ltf_bars, now_ms, tf_ms);

        if ltf_bars.is_empty() {
            warn!(symbol, "no closed LTF bars — emitting placeholder snapshot");
            return Ok(placeholder_snapshot(
                symbol,
                now_utc,
                self.exchange.exchange_id(),
            ));
        }

        let last = *ltf_bars.last().unwrap();
        let ltf_close_time = (last.ts_ms + tf_ms) / 1000;
        let snapshot_id =
            Snapshot::compute_id(self.exchange.exchange_id(), symbol, &ltf_tf, ltf_close_time);

        let close = last.close;
        let range_pct = if close > 0.0 {
            (last.high - last.low) / close
        } else {
            0.0
        };
        let atr_pct = calculate_atr_pct(&ltf_bars, self.cfg.atr_period).unwrap_or(0.0);
        let volatility_regime = ltf_vol_regime(atr_pct, self.cfg.vol_threshold_atr_pct);

        let window = self.cfg.ms_lookback.max(5);
        let closes: Vec<f64> = ltf_bars
            .iter()
            .rev()
            .take(window)
            .rev()
            .map(|b| b.close)
            .collect();
        let state = hh_ll_state(&closes);
        let micro_structure = MicroStructure {
            hh_ll_state: state,
            bos: state.is_bos(),
            distance_to_structure: distance_to_structure(&closes, close),
        };

        // ---------- HTF blocks ----------
        let mut htf: BTreeMap<String, HtfBlock> = BTreeMap::new();
        for tf in &self.cfg.htf_tfs {
            let mut bars = match self.exchange.fetch_ohlcv(symbol, tf, 220, None).await {
                Ok(b) => b,
                Err(e) => {
                    debug!(symbol, tf, error = %e, "HTF ohlcv fetch failed — block omitted");
                    continue;
                }
            };
            drop_open_bar(&mut bars, now_ms, tf_to_sec(tf) * 1000);
            if bars.is_empty() {
                continue;
            }
            htf.insert(tf.clone(), self.htf_block(&bars));
        }

        // ---------- Funding + rolling z-score ----------
        let funding = self.exchange.fetch_funding_rate(symbol).await;
        let funding_zscore = self.push_funding(symbol, funding);

        // ---------- Bid/ask spread ----------
        let (bid, ask, mid, spread_pct) = match self.exchange.fetch_ticker(symbol).await {
            Ok(tk) => {
                let last_px = tk.last;
                let bid = tk.bid.or(last_px);
                let ask = tk.ask.or(last_px);
                match (bid, ask) {
                    (Some(b), Some(a)) => {
                        let mid = if b + a > 0.0 { (b + a) / 2.0 } else { close };
                        let spread = if mid > 0.0 { (a - b).abs() / mid } else { 0.0 };
                        (Some(b), Some(a), Some(mid), spread)
                    }
                    _ => (bid, ask, None, 0.0),
                }
            }
            Err(e) => {
                debug!(symbol, error = %e, "ticker fetch failed — spread omitted");
                (None, None, None, 0.0)
            }
        };

        // ---------- Daily ATR metrics (cached) ----------
        let (daily_atr_pct, daily_atr_ratio_30) = self.daily_atr(symbol, now_utc).await;

        Ok(Snapshot {
            schema_version: "v3".to_string(),
            snapshot_id,
            snapshot_time_utc: ltf_close_time,
            observer_time_utc: now_utc.max(ltf_close_time),
            symbol: symbol.to_string(),
            ltf: LtfBlock {
                tf: ltf_tf,
                timestamp: ltf_close_time,
                price: LtfPrice {
                    open: last.open,
                    high: last.high,
                    low: last.low,
                    close,
                    volume: last.volume,
                    range_pct,
                    atr_pct,
                    volatility_regime,
                },
                micro_structure,
            },
            htf,
            context: ContextBlock {
                session: Session::from_utc_ts(ltf_close_time),
                exchange: self.exchange.exchange_id().to_string(),
                funding_rate: funding,
                funding_zscore,
                bid,
                ask,
                mid,
                spread_pct,
                daily_atr_pct,
                daily_atr_ratio_30,
            },
        })
    }

    fn htf_block(&self, bars: &[Ohlcv]) -> HtfBlock {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let last_c = *closes.last().unwrap_or(&0.0);
        let ma_f = sma(&closes, self.cfg.ma_fast);
        let ma_s = sma(&closes, self.cfg.ma_slow);

        let trend = if last_c > ma_s && ma_f >= ma_s {
            Trend::Up
        } else if last_c < ma_s && ma_f <= ma_s {
            Trend::Down
        } else {
            Trend::Flat
        };

        let ma_spread = if last_c > 0.0 {
            (ma_f - ma_s).abs() / last_c
        } else {
            0.0
        };
        let market_regime = if ma_spread >= 0.0015 {
            MarketRegime::Trend
        } else {
            MarketRegime::Range
        };

        let atr_pct_h = calculate_atr_pct(bars, self.cfg.atr_period).unwrap_or(0.0);
        let volatility_regime = if atr_pct_h >= self.cfg.htf_vol_threshold_atr_pct {
            HtfVolRegime::High
        } else {
            HtfVolRegime::Normal
        };

        let window = self.cfg.ms_lookback.max(5);
        let tail: Vec<f64> = closes.iter().rev().take(window).rev().cloned().collect();
        let state = hh_ll_state(&tail);

        HtfBlock {
            trend,
            bos: state.is_bos(),
            liquidity_state: None,
            market_regime,
            volatility_regime,
        }
    }

    /// Record a funding sample and return the rolling z-score (0.0 until the
    /// history is deep enough or the spread is degenerate).
    fn push_funding(&self, symbol: &str, funding: f64) -> f64 {
        let mut hist_map = self.funding_hist.lock();
        let hist = hist_map.entry(symbol.to_string()).or_default();
        hist.push_back(funding);
        while hist.len() > FUNDING_HISTORY_CAP {
            hist.pop_front();
        }
        if hist.len() < FUNDING_HISTORY_MIN {
            return 0.0;
        }
        let n = hist.len() as f64;
        let mean = hist.iter().sum::<f64>() / n;
        let var = hist.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
        let sd = var.sqrt();
        if sd > 1e-12 {
            (funding - mean) / sd
        } else {
            0.0
        }
    }

    /// Daily ATR% and its ratio vs the 30-day mean, cached per symbol for
    /// six hours. Failures leave the previous values or zeros.
    async fn daily_atr(&self, symbol: &str, now_utc: i64) -> (f64, f64) {
        {
            let cache = self.daily_cache.lock();
            if let Some(entry) = cache.get(symbol) {
                if now_utc - entry.ts <= DAILY_CACHE_REFRESH_SEC {
                    return (entry.daily_atr_pct, entry.daily_atr_ratio_30);
                }
            }
        }

        let mut daily_atr_pct = 0.0;
        let mut daily_atr_ratio_30 = 0.0;

        if let Ok(bars) = self.exchange.fetch_ohlcv(symbol, "1d", 70, None).await {
            if bars.len() >= 20 {
                // Rolling trailing-mean ATR series over the daily TR values.
                let period = self.cfg.atr_period;
                let mut atr_series: Vec<f64> = Vec::new();
                for end in (period + 1)..=bars.len() {
                    if let Some(a) = calculate_atr(&bars[..end], period) {
                        atr_series.push(a);
                    }
                }
                if let Some(&cur_atr) = atr_series.last() {
                    let tail_start = atr_series.len().saturating_sub(30);
                    let tail = &atr_series[tail_start..];
                    let mean_30 = tail.iter().sum::<f64>() / tail.len() as f64;
                    let close_d = bars.last().map(|b| b.close).unwrap_or(0.0);
                    if close_d > 0.0 {
                        daily_atr_pct = cur_atr / close_d;
                    }
                    if mean_30 > 0.0 {
                        daily_atr_ratio_30 = cur_atr / mean_30;
                    }
                }
            }
        }

        self.daily_cache.lock().insert(
            symbol.to_string(),
            DailyAtrEntry {
                ts: now_utc,
                daily_atr_pct,
                daily_atr_ratio_30,
            },
        );
        (daily_atr_pct, daily_atr_ratio_30)
    }
}

/// Drop the still-open final bar: a bar is closed only once
/// `now >= open + tf`.
fn drop_open_bar(bars: &mut Vec<Ohlcv>, now_ms: i64, tf_ms: i64) {
    if let Some(last) = bars.last().copied() {
        if now_ms < last.ts_ms + tf_ms && bars.len() >= 2 {
            bars.pop();
        }
    }
}

fn ltf_vol_regime(atr_pct: f64, threshold: f64) -> VolRegime {
    if threshold <= 0.0 {
        return VolRegime::Normal;
    }
    if atr_pct < 0.5 * threshold {
        VolRegime::Dead
    } else if atr_pct < 1.5 * threshold {
        VolRegime::Normal
    } else {
        VolRegime::Expansion
    }
}

/// Benign placeholder when a symbol has no usable bars: schema-valid, close
/// 0.0, empty HTF. Downstream gates reject decisions built on it, but the
/// cycle-record-per-symbol invariant still holds.
fn placeholder_snapshot(symbol: &str, now_utc: i64, exchange_id: &str) -> Snapshot {
    Snapshot {
        schema_version: "v3".to_string(),
        snapshot_id: Uuid::new_v4().to_string(),
        snapshot_time_utc: now_utc,
        observer_time_utc: now_utc,
        symbol: symbol.to_string(),
        ltf: LtfBlock {
            tf: "5m".to_string(),
            timestamp: now_utc,
            price: LtfPrice::default(),
            micro_structure: MicroStructure::default(),
        },
        htf: BTreeMap::new(),
        context: ContextBlock {
            session: Session::from_utc_ts(now_utc),
            exchange: exchange_id.to_string(),
            ..ContextBlock::default()
        },
    }
}

/// Fully-populated synthetic snapshot at `price`, used by demo mode and by
/// the close path when a live rebuild fails mid-exit.
pub fn synthetic_snapshot(symbol: &str, ts: i64, price: f64, atr_pct: f64) -> Snapshot {
    let htf_block = HtfBlock {
        trend: Trend::Up,
        bos: true,
        liquidity_state: None,
        market_regime: MarketRegime::Trend,
        volatility_regime: HtfVolRegime::Normal,
    };
    let mut htf = BTreeMap::new();
    for tf in ["15m", "1h", "4h"] {
        htf.insert(tf.to_string(), htf_block.clone());
    }
    Snapshot {
        schema_version: "v3".to_string(),
        snapshot_id: Uuid::new_v4().to_string(),
        snapshot_time_utc: ts,
        observer_time_utc: ts + 2,
        symbol: symbol.to_string(),
        ltf: LtfBlock {
            tf: "5m".to_string(),
            timestamp: ts,
            price: LtfPrice {
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 0.0,
                range_pct: 0.005,
                atr_pct,
                volatility_regime: VolRegime::Normal,
            },
            micro_structure: MicroStructure {
                hh_ll_state: crate::indicators::structure::HhLlState::Hh,
                bos: true,
                distance_to_structure: 0.1,
            },
        },
        htf,
        context: ContextBlock {
            session: Session::from_utc_ts(ts),
            exchange: "synthetic".to_string(),
            ..ContextBlock::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{BracketIds, MarketConstraints, OrderStatus, Ticker};
    use crate::types::Direction;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    /// Stub venue with a deterministic 5m/15m/1h/4h/1d bar grid anchored at
    /// t0. Closes trend upward so the HTF trend reads "up".
    struct GridExchange {
        t0_ms: i64,
    }

    impl GridExchange {
        fn bars(&self, tf_sec: i64, count: usize) -> Vec<Ohlcv> {
            (0..count)
                .map(|i| {
                    let close = 100.0 + i as f64 * 0.1;
                    Ohlcv {
                        ts_ms: self.t0_ms + i as i64 * tf_sec * 1000,
                        open: close - 0.05,
                        high: close + 0.5,
                        low: close - 0.5,
                        close,
                        volume: 50.0,
                    }
                })
                .collect()
        }
    }

    #[async_trait]
    impl Exchange for GridExchange {
        fn exchange_id(&self) -> &str {
            "binance"
        }

        async fn list_active_usdtm_symbols(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec!["BTCUSDT".into()])
        }

        async fn fetch_tickers(
            &self,
            _symbols: &[String],
        ) -> anyhow::Result<StdHashMap<String, Ticker>> {
            Ok(StdHashMap::new())
        }

        async fn fetch_ticker(&self, _symbol: &str) -> anyhow::Result<Ticker> {
            Ok(Ticker {
                last: Some(121.9),
                bid: Some(121.8),
                ask: Some(122.0),
                quote_volume: Some(1.0e9),
            })
        }

        async fn fetch_ohlcv(
            &self,
            _symbol: &str,
            timeframe: &str,
            limit: u32,
            _since_ms: Option<i64>,
        ) -> anyhow::Result<Vec<Ohlcv>> {
            let tf_sec = tf_to_sec(timeframe);
            let mut bars = self.bars(tf_sec, 220);
            bars.truncate(limit as usize);
            Ok(bars)
        }

        async fn fetch_funding_rate(&self, _symbol: &str) -> f64 {
            0.0002
        }

        async fn fetch_open_interest(&self, _symbol: &str) -> Option<f64> {
            None
        }

        async fn fetch_usdt_balance(&self) -> anyhow::Result<(f64, f64)> {
            Ok((100.0, 100.0))
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

    const T0: i64 = 1_700_000_000_000 - (1_700_000_000_000 % 300_000);

    fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new(
            Arc::new(GridExchange { t0_ms: T0 }),
            SnapshotBuilderConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn config_lock_enforced() {
        let mut cfg = SnapshotBuilderConfig::default();
        cfg.ltf_tf = "1m".into();
        assert!(cfg.validate().is_err());

        let mut cfg = SnapshotBuilderConfig::default();
        cfg.htf_tfs = vec!["15m".into(), "1h".into()];
        assert!(cfg.validate().is_err());

        assert!(SnapshotBuilderConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn open_bar_is_dropped() {
        let b = builder();
        // "now" falls 60s into bar 219 (still open), so bar 218 is the last
        // closed one: close time = t0 + 219 * 300s.
        let now_ms = T0 + 219 * 300_000 + 60_000;
        let snap = b.build_at("BTCUSDT", now_ms).await.unwrap();

        let expected_close_time = (T0 + 219 * 300_000) / 1000;
        assert_eq!(snap.snapshot_time_utc, expected_close_time);
        // Last closed bar index 218 -> close 100 + 218*0.1.
        assert!((snap.ltf.price.close - (100.0 + 21.8)).abs() < 1e-9);
        assert!(snap.snapshot_time_utc <= snap.observer_time_utc);
    }

    #[tokio::test]
    async fn snapshot_id_stable_within_same_bar() {
        let b = builder();
        let now1 = T0 + 219 * 300_000 + 30_000;
        let now2 = T0 + 219 * 300_000 + 200_000;
        let s1 = b.build_at("BTCUSDT", now1).await.unwrap();
        let s2 = b.build_at("BTCUSDT", now2).await.unwrap();
        assert_eq!(s1.snapshot_id, s2.snapshot_id);
        assert_eq!(
            s1.snapshot_id,
            Snapshot::compute_id("binance", "BTCUSDT", "5m", s1.snapshot_time_utc)
        );
    }

    #[tokio::test]
    async fn htf_blocks_present_with_uptrend() {
        let b = builder();
        let now_ms = T0 + 220 * 300_000;
        let snap = b.build_at("BTCUSDT", now_ms).await.unwrap();

        for tf in ["15m", "1h", "4h"] {
            let block = snap.htf.get(tf).expect("required HTF block");
            // Monotonic up-drift: close above the slow MA with fast >= slow.
            assert_eq!(block.trend, Trend::Up, "tf {tf}");
        }
    }

    #[tokio::test]
    async fn spread_and_context_populated() {
        let b = builder();
        let snap = b.build_at("BTCUSDT", T0 + 220 * 300_000).await.unwrap();
        assert_eq!(snap.context.exchange, "binance");
        assert!(snap.context.spread_pct > 0.0);
        assert_eq!(snap.context.funding_rate, 0.0002);
        // Funding z-score needs 20 samples; first build reports 0.
        assert_eq!(snap.context.funding_zscore, 0.0);
        // Daily ATR cache populated from the 1d bars.
        assert!(snap.context.daily_atr_pct > 0.0);
    }

    #[tokio::test]
    async fn funding_zscore_appears_after_min_history() {
        let b = builder();
        // Prime the history below the minimum: z stays 0.
        for _ in 0..(FUNDING_HISTORY_MIN - 1) {
            assert_eq!(b.push_funding("BTCUSDT", 0.0001), 0.0);
        }
        // The 20th sample with a different value yields a real z-score.
        let z = b.push_funding("BTCUSDT", 0.0005);
        assert!(z > 0.0);
    }

    #[test]
    fn funding_history_bounded() {
        let b = builder();
        for i in 0..(FUNDING_HISTORY_CAP + 50) {
            b.push_funding("BTCUSDT", i as f64 * 1e-6);
        }
        assert_eq!(b.funding_hist.lock()["BTCUSDT"].len(), FUNDING_HISTORY_CAP);
    }

    #[test]
    fn vol_regime_thresholds() {
        let t = 0.003;
        assert_eq!(ltf_vol_regime(0.001, t), VolRegime::Dead);
        assert_eq!(ltf_vol_regime(0.003, t), VolRegime::Normal);
        assert_eq!(ltf_vol_regime(0.0046, t), VolRegime::Expansion);
        assert_eq!(ltf_vol_regime(0.5, 0.0), VolRegime::Normal);
    }

    #[test]
    fn synthetic_snapshot_is_schema_valid() {
        let snap = synthetic_snapshot("BTCUSDT", 1_700_000_100, 100.0, 0.002);
        let validated = Snapshot::from_value(snap.to_value()).unwrap();
        assert_eq!(validated.ltf.price.close, 100.0);
        assert_eq!(validated.htf.len(), 3);
    }
}
