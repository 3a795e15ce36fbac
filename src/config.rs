// =============================================================================
// Configuration — one env parser, one typed Config
// =============================================================================
//
// Every tunable is read here, once, at startup. The parser takes a lookup
// function so tests can feed it a plain map instead of process env vars.
//
// Fatal at startup (exit code 1):
//   - unknown BOT_MODE
//   - BOT_MODE=live without LIVE_CONFIRM=1
//   - BOT_LTF not "5m", or BOT_HTF_LIST missing any of 15m/1h/4h
//
// demo/data are dev-only: without DEV_ENABLE_DEMO_DATA=1 they fall back to
// paper with a warning instead of failing.
// =============================================================================

use anyhow::{bail, Result};
use tracing::warn;

use crate::exchange::Venue;
use crate::policy::ConfMode;
use crate::risk_engine::{MinNotionalPolicy, RiskConfig};
use crate::risk_guard::RiskGuardConfig;
use crate::scorer::ScorerModelType;
use crate::snapshot_builder::SnapshotBuilderConfig;
use crate::types::BotMode;
use crate::universe::UniverseConfig;

/// Symbol universe source: a fixed list or automatic selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolsSpec {
    Auto,
    List(Vec<String>),
}

/// Which policy drives decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Rule,
    Hybrid,
}

/// All persisted-state locations, overridable individually.
#[derive(Debug, Clone)]
pub struct Paths {
    pub trades_open: String,
    pub trades_closed: String,
    pub snapshots_dir: String,
    pub decision_cycles: String,
    pub orders: String,
    pub executions: String,
    pub universe_selection: String,
    pub universe_cycles: String,
    pub universe_last: String,
    pub rl_dataset: String,
    pub scorer_dataset: String,
    pub market_features: String,
    pub market_cycle_dataset: String,
    pub export_state: String,
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub venue: Venue,
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    pub timeout_ms: u64,
    pub rate_limit: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: BotMode,
    pub symbols: SymbolsSpec,
    pub cycle_sec: u64,
    pub feature_spec_path: String,

    pub snapshot: SnapshotBuilderConfig,
    pub exchange: ExchangeConfig,
    pub risk: RiskConfig,
    pub guard: RiskGuardConfig,
    pub risk_guard_paper: bool,
    pub universe: UniverseConfig,
    pub universe_cycles_history_max_rows: usize,

    pub policy: PolicyKind,
    pub scorer_model_path: Option<String>,
    pub scorer_model_type: ScorerModelType,
    pub conf_mode: ConfMode,

    pub paper_equity_usdt: f64,
    pub paper_free_usdt: f64,
    pub fee_rate: f64,

    pub max_open_positions: Option<u32>,
    pub paper_respect_max_open_positions: bool,

    pub telegram_enabled: bool,
    pub telegram_token: String,
    pub telegram_chat_id: String,

    pub paths: Paths,
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn get_str(env: Lookup, key: &str, default: &str) -> String {
    env(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn get_f64(env: Lookup, key: &str, default: f64) -> f64 {
    env(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn get_u64(env: Lookup, key: &str, default: u64) -> u64 {
    env(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|v| v as u64)
        .unwrap_or(default)
}

fn get_bool(env: Lookup, key: &str, default: bool) -> bool {
    match env(key) {
        Some(v) => matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        None => default,
    }
}

/// Positive-only optional: unset, unparsable, or <= 0 means None.
fn get_opt_f64(env: Lookup, key: &str) -> Option<f64> {
    env(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| *v > 0.0)
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_uppercase().replace('/', ""))
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(env: Lookup) -> Result<Self> {
        // --- Mode -----------------------------------------------------------
        let mode_raw = get_str(env, "BOT_MODE", "paper");
        let Some(mut mode) = BotMode::parse(&mode_raw) else {
            bail!("unknown BOT_MODE={mode_raw} (expected demo|data|paper|live)");
        };
        if mode == BotMode::Live && !get_bool(env, "LIVE_CONFIRM", false) {
            bail!("LIVE_CONFIRM=1 is required to run BOT_MODE=live");
        }
        if matches!(mode, BotMode::Demo | BotMode::Data)
            && !get_bool(env, "DEV_ENABLE_DEMO_DATA", false)
        {
            warn!(
                requested = %mode,
                "BOT_MODE requires DEV_ENABLE_DEMO_DATA=1 — falling back to paper"
            );
            mode = BotMode::Paper;
        }

        // --- Symbols --------------------------------------------------------
        let symbols_raw = get_str(env, "BOT_SYMBOLS", "");
        let symbols = if symbols_raw.eq_ignore_ascii_case("AUTO") {
            SymbolsSpec::Auto
        } else if !symbols_raw.is_empty() {
            SymbolsSpec::List(split_csv(&symbols_raw))
        } else {
            let single = get_str(env, "BOT_SYMBOL", "BTCUSDT");
            SymbolsSpec::List(vec![single.to_uppercase().replace('/', "")])
        };

        // --- Snapshot builder (timeframe lock validated here) ---------------
        let snapshot = SnapshotBuilderConfig {
            ltf_tf: get_str(env, "BOT_LTF", "5m"),
            htf_tfs: split_csv(&get_str(env, "BOT_HTF_LIST", "15m,1h,4h"))
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            atr_period: get_u64(env, "ATR_PERIOD", 14) as usize,
            vol_threshold_atr_pct: get_f64(env, "VOL_THRESHOLD_ATR_PCT", 0.003),
            ms_lookback: get_u64(env, "MS_LOOKBACK", 20) as usize,
            ma_fast: get_u64(env, "MA_FAST", 20) as usize,
            ma_slow: get_u64(env, "MA_SLOW", 50) as usize,
            htf_vol_threshold_atr_pct: get_f64(env, "HTF_VOL_THRESHOLD_ATR_PCT", 0.01),
        };
        snapshot.validate()?;

        // --- Exchange -------------------------------------------------------
        let venue_raw = get_str(env, "EXCHANGE", "binance");
        let Some(venue) = Venue::parse(&venue_raw) else {
            bail!("unsupported EXCHANGE={venue_raw} (expected binance|bybit|mexc)");
        };
        let (key_var, secret_var) = match venue {
            Venue::Binance => ("BINANCE_API_KEY", "BINANCE_API_SECRET"),
            Venue::Bybit => ("BYBIT_API_KEY", "BYBIT_API_SECRET"),
            Venue::Mexc => ("MEXC_API_KEY", "MEXC_API_SECRET"),
        };
        let exchange = ExchangeConfig {
            venue,
            api_key: get_str(env, key_var, ""),
            api_secret: get_str(env, secret_var, ""),
            testnet: get_bool(env, "EXCHANGE_TESTNET", false),
            timeout_ms: get_u64(env, "EXCHANGE_TIMEOUT_MS", 30_000),
            rate_limit: get_bool(env, "EXCHANGE_RATE_LIMIT", true),
        };

        // --- Risk engine ----------------------------------------------------
        let min_notional_raw = get_str(env, "MIN_NOTIONAL_POLICY", "skip");
        let Some(min_notional_policy) = MinNotionalPolicy::parse(&min_notional_raw) else {
            bail!("unknown MIN_NOTIONAL_POLICY={min_notional_raw}");
        };
        let risk = RiskConfig {
            risk_per_trade_pct: get_f64(env, "RISK_PER_TRADE_PCT", 0.25),
            risk_per_trade_usdt: get_opt_f64(env, "RISK_PER_TRADE_USDT"),
            default_leverage: get_u64(env, "LEVERAGE", 3) as u32,
            max_leverage: get_u64(env, "MAX_LEVERAGE", 10) as u32,
            margin_utilization: get_f64(env, "MARGIN_UTILIZATION", 0.30),
            max_notional_usdt: get_opt_f64(env, "MAX_NOTIONAL_USDT"),
            max_exposure_pct_per_symbol: get_opt_f64(env, "MAX_EXPOSURE_PCT_PER_SYMBOL"),
            min_notional_policy,
            max_risk_multiplier_on_override: get_f64(env, "MAX_RISK_MULTIPLIER_ON_OVERRIDE", 2.0),
            max_risk_override_usdt: get_opt_f64(env, "MAX_RISK_OVERRIDE_USDT"),
            min_confidence: get_f64(env, "MIN_CONFIDENCE", 0.55),
        };

        // --- Risk guard -----------------------------------------------------
        let guard = RiskGuardConfig {
            max_daily_loss_usdt: get_opt_f64(env, "MAX_DAILY_LOSS_USDT"),
            max_daily_loss_pct: get_opt_f64(env, "MAX_DAILY_LOSS_PCT"),
            max_consecutive_losses: get_u64(env, "MAX_CONSECUTIVE_LOSSES", 3) as u32,
            cooldown_sec: get_u64(env, "COOLDOWN_SEC", 0) as i64,
            max_trades_per_day: get_opt_f64(env, "MAX_TRADES_PER_DAY").map(|v| v as u32),
        };

        // --- Universe -------------------------------------------------------
        let defaults = UniverseConfig::default();
        let selector_version = get_str(env, "UNIVERSE_SELECTOR_VERSION", "3");
        if !matches!(selector_version.as_str(), "3" | "v3") {
            warn!(
                requested = %selector_version,
                "only universe selector v3 is supported — using v3"
            );
        }
        let exclude_bases = {
            let raw = get_str(env, "UNIVERSE_EXCLUDE_BASES", "");
            if raw.is_empty() {
                defaults.exclude_bases.clone()
            } else {
                raw.split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
        };
        let universe = UniverseConfig {
            target_symbols: get_u64(env, "UNIVERSE_TARGET_SYMBOLS", 8) as usize,
            refresh_min: get_u64(env, "UNIVERSE_REFRESH_MIN", 180),
            min_quote_vol_usdt: get_f64(env, "UNIVERSE_MIN_QUOTE_VOL_USDT", 20_000_000.0),
            max_candidates_by_liquidity: get_u64(env, "UNIVERSE_MAX_CANDIDATES_BY_LIQ", 160)
                as usize,
            max_spread_pct: get_f64(env, "UNIVERSE_MAX_SPREAD_PCT", 0.0030),
            max_abs_funding: get_f64(env, "UNIVERSE_MAX_ABS_FUNDING", 0.0030),
            min_last_price: get_f64(env, "UNIVERSE_MIN_LAST_PRICE", 0.0),
            atr_tf: get_str(env, "UNIVERSE_ATR_TF", "1h"),
            atr_period: get_u64(env, "UNIVERSE_ATR_PERIOD", 14) as usize,
            atr_limit: get_u64(env, "UNIVERSE_ATR_LIMIT", 200) as u32,
            min_atr_pct: get_f64(env, "UNIVERSE_MIN_ATR_PCT", 0.004),
            max_corr: get_f64(env, "UNIVERSE_MAX_CORR", 0.85),
            corr_tf: get_str(env, "UNIVERSE_CORR_TF", "1h"),
            corr_limit: get_u64(env, "UNIVERSE_CORR_LIMIT", 250) as u32,
            sticky_enabled: get_bool(env, "UNIVERSE_STICKY_ENABLED", true),
            sticky_keep: get_u64(env, "UNIVERSE_STICKY_KEEP", 2) as usize,
            history_points: get_u64(env, "UNIVERSE_HISTORY_POINTS", 64) as usize,
            w_liq: get_f64(env, "UNIVERSE_W_LIQ", 1.0),
            w_atr: get_f64(env, "UNIVERSE_W_ATR", 2.0),
            w_vol_burst: get_f64(env, "UNIVERSE_W_VOL_BURST", 0.7),
            w_vol_accel: get_f64(env, "UNIVERSE_W_VOL_ACCEL", 0.8),
            w_oi: get_f64(env, "UNIVERSE_W_OI", 0.7),
            w_oi_accel: get_f64(env, "UNIVERSE_W_OI_ACCEL", 0.6),
            w_fund_abs_pen: get_f64(env, "UNIVERSE_W_FUND_ABS_PEN", 1.2),
            w_fund_z_pen: get_f64(env, "UNIVERSE_W_FUND_Z_PEN", 0.7),
            w_spread_pen: get_f64(env, "UNIVERSE_W_SPREAD_PEN", 1.0),
            exclude_bases,
            include_symbols: split_csv(&get_str(env, "UNIVERSE_INCLUDE_SYMBOLS", "")),
            exclude_symbols: split_csv(&get_str(env, "UNIVERSE_EXCLUDE_SYMBOLS", "")),
        };

        // --- Policy / scorer ------------------------------------------------
        let policy = match get_str(env, "BOT_POLICY", "hybrid").to_lowercase().as_str() {
            "rule" => PolicyKind::Rule,
            _ => PolicyKind::Hybrid,
        };
        let scorer_model_path = env("SCORER_MODEL_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let scorer_model_type = ScorerModelType::parse(&get_str(env, "SCORER_MODEL_TYPE", "auto"));
        let conf_mode = ConfMode::parse(&get_str(env, "HYBRID_CONF_MODE", "mul"));

        // --- Paper account --------------------------------------------------
        let paper_equity_usdt = get_f64(env, "PAPER_EQUITY_USDT", 100.0);
        let paper_free_usdt = get_f64(env, "PAPER_FREE_USDT", paper_equity_usdt);

        // --- Paths ----------------------------------------------------------
        let paths = Paths {
            trades_open: get_str(env, "BOT_TRADES_OPEN", "data/runtime/trades_open.csv"),
            trades_closed: get_str(env, "BOT_TRADES_CLOSED", "data/runtime/trades_closed.csv"),
            snapshots_dir: get_str(env, "BOT_SNAPSHOT_DIR", "data/runtime/snapshots"),
            decision_cycles: get_str(
                env,
                "BOT_DECISION_CYCLES_PATH",
                "data/runtime/decision_cycles.jsonl",
            ),
            orders: get_str(env, "BOT_ORDERS_LOG_PATH", "data/runtime/orders.jsonl"),
            executions: get_str(
                env,
                "BOT_EXECUTIONS_LOG_PATH",
                "data/runtime/executions.jsonl",
            ),
            universe_selection: get_str(
                env,
                "BOT_UNIVERSE_LOG_PATH",
                "data/runtime/universe_selection.jsonl",
            ),
            universe_cycles: get_str(
                env,
                "BOT_UNIVERSE_CYCLES_PATH",
                "data/runtime/universe_cycles.jsonl",
            ),
            universe_last: get_str(
                env,
                "BOT_UNIVERSE_LAST_PATH",
                "data/runtime/universe_last.json",
            ),
            rl_dataset: get_str(
                env,
                "BOT_RL_DATASET_PATH",
                "data/datasets/rl/rl_dataset_v2.parquet",
            ),
            scorer_dataset: get_str(
                env,
                "BOT_SCORER_DATASET_PATH",
                "data/datasets/supervised/scorer_dataset_v1.parquet",
            ),
            market_features: get_str(
                env,
                "BOT_MARKET_DATASET_PATH",
                "data/datasets/market/market_features_v1.parquet",
            ),
            market_cycle_dataset: get_str(
                env,
                "BOT_MARKET_CYCLE_DATASET_PATH",
                "data/datasets/market/market_each_cycle_v1.parquet",
            ),
            export_state: get_str(
                env,
                "BOT_DATASET_EXPORT_STATE_PATH",
                "data/runtime/dataset_export_state.json",
            ),
        };

        Ok(Self {
            mode,
            symbols,
            cycle_sec: get_u64(env, "BOT_CYCLE_SEC", 60),
            feature_spec_path: get_str(env, "BOT_FEATURE_SPEC", "config/feature_spec_v1.yaml"),
            snapshot,
            exchange,
            risk,
            guard,
            risk_guard_paper: get_bool(env, "RISK_GUARD_PAPER", false),
            universe,
            universe_cycles_history_max_rows: get_u64(env, "UNIVERSE_CYCLES_HISTORY_MAX_ROWS", 5000)
                as usize,
            policy,
            scorer_model_path,
            scorer_model_type,
            conf_mode,
            paper_equity_usdt,
            paper_free_usdt,
            fee_rate: get_f64(env, "FEE_RATE", 0.0006),
            max_open_positions: env("MAX_OPEN_POSITIONS")
                .and_then(|v| v.trim().parse::<u32>().ok()),
            paper_respect_max_open_positions: get_bool(
                env,
                "PAPER_RESPECT_MAX_OPEN_POSITIONS",
                false,
            ),
            telegram_enabled: get_bool(env, "TELEGRAM_ENABLED", false),
            telegram_token: get_str(env, "TELEGRAM_BOT_TOKEN", ""),
            telegram_chat_id: get_str(env, "TELEGRAM_CHAT_ID", ""),
            paths,
        })
    }

    /// The effective max-open-positions bound. Live defaults to a single
    /// position; paper auto-tracks the universe size unless pinned.
    pub fn effective_max_open_positions(&self, symbol_count: usize) -> u32 {
        match self.mode {
            BotMode::Live => self.max_open_positions.unwrap_or(1).max(1),
            _ => {
                if self.paper_respect_max_open_positions {
                    if let Some(v) = self.max_open_positions {
                        return v.max(1);
                    }
                }
                let configured = self.max_open_positions.unwrap_or(0);
                if configured <= 1 && symbol_count > 1 {
                    symbol_count as u32
                } else if configured > 0 {
                    configured
                } else {
                    symbol_count.max(1) as u32
                }
            }
        }
    }
}
