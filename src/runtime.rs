// =============================================================================
// Runtime — the decision-execution loop
// =============================================================================
//
// One tick every cycle_sec:
//   1. refresh the AUTO universe when due (and, in paper mode, keep the
//      max-open-positions bound in sync with the universe size)
//   2. monitor phase: one batch ticker fetch over all open-trade symbols;
//      paper closes synthetically on TP/SL touch, live detects venue-side
//      closure from the position quantity and resolves the exit type from
//      the bracket order statuses
//   3. open phase: per symbol, build a snapshot (placeholder on venue
//      failure), append a market-feature row and exactly one decision-cycle
//      record, run the policy, apply the pre-gates in order, size with the
//      risk engine, then open + place orders (live) or simulate (paper)
//   4. rebuild the derived datasets incrementally
//
// Idempotence: the snapshot id is keyed on the closed bar and the decision
// id on the snapshot, so re-ticking within the same bar neither duplicates
// cycle rows nor re-opens trades. Restart recovery is re-reading the open
// trade ledger.
//
// Paper fills are deliberately optimistic: TP/SL touches are decided from
// the last ticker price, with no intrabar path modeling.
//
// Any per-symbol failure is logged and skipped; the loop never dies.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, PolicyKind, SymbolsSpec};
use crate::datasets::DatasetBuilder;
use crate::decision::TradeDecision;
use crate::events::{EventBus, TOPIC_TRADE_CLOSED, TOPIC_TRADE_OPEN};
use crate::exchange::Exchange;
use crate::features::FeatureMapper;
use crate::policy::{HybridPolicy, PolicyEngine, RulePolicy};
use crate::reward::{calculate_reward, OhlcBar};
use crate::risk_engine::{AccountState, RiskEngine, RiskPlan};
use crate::risk_guard::RiskGuard;
use crate::scorer::Scorer;
use crate::snapshot::Snapshot;
use crate::snapshot_builder::{synthetic_snapshot, SnapshotBuilder};
use crate::storage::dataset::DatasetStore;
use crate::storage::jsonl::JsonlRepo;
use crate::storage::snapshot_store::SnapshotStore;
use crate::storage::trade_store::TradeStore;
use crate::trade::{ExecutionState, PolicyInfo, TradeAggregate, TradeStatus};
use crate::types::{BotMode, Direction, ExitType};
use crate::universe::{history_from_cycle_rows, UniverseSelector};

/// Decision id: first 20 hex chars of
/// `sha1("{exchange}|{symbol}|{snapshot_id}|{snapshot_time}")`.
fn decision_id(exchange: &str, symbol: &str, snapshot_id: &str, snapshot_time_utc: i64) -> String {
    let key = format!("{exchange}|{symbol}|{snapshot_id}|{snapshot_time_utc}");
    hex::encode(Sha1::digest(key.as_bytes()))[..20].to_string()
}

fn now_utc() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct Runtime {
    cfg: Config,
    exchange: Arc<dyn Exchange>,
    builder: SnapshotBuilder,
    policy: PolicyEngine,
    risk_engine: RiskEngine,
    risk_guard: RiskGuard,
    selector: UniverseSelector,

    snapshots: SnapshotStore,
    trades: TradeStore,
    decision_cycles: JsonlRepo,
    orders_log: JsonlRepo,
    executions_log: JsonlRepo,
    universe_selection_log: JsonlRepo,
    universe_cycles_log: JsonlRepo,
    market_features: DatasetStore,
    datasets: DatasetBuilder,
    mapper: FeatureMapper,
    bus: Arc<EventBus>,

    symbols: Vec<String>,
    max_open_positions: u32,
    universe_auto: bool,
    next_universe_refresh: i64,
    seen_decision_ids: HashSet<String>,
}

impl Runtime {
    pub fn new(cfg: Config, exchange: Arc<dyn Exchange>, bus: Arc<EventBus>) -> Result<Self> {
        let builder = SnapshotBuilder::new(exchange.clone(), cfg.snapshot.clone())?;

        let rule = RulePolicy::default();
        let policy = match cfg.policy {
            PolicyKind::Rule => PolicyEngine::Rule(rule),
            PolicyKind::Hybrid => {
                let mapper = FeatureMapper::from_path(&cfg.feature_spec_path)?;
                let scorer = Scorer::from_config(cfg.scorer_model_path.as_deref(), cfg.scorer_model_type);
                PolicyEngine::Hybrid(HybridPolicy::new(rule, mapper, scorer))
            }
        };

        let snapshots = SnapshotStore::new(&cfg.paths.snapshots_dir)?;
        let trades = TradeStore::new(&cfg.paths.trades_open, &cfg.paths.trades_closed)?;
        let decision_cycles = JsonlRepo::new(&cfg.paths.decision_cycles)?;
        let orders_log = JsonlRepo::new(&cfg.paths.orders)?;
        let executions_log = JsonlRepo::new(&cfg.paths.executions)?;
        let universe_selection_log = JsonlRepo::new(&cfg.paths.universe_selection)?;
        let universe_cycles_log = JsonlRepo::new(&cfg.paths.universe_cycles)?;
        let market_features = DatasetStore::new(&cfg.paths.market_features)?;
        let datasets = DatasetBuilder::new(
            &cfg.feature_spec_path,
            &cfg.paths.rl_dataset,
            &cfg.paths.scorer_dataset,
            &cfg.paths.market_cycle_dataset,
            &cfg.paths.export_state,
        )?;
        let mapper = FeatureMapper::from_path(&cfg.feature_spec_path)?;

        // Re-seed the idempotence set from the persisted log so a restart
        // within a bar does not duplicate cycle rows.
        let seen_decision_ids: HashSet<String> = decision_cycles
            .read_all()
            .iter()
            .filter_map(|r| r["decision_id"].as_str().map(String::from))
            .collect();

        let symbols = match &cfg.symbols {
            SymbolsSpec::List(list) => list.clone(),
            SymbolsSpec::Auto => Vec::new(),
        };
        let universe_auto = cfg.symbols == SymbolsSpec::Auto;
        let max_open_positions = cfg.effective_max_open_positions(symbols.len().max(1));

        Ok(Self {
            risk_engine: RiskEngine::new(cfg.risk.clone()),
            risk_guard: RiskGuard::new(cfg.guard.clone()),
            selector: UniverseSelector::new(cfg.universe.clone()),
            builder,
            policy,
            snapshots,
            trades,
            decision_cycles,
            orders_log,
            executions_log,
            universe_selection_log,
            universe_cycles_log,
            market_features,
            datasets,
            mapper,
            bus,
            exchange,
            symbols,
            max_open_positions,
            universe_auto,
            next_universe_refresh: 0,
            seen_decision_ids,
            cfg,
        })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Run forever. Every failure inside a tick is logged and the loop
    /// continues on the next cycle.
    pub async fn run(&mut self) -> Result<()> {
        if self.universe_auto {
            self.refresh_universe().await;
        }
        if self.symbols.is_empty() {
            self.symbols = vec![crate::universe::FALLBACK_SYMBOL.to_string()];
        }
        self.max_open_positions = self.cfg.effective_max_open_positions(self.symbols.len());

        info!(
            mode = %self.cfg.mode,
            exchange = self.exchange.exchange_id(),
            symbols = ?self.symbols,
            cycle_sec = self.cfg.cycle_sec,
            max_open_positions = self.max_open_positions,
            "runtime loop starting"
        );

        let sleep_sec = self.cfg.cycle_sec.max(5);
        loop {
            let result = match self.cfg.mode {
                BotMode::Demo => self.demo_tick().await,
                BotMode::Data => self.data_tick().await,
                BotMode::Paper | BotMode::Live => self.trade_tick().await,
            };
            if let Err(e) = result {
                error!(error = %e, "cycle failed — continuing on next tick");
            }
            tokio::time::sleep(std::time::Duration::from_secs(sleep_sec)).await;
        }
    }

    /// One full paper/live cycle. Public for tests, which drive ticks
    /// directly instead of sleeping.
    pub async fn trade_tick(&mut self) -> Result<()> {
        if self.universe_auto && now_utc() >= self.next_universe_refresh {
            self.refresh_universe().await;
        }
        self.monitor_phase().await;
        self.open_phase().await;
        if let Err(e) = self
            .datasets
            .build_market_each_cycle(&self.decision_cycles, &self.snapshots)
        {
            warn!(error = %e, "market-each-cycle build failed");
        }
        Ok(())
    }

    // =========================================================================
    // Universe refresh
    // =========================================================================

    async fn refresh_universe(&mut self) {
        let prev = self.load_last_universe().unwrap_or_else(|| self.symbols.clone());
        let cycle_rows = self.universe_cycles_log.read_all();
        let (history, prev_metrics) =
            history_from_cycle_rows(&cycle_rows, self.cfg.universe_cycles_history_max_rows);

        let report = self
            .selector
            .select(self.exchange.as_ref(), &prev, &history, &prev_metrics)
            .await;

        // Audit log: the full report, then one row per scored candidate.
        if let Ok(report_value) = serde_json::to_value(&report) {
            if let Err(e) = self.universe_selection_log.append(&report_value) {
                warn!(error = %e, "failed to append universe selection report");
            }
        }
        for row in report.cycle_rows() {
            if let Err(e) = self.universe_cycles_log.append(&row) {
                warn!(error = %e, "failed to append universe cycle row");
                break;
            }
        }

        self.symbols = report.selected_symbols();
        self.save_last_universe();
        self.max_open_positions = self.cfg.effective_max_open_positions(self.symbols.len());
        self.next_universe_refresh =
            now_utc() + (self.cfg.universe.refresh_min.max(1) * 60) as i64;

        info!(symbols = ?self.symbols, "universe refreshed");
    }

    fn load_last_universe(&self) -> Option<Vec<String>> {
        let text = std::fs::read_to_string(&self.cfg.paths.universe_last).ok()?;
        let value: serde_json::Value = serde_json::from_str(&text).ok()?;
        let symbols: Vec<String> = value["symbols"]
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_uppercase().replace('/', "")))
            .collect();
        (!symbols.is_empty()).then_some(symbols)
    }

    fn save_last_universe(&self) {
        let payload = serde_json::json!({
            "timestamp_utc": now_utc(),
            "symbols": self.symbols,
        });
        if let Some(parent) = std::path::Path::new(&self.cfg.paths.universe_last).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(
            &self.cfg.paths.universe_last,
            serde_json::to_string_pretty(&payload).unwrap_or_default(),
        ) {
            warn!(error = %e, "failed to save last universe");
        }
    }

    // =========================================================================
    // Monitor phase
    // =========================================================================

    async fn monitor_phase(&mut self) {
        let open_trades = self.trades.list_open();
        if open_trades.is_empty() {
            return;
        }

        let mut open_symbols: Vec<String> =
            open_trades.iter().map(|t| t.symbol.clone()).collect();
        open_symbols.sort();
        open_symbols.dedup();

        let tickers = match self.exchange.fetch_tickers(&open_symbols).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "monitor ticker fetch failed — retrying next tick");
                return;
            }
        };

        for trade in open_trades {
            let Some(last_price) = tickers.get(&trade.symbol).and_then(|t| t.last_price()) else {
                continue;
            };
            let result = if self.cfg.mode == BotMode::Live {
                self.monitor_live_trade(&trade, last_price).await
            } else {
                self.monitor_paper_trade(&trade, last_price).await
            };
            if let Err(e) = result {
                warn!(trade_id = %trade.trade_id, error = %e, "monitor failed for trade");
            }
        }
    }

    async fn monitor_paper_trade(&mut self, trade: &TradeAggregate, last_price: f64) -> Result<()> {
        let d = &trade.decision;
        let (hit_tp, hit_sl) = match d.direction {
            Direction::Long => (last_price >= d.tp_price, last_price <= d.sl_price),
            Direction::Short => (last_price <= d.tp_price, last_price >= d.sl_price),
        };
        if !hit_tp && !hit_sl {
            return Ok(());
        }

        let exit_type = if hit_tp { ExitType::Tp } else { ExitType::Sl };
        let exit_price = if hit_tp { d.tp_price } else { d.sl_price };
        let exit_ts = now_utc();

        let qty = trade.execution_state.qty.unwrap_or(0.0);
        let notional = trade.execution_state.notional.unwrap_or(0.0);
        let est_fees = if notional != 0.0 {
            notional.abs() * self.cfg.fee_rate * 2.0
        } else {
            0.0
        };

        let mut exec = ExecutionState::open();
        exec.status = TradeStatus::Closed;
        exec.entry_time_utc = trade
            .execution_state
            .entry_time_utc
            .or(Some(trade.entry_snapshot_time_utc));
        exec.entry_fill_price = trade
            .execution_state
            .entry_fill_price
            .or(Some(d.entry_price));
        exec.exit_time_utc = Some(exit_ts);
        exec.exit_fill_price = Some(exit_price);
        exec.exit_type = Some(exit_type);
        exec.fees_total = est_fees;
        exec.funding_paid = 0.0;
        exec.exchange = Some(self.exchange.exchange_id().to_string());
        exec.account_type = Some("USDT-M".into());
        exec.margin_mode = Some("isolated".into());
        exec.position_mode = Some("oneway".into());
        exec.qty = (qty > 0.0).then_some(qty);
        exec.notional = (notional != 0.0).then_some(notional);

        // Optimistic two-bar window spanning entry and exit levels.
        let bars = vec![
            OhlcBar {
                timestamp: trade.entry_snapshot_time_utc,
                open: d.entry_price,
                high: d.entry_price.max(d.tp_price),
                low: d.entry_price.min(d.sl_price),
                close: d.entry_price,
            },
            OhlcBar {
                timestamp: exit_ts,
                open: d.entry_price,
                high: d.entry_price.max(exit_price),
                low: d.entry_price.min(exit_price),
                close: exit_price,
            },
        ];

        self.close_trade(trade, exec, &bars, exit_price, exit_ts, exit_type)
            .await?;
        info!(trade_id = %trade.trade_id, symbol = %trade.symbol, %exit_type, exit_price, "paper trade closed");
        Ok(())
    }

    async fn monitor_live_trade(&mut self, trade: &TradeAggregate, last_price: f64) -> Result<()> {
        let pos_qty = self.exchange.fetch_position_qty(&trade.symbol).await;
        if pos_qty.abs() >= 1e-12 {
            return Ok(());
        }

        // Flat on the venue: determine how it closed (first filled bracket
        // leg wins), then cancel whatever is left.
        let mut exit_type = ExitType::Unknown;
        let mut exit_price = last_price;

        let tp_id = trade.execution_state.tp_order_id.clone();
        let sl_id = trade.execution_state.sl_order_id.clone();

        if let Some(id) = &tp_id {
            if let Some(order) = self.exchange.fetch_order(&trade.symbol, id).await {
                if order.is_filled() {
                    exit_type = ExitType::Tp;
                    exit_price = order.avg_price.unwrap_or(exit_price);
                }
            }
        }
        if exit_type == ExitType::Unknown {
            if let Some(id) = &sl_id {
                if let Some(order) = self.exchange.fetch_order(&trade.symbol, id).await {
                    if order.is_filled() {
                        exit_type = ExitType::Sl;
                        exit_price = order.avg_price.unwrap_or(exit_price);
                    }
                }
            }
        }
        for id in [tp_id, sl_id].into_iter().flatten() {
            self.exchange.cancel_order(&trade.symbol, &id).await;
        }

        let exit_ts = now_utc();
        let mut exec = ExecutionState::open();
        exec.status = TradeStatus::Closed;
        exec.entry_time_utc = trade
            .execution_state
            .entry_time_utc
            .or(Some(trade.entry_snapshot_time_utc));
        exec.entry_fill_price = trade
            .execution_state
            .entry_fill_price
            .or(Some(trade.decision.entry_price));
        exec.exit_time_utc = Some(exit_ts);
        exec.exit_fill_price = Some(exit_price);
        exec.exit_type = Some(exit_type);
        exec.fees_total = trade.execution_state.fees_total;
        exec.funding_paid = trade.execution_state.funding_paid;
        exec.exchange = Some(self.exchange.exchange_id().to_string());
        exec.account_type = Some("USDT-M".into());
        exec.margin_mode = Some("isolated".into());
        exec.position_mode = Some("oneway".into());

        // Holding-window bars for MFE/MAE, from entry to now; synthetic
        // fallback when the venue cannot serve them.
        let since_ms = (trade.entry_snapshot_time_utc - 60) * 1000;
        let bars: Vec<OhlcBar> = match self
            .exchange
            .fetch_ohlcv(&trade.symbol, &self.cfg.snapshot.ltf_tf, 200, Some(since_ms))
            .await
        {
            Ok(ohlcv) if !ohlcv.is_empty() => ohlcv
                .iter()
                .map(|b| OhlcBar {
                    timestamp: b.ts_ms / 1000,
                    open: b.open,
                    high: b.high,
                    low: b.low,
                    close: b.close,
                })
                .collect(),
            _ => {
                let d = &trade.decision;
                vec![
                    OhlcBar {
                        timestamp: trade.entry_snapshot_time_utc,
                        open: d.entry_price,
                        high: d.entry_price.max(d.tp_price),
                        low: d.entry_price.min(d.sl_price),
                        close: d.entry_price,
                    },
                    OhlcBar {
                        timestamp: exit_ts,
                        open: d.entry_price,
                        high: d.entry_price.max(exit_price),
                        low: d.entry_price.min(exit_price),
                        close: exit_price,
                    },
                ]
            }
        };

        self.close_trade(trade, exec, &bars, exit_price, exit_ts, exit_type)
            .await?;
        info!(trade_id = %trade.trade_id, symbol = %trade.symbol, %exit_type, exit_price, "live trade resolved");
        Ok(())
    }

    /// Common close path: exit snapshot, execution + reward attach, ledger
    /// move, close event, dataset rebuild.
    async fn close_trade(
        &mut self,
        trade: &TradeAggregate,
        exec: ExecutionState,
        bars: &[OhlcBar],
        exit_price: f64,
        exit_ts: i64,
        exit_type: ExitType,
    ) -> Result<()> {
        let exit_snap = match self.builder.build(&trade.symbol).await {
            Ok(s) => s,
            Err(_) => synthetic_snapshot(&trade.symbol, exit_ts, exit_price, 0.002),
        };
        let exit_snap = self.snapshots.save(&exit_snap)?;

        let mut t = self
            .trades
            .get_open(&trade.trade_id)
            .context("open trade not found")?;
        t.attach_execution(exec)?;
        t.exit_snapshot_id = Some(exit_snap.snapshot_id.clone());
        t.exit_snapshot_time_utc = Some(exit_snap.snapshot_time_utc);

        let fill_qty = t.execution_state.qty;
        let fee_paid = t.execution_state.fees_total;
        let reward = calculate_reward(&t.decision, &t.execution_state, bars)?;
        t.attach_reward(reward)?;
        self.trades.update_closed(&t)?;

        if let Err(e) = self.executions_log.append(&serde_json::json!({
            "schema_version": "v1",
            "event_time_utc": exit_ts,
            "event_type": "trade.close",
            "trade_id": t.trade_id,
            "symbol": t.symbol,
            "order_id": null,
            "fill_qty": fill_qty,
            "fill_price": exit_price,
            "fee_paid": fee_paid,
            "meta": { "exit_type": exit_type.to_string() },
        })) {
            warn!(error = %e, "failed to append execution event");
        }

        if let Ok(payload) = serde_json::to_value(&t) {
            self.bus.publish(TOPIC_TRADE_CLOSED, &payload);
        }

        let n_rl = self.datasets.build_rl(&self.trades, &self.snapshots).unwrap_or(0);
        let n_scorer = self
            .datasets
            .build_scorer(&self.trades, &self.snapshots)
            .unwrap_or(0);
        debug!(trade_id = %t.trade_id, rl_appended = n_rl, scorer_appended = n_scorer, "datasets rebuilt");
        Ok(())
    }

    // =========================================================================
    // Open phase
    // =========================================================================

    async fn open_phase(&mut self) {
        let open_trades = self.trades.list_open();
        let open_symbols: HashSet<String> =
            open_trades.iter().map(|t| t.symbol.clone()).collect();
        let mut open_count = open_trades.len() as u32;

        let cycle_time_utc = now_utc();
        for symbol in self.symbols.clone() {
            if let Err(e) = self
                .process_symbol(&symbol, &open_symbols, &mut open_count, cycle_time_utc)
                .await
            {
                warn!(symbol, error = %e, "open phase failed for symbol");
            }
        }
    }

    async fn process_symbol(
        &mut self,
        symbol: &str,
        open_symbols: &HashSet<String>,
        open_count: &mut u32,
        cycle_time_utc: i64,
    ) -> Result<()> {
        // Snapshot, with a benign placeholder so the cycle-record invariant
        // holds even when the venue call fails.
        let snap = match self.builder.build(symbol).await {
            Ok(s) => s,
            Err(e) => {
                warn!(symbol, error = %e, "snapshot build failed — placeholder");
                synthetic_snapshot(symbol, now_utc(), 0.0, 0.002)
            }
        };
        let snap = self.snapshots.save(&snap)?;

        let did = decision_id(
            self.exchange.exchange_id(),
            symbol,
            &snap.snapshot_id,
            snap.snapshot_time_utc,
        );
        if self.seen_decision_ids.contains(&did) {
            debug!(symbol, decision_id = %did, "same closed bar — cycle already recorded");
            return Ok(());
        }

        // Market-feature row (best-effort).
        if let Ok(feats) = self.mapper.map(&snap.to_value()) {
            let row = serde_json::json!({
                "snapshot_id": snap.snapshot_id,
                "symbol": snap.symbol,
                "snapshot_time_utc": snap.snapshot_time_utc,
                "exchange": snap.context.exchange,
                "state_features": feats.features,
                "feature_version": feats.feature_version,
                "feature_hash": feats.feature_hash,
                "ltf_close": snap.ltf.price.close,
                "funding_rate": snap.context.funding_rate,
                "session": snap.context.session.to_string(),
            });
            if let Err(e) = self.market_features.append_rows(&[row]) {
                warn!(symbol, error = %e, "market feature row append failed");
            }
        }

        // Policy decision + confidence components. A placeholder snapshot
        // (no usable close) still gets a cycle record, but never a trade.
        let decision = if snap.ltf.price.close > 0.0 {
            match self.policy.decide(&snap) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(symbol, error = %e, "policy decide failed");
                    None
                }
            }
        } else {
            None
        };
        let parts = self.policy.confidence_parts(&snap);
        let decision = match decision {
            Some(d) => match self.policy.apply_conf_mode(d, &parts, self.cfg.conf_mode) {
                Ok(d) => Some(d),
                Err(_) => None,
            },
            None => None,
        };

        let mut rec = self.cycle_record(&did, &snap, symbol, cycle_time_utc, decision.as_ref(), &parts);

        // --- Pre-gates, in order --------------------------------------------
        if *open_count >= self.max_open_positions {
            return self.append_blocked(rec, "max_open_positions");
        }
        if open_symbols.contains(symbol) {
            return self.append_blocked(rec, "already_open_symbol");
        }
        let Some(decision) = decision else {
            return self.append_blocked(rec, "decision_error");
        };

        let account = if self.cfg.mode == BotMode::Live {
            match self.exchange.fetch_usdt_balance().await {
                Ok((equity, free)) => AccountState {
                    equity_usdt: equity,
                    free_usdt: free,
                },
                Err(e) => {
                    warn!(symbol, error = %e, "balance fetch failed");
                    return self.append_blocked(rec, "account_unavailable");
                }
            }
        } else {
            AccountState {
                equity_usdt: self.cfg.paper_equity_usdt,
                free_usdt: self.cfg.paper_free_usdt,
            }
        };

        let use_guard = self.cfg.mode == BotMode::Live || self.cfg.risk_guard_paper;
        if use_guard {
            let closed = self.trades.list_closed();
            let verdict = self.risk_guard.check(&closed, now_utc(), account.equity_usdt);
            if !verdict.ok {
                return self.append_blocked(rec, "risk_guard_block");
            }
        }

        let constraints = match self.exchange.market_constraints(symbol).await {
            Ok(c) => c,
            Err(e) => {
                warn!(symbol, error = %e, "market constraints fetch failed");
                return self.append_blocked(rec, "constraints_unavailable");
            }
        };

        let plan = self.risk_engine.build_plan(&account, &constraints, &decision);
        if !plan.ok {
            let reason = plan.reason.clone();
            return self.append_blocked(rec, &reason);
        }

        // --- Accepted: open the trade ---------------------------------------
        let trade_id = self.open_trade(symbol, &snap, &decision, &plan).await?;
        *open_count += 1;

        rec["is_opened"] = serde_json::json!(true);
        rec["trade_id"] = serde_json::json!(trade_id);
        self.append_cycle_record(rec)?;

        info!(
            trade_id = %trade_id,
            symbol,
            direction = %decision.direction,
            qty = plan.qty.unwrap_or(0.0),
            entry = decision.entry_price,
            tp = decision.tp_price,
            sl = decision.sl_price,
            confidence = decision.confidence.unwrap_or(0.0),
            "trade opened"
        );
        Ok(())
    }

    fn cycle_record(
        &self,
        did: &str,
        snap: &Snapshot,
        symbol: &str,
        cycle_time_utc: i64,
        decision: Option<&TradeDecision>,
        parts: &crate::policy::ConfidenceParts,
    ) -> serde_json::Value {
        let final_confidence = parts
            .final_confidence
            .or_else(|| decision.and_then(|d| d.confidence));
        serde_json::json!({
            "schema_version": "v1",
            "decision_id": did,
            "snapshot_id": snap.snapshot_id,
            "snapshot_time_utc": snap.snapshot_time_utc,
            "symbol": symbol,
            "exchange": self.exchange.exchange_id(),
            "mode": self.cfg.mode.to_string(),
            "cycle_time_utc": cycle_time_utc,

            "action_type": decision.map(|d| d.action_type),
            "direction": decision.map(|d| d.direction.to_string()),
            "entry_price": decision.map(|d| d.entry_price),
            "sl_price": decision.map(|d| d.sl_price),
            "tp_price": decision.map(|d| d.tp_price),
            "rr": decision.map(|d| d.rr),
            "risk_unit": decision.map(|d| d.risk_unit),

            "rule_confidence": parts.rule_confidence,
            "model_score": parts.model_score,
            "final_confidence": final_confidence,

            "risk_blocked": false,
            "blocked_reason": null,
            "is_opened": false,
            "trade_id": null,
        })
    }

    fn append_blocked(&mut self, mut rec: serde_json::Value, reason: &str) -> Result<()> {
        rec["risk_blocked"] = serde_json::json!(true);
        rec["blocked_reason"] = serde_json::json!(reason);
        self.append_cycle_record(rec)
    }

    fn append_cycle_record(&mut self, rec: serde_json::Value) -> Result<()> {
        if let Some(did) = rec["decision_id"].as_str() {
            self.seen_decision_ids.insert(did.to_string());
        }
        self.decision_cycles
            .append(&rec)
            .context("failed to append decision-cycle record")
    }

    async fn open_trade(
        &mut self,
        symbol: &str,
        snap: &Snapshot,
        decision: &TradeDecision,
        plan: &RiskPlan,
    ) -> Result<String> {
        let trade_id = Uuid::new_v4().to_string();

        let mut policy_info = PolicyInfo::new();
        policy_info.insert("policy_name".into(), serde_json::json!(self.policy.name()));
        policy_info.insert("policy_version".into(), serde_json::json!("v1"));
        policy_info.insert(
            "policy_type".into(),
            serde_json::json!(match self.cfg.policy {
                PolicyKind::Rule => "rule",
                PolicyKind::Hybrid => "hybrid",
            }),
        );
        policy_info.insert("exchange".into(), serde_json::json!(self.exchange.exchange_id()));
        if let Ok(plan_value) = serde_json::to_value(plan) {
            policy_info.insert("risk_plan".into(), plan_value);
        }

        let trade = TradeAggregate::create_open(
            &trade_id,
            symbol,
            &snap.snapshot_id,
            snap.snapshot_time_utc,
            decision.clone(),
            policy_info,
        );
        self.trades.save_open(&trade)?;

        if let Ok(payload) = serde_json::to_value(&trade) {
            self.bus.publish(TOPIC_TRADE_OPEN, &payload);
        }

        let side = decision.direction.entry_side();
        if let Err(e) = self.orders_log.append(&serde_json::json!({
            "schema_version": "v1",
            "event_time_utc": now_utc(),
            "event_type": "trade.open.plan",
            "trade_id": trade_id,
            "symbol": symbol,
            "order_id": null,
            "side": side,
            "qty": plan.qty,
            "price": decision.entry_price,
            "meta": {
                "notional": plan.notional_usdt,
                "leverage": plan.leverage,
                "risk_usdt": plan.risk_usdt,
            },
        })) {
            warn!(error = %e, "failed to append trade.open.plan event");
        }

        let qty = plan.qty.unwrap_or(0.0);
        let leverage = plan.leverage.unwrap_or(self.cfg.risk.default_leverage);

        if self.cfg.mode == BotMode::Live {
            self.exchange.set_oneway_mode(symbol).await;
            self.exchange.set_isolated_margin(symbol).await;
            self.exchange.set_leverage(symbol, leverage).await;

            let client_order_id = format!("tw-{}", &trade_id[..8]);
            let ids = self
                .exchange
                .place_entry_and_brackets(
                    symbol,
                    decision.direction,
                    qty,
                    decision.tp_price,
                    decision.sl_price,
                    &client_order_id,
                )
                .await?;

            for (kind, oid) in [
                ("entry_order_id", &ids.entry_order_id),
                ("tp_order_id", &ids.tp_order_id),
                ("sl_order_id", &ids.sl_order_id),
            ] {
                let Some(oid) = oid else { continue };
                if let Err(e) = self.orders_log.append(&serde_json::json!({
                    "schema_version": "v1",
                    "event_time_utc": now_utc(),
                    "event_type": format!("order.place.{kind}"),
                    "trade_id": trade_id,
                    "symbol": symbol,
                    "order_id": oid,
                    "side": side,
                    "qty": plan.qty,
                    "price": if kind == "entry_order_id" { Some(decision.entry_price) } else { None },
                    "meta": null,
                })) {
                    warn!(error = %e, "failed to append order placement event");
                }
            }

            let mut exec = ExecutionState::open();
            exec.entry_time_utc = Some(now_utc());
            exec.entry_fill_price = Some(ids.entry_avg_price.unwrap_or(decision.entry_price));
            exec.exchange = Some(self.exchange.exchange_id().to_string());
            exec.account_type = Some("USDT-M".into());
            exec.margin_mode = Some("isolated".into());
            exec.position_mode = Some("oneway".into());
            exec.leverage = Some(leverage);
            exec.qty = Some(qty);
            exec.notional = plan.notional_usdt;
            exec.entry_order_id = ids.entry_order_id.clone();
            exec.tp_order_id = ids.tp_order_id.clone();
            exec.sl_order_id = ids.sl_order_id.clone();
            exec.client_order_id = Some(client_order_id);
            self.trades.update_execution_state(&trade_id, exec);
        } else {
            // Paper: simulated fill at the decision price, entry-side fee.
            let notional = plan.notional_usdt.unwrap_or(0.0);
            let mut exec = ExecutionState::open();
            exec.entry_time_utc = Some(now_utc());
            exec.entry_fill_price = Some(decision.entry_price);
            exec.fees_total = notional.abs() * self.cfg.fee_rate;
            exec.exchange = Some(self.exchange.exchange_id().to_string());
            exec.account_type = Some("USDT-M".into());
            exec.margin_mode = Some("isolated".into());
            exec.position_mode = Some("oneway".into());
            exec.leverage = Some(leverage);
            exec.qty = Some(qty);
            exec.notional = (notional != 0.0).then_some(notional);
            exec.client_order_id = Some(Uuid::new_v4().to_string());
            self.trades.update_execution_state(&trade_id, exec);
        }

        Ok(trade_id)
    }

    // =========================================================================
    // Demo / data modes (dev only)
    // =========================================================================

    /// End-to-end synthetic pipeline: open at 100, close at TP, rewards and
    /// datasets included. Exercises the whole machine without a venue.
    async fn demo_tick(&mut self) -> Result<()> {
        let symbol = self
            .symbols
            .first()
            .cloned()
            .unwrap_or_else(|| crate::universe::FALLBACK_SYMBOL.to_string());
        let now = now_utc();

        let entry_snap = self.snapshots.save(&synthetic_snapshot(&symbol, now, 100.0, 0.002))?;
        let decision = self.policy.decide(&entry_snap)?;

        let mut policy_info = PolicyInfo::new();
        policy_info.insert("policy_name".into(), serde_json::json!(self.policy.name()));
        policy_info.insert("policy_version".into(), serde_json::json!("v1"));
        policy_info.insert("policy_type".into(), serde_json::json!("rule"));
        let trade_id = Uuid::new_v4().to_string();
        let trade = TradeAggregate::create_open(
            &trade_id,
            &symbol,
            &entry_snap.snapshot_id,
            entry_snap.snapshot_time_utc,
            decision.clone(),
            policy_info,
        );
        self.trades.save_open(&trade)?;

        let exit_ts = now + 60;
        let exit_snap = self
            .snapshots
            .save(&synthetic_snapshot(&symbol, exit_ts, decision.tp_price, 0.002))?;

        let mut exec = ExecutionState::open();
        exec.status = TradeStatus::Closed;
        exec.entry_time_utc = Some(now + 1);
        exec.entry_fill_price = Some(decision.entry_price);
        exec.exit_time_utc = Some(exit_ts + 1);
        exec.exit_fill_price = Some(decision.tp_price);
        exec.exit_type = Some(ExitType::Tp);
        exec.fees_total = 0.0005;

        let mut t = self.trades.get_open(&trade_id).context("demo trade missing")?;
        t.attach_execution(exec)?;
        t.exit_snapshot_id = Some(exit_snap.snapshot_id.clone());
        t.exit_snapshot_time_utc = Some(exit_snap.snapshot_time_utc);
        let bars = vec![
            OhlcBar {
                timestamp: now,
                open: 100.0,
                high: decision.tp_price.max(100.0),
                low: decision.sl_price.min(100.0),
                close: 100.0,
            },
            OhlcBar {
                timestamp: exit_ts,
                open: 100.0,
                high: decision.tp_price.max(100.0),
                low: decision.sl_price.min(100.0),
                close: decision.tp_price,
            },
        ];
        let reward = calculate_reward(&t.decision, &t.execution_state, &bars)?;
        t.attach_reward(reward)?;
        self.trades.update_closed(&t)?;

        let n1 = self.datasets.build_rl(&self.trades, &self.snapshots)?;
        let n2 = self.datasets.build_scorer(&self.trades, &self.snapshots)?;
        info!(rl_appended = n1, scorer_appended = n2, "demo cycle complete");
        Ok(())
    }

    /// Real snapshots, no trading: feature rows only.
    async fn data_tick(&mut self) -> Result<()> {
        for symbol in self.symbols.clone() {
            let snap = match self.builder.build(&symbol).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(symbol, error = %e, "data tick snapshot failed");
                    continue;
                }
            };
            let snap = self.snapshots.save(&snap)?;
            let feats = match self.mapper.map(&snap.to_value()) {
                Ok(f) => f,
                Err(e) => {
                    warn!(symbol, error = %e, "feature mapping failed");
                    continue;
                }
            };
            self.market_features.append_rows(&[serde_json::json!({
                "snapshot_id": snap.snapshot_id,
                "symbol": snap.symbol,
                "snapshot_time_utc": snap.snapshot_time_utc,
                "exchange": snap.context.exchange,
                "state_features": feats.features,
                "feature_version": feats.feature_version,
                "feature_hash": feats.feature_hash,
                "ltf_close": snap.ltf.price.close,
                "funding_rate": snap.context.funding_rate,
                "session": snap.context.session.to_string(),
            })])?;
            info!(symbol, snapshot = %snap.snapshot_id, close = snap.ltf.price.close, "data tick ok");
        }
        Ok(())
    }
}
