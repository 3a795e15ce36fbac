// =============================================================================
// Derived datasets — RL transitions, supervised scorer rows, market-each-cycle
// =============================================================================
//
// Three pipelines over the truth sources (trade ledgers, snapshot store,
// decision-cycle log), all reusing the feature mapper:
//
//   RL         closed trades -> (state, action, reward, next_state, done)
//   Scorer     closed trades -> (entry features, label_cls, label_reg)
//   Market     decision-cycle rows joined with snapshots -> one row per
//              cycle with features, decision fields, and gate outcomes.
//              Outcome columns (reward, pnl, mfe/mae, next_state) are never
//              emitted here; this dataset must stay leakage-free.
//
// All three are incremental: exported trade ids (RL, scorer) and decision
// ids (market) are persisted in one JSON state file, so a rebuild without
// new data appends zero rows. The state file is merged on save, never
// clobbered, and its absence simply means "export everything again".
// =============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::features::FeatureMapper;
use crate::storage::dataset::DatasetStore;
use crate::storage::jsonl::JsonlRepo;
use crate::storage::snapshot_store::SnapshotStore;
use crate::storage::trade_store::TradeStore;
use crate::trade::TradeAggregate;

fn iso_utc(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

/// Exported-id bookkeeping, persisted as one JSON object.
#[derive(Debug, Default)]
struct ExportState {
    rl_trade_ids: HashSet<String>,
    scorer_trade_ids: HashSet<String>,
    market_decision_ids: HashSet<String>,
}

impl ExportState {
    fn load(path: &Path) -> Self {
        let mut state = Self::default();
        let Ok(text) = std::fs::read_to_string(path) else {
            return state;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            return state;
        };
        let read_set = |key: &str| -> HashSet<String> {
            value[key]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default()
        };
        state.rl_trade_ids = read_set("rl_exported_trade_ids");
        state.scorer_trade_ids = read_set("scorer_exported_trade_ids");
        state.market_decision_ids = read_set("market_exported_decision_ids");
        state
    }

    /// Merge-preserving save: unknown keys in an existing file survive.
    fn save(&self, path: &Path) {
        let mut payload = std::fs::read_to_string(path)
            .ok()
            .and_then(|t| serde_json::from_str::<serde_json::Value>(&t).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        let sorted = |set: &HashSet<String>| -> Vec<String> {
            let mut v: Vec<String> = set.iter().cloned().collect();
            v.sort();
            v
        };
        payload["rl_exported_trade_ids"] = serde_json::json!(sorted(&self.rl_trade_ids));
        payload["scorer_exported_trade_ids"] = serde_json::json!(sorted(&self.scorer_trade_ids));
        payload["market_exported_decision_ids"] =
            serde_json::json!(sorted(&self.market_decision_ids));

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        // Export state must never crash the runtime.
        if let Err(e) = std::fs::write(path, serde_json::to_string_pretty(&payload).unwrap_or_default())
        {
            warn!(path = %path.display(), error = %e, "failed to save export state");
        }
    }
}

pub struct DatasetBuilder {
    mapper: FeatureMapper,
    rl_store: DatasetStore,
    scorer_store: DatasetStore,
    market_store: DatasetStore,
    state_path: PathBuf,
    state: Mutex<ExportState>,
}

impl DatasetBuilder {
    pub fn new(
        feature_spec_path: &str,
        rl_path: &str,
        scorer_path: &str,
        market_cycle_path: &str,
        export_state_path: &str,
    ) -> Result<Self> {
        let mapper = FeatureMapper::from_path(feature_spec_path)
            .context("dataset builder: feature spec unavailable")?;
        let state_path = PathBuf::from(export_state_path);
        let state = ExportState::load(&state_path);
        Ok(Self {
            mapper,
            rl_store: DatasetStore::new(rl_path)?,
            scorer_store: DatasetStore::new(scorer_path)?,
            market_store: DatasetStore::new(market_cycle_path)?,
            state_path,
            state: Mutex::new(state),
        })
    }

    /// Behavior-policy metadata carried in RL rows, flattened to plain
    /// columns so the Parquet schema stays scalar.
    fn policy_meta(trade: &TradeAggregate, key: &str) -> String {
        trade
            .policy_info
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string()
    }

    /// Closed trades -> single-step RL transitions. Returns rows appended.
    pub fn build_rl(&self, trades: &TradeStore, snapshots: &SnapshotStore) -> Result<usize> {
        let mut state = self.state.lock();
        let mut rows: Vec<serde_json::Value> = Vec::new();
        let mut exported: Vec<String> = Vec::new();

        for t in trades.list_closed() {
            if state.rl_trade_ids.contains(&t.trade_id) {
                continue;
            }
            let Some(reward) = &t.reward_state else { continue };
            let Some(exit_snapshot_id) = &t.exit_snapshot_id else { continue };
            let Ok(Some(entry_snap)) = snapshots.get(&t.entry_snapshot_id) else { continue };
            let Ok(Some(exit_snap)) = snapshots.get(exit_snapshot_id) else { continue };

            let entry_feats = self.mapper.map(&entry_snap.to_value())?;
            let exit_feats = self.mapper.map(&exit_snap.to_value())?;

            rows.push(serde_json::json!({
                "transition_id": Uuid::new_v4().to_string(),
                "episode_id": t.trade_id,
                "symbol": t.symbol,
                "timestamp_entry": iso_utc(t.entry_snapshot_time_utc),
                "timestamp_exit": iso_utc(t.exit_snapshot_time_utc.unwrap_or_default()),
                "state_features": entry_feats.features,
                "state_version": entry_snap.schema_version,
                "feature_version": entry_feats.feature_version,
                "feature_hash": entry_feats.feature_hash,
                "action_type": t.decision.action_type,
                "action_rr": t.decision.rr,
                "action_sl_distance": t.decision.risk_unit,
                "action_confidence": t.decision.confidence.unwrap_or(1.0),
                "action_qty": t.execution_state.qty,
                "action_notional_usdt": t.execution_state.notional,
                "action_leverage": t.execution_state.leverage,
                "reward": reward.pnl_r,
                "pnl_raw": reward.pnl_raw,
                "pnl_usdt": reward.pnl_usdt,
                "risk_usdt": reward.risk_usdt,
                "mfe": reward.mfe,
                "mae": reward.mae,
                "holding_seconds": reward.holding_seconds,
                "next_state_features": exit_feats.features,
                "done": true,
                "policy_name": Self::policy_meta(&t, "policy_name"),
                "policy_version": Self::policy_meta(&t, "policy_version"),
                "policy_type": Self::policy_meta(&t, "policy_type"),
                "exchange": t.execution_state.exchange,
                "entry_snapshot_id": t.entry_snapshot_id,
                "exit_snapshot_id": exit_snapshot_id,
            }));
            exported.push(t.trade_id.clone());
        }

        let n = self.rl_store.append_rows(&rows)?;
        if n > 0 {
            state.rl_trade_ids.extend(exported);
            state.save(&self.state_path);
        }
        debug!(appended = n, "rl dataset build complete");
        Ok(n)
    }

    /// Closed trades -> supervised scorer rows. Returns rows appended.
    pub fn build_scorer(&self, trades: &TradeStore, snapshots: &SnapshotStore) -> Result<usize> {
        let mut state = self.state.lock();
        let mut rows: Vec<serde_json::Value> = Vec::new();
        let mut exported: Vec<String> = Vec::new();

        for t in trades.list_closed() {
            if state.scorer_trade_ids.contains(&t.trade_id) {
                continue;
            }
            let Some(reward) = &t.reward_state else { continue };
            let Ok(Some(entry_snap)) = snapshots.get(&t.entry_snapshot_id) else { continue };

            let feats = self.mapper.map(&entry_snap.to_value())?;
            let pnl_r = reward.pnl_r;

            rows.push(serde_json::json!({
                "sample_id": Uuid::new_v4().to_string(),
                "trade_id": t.trade_id,
                "symbol": t.symbol,
                "timestamp_entry": iso_utc(t.entry_snapshot_time_utc),
                "features": feats.features,
                "feature_version": feats.feature_version,
                "feature_hash": feats.feature_hash,
                "label_cls": if pnl_r > 0.0 { 1 } else { 0 },
                "label_reg": pnl_r,
                "action_type": t.decision.action_type,
                "rr": t.decision.rr,
                "sl_distance": t.decision.risk_unit,
                "exchange": t.execution_state.exchange,
            }));
            exported.push(t.trade_id.clone());
        }

        let n = self.scorer_store.append_rows(&rows)?;
        if n > 0 {
            state.scorer_trade_ids.extend(exported);
            state.save(&self.state_path);
        }
        debug!(appended = n, "scorer dataset build complete");
        Ok(n)
    }

    /// Decision-cycle log joined with snapshots -> one row per cycle,
    /// including skips and blocks. Incremental by `decision_id`.
    ///
    /// Outcome columns are never emitted: this dataset feeds meta-labeling
    /// and must stay blind to the future.
    pub fn build_market_each_cycle(
        &self,
        decision_cycles: &JsonlRepo,
        snapshots: &SnapshotStore,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        let mut rows: Vec<serde_json::Value> = Vec::new();
        let mut exported: Vec<String> = Vec::new();

        for rec in decision_cycles.read_all() {
            let Some(decision_id) = rec["decision_id"].as_str() else { continue };
            if state.market_decision_ids.contains(decision_id) {
                continue;
            }
            let Some(snapshot_id) = rec["snapshot_id"].as_str() else { continue };
            let Ok(Some(snap)) = snapshots.get(snapshot_id) else { continue };

            let feats = self.mapper.map(&snap.to_value())?;

            rows.push(serde_json::json!({
                "decision_id": decision_id,
                "snapshot_id": snap.snapshot_id,
                "symbol": snap.symbol,
                "snapshot_time_utc": snap.snapshot_time_utc,
                "exchange": snap.context.exchange,

                "state_features": feats.features,
                "feature_version": feats.feature_version,
                "feature_hash": feats.feature_hash,

                "ltf_tf": snap.ltf.tf,
                "ltf_close": snap.ltf.price.close,
                "session": snap.context.session.to_string(),
                "funding_rate": snap.context.funding_rate,

                "action_type": rec["action_type"],
                "direction": rec["direction"],
                "entry_price": rec["entry_price"],
                "sl_price": rec["sl_price"],
                "tp_price": rec["tp_price"],
                "rr": rec["rr"],
                "risk_unit": rec["risk_unit"],

                "rule_confidence": rec["rule_confidence"],
                "model_score": rec["model_score"],
                "final_confidence": rec["final_confidence"],
                "risk_blocked": rec["risk_blocked"].as_bool().unwrap_or(false),
                "blocked_reason": rec["blocked_reason"],
                "is_opened": rec["is_opened"].as_bool().unwrap_or(false),
                "trade_id": rec["trade_id"],
                "mode": rec["mode"],
                "cycle_time_utc": rec["cycle_time_utc"],
            }));
            exported.push(decision_id.to_string());
        }

        let n = self.market_store.append_rows(&rows)?;
        if n > 0 {
            state.market_decision_ids.extend(exported);
            state.save(&self.state_path);
        }
        debug!(appended = n, "market-each-cycle dataset build complete");
        Ok(n)
    }
}
