// =============================================================================
// TradeStore — append-only CSV ledgers for open and closed trades
// =============================================================================
//
// Two files, each a two-column CSV (`trade_id,json`) where the JSON blob is
// the full trade aggregate:
//   - trades_open.csv    append-only; a trade id may appear many times as
//                        its execution state evolves, and the LATEST line
//                        wins (an in-memory index is rebuilt on every read)
//   - trades_closed.csv  append-only, one line per closed trade
//
// Closing a trade performs exactly one append to the closed ledger and one
// rewrite of the open ledger filtering out the closed id. Restart recovery
// is just re-reading the open ledger.
// =============================================================================

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::trade::{ExecutionState, TradeAggregate};

const HEADER: [&str; 2] = ["trade_id", "json"];

pub struct TradeStore {
    open_path: PathBuf,
    closed_path: PathBuf,
}

impl TradeStore {
    pub fn new(open_path: impl Into<PathBuf>, closed_path: impl Into<PathBuf>) -> Result<Self> {
        let open_path = open_path.into();
        let closed_path = closed_path.into();
        for p in [&open_path, &closed_path] {
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            if !p.exists() {
                let mut w = csv::Writer::from_path(p)
                    .with_context(|| format!("failed to create {}", p.display()))?;
                w.write_record(HEADER)?;
                w.flush()?;
            }
        }
        Ok(Self {
            open_path,
            closed_path,
        })
    }

    fn append_row(path: &Path, trade: &TradeAggregate) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        let blob = serde_json::to_string(trade).context("failed to serialize trade")?;
        w.write_record([trade.trade_id.as_str(), blob.as_str()])?;
        w.flush()?;
        Ok(())
    }

    /// All rows of a ledger as (trade_id, aggregate), file order, malformed
    /// rows skipped.
    fn read_rows(path: &Path) -> Vec<(String, TradeAggregate)> {
        let Ok(mut reader) = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
        else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for record in reader.records().map_while(Result::ok) {
            let (Some(tid), Some(blob)) = (record.get(0), record.get(1)) else {
                continue;
            };
            match serde_json::from_str::<TradeAggregate>(blob) {
                Ok(trade) => out.push((tid.to_string(), trade)),
                Err(e) => {
                    warn!(trade_id = tid, error = %e, "skipping malformed trade row");
                }
            }
        }
        out
    }

    /// Persist an open trade's current state (append-only).
    pub fn save_open(&self, trade: &TradeAggregate) -> Result<()> {
        Self::append_row(&self.open_path, trade)
    }

    /// Latest state per trade id from the open ledger.
    pub fn list_open(&self) -> Vec<TradeAggregate> {
        let mut latest: HashMap<String, TradeAggregate> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (tid, trade) in Self::read_rows(&self.open_path) {
            if !latest.contains_key(&tid) {
                order.push(tid.clone());
            }
            latest.insert(tid, trade);
        }
        order.into_iter().filter_map(|tid| latest.remove(&tid)).collect()
    }

    /// Latest state of one open trade.
    pub fn get_open(&self, trade_id: &str) -> Option<TradeAggregate> {
        Self::read_rows(&self.open_path)
            .into_iter()
            .filter(|(tid, _)| tid == trade_id)
            .map(|(_, t)| t)
            .next_back()
    }

    pub fn list_closed(&self) -> Vec<TradeAggregate> {
        Self::read_rows(&self.closed_path)
            .into_iter()
            .map(|(_, t)| t)
            .collect()
    }

    /// Move a closed trade to the closed ledger: one append there, one
    /// rewrite of the open ledger without the closed id.
    pub fn update_closed(&self, trade: &TradeAggregate) -> Result<()> {
        Self::append_row(&self.closed_path, trade)?;

        let remaining: Vec<(String, TradeAggregate)> = Self::read_rows(&self.open_path)
            .into_iter()
            .filter(|(tid, _)| tid != &trade.trade_id)
            .collect();

        let mut w = csv::Writer::from_path(&self.open_path)
            .with_context(|| format!("failed to rewrite {}", self.open_path.display()))?;
        w.write_record(HEADER)?;
        for (tid, t) in &remaining {
            let blob = serde_json::to_string(t).context("failed to serialize trade")?;
            w.write_record([tid.as_str(), blob.as_str()])?;
        }
        w.flush()?;
        debug!(trade_id = %trade.trade_id, "trade moved to closed ledger");
        Ok(())
    }

    /// Merge an execution update into an open trade and persist it.
    /// Returns false when the trade is unknown or the merge is illegal.
    pub fn update_execution_state(&self, trade_id: &str, execution: ExecutionState) -> bool {
        let Some(mut trade) = self.get_open(trade_id) else {
            return false;
        };
        if trade.attach_execution(execution).is_err() {
            return false;
        }
        self.save_open(&trade).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::TradeDecision;
    use crate::trade::{PolicyInfo, TradeStatus};
    use crate::types::{Direction, ExitType};

    fn store() -> (tempfile::TempDir, TradeStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = TradeStore::new(
            dir.path().join("trades_open.csv"),
            dir.path().join("trades_closed.csv"),
        )
        .unwrap();
        (dir, s)
    }

    fn trade(id: &str) -> TradeAggregate {
        let decision = TradeDecision::new(
            Direction::Long,
            100.0,
            99.8,
            100.4,
            2.0,
            Some(0.9),
            1_700_000_100,
        )
        .unwrap();
        TradeAggregate::create_open(id, "BTCUSDT", "snap-1", 1_700_000_100, decision, PolicyInfo::new())
    }

    fn close(trade: &mut TradeAggregate) {
        let mut e = ExecutionState::open();
        e.status = TradeStatus::Closed;
        e.entry_time_utc = Some(1_700_000_101);
        e.entry_fill_price = Some(100.0);
        e.exit_time_utc = Some(1_700_000_400);
        e.exit_fill_price = Some(100.4);
        e.exit_type = Some(ExitType::Tp);
        trade.attach_execution(e).unwrap();
    }

    #[test]
    fn save_and_list_open() {
        let (_d, s) = store();
        s.save_open(&trade("a")).unwrap();
        s.save_open(&trade("b")).unwrap();
        let open = s.list_open();
        assert_eq!(open.len(), 2);
    }

    #[test]
    fn latest_line_wins_per_trade_id() {
        let (_d, s) = store();
        let t = trade("a");
        s.save_open(&t).unwrap();

        // Update execution metadata and persist again (append-only).
        let mut e = ExecutionState::open();
        e.leverage = Some(7);
        e.qty = Some(0.25);
        assert!(s.update_execution_state("a", e));

        let open = s.list_open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].execution_state.leverage, Some(7));
        assert_eq!(s.get_open("a").unwrap().execution_state.qty, Some(0.25));
    }

    #[test]
    fn closing_moves_between_ledgers() {
        let (_d, s) = store();
        s.save_open(&trade("a")).unwrap();
        s.save_open(&trade("b")).unwrap();

        let mut a = s.get_open("a").unwrap();
        close(&mut a);
        s.update_closed(&a).unwrap();

        let open = s.list_open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, "b");

        let closed = s.list_closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].trade_id, "a");
        assert_eq!(closed[0].execution_state.status, TradeStatus::Closed);
    }

    #[test]
    fn restart_recovers_open_trades() {
        let dir = tempfile::tempdir().unwrap();
        let open_p = dir.path().join("trades_open.csv");
        let closed_p = dir.path().join("trades_closed.csv");
        {
            let s = TradeStore::new(&open_p, &closed_p).unwrap();
            s.save_open(&trade("persisted")).unwrap();
        }
        // A fresh store over the same files sees the open trade.
        let s2 = TradeStore::new(&open_p, &closed_p).unwrap();
        let open = s2.list_open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, "persisted");
    }

    #[test]
    fn unknown_trade_update_returns_false() {
        let (_d, s) = store();
        assert!(!s.update_execution_state("ghost", ExecutionState::open()));
    }

    #[test]
    fn json_blob_with_commas_survives_csv() {
        let (_d, s) = store();
        let mut t = trade("quoted");
        t.policy_info.insert(
            "note".into(),
            serde_json::json!("has, commas, and \"quotes\""),
        );
        s.save_open(&t).unwrap();
        let loaded = s.get_open("quoted").unwrap();
        assert_eq!(
            loaded.policy_info["note"],
            serde_json::json!("has, commas, and \"quotes\"")
        );
    }
}
