// =============================================================================
// SnapshotStore — write-once filesystem store, one JSON file per snapshot id
// =============================================================================
//
// Snapshots are immutable: `save` on an existing id does not rewrite the
// file, it returns the stored snapshot instead. Because ids are a pure
// function of the closed bar, a loop ticking faster than the bar interval
// naturally converges on the already-stored snapshot.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::snapshot::Snapshot;

pub struct SnapshotStore {
    base: PathBuf,
}

impl SnapshotStore {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)
            .with_context(|| format!("failed to create {}", base.display()))?;
        Ok(Self { base })
    }

    fn path_for(&self, snapshot_id: &str) -> PathBuf {
        self.base.join(format!("{snapshot_id}.json"))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Persist a snapshot, idempotently. If the id already exists the stored
    /// copy wins and is returned, so all records referencing the id stay
    /// consistent.
    pub fn save(&self, snapshot: &Snapshot) -> Result<Snapshot> {
        let path = self.path_for(&snapshot.snapshot_id);
        if path.exists() {
            debug!(snapshot_id = %snapshot.snapshot_id, "snapshot exists — returning stored copy");
            return self
                .get(&snapshot.snapshot_id)?
                .context("existing snapshot unreadable");
        }
        let text = serde_json::to_string(&snapshot.to_value())
            .context("failed to serialize snapshot")?;
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(snapshot.clone())
    }

    /// Load a snapshot by id; None when absent.
    pub fn get(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        let path = self.path_for(snapshot_id);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("corrupt snapshot {snapshot_id}"))?;
        let snap = Snapshot::from_value(value)
            .with_context(|| format!("invalid snapshot {snapshot_id}"))?;
        Ok(Some(snap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Snapshot {
        let mut v = serde_json::json!({
            "schema_version": "v3",
            "snapshot_id": id,
            "snapshot_time_utc": 1_700_000_100,
            "observer_time_utc": 1_700_000_102,
            "symbol": "BTCUSDT",
            "ltf": {
                "tf": "5m",
                "timestamp": 1_700_000_100,
                "price": { "close": 100.0, "atr_pct": 0.004 },
                "micro_structure": { "hh_ll_state": "HH", "bos": true }
            },
            "htf": {},
            "context": { "session": "asia", "exchange": "binance" }
        });
        v["snapshot_id"] = serde_json::json!(id);
        Snapshot::from_value(v).unwrap()
    }

    #[test]
    fn save_then_reload_equal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let snap = sample("abc");
        store.save(&snap).unwrap();

        let loaded = store.get("abc").unwrap().unwrap();
        assert_eq!(loaded.snapshot_id, snap.snapshot_id);
        assert_eq!(loaded.to_value(), snap.to_value());
    }

    #[test]
    fn save_is_idempotent_and_first_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let first = sample("dup");
        store.save(&first).unwrap();

        // A second save with the same id but different content must return
        // the stored copy untouched.
        let mut other_value = first.to_value();
        other_value["ltf"]["price"]["close"] = serde_json::json!(999.0);
        let other = Snapshot::from_value(other_value).unwrap();
        let returned = store.save(&other).unwrap();
        assert_eq!(returned.ltf.price.close, 100.0);

        let loaded = store.get("dup").unwrap().unwrap();
        assert_eq!(loaded.ltf.price.close, 100.0);
    }

    #[test]
    fn missing_id_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        assert!(store.get("missing").unwrap().is_none());
    }
}
