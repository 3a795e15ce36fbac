// =============================================================================
// JsonlRepo — append-only JSONL log
// =============================================================================
//
// One JSON object per line, UTF-8. Every appended object gains a
// `_write_time_utc` stamp unless the caller already set one. Reads are
// tolerant: blank or malformed lines are skipped, never fatal.
// =============================================================================

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct JsonlRepo {
    path: PathBuf,
}

impl JsonlRepo {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one object, stamping `_write_time_utc` when absent.
    pub fn append(&self, obj: &serde_json::Value) -> Result<()> {
        let mut obj = obj.clone();
        let map = obj
            .as_object_mut()
            .context("JsonlRepo::append expects a JSON object")?;
        map.entry("_write_time_utc")
            .or_insert_with(|| serde_json::json!(chrono::Utc::now().timestamp()));

        let line = serde_json::to_string(&obj).context("failed to serialize JSONL row")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        // Flush is best-effort; a crash may lose the tail but never corrupts
        // previous lines.
        let _ = file.flush();
        Ok(())
    }

    /// Read every well-formed object in file order.
    pub fn read_all(&self) -> Vec<serde_json::Value> {
        let Ok(file) = std::fs::File::open(&self.path) else {
            return Vec::new();
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(&l).ok())
            .filter(|v| v.is_object())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonlRepo::new(dir.path().join("log.jsonl")).unwrap();

        repo.append(&serde_json::json!({"a": 1})).unwrap();
        repo.append(&serde_json::json!({"a": 2, "_write_time_utc": 42})).unwrap();

        let rows = repo.read_all();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["a"], 1);
        // Stamp added automatically.
        assert!(rows[0]["_write_time_utc"].as_i64().unwrap() > 0);
        // Caller-provided stamp preserved.
        assert_eq!(rows[1]["_write_time_utc"], 42);
    }

    #[test]
    fn malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"ok\": true}\nnot json\n\n[1,2,3]\n{\"ok\": false}\n").unwrap();
        let repo = JsonlRepo::new(&path).unwrap();
        let rows = repo.read_all();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonlRepo::new(dir.path().join("nope.jsonl")).unwrap();
        assert!(repo.read_all().is_empty());
    }

    #[test]
    fn non_object_append_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonlRepo::new(dir.path().join("log.jsonl")).unwrap();
        assert!(repo.append(&serde_json::json!([1, 2])).is_err());
    }
}
