// =============================================================================
// DatasetStore — Parquet append via read + vstack + rewrite
// =============================================================================
//
// Rows arrive as JSON objects, go through an in-memory NDJSON reader into a
// DataFrame, and are diagonally concatenated with the existing file (new
// columns are back-filled with nulls). This is deliberately simple: append
// rates are a handful of rows per tick, so rewriting the file is cheap and
// keeps the on-disk dataset a single self-describing Parquet.
// =============================================================================

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use polars::prelude::*;
use tracing::debug;

pub struct DatasetStore {
    out_path: PathBuf,
}

impl DatasetStore {
    pub fn new(out_path: impl Into<PathBuf>) -> Result<Self> {
        let out_path = out_path.into();
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Self { out_path })
    }

    pub fn path(&self) -> &Path {
        &self.out_path
    }

    fn rows_to_frame(rows: &[serde_json::Value]) -> Result<DataFrame> {
        let mut buf = String::new();
        for row in rows {
            buf.push_str(&serde_json::to_string(row).context("failed to serialize dataset row")?);
            buf.push('\n');
        }
        JsonLineReader::new(Cursor::new(buf.into_bytes()))
            .finish()
            .context("failed to build DataFrame from rows")
    }

    fn read_existing(&self) -> Result<Option<DataFrame>> {
        if !self.out_path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(&self.out_path)
            .with_context(|| format!("failed to open {}", self.out_path.display()))?;
        let df = ParquetReader::new(file)
            .finish()
            .with_context(|| format!("failed to read {}", self.out_path.display()))?;
        Ok(Some(df))
    }

    /// Append rows. Returns the number of rows written.
    pub fn append_rows(&self, rows: &[serde_json::Value]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let new = Self::rows_to_frame(rows)?;
        let mut combined = match self.read_existing()? {
            Some(existing) => polars::functions::concat_df_diagonal(&[existing, new.clone()])
                .context("failed to concatenate dataset frames")?,
            None => new,
        };
        let file = std::fs::File::create(&self.out_path)
            .with_context(|| format!("failed to create {}", self.out_path.display()))?;
        ParquetWriter::new(file)
            .finish(&mut combined)
            .with_context(|| format!("failed to write {}", self.out_path.display()))?;
        debug!(
            path = %self.out_path.display(),
            appended = rows.len(),
            total = combined.height(),
            "dataset rows appended"
        );
        Ok(rows.len())
    }

    /// Current row count (0 when the file does not exist).
    pub fn row_count(&self) -> Result<usize> {
        Ok(self.read_existing()?.map(|df| df.height()).unwrap_or(0))
    }
}
