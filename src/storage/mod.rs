// =============================================================================
// Persistence — append-only logs, write-once snapshots, trade ledgers,
// Parquet datasets
// =============================================================================
//
// Single-writer by contract: exactly one engine instance may run against a
// data directory. Every store here is either append-only, write-once per id,
// or latest-wins on rewrite; none is safe under concurrent writers.
// =============================================================================

pub mod dataset;
pub mod jsonl;
pub mod snapshot_store;
pub mod trade_store;
