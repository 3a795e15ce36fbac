// =============================================================================
// Domain error taxonomy
// =============================================================================
//
// These are the structured validation errors raised by the domain layer:
// snapshot validation, decision invariants, trade state machine, feature
// mapping, and reward preconditions. The runtime treats any of them as a
// per-symbol skip with a `blocked_reason`; infrastructure failures use
// `anyhow` instead.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("snapshot invalid: {0}")]
    SnapshotInvalid(String),

    #[error("decision invalid: {0}")]
    DecisionInvalid(String),

    #[error("trade state: {0}")]
    TradeState(String),

    #[error("feature mapping: {0}")]
    FeatureMapping(String),

    #[error("reward precondition: {0}")]
    RewardPrecondition(String),
}

pub type DomainResult<T> = Result<T, DomainError>;
