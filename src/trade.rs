// =============================================================================
// Trade aggregate — state machine for open / closed trades
// =============================================================================
//
// Life-cycle:
//   CreateOpen -> AttachExecution (OPEN, partial updates) * -> AttachExecution
//   (CLOSED) -> AttachReward
//
// Rules enforced here:
//   - CLOSED is terminal; attaching onto a closed execution is an error
//   - closing requires both entry and exit fill data
//   - a reward can only be attached once the execution is CLOSED
//
// Aggregates are persisted as JSON blobs in the trade ledgers and hydrated
// back through serde; `validate` re-checks the decision invariants on load.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::decision::TradeDecision;
use crate::errors::{DomainError, DomainResult};
use crate::types::ExitType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Execution-side state of a trade: fills, fees, and venue metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: TradeStatus,
    #[serde(default)]
    pub entry_time_utc: Option<i64>,
    #[serde(default)]
    pub entry_fill_price: Option<f64>,
    #[serde(default)]
    pub exit_time_utc: Option<i64>,
    #[serde(default)]
    pub exit_fill_price: Option<f64>,
    #[serde(default)]
    pub exit_type: Option<ExitType>,
    #[serde(default)]
    pub fees_total: f64,
    #[serde(default)]
    pub funding_paid: f64,

    // --- Futures/runtime metadata (optional) ---
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub margin_mode: Option<String>,
    #[serde(default)]
    pub position_mode: Option<String>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub notional: Option<f64>,
    #[serde(default)]
    pub entry_order_id: Option<String>,
    #[serde(default)]
    pub tp_order_id: Option<String>,
    #[serde(default)]
    pub sl_order_id: Option<String>,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

impl ExecutionState {
    pub fn open() -> Self {
        Self {
            status: TradeStatus::Open,
            entry_time_utc: None,
            entry_fill_price: None,
            exit_time_utc: None,
            exit_fill_price: None,
            exit_type: None,
            fees_total: 0.0,
            funding_paid: 0.0,
            exchange: None,
            account_type: None,
            margin_mode: None,
            position_mode: None,
            leverage: None,
            qty: None,
            notional: None,
            entry_order_id: None,
            tp_order_id: None,
            sl_order_id: None,
            client_order_id: None,
        }
    }

    /// A closed execution must carry both entry and exit fill data.
    pub fn validate(&self) -> DomainResult<()> {
        if self.status == TradeStatus::Closed {
            if self.entry_time_utc.is_none() || self.entry_fill_price.is_none() {
                return Err(DomainError::TradeState(
                    "closed execution must have entry fill info".into(),
                ));
            }
            if self.exit_time_utc.is_none() || self.exit_fill_price.is_none() {
                return Err(DomainError::TradeState(
                    "closed execution must have exit fill info".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Realized reward attached after close. `pnl_raw` is per-unit price delta
/// net of per-unit costs; `pnl_r` is the same expressed in risk units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardState {
    pub pnl_raw: f64,
    pub pnl_r: f64,
    pub mfe: f64,
    pub mae: f64,
    pub holding_seconds: i64,
    pub reward_version: String,
    #[serde(default)]
    pub pnl_usdt: Option<f64>,
    #[serde(default)]
    pub risk_usdt: Option<f64>,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub fees_usdt: Option<f64>,
    #[serde(default)]
    pub funding_usdt: Option<f64>,
}

/// Behavior-policy metadata recorded with each trade (name / version / type,
/// plus free-form extras such as the accepted risk plan).
pub type PolicyInfo = BTreeMap<String, serde_json::Value>;

/// Aggregate owning one decision, one execution state, and an optional
/// reward, plus entry/exit snapshot references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAggregate {
    pub schema_version: String,
    pub trade_id: String,
    pub symbol: String,
    pub entry_snapshot_id: String,
    #[serde(default)]
    pub exit_snapshot_id: Option<String>,
    pub entry_snapshot_time_utc: i64,
    #[serde(default)]
    pub exit_snapshot_time_utc: Option<i64>,
    pub decision: TradeDecision,
    pub execution_state: ExecutionState,
    #[serde(default)]
    pub reward_state: Option<RewardState>,
    #[serde(default)]
    pub policy_info: PolicyInfo,
}

impl TradeAggregate {
    /// Open a fresh aggregate: execution OPEN, no reward.
    pub fn create_open(
        trade_id: impl Into<String>,
        symbol: impl Into<String>,
        entry_snapshot_id: impl Into<String>,
        entry_snapshot_time_utc: i64,
        decision: TradeDecision,
        policy_info: PolicyInfo,
    ) -> Self {
        Self {
            schema_version: "v3".to_string(),
            trade_id: trade_id.into(),
            symbol: symbol.into(),
            entry_snapshot_id: entry_snapshot_id.into(),
            exit_snapshot_id: None,
            entry_snapshot_time_utc,
            exit_snapshot_time_utc: None,
            decision,
            execution_state: ExecutionState::open(),
            reward_state: None,
            policy_info,
        }
    }

    /// Merge an execution update into the aggregate.
    ///
    /// Entry fills and venue metadata are merged field-by-field (non-null
    /// wins) so a runtime that only learns fill details at close time still
    /// produces a complete record. An OPEN update refreshes fees/funding and
    /// returns; a CLOSED update sets the exit fields and seals the trade.
    pub fn attach_execution(&mut self, execution: ExecutionState) -> DomainResult<()> {
        if self.execution_state.status == TradeStatus::Closed {
            return Err(DomainError::TradeState("execution already closed".into()));
        }

        if execution.entry_time_utc.is_some() {
            self.execution_state.entry_time_utc = execution.entry_time_utc;
        }
        if execution.entry_fill_price.is_some() {
            self.execution_state.entry_fill_price = execution.entry_fill_price;
        }

        macro_rules! merge_opt {
            ($field:ident) => {
                if execution.$field.is_some() {
                    self.execution_state.$field = execution.$field.clone();
                }
            };
        }
        merge_opt!(exchange);
        merge_opt!(account_type);
        merge_opt!(margin_mode);
        merge_opt!(position_mode);
        merge_opt!(leverage);
        merge_opt!(qty);
        merge_opt!(notional);
        merge_opt!(entry_order_id);
        merge_opt!(tp_order_id);
        merge_opt!(sl_order_id);
        merge_opt!(client_order_id);

        if execution.status == TradeStatus::Open {
            self.execution_state.fees_total = execution.fees_total;
            self.execution_state.funding_paid = execution.funding_paid;
            return Ok(());
        }

        // Closing.
        self.execution_state.exit_time_utc = execution.exit_time_utc;
        self.execution_state.exit_fill_price = execution.exit_fill_price;
        self.execution_state.exit_type = execution.exit_type;
        self.execution_state.fees_total = execution.fees_total;
        self.execution_state.funding_paid = execution.funding_paid;
        self.execution_state.status = TradeStatus::Closed;
        self.execution_state.validate()
    }

    /// Attach the realized reward. Only legal once CLOSED.
    pub fn attach_reward(&mut self, reward: RewardState) -> DomainResult<()> {
        if self.execution_state.status != TradeStatus::Closed {
            return Err(DomainError::TradeState(
                "cannot attach reward unless trade is CLOSED".into(),
            ));
        }
        self.reward_state = Some(reward);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.execution_state.status == TradeStatus::Open
    }
}
