// =============================================================================
// TradeDecision — directional decision with entry/SL/TP levels
// =============================================================================
//
// Value object produced by the policies. Invariants are enforced at
// construction:
//   - action_type matches direction (0=SHORT, 1=LONG)
//   - risk_unit == |entry - sl| within 1e-9 and strictly positive
//   - confidence, when present, lies in [0, 1]
//   - rr is non-negative
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::types::Direction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub action_type: u8,
    pub direction: Direction,
    pub entry_price: f64,
    pub sl_price: f64,
    pub tp_price: f64,
    pub rr: f64,
    pub risk_unit: f64,
    pub confidence: Option<f64>,
    pub decision_time_utc: i64,
}

impl TradeDecision {
    /// Construct a validated decision.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        entry_price: f64,
        sl_price: f64,
        tp_price: f64,
        rr: f64,
        confidence: Option<f64>,
        decision_time_utc: i64,
    ) -> DomainResult<Self> {
        let risk_unit = (entry_price - sl_price).abs();
        let d = Self {
            action_type: direction.action_type(),
            direction,
            entry_price,
            sl_price,
            tp_price,
            rr,
            risk_unit,
            confidence,
            decision_time_utc,
        };
        d.validate()?;
        Ok(d)
    }

    /// Same decision with a different confidence (used when the hybrid
    /// confidence mode overrides the policy's own value).
    pub fn with_confidence(&self, confidence: f64) -> DomainResult<Self> {
        let mut d = self.clone();
        d.confidence = Some(confidence);
        d.validate()?;
        Ok(d)
    }

    /// Check every invariant; used both on construction and on records
    /// hydrated from disk.
    pub fn validate(&self) -> DomainResult<()> {
        let expected = Direction::from_action_type(self.action_type)
            .ok_or_else(|| DomainError::DecisionInvalid("action_type must be 0 or 1".into()))?;
        if expected != self.direction {
            return Err(DomainError::DecisionInvalid(
                "direction must match action_type".into(),
            ));
        }
        if !(self.risk_unit > 0.0) {
            return Err(DomainError::DecisionInvalid("risk_unit must be > 0".into()));
        }
        let calc = (self.entry_price - self.sl_price).abs();
        if (calc - self.risk_unit).abs() > 1e-9 * self.risk_unit.max(1.0) {
            return Err(DomainError::DecisionInvalid(
                "risk_unit must equal |entry_price - sl_price|".into(),
            ));
        }
        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(DomainError::DecisionInvalid(
                    "confidence must be within [0, 1]".into(),
                ));
            }
        }
        if !(self.rr >= 0.0) {
            return Err(DomainError::DecisionInvalid("rr must be non-negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(entry: f64, sl: f64, tp: f64) -> DomainResult<TradeDecision> {
        TradeDecision::new(Direction::Long, entry, sl, tp, 2.0, Some(0.8), 1_700_000_100)
    }

    #[test]
    fn valid_long_decision() {
        let d = long(100.0, 99.5, 101.0).unwrap();
        assert_eq!(d.action_type, 1);
        assert!((d.risk_unit - 0.5).abs() < 1e-12);
    }

    #[test]
    fn risk_unit_mismatch_rejected() {
        let mut d = long(100.0, 99.5, 101.0).unwrap();
        d.risk_unit = 0.7;
        assert!(d.validate().is_err());
    }

    #[test]
    fn direction_action_type_mismatch_rejected() {
        let mut d = long(100.0, 99.5, 101.0).unwrap();
        d.action_type = 0;
        assert!(d.validate().is_err());
    }

    #[test]
    fn zero_stop_distance_rejected() {
        assert!(long(100.0, 100.0, 101.0).is_err());
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let d = TradeDecision::new(
            Direction::Short,
            100.0,
            100.5,
            99.0,
            2.0,
            Some(1.2),
            1_700_000_100,
        );
        assert!(d.is_err());
    }

    #[test]
    fn null_confidence_allowed() {
        let d = TradeDecision::new(
            Direction::Short,
            100.0,
            100.5,
            99.0,
            2.0,
            None,
            1_700_000_100,
        )
        .unwrap();
        assert_eq!(d.confidence, None);
        assert_eq!(d.direction, Direction::Short);
    }

    #[test]
    fn with_confidence_revalidates() {
        let d = long(100.0, 99.5, 101.0).unwrap();
        let d2 = d.with_confidence(0.3).unwrap();
        assert_eq!(d2.confidence, Some(0.3));
        assert!(d.with_confidence(1.5).is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let d = long(100.0, 99.5, 101.0).unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"LONG\""));
        let d2: TradeDecision = serde_json::from_str(&json).unwrap();
        d2.validate().unwrap();
        assert_eq!(d2.entry_price, 100.0);
    }
}
