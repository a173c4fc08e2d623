//! Error taxonomy for the settlement engine.
//!
//! Stock shortfalls and rejected corrections are returned as values so the
//! review screen can itemise them. Problems with individual orders during
//! staging are not errors at all: they travel as
//! [`AggregationIssue`](crate::models::AggregationIssue) rows on the staged day.

use chrono::NaiveDate;
use thiserror::Error;

use crate::models::StockViolation;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// One or more item-location pairs lack stock for the staged deduction.
    #[error("Insufficient stock for {} item-location pair(s): {}", .0.len(), describe(.0))]
    InsufficientStock(Vec<StockViolation>),

    /// The day is already sealed; the existing entry is authoritative.
    #[error("Ledger for {date} is already committed")]
    AlreadyCommitted { date: NaiveDate },

    #[error("Invalid correction: {0}")]
    InvalidCorrection(String),

    #[error("Nothing to commit for {date}: no completed orders")]
    NothingToCommit { date: NaiveDate },

    #[error("Staged view is for {staged}, commit requested for {requested}")]
    StagedDateMismatch {
        requested: NaiveDate,
        staged: NaiveDate,
    },

    /// Stock went short between validation and the atomic write. Indicates a
    /// concurrent writer, not bad input.
    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),
}

fn describe(violations: &[StockViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl LedgerError {
    /// Whether the caller can fix inputs and try again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientStock(_)
                | Self::InvalidCorrection(_)
                | Self::NothingToCommit { .. }
                | Self::StagedDateMismatch { .. }
        )
    }

    pub fn violations(&self) -> Option<&[StockViolation]> {
        match self {
            Self::InsufficientStock(v) => Some(v),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Store(format!("snapshot encoding: {err}"))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_insufficient_stock_message_lists_pairs() {
        let err = LedgerError::InsufficientStock(vec![StockViolation {
            item_id: "A".into(),
            location_id: "main".into(),
            available: dec!(2),
            required: dec!(4),
        }]);
        let msg = err.to_string();
        assert!(msg.contains("1 item-location pair"));
        assert!(msg.contains("A@main: available 2, required 4"));
        assert!(err.is_recoverable());
        assert_eq!(err.violations().map(|v| v.len()), Some(1));
    }

    #[test]
    fn test_consistency_is_not_recoverable() {
        let err = LedgerError::Consistency("race".into());
        assert!(!err.is_recoverable());
        assert!(err.violations().is_none());
    }
}
