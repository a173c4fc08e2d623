//! Post-commit corrections.
//!
//! A committed day is never edited in place. Amendments are appended to its
//! correction trail with the value they replace, who made them and why. The
//! frozen totals stay as committed; for monetary fields the difference is
//! handed back so someone can reconcile it deliberately.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Correction, LedgerEntry, LedgerField, PaymentMethod};
use crate::store::LedgerStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionOutcome {
    /// Entry as persisted after the append.
    pub entry: LedgerEntry,
    pub correction: Correction,
    /// `corrected - original` for monetary fields.
    pub delta: Option<Decimal>,
}

fn invalid(msg: impl Into<String>) -> LedgerError {
    LedgerError::InvalidCorrection(msg.into())
}

fn parse_amount(raw: &str) -> LedgerResult<Decimal> {
    Decimal::from_str(raw.trim()).map_err(|_| invalid(format!("not a valid amount: {raw:?}")))
}

/// Canonical form of `raw` for `field`.
fn normalize_value(field: &LedgerField, raw: &str) -> LedgerResult<String> {
    let raw = raw.trim();
    match field {
        f if f.is_monetary() => {
            let amount = parse_amount(raw)?;
            if amount < Decimal::ZERO {
                return Err(invalid(format!("{field} cannot be negative: {amount}")));
            }
            Ok(amount.normalize().to_string())
        }
        LedgerField::OrderPaymentMethod(_) => PaymentMethod::from_str(raw)
            .map(|m| m.as_str().to_string())
            .map_err(invalid),
        _ => Ok(raw.to_string()),
    }
}

/// Build a correction for `entry` without persisting it.
///
/// The original value is the field's current effective value, so a second
/// correction of the same field records the first correction's value.
pub fn draft_correction(
    entry: &LedgerEntry,
    field: LedgerField,
    corrected_value: &str,
    reason: &str,
    actor: &str,
    min_reason_len: usize,
    now: DateTime<Utc>,
) -> LedgerResult<(Correction, Option<Decimal>)> {
    if !entry.is_committed {
        return Err(invalid(format!(
            "ledger for {} is not committed; fix the staged orders instead",
            entry.date
        )));
    }

    let reason = reason.trim();
    if reason.chars().count() < min_reason_len {
        return Err(invalid(format!(
            "reason must be at least {min_reason_len} characters"
        )));
    }
    let actor = actor.trim();
    if actor.is_empty() {
        return Err(invalid("corrected_by is required"));
    }

    let original_value = entry.effective_value(&field).ok_or_else(|| {
        invalid(format!(
            "order {} is not part of the ledger for {}",
            field.order_id().unwrap_or_default(),
            entry.date
        ))
    })?;
    let corrected_value = normalize_value(&field, corrected_value)?;

    let delta = if field.is_monetary() {
        let original = parse_amount(&original_value)?;
        let corrected = parse_amount(&corrected_value)?;
        if original == corrected {
            return Err(invalid(format!("{field} is already {original_value}")));
        }
        Some(corrected - original)
    } else {
        if original_value == corrected_value {
            return Err(invalid(format!("{field} is already {original_value:?}")));
        }
        None
    };

    let correction = Correction {
        id: Uuid::new_v4().to_string(),
        field,
        original_value,
        corrected_value,
        reason: reason.to_string(),
        corrected_by: actor.to_string(),
        corrected_at: now,
    };
    Ok((correction, delta))
}

/// Drafts that lose to a concurrent correction are re-drafted this many
/// times before giving up.
const MAX_DRAFT_ATTEMPTS: usize = 3;

/// Appends corrections through a [`LedgerStore`].
pub struct CorrectionLog<S: LedgerStore> {
    store: Arc<S>,
    min_reason_len: usize,
}

impl<S: LedgerStore> CorrectionLog<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            store,
            min_reason_len: config.min_correction_reason_len,
        }
    }

    /// Append a correction to the committed entry for `entry.date`.
    ///
    /// `field` is a name such as `totalCash` or `orders.ORD-1.finalAmount`.
    /// Values are compared against the persisted entry, not the copy passed
    /// in. The store only appends if the original value is still current;
    /// otherwise the correction is drafted again from the fresh entry.
    pub fn add_correction(
        &self,
        entry: &LedgerEntry,
        field: &str,
        corrected_value: &str,
        reason: &str,
        actor: &str,
    ) -> LedgerResult<CorrectionOutcome> {
        let field = LedgerField::from_str(field).map_err(invalid)?;

        let mut attempt = 1;
        let (updated, correction, delta) = loop {
            let current = self.store.committed_entry(entry.date)?.ok_or_else(|| {
                invalid(format!("no committed ledger entry for {}", entry.date))
            })?;

            let (correction, delta) = match draft_correction(
                &current,
                field.clone(),
                corrected_value,
                reason,
                actor,
                self.min_reason_len,
                Utc::now(),
            ) {
                Ok(draft) => draft,
                Err(e) => {
                    warn!(date = %entry.date, error = %e, "Correction rejected");
                    return Err(e);
                }
            };

            match self.store.append_correction(entry.date, &correction) {
                Ok(updated) => break (updated, correction, delta),
                Err(LedgerError::Consistency(msg)) if attempt < MAX_DRAFT_ATTEMPTS => {
                    warn!(date = %entry.date, attempt, reason = %msg, "Correction raced another; redrafting");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            date = %entry.date,
            field = %correction.field,
            original = %correction.original_value,
            corrected = %correction.corrected_value,
            corrected_by = %correction.corrected_by,
            delta = ?delta,
            "Ledger correction recorded"
        );

        Ok(CorrectionOutcome {
            entry: updated,
            correction,
            delta,
        })
    }

    /// The correction trail for a committed day, oldest first.
    pub fn history(&self, entry: &LedgerEntry) -> LedgerResult<Vec<Correction>> {
        Ok(self
            .store
            .committed_entry(entry.date)?
            .map(|e| e.corrections)
            .unwrap_or_default())
    }
}
