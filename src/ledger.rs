//! End-of-day ledger engine.
//!
//! Each business day moves `NoData` -> `Staged` -> `Committed`. Staging is
//! pure and can be recomputed any number of times; committing seals the day
//! and decrements stock in one unit, at most once per date.
//!
//! **Rules:**
//! - A committed entry is authoritative; staging a committed day returns it
//!   unchanged
//! - Validation reports every shortfall, not only the first
//! - Commits for the same date are serialized in-process by a per-date lock;
//!   the store's uniqueness check covers other processes
//! - A journal row is written before the atomic commit so a crash mid-commit
//!   shows up as `Interrupted` on restart

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::aggregator::{build_staging, DefaultLocation, LocationResolver, StagedDay};
use crate::config::EngineConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    AttemptStatus, LedgerEntry, Order, PaymentTotals, StockDeduction, StockViolation,
};
use crate::stock_health::{self, OutlookRules, StockOutlook};
use crate::store::{Inventory, LedgerStore};

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// What the review screen shows for a day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "view", rename_all = "snake_case")]
pub enum DayView {
    /// Sealed; read-only.
    Committed(LedgerEntry),
    Staged(StagedDay),
}

impl DayView {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    pub fn staged(&self) -> Option<&StagedDay> {
        match self {
            Self::Staged(day) => Some(day),
            Self::Committed(_) => None,
        }
    }

    pub fn committed(&self) -> Option<&LedgerEntry> {
        match self {
            Self::Committed(entry) => Some(entry),
            Self::Staged(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayState {
    NoData,
    Staged,
    Committed,
    /// A commit was started and never finished.
    Interrupted,
}

/// Totals over a range of committed days.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub days: usize,
    pub corrected_days: usize,
    pub totals: PaymentTotals,
}

impl LedgerSummary {
    pub fn revenue(&self) -> Decimal {
        self.totals.grand_total()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check every staged deduction against `inventory`.
///
/// Entries are visited in staged order (item, then location). A pair with no
/// inventory record has nothing available.
pub fn validate_commit(staged: &StagedDay, inventory: &dyn Inventory) -> LedgerResult<()> {
    let mut violations = Vec::new();

    for entry in &staged.entries {
        let available = inventory
            .quantity_on_hand(&entry.item_id, &entry.location_id)?
            .unwrap_or(Decimal::ZERO);
        if available < entry.total_quantity {
            violations.push(StockViolation {
                item_id: entry.item_id.clone(),
                location_id: entry.location_id.clone(),
                available,
                required: entry.total_quantity,
            });
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(LedgerError::InsufficientStock(violations))
    }
}

fn seal(staged: &StagedDay, committed_by: Option<&str>) -> LedgerEntry {
    LedgerEntry {
        date: staged.date,
        grand_total: staged.totals.grand_total(),
        total_cash: staged.totals.cash,
        total_upi: staged.totals.upi,
        total_credit: staged.totals.credit,
        total_mixed: staged.totals.mixed,
        orders: staged.orders.clone(),
        deductions: staged.entries.iter().map(StockDeduction::from).collect(),
        excluded_orders: staged.rejected.clone(),
        is_committed: true,
        is_corrected: false,
        corrections: Vec::new(),
        committed_at: Some(Utc::now()),
        committed_by: committed_by.map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct LedgerEngine<S: LedgerStore> {
    store: Arc<S>,
    config: EngineConfig,
    resolver: Box<dyn LocationResolver>,
    day_locks: Mutex<HashMap<NaiveDate, Arc<Mutex<()>>>>,
}

impl<S: LedgerStore> LedgerEngine<S> {
    /// Engine that resolves unlabelled lines to the configured default location.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let resolver = DefaultLocation::new(config.default_location_id.clone());
        Self::with_resolver(store, config, resolver)
    }

    pub fn with_resolver(
        store: Arc<S>,
        config: EngineConfig,
        resolver: impl LocationResolver + 'static,
    ) -> Self {
        Self {
            store,
            config,
            resolver: Box::new(resolver),
            day_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn day_lock(&self, date: NaiveDate) -> Arc<Mutex<()>> {
        let mut locks = self.day_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(date).or_default().clone()
    }

    /// Aggregate `orders` for `date` without looking at the store.
    pub fn stage<'a, I>(&self, date: NaiveDate, orders: I) -> LedgerResult<StagedDay>
    where
        I: IntoIterator<Item = &'a Order>,
    {
        let offset = self.config.utc_offset()?;
        Ok(build_staging(orders, date, offset, self.resolver.as_ref()))
    }

    /// The committed entry for `date` if there is one, else a fresh staged view.
    pub fn get_or_create_staged<'a, I>(&self, date: NaiveDate, orders: I) -> LedgerResult<DayView>
    where
        I: IntoIterator<Item = &'a Order>,
    {
        if let Some(entry) = self.store.committed_entry(date)? {
            return Ok(DayView::Committed(entry));
        }
        Ok(DayView::Staged(self.stage(date, orders)?))
    }

    /// [`validate_commit`] against the engine's store.
    pub fn validate(&self, staged: &StagedDay) -> LedgerResult<()> {
        validate_commit(staged, self.store.as_ref())
    }

    /// Seal `staged` as the ledger for `date` and apply its stock deductions.
    ///
    /// Fails without touching inventory when the day is already committed,
    /// when validation finds any shortfall, or when the staged view is empty
    /// or for a different date.
    pub fn commit(
        &self,
        date: NaiveDate,
        staged: &StagedDay,
        committed_by: Option<&str>,
    ) -> LedgerResult<LedgerEntry> {
        if staged.date != date {
            return Err(LedgerError::StagedDateMismatch {
                requested: date,
                staged: staged.date,
            });
        }
        if staged.orders.is_empty() {
            return Err(LedgerError::NothingToCommit { date });
        }

        let lock = self.day_lock(date);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.store.committed_entry(date)?.is_some() {
            warn!(date = %date, "Commit rejected: day already committed");
            return Err(LedgerError::AlreadyCommitted { date });
        }

        if let Err(e) = self.validate(staged) {
            // Another process may have sealed the day and drawn the stock down
            // since the check above.
            if self.store.committed_entry(date)?.is_some() {
                warn!(date = %date, "Commit rejected: day committed by another writer");
                return Err(LedgerError::AlreadyCommitted { date });
            }
            if let Some(violations) = e.violations() {
                for v in violations {
                    warn!(
                        date = %date,
                        item_id = %v.item_id,
                        location_id = %v.location_id,
                        available = %v.available,
                        required = %v.required,
                        "Insufficient stock"
                    );
                }
            }
            return Err(e);
        }

        let attempt = self.store.begin_commit_attempt(date)?;
        let entry = seal(staged, committed_by);

        if let Err(e) = self.store.commit_day(&entry, &attempt.id) {
            if let Err(journal_err) = self
                .store
                .finish_commit_attempt(&attempt.id, AttemptStatus::Failed)
            {
                error!(attempt_id = %attempt.id, error = %journal_err, "Failed to close commit attempt");
            }
            match &e {
                LedgerError::AlreadyCommitted { .. } => {
                    warn!(date = %date, "Commit lost to another writer")
                }
                _ => error!(date = %date, error = %e, "Ledger commit failed"),
            }
            return Err(e);
        }

        info!(
            date = %date,
            orders = entry.orders.len(),
            pairs = entry.deductions.len(),
            excluded = entry.excluded_orders.len(),
            grand_total = %entry.grand_total,
            cash = %entry.total_cash,
            upi = %entry.total_upi,
            credit = %entry.total_credit,
            mixed = %entry.total_mixed,
            "Ledger committed"
        );
        if !entry.total_mixed.is_zero() {
            warn!(date = %date, mixed = %entry.total_mixed, "Mixed payments need manual reconciliation");
        }

        Ok(entry)
    }

    pub fn day_state<'a, I>(&self, date: NaiveDate, orders: I) -> LedgerResult<DayState>
    where
        I: IntoIterator<Item = &'a Order>,
    {
        if self.store.committed_entry(date)?.is_some() {
            return Ok(DayState::Committed);
        }
        if self
            .store
            .open_commit_attempts()?
            .iter()
            .any(|a| a.date == date)
        {
            return Ok(DayState::Interrupted);
        }
        if self.stage(date, orders)?.is_empty() {
            Ok(DayState::NoData)
        } else {
            Ok(DayState::Staged)
        }
    }

    /// Close out commit attempts left open by a crash.
    ///
    /// Returns the affected days, oldest first. Those days can be restaged and
    /// committed again from the same orders.
    pub fn recover_interrupted(&self) -> LedgerResult<Vec<NaiveDate>> {
        let mut dates: Vec<NaiveDate> = self
            .store
            .open_commit_attempts()?
            .iter()
            .map(|a| a.date)
            .collect();
        dates.sort();
        dates.dedup();

        let mut recovered = Vec::new();
        for date in dates {
            let lock = self.day_lock(date);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

            // Re-read under the lock: an in-process commit may have finished.
            let committed = self.store.committed_entry(date)?.is_some();
            let open: Vec<_> = self
                .store
                .open_commit_attempts()?
                .into_iter()
                .filter(|a| a.date == date)
                .collect();
            if open.is_empty() {
                continue;
            }

            let status = if committed {
                AttemptStatus::Committed
            } else {
                AttemptStatus::Abandoned
            };
            for attempt in &open {
                self.store.finish_commit_attempt(&attempt.id, status)?;
            }
            if !committed {
                warn!(date = %date, attempts = open.len(), "Interrupted commit abandoned; day must be restaged");
                recovered.push(date);
            }
        }

        if !recovered.is_empty() {
            info!(days = recovered.len(), "Recovered interrupted commits");
        }
        Ok(recovered)
    }

    pub fn committed_entry(&self, date: NaiveDate) -> LedgerResult<Option<LedgerEntry>> {
        self.store.committed_entry(date)
    }

    pub fn entries_between(&self, from: NaiveDate, to: NaiveDate) -> LedgerResult<Vec<LedgerEntry>> {
        self.store.entries_between(from, to)
    }

    /// Frozen totals over committed days in `from..=to`. Corrections are
    /// counted but never folded into the totals.
    pub fn summary(&self, from: NaiveDate, to: NaiveDate) -> LedgerResult<LedgerSummary> {
        let entries = self.store.entries_between(from, to)?;
        let mut summary = LedgerSummary::default();
        for entry in &entries {
            summary.days += 1;
            if entry.is_corrected {
                summary.corrected_days += 1;
            }
            summary.totals.try_merge(&entry.totals()).ok_or_else(|| {
                LedgerError::Consistency(format!("revenue totals overflow at {}", entry.date))
            })?;
        }
        Ok(summary)
    }

    /// Days of cover per item from the velocity window ending at `as_of`.
    pub fn stock_outlook(&self, as_of: NaiveDate) -> LedgerResult<Vec<StockOutlook>> {
        let window = self.config.velocity_window_days.max(1);
        let from = as_of - Duration::days(i64::from(window) - 1);
        let entries = self.store.entries_between(from, as_of)?;
        let inventory = self.store.inventory_snapshot()?;
        let rules = OutlookRules {
            window_days: window,
            critical_days: self.config.critical_days_of_cover,
            low_days: self.config.low_days_of_cover,
        };
        Ok(stock_health::assess(&inventory, &entries, &rules))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
