//! Repository contracts the engine is built against.
//!
//! Inventory and ledger live behind one trait because a commit must write
//! both as a single unit: the stock decrements and the sealed entry either
//! all land or none do. [`MemoryStore`] keeps everything under one mutex;
//! the SQLite implementation lives in [`crate::db`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    AttemptStatus, CommitAttempt, Correction, InventoryRecord, LedgerEntry, StockKey,
};

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Read access to stock levels.
pub trait Inventory {
    /// `None` when no record exists for the pair.
    fn quantity_on_hand(&self, item_id: &str, location_id: &str) -> LedgerResult<Option<Decimal>>;
}

impl Inventory for HashMap<StockKey, Decimal> {
    fn quantity_on_hand(&self, item_id: &str, location_id: &str) -> LedgerResult<Option<Decimal>> {
        Ok(self.get(&StockKey::new(item_id, location_id)).copied())
    }
}

impl Inventory for BTreeMap<StockKey, Decimal> {
    fn quantity_on_hand(&self, item_id: &str, location_id: &str) -> LedgerResult<Option<Decimal>> {
        Ok(self.get(&StockKey::new(item_id, location_id)).copied())
    }
}

/// Persistent state of the settlement engine.
///
/// Implementations must make [`commit_day`](Self::commit_day) and
/// [`append_correction`](Self::append_correction) atomic.
pub trait LedgerStore: Inventory + Send + Sync {
    fn committed_entry(&self, date: NaiveDate) -> LedgerResult<Option<LedgerEntry>>;

    /// Committed entries with `from <= date <= to`, oldest first.
    fn entries_between(&self, from: NaiveDate, to: NaiveDate) -> LedgerResult<Vec<LedgerEntry>>;

    fn inventory_snapshot(&self) -> LedgerResult<Vec<InventoryRecord>>;

    /// Create or overwrite a stock record (owned by the inventory side).
    fn put_inventory(&self, record: &InventoryRecord) -> LedgerResult<()>;

    /// Seal `entry` and apply its deductions in one unit.
    ///
    /// Fails with `AlreadyCommitted` if an entry exists for the date, and with
    /// `Consistency` if any deduction would drive stock below zero; in both
    /// cases nothing is written. Marks `attempt_id` committed in the same unit.
    fn commit_day(&self, entry: &LedgerEntry, attempt_id: &str) -> LedgerResult<()>;

    /// Append to the correction trail of a committed entry and flag it
    /// corrected. Returns the updated entry.
    ///
    /// Fails with `Consistency`, writing nothing, unless the field's current
    /// effective value still equals `correction.original_value`.
    fn append_correction(&self, date: NaiveDate, correction: &Correction) -> LedgerResult<LedgerEntry>;

    fn begin_commit_attempt(&self, date: NaiveDate) -> LedgerResult<CommitAttempt>;

    fn finish_commit_attempt(&self, attempt_id: &str, status: AttemptStatus) -> LedgerResult<()>;

    /// Attempts still `Started`, oldest first.
    fn open_commit_attempts(&self) -> LedgerResult<Vec<CommitAttempt>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    inventory: BTreeMap<StockKey, Decimal>,
    entries: BTreeMap<NaiveDate, LedgerEntry>,
    /// Only attempts still `Started`; finished ones are dropped.
    attempts: Vec<CommitAttempt>,
}

/// Process-local store. Every operation runs under a single lock, which is
/// the atomicity boundary.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inventory<I>(records: I) -> Self
    where
        I: IntoIterator<Item = InventoryRecord>,
    {
        let store = Self::new();
        {
            let mut state = store.state.lock().unwrap_or_else(|e| e.into_inner());
            for record in records {
                state.inventory.insert(record.key(), record.quantity_on_hand);
            }
        }
        store
    }

    fn lock(&self) -> LedgerResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| LedgerError::Store(format!("memory store poisoned: {e}")))
    }
}

impl Inventory for MemoryStore {
    fn quantity_on_hand(&self, item_id: &str, location_id: &str) -> LedgerResult<Option<Decimal>> {
        let state = self.lock()?;
        Ok(state.inventory.get(&StockKey::new(item_id, location_id)).copied())
    }
}

impl LedgerStore for MemoryStore {
    fn committed_entry(&self, date: NaiveDate) -> LedgerResult<Option<LedgerEntry>> {
        Ok(self.lock()?.entries.get(&date).cloned())
    }

    fn entries_between(&self, from: NaiveDate, to: NaiveDate) -> LedgerResult<Vec<LedgerEntry>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .lock()?
            .entries
            .range(from..=to)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn inventory_snapshot(&self) -> LedgerResult<Vec<InventoryRecord>> {
        Ok(self
            .lock()?
            .inventory
            .iter()
            .map(|(k, q)| InventoryRecord::new(&k.item_id, &k.location_id, *q))
            .collect())
    }

    fn put_inventory(&self, record: &InventoryRecord) -> LedgerResult<()> {
        if record.quantity_on_hand < Decimal::ZERO {
            return Err(LedgerError::Store(format!(
                "negative stock for {}: {}",
                record.key(),
                record.quantity_on_hand
            )));
        }
        self.lock()?
            .inventory
            .insert(record.key(), record.quantity_on_hand);
        Ok(())
    }

    fn commit_day(&self, entry: &LedgerEntry, attempt_id: &str) -> LedgerResult<()> {
        let mut state = self.lock()?;

        if state.entries.contains_key(&entry.date) {
            return Err(LedgerError::AlreadyCommitted { date: entry.date });
        }

        // Stage every new level first; nothing is written until all pass.
        let mut updates = Vec::with_capacity(entry.deductions.len());
        for d in &entry.deductions {
            let key = StockKey::new(&d.item_id, &d.location_id);
            let on_hand = state.inventory.get(&key).copied().unwrap_or(Decimal::ZERO);
            let remaining = on_hand - d.quantity;
            if remaining < Decimal::ZERO {
                error!(date = %entry.date, key = %key, on_hand = %on_hand, required = %d.quantity,
                    "Stock short inside commit; aborting");
                return Err(LedgerError::Consistency(format!(
                    "{key} would go negative during commit (on hand {on_hand}, deducting {})",
                    d.quantity
                )));
            }
            updates.push((key, remaining));
        }

        for (key, remaining) in updates {
            state.inventory.insert(key, remaining);
        }
        state.entries.insert(entry.date, entry.clone());
        state.attempts.retain(|a| a.id != attempt_id);
        Ok(())
    }

    fn append_correction(&self, date: NaiveDate, correction: &Correction) -> LedgerResult<LedgerEntry> {
        let mut state = self.lock()?;
        let entry = state.entries.get_mut(&date).ok_or_else(|| {
            LedgerError::InvalidCorrection(format!("no committed ledger entry for {date}"))
        })?;
        let effective = entry.effective_value(&correction.field);
        if effective.as_deref() != Some(correction.original_value.as_str()) {
            return Err(LedgerError::Consistency(format!(
                "{} changed since the correction was drafted (now {})",
                correction.field,
                effective.unwrap_or_default()
            )));
        }
        entry.corrections.push(correction.clone());
        entry.is_corrected = true;
        Ok(entry.clone())
    }

    fn begin_commit_attempt(&self, date: NaiveDate) -> LedgerResult<CommitAttempt> {
        let attempt = CommitAttempt {
            id: Uuid::new_v4().to_string(),
            date,
            started_at: Utc::now(),
            status: AttemptStatus::Started,
        };
        self.lock()?.attempts.push(attempt.clone());
        Ok(attempt)
    }

    fn finish_commit_attempt(&self, attempt_id: &str, status: AttemptStatus) -> LedgerResult<()> {
        let mut state = self.lock()?;
        let Some(pos) = state.attempts.iter().position(|a| a.id == attempt_id) else {
            return Err(LedgerError::Store(format!(
                "commit attempt not found: {attempt_id}"
            )));
        };
        if status != AttemptStatus::Started {
            state.attempts.remove(pos);
        }
        Ok(())
    }

    fn open_commit_attempts(&self) -> LedgerResult<Vec<CommitAttempt>> {
        let state = self.lock()?;
        let mut open: Vec<CommitAttempt> = state.attempts.clone();
        open.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        debug!(count = open.len(), "Listed open commit attempts");
        Ok(open)
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Store wrapper that lets a test act as a second writer at a chosen point.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    type Hook<S> = Box<dyn FnOnce(&S) + Send>;

    /// Delegates to `inner`; runs a one-shot hook right after the next
    /// `committed_entry` read.
    pub(crate) struct Intercept<S> {
        inner: S,
        hook: Mutex<Option<Hook<S>>>,
    }

    impl<S: LedgerStore> Intercept<S> {
        pub(crate) fn new(inner: S) -> Self {
            Self {
                inner,
                hook: Mutex::new(None),
            }
        }

        pub(crate) fn after_committed_entry(&self, hook: impl FnOnce(&S) + Send + 'static) {
            *self.hook.lock().unwrap() = Some(Box::new(hook));
        }
    }

    impl<S: LedgerStore> Inventory for Intercept<S> {
        fn quantity_on_hand(&self, item_id: &str, location_id: &str) -> LedgerResult<Option<Decimal>> {
            self.inner.quantity_on_hand(item_id, location_id)
        }
    }

    impl<S: LedgerStore> LedgerStore for Intercept<S> {
        fn committed_entry(&self, date: NaiveDate) -> LedgerResult<Option<LedgerEntry>> {
            let found = self.inner.committed_entry(date);
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook(&self.inner);
            }
            found
        }

        fn entries_between(&self, from: NaiveDate, to: NaiveDate) -> LedgerResult<Vec<LedgerEntry>> {
            self.inner.entries_between(from, to)
        }

        fn inventory_snapshot(&self) -> LedgerResult<Vec<InventoryRecord>> {
            self.inner.inventory_snapshot()
        }

        fn put_inventory(&self, record: &InventoryRecord) -> LedgerResult<()> {
            self.inner.put_inventory(record)
        }

        fn commit_day(&self, entry: &LedgerEntry, attempt_id: &str) -> LedgerResult<()> {
            self.inner.commit_day(entry, attempt_id)
        }

        fn append_correction(&self, date: NaiveDate, correction: &Correction) -> LedgerResult<LedgerEntry> {
            self.inner.append_correction(date, correction)
        }

        fn begin_commit_attempt(&self, date: NaiveDate) -> LedgerResult<CommitAttempt> {
            self.inner.begin_commit_attempt(date)
        }

        fn finish_commit_attempt(&self, attempt_id: &str, status: AttemptStatus) -> LedgerResult<()> {
            self.inner.finish_commit_attempt(attempt_id, status)
        }

        fn open_commit_attempts(&self) -> LedgerResult<Vec<CommitAttempt>> {
            self.inner.open_commit_attempts()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
