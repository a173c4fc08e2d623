//! Order aggregation for the end-of-day review.
//!
//! Turns a day's completed orders into per item-location stock deductions and
//! per payment-method revenue. Pure: nothing here reads or writes the store,
//! so a staged view can be rebuilt as often as the review screen likes.
//!
//! **Rules:**
//! - Only `completed` orders created on the business day (shop-local
//!   midnight to midnight) count
//! - Orders are processed by `created_at`, then id, so contributing order
//!   lists come out the same whatever order the input arrives in
//! - Malformed orders are reported and skipped, never silently dropped
//! - An id seen on more than one record rejects every record carrying it
//! - An order whose amounts or quantities would overflow is rejected whole
//! - `mixed` payments land in their own bucket

use std::collections::{BTreeMap, HashMap};

use chrono::{FixedOffset, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{
    AggregationIssue, LedgerOrder, Order, OrderLine, PaymentTotals, StagingEntry, StockKey,
};

// ---------------------------------------------------------------------------
// Location resolution
// ---------------------------------------------------------------------------

/// Decides which stock location an order line draws from.
pub trait LocationResolver: Send + Sync {
    fn resolve(&self, order: &Order, line: &OrderLine) -> String;
}

impl<F> LocationResolver for F
where
    F: Fn(&Order, &OrderLine) -> String + Send + Sync,
{
    fn resolve(&self, order: &Order, line: &OrderLine) -> String {
        self(order, line)
    }
}

/// Uses the line's own location when it has one, otherwise a fixed default.
#[derive(Debug, Clone)]
pub struct DefaultLocation(pub String);

impl DefaultLocation {
    pub fn new(location_id: impl Into<String>) -> Self {
        Self(location_id.into())
    }
}

impl LocationResolver for DefaultLocation {
    fn resolve(&self, _order: &Order, line: &OrderLine) -> String {
        match line.location_id.as_deref().map(str::trim) {
            Some(loc) if !loc.is_empty() => loc.to_string(),
            _ => self.0.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Staged day
// ---------------------------------------------------------------------------

/// Uncommitted aggregation of one business day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedDay {
    pub date: NaiveDate,
    /// Sorted by item id, then location id.
    pub entries: Vec<StagingEntry>,
    pub totals: PaymentTotals,
    /// Snapshot of every aggregated order, in processing order.
    pub orders: Vec<LedgerOrder>,
    pub rejected: Vec<AggregationIssue>,
}

impl StagedDay {
    pub fn completed_order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn revenue(&self) -> Decimal {
        self.totals.grand_total()
    }

    pub fn deduction_pairs(&self) -> usize {
        self.entries.len()
    }

    /// No eligible orders at all, valid or not.
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.rejected.is_empty()
    }

    pub fn entry(&self, item_id: &str, location_id: &str) -> Option<&StagingEntry> {
        self.entries
            .iter()
            .find(|e| e.item_id == item_id && e.location_id == location_id)
    }

    /// Total staged quantity of `item_id` across every location.
    pub fn item_total(&self, item_id: &str) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.item_id == item_id)
            .map(|e| e.total_quantity)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Whether `order` was created on `date` in the shop's local calendar.
pub fn is_on_business_day(order: &Order, date: NaiveDate, offset: FixedOffset) -> bool {
    order.created_at.with_timezone(&offset).date_naive() == date
}

/// Check an order's shape. Returns the first problem found.
pub fn check_order(order: &Order) -> Result<(), String> {
    if order.id.trim().is_empty() {
        return Err("order id is empty".into());
    }
    for (idx, line) in order.lines.iter().enumerate() {
        if line.item_id.trim().is_empty() {
            return Err(format!("line {idx} has no item id"));
        }
        if line.quantity <= Decimal::ZERO {
            return Err(format!(
                "line {idx} ({}) has non-positive quantity {}",
                line.item_id, line.quantity
            ));
        }
        if line.unit_price < Decimal::ZERO {
            return Err(format!(
                "line {idx} ({}) has negative unit price {}",
                line.item_id, line.unit_price
            ));
        }
    }
    if order.subtotal().is_none() {
        return Err("line totals overflow".into());
    }
    if order.discount < Decimal::ZERO {
        return Err(format!("negative discount {}", order.discount));
    }
    if let Some(amount) = order.final_amount {
        if amount < Decimal::ZERO {
            return Err(format!("negative final amount {amount}"));
        }
    }
    Ok(())
}

/// Build the staged view of `date` from `orders`.
pub fn build_staging<'a, I>(
    orders: I,
    date: NaiveDate,
    offset: FixedOffset,
    resolver: &dyn LocationResolver,
) -> StagedDay
where
    I: IntoIterator<Item = &'a Order>,
{
    let mut eligible: Vec<&Order> = orders
        .into_iter()
        .filter(|o| o.is_completed() && is_on_business_day(o, date, offset))
        .collect();
    eligible.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut id_counts: HashMap<&str, usize> = HashMap::new();
    for &order in &eligible {
        *id_counts.entry(order.id.as_str()).or_default() += 1;
    }

    let mut rows: BTreeMap<StockKey, StagingEntry> = BTreeMap::new();
    let mut totals = PaymentTotals::default();
    let mut snapshots = Vec::with_capacity(eligible.len());
    let mut rejected = Vec::new();

    for order in eligible {
        let verdict = if id_counts.get(order.id.as_str()).copied().unwrap_or(0) > 1 {
            Err("duplicate order id".to_string())
        } else {
            check_order(order).and_then(|()| contribution(order, resolver, &rows, &totals))
        };
        let (quantities, next_totals, settled) = match verdict {
            Ok(contribution) => contribution,
            Err(reason) => {
                warn!(order_id = %order.id, date = %date, reason = %reason, "Order excluded from staging");
                rejected.push(AggregationIssue {
                    order_id: order.id.clone(),
                    reason,
                });
                continue;
            }
        };

        if let (Some(recorded), Some(derived)) = (order.final_amount, order.derived_final_amount()) {
            if recorded != derived {
                warn!(
                    order_id = %order.id,
                    recorded = %recorded,
                    derived = %derived,
                    "Recorded final amount differs from line totals; keeping recorded amount"
                );
            }
        }

        for (key, total_quantity) in quantities {
            let row = rows.entry(key).or_insert_with_key(|k| StagingEntry {
                item_id: k.item_id.clone(),
                location_id: k.location_id.clone(),
                total_quantity: Decimal::ZERO,
                contributing_order_ids: Vec::new(),
            });
            row.total_quantity = total_quantity;
            row.contributing_order_ids.push(order.id.clone());
        }

        totals = next_totals;
        snapshots.push(LedgerOrder::snapshot(order, settled));
    }

    let staged = StagedDay {
        date,
        entries: rows.into_values().collect(),
        totals,
        orders: snapshots,
        rejected,
    };

    debug!(
        date = %date,
        orders = staged.orders.len(),
        rejected = staged.rejected.len(),
        pairs = staged.entries.len(),
        revenue = %staged.revenue(),
        "Built staging ledger"
    );

    staged
}

/// What `order` would add to the day: new per-key quantity totals, the new
/// payment totals and the settled amount. Nothing is applied, so an overflow
/// anywhere leaves the staged rows untouched.
fn contribution(
    order: &Order,
    resolver: &dyn LocationResolver,
    rows: &BTreeMap<StockKey, StagingEntry>,
    totals: &PaymentTotals,
) -> Result<(BTreeMap<StockKey, Decimal>, PaymentTotals, Decimal), String> {
    let mut quantities: BTreeMap<StockKey, Decimal> = BTreeMap::new();
    for line in &order.lines {
        let key = StockKey::new(&line.item_id, resolver.resolve(order, line));
        let current = match quantities.get(&key) {
            Some(q) => *q,
            None => rows.get(&key).map(|r| r.total_quantity).unwrap_or(Decimal::ZERO),
        };
        let next = current
            .checked_add(line.quantity)
            .ok_or_else(|| format!("quantity of {} overflows the day total", line.item_id))?;
        quantities.insert(key, next);
    }

    let settled = order
        .settled_amount()
        .ok_or_else(|| "final amount overflows".to_string())?;
    let mut next_totals = *totals;
    next_totals
        .try_add(order.payment_method, settled)
        .ok_or_else(|| "payment totals overflow".to_string())?;

    Ok((quantities, next_totals, settled))
}

// ===========================================================================
// Tests
// ===========================================================================
