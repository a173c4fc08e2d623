//! Domain records for end-of-day settlement.
//!
//! Orders come from the order-taking side of the shop and are read-only here.
//! Staging rows and payment totals are recomputed on every review. A
//! `LedgerEntry` is the sealed record of one business day; once committed its
//! totals, order snapshot and stock deductions never change, and the only
//! thing that may grow is its correction trail.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Orders (input)
// ---------------------------------------------------------------------------

/// Order workflow status. Only `Completed` orders are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Fulfilling,
    Completed,
    Partial,
    Delayed,
    ChangesMade,
}

/// How the customer paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Upi,
    Credit,
    /// Split across methods; never allocated automatically.
    Mixed,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Upi => "upi",
            Self::Credit => "credit",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(Self::Cash),
            "upi" => Ok(Self::Upi),
            "credit" => Ok(Self::Credit),
            "mixed" => Ok(Self::Mixed),
            other => Err(format!("Unknown payment method: {other}")),
        }
    }
}

/// A single line on an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub item_id: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Packing checklist flag.
    #[serde(default)]
    pub checked: bool,
    /// Stock location the line was fulfilled from, when the order side knows it.
    #[serde(default)]
    pub location_id: Option<String>,
}

impl OrderLine {
    /// `None` if the product does not fit in a `Decimal`.
    pub fn line_total(&self) -> Option<Decimal> {
        self.quantity.checked_mul(self.unit_price)
    }
}

/// A customer transaction as recorded by the order subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub lines: Vec<OrderLine>,
    #[serde(default)]
    pub discount: Decimal,
    /// Amount the order subsystem booked, if it recorded one.
    #[serde(default)]
    pub final_amount: Option<Decimal>,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Staff member who verified and completed the order.
    #[serde(default)]
    pub completed_by: Option<String>,
    #[serde(default)]
    pub is_delivery_order: bool,
}

impl Order {
    /// Sum of line totals; `None` on overflow.
    pub fn subtotal(&self) -> Option<Decimal> {
        self.lines
            .iter()
            .try_fold(Decimal::ZERO, |acc, line| acc.checked_add(line.line_total()?))
    }

    /// `max(0, subtotal - discount)`.
    pub fn derived_final_amount(&self) -> Option<Decimal> {
        let net = self.subtotal()?.checked_sub(self.discount)?;
        Some(net.max(Decimal::ZERO))
    }

    /// Amount booked into the ledger for this order.
    ///
    /// Prefers the recorded `final_amount` (floored at zero) and falls back to
    /// the derived amount.
    pub fn settled_amount(&self) -> Option<Decimal> {
        match self.final_amount {
            Some(amount) => Some(amount.max(Decimal::ZERO)),
            None => self.derived_final_amount(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == OrderStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Staging (ephemeral)
// ---------------------------------------------------------------------------

/// Inventory key: one item at one stock location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub item_id: String,
    pub location_id: String,
}

impl StockKey {
    pub fn new(item_id: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            location_id: location_id.into(),
        }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.item_id, self.location_id)
    }
}

/// Aggregated stock deduction for one item-location pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingEntry {
    pub item_id: String,
    pub location_id: String,
    pub total_quantity: Decimal,
    /// First-seen order, no duplicates.
    pub contributing_order_ids: Vec<String>,
}

impl StagingEntry {
    pub fn key(&self) -> StockKey {
        StockKey::new(&self.item_id, &self.location_id)
    }
}

/// Revenue per payment bucket.
///
/// Totals grown only through [`try_add`](Self::try_add) and
/// [`try_merge`](Self::try_merge) always have a representable grand total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTotals {
    pub cash: Decimal,
    pub upi: Decimal,
    pub credit: Decimal,
    /// Mixed-payment revenue awaiting manual reconciliation.
    pub mixed: Decimal,
}

impl PaymentTotals {
    /// Add `amount` to the bucket for `method`. On overflow returns `None`
    /// and leaves `self` unchanged.
    pub fn try_add(&mut self, method: PaymentMethod, amount: Decimal) -> Option<()> {
        let mut next = *self;
        let bucket = match method {
            PaymentMethod::Cash => &mut next.cash,
            PaymentMethod::Upi => &mut next.upi,
            PaymentMethod::Credit => &mut next.credit,
            PaymentMethod::Mixed => &mut next.mixed,
        };
        *bucket = bucket.checked_add(amount)?;
        next.checked_grand_total()?;
        *self = next;
        Some(())
    }

    pub fn checked_grand_total(&self) -> Option<Decimal> {
        self.cash
            .checked_add(self.upi)?
            .checked_add(self.credit)?
            .checked_add(self.mixed)
    }

    pub fn grand_total(&self) -> Decimal {
        self.cash + self.upi + self.credit + self.mixed
    }

    pub fn has_unreconciled_mixed(&self) -> bool {
        !self.mixed.is_zero()
    }

    /// Fold `other` in. On overflow returns `None` and leaves `self` unchanged.
    pub fn try_merge(&mut self, other: &PaymentTotals) -> Option<()> {
        let next = PaymentTotals {
            cash: self.cash.checked_add(other.cash)?,
            upi: self.upi.checked_add(other.upi)?,
            credit: self.credit.checked_add(other.credit)?,
            mixed: self.mixed.checked_add(other.mixed)?,
        };
        next.checked_grand_total()?;
        *self = next;
        Some(())
    }
}

/// An order that could not be aggregated, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationIssue {
    pub order_id: String,
    pub reason: String,
}

/// Shortfall found while validating a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockViolation {
    pub item_id: String,
    pub location_id: String,
    pub available: Decimal,
    pub required: Decimal,
}

impl fmt::Display for StockViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}: available {}, required {}",
            self.item_id, self.location_id, self.available, self.required
        )
    }
}

// ---------------------------------------------------------------------------
// Ledger (persisted)
// ---------------------------------------------------------------------------

/// Frozen snapshot of an order inside a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOrder {
    pub order_id: String,
    pub customer_name: Option<String>,
    pub final_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub verified_by: Option<String>,
}

impl LedgerOrder {
    /// Freeze `order` with the amount it was settled at.
    pub fn snapshot(order: &Order, final_amount: Decimal) -> Self {
        Self {
            order_id: order.id.clone(),
            customer_name: order.customer_name.clone(),
            final_amount,
            payment_method: order.payment_method,
            verified_by: order.completed_by.clone(),
        }
    }
}

/// Stock movement applied by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDeduction {
    pub item_id: String,
    pub location_id: String,
    pub quantity: Decimal,
}

impl From<&StagingEntry> for StockDeduction {
    fn from(entry: &StagingEntry) -> Self {
        Self {
            item_id: entry.item_id.clone(),
            location_id: entry.location_id.clone(),
            quantity: entry.total_quantity,
        }
    }
}

/// One sealed business day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub date: NaiveDate,
    pub grand_total: Decimal,
    pub total_cash: Decimal,
    pub total_upi: Decimal,
    pub total_credit: Decimal,
    pub total_mixed: Decimal,
    pub orders: Vec<LedgerOrder>,
    pub deductions: Vec<StockDeduction>,
    #[serde(default)]
    pub excluded_orders: Vec<AggregationIssue>,
    pub is_committed: bool,
    pub is_corrected: bool,
    #[serde(default)]
    pub corrections: Vec<Correction>,
    pub committed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub committed_by: Option<String>,
}

impl LedgerEntry {
    pub fn totals(&self) -> PaymentTotals {
        PaymentTotals {
            cash: self.total_cash,
            upi: self.total_upi,
            credit: self.total_credit,
            mixed: self.total_mixed,
        }
    }

    pub fn order(&self, order_id: &str) -> Option<&LedgerOrder> {
        self.orders.iter().find(|o| o.order_id == order_id)
    }

    /// Value of `field` as frozen at commit time, ignoring corrections.
    ///
    /// Returns `None` when the field names an order not in this entry.
    pub fn frozen_value(&self, field: &LedgerField) -> Option<String> {
        let value = match field {
            LedgerField::GrandTotal => self.grand_total.normalize().to_string(),
            LedgerField::TotalCash => self.total_cash.normalize().to_string(),
            LedgerField::TotalUpi => self.total_upi.normalize().to_string(),
            LedgerField::TotalCredit => self.total_credit.normalize().to_string(),
            LedgerField::TotalMixed => self.total_mixed.normalize().to_string(),
            LedgerField::OrderFinalAmount(id) => {
                self.order(id)?.final_amount.normalize().to_string()
            }
            LedgerField::OrderPaymentMethod(id) => self.order(id)?.payment_method.to_string(),
            LedgerField::OrderCustomerName(id) => {
                self.order(id)?.customer_name.clone().unwrap_or_default()
            }
            LedgerField::OrderVerifiedBy(id) => {
                self.order(id)?.verified_by.clone().unwrap_or_default()
            }
        };
        Some(value)
    }

    /// Latest corrected value for `field`, or the frozen value if it was never
    /// corrected.
    pub fn effective_value(&self, field: &LedgerField) -> Option<String> {
        self.corrections
            .iter()
            .rev()
            .find(|c| &c.field == field)
            .map(|c| c.corrected_value.clone())
            .or_else(|| self.frozen_value(field))
    }
}

/// Field of a ledger entry that a correction can target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LedgerField {
    GrandTotal,
    TotalCash,
    TotalUpi,
    TotalCredit,
    TotalMixed,
    OrderFinalAmount(String),
    OrderPaymentMethod(String),
    OrderCustomerName(String),
    OrderVerifiedBy(String),
}

impl LedgerField {
    pub fn is_monetary(&self) -> bool {
        matches!(
            self,
            Self::GrandTotal
                | Self::TotalCash
                | Self::TotalUpi
                | Self::TotalCredit
                | Self::TotalMixed
                | Self::OrderFinalAmount(_)
        )
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            Self::OrderFinalAmount(id)
            | Self::OrderPaymentMethod(id)
            | Self::OrderCustomerName(id)
            | Self::OrderVerifiedBy(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GrandTotal => f.write_str("grandTotal"),
            Self::TotalCash => f.write_str("totalCash"),
            Self::TotalUpi => f.write_str("totalUpi"),
            Self::TotalCredit => f.write_str("totalCredit"),
            Self::TotalMixed => f.write_str("totalMixed"),
            Self::OrderFinalAmount(id) => write!(f, "orders.{id}.finalAmount"),
            Self::OrderPaymentMethod(id) => write!(f, "orders.{id}.paymentMethod"),
            Self::OrderCustomerName(id) => write!(f, "orders.{id}.customerName"),
            Self::OrderVerifiedBy(id) => write!(f, "orders.{id}.verifiedBy"),
        }
    }
}

impl FromStr for LedgerField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "grandTotal" | "grand_total" => return Ok(Self::GrandTotal),
            "totalCash" | "total_cash" => return Ok(Self::TotalCash),
            "totalUpi" | "total_upi" => return Ok(Self::TotalUpi),
            "totalCredit" | "total_credit" => return Ok(Self::TotalCredit),
            "totalMixed" | "total_mixed" => return Ok(Self::TotalMixed),
            _ => {}
        }

        // orders.<id>.<attribute>; ids may themselves contain dots
        let rest = s
            .strip_prefix("orders.")
            .ok_or_else(|| format!("Unknown ledger field: {s}"))?;
        let (order_id, attribute) = rest
            .rsplit_once('.')
            .ok_or_else(|| format!("Unknown ledger field: {s}"))?;
        if order_id.is_empty() {
            return Err(format!("Missing order id in ledger field: {s}"));
        }
        let order_id = order_id.to_string();
        match attribute {
            "finalAmount" | "final_amount" => Ok(Self::OrderFinalAmount(order_id)),
            "paymentMethod" | "payment_method" => Ok(Self::OrderPaymentMethod(order_id)),
            "customerName" | "customer_name" => Ok(Self::OrderCustomerName(order_id)),
            "verifiedBy" | "verified_by" => Ok(Self::OrderVerifiedBy(order_id)),
            _ => Err(format!("Unknown ledger field: {s}")),
        }
    }
}

impl TryFrom<String> for LedgerField {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LedgerField> for String {
    fn from(field: LedgerField) -> Self {
        field.to_string()
    }
}

/// Post-commit amendment. Never edited or removed once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub id: String,
    pub field: LedgerField,
    pub original_value: String,
    pub corrected_value: String,
    pub reason: String,
    pub corrected_by: String,
    pub corrected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub item_id: String,
    pub location_id: String,
    pub quantity_on_hand: Decimal,
}

impl InventoryRecord {
    pub fn new(
        item_id: impl Into<String>,
        location_id: impl Into<String>,
        quantity_on_hand: Decimal,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            location_id: location_id.into(),
            quantity_on_hand,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(&self.item_id, &self.location_id)
    }
}

// ---------------------------------------------------------------------------
// Commit attempt journal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Started,
    Committed,
    Failed,
    Abandoned,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "committed" => Ok(Self::Committed),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("Unknown attempt status: {other}")),
        }
    }
}

/// Journal row written before a commit starts.
///
/// A row still `Started` for a day without a committed entry means the
/// process stopped mid-commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAttempt {
    pub id: String,
    pub date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub status: AttemptStatus,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn order_with(lines: Vec<OrderLine>, discount: Decimal) -> Order {
        Order {
            id: "ORD-2024-001".into(),
            status: OrderStatus::Completed,
            payment_method: PaymentMethod::Cash,
            lines,
            discount,
            final_amount: None,
            customer_name: Some("Asha".into()),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            completed_at: None,
            completed_by: Some("u-2".into()),
            is_delivery_order: false,
        }
    }

    fn line(item: &str, qty: Decimal, price: Decimal) -> OrderLine {
        OrderLine {
            item_id: item.into(),
            quantity: qty,
            unit_price: price,
            checked: true,
            location_id: None,
        }
    }

    #[test]
    fn test_final_amount_clamps_discount() {
        let order = order_with(vec![line("A", dec!(2), dec!(50))], dec!(30));
        assert_eq!(order.subtotal(), Some(dec!(100)));
        assert_eq!(order.derived_final_amount(), Some(dec!(70)));

        let over = order_with(vec![line("A", dec!(1), dec!(20))], dec!(50));
        assert_eq!(over.derived_final_amount(), Some(Decimal::ZERO));
    }

    #[test]
    fn test_settled_amount_prefers_recorded() {
        let mut order = order_with(vec![line("A", dec!(3), dec!(100))], Decimal::ZERO);
        order.final_amount = Some(dec!(500));
        assert_eq!(order.settled_amount(), Some(dec!(500)));

        order.final_amount = Some(dec!(-5));
        assert_eq!(order.settled_amount(), Some(Decimal::ZERO));
    }

    #[test]
    fn test_payment_totals_buckets() {
        let mut totals = PaymentTotals::default();
        totals.try_add(PaymentMethod::Cash, dec!(500)).unwrap();
        totals.try_add(PaymentMethod::Upi, dec!(200)).unwrap();
        totals.try_add(PaymentMethod::Mixed, dec!(40)).unwrap();
        assert_eq!(totals.grand_total(), dec!(740));
        assert!(totals.has_unreconciled_mixed());
        assert_eq!(totals.credit, Decimal::ZERO);
    }

    #[test]
    fn test_ledger_field_parse_and_display() {
        let field: LedgerField = "totalCash".parse().unwrap();
        assert_eq!(field, LedgerField::TotalCash);

        let field: LedgerField = "orders.ORD-2024-001.finalAmount".parse().unwrap();
        assert_eq!(field, LedgerField::OrderFinalAmount("ORD-2024-001".into()));
        assert_eq!(field.to_string(), "orders.ORD-2024-001.finalAmount");
        assert!(field.is_monetary());

        let dotted: LedgerField = "orders.A.B.customerName".parse().unwrap();
        assert_eq!(dotted.order_id(), Some("A.B"));

        assert!("orders..finalAmount".parse::<LedgerField>().is_err());
        assert!("discount".parse::<LedgerField>().is_err());
        assert!("orders.X.colour".parse::<LedgerField>().is_err());
    }

    #[test]
    fn test_ledger_field_serde_as_string() {
        let json = serde_json::to_string(&LedgerField::OrderVerifiedBy("O1".into())).unwrap();
        assert_eq!(json, "\"orders.O1.verifiedBy\"");
        let back: LedgerField = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LedgerField::OrderVerifiedBy("O1".into()));
    }

    #[test]
    fn test_order_deserializes_snake_case_status() {
        let json = serde_json::json!({
            "id": "ORD-2024-009",
            "status": "changes_made",
            "payment_method": "upi",
            "lines": [{ "item_id": "A", "quantity": "1.5", "unit_price": "40" }],
            "created_at": "2024-03-01T10:00:00Z",
        });
        let order: Order = serde_json::from_value(json).unwrap();
        assert_eq!(order.status, OrderStatus::ChangesMade);
        assert_eq!(order.payment_method, PaymentMethod::Upi);
        assert_eq!(order.lines[0].quantity, dec!(1.5));
        assert!(!order.lines[0].checked);
        assert_eq!(order.discount, Decimal::ZERO);
    }
}
