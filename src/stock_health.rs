//! Days-of-cover report for the inventory screen.
//!
//! Velocity comes from what committed days actually deducted, so staged or
//! abandoned days never skew it.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{InventoryRecord, LedgerEntry};

/// Ordered most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    Critical,
    Low,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockOutlook {
    pub item_id: String,
    /// Across every location.
    pub on_hand: Decimal,
    pub sold_in_window: Decimal,
    /// Units per day, rounded to 2 places.
    pub daily_velocity: Decimal,
    /// `None` when nothing sold in the window.
    pub days_of_cover: Option<Decimal>,
    pub status: StockStatus,
}

/// Thresholds and window for [`assess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutlookRules {
    pub window_days: u32,
    pub critical_days: Decimal,
    pub low_days: Decimal,
}

pub fn classify(days_of_cover: Option<Decimal>, rules: &OutlookRules) -> StockStatus {
    match days_of_cover {
        Some(days) if days <= rules.critical_days => StockStatus::Critical,
        Some(days) if days <= rules.low_days => StockStatus::Low,
        _ => StockStatus::Normal,
    }
}

/// Outlook for every item that is stocked or was sold in `entries`.
///
/// `entries` should already be limited to the velocity window.
pub fn assess(
    inventory: &[InventoryRecord],
    entries: &[LedgerEntry],
    rules: &OutlookRules,
) -> Vec<StockOutlook> {
    let mut on_hand: BTreeMap<&str, Decimal> = BTreeMap::new();
    for record in inventory {
        *on_hand.entry(record.item_id.as_str()).or_default() += record.quantity_on_hand;
    }

    let mut sold: BTreeMap<&str, Decimal> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.is_committed) {
        for d in &entry.deductions {
            *sold.entry(d.item_id.as_str()).or_default() += d.quantity;
            on_hand.entry(d.item_id.as_str()).or_default();
        }
    }

    let window = Decimal::from(rules.window_days.max(1));

    let mut outlook: Vec<StockOutlook> = on_hand
        .into_iter()
        .map(|(item_id, on_hand)| {
            let sold_in_window = sold.get(item_id).copied().unwrap_or_default();
            let velocity = sold_in_window / window;
            let days_of_cover = if velocity > Decimal::ZERO {
                Some(on_hand / velocity)
            } else {
                None
            };
            StockOutlook {
                item_id: item_id.to_string(),
                on_hand,
                sold_in_window,
                daily_velocity: velocity.round_dp(2),
                days_of_cover: days_of_cover.map(|d| d.round_dp(2)),
                status: classify(days_of_cover, rules),
            }
        })
        .collect();

    outlook.sort_by(|a, b| a.status.cmp(&b.status).then_with(|| a.item_id.cmp(&b.item_id)));
    outlook
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StockDeduction;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn rules() -> OutlookRules {
        OutlookRules {
            window_days: 7,
            critical_days: dec!(1),
            low_days: dec!(3),
        }
    }

    fn sold(day: u32, items: &[(&str, Decimal)]) -> LedgerEntry {
        LedgerEntry {
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            grand_total: Decimal::ZERO,
            total_cash: Decimal::ZERO,
            total_upi: Decimal::ZERO,
            total_credit: Decimal::ZERO,
            total_mixed: Decimal::ZERO,
            orders: Vec::new(),
            deductions: items
                .iter()
                .map(|(item, qty)| StockDeduction {
                    item_id: item.to_string(),
                    location_id: "main".into(),
                    quantity: *qty,
                })
                .collect(),
            excluded_orders: Vec::new(),
            is_committed: true,
            is_corrected: false,
            corrections: Vec::new(),
            committed_at: None,
            committed_by: None,
        }
    }

    #[test]
    fn test_classify_thresholds() {
        let r = rules();
        assert_eq!(classify(Some(dec!(0.5)), &r), StockStatus::Critical);
        assert_eq!(classify(Some(dec!(1)), &r), StockStatus::Critical);
        assert_eq!(classify(Some(dec!(3)), &r), StockStatus::Low);
        assert_eq!(classify(Some(dec!(3.01)), &r), StockStatus::Normal);
        assert_eq!(classify(None, &r), StockStatus::Normal);
    }

    #[test]
    fn test_assess_sums_locations_and_sorts_by_urgency() {
        let inventory = vec![
            InventoryRecord::new("RICE", "main", dec!(10)),
            InventoryRecord::new("RICE", "godown", dec!(4)),
            InventoryRecord::new("SOAP", "main", dec!(1)),
            InventoryRecord::new("TEA", "main", dec!(50)),
        ];
        // RICE: 14 sold in 7 days -> 2/day -> 7 days cover
        // SOAP: 14 sold -> 2/day -> 0.5 days cover
        let entries = vec![
            sold(1, &[("RICE", dec!(7)), ("SOAP", dec!(7))]),
            sold(2, &[("RICE", dec!(7)), ("SOAP", dec!(7))]),
        ];

        let outlook = assess(&inventory, &entries, &rules());
        let ids: Vec<&str> = outlook.iter().map(|o| o.item_id.as_str()).collect();
        assert_eq!(ids, vec!["SOAP", "RICE", "TEA"]);

        assert_eq!(outlook[0].status, StockStatus::Critical);
        assert_eq!(outlook[0].days_of_cover, Some(dec!(0.5)));
        assert_eq!(outlook[1].on_hand, dec!(14));
        assert_eq!(outlook[1].daily_velocity, dec!(2));
        assert_eq!(outlook[1].status, StockStatus::Normal);
        assert_eq!(outlook[2].days_of_cover, None);
    }

    #[test]
    fn test_sold_but_unstocked_item_is_critical() {
        let outlook = assess(&[], &[sold(1, &[("GHEE", dec!(2))])], &rules());
        assert_eq!(outlook.len(), 1);
        assert_eq!(outlook[0].on_hand, Decimal::ZERO);
        assert_eq!(outlook[0].status, StockStatus::Critical);
    }

    #[test]
    fn test_uncommitted_entries_ignored() {
        let mut entry = sold(1, &[("TEA", dec!(70))]);
        entry.is_committed = false;
        let outlook = assess(&[InventoryRecord::new("TEA", "main", dec!(5))], &[entry], &rules());
        assert_eq!(outlook[0].sold_in_window, Decimal::ZERO);
        assert_eq!(outlook[0].status, StockStatus::Normal);
    }
}
