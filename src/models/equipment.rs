//! Equipment catalog snapshot

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Read-only snapshot of a catalog equipment entry
///
/// The catalog owns the live record; the cart keeps this copy so that later
/// catalog edits (renames, price changes) do not alter items already selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentRef {
    pub id: i64,
    /// Equipment name / description
    pub name: String,
    pub category: Option<String>,
    /// Rental price per day at the time of the snapshot
    pub daily_cost: Decimal,
    /// Serial number / barcode, when the unit is individually tracked
    pub serial_number: Option<String>,
}
