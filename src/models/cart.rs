//! Cart item and snapshot models

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::equipment::EquipmentRef;

/// Reservation scope: the project a cart instance is bound to, with its
/// default rental dates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ProjectContext {
    pub fn default_range(&self) -> ResolvedRange {
        ResolvedRange {
            start: self.start_date,
            end: self.end_date,
        }
    }
}

/// Concrete rental period, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ResolvedRange {
    /// Number of billable rental days (inclusive bounds).
    pub fn rental_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Rental dates of a cart item: inherited from the project or overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemDates {
    #[default]
    ProjectDefault,
    Override { start: NaiveDate, end: NaiveDate },
}

impl ItemDates {
    pub fn resolve(&self, project: &ProjectContext) -> ResolvedRange {
        match *self {
            ItemDates::ProjectDefault => project.default_range(),
            ItemDates::Override { start, end } => ResolvedRange { start, end },
        }
    }
}

/// A single cart slot: one distinct equipment entry with its quantity and
/// pricing snapshot. `quantity` is always >= 1; a slot that would drop to
/// zero units is removed from the cart instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    /// Stable key derived from equipment identity (one slot per equipment)
    pub key: String,
    pub equipment: EquipmentRef,
    pub quantity: u32,
    #[serde(default)]
    pub dates: ItemDates,
    /// Price per day captured at insertion time, kept even if the catalog
    /// price changes afterwards
    pub daily_cost: Decimal,
    pub added_at: DateTime<Utc>,
}

impl CartItem {
    /// Cart key for an equipment id.
    pub fn key_for(equipment_id: i64) -> String {
        format!("equipment:{}", equipment_id)
    }

    pub fn resolved_range(&self, project: &ProjectContext) -> ResolvedRange {
        self.dates.resolve(project)
    }

    /// Projected cost of this slot: quantity x daily cost x rental days.
    pub fn line_cost(&self, project: &ProjectContext) -> Decimal {
        let days = self.resolved_range(project).rental_days().max(0);
        self.daily_cost * Decimal::from(self.quantity) * Decimal::from(days)
    }
}

/// The persistable view of a cart: scope plus the ordered item map.
///
/// This is the persistence whitelist. Transient engine state (error list,
/// behavior toggles) never enters a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CartSnapshot {
    pub project_id: String,
    /// Keyed by [`CartItem::key_for`]; insertion order is preserved for
    /// display, it carries no other meaning
    pub items: IndexMap<String, CartItem>,
}
