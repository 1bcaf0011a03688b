//! Availability and booking wire types

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Result of an availability check for one equipment entry over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub available: bool,
    pub available_quantity: u32,
    #[serde(default)]
    pub conflicts: Vec<BookingConflict>,
}

/// An existing booking that blocks (part of) the requested quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingConflict {
    pub booking_id: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// One booking to create, derived from a cart item at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub equipment_id: i64,
    pub quantity: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub computed_cost: Decimal,
    pub project_id: String,
}

/// A booking the server confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: i64,
    pub equipment_id: i64,
    pub quantity: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Per-item failure inside a batch, indexed into the submitted request array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFailure {
    pub index: usize,
    pub reason: String,
}

/// Outcome of a batch submission. Partial success is an expected outcome:
/// `created_count` and `failed_count` may both be non-zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BatchResult {
    pub success: bool,
    pub created_count: u32,
    pub failed_count: u32,
    #[serde(default)]
    pub bookings: Vec<BookingRecord>,
    #[serde(default)]
    pub failures: Vec<BookingFailure>,
}

impl BatchResult {
    /// An empty batch: nothing submitted, nothing failed.
    pub fn empty() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }
}
