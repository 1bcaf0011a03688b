//! Data models for Cartwheel

pub mod booking;
pub mod cart;
pub mod equipment;

// Re-export commonly used types
pub use booking::{
    AvailabilityReport, BatchResult, BookingConflict, BookingFailure, BookingRecord,
    BookingRequest,
};
pub use cart::{CartItem, CartSnapshot, ItemDates, ProjectContext, ResolvedRange};
pub use equipment::EquipmentRef;
