//! Cartwheel Reservation Cart Engine
//!
//! The working set of equipment selections for a rental project: an
//! in-memory cart with durable, versioned, TTL-bounded persistence,
//! cross-instance synchronization, availability-checked admission, and batch
//! booking submission with defined partial-failure semantics.

pub mod cart;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod persist;
pub mod registry;
pub mod storage;

pub use cart::{AddOutcome, AddRequest, CartEngine, CartEvent};
pub use config::{AppConfig, CartConfig};
pub use error::{CartError, CartResult};
pub use persist::{EnvelopeManager, PersistOptions, ENVELOPE_VERSION};
