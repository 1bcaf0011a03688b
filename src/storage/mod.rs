//! Storage medium abstraction for persisted cart envelopes
//!
//! The envelope manager reads and writes opaque strings under flat keys. The
//! medium also exposes a change-notification stream, which the fallback
//! cross-instance channel listens to.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::CartResult;

pub use file::FileStore;
pub use memory::MemoryStore;

/// A change observed on the storage medium.
#[derive(Debug, Clone)]
pub struct StorageChange {
    pub key: String,
    /// The new raw value, or `None` when the key was removed
    pub value: Option<String>,
}

/// Flat keyed string store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn read(&self, key: &str) -> CartResult<Option<String>>;

    async fn write(&self, key: &str, value: &str) -> CartResult<()>;

    /// Removing an absent key is a no-op, not an error.
    async fn remove(&self, key: &str) -> CartResult<()>;

    /// All keys starting with `prefix`, in unspecified order.
    async fn keys(&self, prefix: &str) -> CartResult<Vec<String>>;

    /// Change notifications for every write/remove on this medium.
    fn changes(&self) -> broadcast::Receiver<StorageChange>;
}
