//! In-memory storage backend

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{StorageBackend, StorageChange};
use crate::error::{CartError, CartResult};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Process-local keyed store.
///
/// An optional per-entry byte quota makes it possible to exercise the
/// quota-exceeded failure path that browser-style storage media exhibit.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageChange>,
    max_entry_bytes: Option<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            max_entry_bytes: None,
        }
    }

    /// Store that rejects any single value larger than `max_entry_bytes`.
    pub fn with_quota(max_entry_bytes: usize) -> Self {
        Self {
            max_entry_bytes: Some(max_entry_bytes),
            ..Self::new()
        }
    }

    fn notify(&self, key: &str, value: Option<String>) {
        // No subscribers is fine
        let _ = self.events.send(StorageChange {
            key: key.to_string(),
            value,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn read(&self, key: &str) -> CartResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> CartResult<()> {
        if let Some(max) = self.max_entry_bytes {
            if value.len() > max {
                return Err(CartError::Storage(format!(
                    "Quota exceeded writing '{}': {} bytes > {} bytes",
                    key,
                    value.len(),
                    max
                )));
            }
        }
        self.lock().insert(key.to_string(), value.to_string());
        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> CartResult<()> {
        let removed = self.lock().remove(key).is_some();
        if removed {
            self.notify(key, None);
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> CartResult<Vec<String>> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn changes(&self) -> broadcast::Receiver<StorageChange> {
        self.events.subscribe()
    }
}
