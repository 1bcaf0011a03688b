//! File-backed storage backend
//!
//! One file per key under a data directory, so persisted carts survive
//! process restarts. Values are written atomically (temp file + rename).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{StorageBackend, StorageChange};
use crate::error::{CartError, CartResult};

const CHANGE_CHANNEL_CAPACITY: usize = 64;
const FILE_EXTENSION: &str = "json";

pub struct FileStore {
    root: PathBuf,
    events: broadcast::Sender<StorageChange>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            root: root.into(),
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> CartResult<PathBuf> {
        // Keys are flat; anything that could escape the data directory is a
        // programmer error.
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
        {
            return Err(CartError::InvalidArgument(format!(
                "Invalid storage key '{}'",
                key
            )));
        }
        Ok(self.root.join(format!("{}.{}", key, FILE_EXTENSION)))
    }

    fn notify(&self, key: &str, value: Option<String>) {
        let _ = self.events.send(StorageChange {
            key: key.to_string(),
            value,
        });
    }
}

#[async_trait]
impl StorageBackend for FileStore {
    async fn read(&self, key: &str) -> CartResult<Option<String>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CartError::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn write(&self, key: &str, value: &str) -> CartResult<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CartError::Storage(format!("Failed to create data directory: {}", e)))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| CartError::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CartError::Storage(format!("Failed to commit {}: {}", path.display(), e)))?;

        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> CartResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.notify(key, None);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CartError::Storage(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn keys(&self, prefix: &str) -> CartResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CartError::Storage(format!(
                    "Failed to list {}: {}",
                    self.root.display(),
                    e
                )))
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CartError::Storage(format!("Failed to list entries: {}", e)))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(key) = name.strip_suffix(&format!(".{}", FILE_EXTENSION)) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    fn changes(&self) -> broadcast::Receiver<StorageChange> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());

        store.write("cart_p1_v3", "payload").await.expect("write");
        assert_eq!(
            store.read("cart_p1_v3").await.expect("read"),
            Some("payload".to_string())
        );

        // A second store over the same directory sees the value
        let reopened = FileStore::new(dir.path());
        assert_eq!(
            reopened.read("cart_p1_v3").await.expect("read"),
            Some("payload".to_string())
        );

        store.remove("cart_p1_v3").await.expect("remove");
        assert_eq!(store.read("cart_p1_v3").await.expect("read"), None);
    }

    #[tokio::test]
    async fn lists_keys_by_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());

        store.write("cart_p1_v3", "a").await.expect("write");
        store.write("cart_p2_v3", "b").await.expect("write");
        store.write("misc", "c").await.expect("write");

        let mut keys = store.keys("cart_").await.expect("keys");
        keys.sort();
        assert_eq!(keys, vec!["cart_p1_v3", "cart_p2_v3"]);
    }

    #[tokio::test]
    async fn rejects_path_escaping_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        assert!(store.read("../outside").await.is_err());
        assert!(store.write("a/b", "x").await.is_err());
    }
}
