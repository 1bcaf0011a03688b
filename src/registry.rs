//! Process-wide registry of live persistence managers
//!
//! Each cart instance registers its envelope manager under its storage key
//! while it is alive, so an application-close hook can tear every channel
//! down in one call instead of relying on implicit global teardown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::persist::EnvelopeManager;

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<EnvelopeManager>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<String, Arc<EnvelopeManager>>> {
    match REGISTRY.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Register a live manager under its storage key. Re-registering a key
/// replaces the previous entry.
pub fn register(storage_key: &str, manager: Arc<EnvelopeManager>) {
    registry().insert(storage_key.to_string(), manager);
}

/// Remove a manager from the registry. Unknown keys are a no-op.
pub fn unregister(storage_key: &str) {
    registry().remove(storage_key);
}

/// Number of currently registered managers.
pub fn active_count() -> usize {
    registry().len()
}

/// Whether a manager is registered under `storage_key`.
pub fn is_registered(storage_key: &str) -> bool {
    registry().contains_key(storage_key)
}

/// Application-close hook: tear down every registered manager's update
/// channel and empty the registry.
pub fn shutdown_all() {
    let managers: Vec<_> = registry().drain().collect();
    for (key, manager) in managers {
        tracing::debug!(key = %key, "Tearing down cart persistence");
        manager.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::PersistOptions;
    use crate::storage::MemoryStore;

    fn manager(namespace: &str) -> Arc<EnvelopeManager> {
        Arc::new(
            EnvelopeManager::new(
                Arc::new(MemoryStore::new()),
                PersistOptions {
                    namespace: namespace.to_string(),
                    ..Default::default()
                },
            )
            .expect("valid options"),
        )
    }

    // The registry is process-global and other tests use it concurrently,
    // so assertions stay on this test's own keys rather than on counts.
    #[test]
    fn register_unregister_shutdown() {
        let mgr = manager("registry-test");
        let key = mgr.storage_key("p1");

        register(&key, mgr.clone());
        assert!(is_registered(&key));

        // Re-registering the same key replaces the entry
        register(&key, mgr);
        assert!(is_registered(&key));

        unregister(&key);
        assert!(!is_registered(&key));
        // Unknown key is a no-op
        unregister(&key);

        register("registry-test_p2_v3", manager("registry-test"));
        register("registry-test_p3_v3", manager("registry-test"));
        shutdown_all();
        assert!(!is_registered("registry-test_p2_v3"));
        assert!(!is_registered("registry-test_p3_v3"));
    }
}
