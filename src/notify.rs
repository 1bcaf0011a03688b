//! Cross-instance update channels
//!
//! Every live cart instance sharing a storage medium keeps its in-memory
//! state in sync through an [`UpdateChannel`]. Two implementations exist: a
//! named in-process broadcast (the direct path) and a decoder over the
//! storage medium's change events (the fallback for media that carry their
//! own notifications). The engine depends only on the trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::codec::Codec;
use crate::persist::{parse_storage_key, Envelope, PersistOptions};
use crate::storage::StorageBackend;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// A state change published by some cart instance.
///
/// Carries the filtered state plus the envelope metadata receivers need to
/// run the same version/TTL validation as a storage load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteUpdate {
    pub scope_id: String,
    pub version: u32,
    /// Absolute expiry instant, epoch milliseconds
    pub ttl: Option<i64>,
    pub state: serde_json::Value,
    /// Publisher identity; `0` when the transport cannot attribute the write
    #[serde(default)]
    pub sender_id: u64,
}

/// Pub/sub channel between live cart instances.
pub trait UpdateChannel: Send + Sync {
    fn publish(&self, update: RemoteUpdate);

    fn subscribe(&self) -> broadcast::Receiver<RemoteUpdate>;

    /// Identity stamped on updates published through this channel, so a
    /// subscriber can skip its own broadcasts.
    fn sender_id(&self) -> u64;

    /// Close the channel and stop any listener task. Must be called when the
    /// owning cart instance is discarded.
    fn teardown(&self);
}

static NAMED_SENDERS: Lazy<Mutex<HashMap<String, broadcast::Sender<RemoteUpdate>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static NEXT_SENDER_ID: AtomicU64 = AtomicU64::new(1);

fn next_sender_id() -> u64 {
    NEXT_SENDER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Named in-process broadcast channel.
///
/// Instances opened under the same name share one bus; a publisher never
/// receives its own messages back (subscribers filter on `sender_id`).
pub struct BroadcastChannel {
    name: String,
    id: u64,
    sender: broadcast::Sender<RemoteUpdate>,
    open: AtomicBool,
}

impl BroadcastChannel {
    pub fn open(name: &str) -> Self {
        let sender = {
            let mut senders = match NAMED_SENDERS.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            senders
                .entry(name.to_string())
                .or_insert_with(|| broadcast::channel(UPDATE_CHANNEL_CAPACITY).0)
                .clone()
        };
        Self {
            name: name.to_string(),
            id: next_sender_id(),
            sender,
            open: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl UpdateChannel for BroadcastChannel {
    fn publish(&self, update: RemoteUpdate) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        let mut update = update;
        update.sender_id = self.id;
        // No other instance listening is fine
        let _ = self.sender.send(update);
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteUpdate> {
        self.sender.subscribe()
    }

    fn sender_id(&self) -> u64 {
        self.id
    }

    fn teardown(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl Drop for BroadcastChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Fallback channel that decodes the storage medium's own change events.
///
/// Publishing is a no-op here: the storage write that triggered the change is
/// itself the broadcast. This transport cannot attribute a change to a
/// sender, so subscribers may see their own writes; the engine's replace
/// policy is idempotent, which makes self-delivery harmless.
pub struct StorageEventChannel {
    id: u64,
    forward: broadcast::Sender<RemoteUpdate>,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StorageEventChannel {
    /// Start decoding change events from `store` for `opts.namespace`.
    pub fn listen(store: &Arc<dyn StorageBackend>, opts: &PersistOptions) -> Self {
        let (forward, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let mut changes = store.changes();
        let codec = opts.codec();
        let namespace = opts.namespace.clone();
        let tx = forward.clone();

        let listener = tokio::spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Storage event listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some((scope_id, _)) = parse_storage_key(&namespace, &change.key) else {
                    continue;
                };
                // Removals carry no state to forward
                let Some(raw) = change.value else { continue };
                match decode_change(codec.as_ref(), &raw) {
                    Ok(envelope) => {
                        let _ = tx.send(RemoteUpdate {
                            scope_id,
                            version: envelope.version,
                            ttl: envelope.ttl,
                            state: envelope.data,
                            sender_id: 0,
                        });
                    }
                    Err(e) => {
                        tracing::debug!(key = %change.key, error = %e, "Ignoring undecodable storage event");
                    }
                }
            }
        });

        Self {
            id: next_sender_id(),
            forward,
            listener: Mutex::new(Some(listener)),
        }
    }
}

fn decode_change(
    codec: &dyn Codec,
    raw: &str,
) -> crate::error::CartResult<Envelope<serde_json::Value>> {
    let bytes = codec.decode(raw)?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl UpdateChannel for StorageEventChannel {
    fn publish(&self, _update: RemoteUpdate) {
        // The storage write already notified every listener
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteUpdate> {
        self.forward.subscribe()
    }

    fn sender_id(&self) -> u64 {
        self.id
    }

    fn teardown(&self) {
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl Drop for StorageEventChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(scope: &str) -> RemoteUpdate {
        RemoteUpdate {
            scope_id: scope.to_string(),
            version: 3,
            ttl: None,
            state: serde_json::json!({"project_id": scope, "items": {}}),
            sender_id: 0,
        }
    }

    #[tokio::test]
    async fn named_channels_share_a_bus() {
        let a = BroadcastChannel::open("notify-test-shared");
        let b = BroadcastChannel::open("notify-test-shared");
        let mut rx = b.subscribe();

        a.publish(update("p1"));
        let received = rx.recv().await.expect("update");
        assert_eq!(received.scope_id, "p1");
        assert_eq!(received.sender_id, a.sender_id());
        assert_ne!(received.sender_id, b.sender_id());
    }

    #[tokio::test]
    async fn torn_down_channel_stops_publishing() {
        let a = BroadcastChannel::open("notify-test-teardown");
        let b = BroadcastChannel::open("notify-test-teardown");
        let mut rx = b.subscribe();

        a.teardown();
        a.publish(update("p1"));
        b.publish(update("p2"));

        // Only the live publisher's update arrives
        let received = rx.recv().await.expect("update");
        assert_eq!(received.scope_id, "p2");
    }

    #[tokio::test]
    async fn storage_events_are_decoded_into_updates() {
        use crate::persist::{EnvelopeManager, PersistOptions};
        use crate::storage::MemoryStore;

        let store: Arc<dyn StorageBackend> = Arc::new(MemoryStore::new());
        let opts = PersistOptions {
            namespace: "notifyfallback".to_string(),
            ..Default::default()
        };
        let channel = StorageEventChannel::listen(&store, &opts);
        let mut rx = channel.subscribe();

        let mgr = EnvelopeManager::new(store, opts).expect("manager");
        mgr.save_state("p1", &crate::models::CartSnapshot {
            project_id: "p1".to_string(),
            ..Default::default()
        })
        .await;

        let received = rx.recv().await.expect("update");
        assert_eq!(received.scope_id, "p1");
        assert_eq!(received.version, mgr.options().version);
        assert_eq!(received.sender_id, 0);
    }
}
