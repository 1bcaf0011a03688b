//! Persistence envelope manager
//!
//! Wraps cart state in a versioned, timestamped, TTL-bounded envelope before
//! it reaches the storage medium, and validates the same envelope on the way
//! back. An envelope is usable iff its version matches the running code and
//! its TTL (when present) has not passed; anything else is a cache miss and
//! the stored entry is wiped so it cannot keep failing to load.
//!
//! Storage faults never propagate to callers: they are logged and reported
//! through a single error hook, and the cart keeps operating in memory.

use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::codec::{Codec, PlainCodec, ZstdCodec};
use crate::error::{CartError, CartResult};
use crate::notify::{RemoteUpdate, UpdateChannel};
use crate::storage::StorageBackend;

/// Envelope format version. Stored entries written under any other version
/// are treated as absent.
pub const ENVELOPE_VERSION: u32 = 3;

/// Versioned, timestamped, TTL-bounded wrapper around persisted data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    /// Write time, epoch milliseconds
    pub timestamp: i64,
    /// Absolute expiry instant, epoch milliseconds; absent means no time
    /// expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    pub data: T,
}

/// Header view used to validate an envelope without materializing the payload.
#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    version: u32,
    #[serde(default)]
    ttl: Option<i64>,
}

/// Behavior of an [`EnvelopeManager`].
#[derive(Debug, Clone)]
pub struct PersistOptions {
    /// Key namespace; keys are laid out as `<namespace>_<scopeId>_v<version>`
    pub namespace: String,
    pub version: u32,
    /// Relative lifetime, turned into an absolute deadline at write time
    pub ttl: Option<Duration>,
    pub compression: bool,
    /// Keys examined per page during a cleanup sweep
    pub cleanup_page_size: usize,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            namespace: "rental-cart".to_string(),
            version: ENVELOPE_VERSION,
            ttl: Some(Duration::hours(72)),
            compression: true,
            cleanup_page_size: 25,
        }
    }
}

impl PersistOptions {
    /// Codec matching the compression setting.
    pub fn codec(&self) -> Box<dyn Codec> {
        if self.compression {
            Box::new(ZstdCodec::default())
        } else {
            Box::new(PlainCodec)
        }
    }

    fn validate(&self) -> CartResult<()> {
        if self.namespace.is_empty()
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(CartError::Configuration(format!(
                "Invalid persistence namespace '{}'",
                self.namespace
            )));
        }
        if self.cleanup_page_size == 0 {
            return Err(CartError::Configuration(
                "cleanup_page_size must be at least 1".to_string(),
            ));
        }
        if let Some(ttl) = self.ttl {
            if ttl <= Duration::zero() {
                return Err(CartError::Configuration(
                    "Persistence TTL must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Callback invoked for every storage fault the manager swallows.
pub type ErrorHook = Arc<dyn Fn(&CartError) + Send + Sync>;

/// Manages the durable copy of cart state for every scope sharing one
/// storage medium.
pub struct EnvelopeManager {
    store: Arc<dyn StorageBackend>,
    codec: Box<dyn Codec>,
    opts: PersistOptions,
    channel: Option<Arc<dyn UpdateChannel>>,
    on_error: RwLock<Option<ErrorHook>>,
}

impl EnvelopeManager {
    pub fn new(store: Arc<dyn StorageBackend>, opts: PersistOptions) -> CartResult<Self> {
        opts.validate()?;
        let codec = opts.codec();
        Ok(Self {
            store,
            codec,
            opts,
            channel: None,
            on_error: RwLock::new(None),
        })
    }

    /// Attach the update channel that `save_state` publishes on.
    pub fn with_channel(mut self, channel: Arc<dyn UpdateChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn options(&self) -> &PersistOptions {
        &self.opts
    }

    pub fn channel(&self) -> Option<&Arc<dyn UpdateChannel>> {
        self.channel.as_ref()
    }

    /// Register the hook that receives swallowed storage errors.
    pub fn set_error_hook(&self, hook: ErrorHook) {
        if let Ok(mut slot) = self.on_error.write() {
            *slot = Some(hook);
        }
    }

    /// Storage key for a scope under the current namespace and version.
    pub fn storage_key(&self, scope_id: &str) -> String {
        format!("{}_{}_v{}", self.opts.namespace, scope_id, self.opts.version)
    }

    fn key_prefix(&self) -> String {
        format!("{}_", self.opts.namespace)
    }

    fn report(&self, err: &CartError) {
        tracing::warn!(error = %err, "Cart persistence error");
        if let Ok(slot) = self.on_error.read() {
            if let Some(hook) = slot.as_ref() {
                hook(err);
            }
        }
    }

    fn expired(ttl: Option<i64>) -> bool {
        ttl.is_some_and(|deadline| Utc::now().timestamp_millis() > deadline)
    }

    /// Persist `state` for `scope_id`. Fire-and-forget: failures are reported
    /// through the error hook, never returned.
    pub async fn save_state<T: Serialize>(&self, scope_id: &str, state: &T) {
        if let Err(e) = self.try_save(scope_id, state).await {
            self.report(&e);
        }
    }

    async fn try_save<T: Serialize>(&self, scope_id: &str, state: &T) -> CartResult<()> {
        let now = Utc::now().timestamp_millis();
        let ttl = self.opts.ttl.map(|d| now + d.num_milliseconds());
        // The caller hands us the already-filtered snapshot; transient state
        // never reaches this point.
        let payload = serde_json::to_value(state)?;
        let envelope = Envelope {
            version: self.opts.version,
            timestamp: now,
            ttl,
            data: payload.clone(),
        };
        let serialized = serde_json::to_vec(&envelope)?;
        let encoded = self.codec.encode(&serialized)?;
        let key = self.storage_key(scope_id);
        self.store.write(&key, &encoded).await?;
        tracing::debug!(scope = scope_id, bytes = encoded.len(), "Persisted cart state");

        // Other live instances get the filtered state, not the raw envelope
        if let Some(channel) = &self.channel {
            channel.publish(RemoteUpdate {
                scope_id: scope_id.to_string(),
                version: self.opts.version,
                ttl,
                state: payload,
                sender_id: 0,
            });
        }
        Ok(())
    }

    /// Load the persisted state for `scope_id`, or `None` when the entry is
    /// absent, malformed, version-mismatched or expired. Invalid entries are
    /// wiped on the way out.
    pub async fn load_state<T: DeserializeOwned>(&self, scope_id: &str) -> Option<T> {
        let key = self.storage_key(scope_id);
        let raw = match self.store.read(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.report(&e);
                return None;
            }
        };

        let envelope: Envelope<T> = match self.decode_envelope(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(scope = scope_id, error = %e, "Wiping unreadable cart envelope");
                self.wipe(&key).await;
                return None;
            }
        };

        if envelope.version != self.opts.version {
            tracing::debug!(
                scope = scope_id,
                stored = envelope.version,
                expected = self.opts.version,
                "Wiping cart envelope with mismatched version"
            );
            self.wipe(&key).await;
            return None;
        }
        if Self::expired(envelope.ttl) {
            tracing::debug!(scope = scope_id, "Wiping expired cart envelope");
            self.wipe(&key).await;
            return None;
        }
        Some(envelope.data)
    }

    /// [`Self::load_state`] with a caller-supplied pre-restore transform.
    pub async fn load_state_with<T, F>(&self, scope_id: &str, transform: F) -> Option<T>
    where
        T: DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        self.load_state(scope_id).await.map(transform)
    }

    /// Whether a valid (parsable, version-matching, unexpired) envelope exists
    /// for `scope_id`, without materializing the payload.
    pub async fn has_valid_data(&self, scope_id: &str) -> bool {
        let key = self.storage_key(scope_id);
        let raw = match self.store.read(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                self.report(&e);
                return false;
            }
        };
        match self.decode_header(&raw) {
            Ok(header) => header.version == self.opts.version && !Self::expired(header.ttl),
            Err(_) => false,
        }
    }

    /// Sweep every key in the namespace and remove expired or unparsable
    /// envelopes. Entries written by other format versions are left alone as
    /// long as they parse and have not expired; version keying keeps them
    /// from colliding with ours. Idempotent, paged, safe to run alongside
    /// normal reads and writes.
    pub async fn cleanup(&self) -> usize {
        let keys = match self.store.keys(&self.key_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                self.report(&e);
                return 0;
            }
        };

        let mut removed = 0;
        for page in keys.chunks(self.opts.cleanup_page_size) {
            for key in page {
                let raw = match self.store.read(key).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => continue,
                    Err(e) => {
                        self.report(&e);
                        continue;
                    }
                };
                let stale = match self.decode_header(&raw) {
                    Ok(header) => Self::expired(header.ttl),
                    Err(_) => true,
                };
                if stale {
                    tracing::debug!(key = %key, "Cleanup sweep removing stale cart envelope");
                    self.wipe(key).await;
                    removed += 1;
                }
            }
            tokio::task::yield_now().await;
        }
        removed
    }

    /// Spawn a periodic cleanup sweep. The task stops on its own once the
    /// manager is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                let removed = manager.cleanup().await;
                if removed > 0 {
                    tracing::info!(removed, "Cleanup sweep removed stale cart envelopes");
                }
            }
        })
    }

    /// Close the attached update channel. Call when the owning cart instance
    /// is discarded.
    pub fn teardown(&self) {
        if let Some(channel) = &self.channel {
            channel.teardown();
        }
    }

    fn decode_envelope<T: DeserializeOwned>(&self, raw: &str) -> CartResult<Envelope<T>> {
        let bytes = self.codec.decode(raw)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn decode_header(&self, raw: &str) -> CartResult<EnvelopeHeader> {
        let bytes = self.codec.decode(raw)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn wipe(&self, key: &str) {
        if let Err(e) = self.store.remove(key).await {
            self.report(&e);
        }
    }
}

/// Split a storage key back into `(scope_id, version)`, or `None` when the
/// key does not belong to `namespace`.
pub fn parse_storage_key(namespace: &str, key: &str) -> Option<(String, u32)> {
    let rest = key.strip_prefix(namespace)?.strip_prefix('_')?;
    let (scope_id, version) = rest.rsplit_once("_v")?;
    if scope_id.is_empty() {
        return None;
    }
    Some((scope_id.to_string(), version.parse().ok()?))
}
