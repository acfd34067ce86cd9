// Remote store boundary.
//
// The core never talks to a concrete backend; everything upstream of the
// listener registry and the presence writer goes through `RemoteStore`. The
// in-memory implementation below backs the demo binary and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::entity::{Entity, EntityKey, PresenceRecord};

/// A single delivery from a subscription.
#[derive(Debug, Clone)]
pub enum RemoteUpdate {
    /// The entity was created or replaced.
    Upsert(Entity),
    /// The entity was deleted remotely.
    Delete,
}

/// Failures at the remote boundary. All variants are Clone so a single
/// failure can be fanned out to every single-flight waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// Presence write failed. Logged and dropped; superseded by the next
    /// accepted sample.
    #[error("presence write failed: {0}")]
    WriteFailed(String),

    /// Subscription could not be established. The registry retries with
    /// backoff while the key stays registered.
    #[error("subscription to {key} failed: {reason}")]
    SubscribeFailed { key: String, reason: String },

    /// Image fetch failed. Propagated to all waiters; nothing is cached and
    /// the next fetch retries.
    #[error("image fetch failed for {key}: {reason}")]
    FetchFailed { key: String, reason: String },
}

/// Abstract push/pull boundary to the authoritative remote store.
///
/// Subscriptions are channels: the store pushes `RemoteUpdate`s into the
/// returned receiver, and dropping the receiver releases the subscription.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Subscribe to one entity. The current value, if any, is delivered
    /// first.
    async fn subscribe(&self, key: &EntityKey) -> Result<mpsc::Receiver<RemoteUpdate>, RemoteError>;

    /// Replace the caller's presence record. Best-effort, latest-write-wins.
    async fn write_presence(&self, record: PresenceRecord) -> Result<(), RemoteError>;

    /// Fetch raw image bytes from the remote object store.
    async fn fetch_image(&self, key: &str) -> Result<Vec<u8>, RemoteError>;
}

/// Per-key subscription channel capacity. Same-key deliveries are ordered by
/// the channel; a slow consumer backpressures its own key only.
const SUBSCRIPTION_BUFFER: usize = 32;

/// In-memory remote store used by the demo binary and the test suite.
pub struct MemoryRemoteStore {
    entities: RwLock<HashMap<EntityKey, Entity>>,
    subscribers: RwLock<HashMap<EntityKey, Vec<mpsc::Sender<RemoteUpdate>>>>,
    presence: RwLock<HashMap<String, PresenceRecord>>,
    images: RwLock<HashMap<String, Vec<u8>>>,

    /// Artificial latency for image fetches, to widen the single-flight
    /// window in tests and make the demo believable.
    fetch_delay: Duration,

    fetch_calls: AtomicUsize,
    presence_writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::with_fetch_delay(Duration::from_millis(0))
    }

    pub fn with_fetch_delay(fetch_delay: Duration) -> Self {
        MemoryRemoteStore {
            entities: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            presence: RwLock::new(HashMap::new()),
            images: RwLock::new(HashMap::new()),
            fetch_delay,
            fetch_calls: AtomicUsize::new(0),
            presence_writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Seed or replace an entity and push the update to its subscribers.
    pub async fn upsert(&self, entity: Entity) {
        let key = entity.key();
        self.entities.write().await.insert(key.clone(), entity.clone());
        self.push(&key, RemoteUpdate::Upsert(entity)).await;
    }

    /// Delete an entity and push the deletion to its subscribers.
    pub async fn delete(&self, key: &EntityKey) {
        self.entities.write().await.remove(key);
        self.push(key, RemoteUpdate::Delete).await;
    }

    /// Store image bytes under a key for later fetches.
    pub async fn put_image(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.images.write().await.insert(key.into(), bytes);
    }

    /// Make subsequent presence writes fail (test hook).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of fetch_image calls that reached the store.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of presence writes that reached the store.
    pub fn presence_writes(&self) -> usize {
        self.presence_writes.load(Ordering::SeqCst)
    }

    /// Last accepted presence record for a user.
    pub async fn presence_for(&self, user_id: &str) -> Option<PresenceRecord> {
        self.presence.read().await.get(user_id).cloned()
    }

    /// Number of live subscription channels for a key.
    pub async fn subscriber_count(&self, key: &EntityKey) -> usize {
        self.subscribers
            .read()
            .await
            .get(key)
            .map(|senders| senders.len())
            .unwrap_or(0)
    }

    async fn push(&self, key: &EntityKey, update: RemoteUpdate) {
        let mut subs = self.subscribers.write().await;
        if let Some(senders) = subs.get_mut(key) {
            // Drop senders whose receivers have gone away.
            senders.retain(|tx| tx.try_send(update.clone()).is_ok());
            if senders.is_empty() {
                subs.remove(key);
            }
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn subscribe(&self, key: &EntityKey) -> Result<mpsc::Receiver<RemoteUpdate>, RemoteError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        // Deliver the current value first so a fresh subscriber converges
        // without waiting for the next remote change.
        if let Some(entity) = self.entities.read().await.get(key) {
            let _ = tx.try_send(RemoteUpdate::Upsert(entity.clone()));
        }

        self.subscribers
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .push(tx);

        debug!(%key, "remote subscription established");
        Ok(rx)
    }

    async fn write_presence(&self, record: PresenceRecord) -> Result<(), RemoteError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::WriteFailed("remote unavailable".to_string()));
        }
        self.presence_writes.fetch_add(1, Ordering::SeqCst);
        self.presence
            .write()
            .await
            .insert(record.user_id.clone(), record);
        Ok(())
    }

    async fn fetch_image(&self, key: &str) -> Result<Vec<u8>, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        self.images
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RemoteError::FetchFailed {
                key: key.to_string(),
                reason: "not found".to_string(),
            })
    }
}
