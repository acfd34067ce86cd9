// Listener registry - one remote subscription per (kind, id).
//
// Subscribe is idempotent, unsubscribe is idempotent and safe from any task,
// and unsubscribe_all is the only blanket teardown. Each subscription runs a
// delivery task that applies updates to the state store; registration is
// re-checked at apply time so a late delivery after unsubscribe is discarded
// rather than applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::entity::EntityKey;
use crate::remote::RemoteStore;
use crate::store::StateStore;

/// First resubscribe delay after a subscription failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

struct ActiveSubscription {
    generation: u64,
    task: JoinHandle<()>,
}

/// Owns every outstanding remote subscription, keyed by entity.
pub struct ListenerRegistry {
    remote: Arc<dyn RemoteStore>,
    store: Arc<StateStore>,
    active: Arc<Mutex<HashMap<EntityKey, ActiveSubscription>>>,
    next_generation: AtomicU64,
}

impl ListenerRegistry {
    pub fn new(remote: Arc<dyn RemoteStore>, store: Arc<StateStore>) -> Self {
        ListenerRegistry {
            remote,
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start listening for `key`. A second call while already subscribed is
    /// a no-op.
    pub async fn subscribe(&self, key: &EntityKey) {
        let mut active = self.active.lock().await;
        if active.contains_key(key) {
            debug!(%key, "already subscribed");
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(deliver_loop(
            self.remote.clone(),
            self.store.clone(),
            self.active.clone(),
            key.clone(),
            generation,
        ));
        active.insert(key.clone(), ActiveSubscription { generation, task });
        debug!(%key, generation, "subscribed");
    }

    /// Stop listening for `key` and drop its state store entry. Idempotent.
    pub async fn unsubscribe(&self, key: &EntityKey) {
        let sub = self.active.lock().await.remove(key);
        if let Some(sub) = sub {
            sub.task.abort();
            // Wait for the delivery task to wind down; an in-flight apply
            // landing after the removal would leak a stale entity.
            let _ = sub.task.await;
            self.store.remove(key).await;
            debug!(%key, "unsubscribed");
        }
    }

    /// Release every outstanding subscription. The only blanket teardown; a
    /// partial release would leak both a subscription and a stale entity.
    pub async fn unsubscribe_all(&self) {
        let drained: Vec<(EntityKey, ActiveSubscription)> =
            self.active.lock().await.drain().collect();
        let count = drained.len();
        for (key, sub) in drained {
            sub.task.abort();
            let _ = sub.task.await;
            self.store.remove(&key).await;
        }
        if count > 0 {
            info!(count, "released all subscriptions");
        }
    }

    pub async fn is_subscribed(&self, key: &EntityKey) -> bool {
        self.active.lock().await.contains_key(key)
    }

    pub async fn subscription_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

/// True while (key, generation) is still the registered subscription.
async fn still_registered(
    active: &Mutex<HashMap<EntityKey, ActiveSubscription>>,
    key: &EntityKey,
    generation: u64,
) -> bool {
    active
        .lock()
        .await
        .get(key)
        .map(|sub| sub.generation == generation)
        .unwrap_or(false)
}

/// Per-key delivery loop: subscribe, apply each update, and resubscribe with
/// backoff if the subscription fails or ends while still registered.
async fn deliver_loop(
    remote: Arc<dyn RemoteStore>,
    store: Arc<StateStore>,
    active: Arc<Mutex<HashMap<EntityKey, ActiveSubscription>>>,
    key: EntityKey,
    generation: u64,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let mut rx = match remote.subscribe(&key).await {
            Ok(rx) => {
                backoff = INITIAL_BACKOFF;
                rx
            }
            Err(e) => {
                warn!(%key, error = %e, "subscription failed");
                if !still_registered(&active, &key, generation).await {
                    return;
                }
                sleep_with_jitter(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        while let Some(update) = rx.recv().await {
            // Registration check at apply time, not just at subscribe time.
            if !still_registered(&active, &key, generation).await {
                debug!(%key, "discarding delivery after unsubscribe");
                return;
            }
            store.apply(&key, update).await;
        }

        // Stream ended remotely. Entity stays at last-known value until the
        // resubscribe attempt succeeds.
        if !still_registered(&active, &key, generation).await {
            return;
        }
        warn!(%key, "subscription stream ended, resubscribing");
        sleep_with_jitter(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Sleep for `base` plus up to 25% jitter so resubscribes spread out.
async fn sleep_with_jitter(base: Duration) {
    let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
    tokio::time::sleep(base + jitter).await;
}
