// State store - process-wide authoritative cache of current entities.
//
// Mutated only by listener delivery, read by anyone. Every apply happens
// atomically under the write lock before the change notification goes out,
// so a snapshot taken during reconciliation never observes a half-applied
// update.

use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::entity::{Entity, EntityKey};
use crate::remote::RemoteUpdate;

/// Default epsilon below which a coordinate-only User move is noise, in
/// meters. Steady foot traffic produces a stream of these.
pub const DEFAULT_COORD_EPSILON_M: f64 = 2.0;

/// Capacity of the change broadcast. Consumers that lag past this resync
/// from a fresh snapshot rather than replaying every change.
const CHANGE_BUFFER: usize = 256;

/// A published state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Upserted(EntityKey),
    Removed(EntityKey),
}

/// In-memory entity cache with change broadcast.
pub struct StateStore {
    entities: RwLock<HashMap<EntityKey, Entity>>,
    changes_tx: broadcast::Sender<StateChange>,
    coord_epsilon_m: f64,
}

impl StateStore {
    pub fn new(coord_epsilon_m: f64) -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_BUFFER);
        StateStore {
            entities: RwLock::new(HashMap::new()),
            changes_tx,
            coord_epsilon_m,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes_tx.subscribe()
    }

    /// Apply one delivered update for `key`. Replace-or-insert-or-delete,
    /// last-delivered-wins; the notification, if any, is published after the
    /// map mutation completes.
    pub async fn apply(&self, key: &EntityKey, update: RemoteUpdate) {
        match update {
            RemoteUpdate::Upsert(entity) => {
                if entity.key() != *key {
                    warn!(expected = %key, got = %entity.key(), "mis-keyed delivery discarded");
                    return;
                }

                let mut entities = self.entities.write().await;
                if let Some(prev) = entities.get(key) {
                    if self.is_negligible(prev, &entity) {
                        // Not stored either: the comparison baseline stays
                        // the last published value, so cumulative drift past
                        // epsilon still publishes.
                        debug!(%key, "suppressed negligible update");
                        return;
                    }
                }
                entities.insert(key.clone(), entity);
                drop(entities);

                self.notify(StateChange::Upserted(key.clone()));
            }
            RemoteUpdate::Delete => {
                let removed = self.entities.write().await.remove(key).is_some();
                if removed {
                    self.notify(StateChange::Removed(key.clone()));
                }
            }
        }
    }

    /// Remove an entity outside the delivery path (listener unsubscribe).
    pub async fn remove(&self, key: &EntityKey) {
        self.apply(key, RemoteUpdate::Delete).await;
    }

    /// Consistent point-in-time copy of the full entity map.
    pub async fn snapshot(&self) -> HashMap<EntityKey, Entity> {
        self.entities.read().await.clone()
    }

    pub async fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.entities.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    /// Cheap pre-filter deciding whether an update is worth publishing.
    ///
    /// Structurally identical updates are noise for every kind. Beyond that,
    /// only User entities get the epsilon rule: a sub-epsilon coordinate move
    /// with every other field unchanged is suppressed. This is a pure
    /// comparison; a structurally different update is never dropped.
    fn is_negligible(&self, prev: &Entity, next: &Entity) -> bool {
        if prev == next {
            return true;
        }

        match (prev, next) {
            (Entity::User(a), Entity::User(b)) => {
                let fields_unchanged = a.id == b.id
                    && a.display_name == b.display_name
                    && a.active == b.active
                    && a.image_key == b.image_key;
                match (a.coordinate, b.coordinate) {
                    (Some(ca), Some(cb)) => {
                        fields_unchanged && ca.approx_eq(&cb, self.coord_epsilon_m)
                    }
                    // Gaining or losing a coordinate is structural.
                    _ => false,
                }
            }
            _ => false,
        }
    }

    fn notify(&self, change: StateChange) {
        // No subscribers is fine (e.g. during teardown).
        let _ = self.changes_tx.send(change);
    }
}
