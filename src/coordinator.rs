// Coordinator - top level glue between the listener registry, state store,
// image cache and annotation reconciliation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::annotate::{AnnotationDelta, AnnotationReconciler, MapSurface};
use crate::cache::ImageCache;
use crate::entity::EntityKey;
use crate::listener::ListenerRegistry;
use crate::remote::RemoteStore;
use crate::store::StateStore;

/// Top-level object connecting the remote boundary to the map surface.
pub struct Coordinator {
    store: Arc<StateStore>,
    registry: ListenerRegistry,
    cache: Arc<ImageCache>,
    reconciler: Mutex<AnnotationReconciler>,
    surface: Mutex<Box<dyn MapSurface>>,

    /// Status log interval in seconds. <= 0 = disabled.
    status_interval_secs: i32,
}

impl Coordinator {
    /// Create a coordinator with defaults and no status logging (for tests).
    pub fn new(remote: Arc<dyn RemoteStore>, surface: Box<dyn MapSurface>) -> Self {
        Self::new_with_status(
            remote,
            surface,
            -1,
            crate::store::DEFAULT_COORD_EPSILON_M,
            crate::cache::DEFAULT_MAX_ENTRIES,
            crate::cache::DEFAULT_MAX_BYTES,
        )
    }

    /// Create a coordinator with explicit tuning (for production). When
    /// `status_interval > 0`, logs a status line every that many seconds.
    pub fn new_with_status(
        remote: Arc<dyn RemoteStore>,
        surface: Box<dyn MapSurface>,
        status_interval: i32,
        coord_epsilon_m: f64,
        cache_max_entries: usize,
        cache_max_bytes: usize,
    ) -> Self {
        let store = Arc::new(StateStore::new(coord_epsilon_m));
        let registry = ListenerRegistry::new(remote.clone(), store.clone());
        let cache = Arc::new(ImageCache::new(remote, cache_max_entries, cache_max_bytes));
        Coordinator {
            store,
            registry,
            cache,
            reconciler: Mutex::new(AnnotationReconciler::new()),
            surface: Mutex::new(surface),
            status_interval_secs: status_interval,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Start rendering an entity: subscribe its remote listener. Idempotent.
    pub async fn track(&self, key: &EntityKey) {
        self.registry.subscribe(key).await;
    }

    /// Stop rendering an entity. Its marker disappears on the next pass.
    pub async fn untrack(&self, key: &EntityKey) {
        self.registry.unsubscribe(key).await;
    }

    /// Main loop: consume state changes, reconcile, and log status. Runs
    /// until aborted; spawn it on its own task.
    pub async fn run(&self) {
        let mut changes = self.store.subscribe_changes();
        let status_period = if self.status_interval_secs > 0 {
            Duration::from_secs(self.status_interval_secs as u64)
        } else {
            // Effectively disabled; the guard below never fires.
            Duration::from_secs(3600)
        };
        let mut status_timer = tokio::time::interval(status_period);
        status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        status_timer.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                change = changes.recv() => {
                    match change {
                        Ok(_) => {
                            // Coalesce whatever else is already queued into
                            // one reconciliation pass.
                            while changes.try_recv().is_ok() {}
                            self.reconcile_now().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "change stream lagged, resyncing from snapshot");
                            self.reconcile_now().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = status_timer.tick(), if self.status_interval_secs > 0 => {
                    self.log_status().await;
                }
            }
        }
    }

    /// One reconciliation pass: snapshot, diff, warm images, apply.
    pub async fn reconcile_now(&self) {
        let snapshot = self.store.snapshot().await;

        let delta = {
            let mut reconciler = self.reconciler.lock().await;
            reconciler.reconcile(&snapshot)
        };
        if delta.is_empty() {
            return;
        }

        self.warm_images(&delta);

        let mut surface = self.surface.lock().await;
        AnnotationReconciler::apply(delta, surface.as_mut());
    }

    /// Platform memory-pressure signal.
    pub async fn memory_pressure(&self) {
        self.cache.evict_under_pressure().await;
    }

    /// Release every subscription. The only safe teardown path.
    pub async fn shutdown(&self) {
        self.registry.unsubscribe_all().await;
    }

    pub async fn subscription_count(&self) -> usize {
        self.registry.subscription_count().await
    }

    /// Kick off background fetches for images the new/changed markers
    /// reference, so profile imagery is warm by the time the marker renders.
    /// The cache single-flights duplicates.
    fn warm_images(&self, delta: &AnnotationDelta) {
        let keys: std::collections::HashSet<String> = delta
            .to_add
            .iter()
            .chain(delta.to_update.iter())
            .filter_map(|record| record.state.image_key.clone())
            .collect();
        for key in keys {
            let cache = self.cache.clone();
            tokio::spawn(async move {
                // Failures are already logged at the cache/remote layer; a
                // cold marker just renders without imagery until retry.
                let _ = cache.fetch(&key).await;
            });
        }
    }

    async fn log_status(&self) {
        let entities = self.store.len().await;
        let annotations = self.reconciler.lock().await.annotation_count();
        let subscriptions = self.registry.subscription_count().await;
        let cache = self.cache.stats().await;
        info!(
            "Status: {} subscriptions, {} entities, {} annotations, cache {}/{} bytes ({} hits, {} misses, {} evictions)",
            subscriptions, entities, annotations,
            cache.entries, cache.total_bytes, cache.hits, cache.misses, cache.evictions,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::{AnnotationRecord, RenderedState};
    use crate::entity::{Entity, UserEntity};
    use crate::geo::Coordinate;
    use crate::remote::MemoryRemoteStore;
    use std::collections::HashMap;

    /// Surface whose applied set is observable from the test body.
    #[derive(Clone, Default)]
    struct SharedSurface {
        markers: Arc<std::sync::Mutex<HashMap<EntityKey, RenderedState>>>,
    }

    impl MapSurface for SharedSurface {
        fn add_annotations(&mut self, annotations: Vec<AnnotationRecord>) {
            let mut markers = self.markers.lock().unwrap();
            for a in annotations {
                markers.insert(a.key, a.state);
            }
        }

        fn remove_annotations(&mut self, keys: Vec<EntityKey>) {
            let mut markers = self.markers.lock().unwrap();
            for key in keys {
                markers.remove(&key);
            }
        }

        fn update_annotation(&mut self, key: &EntityKey, state: &RenderedState) {
            self.markers.lock().unwrap().insert(key.clone(), state.clone());
        }
    }

    fn user(id: &str, lat: f64, image_key: Option<&str>) -> Entity {
        Entity::User(UserEntity {
            id: id.to_string(),
            display_name: id.to_string(),
            coordinate: Some(Coordinate::new(lat, 0.0)),
            active: false,
            image_key: image_key.map(|k| k.to_string()),
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn test_remote_change_flows_to_surface() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let surface = SharedSurface::default();
        let markers = surface.markers.clone();
        let coordinator = Arc::new(Coordinator::new(remote.clone(), Box::new(surface)));

        let runner = coordinator.clone();
        let run_task = tokio::spawn(async move { runner.run().await });

        let key = EntityKey::user("u1");
        remote.upsert(user("u1", 40.0, None)).await;
        coordinator.track(&key).await;
        settle().await;
        assert!(markers.lock().unwrap().contains_key(&key));

        remote.delete(&key).await;
        settle().await;
        assert!(!markers.lock().unwrap().contains_key(&key));

        run_task.abort();
    }

    #[tokio::test]
    async fn test_shutdown_clears_surface_and_subscriptions() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let surface = SharedSurface::default();
        let markers = surface.markers.clone();
        let coordinator = Arc::new(Coordinator::new(remote.clone(), Box::new(surface)));

        let runner = coordinator.clone();
        let run_task = tokio::spawn(async move { runner.run().await });

        for id in ["u1", "u2"] {
            remote.upsert(user(id, 40.0, None)).await;
            coordinator.track(&EntityKey::user(id)).await;
        }
        settle().await;
        assert_eq!(markers.lock().unwrap().len(), 2);

        coordinator.shutdown().await;
        settle().await;
        assert_eq!(coordinator.subscription_count().await, 0);
        assert!(markers.lock().unwrap().is_empty());

        run_task.abort();
    }

    #[tokio::test]
    async fn test_new_marker_warms_image_cache() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.put_image("avatars/u1", vec![1, 2, 3]).await;
        let coordinator =
            Arc::new(Coordinator::new(remote.clone(), Box::new(SharedSurface::default())));

        let runner = coordinator.clone();
        let run_task = tokio::spawn(async move { runner.run().await });

        remote.upsert(user("u1", 40.0, Some("avatars/u1"))).await;
        coordinator.track(&EntityKey::user("u1")).await;
        settle().await;

        // The avatar was prefetched without any explicit cache call.
        assert!(coordinator.cache().get("avatars/u1").await.is_some());

        run_task.abort();
    }

    #[tokio::test]
    async fn test_memory_pressure_empties_cache() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let coordinator = Coordinator::new(remote, Box::new(SharedSurface::default()));

        coordinator.cache().put("a", vec![0u8; 8]).await;
        coordinator.memory_pressure().await;
        assert!(coordinator.cache().is_empty().await);
    }
}
