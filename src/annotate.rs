// Annotation reconciliation - maps the entity snapshot to the minimal set of
// map-surface mutations.
//
// The surface is only ever touched through add/remove/update deltas; a full
// clear-and-redraw would destroy marker animation state (the active pulse)
// and flicker.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::entity::{Entity, EntityKey};
use crate::geo::Coordinate;

/// Everything a map marker renders from. Derived, disposable; the Entity is
/// the source of truth.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedState {
    pub coordinate: Coordinate,
    pub label: String,
    pub active: bool,
    pub image_key: Option<String>,
}

/// One renderable marker.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRecord {
    pub key: EntityKey,
    pub state: RenderedState,
}

/// Minimal mutation set for one reconciliation pass.
#[derive(Debug, Default)]
pub struct AnnotationDelta {
    pub to_add: Vec<AnnotationRecord>,
    pub to_remove: Vec<EntityKey>,
    pub to_update: Vec<AnnotationRecord>,
}

impl AnnotationDelta {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_update.is_empty()
    }
}

/// The rendering sink. The reconciler is its sole writer; implementations
/// hand mutations to the UI-owning context.
pub trait MapSurface: Send {
    fn add_annotations(&mut self, annotations: Vec<AnnotationRecord>);
    fn remove_annotations(&mut self, keys: Vec<EntityKey>);
    fn update_annotation(&mut self, key: &EntityKey, state: &RenderedState);
}

/// Rendered form of an entity, or None when it has nothing to render at
/// (a User with no shared position is excluded entirely, never drawn at a
/// default coordinate).
pub fn rendered_state(entity: &Entity) -> Option<RenderedState> {
    let coordinate = entity.coordinate()?;
    let (label, active) = match entity {
        Entity::User(u) => (u.display_name.clone(), u.active),
        Entity::Event(e) => (e.title.clone(), false),
        Entity::Place(p) => (p.name.clone(), false),
    };
    Some(RenderedState {
        coordinate,
        label,
        active,
        image_key: entity.image_key().map(|k| k.to_string()),
    })
}

/// Diffs successive snapshots against the applied annotation set.
pub struct AnnotationReconciler {
    applied: HashMap<EntityKey, RenderedState>,
}

impl AnnotationReconciler {
    pub fn new() -> Self {
        AnnotationReconciler { applied: HashMap::new() }
    }

    /// Compute the delta from the applied set to `snapshot` and advance the
    /// applied set. Replay-idempotent: reconciling S1 then S2 leaves the
    /// same applied set as reconciling S2 from empty.
    pub fn reconcile(&mut self, snapshot: &HashMap<EntityKey, Entity>) -> AnnotationDelta {
        let desired: HashMap<EntityKey, RenderedState> = snapshot
            .iter()
            .filter_map(|(key, entity)| rendered_state(entity).map(|s| (key.clone(), s)))
            .collect();

        let mut delta = AnnotationDelta::default();

        for (key, state) in &desired {
            match self.applied.get(key) {
                None => delta.to_add.push(AnnotationRecord {
                    key: key.clone(),
                    state: state.clone(),
                }),
                Some(prev) if prev != state => delta.to_update.push(AnnotationRecord {
                    key: key.clone(),
                    state: state.clone(),
                }),
                Some(_) => {}
            }
        }
        for key in self.applied.keys() {
            if !desired.contains_key(key) {
                delta.to_remove.push(key.clone());
            }
        }

        // Stable order for logs and tests (map iteration order is arbitrary).
        delta.to_add.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        delta.to_remove.sort_by_key(|k| k.to_string());
        delta.to_update.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));

        self.applied = desired;
        delta
    }

    /// Push a delta to the surface. No-op deltas touch nothing.
    pub fn apply(delta: AnnotationDelta, surface: &mut dyn MapSurface) {
        if delta.is_empty() {
            return;
        }
        debug!(
            add = delta.to_add.len(),
            remove = delta.to_remove.len(),
            update = delta.to_update.len(),
            "applying annotation delta"
        );
        if !delta.to_remove.is_empty() {
            surface.remove_annotations(delta.to_remove);
        }
        for record in &delta.to_update {
            surface.update_annotation(&record.key, &record.state);
        }
        if !delta.to_add.is_empty() {
            surface.add_annotations(delta.to_add);
        }
    }

    pub fn annotation_count(&self) -> usize {
        self.applied.len()
    }
}

impl Default for AnnotationReconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Surface that logs mutations instead of drawing. Used by the demo binary.
pub struct LogMapSurface;

impl MapSurface for LogMapSurface {
    fn add_annotations(&mut self, annotations: Vec<AnnotationRecord>) {
        for a in annotations {
            info!(key = %a.key, lat = a.state.coordinate.lat, lon = a.state.coordinate.lon,
                  label = %a.state.label, "+ annotation");
        }
    }

    fn remove_annotations(&mut self, keys: Vec<EntityKey>) {
        for key in keys {
            info!(%key, "- annotation");
        }
    }

    fn update_annotation(&mut self, key: &EntityKey, state: &RenderedState) {
        info!(%key, lat = state.coordinate.lat, lon = state.coordinate.lon,
              active = state.active, "~ annotation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EventEntity, PlaceEntity, UserEntity};

    /// Test surface that maintains the applied set like a real map would.
    #[derive(Default)]
    struct RecordingSurface {
        markers: HashMap<EntityKey, RenderedState>,
    }

    impl MapSurface for RecordingSurface {
        fn add_annotations(&mut self, annotations: Vec<AnnotationRecord>) {
            for a in annotations {
                let prev = self.markers.insert(a.key.clone(), a.state);
                assert!(prev.is_none(), "add for already-present key {}", a.key);
            }
        }

        fn remove_annotations(&mut self, keys: Vec<EntityKey>) {
            for key in keys {
                assert!(self.markers.remove(&key).is_some(), "remove for absent key {}", key);
            }
        }

        fn update_annotation(&mut self, key: &EntityKey, state: &RenderedState) {
            let marker = self.markers.get_mut(key).expect("update for absent key");
            *marker = state.clone();
        }
    }

    fn user(id: &str, coord: Option<(f64, f64)>, active: bool) -> Entity {
        Entity::User(UserEntity {
            id: id.to_string(),
            display_name: id.to_string(),
            coordinate: coord.map(|(lat, lon)| Coordinate::new(lat, lon)),
            active,
            image_key: None,
        })
    }

    fn event(id: &str, lat: f64, starts_at: f64) -> Entity {
        Entity::Event(EventEntity {
            id: id.to_string(),
            title: "Picnic".to_string(),
            coordinate: Coordinate::new(lat, 0.0),
            starts_at,
            image_key: None,
        })
    }

    fn place(id: &str, lat: f64) -> Entity {
        Entity::Place(PlaceEntity {
            id: id.to_string(),
            name: "Cafe".to_string(),
            coordinate: Coordinate::new(lat, 0.0),
            image_key: None,
        })
    }

    fn snapshot(entities: &[Entity]) -> HashMap<EntityKey, Entity> {
        entities.iter().map(|e| (e.key(), e.clone())).collect()
    }

    #[test]
    fn test_first_pass_adds_everything_located() {
        let mut reconciler = AnnotationReconciler::new();
        let snap = snapshot(&[
            user("u1", Some((40.0, -74.0)), false),
            user("u2", None, false), // unlocated, excluded
            event("e1", 41.0, 0.0),
            place("p1", 42.0),
        ]);

        let delta = reconciler.reconcile(&snap);
        assert_eq!(delta.to_add.len(), 3);
        assert!(delta.to_remove.is_empty());
        assert!(delta.to_update.is_empty());
        assert_eq!(reconciler.annotation_count(), 3);
    }

    #[test]
    fn test_moved_entity_is_update_not_readd() {
        let mut reconciler = AnnotationReconciler::new();
        reconciler.reconcile(&snapshot(&[user("u1", Some((40.0, -74.0)), false)]));

        let delta = reconciler.reconcile(&snapshot(&[user("u1", Some((40.1, -74.0)), false)]));
        assert!(delta.to_add.is_empty());
        assert!(delta.to_remove.is_empty());
        assert_eq!(delta.to_update.len(), 1);
        assert_eq!(delta.to_update[0].state.coordinate.lat, 40.1);
    }

    #[test]
    fn test_activity_flip_is_update() {
        let mut reconciler = AnnotationReconciler::new();
        reconciler.reconcile(&snapshot(&[user("u1", Some((40.0, -74.0)), false)]));

        let delta = reconciler.reconcile(&snapshot(&[user("u1", Some((40.0, -74.0)), true)]));
        assert_eq!(delta.to_update.len(), 1);
        assert!(delta.to_update[0].state.active);
    }

    #[test]
    fn test_invisible_field_change_is_no_delta() {
        let mut reconciler = AnnotationReconciler::new();
        reconciler.reconcile(&snapshot(&[event("e1", 41.0, 100.0)]));

        // starts_at is not part of the rendered state.
        let delta = reconciler.reconcile(&snapshot(&[event("e1", 41.0, 200.0)]));
        assert!(delta.is_empty());
    }

    #[test]
    fn test_disappeared_entity_is_removed() {
        let mut reconciler = AnnotationReconciler::new();
        reconciler.reconcile(&snapshot(&[user("u1", Some((40.0, -74.0)), false), place("p1", 42.0)]));

        let delta = reconciler.reconcile(&snapshot(&[place("p1", 42.0)]));
        assert_eq!(delta.to_remove, vec![EntityKey::user("u1")]);
        assert!(delta.to_add.is_empty());
    }

    #[test]
    fn test_user_losing_coordinate_is_removed() {
        let mut reconciler = AnnotationReconciler::new();
        reconciler.reconcile(&snapshot(&[user("u1", Some((40.0, -74.0)), false)]));

        let delta = reconciler.reconcile(&snapshot(&[user("u1", None, false)]));
        assert_eq!(delta.to_remove, vec![EntityKey::user("u1")]);
    }

    #[test]
    fn test_replay_idempotence() {
        let s1 = snapshot(&[
            user("u1", Some((40.0, -74.0)), false),
            event("e1", 41.0, 0.0),
        ]);
        let s2 = snapshot(&[
            user("u1", Some((40.5, -74.0)), true),
            place("p1", 42.0),
        ]);

        // Path A: S1 then S2, applied to a surface.
        let mut surface_a = RecordingSurface::default();
        let mut rec_a = AnnotationReconciler::new();
        AnnotationReconciler::apply(rec_a.reconcile(&s1), &mut surface_a);
        AnnotationReconciler::apply(rec_a.reconcile(&s2), &mut surface_a);

        // Path B: S2 directly from empty.
        let mut surface_b = RecordingSurface::default();
        let mut rec_b = AnnotationReconciler::new();
        AnnotationReconciler::apply(rec_b.reconcile(&s2), &mut surface_b);

        assert_eq!(surface_a.markers, surface_b.markers);
    }

    #[test]
    fn test_same_snapshot_twice_is_empty_delta() {
        let snap = snapshot(&[user("u1", Some((40.0, -74.0)), false), event("e1", 41.0, 0.0)]);
        let mut reconciler = AnnotationReconciler::new();
        reconciler.reconcile(&snap);
        assert!(reconciler.reconcile(&snap).is_empty());
    }
}
