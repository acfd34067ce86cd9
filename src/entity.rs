// Domain entities shared between the listener layer, the state store and the
// annotation reconciler.

use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;

/// The kind of a remote entity. Entity ids are unique within a kind, never
/// across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Event,
    Place,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::User => write!(f, "user"),
            EntityKind::Event => write!(f, "event"),
            EntityKind::Place => write!(f, "place"),
        }
    }
}

/// Stable identity of an entity: (kind, id). The map key for the state store,
/// the listener registry and the annotation set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        EntityKey { kind, id: id.into() }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(EntityKind::User, id)
    }

    pub fn event(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Event, id)
    }

    pub fn place(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Place, id)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A friend as delivered by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntity {
    pub id: String,
    pub display_name: String,
    /// None until the user has shared a position at least once.
    #[serde(default)]
    pub coordinate: Option<Coordinate>,
    /// Currently-active flag (drives the pulse effect on the map marker).
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub image_key: Option<String>,
}

/// A scheduled event with a fixed venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntity {
    pub id: String,
    pub title: String,
    pub coordinate: Coordinate,
    /// Start time, unix seconds.
    pub starts_at: f64,
    #[serde(default)]
    pub image_key: Option<String>,
}

/// A named point of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceEntity {
    pub id: String,
    pub name: String,
    pub coordinate: Coordinate,
    #[serde(default)]
    pub image_key: Option<String>,
}

/// A remote entity, variant over the three kinds the app renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    User(UserEntity),
    Event(EventEntity),
    Place(PlaceEntity),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::User(_) => EntityKind::User,
            Entity::Event(_) => EntityKind::Event,
            Entity::Place(_) => EntityKind::Place,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::User(u) => &u.id,
            Entity::Event(e) => &e.id,
            Entity::Place(p) => &p.id,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.id())
    }

    /// Current coordinate, if the entity has one. Users without a shared
    /// position return None and are not rendered.
    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            Entity::User(u) => u.coordinate,
            Entity::Event(e) => Some(e.coordinate),
            Entity::Place(p) => Some(p.coordinate),
        }
    }

    pub fn image_key(&self) -> Option<&str> {
        match self {
            Entity::User(u) => u.image_key.as_deref(),
            Entity::Event(e) => e.image_key.as_deref(),
            Entity::Place(p) => p.image_key.as_deref(),
        }
    }
}

/// A raw position sample from the platform location source. Ephemeral; never
/// persisted locally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub coordinate: Coordinate,
    /// Unix seconds.
    pub timestamp: f64,
    /// Estimated horizontal accuracy in meters.
    pub accuracy_m: f64,
}

/// The presence record the app writes to the remote store. Always a whole
/// replacement, never a partial patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub coordinate: Coordinate,
    /// Unix seconds.
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> Entity {
        Entity::User(UserEntity {
            id: "u1".to_string(),
            display_name: "Ada".to_string(),
            coordinate: Some(Coordinate::new(40.0, -74.0)),
            active: true,
            image_key: Some("avatars/u1".to_string()),
        })
    }

    #[test]
    fn test_key_is_kind_scoped() {
        let user = sample_user();
        let place = Entity::Place(PlaceEntity {
            id: "u1".to_string(),
            name: "Cafe".to_string(),
            coordinate: Coordinate::new(40.0, -74.0),
            image_key: None,
        });

        // Same id, different kind: different keys.
        assert_ne!(user.key(), place.key());
        assert_eq!(user.key(), EntityKey::user("u1"));
        assert_eq!(user.key().to_string(), "user:u1");
    }

    #[test]
    fn test_unlocated_user_has_no_coordinate() {
        let entity = Entity::User(UserEntity {
            id: "u2".to_string(),
            display_name: "Grace".to_string(),
            coordinate: None,
            active: false,
            image_key: None,
        });
        assert!(entity.coordinate().is_none());
    }

    #[test]
    fn test_entity_serde_tagging() {
        let json = serde_json::to_string(&sample_user()).unwrap();
        assert!(json.contains("\"kind\":\"user\""));

        let back: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample_user());
    }

    #[test]
    fn test_optional_fields_default() {
        // A minimal user payload without coordinate/active/image_key parses.
        let json = r#"{"kind":"user","id":"u3","display_name":"Lin"}"#;
        let entity: Entity = serde_json::from_str(json).unwrap();
        match entity {
            Entity::User(u) => {
                assert!(u.coordinate.is_none());
                assert!(!u.active);
                assert!(u.image_key.is_none());
            }
            other => panic!("unexpected entity: {:?}", other),
        }
    }
}
