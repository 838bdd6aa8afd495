use std::collections::HashMap;

use crate::blueprint::BlueprintRegistry;
use crate::error::{SyncError, SyncResult};
use crate::types::EntityId;

use super::patch::{ChangeMask, EntityPatch};
use super::record::{Entity, EntityKind, EntitySpec, PlayerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEvent {
    Added { id: EntityId, kind: EntityKind },
    Removed { id: EntityId },
    Modified { id: EntityId, changes: ChangeMask },
}

/// Read-only observer of store lifecycle events.
pub trait EntityObserver: Send {
    fn on_entity_event(&mut self, event: &EntityEvent);
}

/// Journal entry consumed by the replication loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChange {
    pub event: EntityEvent,
    pub broadcast: bool,
}

#[derive(Default)]
pub struct EntityStore {
    entities: HashMap<EntityId, Entity>,
    observers: Vec<Box<dyn EntityObserver>>,
    journal: Vec<StoreChange>,
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("entities", &self.entities.len())
            .field("observers", &self.observers.len())
            .field("journal", &self.journal.len())
            .finish()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&mut self, observer: Box<dyn EntityObserver>) {
        self.observers.push(observer);
    }

    /// Inserts a new entity. The owner in `spec` is not stored here; it
    /// belongs to the authority resolver.
    pub fn add(
        &mut self,
        spec: &EntitySpec,
        broadcast: bool,
        blueprints: &BlueprintRegistry,
    ) -> SyncResult<EntityId> {
        match (spec.kind, spec.blueprint_id) {
            (EntityKind::App, None) => {
                return Err(SyncError::validation("app entities require a blueprint"));
            }
            (_, Some(blueprint)) if !blueprints.contains(blueprint) => {
                return Err(SyncError::validation(format!(
                    "blueprint {} does not resolve",
                    blueprint
                )));
            }
            _ => {}
        }

        let player = match (spec.kind, &spec.player) {
            (EntityKind::Player, Some(state)) => {
                let mut state = state.clone();
                state.set_health(state.health);
                Some(state)
            }
            (EntityKind::Player, None) => Some(PlayerState::default()),
            (_, Some(_)) => {
                return Err(SyncError::validation("player state on a non-player entity"));
            }
            (_, None) => None,
        };

        let id = spec.id.unwrap_or_default();
        if self.entities.contains_key(&id) {
            return Err(SyncError::validation(format!("entity {} already exists", id)));
        }

        let entity = Entity {
            id,
            kind: spec.kind,
            blueprint_id: spec.blueprint_id,
            transform: spec.transform,
            custom: spec.custom.clone(),
            player,
        };
        EntityPatch::transform(entity.transform).validate_for(&entity)?;

        self.entities.insert(id, entity);
        self.record(
            EntityEvent::Added {
                id,
                kind: spec.kind,
            },
            broadcast,
        );
        Ok(id)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Merges `patch`. Ownership is checked by the caller before this runs.
    pub fn modify(
        &mut self,
        id: EntityId,
        patch: &EntityPatch,
        broadcast: bool,
    ) -> SyncResult<ChangeMask> {
        let entity = self.entities.get_mut(&id).ok_or(SyncError::NotFound(id))?;
        let changes = patch.apply_to(entity)?;
        if !changes.is_empty() {
            self.record(EntityEvent::Modified { id, changes }, broadcast);
        }
        Ok(changes)
    }

    /// Idempotent: removing an absent id is a no-op.
    pub fn remove(&mut self, id: EntityId, broadcast: bool) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        self.record(EntityEvent::Removed { id }, broadcast);
        Some(entity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn drain_changes(&mut self) -> Vec<StoreChange> {
        std::mem::take(&mut self.journal)
    }

    fn record(&mut self, event: EntityEvent, broadcast: bool) {
        for observer in &mut self.observers {
            observer.on_entity_event(&event);
        }
        self.journal.push(StoreChange { event, broadcast });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use glam::Vec3;

    use super::*;
    use crate::blueprint::BlueprintDraft;
    use crate::types::BlueprintId;

    struct Recorder(Arc<Mutex<Vec<EntityEvent>>>);

    impl EntityObserver for Recorder {
        fn on_entity_event(&mut self, event: &EntityEvent) {
            self.0.lock().unwrap().push(*event);
        }
    }

    #[test]
    fn add_validates_blueprint() {
        let mut store = EntityStore::new();
        let mut blueprints = BlueprintRegistry::new();

        let err = store
            .add(&EntitySpec::app(BlueprintId::new()), true, &blueprints)
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = store
            .add(&EntitySpec::new(EntityKind::App), true, &blueprints)
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let blueprint = blueprints.publish(BlueprintDraft::new("chair")).unwrap();
        let id = store
            .add(&EntitySpec::app(blueprint), true, &blueprints)
            .unwrap();
        assert_eq!(store.get(id).unwrap().blueprint_id, Some(blueprint));
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut store = EntityStore::new();
        let blueprints = BlueprintRegistry::new();
        let id = EntityId::new();
        let spec = EntitySpec::new(EntityKind::Model).with_id(id);

        store.add(&spec, false, &blueprints).unwrap();
        assert!(store.add(&spec, false, &blueprints).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn modify_missing_is_not_found() {
        let mut store = EntityStore::new();
        let id = EntityId::new();
        let err = store
            .modify(id, &EntityPatch::position(Vec3::X), true)
            .unwrap_err();
        assert_eq!(err, SyncError::NotFound(id));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = EntityStore::new();
        let blueprints = BlueprintRegistry::new();
        let id = store
            .add(&EntitySpec::new(EntityKind::Model), true, &blueprints)
            .unwrap();

        assert!(store.remove(id, true).is_some());
        assert!(store.remove(id, true).is_none());
        assert_eq!(store.drain_changes().len(), 2);
    }

    #[test]
    fn observers_see_typed_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut store = EntityStore::new();
        store.add_observer(Box::new(Recorder(Arc::clone(&events))));
        let blueprints = BlueprintRegistry::new();

        let id = store
            .add(&EntitySpec::new(EntityKind::Model), true, &blueprints)
            .unwrap();
        store
            .modify(id, &EntityPatch::position(Vec3::Y), true)
            .unwrap();
        store
            .modify(id, &EntityPatch::position(Vec3::Y), true)
            .unwrap();
        store.remove(id, false);

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                EntityEvent::Added {
                    id,
                    kind: EntityKind::Model
                },
                EntityEvent::Modified {
                    id,
                    changes: ChangeMask::POSITION
                },
                EntityEvent::Removed { id },
            ]
        );
    }
}
