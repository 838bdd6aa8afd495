use glam::{Quat, Vec3};

use crate::authority::{AuthorityResolver, OwnerChange};
use crate::blueprint::{Blueprint, BlueprintDraft, BlueprintRegistry};
use crate::effect::{EffectEnd, EffectHandle, EffectMachine, EffectRecord, EndReason, OnEffectEnd};
use crate::entity::{
    ChangeMask, Entity, EntityObserver, EntityPatch, EntitySpec, EntityStore, StoreChange,
};
use crate::error::{SyncError, SyncResult};
use crate::intent::Intent;
use crate::spatial::SpatialSystem;
use crate::types::{BlueprintId, EntityId, Owner, Role, SessionId, Transform};

/// Everything mutated since the last replication pass.
#[derive(Debug, Default)]
pub struct WorldChanges {
    pub blueprints: Vec<BlueprintId>,
    pub owners: Vec<OwnerChange>,
    pub entities: Vec<StoreChange>,
    pub teleports: Vec<EntityId>,
}

impl WorldChanges {
    pub fn is_empty(&self) -> bool {
        self.blueprints.is_empty()
            && self.owners.is_empty()
            && self.entities.is_empty()
            && self.teleports.is_empty()
    }
}

/// The world context handed to every consumer. Owns the entity store,
/// blueprints, authority and effects; only the tick loop holds it mutably.
pub struct World {
    role: Role,
    local: SessionId,
    tick: u32,
    now_ms: u64,
    store: EntityStore,
    blueprints: BlueprintRegistry,
    authority: AuthorityResolver,
    effects: EffectMachine,
    spatial: Box<dyn SpatialSystem>,
    published: Vec<BlueprintId>,
    teleports: Vec<EntityId>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("role", &self.role)
            .field("local", &self.local)
            .field("tick", &self.tick)
            .field("store", &self.store)
            .field("effects", &self.effects)
            .finish()
    }
}

impl World {
    pub fn new(role: Role, spatial: Box<dyn SpatialSystem>) -> Self {
        Self {
            role,
            local: SessionId::SERVER,
            tick: 0,
            now_ms: 0,
            store: EntityStore::new(),
            blueprints: BlueprintRegistry::new(),
            authority: AuthorityResolver::new(),
            effects: EffectMachine::new(),
            spatial,
            published: Vec::new(),
            teleports: Vec::new(),
        }
    }

    pub fn server(spatial: Box<dyn SpatialSystem>) -> Self {
        Self::new(Role::Server, spatial)
    }

    pub fn client(spatial: Box<dyn SpatialSystem>) -> Self {
        Self::new(Role::Client, spatial)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn local_session(&self) -> SessionId {
        self.local
    }

    pub(crate) fn set_local_session(&mut self, session: SessionId) {
        self.local = session;
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn add_observer(&mut self, observer: Box<dyn EntityObserver>) {
        self.store.add_observer(observer);
    }

    pub fn spatial(&self) -> &dyn SpatialSystem {
        self.spatial.as_ref()
    }

    pub fn spatial_mut(&mut self) -> &mut dyn SpatialSystem {
        self.spatial.as_mut()
    }

    // Reads

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.store.get(id)
    }

    pub fn owner(&self, id: EntityId) -> Option<Owner> {
        self.authority.owner(id)
    }

    pub fn can_author(&self, id: EntityId, session: SessionId) -> bool {
        self.authority.can_author(id, session)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.store.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.store.len()
    }

    pub fn spec_of(&self, id: EntityId) -> Option<EntitySpec> {
        let entity = self.store.get(id)?;
        let owner = self.authority.owner(id).unwrap_or_default();
        Some(entity.to_spec(owner))
    }

    /// Owned copy of every entity, sorted by id. Safe to hand to another thread.
    pub fn snapshot(&self) -> Vec<EntitySpec> {
        let mut ids: Vec<EntityId> = self.store.ids().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.spec_of(id)).collect()
    }

    pub fn blueprints(&self) -> &BlueprintRegistry {
        &self.blueprints
    }

    pub fn owned_by(&self, session: SessionId) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.authority.owned_by(session).collect();
        ids.sort();
        ids
    }

    // Blueprints

    pub fn publish_blueprint(&mut self, draft: BlueprintDraft) -> SyncResult<BlueprintId> {
        let id = self.blueprints.publish(draft)?;
        self.published.push(id);
        Ok(id)
    }

    pub fn republish_blueprint(
        &mut self,
        previous: BlueprintId,
        draft: BlueprintDraft,
    ) -> SyncResult<BlueprintId> {
        let id = self.blueprints.republish(previous, draft)?;
        self.published.push(id);
        Ok(id)
    }

    // Authoritative mutation. Callers have already passed the authority gate.

    pub fn add_entity(&mut self, spec: EntitySpec, broadcast: bool) -> SyncResult<EntityId> {
        if spec.player.as_ref().is_some_and(|p| p.effect.is_some()) {
            return Err(SyncError::validation(
                "effects are installed through apply_effect",
            ));
        }
        self.insert_entity(&spec, broadcast)
    }

    pub fn modify_entity(&mut self, id: EntityId, patch: &EntityPatch) -> SyncResult<ChangeMask> {
        if patch.effect.is_some() {
            return Err(SyncError::validation(
                "effects are installed through apply_effect",
            ));
        }
        self.write(id, patch, true)
    }

    /// Applies one sample of an author's continuous transform stream.
    pub fn apply_transform(&mut self, id: EntityId, transform: &Transform) -> SyncResult<ChangeMask> {
        self.check_movement(id, Some(transform.position))?;
        self.write(id, &EntityPatch::transform(*transform), true)
    }

    /// Rejects a position change on a player whose effect locks movement.
    pub fn check_movement(&self, id: EntityId, position: Option<Vec3>) -> SyncResult<()> {
        let entity = self.store.get(id).ok_or(SyncError::NotFound(id))?;
        let locked = entity
            .player
            .as_ref()
            .and_then(|p| p.effect.as_ref())
            .is_some_and(EffectRecord::locks_movement);
        if locked && position.is_some_and(|p| p != entity.transform.position) {
            return Err(SyncError::validation(format!("movement of {} is locked", id)));
        }
        Ok(())
    }

    /// Limits on intents a client originates. Health only changes through
    /// server-authored damage, and a movement lock holds against modify and
    /// teleport as well as the transform stream.
    pub fn check_client_intent(&self, intent: &Intent) -> SyncResult<()> {
        match intent {
            Intent::Modify { id, patch } => {
                if patch.touches().intersects(ChangeMask::HEALTH) {
                    return Err(SyncError::validation("health is changed through damage"));
                }
                self.check_movement(*id, patch.position)
            }
            Intent::Teleport { id, position, .. } => self.check_movement(*id, Some(*position)),
            _ => Ok(()),
        }
    }

    pub fn teleport(&mut self, id: EntityId, position: Vec3, rotation_y: Option<f32>) -> SyncResult<()> {
        let patch = EntityPatch {
            position: Some(position),
            rotation: rotation_y.map(Quat::from_rotation_y),
            ..Default::default()
        };
        self.write(id, &patch, true)?;
        if !self.teleports.contains(&id) {
            self.teleports.push(id);
        }
        Ok(())
    }

    /// Returns the remaining health.
    pub fn damage(&mut self, id: EntityId, amount: u8) -> SyncResult<u8> {
        let entity = self.store.get(id).ok_or(SyncError::NotFound(id))?;
        let player = entity
            .player
            .as_ref()
            .ok_or_else(|| SyncError::validation(format!("entity {} is not a player", id)))?;
        let health = player.health.saturating_sub(amount);
        self.write(id, &EntityPatch::health(health), true)?;
        Ok(health)
    }

    /// Destroys an entity and everything tied to it. No-op when absent.
    pub fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
        if !self.store.contains(id) {
            return None;
        }

        self.effects.end_for(id, EndReason::EntityRemoved);
        for player in self.effects.anchored_to(id) {
            if let Some(end) = self.effects.end_for(player, EndReason::EntityRemoved) {
                self.clear_effect(&end);
            }
        }

        self.teleports.retain(|t| *t != id);
        self.authority.deregister(id);
        self.spatial.forget(id);
        self.store.remove(id, true)
    }

    // Ownership

    pub fn claim(&mut self, id: EntityId, session: SessionId) -> SyncResult<()> {
        if !self.store.contains(id) {
            return Err(SyncError::NotFound(id));
        }
        self.authority.claim(id, session)
    }

    pub fn release(&mut self, id: EntityId, session: SessionId) {
        self.authority.release(id, session);
    }

    pub fn transfer_on_disconnect(&mut self, session: SessionId) -> Vec<EntityId> {
        self.authority.transfer_on_disconnect(session)
    }

    // Effects

    pub fn apply_effect(
        &mut self,
        player: EntityId,
        effect: EffectRecord,
        on_end: Option<OnEffectEnd>,
    ) -> SyncResult<EffectHandle> {
        let entity = self.store.get(player).ok_or(SyncError::NotFound(player))?;
        if !entity.is_player() {
            return Err(SyncError::validation(format!(
                "entity {} is not a player",
                player
            )));
        }
        if effect.anchor_id.is_some_and(|anchor| !self.store.contains(anchor)) {
            return Err(SyncError::validation("effect anchor does not exist"));
        }

        let (handle, _superseded) = self.effects.apply(player, effect, self.now_ms, on_end);
        let installed = self
            .effects
            .current(player)
            .map(|(_, record)| record.clone());

        let patch = EntityPatch {
            effect: Some(installed),
            ..Default::default()
        };
        let broadcast = self.is_server();
        self.write(player, &patch, broadcast)?;
        Ok(handle)
    }

    pub fn effect_active(&self, handle: EffectHandle) -> bool {
        self.effects.is_active(handle)
    }

    pub fn current_effect(&self, player: EntityId) -> Option<(EffectHandle, &EffectRecord)> {
        self.effects.current(player)
    }

    /// Cancels through a handle; stale handles do nothing.
    pub fn cancel_effect(&mut self, handle: EffectHandle) -> bool {
        match self.effects.cancel(handle) {
            Some(end) => {
                self.clear_effect(&end);
                true
            }
            None => false,
        }
    }

    /// Cancel requested by a session. Clients may only cancel cancellable
    /// effects; the server may cancel anything.
    pub fn cancel_player_effect(&mut self, player: EntityId, origin: SessionId) -> SyncResult<bool> {
        if !self.store.contains(player) {
            return Err(SyncError::NotFound(player));
        }
        let Some((handle, record)) = self.effects.current(player) else {
            return Ok(false);
        };
        if !origin.is_server() && !record.cancellable {
            return Err(SyncError::validation("effect is not cancellable"));
        }
        Ok(self.cancel_effect(handle))
    }

    // Tick

    /// Moves the clock, expires due effects and pulls transforms the server
    /// authors from the spatial system.
    pub fn advance(&mut self, tick: u32, now_ms: u64) {
        self.tick = tick;
        self.now_ms = now_ms;

        if !self.is_server() {
            return;
        }

        for end in self.effects.expire(now_ms) {
            self.clear_effect(&end);
        }

        for id in self.owned_by(SessionId::SERVER) {
            let Some(transform) = self.spatial.read_transform(id) else {
                continue;
            };
            let current = self.store.get(id).map(|e| e.transform);
            if current != Some(transform) {
                if let Err(e) = self.write(id, &EntityPatch::transform(transform), true) {
                    log::warn!("spatial transform for {} rejected: {}", id, e);
                }
            }
        }
    }

    pub fn drain_changes(&mut self) -> WorldChanges {
        WorldChanges {
            blueprints: std::mem::take(&mut self.published),
            owners: self.authority.drain_changes(),
            entities: self.store.drain_changes(),
            teleports: std::mem::take(&mut self.teleports),
        }
    }

    // Replicated state from the server, applied on clients.

    pub(crate) fn apply_replicated_blueprint(&mut self, blueprint: Blueprint) {
        self.blueprints.insert(blueprint);
    }

    pub(crate) fn apply_replicated_add(&mut self, spec: &EntitySpec) -> SyncResult<EntityId> {
        if let Some(id) = spec.id {
            self.apply_replicated_remove(id);
        }
        self.insert_entity(spec, false)
    }

    pub(crate) fn apply_replicated_patch(
        &mut self,
        id: EntityId,
        patch: &EntityPatch,
    ) -> SyncResult<ChangeMask> {
        self.write(id, patch, false)
    }

    pub(crate) fn apply_replicated_owner(&mut self, id: EntityId, owner: Owner) {
        self.authority.assign_replicated(id, owner);
    }

    pub(crate) fn apply_replicated_remove(&mut self, id: EntityId) {
        if self.store.remove(id, false).is_some() {
            self.authority.deregister(id);
            self.spatial.forget(id);
        }
    }

    fn insert_entity(&mut self, spec: &EntitySpec, broadcast: bool) -> SyncResult<EntityId> {
        let id = self.store.add(spec, broadcast, &self.blueprints)?;
        self.authority.register(id, spec.owner);
        self.spatial.apply_transform(id, &spec.transform);
        Ok(id)
    }

    fn write(&mut self, id: EntityId, patch: &EntityPatch, broadcast: bool) -> SyncResult<ChangeMask> {
        let changes = self.store.modify(id, patch, broadcast)?;
        if changes.intersects(ChangeMask::TRANSFORM) {
            if let Some(entity) = self.store.get(id) {
                self.spatial.apply_transform(id, &entity.transform);
            }
        }
        Ok(changes)
    }

    /// Clears the player's effect field. Only the server originates the
    /// authoritative clear.
    fn clear_effect(&mut self, end: &EffectEnd) {
        if !self.is_server() {
            return;
        }
        let player = end.handle.player;
        let patch = EntityPatch {
            effect: Some(None),
            ..Default::default()
        };
        if let Err(e) = self.write(player, &patch, true) {
            log::debug!("effect clear on {} skipped: {}", player, e);
        }
    }
}
