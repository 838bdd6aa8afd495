use std::collections::BTreeMap;

use bitflags::bitflags;
use glam::{Quat, Vec3};

use crate::effect::EffectRecord;
use crate::error::{SyncError, SyncResult};
use crate::types::{DataValue, Transform};

use super::record::{Entity, MovementFlags};

bitflags! {
    /// Fields touched by a modify. Drives minimal replication patches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangeMask: u16 {
        const POSITION = 1 << 0;
        const ROTATION = 1 << 1;
        const SCALE = 1 << 2;
        const CUSTOM = 1 << 3;
        const HEALTH = 1 << 4;
        const EFFECT = 1 << 5;
        const MOVEMENT = 1 << 6;

        const TRANSFORM = Self::POSITION.bits() | Self::ROTATION.bits() | Self::SCALE.bits();
        const PLAYER = Self::HEALTH.bits() | Self::EFFECT.bits() | Self::MOVEMENT.bits();
    }
}

/// Partial update of an entity. `None` leaves a field untouched. A `None`
/// value in `custom` deletes that key. With `replace_custom` set, keys absent
/// from `custom` are deleted as well.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub position: Option<Vec3>,
    pub rotation: Option<Quat>,
    pub scale: Option<Vec3>,
    pub custom: BTreeMap<String, Option<DataValue>>,
    pub replace_custom: bool,
    pub health: Option<u8>,
    pub movement_flags: Option<MovementFlags>,
    pub effect: Option<Option<EffectRecord>>,
}

impl EntityPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(transform: Transform) -> Self {
        Self {
            position: Some(transform.position),
            rotation: Some(transform.rotation),
            scale: Some(transform.scale),
            ..Default::default()
        }
    }

    pub fn position(position: Vec3) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn health(health: u8) -> Self {
        Self {
            health: Some(health),
            ..Default::default()
        }
    }

    pub fn set_custom(mut self, key: impl Into<String>, value: DataValue) -> Self {
        self.custom.insert(key.into(), Some(value));
        self
    }

    pub fn remove_custom(mut self, key: impl Into<String>) -> Self {
        self.custom.insert(key.into(), None);
        self
    }

    /// Builds the smallest patch that carries `mask` from the current state.
    pub fn from_entity(entity: &Entity, mask: ChangeMask) -> Self {
        let mut patch = Self::new();
        if mask.contains(ChangeMask::POSITION) {
            patch.position = Some(entity.transform.position);
        }
        if mask.contains(ChangeMask::ROTATION) {
            patch.rotation = Some(entity.transform.rotation);
        }
        if mask.contains(ChangeMask::SCALE) {
            patch.scale = Some(entity.transform.scale);
        }
        if mask.contains(ChangeMask::CUSTOM) {
            patch.custom = entity
                .custom
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect();
            patch.replace_custom = true;
        }
        if let Some(player) = &entity.player {
            if mask.contains(ChangeMask::HEALTH) {
                patch.health = Some(player.health);
            }
            if mask.contains(ChangeMask::MOVEMENT) {
                patch.movement_flags = Some(player.movement_flags);
            }
            if mask.contains(ChangeMask::EFFECT) {
                patch.effect = Some(player.effect.clone());
            }
        }
        patch
    }

    /// Fields this patch would touch, regardless of whether values differ.
    pub fn touches(&self) -> ChangeMask {
        let mut mask = ChangeMask::empty();
        mask.set(ChangeMask::POSITION, self.position.is_some());
        mask.set(ChangeMask::ROTATION, self.rotation.is_some());
        mask.set(ChangeMask::SCALE, self.scale.is_some());
        mask.set(
            ChangeMask::CUSTOM,
            self.replace_custom || !self.custom.is_empty(),
        );
        mask.set(ChangeMask::HEALTH, self.health.is_some());
        mask.set(ChangeMask::MOVEMENT, self.movement_flags.is_some());
        mask.set(ChangeMask::EFFECT, self.effect.is_some());
        mask
    }

    pub fn is_empty(&self) -> bool {
        self.touches().is_empty()
    }

    /// Splits off the transform fields, leaving everything else behind.
    pub fn take_transform(&mut self) -> EntityPatch {
        EntityPatch {
            position: self.position.take(),
            rotation: self.rotation.take(),
            scale: self.scale.take(),
            ..Default::default()
        }
    }

    pub(crate) fn validate_for(&self, entity: &Entity) -> SyncResult<()> {
        if !entity.is_player() && self.touches().intersects(ChangeMask::PLAYER) {
            return Err(SyncError::validation(format!(
                "entity {} is not a player",
                entity.id
            )));
        }
        let finite = |v: Vec3| v.is_finite();
        if self.position.is_some_and(|p| !finite(p))
            || self.scale.is_some_and(|s| !finite(s))
            || self
                .rotation
                .is_some_and(|r| !r.is_finite() || r.length_squared() < 1e-6)
        {
            return Err(SyncError::validation("non-finite transform"));
        }
        Ok(())
    }

    /// Merges into `entity` and reports the fields whose value actually changed.
    pub(crate) fn apply_to(&self, entity: &mut Entity) -> SyncResult<ChangeMask> {
        self.validate_for(entity)?;

        let mut changed = ChangeMask::empty();

        if let Some(position) = self.position {
            changed.set(ChangeMask::POSITION, entity.transform.position != position);
            entity.transform.position = position;
        }
        if let Some(rotation) = self.rotation {
            let rotation = rotation.normalize();
            changed.set(ChangeMask::ROTATION, entity.transform.rotation != rotation);
            entity.transform.rotation = rotation;
        }
        if let Some(scale) = self.scale {
            changed.set(ChangeMask::SCALE, entity.transform.scale != scale);
            entity.transform.scale = scale;
        }

        if self.replace_custom {
            let before = entity.custom.len();
            entity
                .custom
                .retain(|key, _| self.custom.get(key).is_some_and(Option::is_some));
            if entity.custom.len() != before {
                changed |= ChangeMask::CUSTOM;
            }
        }
        for (key, value) in &self.custom {
            let previous = match value {
                Some(value) => entity.custom.insert(key.clone(), value.clone()),
                None => entity.custom.remove(key),
            };
            if previous.as_ref() != value.as_ref() {
                changed |= ChangeMask::CUSTOM;
            }
        }

        if let Some(player) = entity.player.as_mut() {
            if let Some(health) = self.health {
                let before = player.health;
                player.set_health(health);
                changed.set(ChangeMask::HEALTH, before != player.health);
            }
            if let Some(flags) = self.movement_flags {
                changed.set(ChangeMask::MOVEMENT, player.movement_flags != flags);
                player.movement_flags = flags;
            }
            if let Some(effect) = &self.effect {
                changed.set(ChangeMask::EFFECT, &player.effect != effect);
                player.effect = effect.clone();
            }
        }

        Ok(changed)
    }
}
