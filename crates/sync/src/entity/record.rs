use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::effect::EffectRecord;
use crate::error::SyncError;
use crate::types::{BlueprintId, CustomData, EntityId, Owner, Transform};

pub const MAX_HEALTH: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityKind {
    App = 0,
    Model = 1,
    Player = 2,
}

impl TryFrom<u8> for EntityKind {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::App),
            1 => Ok(Self::Model),
            2 => Ok(Self::Player),
            other => Err(SyncError::validation(format!("unknown entity type {}", other))),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MovementFlags: u16 {
        const GROUNDED = 1 << 0;
        const SPRINTING = 1 << 1;
        const CROUCHING = 1 << 2;
        const FLYING = 1 << 3;
        const LOCKED = 1 << 4;
    }
}

/// Player-only state. `effect` is written exclusively by the effect machine
/// (or by replication of its output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub health: u8,
    pub effect: Option<EffectRecord>,
    pub movement_flags: MovementFlags,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            health: MAX_HEALTH,
            effect: None,
            movement_flags: MovementFlags::GROUNDED,
        }
    }
}

impl PlayerState {
    pub fn set_health(&mut self, health: u8) {
        self.health = health.min(MAX_HEALTH);
    }

    pub fn take_damage(&mut self, amount: u8) {
        self.health = self.health.saturating_sub(amount);
    }

    pub fn is_dead(&self) -> bool {
        self.health == 0
    }
}

/// Everything needed to create an entity, and the full-state view of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub id: Option<EntityId>,
    pub kind: EntityKind,
    pub blueprint_id: Option<BlueprintId>,
    pub owner: Owner,
    pub transform: Transform,
    pub custom: CustomData,
    pub player: Option<PlayerState>,
}

impl EntitySpec {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            id: None,
            kind,
            blueprint_id: None,
            owner: Owner::Server,
            transform: Transform::default(),
            custom: CustomData::new(),
            player: (kind == EntityKind::Player).then(PlayerState::default),
        }
    }

    pub fn app(blueprint_id: BlueprintId) -> Self {
        Self {
            blueprint_id: Some(blueprint_id),
            ..Self::new(EntityKind::App)
        }
    }

    pub fn player(owner: Owner, transform: Transform) -> Self {
        Self {
            owner,
            transform,
            ..Self::new(EntityKind::Player)
        }
    }

    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: crate::types::DataValue) -> Self {
        self.custom.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub blueprint_id: Option<BlueprintId>,
    pub transform: Transform,
    pub custom: CustomData,
    pub player: Option<PlayerState>,
}

impl Entity {
    pub fn is_player(&self) -> bool {
        self.kind == EntityKind::Player
    }

    pub fn to_spec(&self, owner: Owner) -> EntitySpec {
        EntitySpec {
            id: Some(self.id),
            kind: self.kind,
            blueprint_id: self.blueprint_id,
            owner,
            transform: self.transform,
            custom: self.custom.clone(),
            player: self.player.clone(),
        }
    }
}
