use glam::Vec3;

use crate::effect::EffectRecord;
use crate::entity::{EntityPatch, EntitySpec};
use crate::types::EntityId;

/// A request to change the world, from the local simulation, UI code, or a
/// remote session.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Add(EntitySpec),
    Modify {
        id: EntityId,
        patch: EntityPatch,
    },
    Remove {
        id: EntityId,
    },
    Teleport {
        id: EntityId,
        position: Vec3,
        rotation_y: Option<f32>,
    },
    ApplyEffect {
        player: EntityId,
        effect: EffectRecord,
    },
    CancelEffect {
        player: EntityId,
    },
    Damage {
        target: EntityId,
        amount: u8,
    },
    Claim {
        id: EntityId,
    },
    Release {
        id: EntityId,
    },
}

/// How an intent is gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentClass {
    /// Follows the ownership routing table.
    Routed,
    /// Health and effects: only the server decides.
    ServerAuthoritative,
    /// Claim/release go straight to the authority resolver on the server.
    Ownership,
}

impl Intent {
    pub fn target(&self) -> Option<EntityId> {
        match self {
            Self::Add(spec) => spec.id,
            Self::Modify { id, .. }
            | Self::Remove { id }
            | Self::Teleport { id, .. }
            | Self::Claim { id }
            | Self::Release { id } => Some(*id),
            Self::ApplyEffect { player, .. } | Self::CancelEffect { player } => Some(*player),
            Self::Damage { target, .. } => Some(*target),
        }
    }

    pub fn class(&self) -> IntentClass {
        match self {
            Self::Modify { .. } | Self::Teleport { .. } => IntentClass::Routed,
            Self::Claim { .. } | Self::Release { .. } => IntentClass::Ownership,
            Self::Add(_)
            | Self::Remove { .. }
            | Self::ApplyEffect { .. }
            | Self::CancelEffect { .. }
            | Self::Damage { .. } => IntentClass::ServerAuthoritative,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Modify { .. } => "modify",
            Self::Remove { .. } => "remove",
            Self::Teleport { .. } => "teleport",
            Self::ApplyEffect { .. } => "apply_effect",
            Self::CancelEffect { .. } => "cancel_effect",
            Self::Damage { .. } => "damage",
            Self::Claim { .. } => "claim",
            Self::Release { .. } => "release",
        }
    }
}
