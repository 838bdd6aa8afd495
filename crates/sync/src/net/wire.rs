//! Wire representations of world state and their conversions.
//!
//! Ids travel as raw uuid bytes, owners as session numbers (0 is the server)
//! and transforms as plain float arrays so an add replicates losslessly.

use glam::{Quat, Vec3};
use rkyv::{Archive, Deserialize, Serialize};

use crate::blueprint::Blueprint;
use crate::effect::EffectRecord;
use crate::entity::{EntityKind, EntityPatch, EntitySpec, MovementFlags, PlayerState};
use crate::error::{SyncError, SyncResult};
use crate::intent::Intent;
use crate::types::{BlueprintId, DataValue, EntityId, Owner, SessionId, Transform};

pub type WireId = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireTransform {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
}

impl From<&Transform> for WireTransform {
    fn from(t: &Transform) -> Self {
        Self {
            position: t.position.to_array(),
            rotation: t.rotation.to_array(),
            scale: t.scale.to_array(),
        }
    }
}

impl From<&WireTransform> for Transform {
    fn from(t: &WireTransform) -> Self {
        Self {
            position: Vec3::from_array(t.position),
            rotation: Quat::from_array(t.rotation),
            scale: Vec3::from_array(t.scale),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireEffect {
    pub anchor_id: Option<WireId>,
    pub emote: Option<String>,
    pub snare: Option<f32>,
    pub freeze: bool,
    pub turn: bool,
    pub duration_ms: Option<u64>,
    pub cancellable: bool,
}

impl From<&EffectRecord> for WireEffect {
    fn from(e: &EffectRecord) -> Self {
        Self {
            anchor_id: e.anchor_id.map(EntityId::to_bytes),
            emote: e.emote.clone(),
            snare: e.snare,
            freeze: e.freeze,
            turn: e.turn,
            duration_ms: e.duration_ms,
            cancellable: e.cancellable,
        }
    }
}

impl From<&WireEffect> for EffectRecord {
    fn from(e: &WireEffect) -> Self {
        Self {
            anchor_id: e.anchor_id.map(EntityId::from_bytes),
            emote: e.emote.clone(),
            snare: e.snare,
            freeze: e.freeze,
            turn: e.turn,
            duration_ms: e.duration_ms,
            cancellable: e.cancellable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WirePlayer {
    pub health: u8,
    pub effect: Option<WireEffect>,
    pub movement_flags: u16,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireCustom {
    pub key: String,
    pub value: Option<DataValue>,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireEntity {
    pub id: WireId,
    pub kind: u8,
    pub blueprint_id: Option<WireId>,
    pub owner: u32,
    pub transform: WireTransform,
    pub custom: Vec<WireCustom>,
    pub player: Option<WirePlayer>,
}

impl From<&EntitySpec> for WireEntity {
    fn from(spec: &EntitySpec) -> Self {
        Self {
            id: spec.id.unwrap_or_default().to_bytes(),
            kind: spec.kind as u8,
            blueprint_id: spec.blueprint_id.map(BlueprintId::to_bytes),
            owner: spec.owner.session().0,
            transform: WireTransform::from(&spec.transform),
            custom: spec
                .custom
                .iter()
                .map(|(key, value)| WireCustom {
                    key: key.clone(),
                    value: Some(value.clone()),
                })
                .collect(),
            player: spec.player.as_ref().map(|p| WirePlayer {
                health: p.health,
                effect: p.effect.as_ref().map(WireEffect::from),
                movement_flags: p.movement_flags.bits(),
            }),
        }
    }
}

impl TryFrom<&WireEntity> for EntitySpec {
    type Error = SyncError;

    fn try_from(wire: &WireEntity) -> SyncResult<Self> {
        Ok(Self {
            id: Some(EntityId::from_bytes(wire.id)),
            kind: EntityKind::try_from(wire.kind)?,
            blueprint_id: wire.blueprint_id.map(BlueprintId::from_bytes),
            owner: Owner::from_session(SessionId(wire.owner)),
            transform: Transform::from(&wire.transform),
            custom: wire
                .custom
                .iter()
                .filter_map(|c| c.value.clone().map(|v| (c.key.clone(), v)))
                .collect(),
            player: wire.player.as_ref().map(|p| PlayerState {
                health: p.health,
                effect: p.effect.as_ref().map(EffectRecord::from),
                movement_flags: MovementFlags::from_bits_truncate(p.movement_flags),
            }),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WirePatch {
    pub position: Option<[f32; 3]>,
    pub rotation: Option<[f32; 4]>,
    pub scale: Option<[f32; 3]>,
    pub custom: Vec<WireCustom>,
    pub replace_custom: bool,
    pub health: Option<u8>,
    pub movement_flags: Option<u16>,
    pub effect: Option<Option<WireEffect>>,
}

impl From<&EntityPatch> for WirePatch {
    fn from(patch: &EntityPatch) -> Self {
        Self {
            position: patch.position.map(|v| v.to_array()),
            rotation: patch.rotation.map(Quat::to_array),
            scale: patch.scale.map(|v| v.to_array()),
            custom: patch
                .custom
                .iter()
                .map(|(key, value)| WireCustom {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            replace_custom: patch.replace_custom,
            health: patch.health,
            movement_flags: patch.movement_flags.map(|f| f.bits()),
            effect: patch
                .effect
                .as_ref()
                .map(|e| e.as_ref().map(WireEffect::from)),
        }
    }
}

impl From<&WirePatch> for EntityPatch {
    fn from(wire: &WirePatch) -> Self {
        Self {
            position: wire.position.map(Vec3::from_array),
            rotation: wire.rotation.map(Quat::from_array),
            scale: wire.scale.map(Vec3::from_array),
            custom: wire
                .custom
                .iter()
                .map(|c| (c.key.clone(), c.value.clone()))
                .collect(),
            replace_custom: wire.replace_custom,
            health: wire.health,
            movement_flags: wire.movement_flags.map(MovementFlags::from_bits_truncate),
            effect: wire
                .effect
                .as_ref()
                .map(|e| e.as_ref().map(EffectRecord::from)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireBlueprint {
    pub id: WireId,
    pub version: u32,
    pub name: String,
    pub description: String,
    pub model_ref: Option<String>,
}

impl From<&Blueprint> for WireBlueprint {
    fn from(b: &Blueprint) -> Self {
        Self {
            id: b.id.to_bytes(),
            version: b.version,
            name: b.name.clone(),
            description: b.description.clone(),
            model_ref: b.model_ref.clone(),
        }
    }
}

impl From<&WireBlueprint> for Blueprint {
    fn from(b: &WireBlueprint) -> Self {
        Self {
            id: BlueprintId::from_bytes(b.id),
            version: b.version,
            name: b.name.clone(),
            description: b.description.clone(),
            model_ref: b.model_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum WireIntent {
    Add(WireEntity),
    Modify {
        id: WireId,
        patch: WirePatch,
    },
    Remove {
        id: WireId,
    },
    Teleport {
        id: WireId,
        position: [f32; 3],
        rotation_y: Option<f32>,
    },
    ApplyEffect {
        player: WireId,
        effect: WireEffect,
    },
    CancelEffect {
        player: WireId,
    },
    Damage {
        target: WireId,
        amount: u8,
    },
    Claim {
        id: WireId,
    },
    Release {
        id: WireId,
    },
}

impl From<&Intent> for WireIntent {
    fn from(intent: &Intent) -> Self {
        match intent {
            Intent::Add(spec) => Self::Add(WireEntity::from(spec)),
            Intent::Modify { id, patch } => Self::Modify {
                id: id.to_bytes(),
                patch: WirePatch::from(patch),
            },
            Intent::Remove { id } => Self::Remove { id: id.to_bytes() },
            Intent::Teleport {
                id,
                position,
                rotation_y,
            } => Self::Teleport {
                id: id.to_bytes(),
                position: position.to_array(),
                rotation_y: *rotation_y,
            },
            Intent::ApplyEffect { player, effect } => Self::ApplyEffect {
                player: player.to_bytes(),
                effect: WireEffect::from(effect),
            },
            Intent::CancelEffect { player } => Self::CancelEffect {
                player: player.to_bytes(),
            },
            Intent::Damage { target, amount } => Self::Damage {
                target: target.to_bytes(),
                amount: *amount,
            },
            Intent::Claim { id } => Self::Claim { id: id.to_bytes() },
            Intent::Release { id } => Self::Release { id: id.to_bytes() },
        }
    }
}

impl TryFrom<&WireIntent> for Intent {
    type Error = SyncError;

    fn try_from(wire: &WireIntent) -> SyncResult<Self> {
        let intent = match wire {
            WireIntent::Add(entity) => {
                let mut spec = EntitySpec::try_from(entity)?;
                // A zeroed id asks the server to allocate one.
                if entity.id == [0; 16] {
                    spec.id = None;
                }
                Intent::Add(spec)
            }
            WireIntent::Modify { id, patch } => Intent::Modify {
                id: EntityId::from_bytes(*id),
                patch: EntityPatch::from(patch),
            },
            WireIntent::Remove { id } => Intent::Remove {
                id: EntityId::from_bytes(*id),
            },
            WireIntent::Teleport {
                id,
                position,
                rotation_y,
            } => {
                let position = Vec3::from_array(*position);
                if !position.is_finite() || rotation_y.is_some_and(|r| !r.is_finite()) {
                    return Err(SyncError::validation("non-finite teleport target"));
                }
                Intent::Teleport {
                    id: EntityId::from_bytes(*id),
                    position,
                    rotation_y: *rotation_y,
                }
            }
            WireIntent::ApplyEffect { player, effect } => Intent::ApplyEffect {
                player: EntityId::from_bytes(*player),
                effect: EffectRecord::from(effect),
            },
            WireIntent::CancelEffect { player } => Intent::CancelEffect {
                player: EntityId::from_bytes(*player),
            },
            WireIntent::Damage { target, amount } => Intent::Damage {
                target: EntityId::from_bytes(*target),
                amount: *amount,
            },
            WireIntent::Claim { id } => Intent::Claim {
                id: EntityId::from_bytes(*id),
            },
            WireIntent::Release { id } => Intent::Release {
                id: EntityId::from_bytes(*id),
            },
        };
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CustomData;

    #[test]
    fn unknown_kind_is_validation_error() {
        let mut wire = WireEntity::from(&EntitySpec::new(EntityKind::Model).with_id(EntityId::new()));
        wire.kind = 42;
        assert!(matches!(
            EntitySpec::try_from(&wire),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn spec_survives_wire_form() {
        let mut custom = CustomData::new();
        custom.insert("label".into(), DataValue::Text("door".into()));
        custom.insert("open".into(), DataValue::Bool(false));

        let spec = EntitySpec {
            id: Some(EntityId::new()),
            kind: EntityKind::Player,
            blueprint_id: Some(BlueprintId::new()),
            owner: Owner::Client(SessionId(7)),
            transform: Transform {
                position: Vec3::new(1.5, -2.0, 3.25),
                rotation: Quat::from_rotation_y(0.7),
                scale: Vec3::splat(2.0),
            },
            custom,
            player: Some(PlayerState {
                health: 55,
                effect: Some(EffectRecord::new().emote("wave").duration_ms(500)),
                movement_flags: MovementFlags::GROUNDED | MovementFlags::SPRINTING,
            }),
        };

        let back = EntitySpec::try_from(&WireEntity::from(&spec)).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn patch_keeps_custom_deletes() {
        let patch = EntityPatch::new()
            .set_custom("a", DataValue::Int(3))
            .remove_custom("b");
        let back = EntityPatch::from(&WirePatch::from(&patch));
        assert_eq!(back, patch);
    }

    #[test]
    fn add_with_zero_id_allocates() {
        let mut wire = WireEntity::from(&EntitySpec::new(EntityKind::Model));
        wire.id = [0; 16];
        let Intent::Add(spec) = Intent::try_from(&WireIntent::Add(wire)).unwrap() else {
            panic!("expected add");
        };
        assert!(spec.id.is_none());
    }
}
