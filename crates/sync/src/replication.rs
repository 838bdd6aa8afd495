//! Per-tick fan-out of the world journal to connected sessions.
//!
//! Messages leave in a fixed order: blueprints, adds, ownership changes,
//! reliable field changes, teleports, best-effort transform patches, removes.
//! An entity added and removed within the same tick produces nothing at all.

use std::collections::{BTreeMap, BTreeSet};

use crate::entity::{ChangeMask, EntityEvent, EntityPatch};
use crate::net::{
    ServerMessage, SessionRegistry, TransformSequencer, WireBlueprint, WireEntity, WirePatch,
};
use crate::types::{BlueprintId, EntityId, Owner, SessionId};
use crate::world::{World, WorldChanges};

/// Fields that always travel reliably.
const RELIABLE_FIELDS: ChangeMask = ChangeMask::CUSTOM.union(ChangeMask::PLAYER);

#[derive(Debug, Default, PartialEq, Eq)]
struct Batch {
    blueprints: Vec<BlueprintId>,
    added: Vec<EntityId>,
    owners: BTreeMap<EntityId, Owner>,
    modified: BTreeMap<EntityId, ChangeMask>,
    teleports: Vec<EntityId>,
    removed: Vec<EntityId>,
}

impl Batch {
    fn collect(changes: WorldChanges) -> Self {
        let mut batch = Batch {
            blueprints: changes.blueprints,
            ..Default::default()
        };

        // Ids created or destroyed this tick. The add or remove carries the
        // final state, so their owner and teleport entries are dropped.
        let mut lifecycle = BTreeSet::new();

        for change in changes.entities.iter().filter(|c| c.broadcast) {
            match change.event {
                EntityEvent::Added { id, .. } => {
                    lifecycle.insert(id);
                    batch.removed.retain(|r| *r != id);
                    batch.modified.remove(&id);
                    if !batch.added.contains(&id) {
                        batch.added.push(id);
                    }
                }
                EntityEvent::Removed { id } => {
                    lifecycle.insert(id);
                    batch.modified.remove(&id);
                    if batch.added.contains(&id) {
                        batch.added.retain(|a| *a != id);
                    } else if !batch.removed.contains(&id) {
                        batch.removed.push(id);
                    }
                }
                EntityEvent::Modified { id, changes } => {
                    if !batch.added.contains(&id) {
                        *batch.modified.entry(id).or_default() |= changes;
                    }
                }
            }
        }

        for change in changes.owners {
            if !lifecycle.contains(&change.entity) {
                batch.owners.insert(change.entity, change.owner);
            }
        }
        for id in changes.teleports {
            if !lifecycle.contains(&id) && !batch.teleports.contains(&id) {
                batch.teleports.push(id);
            }
        }

        batch.added.sort();
        batch.teleports.sort();
        batch.removed.sort();
        batch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Reliable,
    BestEffort,
}

#[derive(Debug)]
struct Outgoing {
    entity: Option<EntityId>,
    delivery: Delivery,
    /// Session that authored the change and does not need it echoed.
    skip: Option<SessionId>,
    message: ServerMessage,
}

impl Outgoing {
    fn reliable(entity: Option<EntityId>, message: ServerMessage) -> Self {
        Self {
            entity,
            delivery: Delivery::Reliable,
            skip: None,
            message,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationStats {
    pub messages: usize,
    pub full_syncs: usize,
}

#[derive(Debug, Default)]
pub struct Replicator {
    sequencer: TransformSequencer,
}

impl Replicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the world journal and queues the resulting messages on every
    /// connected session.
    pub fn replicate(&mut self, world: &mut World, sessions: &mut SessionRegistry) -> ReplicationStats {
        let batch = Batch::collect(world.drain_changes());
        let outgoing = self.build(world, &batch);
        let mut stats = ReplicationStats::default();

        for session in sessions.connected_mut() {
            if session.needs_full_sync {
                session.needs_full_sync = false;
                stats.full_syncs += 1;
                stats.messages += full_sync(world, session);
                continue;
            }

            for out in &outgoing {
                if out.skip == Some(session.id) {
                    continue;
                }
                if let Some(id) = out.entity {
                    let wanted = match out.message {
                        ServerMessage::EntityAdd(_) => {
                            if session.follow_new_entities {
                                session.subscriptions.insert(id);
                            }
                            session.is_subscribed(id)
                        }
                        ServerMessage::EntityRemove { .. } => session.subscriptions.remove(&id),
                        _ => session.is_subscribed(id),
                    };
                    if !wanted {
                        continue;
                    }
                }

                match out.delivery {
                    Delivery::Reliable => session.send_reliable(out.message.clone()),
                    Delivery::BestEffort => session.send_unreliable(out.message.clone()),
                }
                stats.messages += 1;
            }

            for id in &batch.removed {
                session.transform_filter.forget(*id);
            }
        }

        for id in &batch.removed {
            self.sequencer.forget(*id);
        }

        if stats.messages > 0 {
            log::trace!(
                "tick {}: queued {} messages ({} full syncs)",
                world.tick(),
                stats.messages,
                stats.full_syncs
            );
        }
        stats
    }

    fn build(&mut self, world: &World, batch: &Batch) -> Vec<Outgoing> {
        let mut out = Vec::new();

        for id in &batch.blueprints {
            if let Some(blueprint) = world.blueprints().get(*id) {
                out.push(Outgoing::reliable(
                    None,
                    ServerMessage::BlueprintPublished(WireBlueprint::from(blueprint)),
                ));
            }
        }

        for id in &batch.added {
            if let Some(spec) = world.spec_of(*id) {
                out.push(Outgoing::reliable(
                    Some(*id),
                    ServerMessage::EntityAdd(WireEntity::from(&spec)),
                ));
            }
        }

        for (id, owner) in &batch.owners {
            out.push(Outgoing::reliable(
                Some(*id),
                ServerMessage::OwnerChanged {
                    id: id.to_bytes(),
                    owner: owner.session().0,
                },
            ));
        }

        let mut transforms = Vec::new();
        for (id, mask) in &batch.modified {
            let Some(entity) = world.get(*id) else {
                continue;
            };
            let mut mask = *mask;
            if batch.teleports.contains(id) {
                mask.remove(ChangeMask::POSITION | ChangeMask::ROTATION);
            }

            let reliable = mask & RELIABLE_FIELDS;
            if !reliable.is_empty() {
                out.push(Outgoing::reliable(
                    Some(*id),
                    ServerMessage::EntityModified {
                        id: id.to_bytes(),
                        patch: WirePatch::from(&EntityPatch::from_entity(entity, reliable)),
                    },
                ));
            }

            let transform = mask & ChangeMask::TRANSFORM;
            if !transform.is_empty() {
                transforms.push((*id, transform));
            }
        }

        for id in &batch.teleports {
            if let Some(entity) = world.get(*id) {
                out.push(Outgoing {
                    entity: Some(*id),
                    delivery: Delivery::Reliable,
                    skip: client_author(world, *id),
                    message: ServerMessage::PlayerTeleport {
                        id: id.to_bytes(),
                        position: entity.transform.position.to_array(),
                        rotation: entity.transform.rotation.to_array(),
                    },
                });
            }
        }

        for (id, mask) in transforms {
            let Some(entity) = world.get(id) else {
                continue;
            };
            let skip = client_author(world, id);
            out.push(Outgoing {
                entity: Some(id),
                delivery: Delivery::BestEffort,
                skip,
                message: ServerMessage::EntityModify {
                    id: id.to_bytes(),
                    seq: self.sequencer.next(id),
                    patch: WirePatch::from(&EntityPatch::from_entity(entity, mask)),
                },
            });
        }

        for id in &batch.removed {
            out.push(Outgoing::reliable(
                Some(*id),
                ServerMessage::EntityRemove { id: id.to_bytes() },
            ));
        }

        out
    }
}

/// The client that authored an entity already has its own transform.
fn client_author(world: &World, id: EntityId) -> Option<SessionId> {
    match world.owner(id) {
        Some(Owner::Client(author)) => Some(author),
        _ => None,
    }
}

/// Sends every blueprint, then every entity, and subscribes the session to
/// all of them.
fn full_sync(world: &World, session: &mut crate::net::Session) -> usize {
    let mut sent = 0;
    for blueprint in world.blueprints().iter() {
        session.send_reliable(ServerMessage::BlueprintPublished(WireBlueprint::from(
            blueprint,
        )));
        sent += 1;
    }
    for spec in world.snapshot() {
        if let Some(id) = spec.id {
            session.subscriptions.insert(id);
        }
        session.send_reliable(ServerMessage::EntityAdd(WireEntity::from(&spec)));
        sent += 1;
    }
    log::debug!("{} synced {} messages of initial state", session.id, sent);
    sent
}
