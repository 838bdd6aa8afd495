mod common;

use common::{Faults, Loopback};
use glam::{Quat, Vec3};
use worldsync::net::{ClientFrame, ClientMessage, PacketHeader, WireTransform};
use worldsync::{
    DataValue, EffectRecord, EntityKind, EntityPatch, EntitySpec, Intent, Owner, Packet,
    PacketType, SyncError, Transform,
};

#[test]
fn added_entity_arrives_field_for_field() {
    let mut net = Loopback::new();
    let a = net.join();
    let b = net.join();

    let transform = Transform {
        position: Vec3::new(1.5, -2.0, 8.25),
        rotation: Quat::from_rotation_y(0.75),
        scale: Vec3::splat(2.0),
    };
    let spec = EntitySpec::new(EntityKind::Model)
        .with_transform(transform)
        .with_custom("label", DataValue::Text("crate".into()))
        .with_custom("weight", DataValue::Float(12.5))
        .with_custom("stackable", DataValue::Bool(true));
    let id = net.client_mut(a).add_entity(spec).unwrap();

    assert!(net.run_until(20, |net| net.client(b).world().get(id).is_some()));

    let authoritative = net.server.world().spec_of(id).unwrap();
    assert_eq!(authoritative.transform, transform);
    assert_eq!(net.client(a).world().spec_of(id), Some(authoritative.clone()));
    assert_eq!(net.client(b).world().spec_of(id), Some(authoritative));
}

#[test]
fn damage_applies_once_per_intent_under_duplication_and_reordering() {
    let mut net = Loopback::new();
    let a = net.join();
    let b = net.join();
    let target = net.player(b);

    net.faults = Faults {
        drop_every: 0,
        duplicate: true,
        reorder: true,
    };
    net.client_mut(a).damage(target, 30).unwrap();
    net.step();
    net.client_mut(a).damage(target, 30).unwrap();

    let health = |world: &worldsync::World| world.get(target).and_then(|e| e.player.as_ref()).map(|p| p.health);
    assert!(net.run_until(40, |net| health(net.client(b).world()) == Some(40)));

    net.run(10);
    assert_eq!(health(net.server.world()), Some(40));
    assert_eq!(health(net.client(a).world()), Some(40));
    assert_eq!(health(net.client(b).world()), Some(40));
}

#[test]
fn reliable_traffic_survives_loss() {
    let mut net = Loopback::new();
    let a = net.join();
    let b = net.join();

    net.faults.drop_every = 3;
    let mut ids = Vec::new();
    for n in 0..5 {
        let spec = EntitySpec::new(EntityKind::Model).with_custom("n", DataValue::Int(n));
        ids.push(net.client_mut(a).add_entity(spec).unwrap());
        net.step();
    }

    assert!(net.run_until(100, |net| ids
        .iter()
        .all(|id| net.client(b).world().get(*id).is_some())));
}

#[test]
fn second_claim_fails_while_first_holds() {
    let mut net = Loopback::new();
    let a = net.join();
    let b = net.join();

    let id = net
        .client_mut(a)
        .add_entity(EntitySpec::new(EntityKind::Model))
        .unwrap();
    net.run(3);

    net.client_mut(a).claim(id).unwrap();
    net.run(3);
    net.client_mut(b).claim(id).unwrap();
    net.run(5);

    let owner = Owner::Client(net.session(a));
    assert_eq!(net.server.world().owner(id), Some(owner));
    assert_eq!(net.client(a).world().owner(id), Some(owner));
    assert_eq!(net.client(b).world().owner(id), Some(owner));

    // Released entities can be claimed by the next session.
    net.client_mut(a).release(id).unwrap();
    net.run(3);
    net.client_mut(b).claim(id).unwrap();
    net.run(3);
    assert_eq!(net.server.world().owner(id), Some(Owner::Client(net.session(b))));
}

#[test]
fn disconnect_returns_entities_to_server() {
    let mut net = Loopback::new();
    let a = net.join();
    let b = net.join();
    let player_a = net.player(a);

    let id = net
        .client_mut(a)
        .add_entity(EntitySpec::new(EntityKind::Model))
        .unwrap();
    net.run(3);
    net.client_mut(a).claim(id).unwrap();
    net.run(3);
    assert_eq!(net.client(b).world().owner(id), Some(Owner::Client(net.session(a))));

    net.client_mut(a).disconnect();
    net.run(5);

    assert_eq!(net.server.world().owner(id), Some(Owner::Server));
    assert!(net.server.world().get(player_a).is_none());
    assert_eq!(net.client(b).world().owner(id), Some(Owner::Server));
    assert!(net.client(b).world().get(player_a).is_none());
    assert_eq!(net.server.sessions().connected_count(), 1);
}

#[test]
fn owner_stream_reaches_others_and_drops_stale_samples() {
    let mut net = Loopback::new();
    let a = net.join();
    let b = net.join();
    let player = net.player(a);

    net.client_mut(a)
        .move_entity(player, Transform::from_position(Vec3::new(3.0, 0.0, 0.0)))
        .unwrap();
    assert!(net.run_until(10, |net| {
        net.client(b)
            .world()
            .get(player)
            .is_some_and(|e| e.transform.position.x == 3.0)
    }));

    // Hand-built samples: seq 50 lands first, seq 40 arrives late.
    let sample = |seq: u32, x: f32| {
        let frame = ClientFrame {
            reliable_ack: 0,
            reliable: Vec::new(),
            unreliable: vec![ClientMessage::TransformUpdate {
                id: player.to_bytes(),
                seq,
                transform: WireTransform::from(&Transform::from_position(Vec3::new(x, 0.0, 0.0))),
            }],
        };
        Packet::new(PacketHeader::new(900 + seq, 0), PacketType::ClientFrame(frame))
            .serialize()
            .unwrap()
    };
    let from = net.clients[a].0;
    let now = net.now_ms;
    net.server.handle_packet(from, &sample(50, 9.0), now);
    net.server.handle_packet(from, &sample(40, -9.0), now);

    assert_eq!(net.server.world().get(player).unwrap().transform.position.x, 9.0);
}

#[test]
fn client_cannot_rewrite_own_health() {
    let mut net = Loopback::new();
    let a = net.join();
    let player = net.player(a);

    net.server
        .submit(Intent::Damage {
            target: player,
            amount: 70,
        })
        .unwrap();
    let health = |world: &worldsync::World| world.get(player).and_then(|e| e.player.as_ref()).map(|p| p.health);
    assert!(net.run_until(10, |net| health(net.client(a).world()) == Some(30)));

    assert!(matches!(
        net.client_mut(a).modify_entity(player, EntityPatch::health(100)),
        Err(SyncError::Validation(_))
    ));
    let session = net.session(a);
    assert!(matches!(
        net.server.apply_intent(
            session,
            Intent::Modify {
                id: player,
                patch: EntityPatch::health(100),
            }
        ),
        Err(SyncError::Validation(_))
    ));

    net.run(5);
    assert_eq!(health(net.server.world()), Some(30));
    assert_eq!(health(net.client(a).world()), Some(30));
}

#[test]
fn frozen_player_cannot_move_by_any_intent() {
    let mut net = Loopback::new();
    let a = net.join();
    let player = net.player(a);
    let start = net.server.world().get(player).unwrap().transform.position;

    net.server
        .submit(Intent::ApplyEffect {
            player,
            effect: EffectRecord::new().freeze(),
        })
        .unwrap();
    assert!(net.run_until(10, |net| net
        .client(a)
        .world()
        .get(player)
        .and_then(|e| e.player.as_ref())
        .is_some_and(|p| p.effect.is_some())));

    let target = Vec3::new(50.0, 0.0, 0.0);
    assert!(net.client_mut(a).modify_entity(player, EntityPatch::position(target)).is_err());
    assert!(net.client_mut(a).teleport(player, target, None).is_err());
    assert!(net
        .client_mut(a)
        .move_entity(player, Transform::from_position(target))
        .is_err());

    let session = net.session(a);
    assert!(net
        .server
        .apply_intent(
            session,
            Intent::Modify {
                id: player,
                patch: EntityPatch::position(target),
            }
        )
        .is_err());
    assert!(net
        .server
        .apply_intent(
            session,
            Intent::Teleport {
                id: player,
                position: target,
                rotation_y: None,
            }
        )
        .is_err());

    let frame = ClientFrame {
        reliable_ack: 0,
        reliable: Vec::new(),
        unreliable: vec![ClientMessage::TransformUpdate {
            id: player.to_bytes(),
            seq: 500,
            transform: WireTransform::from(&Transform::from_position(target)),
        }],
    };
    let bytes = Packet::new(PacketHeader::new(700, 0), PacketType::ClientFrame(frame))
        .serialize()
        .unwrap();
    let from = net.clients[a].0;
    let now = net.now_ms;
    net.server.handle_packet(from, &bytes, now);

    net.run(3);
    assert_eq!(net.server.world().get(player).unwrap().transform.position, start);
    assert_eq!(net.client(a).world().get(player).unwrap().transform.position, start);

    // The server itself is not bound by the lock.
    net.server.world_mut().teleport(player, target, None).unwrap();
    assert_eq!(net.server.world().get(player).unwrap().transform.position, target);
}

#[test]
fn non_owner_cannot_stream_transforms() {
    let mut net = Loopback::new();
    let a = net.join();
    let b = net.join();
    let player_a = net.player(a);

    assert!(net
        .client_mut(b)
        .move_entity(player_a, Transform::from_position(Vec3::ONE))
        .is_err());
}

#[test]
fn malformed_packet_keeps_session() {
    let mut net = Loopback::new();
    let a = net.join();
    let from = net.clients[a].0;
    let now = net.now_ms;

    net.server.handle_packet(from, b"definitely not a packet", now);
    net.server.handle_packet(from, &[], now);
    net.run(3);

    assert!(net.client(a).is_connected());
    assert_eq!(net.server.sessions().connected_count(), 1);
}

#[test]
fn modify_on_foreign_entity_is_forwarded_to_owner() {
    let mut net = Loopback::new();
    let a = net.join();
    let b = net.join();

    let id = net
        .client_mut(a)
        .add_entity(EntitySpec::new(EntityKind::Model))
        .unwrap();
    net.run(3);
    net.client_mut(a).claim(id).unwrap();
    net.run(3);

    let patch = EntityPatch::new().set_custom("color", DataValue::Text("red".into()));
    let route = net.client_mut(b).modify_entity(id, patch).unwrap();
    assert_eq!(route, worldsync::Route::SendToServer);

    let color = |world: &worldsync::World| world.get(id).and_then(|e| e.custom.get("color").cloned());
    assert!(net.run_until(20, |net| color(net.client(b).world()).is_some()));
    assert_eq!(color(net.client(a).world()), Some(DataValue::Text("red".into())));
    assert_eq!(color(net.server.world()), Some(DataValue::Text("red".into())));
}

#[test]
fn deleted_custom_key_replicates() {
    let mut net = Loopback::new();
    let a = net.join();
    let b = net.join();

    let spec = EntitySpec::new(EntityKind::Model)
        .with_custom("keep", DataValue::Int(1))
        .with_custom("drop", DataValue::Int(2));
    let id = net.client_mut(a).add_entity(spec).unwrap();
    assert!(net.run_until(10, |net| net.client(b).world().get(id).is_some()));

    net.client_mut(a)
        .modify_entity(id, EntityPatch::new().remove_custom("drop"))
        .unwrap();
    assert!(net.run_until(10, |net| net
        .client(b)
        .world()
        .get(id)
        .is_some_and(|e| !e.custom.contains_key("drop"))));

    let custom = &net.client(b).world().get(id).unwrap().custom;
    assert_eq!(custom.get("keep"), Some(&DataValue::Int(1)));
}

#[test]
fn late_joiner_receives_existing_world() {
    let mut net = Loopback::new();
    let a = net.join();

    let id = net
        .client_mut(a)
        .add_entity(EntitySpec::new(EntityKind::Model).with_custom("n", DataValue::Int(7)))
        .unwrap();
    net.run(3);

    let b = net.join();
    assert!(net.run_until(5, |net| net.client(b).world().get(id).is_some()));
    assert!(net.client(b).world().get(net.player(a)).is_some());
    assert_eq!(net.client(b).world().entity_count(), net.server.world().entity_count());
}
