use std::collections::VecDeque;
use std::net::SocketAddr;

use glam::{Quat, Vec3};

use crate::blueprint::Blueprint;
use crate::config::WorldConfig;
use crate::effect::EffectRecord;
use crate::entity::{ChangeMask, EntityPatch, EntitySpec};
use crate::error::{SyncError, SyncResult, TransportError};
use crate::intent::{Intent, IntentClass};
use crate::types::{EntityId, Owner, Role, SessionId, Transform};
use crate::world::World;

use super::channel::{OrderedReceiver, ReliableSender, SequenceFilter, TransformSequencer};
use super::protocol::{
    ClientFrame, ClientMessage, Packet, PacketHeader, PacketType, SequencedClientMessage,
    ServerFrame, ServerMessage, encode_frame, sequence_greater_than,
};
use super::route::{Route, route};
use super::session::ConnectionState;
use super::stats::{NetworkStats, random_salt};
use super::transport::Transport;
use super::wire::{WireIntent, WireTransform};

/// Client side of the protocol: a local replica of the server's world plus
/// the send path for intents and the owner's transform stream.
pub struct ClientDispatcher {
    world: World,
    server: SocketAddr,
    config: WorldConfig,
    state: ConnectionState,
    client_salt: u64,
    session: Option<SessionId>,
    player: Option<EntityId>,
    server_tick: u32,
    reliable: ReliableSender<ClientMessage>,
    unreliable: Vec<ClientMessage>,
    inbound: OrderedReceiver<ServerMessage>,
    transform_filter: SequenceFilter,
    sequencer: TransformSequencer,
    control: VecDeque<PacketType>,
    /// Last handshake packet, repeated until the server answers.
    handshake: Option<(PacketType, u64)>,
    send_sequence: u32,
    remote_sequence: u32,
    last_receive_ms: u64,
    rejections: Vec<String>,
    denied: Option<String>,
    stats: NetworkStats,
}

impl std::fmt::Debug for ClientDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientDispatcher")
            .field("server", &self.server)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("world", &self.world)
            .finish()
    }
}

impl ClientDispatcher {
    pub fn new(world: World, server: SocketAddr, config: WorldConfig) -> Self {
        debug_assert_eq!(world.role(), Role::Client);
        Self {
            world,
            server,
            reliable: ReliableSender::new(config.resend_interval_ms),
            config,
            state: ConnectionState::Disconnected,
            client_salt: random_salt(),
            session: None,
            player: None,
            server_tick: 0,
            unreliable: Vec::new(),
            inbound: OrderedReceiver::new(),
            transform_filter: SequenceFilter::new(),
            sequencer: TransformSequencer::new(),
            control: VecDeque::new(),
            handshake: None,
            send_sequence: 0,
            remote_sequence: 0,
            last_receive_ms: 0,
            rejections: Vec::new(),
            denied: None,
            stats: NetworkStats::default(),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session
    }

    pub fn player_id(&self) -> Option<EntityId> {
        self.player
    }

    pub fn server_tick(&self) -> u32 {
        self.server_tick
    }

    pub fn denied_reason(&self) -> Option<&str> {
        self.denied.as_deref()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Reasons the server gave for rejected intents, oldest first.
    pub fn drain_rejections(&mut self) -> Vec<String> {
        std::mem::take(&mut self.rejections)
    }

    pub fn is_timed_out(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_receive_ms) > timeout_ms
    }

    // Connection

    pub fn connect(&mut self, now_ms: u64) {
        self.state = ConnectionState::Connecting;
        self.last_receive_ms = now_ms;
        self.send_handshake(
            PacketType::ConnectionRequest {
                client_salt: self.client_salt,
            },
            now_ms,
        );
    }

    fn send_handshake(&mut self, payload: PacketType, now_ms: u64) {
        self.control.push_back(payload.clone());
        self.handshake = Some((payload, now_ms));
    }

    pub fn disconnect(&mut self) {
        self.handshake = None;
        if self.state != ConnectionState::Disconnected {
            self.control.push_back(PacketType::Disconnect);
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn ping(&mut self, now_ms: u64) {
        self.control.push_back(PacketType::Ping { timestamp: now_ms });
    }

    /// Decodes one datagram from the server. Malformed input is logged and
    /// dropped.
    pub fn handle_packet(&mut self, data: &[u8], now_ms: u64) {
        self.stats.record_received(data.len());

        let packet = match Packet::deserialize(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("dropping malformed packet from server: {}", e);
                self.stats.record_dropped();
                return;
            }
        };

        self.last_receive_ms = now_ms;
        if sequence_greater_than(packet.header.sequence, self.remote_sequence) {
            self.remote_sequence = packet.header.sequence;
        }

        match packet.payload {
            PacketType::ConnectionChallenge {
                server_salt,
                challenge,
            } => {
                let combined = self.client_salt ^ server_salt;
                if combined != challenge {
                    log::warn!("server challenge does not match our salt");
                    return;
                }
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::ChallengeResponse;
                }
                self.send_handshake(
                    PacketType::ChallengeResponse {
                        combined_salt: combined,
                    },
                    now_ms,
                );
            }
            PacketType::ConnectionAccepted {
                session_id,
                player_id,
                tick,
            } => {
                if self.is_connected() {
                    return;
                }
                let session = SessionId(session_id);
                self.handshake = None;
                self.state = ConnectionState::Connected;
                self.session = Some(session);
                self.player = Some(EntityId::from_bytes(player_id));
                self.server_tick = tick;
                self.world.set_local_session(session);
                log::info!("connected as {}", session);
            }
            PacketType::ConnectionDenied { reason } => {
                log::warn!("connection denied: {}", reason);
                self.handshake = None;
                self.state = ConnectionState::Disconnected;
                self.denied = Some(reason);
            }
            PacketType::ServerFrame(frame) => {
                if self.is_connected() {
                    self.handle_server_frame(frame);
                }
            }
            PacketType::Pong { timestamp } => {
                self.stats
                    .record_rtt(now_ms.saturating_sub(timestamp) as f32);
            }
            PacketType::Disconnect => {
                log::info!("server closed the session");
                self.state = ConnectionState::Disconnected;
            }
            other => log::debug!("unexpected packet from server: {:?}", other),
        }
    }

    fn handle_server_frame(&mut self, frame: ServerFrame) {
        if sequence_greater_than(frame.tick, self.server_tick) {
            self.server_tick = frame.tick;
        }
        self.reliable.ack(frame.reliable_ack);

        let mut delivered = Vec::new();
        for sequenced in frame.reliable {
            delivered.extend(self.inbound.receive(sequenced.seq, sequenced.message));
        }

        for message in delivered.into_iter().chain(frame.unreliable) {
            if let Err(e) = self.apply_server_message(message) {
                match e {
                    SyncError::Validation(_) => log::warn!("bad replicated state: {}", e),
                    _ => log::debug!("replicated message skipped: {}", e),
                }
            }
        }
    }

    fn apply_server_message(&mut self, message: ServerMessage) -> SyncResult<()> {
        match message {
            ServerMessage::BlueprintPublished(wire) => {
                self.world.apply_replicated_blueprint(Blueprint::from(&wire));
            }
            ServerMessage::EntityAdd(wire) => {
                let spec = EntitySpec::try_from(&wire)?;
                if let Some(id) = spec.id {
                    self.transform_filter.forget(id);
                }
                self.world.apply_replicated_add(&spec)?;
            }
            ServerMessage::OwnerChanged { id, owner } => {
                let id = EntityId::from_bytes(id);
                let owner = Owner::from_session(SessionId(owner));
                log::debug!("{} now authored by {:?}", id, owner);
                self.world.apply_replicated_owner(id, owner);
            }
            ServerMessage::EntityModified { id, patch } => {
                self.world
                    .apply_replicated_patch(EntityId::from_bytes(id), &EntityPatch::from(&patch))?;
            }
            ServerMessage::PlayerTeleport {
                id,
                position,
                rotation,
            } => {
                let patch = EntityPatch {
                    position: Some(Vec3::from_array(position)),
                    rotation: Some(Quat::from_array(rotation)),
                    ..Default::default()
                };
                self.world
                    .apply_replicated_patch(EntityId::from_bytes(id), &patch)?;
            }
            ServerMessage::EntityModify { id, seq, patch } => {
                let id = EntityId::from_bytes(id);
                let mut patch = EntityPatch::from(&patch);
                let fresh = self
                    .transform_filter
                    .accept(id, patch.touches() & ChangeMask::TRANSFORM, seq);
                if !fresh.contains(ChangeMask::POSITION) {
                    patch.position = None;
                }
                if !fresh.contains(ChangeMask::ROTATION) {
                    patch.rotation = None;
                }
                if !fresh.contains(ChangeMask::SCALE) {
                    patch.scale = None;
                }
                let transform = patch.take_transform();
                if !transform.is_empty() {
                    self.world.apply_replicated_patch(id, &transform)?;
                }
            }
            ServerMessage::EntityRemove { id } => {
                let id = EntityId::from_bytes(id);
                self.transform_filter.forget(id);
                self.sequencer.forget(id);
                self.world.apply_replicated_remove(id);
            }
            ServerMessage::Forwarded { origin, intent } => {
                let intent = Intent::try_from(&intent)?;
                let local = self.world.local_session();
                let ours = intent
                    .target()
                    .is_some_and(|id| self.world.can_author(id, local));
                if ours {
                    log::debug!(
                        "applying {} forwarded from {}",
                        intent.name(),
                        SessionId(origin)
                    );
                    self.submit(intent)?;
                } else {
                    log::debug!("ignoring forwarded {}: no longer ours", intent.name());
                }
            }
            ServerMessage::Rejected { reason } => {
                log::warn!("server rejected intent: {}", reason);
                self.rejections.push(reason);
            }
        }
        Ok(())
    }

    // Intents

    /// Routes an intent. Owned entities are predicted locally and the intent
    /// is sent on; everything else goes to the server untouched.
    pub fn submit(&mut self, intent: Intent) -> SyncResult<Route> {
        self.world.check_client_intent(&intent)?;
        let local = self.world.local_session();

        let routed = if intent.class() == IntentClass::Routed {
            let id = intent
                .target()
                .ok_or_else(|| SyncError::validation("routed intent without target"))?;
            let owner = self.world.owner(id).ok_or(SyncError::NotFound(id))?;
            route(Role::Client, local, local, owner)
        } else {
            Route::SendToServer
        };

        if routed == Route::ApplyLocallyAndSend {
            match &intent {
                Intent::Modify { id, patch } => {
                    self.world.modify_entity(*id, patch)?;
                }
                Intent::Teleport {
                    id,
                    position,
                    rotation_y,
                } => self.world.teleport(*id, *position, *rotation_y)?,
                _ => {}
            }
        }

        log::debug!("{} intent routed as {:?}", intent.name(), routed);
        self.reliable
            .push(ClientMessage::Intent(WireIntent::from(&intent)));
        Ok(routed)
    }

    /// Asks the server to create an entity. The id is chosen here so the
    /// caller can refer to the entity before it replicates back.
    pub fn add_entity(&mut self, mut spec: EntitySpec) -> SyncResult<EntityId> {
        let id = *spec.id.get_or_insert_with(EntityId::new);
        self.submit(Intent::Add(spec))?;
        Ok(id)
    }

    pub fn modify_entity(&mut self, id: EntityId, patch: EntityPatch) -> SyncResult<Route> {
        self.submit(Intent::Modify { id, patch })
    }

    pub fn remove_entity(&mut self, id: EntityId) -> SyncResult<Route> {
        self.submit(Intent::Remove { id })
    }

    pub fn teleport(&mut self, id: EntityId, position: Vec3, rotation_y: Option<f32>) -> SyncResult<Route> {
        self.submit(Intent::Teleport {
            id,
            position,
            rotation_y,
        })
    }

    pub fn apply_effect(&mut self, player: EntityId, effect: EffectRecord) -> SyncResult<Route> {
        self.submit(Intent::ApplyEffect { player, effect })
    }

    pub fn cancel_effect(&mut self, player: EntityId) -> SyncResult<Route> {
        self.submit(Intent::CancelEffect { player })
    }

    pub fn damage(&mut self, target: EntityId, amount: u8) -> SyncResult<Route> {
        self.submit(Intent::Damage { target, amount })
    }

    pub fn claim(&mut self, id: EntityId) -> SyncResult<Route> {
        self.submit(Intent::Claim { id })
    }

    pub fn release(&mut self, id: EntityId) -> SyncResult<Route> {
        self.submit(Intent::Release { id })
    }

    /// One sample of the continuous transform stream. Only the owner may
    /// stream; the sample is applied locally and sent best-effort.
    pub fn move_entity(&mut self, id: EntityId, transform: Transform) -> SyncResult<()> {
        let local = self.world.local_session();
        if self.world.owner(id).is_none() {
            return Err(SyncError::NotFound(id));
        }
        if !self.world.can_author(id, local) {
            return Err(SyncError::Authority {
                entity: id,
                session: local,
            });
        }

        self.world.apply_transform(id, &transform)?;
        let seq = self.sequencer.next(id);
        self.unreliable.push(ClientMessage::TransformUpdate {
            id: id.to_bytes(),
            seq,
            transform: WireTransform::from(&transform),
        });
        Ok(())
    }

    // Outbound

    /// Sends control packets and, once connected, one frame of intents,
    /// transform samples and acks.
    pub fn flush<T: Transport>(&mut self, now_ms: u64, transport: &mut T) -> SyncResult<()> {
        // Local edits are already applied; replication only flows from the server.
        self.world.drain_changes();

        let retry = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::ChallengeResponse
        );
        let interval = self.config.resend_interval_ms;
        let due = self
            .handshake
            .as_ref()
            .filter(|(_, sent_ms)| retry && now_ms.saturating_sub(*sent_ms) >= interval)
            .map(|(payload, _)| payload.clone());
        if let Some(payload) = due {
            self.send_handshake(payload, now_ms);
        }

        while let Some(payload) = self.control.pop_front() {
            let packet = Packet::new(PacketHeader::new(0, self.remote_sequence), payload);
            let bytes = packet
                .serialize()
                .map_err(|e| SyncError::validation(e.to_string()))?;
            self.send(bytes, transport)?;
        }

        if !self.is_connected() {
            return Ok(());
        }

        if self.reliable.in_flight() > self.config.max_reliable_in_flight {
            self.state = ConnectionState::Disconnected;
            return Err(TransportError::QueueFull(self.server).into());
        }

        let frame = ClientFrame {
            reliable_ack: self.inbound.ack(),
            reliable: self
                .reliable
                .due(now_ms)
                .into_iter()
                .map(|(seq, message)| SequencedClientMessage { seq, message })
                .collect(),
            unreliable: std::mem::take(&mut self.unreliable),
        };

        let datagrams = encode_frame(
            frame,
            &mut self.send_sequence,
            self.remote_sequence,
            self.config.max_packet_size,
        )
        .map_err(|e| SyncError::validation(e.to_string()))?;

        for bytes in datagrams {
            self.send(bytes, transport)?;
        }
        Ok(())
    }

    /// Advances the local clock and flushes.
    pub fn tick_once<T: Transport>(&mut self, now_ms: u64, transport: &mut T) -> SyncResult<()> {
        self.world.advance(self.server_tick, now_ms);
        self.flush(now_ms, transport)
    }

    fn send<T: Transport>(&mut self, bytes: Vec<u8>, transport: &mut T) -> SyncResult<()> {
        let len = bytes.len();
        if let Err(e) = transport.send(self.server, bytes) {
            log::warn!("send to server failed: {}", e);
            self.state = ConnectionState::Disconnected;
            return Err(e.into());
        }
        self.stats.record_sent(len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use crate::net::protocol::SequencedServerMessage;
    use crate::net::transport::Outbox;
    use crate::spatial::TransformCache;

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 27015))
    }

    fn client() -> ClientDispatcher {
        ClientDispatcher::new(
            World::client(Box::new(TransformCache::new())),
            server_addr(),
            WorldConfig::default(),
        )
    }

    fn frame(reliable: Vec<(u32, ServerMessage)>) -> Vec<u8> {
        let frame = ServerFrame {
            tick: 1,
            reliable_ack: 0,
            reliable: reliable
                .into_iter()
                .map(|(seq, message)| SequencedServerMessage { seq, message })
                .collect(),
            unreliable: Vec::new(),
        };
        Packet::new(PacketHeader::new(1, 0), PacketType::ServerFrame(frame))
            .serialize()
            .unwrap()
    }

    fn accept(client: &mut ClientDispatcher, session: u32) {
        let bytes = Packet::new(
            PacketHeader::new(0, 0),
            PacketType::ConnectionAccepted {
                session_id: session,
                player_id: EntityId::new().to_bytes(),
                tick: 0,
            },
        )
        .serialize()
        .unwrap();
        client.handle_packet(&bytes, 0);
    }

    fn add_message(spec: &EntitySpec) -> ServerMessage {
        ServerMessage::EntityAdd(spec.into())
    }

    #[test]
    fn connect_answers_challenge() {
        let mut client = client();
        let mut outbox = Outbox::new();
        client.connect(0);
        client.flush(0, &mut outbox).unwrap();
        let salt = match Packet::deserialize(&outbox.drain().next().unwrap().1)
            .unwrap()
            .payload
        {
            PacketType::ConnectionRequest { client_salt } => client_salt,
            other => panic!("unexpected {:?}", other),
        };

        let challenge = Packet::new(
            PacketHeader::new(0, 0),
            PacketType::ConnectionChallenge {
                server_salt: 99,
                challenge: salt ^ 99,
            },
        );
        client.handle_packet(&challenge.serialize().unwrap(), 1);
        client.flush(1, &mut outbox).unwrap();

        let reply = Packet::deserialize(&outbox.drain().next().unwrap().1).unwrap();
        assert!(matches!(
            reply.payload,
            PacketType::ChallengeResponse { combined_salt } if combined_salt == salt ^ 99
        ));
        assert_eq!(client.state(), ConnectionState::ChallengeResponse);
    }

    #[test]
    fn owned_modify_is_predicted() {
        let mut client = client();
        accept(&mut client, 3);

        let id = EntityId::new();
        let spec = EntitySpec::new(EntityKind::Model)
            .with_id(id)
            .with_owner(Owner::Client(SessionId(3)));
        client.handle_packet(&frame(vec![(1, add_message(&spec))]), 1);

        let routed = client
            .modify_entity(id, EntityPatch::position(Vec3::X))
            .unwrap();
        assert_eq!(routed, Route::ApplyLocallyAndSend);
        assert_eq!(client.world().get(id).unwrap().transform.position, Vec3::X);
    }

    #[test]
    fn foreign_modify_waits_for_server() {
        let mut client = client();
        accept(&mut client, 3);

        let id = EntityId::new();
        let spec = EntitySpec::new(EntityKind::Model).with_id(id);
        client.handle_packet(&frame(vec![(1, add_message(&spec))]), 1);

        let routed = client
            .modify_entity(id, EntityPatch::position(Vec3::X))
            .unwrap();
        assert_eq!(routed, Route::SendToServer);
        assert_eq!(client.world().get(id).unwrap().transform.position, Vec3::ZERO);
    }

    #[test]
    fn streaming_requires_ownership() {
        let mut client = client();
        accept(&mut client, 3);

        let id = EntityId::new();
        let spec = EntitySpec::new(EntityKind::Model).with_id(id);
        client.handle_packet(&frame(vec![(1, add_message(&spec))]), 1);

        assert!(matches!(
            client.move_entity(id, Transform::from_position(Vec3::Y)),
            Err(SyncError::Authority { .. })
        ));
    }

    #[test]
    fn reliable_messages_apply_in_order() {
        let mut client = client();
        accept(&mut client, 3);

        let id = EntityId::new();
        let spec = EntitySpec::new(EntityKind::Model).with_id(id);
        let remove = ServerMessage::EntityRemove { id: id.to_bytes() };

        client.handle_packet(&frame(vec![(2, remove)]), 1);
        assert!(client.world().get(id).is_none());

        client.handle_packet(&frame(vec![(1, add_message(&spec))]), 2);
        assert!(client.world().get(id).is_none());
        assert_eq!(client.world().entity_count(), 0);
    }

    #[test]
    fn rejections_are_surfaced() {
        let mut client = client();
        accept(&mut client, 3);
        client.handle_packet(
            &frame(vec![(
                1,
                ServerMessage::Rejected {
                    reason: "nope".into(),
                },
            )]),
            1,
        );
        assert_eq!(client.drain_rejections(), vec!["nope".to_string()]);
    }
}
