use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::config::WorldConfig;
use crate::entity::{ChangeMask, EntityKind, EntitySpec};
use crate::error::{SyncError, SyncResult, TransportError};
use crate::intent::{Intent, IntentClass};
use crate::replication::{ReplicationStats, Replicator};
use crate::types::{EntityId, Owner, Role, SessionId, Transform};
use crate::world::World;

use super::events::{DisconnectReason, ServerEvent};
use super::protocol::{
    ClientFrame, ClientMessage, Packet, PacketHeader, PacketType, SequencedServerMessage,
    ServerFrame, ServerMessage, encode_frame,
};
use super::route::{Route, route};
use super::session::{ConnectionState, SessionRegistry};
use super::stats::NetworkStats;
use super::transport::Transport;
use super::wire::WireIntent;

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tick: u32,
    pub session_count: usize,
    pub max_sessions: usize,
    pub entity_count: usize,
    pub network: NetworkStats,
}

/// Authoritative side of the protocol. Owns the world and every session and
/// is driven by a single tick loop: inbound datagrams are handed to
/// `handle_packet`, then `tick` advances the world and flushes traffic.
pub struct ServerDispatcher {
    world: World,
    sessions: SessionRegistry,
    replicator: Replicator,
    config: WorldConfig,
    spawn: Transform,
    tick: u32,
    control: VecDeque<(SocketAddr, PacketType)>,
    pending_events: VecDeque<ServerEvent>,
    stats: NetworkStats,
}

impl std::fmt::Debug for ServerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDispatcher")
            .field("world", &self.world)
            .field("sessions", &self.sessions.total_count())
            .field("tick", &self.tick)
            .finish()
    }
}

impl ServerDispatcher {
    pub fn new(world: World, config: WorldConfig, max_sessions: usize, timeout_ms: u64) -> Self {
        debug_assert_eq!(world.role(), Role::Server);
        Self {
            world,
            sessions: SessionRegistry::with_timeout(max_sessions, timeout_ms, config.clone()),
            replicator: Replicator::new(),
            config,
            spawn: Transform::default(),
            tick: 0,
            control: VecDeque::new(),
            pending_events: VecDeque::new(),
            stats: NetworkStats::default(),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Direct access for server-side simulation and setup. Writes made here
    /// are authoritative and replicate on the next tick.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn set_spawn(&mut self, spawn: Transform) {
        self.spawn = spawn;
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.tick,
            session_count: self.sessions.connected_count(),
            max_sessions: self.sessions.max_sessions(),
            entity_count: self.world.entity_count(),
            network: self.stats.clone(),
        }
    }

    // Inbound

    /// Decodes one datagram and acts on it. Malformed input is logged and
    /// dropped; it never disconnects the sender.
    pub fn handle_packet(&mut self, addr: SocketAddr, data: &[u8], now_ms: u64) {
        self.stats.record_received(data.len());

        let packet = match Packet::deserialize(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("dropping malformed packet from {}: {}", addr, e);
                self.stats.record_dropped();
                return;
            }
        };

        let session_id = self.sessions.id_by_addr(&addr);
        if let Some(session) = session_id.and_then(|id| self.sessions.get_mut(id)) {
            session.touch(now_ms, packet.header.sequence);
            session.stats.record_received(data.len());
        }

        match packet.payload {
            PacketType::ConnectionRequest { client_salt } => {
                self.handle_connection_request(addr, client_salt, now_ms);
            }
            PacketType::ChallengeResponse { combined_salt } => {
                self.handle_challenge_response(addr, combined_salt);
            }
            PacketType::ClientFrame(frame) => match session_id {
                Some(id) if self.is_connected(id) => self.handle_client_frame(id, frame),
                _ => log::debug!("frame from unconnected {}", addr),
            },
            PacketType::Ping { timestamp } => {
                self.control.push_back((addr, PacketType::Pong { timestamp }));
            }
            PacketType::Disconnect => {
                if let Some(id) = session_id {
                    self.disconnect(id, DisconnectReason::Graceful);
                }
            }
            other => log::debug!("unexpected packet from {}: {:?}", addr, other),
        }
    }

    /// The transport lost the peer. Same cleanup as any other disconnect.
    pub fn handle_disconnect(&mut self, addr: SocketAddr) {
        if let Some(id) = self.sessions.id_by_addr(&addr) {
            self.disconnect(id, DisconnectReason::TransportFailure);
        }
    }

    fn is_connected(&self, id: SessionId) -> bool {
        self.sessions.get(id).is_some_and(|s| s.is_connected())
    }

    fn handle_connection_request(&mut self, addr: SocketAddr, client_salt: u64, now_ms: u64) {
        self.pending_events
            .push_back(ServerEvent::SessionConnecting { addr });

        let session = match self.sessions.get_or_create_pending(addr, client_salt, now_ms) {
            Ok(session) => session,
            Err(reason) => {
                log::info!("denied connection from {}: {}", addr, reason);
                self.control.push_back((
                    addr,
                    PacketType::ConnectionDenied {
                        reason: reason.to_string(),
                    },
                ));
                self.pending_events.push_back(ServerEvent::ConnectionDenied {
                    addr,
                    reason: reason.to_string(),
                });
                return;
            }
        };

        if session.state == ConnectionState::Connecting {
            session.state = ConnectionState::ChallengeResponse;
        }
        let challenge = PacketType::ConnectionChallenge {
            server_salt: session.server_salt,
            challenge: session.combined_salt(),
        };
        self.control.push_back((addr, challenge));
    }

    fn handle_challenge_response(&mut self, addr: SocketAddr, combined_salt: u64) {
        let Some(id) = self.sessions.id_by_addr(&addr) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };

        if combined_salt != session.combined_salt() {
            log::warn!("invalid challenge response from {}", addr);
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("Invalid challenge response from {}", addr),
            });
            return;
        }

        // A repeated response means our accept was lost.
        if let Some(player) = session.player_id {
            self.control.push_back((addr, accepted(id, player, self.tick)));
            return;
        }

        let spec = EntitySpec::player(Owner::Client(id), self.spawn);
        let player = match self.world.add_entity(spec, true) {
            Ok(player) => player,
            Err(e) => {
                log::error!("could not spawn player for {}: {}", id, e);
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("Spawning player for {} failed: {}", id, e),
                });
                return;
            }
        };

        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.state = ConnectionState::Connected;
        session.player_id = Some(player);
        session.needs_full_sync = true;

        log::info!("{} connected from {} as player {}", id, addr, player);
        self.pending_events.push_back(ServerEvent::SessionConnected {
            session: id,
            addr,
            player,
        });
        self.control.push_back((addr, accepted(id, player, self.tick)));
    }

    fn handle_client_frame(&mut self, id: SessionId, frame: ClientFrame) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.reliable.ack(frame.reliable_ack);

        let mut delivered = Vec::new();
        for sequenced in frame.reliable {
            delivered.extend(session.inbound.receive(sequenced.seq, sequenced.message));
        }

        for message in delivered.into_iter().chain(frame.unreliable) {
            self.handle_client_message(id, message);
        }
    }

    fn handle_client_message(&mut self, origin: SessionId, message: ClientMessage) {
        let result = match message {
            ClientMessage::Intent(wire) => {
                Intent::try_from(&wire).and_then(|intent| self.apply_intent(origin, intent).map(drop))
            }
            ClientMessage::TransformUpdate { id, seq, transform } => self.apply_transform_update(
                origin,
                EntityId::from_bytes(id),
                seq,
                &Transform::from(&transform),
            ),
        };

        if let Err(e) = result {
            self.report(origin, e);
        }
    }

    fn report(&mut self, origin: SessionId, error: SyncError) {
        match &error {
            SyncError::Validation(reason) => {
                log::warn!("rejected message from {}: {}", origin, reason);
                if let Some(session) = self.sessions.get_mut(origin) {
                    session.send_reliable(ServerMessage::Rejected {
                        reason: reason.clone(),
                    });
                }
            }
            SyncError::Authority { .. } | SyncError::NotFound(_) => {
                log::debug!("dropped message from {}: {}", origin, error);
            }
            SyncError::Transport(e) => log::warn!("transport error for {}: {}", origin, e),
        }
    }

    fn apply_transform_update(
        &mut self,
        origin: SessionId,
        id: EntityId,
        seq: u32,
        transform: &Transform,
    ) -> SyncResult<()> {
        if self.world.owner(id).is_none() {
            return Err(SyncError::NotFound(id));
        }
        if !self.world.can_author(id, origin) {
            return Err(SyncError::Authority {
                entity: id,
                session: origin,
            });
        }
        let Some(session) = self.sessions.get_mut(origin) else {
            return Ok(());
        };
        if session
            .transform_filter
            .accept(id, ChangeMask::TRANSFORM, seq)
            .is_empty()
        {
            log::trace!("stale transform {} for {} from {}", seq, id, origin);
            return Ok(());
        }
        self.world.apply_transform(id, transform).map(drop)
    }

    // Intents

    /// Applies an intent issued by the server itself.
    pub fn submit(&mut self, intent: Intent) -> SyncResult<Route> {
        self.apply_intent(SessionId::SERVER, intent)
    }

    /// The authority gate. Every intent, local or remote, passes through here.
    pub fn apply_intent(&mut self, origin: SessionId, intent: Intent) -> SyncResult<Route> {
        log::debug!("{} intent from {}", intent.name(), origin);

        if !origin.is_server() {
            self.world.check_client_intent(&intent)?;
        }

        if intent.class() == IntentClass::Routed {
            let id = intent
                .target()
                .ok_or_else(|| SyncError::validation("routed intent without target"))?;
            let owner = self.world.owner(id).ok_or(SyncError::NotFound(id))?;
            let routed = route(Role::Server, SessionId::SERVER, origin, owner);
            if let Route::ForwardToOwner(author) = routed {
                self.forward(author, origin, id, &intent)?;
                return Ok(routed);
            }
        }

        match intent {
            Intent::Modify { id, patch } => {
                self.world.modify_entity(id, &patch)?;
            }
            Intent::Teleport {
                id,
                position,
                rotation_y,
            } => self.world.teleport(id, position, rotation_y)?,
            Intent::Add(mut spec) => {
                let id = *spec.id.get_or_insert_with(EntityId::new);
                if !origin.is_server() {
                    if spec.kind == EntityKind::Player {
                        return Err(SyncError::validation("players are spawned by the server"));
                    }
                    if !(spec.owner == Owner::Server || spec.owner.is_session(origin)) {
                        return Err(SyncError::Authority {
                            entity: id,
                            session: origin,
                        });
                    }
                }
                if let Owner::Client(session) = spec.owner {
                    if !self.is_connected(session) {
                        return Err(SyncError::validation(format!(
                            "{} is not connected",
                            session
                        )));
                    }
                }
                self.world.add_entity(spec, true)?;
            }
            Intent::Remove { id } => {
                if !origin.is_server() {
                    let entity = self.world.get(id).ok_or(SyncError::NotFound(id))?;
                    let owner = self.world.owner(id).unwrap_or_default();
                    if entity.is_player() || !(owner == Owner::Server || owner.is_session(origin)) {
                        return Err(SyncError::Authority {
                            entity: id,
                            session: origin,
                        });
                    }
                }
                self.world.remove_entity(id);
            }
            Intent::ApplyEffect { player, effect } => {
                self.check_own_player(origin, player)?;
                self.world.apply_effect(player, effect, None)?;
            }
            Intent::CancelEffect { player } => {
                self.check_own_player(origin, player)?;
                self.world.cancel_player_effect(player, origin)?;
            }
            // Any session may damage any player by any amount; health saturates at 0.
            Intent::Damage { target, amount } => {
                let health = self.world.damage(target, amount)?;
                log::debug!("{} took {} damage, {} left", target, amount, health);
            }
            Intent::Claim { id } => self.world.claim(id, origin)?,
            Intent::Release { id } => {
                if self.world.get(id).is_none() {
                    return Err(SyncError::NotFound(id));
                }
                self.world.release(id, origin);
            }
        }

        Ok(Route::ApplyAndBroadcast)
    }

    /// Clients may only direct effects at the player they control.
    fn check_own_player(&self, origin: SessionId, player: EntityId) -> SyncResult<()> {
        if origin.is_server() {
            return Ok(());
        }
        let own = self
            .sessions
            .get(origin)
            .is_some_and(|s| s.player_id == Some(player));
        if own {
            Ok(())
        } else {
            Err(SyncError::Authority {
                entity: player,
                session: origin,
            })
        }
    }

    fn forward(
        &mut self,
        author: SessionId,
        origin: SessionId,
        entity: EntityId,
        intent: &Intent,
    ) -> SyncResult<()> {
        let session = self
            .sessions
            .get_mut(author)
            .filter(|s| s.is_connected())
            .ok_or(SyncError::Authority {
                entity,
                session: author,
            })?;
        log::debug!("forwarding {} on {} to {}", intent.name(), entity, author);
        session.send_reliable(ServerMessage::Forwarded {
            origin: origin.0,
            intent: WireIntent::from(intent),
        });
        Ok(())
    }

    // Outbound helpers for server code

    /// Queues a reliable message for one session.
    pub fn send(&mut self, session: SessionId, message: ServerMessage) -> SyncResult<()> {
        let session = self
            .sessions
            .get_mut(session)
            .filter(|s| s.is_connected())
            .ok_or_else(|| SyncError::validation(format!("{} is not connected", session)))?;
        session.send_reliable(message);
        Ok(())
    }

    /// Queues a reliable message for every connected session.
    pub fn broadcast(&mut self, message: ServerMessage) {
        for session in self.sessions.connected_mut() {
            session.send_reliable(message.clone());
        }
    }

    /// Adds `entity` to the session's interest set and sends its current state.
    pub fn subscribe(&mut self, session: SessionId, entity: EntityId) -> SyncResult<()> {
        let spec = self.world.spec_of(entity).ok_or(SyncError::NotFound(entity))?;
        let session = self
            .sessions
            .get_mut(session)
            .ok_or_else(|| SyncError::validation(format!("unknown {}", session)))?;
        if session.subscriptions.insert(entity) {
            session.send_reliable(ServerMessage::EntityAdd((&spec).into()));
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, session: SessionId, entity: EntityId) -> SyncResult<()> {
        let session = self
            .sessions
            .get_mut(session)
            .ok_or_else(|| SyncError::validation(format!("unknown {}", session)))?;
        if session.subscriptions.remove(&entity) {
            session.transform_filter.forget(entity);
            session.send_reliable(ServerMessage::EntityRemove {
                id: entity.to_bytes(),
            });
        }
        Ok(())
    }

    // Session lifecycle

    pub fn kick(&mut self, id: SessionId) -> bool {
        if let Some(session) = self.sessions.get(id) {
            self.control.push_back((session.addr, PacketType::Disconnect));
        }
        self.disconnect(id, DisconnectReason::Kicked)
    }

    pub fn shutdown(&mut self) {
        for id in self.sessions.iter().map(|s| s.id).collect::<Vec<_>>() {
            self.kick(id);
        }
    }

    /// Removes the session's player, hands its other entities back to the
    /// server and drops anything still queued for it.
    pub fn disconnect(&mut self, id: SessionId, reason: DisconnectReason) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };

        if let Some(player) = session.player_id {
            self.world.remove_entity(player);
        }
        let reclaimed = self.world.transfer_on_disconnect(id);

        log::info!(
            "{} {} ({} entities reclaimed)",
            id,
            reason.as_str(),
            reclaimed.len()
        );
        self.pending_events.push_back(ServerEvent::SessionDisconnected {
            session: id,
            reason,
            reclaimed: reclaimed.len(),
        });
        true
    }

    // Tick

    /// Advances one fixed step: drops idle sessions, advances the world,
    /// replicates the journal and flushes every session.
    pub fn tick_once<T: Transport>(&mut self, now_ms: u64, transport: &mut T) -> ReplicationStats {
        self.tick = self.tick.wrapping_add(1);

        for id in self.sessions.timed_out(now_ms) {
            self.disconnect(id, DisconnectReason::Timeout);
        }

        self.world.advance(self.tick, now_ms);
        let replicated = self.replicator.replicate(&mut self.world, &mut self.sessions);
        self.flush(now_ms, transport);
        replicated
    }

    /// Sends queued control packets and one frame per connected session.
    ///
    /// A full outbound queue is shared backpressure, not a fault of the
    /// session being flushed: the flush stops, reliable messages wait for
    /// their resend and pending best-effort samples are dropped. Only a
    /// closed transport or a session over its reliable limit disconnects.
    pub fn flush<T: Transport>(&mut self, now_ms: u64, transport: &mut T) {
        while let Some((addr, payload)) = self.control.pop_front() {
            let packet = Packet::new(PacketHeader::new(0, 0), payload);
            let bytes = match packet.serialize() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("failed to encode control packet: {}", e);
                    continue;
                }
            };
            let len = bytes.len();
            match transport.send(addr, bytes) {
                Ok(()) => self.stats.record_sent(len),
                Err(TransportError::QueueFull(_)) => {
                    log::debug!("outbound queue full, deferring control packets");
                    self.control.push_front((addr, packet.payload));
                    return;
                }
                Err(e) => log::warn!("control packet to {} failed: {}", addr, e),
            }
        }

        let mut ids = self.sessions.connected_ids();
        if !ids.is_empty() {
            // Start at a different session each tick so congestion never
            // starves the same ones.
            let start = self.tick as usize % ids.len();
            ids.rotate_left(start);
        }

        let mut failed = Vec::new();
        let mut congested_at = None;
        for (index, id) in ids.iter().enumerate() {
            let Some(session) = self.sessions.get_mut(*id) else {
                continue;
            };
            if session.reliable_in_flight() > self.config.max_reliable_in_flight {
                log::warn!(
                    "{} has {} unacked reliable messages",
                    session.id,
                    session.reliable_in_flight()
                );
                failed.push(session.id);
                continue;
            }

            let frame = ServerFrame {
                tick: self.tick,
                reliable_ack: session.inbound.ack(),
                reliable: session
                    .reliable
                    .due(now_ms)
                    .into_iter()
                    .map(|(seq, message)| SequencedServerMessage { seq, message })
                    .collect(),
                unreliable: std::mem::take(&mut session.unreliable),
            };

            let datagrams = match encode_frame(
                frame,
                &mut session.send_sequence,
                session.remote_sequence,
                self.config.max_packet_size,
            ) {
                Ok(datagrams) => datagrams,
                Err(e) => {
                    log::error!("failed to encode frame for {}: {}", session.id, e);
                    continue;
                }
            };

            for bytes in datagrams {
                let len = bytes.len();
                match transport.send(session.addr, bytes) {
                    Ok(()) => {
                        session.stats.record_sent(len);
                        self.stats.record_sent(len);
                    }
                    Err(TransportError::QueueFull(_)) => {
                        congested_at = Some(index);
                        break;
                    }
                    Err(e) => {
                        log::warn!("send to {} failed: {}", session.id, e);
                        failed.push(session.id);
                        break;
                    }
                }
            }
            if congested_at.is_some() {
                break;
            }
        }

        if let Some(index) = congested_at {
            log::debug!(
                "outbound queue full, {} sessions deferred to next tick",
                ids.len() - index - 1
            );
            for id in &ids[index + 1..] {
                if let Some(session) = self.sessions.get_mut(*id) {
                    session.unreliable.clear();
                }
            }
        }

        for id in failed {
            self.disconnect(id, DisconnectReason::TransportFailure);
        }
    }
}

fn accepted(id: SessionId, player: EntityId, tick: u32) -> PacketType {
    PacketType::ConnectionAccepted {
        session_id: id.0,
        player_id: player.to_bytes(),
        tick,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::Outbox;
    use crate::spatial::TransformCache;

    fn dispatcher() -> ServerDispatcher {
        ServerDispatcher::new(
            World::server(Box::new(TransformCache::new())),
            WorldConfig::default(),
            8,
            10_000,
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn bytes(payload: PacketType) -> Vec<u8> {
        Packet::new(PacketHeader::new(1, 0), payload)
            .serialize()
            .unwrap()
    }

    /// Runs the handshake by hand and returns the session id.
    fn connect(server: &mut ServerDispatcher, outbox: &mut Outbox, port: u16) -> SessionId {
        server.handle_packet(addr(port), &bytes(PacketType::ConnectionRequest { client_salt: 7 }), 0);
        server.flush(0, outbox);
        let challenge = outbox
            .drain()
            .find_map(|(_, b)| match Packet::deserialize(&b).unwrap().payload {
                PacketType::ConnectionChallenge { challenge, .. } => Some(challenge),
                _ => None,
            })
            .unwrap();
        server.handle_packet(
            addr(port),
            &bytes(PacketType::ChallengeResponse {
                combined_salt: challenge,
            }),
            0,
        );
        server.sessions().id_by_addr(&addr(port)).unwrap()
    }

    #[test]
    fn handshake_spawns_owned_player() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let id = connect(&mut server, &mut outbox, 4000);

        let player = server.sessions().get(id).unwrap().player_id.unwrap();
        assert_eq!(server.world().owner(player), Some(Owner::Client(id)));
        assert!(server.world().get(player).unwrap().is_player());
    }

    #[test]
    fn wrong_challenge_is_refused() {
        let mut server = dispatcher();
        server.handle_packet(addr(1), &bytes(PacketType::ConnectionRequest { client_salt: 7 }), 0);
        server.handle_packet(addr(1), &bytes(PacketType::ChallengeResponse { combined_salt: 1 }), 0);
        assert_eq!(server.sessions().connected_count(), 0);
        assert_eq!(server.world().entity_count(), 0);
    }

    #[test]
    fn garbage_does_not_disconnect() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let id = connect(&mut server, &mut outbox, 4001);

        server.handle_packet(addr(4001), &[1, 2, 3, 4, 5], 5);
        assert!(server.sessions().get(id).is_some_and(|s| s.is_connected()));
        assert_eq!(server.stats().network.packets_dropped, 1);
    }

    #[test]
    fn disconnect_removes_player_and_reclaims() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let id = connect(&mut server, &mut outbox, 4002);
        let player = server.sessions().get(id).unwrap().player_id.unwrap();

        let crate_id = server
            .submit(Intent::Add(EntitySpec::new(EntityKind::Model)))
            .map(|_| server.world().entities().find(|e| !e.is_player()).unwrap().id)
            .unwrap();
        server.apply_intent(id, Intent::Claim { id: crate_id }).unwrap();
        assert_eq!(server.world().owner(crate_id), Some(Owner::Client(id)));

        server.handle_packet(addr(4002), &bytes(PacketType::Disconnect), 10);
        assert!(server.world().get(player).is_none());
        assert_eq!(server.world().owner(crate_id), Some(Owner::Server));

        let events: Vec<_> = server.drain_events().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::SessionDisconnected {
                reason: DisconnectReason::Graceful,
                reclaimed: 1,
                ..
            }
        )));
    }

    #[test]
    fn foreign_modify_is_forwarded() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let a = connect(&mut server, &mut outbox, 4003);
        let player = server.sessions().get(a).unwrap().player_id.unwrap();

        let routed = server
            .submit(Intent::Teleport {
                id: player,
                position: glam::Vec3::new(0.0, 5.0, 0.0),
                rotation_y: None,
            })
            .unwrap();
        assert_eq!(routed, Route::ForwardToOwner(a));
        assert_eq!(
            server.world().get(player).unwrap().transform.position,
            glam::Vec3::ZERO
        );
    }

    #[test]
    fn clients_cannot_add_players_or_foreign_owned() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let a = connect(&mut server, &mut outbox, 4004);

        let player = EntitySpec::player(Owner::Client(a), Transform::default());
        assert!(matches!(
            server.apply_intent(a, Intent::Add(player)),
            Err(SyncError::Validation(_))
        ));

        let foreign = EntitySpec::new(EntityKind::Model).with_owner(Owner::Client(SessionId(99)));
        assert!(matches!(
            server.apply_intent(a, Intent::Add(foreign)),
            Err(SyncError::Authority { .. })
        ));
    }

    #[test]
    fn unsubscribe_then_subscribe_resends_state() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let id = connect(&mut server, &mut outbox, 4006);
        let entity = server
            .world_mut()
            .add_entity(EntitySpec::new(EntityKind::Model), true)
            .unwrap();
        server.tick_once(10, &mut outbox);
        assert!(server.sessions().get(id).unwrap().is_subscribed(entity));

        server.unsubscribe(id, entity).unwrap();
        assert!(!server.sessions().get(id).unwrap().is_subscribed(entity));

        let queued = server.sessions().get(id).unwrap().reliable_in_flight();
        server.subscribe(id, entity).unwrap();
        assert!(server.sessions().get(id).unwrap().is_subscribed(entity));
        assert_eq!(server.sessions().get(id).unwrap().reliable_in_flight(), queued + 1);

        assert!(matches!(
            server.subscribe(id, EntityId::new()),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn transport_loss_runs_disconnect_cleanup() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let id = connect(&mut server, &mut outbox, 4007);
        let player = server.sessions().get(id).unwrap().player_id.unwrap();

        server.handle_disconnect(addr(4007));
        assert!(server.sessions().get(id).is_none());
        assert!(server.world().get(player).is_none());
        assert!(server.drain_events().any(|e| matches!(
            e,
            ServerEvent::SessionDisconnected {
                reason: DisconnectReason::TransportFailure,
                ..
            }
        )));
    }

    #[test]
    fn add_for_unconnected_session_is_refused() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let a = connect(&mut server, &mut outbox, 4010);
        let before = server.world().entity_count();

        let orphan = EntitySpec::new(EntityKind::Model).with_owner(Owner::Client(SessionId(99)));
        assert!(matches!(
            server.submit(Intent::Add(orphan)),
            Err(SyncError::Validation(_))
        ));
        assert_eq!(server.world().entity_count(), before);

        let id = EntityId::new();
        let owned = EntitySpec::new(EntityKind::Model)
            .with_id(id)
            .with_owner(Owner::Client(a));
        server.submit(Intent::Add(owned)).unwrap();
        assert_eq!(server.world().owner(id), Some(Owner::Client(a)));
    }

    #[test]
    fn full_outbound_queue_defers_without_disconnecting() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let a = connect(&mut server, &mut outbox, 4005);
        let b = connect(&mut server, &mut outbox, 4008);

        let mut nearly_full = Outbox::bounded(1);
        server.tick_once(10, &mut nearly_full);
        assert!(server.sessions().get(a).is_some_and(|s| s.is_connected()));
        assert!(server.sessions().get(b).is_some_and(|s| s.is_connected()));
        assert!(!server.drain_events().any(|e| matches!(
            e,
            ServerEvent::SessionDisconnected { .. }
        )));

        let resend = 10 + WorldConfig::default().resend_interval_ms;
        let mut outbox = Outbox::new();
        server.tick_once(resend, &mut outbox);
        let targets: Vec<SocketAddr> = outbox.drain().map(|(to, _)| to).collect();
        assert!(targets.contains(&addr(4005)));
        assert!(targets.contains(&addr(4008)));
    }

    struct ClosedTransport;

    impl Transport for ClosedTransport {
        fn send(&mut self, addr: SocketAddr, _datagram: Vec<u8>) -> Result<(), TransportError> {
            Err(TransportError::Closed(addr))
        }
    }

    #[test]
    fn closed_transport_disconnects_session() {
        let mut server = dispatcher();
        let mut outbox = Outbox::new();
        let id = connect(&mut server, &mut outbox, 4009);

        server.tick_once(10, &mut ClosedTransport);
        assert!(server.sessions().get(id).is_none());
    }
}
