use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::config::WorldConfig;
use crate::types::{EntityId, Role, SessionId};

use super::channel::{OrderedReceiver, ReliableSender, SequenceFilter};
use super::protocol::{ClientMessage, ServerMessage, sequence_greater_than};
use super::stats::{NetworkStats, random_salt};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ChallengeResponse,
    Connected,
}

/// One remote client as seen by the server.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub role: Role,
    pub state: ConnectionState,
    pub client_salt: u64,
    pub server_salt: u64,
    pub last_receive_ms: u64,
    pub player_id: Option<EntityId>,
    pub subscriptions: HashSet<EntityId>,
    /// New entities are subscribed automatically.
    pub follow_new_entities: bool,
    pub stats: NetworkStats,
    pub(crate) needs_full_sync: bool,
    pub(crate) reliable: ReliableSender<ServerMessage>,
    pub(crate) unreliable: Vec<ServerMessage>,
    pub(crate) inbound: OrderedReceiver<ClientMessage>,
    pub(crate) transform_filter: SequenceFilter,
    pub(crate) send_sequence: u32,
    pub(crate) remote_sequence: u32,
}

impl Session {
    pub fn new(addr: SocketAddr, id: SessionId, client_salt: u64, config: &WorldConfig) -> Self {
        Self {
            id,
            addr,
            role: Role::Client,
            state: ConnectionState::Connecting,
            client_salt,
            server_salt: random_salt(),
            last_receive_ms: 0,
            player_id: None,
            subscriptions: HashSet::new(),
            follow_new_entities: true,
            stats: NetworkStats::default(),
            needs_full_sync: false,
            reliable: ReliableSender::new(config.resend_interval_ms),
            unreliable: Vec::new(),
            inbound: OrderedReceiver::new(),
            transform_filter: SequenceFilter::new(),
            send_sequence: 0,
            remote_sequence: 0,
        }
    }

    pub fn combined_salt(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_subscribed(&self, entity: EntityId) -> bool {
        self.subscriptions.contains(&entity)
    }

    pub fn is_timed_out(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_receive_ms) > timeout_ms
    }

    pub fn touch(&mut self, now_ms: u64, sequence: u32) {
        self.last_receive_ms = now_ms;
        if sequence_greater_than(sequence, self.remote_sequence) {
            self.remote_sequence = sequence;
        }
    }

    pub fn reliable_in_flight(&self) -> usize {
        self.reliable.in_flight()
    }

    pub(crate) fn send_reliable(&mut self, message: ServerMessage) {
        self.reliable.push(message);
    }

    pub(crate) fn send_unreliable(&mut self, message: ServerMessage) {
        self.unreliable.push(message);
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions_by_addr: HashMap<SocketAddr, SessionId>,
    sessions: HashMap<SessionId, Session>,
    next_session_id: u32,
    max_sessions: usize,
    timeout_ms: u64,
    config: WorldConfig,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, config: WorldConfig) -> Self {
        Self::with_timeout(max_sessions, DEFAULT_TIMEOUT_MS, config)
    }

    pub fn with_timeout(max_sessions: usize, timeout_ms: u64, config: WorldConfig) -> Self {
        Self {
            sessions_by_addr: HashMap::new(),
            sessions: HashMap::new(),
            next_session_id: 1,
            max_sessions,
            timeout_ms,
            config,
        }
    }

    pub fn get_or_create_pending(
        &mut self,
        addr: SocketAddr,
        client_salt: u64,
        now_ms: u64,
    ) -> Result<&mut Session, &'static str> {
        if let Some(&id) = self.sessions_by_addr.get(&addr) {
            return self.sessions.get_mut(&id).ok_or("stale session address");
        }

        if self.sessions.len() >= self.max_sessions {
            return Err("Server full");
        }

        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;

        let mut session = Session::new(addr, id, client_salt, &self.config);
        session.last_receive_ms = now_ms;
        self.sessions_by_addr.insert(addr, id);
        Ok(self.sessions.entry(id).or_insert(session))
    }

    pub fn id_by_addr(&self, addr: &SocketAddr) -> Option<SessionId> {
        self.sessions_by_addr.get(addr).copied()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Removing a session drops everything still queued for it.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        self.sessions_by_addr.remove(&session.addr);
        Some(session)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn connected_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut().filter(|s| s.is_connected())
    }

    /// Connected session ids in ascending order.
    pub fn connected_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }

    /// Sessions idle for longer than the timeout. The caller disconnects them.
    pub fn timed_out(&self, now_ms: u64) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_timed_out(now_ms, self.timeout_ms))
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_connected()).count()
    }

    pub fn total_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn allocates_from_one() {
        let mut registry = SessionRegistry::new(4, WorldConfig::default());
        let a = registry.get_or_create_pending(addr(1), 11, 0).unwrap().id;
        let b = registry.get_or_create_pending(addr(2), 22, 0).unwrap().id;
        assert_eq!((a, b), (SessionId(1), SessionId(2)));

        let again = registry.get_or_create_pending(addr(1), 11, 0).unwrap().id;
        assert_eq!(again, a);
    }

    #[test]
    fn refuses_when_full() {
        let mut registry = SessionRegistry::new(1, WorldConfig::default());
        registry.get_or_create_pending(addr(1), 0, 0).unwrap();
        assert!(registry.get_or_create_pending(addr(2), 0, 0).is_err());
    }

    #[test]
    fn idle_sessions_time_out() {
        let mut registry = SessionRegistry::with_timeout(4, 1000, WorldConfig::default());
        let id = registry.get_or_create_pending(addr(1), 0, 0).unwrap().id;
        assert!(registry.timed_out(1000).is_empty());
        assert_eq!(registry.timed_out(1001), vec![id]);

        registry.get_mut(id).unwrap().touch(1001, 1);
        assert!(registry.timed_out(1500).is_empty());
    }

    #[test]
    fn remove_clears_address() {
        let mut registry = SessionRegistry::new(4, WorldConfig::default());
        let id = registry.get_or_create_pending(addr(1), 0, 0).unwrap().id;
        assert!(registry.remove(id).is_some());
        assert!(registry.id_by_addr(&addr(1)).is_none());
        assert_eq!(registry.total_count(), 0);
    }
}
