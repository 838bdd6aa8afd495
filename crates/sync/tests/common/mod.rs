#![allow(dead_code)]

use std::net::SocketAddr;

use worldsync::{
    ClientDispatcher, EntityId, Outbox, ServerDispatcher, SessionId, TransformCache, World,
    WorldConfig,
};

pub const TICK_MS: u64 = 33;

pub fn server_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 27015))
}

/// Packet loss, duplication and reordering applied to every datagram.
#[derive(Debug, Default, Clone, Copy)]
pub struct Faults {
    /// Drop every Nth datagram. Zero disables.
    pub drop_every: usize,
    /// Deliver every datagram twice, the copy one step late.
    pub duplicate: bool,
    /// Hold back every other datagram by two steps so later ones overtake it.
    pub reorder: bool,
}

#[derive(Debug, Default)]
struct Link {
    in_flight: Vec<(u64, SocketAddr, Vec<u8>)>,
    sent: usize,
}

impl Link {
    fn send(&mut self, faults: Faults, step: u64, addr: SocketAddr, bytes: Vec<u8>) {
        self.sent += 1;
        if faults.drop_every > 0 && self.sent % faults.drop_every == 0 {
            return;
        }
        let delay = if faults.reorder && self.sent % 2 == 0 { 2 } else { 0 };
        if faults.duplicate {
            self.in_flight.push((step + delay + 1, addr, bytes.clone()));
        }
        self.in_flight.push((step + delay, addr, bytes));
    }

    fn deliver(&mut self, step: u64) -> Vec<(SocketAddr, Vec<u8>)> {
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|(at, _, _)| *at <= step);
        self.in_flight = later;
        due.into_iter().map(|(_, addr, bytes)| (addr, bytes)).collect()
    }
}

/// One server and any number of clients joined by an in-memory network.
pub struct Loopback {
    pub server: ServerDispatcher,
    pub clients: Vec<(SocketAddr, ClientDispatcher)>,
    pub faults: Faults,
    pub now_ms: u64,
    step: u64,
    uplink: Link,
    downlink: Link,
}

impl Loopback {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            server: ServerDispatcher::new(
                World::server(Box::new(TransformCache::new())),
                WorldConfig::default(),
                16,
                10_000,
            ),
            clients: Vec::new(),
            faults: Faults::default(),
            now_ms: 0,
            step: 0,
            uplink: Link::default(),
            downlink: Link::default(),
        }
    }

    /// Connects a new client and runs until the handshake completes.
    pub fn join(&mut self) -> usize {
        let port = 50_000 + self.clients.len() as u16;
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let mut client = ClientDispatcher::new(
            World::client(Box::new(TransformCache::new())),
            server_addr(),
            WorldConfig::default(),
        );
        client.connect(self.now_ms);
        self.clients.push((addr, client));

        let index = self.clients.len() - 1;
        for _ in 0..50 {
            if self.client(index).is_connected() {
                break;
            }
            self.step();
        }
        assert!(self.client(index).is_connected(), "client {} never connected", index);
        self.step();
        index
    }

    pub fn client(&self, index: usize) -> &ClientDispatcher {
        &self.clients[index].1
    }

    pub fn client_mut(&mut self, index: usize) -> &mut ClientDispatcher {
        &mut self.clients[index].1
    }

    pub fn session(&self, index: usize) -> SessionId {
        self.client(index)
            .session_id()
            .expect("client is connected")
    }

    pub fn player(&self, index: usize) -> EntityId {
        self.client(index).player_id().expect("client is connected")
    }

    /// Clients send, the server ticks, clients receive.
    pub fn step(&mut self) {
        self.step += 1;
        self.now_ms += TICK_MS;

        for (addr, client) in &mut self.clients {
            let mut outbox = Outbox::new();
            // A client that overran its queue is simply disconnected.
            let _ = client.tick_once(self.now_ms, &mut outbox);
            for (_, bytes) in outbox.drain() {
                self.uplink.send(self.faults, self.step, *addr, bytes);
            }
        }

        for (from, bytes) in self.uplink.deliver(self.step) {
            self.server.handle_packet(from, &bytes, self.now_ms);
        }

        let mut outbox = Outbox::new();
        self.server.tick_once(self.now_ms, &mut outbox);
        for (to, bytes) in outbox.drain() {
            self.downlink.send(self.faults, self.step, to, bytes);
        }

        for (to, bytes) in self.downlink.deliver(self.step) {
            if let Some((_, client)) = self.clients.iter_mut().find(|(addr, _)| *addr == to) {
                client.handle_packet(&bytes, self.now_ms);
            }
        }
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Steps until `done` holds or the budget runs out.
    pub fn run_until(&mut self, steps: usize, mut done: impl FnMut(&Loopback) -> bool) -> bool {
        for _ in 0..steps {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }
}
