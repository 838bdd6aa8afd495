use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use worldsync::{
    FixedTimestep, MAX_PACKET_SIZE, ServerDispatcher, ServerEvent, ServerStats, SessionId,
    TransformCache, Transport, TransportError, World,
};

use crate::config::ServerConfig;
use crate::simulation::{populate, simulate_world, spawn_point};

/// One datagram read off the socket.
#[derive(Debug)]
pub struct Inbound {
    pub addr: SocketAddr,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub enum Command {
    Kick(SessionId),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub player: Option<worldsync::EntityId>,
    pub idle_ms: u64,
    pub packets_received: u64,
    pub in_flight: usize,
}

/// What the dashboard shows, republished every tick.
#[derive(Debug, Clone)]
pub struct Dashboard {
    pub local_addr: SocketAddr,
    pub uptime_secs: u64,
    pub stats: ServerStats,
    pub sessions: Vec<SessionInfo>,
}

/// Hands datagrams to the writer task. Never blocks the tick loop.
struct ChannelTransport {
    tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
}

impl Transport for ChannelTransport {
    fn send(&mut self, addr: SocketAddr, datagram: Vec<u8>) -> Result<(), TransportError> {
        self.tx.try_send((addr, datagram)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(addr),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(addr),
        })
    }
}

pub struct WorldServer {
    dispatcher: ServerDispatcher,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: ServerConfig,
    started: Instant,
}

impl WorldServer {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        let local_addr = socket.local_addr()?;

        let mut world = World::server(Box::new(TransformCache::new()));
        populate(&mut world, config.turntables)?;

        let mut dispatcher = ServerDispatcher::new(
            world,
            config.world_config(),
            config.max_sessions,
            config.session_timeout_ms,
        );
        dispatcher.set_spawn(spawn_point());

        Ok(Self {
            dispatcher,
            socket: Arc::new(socket),
            local_addr,
            config,
            started: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs until a `Shutdown` command arrives or the command channel closes.
    /// Lifecycle events go to `events`; a fresh dashboard is published each
    /// tick.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<ServerEvent>,
        dashboard: watch::Sender<Dashboard>,
    ) -> anyhow::Result<()> {
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(self.config.outbound_queue);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue);

        let reader = tokio::spawn(read_socket(Arc::clone(&self.socket), inbound_tx));
        let writer = tokio::spawn(write_socket(Arc::clone(&self.socket), outbound_rx));
        let mut transport = ChannelTransport { tx: outbound_tx };

        let mut timestep = FixedTimestep::new(self.config.tick_rate);
        let dt = timestep.tick_ms() as f32 / 1000.0;
        let mut interval = tokio::time::interval(Duration::from_millis(timestep.tick_ms()));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = Instant::now();

        log::info!(
            "listening on {} at {} ticks/s, {} sessions max",
            self.local_addr,
            timestep.tick_rate(),
            self.config.max_sessions
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                command = commands.recv() => match command {
                    Some(Command::Kick(id)) => {
                        if self.dispatcher.kick(id) {
                            log::info!("kicked {}", id);
                        }
                        continue;
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }

            let now = Instant::now();
            timestep.accumulate(now.duration_since(last).as_millis() as u64);
            last = now;

            let now_ms = self.now_ms();
            while let Ok(inbound) = inbound_rx.try_recv() {
                self.dispatcher
                    .handle_packet(inbound.addr, &inbound.data, now_ms);
            }

            while timestep.consume_tick() {
                simulate_world(self.dispatcher.world_mut(), dt);
                self.dispatcher.tick_once(now_ms, &mut transport);
            }

            for event in self.dispatcher.drain_events() {
                if events.send(event).is_err() {
                    log::debug!("event listener gone");
                }
            }
            dashboard.send_replace(self.dashboard());
        }

        log::info!("shutting down");
        self.dispatcher.shutdown();
        let now_ms = self.now_ms();
        self.dispatcher.flush(now_ms, &mut transport);
        for event in self.dispatcher.drain_events() {
            let _ = events.send(event);
        }

        reader.abort();
        drop(transport);
        if let Err(e) = writer.await {
            log::warn!("writer task ended abnormally: {}", e);
        }
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn dashboard(&self) -> Dashboard {
        let now_ms = self.now_ms();
        Dashboard {
            local_addr: self.local_addr,
            uptime_secs: self.started.elapsed().as_secs(),
            stats: self.dispatcher.stats(),
            sessions: self
                .dispatcher
                .sessions()
                .iter()
                .filter(|s| s.is_connected())
                .map(|s| SessionInfo {
                    id: s.id,
                    addr: s.addr,
                    player: s.player_id,
                    idle_ms: now_ms.saturating_sub(s.last_receive_ms),
                    packets_received: s.stats.packets_received,
                    in_flight: s.reliable_in_flight(),
                })
                .collect(),
        }
    }
}

async fn read_socket(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE * 2];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                let inbound = Inbound {
                    addr,
                    data: buf[..len].to_vec(),
                };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
            // Vanished peers can surface as recv errors; their sessions time out.
            Err(e) => log::debug!("recv error: {}", e),
        }
    }
}

async fn write_socket(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>) {
    while let Some((addr, datagram)) = rx.recv().await {
        if let Err(e) = socket.send_to(&datagram, addr).await {
            log::warn!("send to {} failed: {}", addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_reports_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        let mut transport = ChannelTransport { tx };
        let addr = SocketAddr::from(([127, 0, 0, 1], 9));

        assert!(transport.send(addr, vec![1]).is_ok());
        assert!(matches!(
            transport.send(addr, vec![2]),
            Err(TransportError::QueueFull(_))
        ));
    }

    #[test]
    fn closed_channel_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut transport = ChannelTransport { tx };
        let addr = SocketAddr::from(([127, 0, 0, 1], 9));

        assert!(matches!(
            transport.send(addr, vec![1]),
            Err(TransportError::Closed(_))
        ));
    }
}
