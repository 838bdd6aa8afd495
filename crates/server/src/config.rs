use std::net::SocketAddr;

use worldsync::{DEFAULT_PORT, DEFAULT_TICK_RATE, WorldConfig};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub tick_rate: u32,
    pub max_sessions: usize,
    pub session_timeout_ms: u64,
    /// Datagrams that may wait for the socket writer before sends fail.
    pub outbound_queue: usize,
    pub turntables: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tick_rate: DEFAULT_TICK_RATE,
            max_sessions: 32,
            session_timeout_ms: 30_000,
            outbound_queue: 4096,
            turntables: 4,
        }
    }
}

impl ServerConfig {
    pub fn world_config(&self) -> WorldConfig {
        WorldConfig {
            tick_rate: self.tick_rate,
            ..Default::default()
        }
    }
}
