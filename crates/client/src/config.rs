use std::net::SocketAddr;

use worldsync::{DEFAULT_PORT, DEFAULT_TICK_RATE, WorldConfig};

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub server: SocketAddr,
    pub tick_rate: u32,
    /// Entities the bot creates and keeps for itself.
    pub crates: usize,
    /// Also try to take over one server-driven entity.
    pub claim_server_entity: bool,
    pub run_secs: u64,
    pub connect_timeout_ms: u64,
    pub report_interval_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            tick_rate: DEFAULT_TICK_RATE,
            crates: 2,
            claim_server_entity: true,
            run_secs: 30,
            connect_timeout_ms: 5_000,
            report_interval_ms: 5_000,
        }
    }
}

impl BotConfig {
    pub fn world_config(&self) -> WorldConfig {
        WorldConfig {
            tick_rate: self.tick_rate,
            ..Default::default()
        }
    }
}
