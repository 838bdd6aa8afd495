use crate::net::{DEFAULT_TICK_RATE, MAX_PACKET_SIZE};

#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub tick_rate: u32,
    /// Unacked reliable messages are resent after this long.
    pub resend_interval_ms: u64,
    /// Reliable messages a session may have in flight before it is dropped.
    pub max_reliable_in_flight: usize,
    pub max_packet_size: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            resend_interval_ms: 100,
            max_reliable_in_flight: 4096,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl WorldConfig {
    pub fn tick_ms(&self) -> u64 {
        (1000 / self.tick_rate.max(1)) as u64
    }
}
