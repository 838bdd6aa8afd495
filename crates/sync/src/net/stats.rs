use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

impl NetworkStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn record_dropped(&mut self) {
        self.packets_dropped += 1;
    }

    /// Folds one ping sample into the smoothed round trip estimate.
    pub fn record_rtt(&mut self, sample_ms: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        if self.rtt_ms == 0.0 {
            self.rtt_ms = sample_ms;
            self.rtt_variance = sample_ms / 2.0;
            return;
        }
        let diff = (sample_ms - self.rtt_ms).abs();
        self.rtt_variance = (1.0 - BETA) * self.rtt_variance + BETA * diff;
        self.rtt_ms = (1.0 - ALPHA) * self.rtt_ms + ALPHA * sample_ms;
    }
}

/// Handshake salt. Not cryptographic; it only has to be hard to guess for an
/// off-path spoofer.
pub fn random_salt() -> u64 {
    let mut hasher = RandomState::new().build_hasher();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    hasher.write_u64(nanos);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_rtt() {
        let mut stats = NetworkStats::default();
        stats.record_rtt(80.0);
        assert_eq!(stats.rtt_ms, 80.0);

        stats.record_rtt(160.0);
        assert!(stats.rtt_ms > 80.0 && stats.rtt_ms < 160.0);
    }

    #[test]
    fn salts_differ() {
        assert_ne!(random_salt(), random_salt());
    }
}
