/// Fixed-rate tick accumulator. Wall-clock deltas go in, whole ticks come out.
#[derive(Debug, Clone)]
pub struct FixedTimestep {
    tick_rate: u32,
    tick_ms: u64,
    accumulator_ms: u64,
    /// Upper bound on catch-up after a stall.
    max_backlog_ms: u64,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        let tick_ms = (1000 / tick_rate as u64).max(1);
        Self {
            tick_rate,
            tick_ms,
            accumulator_ms: 0,
            max_backlog_ms: tick_ms * 8,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    pub fn accumulate(&mut self, delta_ms: u64) {
        self.accumulator_ms = (self.accumulator_ms + delta_ms).min(self.max_backlog_ms);
    }

    pub fn should_tick(&self) -> bool {
        self.accumulator_ms >= self.tick_ms
    }

    pub fn consume_tick(&mut self) -> bool {
        if self.accumulator_ms >= self.tick_ms {
            self.accumulator_ms -= self.tick_ms;
            true
        } else {
            false
        }
    }

    /// Fraction of the next tick already elapsed.
    pub fn alpha(&self) -> f32 {
        self.accumulator_ms as f32 / self.tick_ms as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_timestep_accumulation() {
        let mut ts = FixedTimestep::new(30);
        assert_eq!(ts.tick_ms(), 33);

        ts.accumulate(70);
        assert!(ts.should_tick());
        assert!(ts.consume_tick());
        assert!(ts.consume_tick());
        assert!(!ts.consume_tick());
        assert!(ts.alpha() > 0.0 && ts.alpha() < 1.0);
    }

    #[test]
    fn stalls_do_not_spiral() {
        let mut ts = FixedTimestep::new(30);
        ts.accumulate(10_000);

        let mut ticks = 0;
        while ts.consume_tick() {
            ticks += 1;
        }
        assert_eq!(ticks, 8);
    }
}
