//! Per-tile initial attach delay: `seed + index * spacing`.
use rand::Rng;
use std::time::Duration;

use multiview_proto::config::StaggerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaggerSchedule {
    seed: Duration,
    spacing: Duration,
}

impl StaggerSchedule {
    pub fn new(seed: Duration, spacing: Duration) -> Self {
        Self { seed, spacing }
    }

    /// No delay at all; used by tests and explicit reattach.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Fixed seed when configured, otherwise drawn once from `[0, max_seed_ms)`.
    pub fn from_config(config: &StaggerConfig) -> Self {
        let seed_ms = match config.seed_ms {
            Some(seed) => seed,
            None if config.max_seed_ms > 0 => rand::thread_rng().gen_range(0..config.max_seed_ms),
            None => 0,
        };
        Self::new(
            Duration::from_millis(seed_ms),
            Duration::from_millis(config.spacing_ms),
        )
    }

    pub fn seed(&self) -> Duration {
        self.seed
    }

    pub fn delay(&self, index: usize) -> Duration {
        self.seed + self.spacing * index as u32
    }
}
