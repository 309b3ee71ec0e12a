//! Engine configuration.

use std::time::Duration;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many member units of one aggregate firing may run at once.
    pub member_parallelism: usize,
    /// How long one aggregate firing may wait for its members before the
    /// firing is failed at the engine level.
    pub fan_in_ceiling: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            member_parallelism: 5,
            fan_in_ceiling: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member_parallelism(mut self, parallelism: usize) -> Self {
        self.member_parallelism = parallelism;
        self
    }

    pub fn with_fan_in_ceiling(mut self, ceiling: Duration) -> Self {
        self.fan_in_ceiling = ceiling;
        self
    }
}
