use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Finished request ids remembered so late events are recognised as
    /// post-terminal instead of uncorrelated.
    pub tombstone_capacity: usize,
    pub command_channel_capacity: usize,
    /// Quiet period a verdict waits for late failure records.
    pub settle_ms: u64,
}

impl EngineConfig {
    pub fn settle_period(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tombstone_capacity: 1024,
            command_channel_capacity: 1024,
            settle_ms: 1000,
        }
    }
}
