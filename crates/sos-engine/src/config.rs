//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between the first unsaved change and the state write.
    pub save_debounce_ms: u64,
    /// Capacity of the per-view command queue.
    pub queue_depth: usize,
    /// Largest inbound payload (in items) the engine will apply.
    pub max_items_per_message: usize,
    /// How many recently received peer manifests are kept as delta bases.
    pub peer_manifest_history: usize,
}

impl EngineConfig {
    /// The save debounce as a [`Duration`].
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: 200,
            queue_depth: 256,
            max_items_per_message: 100_000,
            peer_manifest_history: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.save_debounce(), Duration::from_millis(200));
        assert!(config.queue_depth > 0);
        assert!(config.peer_manifest_history > 0);
    }
}
