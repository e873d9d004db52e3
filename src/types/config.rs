//! Configuration types
//!
//! Invoker configuration, passed in explicitly at construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Invoker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Skip the model entirely and echo the rendered prompt back
    pub ui_dev_mode: bool,
    /// Simulated latency of a dev mode response, in milliseconds
    pub dev_mode_delay_ms: u64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            ui_dev_mode: false,
            dev_mode_delay_ms: 1000,
        }
    }
}

impl InvokerConfig {
    pub fn dev_mode_delay(&self) -> Duration {
        Duration::from_millis(self.dev_mode_delay_ms)
    }
}
