//! Engine configuration.
//!
//! `EngineConfig` represents the `weft.toml` file that controls lifecycle
//! event publication, event bus sizing and runtime defaults.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Weft engine. All fields have defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Publish lifecycle CloudEvents for workflow and task transitions.
    #[serde(default = "default_lifecycle_events")]
    pub lifecycle_events: bool,

    /// HTTP endpoint receiving lifecycle events in stand-alone mode.
    #[serde(default)]
    pub lifecycle_sink: Option<String>,

    /// Capacity of the in-process event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Namespace used for instances created without one.
    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    /// Timeout applied to tasks that do not declare one.
    #[serde(default)]
    pub default_task_timeout_secs: Option<u64>,
}

fn default_lifecycle_events() -> bool {
    true
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lifecycle_events: default_lifecycle_events(),
            lifecycle_sink: None,
            event_bus_capacity: default_event_bus_capacity(),
            default_namespace: default_namespace(),
            default_task_timeout_secs: None,
        }
    }
}
