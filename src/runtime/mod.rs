pub mod engine;
pub mod log;
pub mod redis_log;
pub mod token;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    /// Auto-stepping on the configured delay.
    Running,
    /// Every live token is parked and one of them is exposed as the pending
    /// decision; the clock is stopped until input arrives.
    AwaitingDecision,
    /// Clock stopped, tokens retained.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerTag {
    /// A token occupies this node or edge.
    Active,
}

impl MarkerTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerTag::Active => "active",
        }
    }
}

/// Canvas-highlighting sink supplied by the host. The engine only reports
/// which nodes and edges hold tokens; rendering is not its business.
pub trait MarkerSink: Send + Sync {
    fn add_marker(&self, element_id: &str, tag: MarkerTag);
    fn remove_marker(&self, element_id: &str, tag: MarkerTag);
}

/// Default sink for headless runs.
pub struct NullMarkerSink;

impl MarkerSink for NullMarkerSink {
    fn add_marker(&self, _element_id: &str, _tag: MarkerTag) {}
    fn remove_marker(&self, _element_id: &str, _tag: MarkerTag) {}
}

/// Run configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Auto-step period while `Running`.
    pub delay: Duration,
    /// Value unknown guard variables resolve to, if configured.
    pub condition_fallback: Option<bool>,
    /// Delay for timer events without a parseable definition.
    pub timer_fallback: Duration,
    /// Auto-resume delay for message waits.
    pub message_delay: Duration,
    /// Context seeded on every start/reset.
    pub seed_context: HashMap<String, Value>,
    /// Storage key the run log persists under.
    pub log_key: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            condition_fallback: None,
            timer_fallback: Duration::from_secs(2),
            message_delay: Duration::from_secs(1),
            seed_context: HashMap::new(),
            log_key: "default".to_string(),
        }
    }
}
