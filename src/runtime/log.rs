use async_trait::async_trait;
use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// One token placement. Appended for every placement including synthetic
/// joins, boundary spawns and message-spawned tokens; never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub token_id: u64,
    pub element_id: String,
    pub element_name: Option<String>,
    pub edge_id: Option<String>,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// External key-value persistence for the run log. The whole log is stored as
/// one JSON array under a single key; a missing or corrupt value loads as
/// "no prior run" rather than an error.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn save(&self, key: &str, entries: &[RunLogEntry]) -> Result<()>;
    async fn load(&self, key: &str) -> Vec<RunLogEntry>;
    async fn clear(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryLogStore {
    values: DashMap<String, String>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: inject a raw stored value (possibly corrupt).
    pub fn put_raw(&self, key: &str, raw: &str) {
        self.values.insert(key.to_string(), raw.to_string());
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn save(&self, key: &str, entries: &[RunLogEntry]) -> Result<()> {
        let serialized = serde_json::to_string(entries)?;
        self.values.insert(key.to_string(), serialized);
        Ok(())
    }

    async fn load(&self, key: &str) -> Vec<RunLogEntry> {
        let Some(raw) = self.values.get(key) else {
            return Vec::new();
        };
        match serde_json::from_str(raw.value()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(key, error = %e, "Stored run log is corrupt, treating as empty");
                Vec::new()
            }
        }
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}
