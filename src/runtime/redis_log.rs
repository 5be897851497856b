use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

use crate::runtime::log::{LogStore, RunLogEntry};

/// Redis-backed run-log persistence: one string key holding the JSON array.
pub struct RedisLogStore {
    client: redis::Client,
}

impl RedisLogStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(redis::Client::open(url)?))
    }

    fn log_key(&self, key: &str) -> String {
        format!("tokensim:log:{key}")
    }
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn save(&self, key: &str, entries: &[RunLogEntry]) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(entries)?;
        let _: () = conn.set(self.log_key(key), serialized).await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Vec<RunLogEntry> {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Redis unavailable, treating run log as empty");
                return Vec::new();
            }
        };
        let raw: Option<String> = match conn.get(self.log_key(key)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to read run log from redis");
                return Vec::new();
            }
        };
        match raw {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(key, error = %e, "Stored run log is corrupt, treating as empty");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.log_key(key)).await?;
        Ok(())
    }
}
