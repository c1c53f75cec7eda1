//! Storage for persisted cron fire times.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Key-value store of the next fire time per job.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    async fn get(&self, key: &str) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Stores `at`, or clears the key when `at` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unreachable.
    async fn set(&self, key: &str, at: Option<DateTime<Utc>>) -> anyhow::Result<()>;
}

/// Process-local offset store.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: DashMap<String, DateTime<Utc>>,
}

impl MemoryOffsetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self.offsets.get(key).map(|v| *v))
    }

    async fn set(&self, key: &str, at: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        match at {
            Some(at) => {
                self.offsets.insert(key.to_string(), at);
            }
            None => {
                self.offsets.remove(key);
            }
        }
        Ok(())
    }
}

/// Redis-backed offset store. Values are unix milliseconds.
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisOffsetStore {
    client: redis::Client,
}

#[cfg(feature = "redis")]
impl RedisOffsetStore {
    /// # Errors
    ///
    /// Returns an error if `url` is not a valid redis URL.
    pub fn open(url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }

    #[must_use]
    pub fn from_client(client: redis::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl OffsetStore for RedisOffsetStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let millis: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(millis.and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    async fn set(&self, key: &str, at: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        match at {
            Some(at) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(at.timestamp_millis())
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
            None => {
                redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_sets_and_clears() {
        let store = MemoryOffsetStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);
        let t = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        store.set("a", Some(t)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(t));
        store.set("a", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }
}
