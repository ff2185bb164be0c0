use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::AppError;

/// JSON values cached in Redis under a TTL. Stale reads are acceptable up
/// to the TTL; writers overwrite, never merge.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(key)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(value)?;
        let _: () = conn.set_ex(self.key(key), json, ttl_secs).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.key(key)).await?;
        Ok(())
    }

    /// Single GETDEL round-trip: at most one caller ever observes the
    /// value, even under concurrent redelivery.
    pub async fn take<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get_del(self.key(key)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: bool = conn.expire(self.key(key), ttl_secs as i64).await?;
        Ok(())
    }
}

/// JSON state store with a process-local fallback. Backed by Redis in
/// production; without a cache handle (tests, dry runs) values live in the
/// process, TTLs untracked.
pub struct JsonStore {
    cache: Option<RedisCache>,
    local: tokio::sync::RwLock<std::collections::HashMap<String, String>>,
}

impl JsonStore {
    pub fn new(cache: Option<RedisCache>) -> Self {
        Self {
            cache,
            local: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        match &self.cache {
            Some(cache) => cache.get(key).await,
            None => {
                let local = self.local.read().await;
                match local.get(key) {
                    Some(json) => Ok(Some(serde_json::from_str(json)?)),
                    None => Ok(None),
                }
            }
        }
    }

    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), AppError> {
        match &self.cache {
            Some(cache) => cache.set(key, value, ttl_secs).await,
            None => {
                self.local
                    .write()
                    .await
                    .insert(key.to_string(), serde_json::to_string(value)?);
                Ok(())
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<(), AppError> {
        match &self.cache {
            Some(cache) => cache.delete(key).await,
            None => {
                self.local.write().await.remove(key);
                Ok(())
            }
        }
    }

    /// Atomically loads and removes, so exactly one caller settles a
    /// continuation even when a consumer group redelivers the same entry
    /// to a second, slower worker.
    pub async fn take<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        match &self.cache {
            Some(cache) => cache.take(key).await,
            None => {
                // One write guard spans the read and the removal.
                let mut local = self.local.write().await;
                match local.remove(key) {
                    Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                    None => Ok(None),
                }
            }
        }
    }
}

/// Key builders shared across services so owners and readers agree.
pub mod keys {
    use uuid::Uuid;

    pub fn ingestion_task(task_id: &str) -> String {
        format!("ingestion:task:{task_id}")
    }

    pub fn session(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    pub fn agent_config(agent_id: &Uuid) -> String {
        format!("agent_config:{agent_id}")
    }

    pub fn history(tenant_id: &Uuid, session_id: &str, agent_id: &Uuid) -> String {
        format!("history:{tenant_id}:{session_id}:{agent_id}")
    }

    pub fn pending_chat(id: &Uuid) -> String {
        format!("execution:pending:{id}")
    }

    pub fn pending_query(id: &Uuid) -> String {
        format!("query:pending:{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::{keys, JsonStore};
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn take_yields_the_value_to_exactly_one_caller() {
        let store = JsonStore::new(None);
        store.put("k", &42u32, 60).await.unwrap();
        assert_eq!(store.take::<u32>("k").await.unwrap(), Some(42));
        assert_eq!(store.take::<u32>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_takes_settle_once() {
        let store = Arc::new(JsonStore::new(None));
        store.put("k", &1u32, 60).await.unwrap();

        let first = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.take::<u32>("k").await.unwrap() })
        };
        let second = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.take::<u32>("k").await.unwrap() })
        };
        let outcomes = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| o.is_some()).count(), 1);
    }

    #[test]
    fn key_builders_are_scoped_per_owner() {
        let tenant = Uuid::nil();
        let agent = Uuid::nil();
        assert_eq!(keys::ingestion_task("t1"), "ingestion:task:t1");
        assert!(keys::history(&tenant, "s1", &agent).starts_with("history:"));
        assert_ne!(
            keys::pending_chat(&Uuid::nil()),
            keys::pending_query(&Uuid::nil())
        );
    }
}
