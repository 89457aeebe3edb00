use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};

use super::error::StorageError;
use super::storage::TokenStorage;
use crate::models::TokenStorageEntity;

const KEY_PREFIX: &str = "token:";

/// Token storage on Redis. Entries expire with the token they record.
#[derive(Clone)]
pub struct RedisTokenStorage {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisTokenStorage {
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        // ConnectionManager reconnects on its own.
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            StorageError::Redis(e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    pub async fn health_check(&self) -> Result<(), StorageError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(StorageError::Redis)
    }
}

fn key(id: &str) -> String {
    format!("{}{}", KEY_PREFIX, id)
}

#[async_trait]
impl TokenStorage for RedisTokenStorage {
    /// `SET NX EX`: only the first writer of an id wins.
    async fn save_token(
        &self,
        entity: &TokenStorageEntity,
        ttl_seconds: i64,
    ) -> Result<bool, StorageError> {
        let mut conn = self.manager.clone();
        let value = serde_json::to_string(entity)?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key(&entity.id))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn token_by_id(&self, id: &str) -> Result<Option<TokenStorageEntity>, StorageError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key(id))
            .query_async(&mut conn)
            .await?;

        value
            .map(|v| serde_json::from_str(&v).map_err(StorageError::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_namespaced() {
        assert_eq!(key("abc"), "token:abc");
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        assert!(RedisTokenStorage::new("not-a-redis-url").await.is_err());
    }
}
