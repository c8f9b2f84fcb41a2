//! Redis key-value store implementation.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Commands, Connection};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    error::StorageError,
    traits::{BlockingKvStore, KvStore},
};

/// Redis-based key-value store.
///
/// Async calls go through a multiplexed [`ConnectionManager`]; blocking calls
/// use one lazily opened synchronous connection.
pub struct RedisKvStore {
    client: Client,
    conn: ConnectionManager,
    blocking: Mutex<Option<Connection>>,
}

impl RedisKvStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if connection fails.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        info!(url = %url, "Connecting to Redis");

        let client =
            Client::open(url).map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        info!("Connected to Redis");

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(None),
        })
    }

    fn with_blocking<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
        on_err: impl FnOnce(String) -> StorageError,
    ) -> Result<T, StorageError> {
        let mut slot = self
            .blocking
            .lock()
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        if slot.is_none() {
            let conn = self
                .client
                .get_connection()
                .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
            *slot = Some(conn);
        }

        let conn = slot
            .as_mut()
            .ok_or_else(|| StorageError::ConnectionFailed("no blocking connection".into()))?;

        match op(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                // Drop the connection so the next call reconnects.
                *slot = None;
                Err(on_err(e.to_string()))
            }
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut conn = self.conn.clone();

        conn.get(key)
            .await
            .map_err(|e| StorageError::GetFailed(e.to_string()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();

        debug!(key = %key, ttl = ?ttl, "Setting key");

        if let Some(ttl) = ttl {
            conn.pset_ex(key, value, ttl_millis(ttl))
                .await
                .map_err(|e| StorageError::SetFailed(e.to_string()))
        } else {
            conn.set(key, value)
                .await
                .map_err(|e| StorageError::SetFailed(e.to_string()))
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();

        conn.del(key)
            .await
            .map_err(|e| StorageError::DeleteFailed(e.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();

        conn.exists(key)
            .await
            .map_err(|e| StorageError::QueryFailed(e.to_string()))
    }
}

impl BlockingKvStore for RedisKvStore {
    fn get_blocking(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.with_blocking(|conn| conn.get(key), StorageError::GetFailed)
    }

    fn set_blocking(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        debug!(key = %key, ttl = ?ttl, "Setting key (blocking)");
        match ttl {
            Some(ttl) => self.with_blocking(
                |conn| conn.pset_ex(key, value, ttl_millis(ttl)),
                StorageError::SetFailed,
            ),
            None => self.with_blocking(|conn| conn.set(key, value), StorageError::SetFailed),
        }
    }

    fn delete_blocking(&self, key: &str) -> Result<(), StorageError> {
        self.with_blocking(|conn| conn.del(key), StorageError::DeleteFailed)
    }

    fn exists_blocking(&self, key: &str) -> Result<bool, StorageError> {
        self.with_blocking(|conn| conn.exists(key), StorageError::QueryFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
