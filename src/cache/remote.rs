//! Remote cache tier: an optional shared tier behind the
//! in-process [`crate::cache::store::RpcCache`]. The one real
//! implementation, [`RedisCache`], wraps `redis`'s async
//! `ConnectionManager`; callers treat a timeout or transport error as a
//! miss (`get`/`get_batch`) or a logged-and-dropped write (`set`), never
//! as a request failure — the remote tier is an optimization, not a
//! dependency.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::RpcProxyError;

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    read_timeout: Duration,
}

impl RedisCache {
    pub async fn connect(url: &str, read_timeout: Duration) -> Result<Self, RpcProxyError> {
        let client = redis::Client::open(url)
            .map_err(|e| RpcProxyError::InternalError(format!("redis url {url}: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| RpcProxyError::InternalError(format!("redis connect {url}: {e}")))?;
        Ok(Self { conn, read_timeout })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RpcProxyError> {
        let mut conn = self.conn.clone();
        match tokio::time::timeout(self.read_timeout, conn.get::<_, Option<String>>(key)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "redis get failed, treating as miss");
                Ok(None)
            }
            Err(_) => {
                warn!(key = %key, "redis get timed out, treating as miss");
                Ok(None)
            }
        }
    }

    pub async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<String>>, RpcProxyError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        match tokio::time::timeout(self.read_timeout, conn.mget::<_, Vec<Option<String>>>(keys)).await {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(e)) => {
                warn!(error = %e, "redis mget failed, treating as all-miss");
                Ok(vec![None; keys.len()])
            }
            Err(_) => {
                warn!("redis mget timed out, treating as all-miss");
                Ok(vec![None; keys.len()])
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RpcProxyError> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let result = tokio::time::timeout(self.read_timeout, conn.set_ex::<_, _, ()>(key, value, secs)).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "redis set failed, dropping write");
                Ok(())
            }
            Err(_) => {
                warn!(key = %key, "redis set timed out, dropping write");
                Ok(())
            }
        }
    }

    pub async fn clear(&self, key: &str) -> Result<(), RpcProxyError> {
        let mut conn = self.conn.clone();
        let _: Result<(), _> = conn.del(key).await;
        Ok(())
    }
}
