//! Cache group: composes the in-process memory tier with an
//! optional Redis primary and zero or more read replicas, presenting one
//! `get`/`get_batch`/`set`/`clear` surface to the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use crate::cache::remote::RedisCache;
use crate::cache::store::RpcCache;
use crate::jsonrpc::JsonRpcResponse;

#[derive(Clone)]
pub struct CacheGroup {
    memory: RpcCache,
    primary: Option<RedisCache>,
    replicas: Vec<RedisCache>,
    test_before_add: bool,
}

impl CacheGroup {
    pub fn new(memory: RpcCache, primary: Option<RedisCache>, replicas: Vec<RedisCache>, test_before_add: bool) -> Self {
        Self {
            memory,
            primary,
            replicas,
            test_before_add,
        }
    }

    pub fn memory_only(memory: RpcCache) -> Self {
        Self::new(memory, None, Vec::new(), false)
    }

    /// Memory tier first; on miss, check the primary then the replicas
    /// (the primary is the one tier writes land on, so it is the
    /// freshest remote source), backfilling the memory tier on any
    /// remote hit.
    pub async fn get(&self, key: &str) -> Option<Arc<JsonRpcResponse>> {
        if let Some(hit) = self.memory.get(key).await {
            return Some(hit);
        }
        for remote in self.primary.iter().chain(self.replicas.iter()) {
            if let Ok(Some(raw)) = remote.get(key).await {
                if let Some(response) = Self::decode(&raw, key) {
                    let response = Arc::new(response);
                    self.memory.insert(key.to_string(), response.clone(), self.memory.default_ttl()).await;
                    return Some(response);
                }
            }
        }
        None
    }

    /// One memory lookup per key, then at most one batched round trip
    /// per remote backend (`MGET`-style) for whatever is still missing,
    /// merging results back into the caller's original order.
    pub async fn get_batch(&self, keys: &[String]) -> Vec<Option<Arc<JsonRpcResponse>>> {
        let mut out: Vec<Option<Arc<JsonRpcResponse>>> = Vec::with_capacity(keys.len());
        let mut missing: Vec<usize> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let hit = self.memory.get(key).await;
            if hit.is_none() {
                missing.push(i);
            }
            out.push(hit);
        }

        for remote in self.primary.iter().chain(self.replicas.iter()) {
            if missing.is_empty() {
                break;
            }
            let pending_keys: Vec<String> = missing.iter().map(|&i| keys[i].clone()).collect();
            let Ok(values) = remote.get_batch(&pending_keys).await else { continue };

            let mut still_missing = Vec::new();
            for (slot, raw) in missing.iter().zip(values.into_iter()) {
                match raw.and_then(|raw| Self::decode(&raw, &keys[*slot])) {
                    Some(response) => {
                        let response = Arc::new(response);
                        self.memory.insert(keys[*slot].clone(), response.clone(), self.memory.default_ttl()).await;
                        out[*slot] = Some(response);
                    }
                    None => still_missing.push(*slot),
                }
            }
            missing = still_missing;
        }

        out
    }

    /// Writes the memory tier unconditionally, then the primary Redis
    /// tier (if configured). In test-before-add mode, an existing remote
    /// value that disagrees with the new one is kept as-is and logged,
    /// never silently overwritten (Design Note: guards against a flapping
    /// upstream re-caching a stale response under a shared URN key).
    pub async fn set(&self, key: String, response: Arc<JsonRpcResponse>, ttl: Duration) {
        self.memory.insert(key.clone(), response.clone(), ttl).await;

        let Some(primary) = &self.primary else { return };
        let Ok(serialized) = serde_json::to_string(response.as_ref()) else {
            warn!(key = %key, "failed to serialize response for remote cache");
            return;
        };

        if self.test_before_add {
            if let Ok(Some(existing)) = primary.get(&key).await {
                if existing != serialized {
                    warn!(key = %key, "cache-test-before-add mismatch, keeping existing remote entry");
                    return;
                }
            }
        }

        if let Err(e) = primary.set(&key, &serialized, ttl).await {
            warn!(key = %key, error = %e, "failed to write remote cache entry");
        }
    }

    pub async fn entry_count(&self) -> u64 {
        self.memory.entry_count().await
    }

    /// Subscribe to the result of whatever call is already in flight for
    /// `key`, if any, so a concurrent duplicate request can wait on it
    /// instead of issuing its own upstream call.
    pub async fn subscribe_inflight(&self, key: &str) -> Option<broadcast::Receiver<Arc<JsonRpcResponse>>> {
        self.memory.subscribe_inflight(key).await
    }

    /// Register the caller as the in-flight leader for `key`, returning
    /// the sender it must broadcast its result (or drop without sending,
    /// on error) to once it completes.
    pub async fn register_inflight(&self, key: &str) -> broadcast::Sender<Arc<JsonRpcResponse>> {
        self.memory.register_inflight(key).await
    }

    pub async fn remove_inflight(&self, key: &str) {
        self.memory.remove_inflight(key).await;
    }

    pub async fn clear(&self, key: &str) {
        self.memory.invalidate(key).await;
        if let Some(primary) = &self.primary {
            let _ = primary.clear(key).await;
        }
    }

    fn decode(raw: &str, key: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_str(raw) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(key = %key, error = %e, "failed to decode remote cache entry");
                None
            }
        }
    }
}
