use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, warn};

use crate::error::RpcProxyError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::registry::{UpstreamKind, UpstreamRegistry, UpstreamRule};

use super::backend::{BackendHealthInfo, BackendState, BackendStatus};
use super::http::HttpSender;
use super::pool::WsPool;

/// Pool sizing shared by every WS-kind upstream rule, configured via
/// `--websocket-pool-minsize/maxsize`.
#[derive(Debug, Clone, Copy)]
pub struct WsPoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub max_lifetime_messages: u64,
}

/// Routes requests to the upstream bound by the registry (C2), over
/// either the shared HTTP sender or a per-URL WebSocket pool (C7), and
/// tracks per-backend health, addressed by URN-prefix rule rather than
/// a single flat list of interchangeable backends.
pub struct UpstreamManager {
    registry: Arc<UpstreamRegistry>,
    http: HttpSender,
    ws_pools: RwLock<HashMap<String, Arc<WsPool>>>,
    ws_pool_config: WsPoolConfig,
    backends: RwLock<HashMap<String, Arc<RwLock<BackendStatus>>>>,
    notify: Arc<Notify>,
}

impl UpstreamManager {
    pub fn new(registry: Arc<UpstreamRegistry>, request_timeout: Duration, ws_pool_config: WsPoolConfig) -> Self {
        Self {
            registry,
            http: HttpSender::new(request_timeout),
            ws_pools: RwLock::new(HashMap::new()),
            ws_pool_config,
            backends: RwLock::new(HashMap::new()),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Notified whenever a backend transitions to `Down`, so the health
    /// checker can react immediately instead of waiting for its next
    /// polling tick.
    pub fn health_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Send a request to the upstream bound to `urn`. WS-kind rules hand
    /// `rule.retries` straight to `WsPool::send`, which owns its own
    /// backoff loop internally; HTTP-kind rules retry here, since
    /// `HttpSender` has no retry concept of its own, backing off the
    /// same `2^attempt * 100ms` (capped at 1s) as the pool does.
    pub async fn send(&self, urn: &str, request: &JsonRpcRequest) -> Result<JsonRpcResponse, RpcProxyError> {
        let rule = self
            .registry
            .resolve(urn)
            .ok_or_else(|| RpcProxyError::MethodNotFound(urn.to_string()))?;

        let backend = self.backend_for(rule).await;
        let url = rule.resolved_url();

        let start = Instant::now();
        let outcome = match rule.kind {
            UpstreamKind::Http => self.send_http_with_retry(&url, request, rule.retries).await,
            UpstreamKind::Websocket => {
                let pool = self.ws_pool_for(rule).await?;
                pool.send(request, Duration::from_secs_f64(rule.timeout), rule.retries).await
            }
        };

        match outcome {
            Ok(response) => {
                let latency = start.elapsed().as_secs_f64() * 1000.0;
                backend.write().await.record_success(latency);
                debug!(url = %url, latency_ms = %latency, "upstream success");
                Ok(response)
            }
            Err(e) => {
                let mut status = backend.write().await;
                status.record_error();
                if status.state == BackendState::Down {
                    self.notify.notify_one();
                }
                error!(url = %url, error = %e, "upstream request failed");
                Err(e)
            }
        }
    }

    /// Sends a batch of requests bound to the same WS-kind `urn` as one
    /// array frame over a single connection, via `WsPool::send_batch`.
    pub async fn send_batch(
        &self,
        urn: &str,
        requests: &[JsonRpcRequest],
    ) -> Result<Vec<JsonRpcResponse>, RpcProxyError> {
        let rule = self
            .registry
            .resolve(urn)
            .ok_or_else(|| RpcProxyError::MethodNotFound(urn.to_string()))?;

        let backend = self.backend_for(rule).await;
        let pool = self.ws_pool_for(rule).await?;

        let start = Instant::now();
        let outcome = pool
            .send_batch(requests, Duration::from_secs_f64(rule.timeout), rule.retries)
            .await;

        match outcome {
            Ok(responses) => {
                let latency = start.elapsed().as_secs_f64() * 1000.0;
                backend.write().await.record_success(latency);
                Ok(responses)
            }
            Err(e) => {
                let mut status = backend.write().await;
                status.record_error();
                if status.state == BackendState::Down {
                    self.notify.notify_one();
                }
                error!(url = %rule.resolved_url(), error = %e, "upstream batch request failed");
                Err(e)
            }
        }
    }

    async fn send_http_with_retry(
        &self,
        url: &str,
        request: &JsonRpcRequest,
        retries: u32,
    ) -> Result<JsonRpcResponse, RpcProxyError> {
        let mut attempt = 0;
        loop {
            let start = Instant::now();
            match self.http.send(url, request).await {
                Ok(response) => {
                    let latency = start.elapsed().as_secs_f64() * 1000.0;
                    debug!(url = %url, latency_ms = %latency, "http upstream success");
                    return Ok(response);
                }
                Err(e) if attempt + 1 < retries && e.is_retryable() => {
                    let backoff_ms = (1u64 << attempt.min(3)) * 100;
                    warn!(url = %url, attempt, error = %e, "http upstream attempt failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms.min(1000))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn backend_for(&self, rule: &UpstreamRule) -> Arc<RwLock<BackendStatus>> {
        let url = rule.resolved_url();
        if let Some(status) = self.backends.read().await.get(&url) {
            return status.clone();
        }
        let mut backends = self.backends.write().await;
        backends
            .entry(url.clone())
            .or_insert_with(|| Arc::new(RwLock::new(BackendStatus::new(url, rule.kind))))
            .clone()
    }

    async fn ws_pool_for(&self, rule: &UpstreamRule) -> Result<Arc<WsPool>, RpcProxyError> {
        self.ws_pool_for_url(rule.resolved_url()).await
    }

    async fn ws_pool_for_url(&self, url: String) -> Result<Arc<WsPool>, RpcProxyError> {
        if let Some(pool) = self.ws_pools.read().await.get(&url) {
            return Ok(pool.clone());
        }
        let mut pools = self.ws_pools.write().await;
        if let Some(pool) = pools.get(&url) {
            return Ok(pool.clone());
        }
        let pool = WsPool::new(
            url.clone(),
            self.ws_pool_config.min_size,
            self.ws_pool_config.max_size,
            self.ws_pool_config.max_lifetime_messages,
        );
        pools.insert(url, pool.clone());
        Ok(pool)
    }

    pub async fn backend_statuses(&self) -> Vec<BackendHealthInfo> {
        let backends = self.backends.read().await;
        let mut statuses = Vec::with_capacity(backends.len());
        for (i, status) in backends.values().enumerate() {
            let b = status.read().await;
            statuses.push(BackendHealthInfo {
                url: b.url.clone(),
                priority: i,
                kind: format!("{:?}", b.kind),
                state: format!("{:?}", b.state),
                latency_ms: b.avg_latency_ms,
                latest_block: b.latest_block,
                total_requests: b.total_requests,
                total_errors: b.total_errors,
                uptime_secs: b.started_at.elapsed().as_secs(),
            });
        }
        statuses
    }

    pub async fn has_healthy_backend_with_block(&self) -> bool {
        for status in self.backends.read().await.values() {
            let b = status.read().await;
            if b.state == BackendState::Healthy && b.latest_block.is_some() {
                return true;
            }
        }
        false
    }

    /// Probes every known backend, routing HTTP-kind backends through
    /// `probe_http` and WS-kind backends through a lightweight RPC call
    /// over the same pool that serves hot-path traffic, so the periodic
    /// check never opens a raw connection of its own.
    pub async fn check_all_backends<F, Fut>(&self, probe_http: F)
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<u64, RpcProxyError>>,
    {
        let entries: Vec<(String, UpstreamKind, Arc<RwLock<BackendStatus>>)> = {
            let backends = self.backends.read().await;
            let mut v = Vec::with_capacity(backends.len());
            for (url, status) in backends.iter() {
                let kind = status.read().await.kind;
                v.push((url.clone(), kind, status.clone()));
            }
            v
        };

        let mut best_block: Option<u64> = None;

        for (url, kind, backend) in &entries {
            let outcome = match kind {
                UpstreamKind::Http => probe_http(url.clone()).await,
                UpstreamKind::Websocket => self.probe_ws_backend(url).await,
            };
            match outcome {
                Ok(block_number) => {
                    let mut status = backend.write().await;
                    status.latest_block = Some(block_number);
                    status.record_success(0.0);
                    debug!(backend = %url, block = %block_number, "health check passed");
                    match best_block {
                        Some(best) if block_number > best => best_block = Some(block_number),
                        None => best_block = Some(block_number),
                        _ => {}
                    }
                }
                Err(e) => {
                    let mut status = backend.write().await;
                    status.record_error();
                    if status.state == BackendState::Down {
                        self.notify.notify_one();
                    }
                    warn!(backend = %url, error = %e, state = ?status.state, "health check failed");
                }
            }
        }

        if let Some(best) = best_block {
            for (url, _, backend) in &entries {
                let mut status = backend.write().await;
                if let Some(block) = status.latest_block {
                    if best > block && best - block > 10 && status.state == BackendState::Healthy {
                        status.state = BackendState::Degraded;
                        warn!(backend = %url, block = %block, best_block = %best, "backend is stale, marking degraded");
                    }
                }
            }
        }
    }

    /// Sends a `get_dynamic_global_properties` call over the backend's
    /// own WS pool to confirm liveness and pick up a block number for
    /// staleness tracking, rather than opening a one-off connection.
    async fn probe_ws_backend(&self, url: &str) -> Result<u64, RpcProxyError> {
        let pool = self.ws_pool_for_url(url.to_string()).await?;
        let request: JsonRpcRequest = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "get_dynamic_global_properties",
            "params": [],
            "id": 1
        }))
        .expect("static health probe request is well-formed");

        let response = pool.send(&request, Duration::from_secs(5), 1).await?;
        response
            .result
            .as_ref()
            .and_then(|r| r.get("head_block_number"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RpcProxyError::HealthProbe("missing head_block_number field".into()))
    }
}
