//! WebSocket upstream pool: one pool per upstream URL,
//! multiplexing many concurrent JSON-RPC calls over a bounded set of
//! long-lived connections.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Notify, RwLock, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::RpcProxyError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    write: Mutex<futures_util::stream::SplitSink<WsStream, Message>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>,
    in_flight: AtomicU64,
    lifetime_messages: AtomicU64,
    healthy: std::sync::atomic::AtomicBool,
}

impl Connection {
    async fn open(url: &str) -> Result<Self, RpcProxyError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| RpcProxyError::UpstreamRequest(format!("ws connect {url}: {e}")))?;
        let (write, mut read) = stream.split();
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let Ok(Message::Text(text)) = msg else { continue };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                    continue;
                };
                let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
                    continue;
                };
                let waiter = reader_pending.lock().await.remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send(value);
                }
            }
        });

        Ok(Self {
            write: Mutex::new(write),
            pending,
            in_flight: AtomicU64::new(0),
            lifetime_messages: AtomicU64::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
        })
    }
}

/// Bounds concurrent acquires at `max_size`, recycles idle connections
/// FIFO, and opens new connections up to `max_size` lazily on demand.
/// Slots hold `Option<Arc<Connection>>` rather than removing dead
/// entries outright, so an unhealthy connection's index can be replaced
/// in place without invalidating every other index still queued in
/// `idle`.
pub struct WsPool {
    url: String,
    connections: Arc<RwLock<Vec<Option<Arc<Connection>>>>>,
    idle: Arc<Mutex<VecDeque<usize>>>,
    acquire: Semaphore,
    release_notify: Arc<Notify>,
    max_size: usize,
    max_lifetime_messages: u64,
    next_id: AtomicU64,
}

impl WsPool {
    /// Constructs the pool and kicks off a background task that opens
    /// `min_size` connections eagerly, so the pool starts near its
    /// configured floor instead of growing one connection per incoming
    /// request. Construction itself never blocks on the network: a
    /// warm-up failure is logged and left for `checkout` to retry.
    pub fn new(url: String, min_size: usize, max_size: usize, max_lifetime_messages: u64) -> Arc<Self> {
        let min_size = min_size.min(max_size);
        let pool = Arc::new(Self {
            url,
            connections: Arc::new(RwLock::new(Vec::new())),
            idle: Arc::new(Mutex::new(VecDeque::new())),
            acquire: Semaphore::new(max_size),
            release_notify: Arc::new(Notify::new()),
            max_size,
            max_lifetime_messages,
            next_id: AtomicU64::new(1),
        });

        if min_size > 0 {
            let url = pool.url.clone();
            let connections = pool.connections.clone();
            let idle = pool.idle.clone();
            let release_notify = pool.release_notify.clone();
            tokio::spawn(async move {
                warm_up(url, connections, idle, release_notify, min_size).await;
            });
        }

        pool
    }

    /// Acquire a connection slot, send the request, await the matching
    /// response by id, then release the slot. Retries with exponential
    /// backoff (`2^attempt * 100ms`, capped at 1s) on transport errors,
    /// up to `retries` attempts.
    pub async fn send(&self, request: &JsonRpcRequest, timeout: Duration, retries: u32) -> Result<JsonRpcResponse, RpcProxyError> {
        let mut attempt = 0;
        loop {
            match self.send_once(request, timeout).await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt + 1 < retries => {
                    let backoff_ms = (1u64 << attempt.min(3)) * 100;
                    warn!(url = %self.url, attempt, error = %e, "ws send failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms.min(1000))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends an entire JSON-RPC batch as a single JSON array frame over
    /// one connection and gathers all replies before returning, instead
    /// of one acquire/send/await per sub-request. Same retry/backoff
    /// shape as `send`.
    pub async fn send_batch(
        &self,
        requests: &[JsonRpcRequest],
        timeout: Duration,
        retries: u32,
    ) -> Result<Vec<JsonRpcResponse>, RpcProxyError> {
        let mut attempt = 0;
        loop {
            match self.send_batch_once(requests, timeout).await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt + 1 < retries => {
                    let backoff_ms = (1u64 << attempt.min(3)) * 100;
                    warn!(url = %self.url, attempt, error = %e, "ws batch send failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms.min(1000))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, request: &JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse, RpcProxyError> {
        let _permit = self
            .acquire
            .acquire()
            .await
            .map_err(|_| RpcProxyError::InternalError("ws pool semaphore closed".into()))?;

        let conn = self.checkout().await?;
        conn.in_flight.fetch_add(1, Ordering::Relaxed);

        let result = self.send_on(&conn, request, timeout).await;

        conn.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.checkin(conn).await;

        result
    }

    async fn send_batch_once(&self, requests: &[JsonRpcRequest], timeout: Duration) -> Result<Vec<JsonRpcResponse>, RpcProxyError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let _permit = self
            .acquire
            .acquire()
            .await
            .map_err(|_| RpcProxyError::InternalError("ws pool semaphore closed".into()))?;

        let conn = self.checkout().await?;
        conn.in_flight.fetch_add(1, Ordering::Relaxed);

        let result = self.send_batch_on(&conn, requests, timeout).await;

        conn.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.checkin(conn).await;

        result
    }

    async fn send_on(&self, conn: &Arc<Connection>, request: &JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse, RpcProxyError> {
        let upstream_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut wired = request.clone();
        wired.id = serde_json::Value::from(upstream_id);

        let (tx, rx) = oneshot::channel();
        conn.pending.lock().await.insert(upstream_id, tx);

        let body = serde_json::to_string(&wired)?;
        {
            let mut write = conn.write.lock().await;
            if write.send(Message::Text(body)).await.is_err() {
                conn.pending.lock().await.remove(&upstream_id);
                conn.healthy.store(false, Ordering::Relaxed);
                return Err(RpcProxyError::ConnectionReset);
            }
        }
        conn.lifetime_messages.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => {
                let response: JsonRpcResponse = serde_json::from_value(value)?;
                Ok(response)
            }
            Ok(Err(_)) => {
                conn.healthy.store(false, Ordering::Relaxed);
                Err(RpcProxyError::ConnectionReset)
            }
            Err(_) => {
                conn.pending.lock().await.remove(&upstream_id);
                Err(RpcProxyError::Timeout)
            }
        }
    }

    /// Wires every request onto its own upstream id, writes them as one
    /// JSON array frame, then gathers all replies concurrently. A single
    /// array send/receive replaces what would otherwise be N independent
    /// acquire/send/await round trips.
    async fn send_batch_on(
        &self,
        conn: &Arc<Connection>,
        requests: &[JsonRpcRequest],
        timeout: Duration,
    ) -> Result<Vec<JsonRpcResponse>, RpcProxyError> {
        let mut wired = Vec::with_capacity(requests.len());
        {
            let mut pending = conn.pending.lock().await;
            for request in requests {
                let upstream_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let mut w = request.clone();
                w.id = serde_json::Value::from(upstream_id);
                let (tx, rx) = oneshot::channel();
                pending.insert(upstream_id, tx);
                wired.push((upstream_id, w, rx));
            }
        }

        let outbound: Vec<&JsonRpcRequest> = wired.iter().map(|(_, w, _)| w).collect();
        let body = serde_json::to_string(&outbound)?;
        {
            let mut write = conn.write.lock().await;
            if write.send(Message::Text(body)).await.is_err() {
                let mut pending = conn.pending.lock().await;
                for (id, _, _) in &wired {
                    pending.remove(id);
                }
                conn.healthy.store(false, Ordering::Relaxed);
                return Err(RpcProxyError::ConnectionReset);
            }
        }
        conn.lifetime_messages.fetch_add(wired.len() as u64, Ordering::Relaxed);

        let pending = conn.pending.clone();
        let gathered = futures_util::future::join_all(wired.into_iter().map(|(id, _, rx)| {
            let pending = pending.clone();
            async move {
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(_)) => Err(RpcProxyError::ConnectionReset),
                    Err(_) => {
                        pending.lock().await.remove(&id);
                        Err(RpcProxyError::Timeout)
                    }
                }
            }
        }))
        .await;

        let mut responses = Vec::with_capacity(gathered.len());
        let mut saw_reset = false;
        for outcome in gathered {
            match outcome {
                Ok(value) => responses.push(serde_json::from_value::<JsonRpcResponse>(value)?),
                Err(RpcProxyError::ConnectionReset) => saw_reset = true,
                Err(e) => return Err(e),
            }
        }
        if saw_reset {
            conn.healthy.store(false, Ordering::Relaxed);
            return Err(RpcProxyError::ConnectionReset);
        }
        Ok(responses)
    }

    async fn checkout(&self) -> Result<Arc<Connection>, RpcProxyError> {
        loop {
            if let Some(idx) = self.idle.lock().await.pop_front() {
                let existing = self.connections.read().await[idx].clone();
                if let Some(conn) = existing {
                    if conn.healthy.load(Ordering::Relaxed)
                        && (self.max_lifetime_messages == 0
                            || conn.lifetime_messages.load(Ordering::Relaxed) < self.max_lifetime_messages)
                    {
                        return Ok(conn);
                    }
                    warn!(url = %self.url, idx, "discarding unhealthy ws connection, reopening slot");
                }

                match Connection::open(&self.url).await {
                    Ok(fresh) => {
                        let fresh = Arc::new(fresh);
                        self.connections.write().await[idx] = Some(fresh.clone());
                        return Ok(fresh);
                    }
                    Err(e) => {
                        // Leave the slot counted against max_size but
                        // empty, and requeue it so the next checkout (or
                        // a waiter parked on release_notify) retries
                        // instead of the slot being lost forever.
                        self.connections.write().await[idx] = None;
                        self.idle.lock().await.push_back(idx);
                        self.release_notify.notify_one();
                        return Err(e);
                    }
                }
            }

            let mut connections = self.connections.write().await;
            if connections.len() < self.max_size {
                match Connection::open(&self.url).await {
                    Ok(conn) => {
                        let conn = Arc::new(conn);
                        connections.push(Some(conn.clone()));
                        debug!(url = %self.url, size = connections.len(), "opened ws connection");
                        return Ok(conn);
                    }
                    Err(e) => return Err(e),
                }
            }
            drop(connections);

            self.release_notify.notified().await;
        }
    }

    async fn checkin(&self, conn: Arc<Connection>) {
        let connections = self.connections.read().await;
        let idx = connections
            .iter()
            .position(|c| matches!(c, Some(existing) if Arc::ptr_eq(existing, &conn)));
        drop(connections);

        let Some(idx) = idx else {
            self.release_notify.notify_one();
            return;
        };

        if conn.healthy.load(Ordering::Relaxed) {
            self.idle.lock().await.push_back(idx);
            self.release_notify.notify_one();
            return;
        }

        // The connection died mid-use: clear its slot now and reopen it
        // in the background so the pool returns to size without making
        // the next caller wait on a fresh handshake.
        self.connections.write().await[idx] = None;
        self.release_notify.notify_one();

        let url = self.url.clone();
        let connections = self.connections.clone();
        let idle = self.idle.clone();
        let release_notify = self.release_notify.clone();
        tokio::spawn(async move {
            replace_slot(url, connections, idle, release_notify, idx).await;
        });
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

async fn warm_up(
    url: String,
    connections: Arc<RwLock<Vec<Option<Arc<Connection>>>>>,
    idle: Arc<Mutex<VecDeque<usize>>>,
    release_notify: Arc<Notify>,
    count: usize,
) {
    for _ in 0..count {
        match Connection::open(&url).await {
            Ok(conn) => {
                let mut guard = connections.write().await;
                let idx = guard.len();
                guard.push(Some(Arc::new(conn)));
                drop(guard);
                idle.lock().await.push_back(idx);
                release_notify.notify_one();
            }
            Err(e) => {
                warn!(url = %url, error = %e, "ws pool warm-up connection failed, starting below min-size");
                break;
            }
        }
    }
}

async fn replace_slot(
    url: String,
    connections: Arc<RwLock<Vec<Option<Arc<Connection>>>>>,
    idle: Arc<Mutex<VecDeque<usize>>>,
    release_notify: Arc<Notify>,
    idx: usize,
) {
    match Connection::open(&url).await {
        Ok(conn) => {
            connections.write().await[idx] = Some(Arc::new(conn));
        }
        Err(e) => {
            warn!(url = %url, idx, error = %e, "background ws reconnect failed, slot left empty");
        }
    }
    idle.lock().await.push_back(idx);
    release_notify.notify_one();
}
