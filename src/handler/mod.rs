mod auth;
pub mod rpc;
pub mod status;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::dispatcher::Dispatcher;
use crate::upstream::UpstreamManager;

#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<UpstreamManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub token: Option<String>,
    /// Last-known irreversible block number, refreshed by the health
    /// checker, consumed by the `no_expire_if_irreversible` TTL rule.
    pub last_irreversible: Arc<AtomicU64>,
}
