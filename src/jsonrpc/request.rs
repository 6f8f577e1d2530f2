use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::RpcProxyError;
use crate::registry::UpstreamRule;
use crate::urn::{canonicalize, Urn, UrnCache};

/// A single JSON-RPC 2.0 call as received from the client. `params`
/// defaults to `Value::Null` (treated as absent) when the key is
/// missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub id: serde_json::Value,
}

impl JsonRpcRequest {
    /// Structural well-formedness check, applied before dispatch:
    /// `jsonrpc == "2.0"`, non-empty string method, and params (if
    /// present and not null) is an array or object.
    pub fn is_valid(&self) -> bool {
        if self.jsonrpc != "2.0" || self.method.is_empty() {
            return false;
        }
        matches!(
            self.params,
            serde_json::Value::Null | serde_json::Value::Array(_) | serde_json::Value::Object(_)
        )
    }

    fn params_ref(&self) -> Option<&serde_json::Value> {
        match &self.params {
            serde_json::Value::Null => None,
            other => Some(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcBody {
    Single(JsonRpcRequest),
    Batch(Vec<JsonRpcRequest>),
}

/// Per-request pipeline state. Immutable after
/// construction except for the lazily-memoized URN/upstream binding and
/// the timing log, which are append-only bookkeeping rather than
/// request identity.
pub struct RequestContext {
    pub request: JsonRpcRequest,
    pub batch_index: usize,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    urn: OnceLock<Urn>,
    timings: std::sync::Mutex<Vec<(Instant, &'static str)>>,
}

impl RequestContext {
    pub fn new(
        request: JsonRpcRequest,
        batch_index: usize,
        request_id: Option<String>,
        trace_id: Option<String>,
    ) -> Self {
        Self {
            request,
            batch_index,
            request_id,
            trace_id,
            urn: OnceLock::new(),
            timings: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn client_id(&self) -> serde_json::Value {
        self.request.id.clone()
    }

    pub fn mark(&self, label: &'static str) {
        self.timings.lock().unwrap().push((Instant::now(), label));
    }

    pub fn timings(&self) -> Vec<(Instant, &'static str)> {
        self.timings.lock().unwrap().clone()
    }

    /// Derive (and memoize) the URN for this request. Pure function of
    /// the request plus the registry's numeric-api table.
    pub fn urn(
        &self,
        numeric_apis: &std::collections::HashMap<u64, String>,
        cache: &UrnCache,
    ) -> Result<&Urn, RpcProxyError> {
        if let Some(urn) = self.urn.get() {
            return Ok(urn);
        }
        let urn = canonicalize(&self.request.method, self.request.params_ref(), numeric_apis, cache)?;
        Ok(self.urn.get_or_init(|| urn))
    }

    /// A copy of the original request with `id` replaced by a fresh
    /// upstream id, for the wire to the upstream (upstream id
    /// assignment happens at dispatch time, never reuses the client id).
    pub fn upstream_view(&self, upstream_id: u64) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: self.request.jsonrpc.clone(),
            method: self.request.method.clone(),
            params: self.request.params.clone(),
            id: serde_json::Value::from(upstream_id),
        }
    }
}

/// Resolve the upstream rule bound to a URN (pure function of URN +
/// registry).
pub fn bind_upstream<'a>(
    urn: &Urn,
    registry: &'a crate::registry::UpstreamRegistry,
) -> Result<&'a UpstreamRule, RpcProxyError> {
    registry
        .resolve(&urn.to_string())
        .ok_or_else(|| RpcProxyError::MethodNotFound(urn.to_string()))
}
