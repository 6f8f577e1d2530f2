//! Dispatcher: ties together URN canonicalization, cache
//! lookup/coalescing/write, upstream dispatch, and post-dispatch
//! validation for a single request or a batch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, warn};

use crate::cache::policy as ttl_policy;
use crate::cache::CacheGroup;
use crate::error::RpcProxyError;
use crate::jsonrpc::{bind_upstream, JsonRpcBody, JsonRpcRequest, JsonRpcResponse, RequestContext};
use crate::registry::{UpstreamKind, UpstreamRegistry, UpstreamRule};
use crate::translate::{check_translatable, translate_to_appbase};
use crate::upstream::UpstreamManager;
use crate::urn::{Urn, UrnCache};
use crate::validators;

/// Namespace/api/method/params of the single request just dispatched,
/// surfaced to `handler::rpc` for the `x-rpcproxy-*` response headers.
/// Never populated for a batch body.
pub struct SingleRequestInfo {
    pub namespace: String,
    pub api: Option<String>,
    pub method: String,
    pub params: Option<String>,
}

impl From<&Urn> for SingleRequestInfo {
    fn from(urn: &Urn) -> Self {
        Self {
            namespace: urn.namespace.clone(),
            api: urn.api.clone(),
            method: urn.method.clone(),
            params: urn.params.canonical_json(),
        }
    }
}

/// Either a terminal response (cache hit, validation failure, coalesced
/// onto another in-flight call) or a request ready to go to an upstream.
enum Prepared {
    Done(JsonRpcResponse),
    Ready(Box<ReadyRequest>),
}

struct ReadyRequest {
    ctx: RequestContext,
    urn: Urn,
    urn_key: String,
    rule: UpstreamRule,
    outbound: JsonRpcRequest,
    requested_block: Option<u64>,
    inflight_tx: tokio::sync::broadcast::Sender<Arc<JsonRpcResponse>>,
}

pub struct Dispatcher {
    registry: Arc<UpstreamRegistry>,
    upstream: Arc<UpstreamManager>,
    cache: CacheGroup,
    urn_cache: UrnCache,
}

impl Dispatcher {
    pub fn new(registry: Arc<UpstreamRegistry>, upstream: Arc<UpstreamManager>, cache: CacheGroup) -> Self {
        Self {
            registry,
            upstream,
            cache,
            urn_cache: UrnCache::default(),
        }
    }

    pub fn batch_size_limit(&self) -> usize {
        self.registry.limits.batch_size
    }

    pub async fn cache_entry_count(&self) -> u64 {
        self.cache.entry_count().await
    }

    /// Parses, validates and dispatches one raw JSON-RPC body, returning
    /// the wire-ready result alongside the single request's URN info
    /// (`None` for a batch body or a request that never resolved to a
    /// URN). `last_irreversible` feeds the `no_expire_if_irreversible`
    /// TTL rule; `request_id` correlates this call's error responses and
    /// response headers with the request that produced them.
    pub async fn handle_body(
        &self,
        body: &str,
        last_irreversible: Option<u64>,
        request_id: &str,
    ) -> (serde_json::Value, Option<SingleRequestInfo>) {
        let parsed = match serde_json::from_str::<JsonRpcBody>(body) {
            Ok(parsed) => parsed,
            Err(_) => return (serde_json::to_value(JsonRpcResponse::parse_error()).unwrap(), None),
        };

        match parsed {
            JsonRpcBody::Single(request) => {
                let (resp, info) = self.dispatch_one(request, 0, last_irreversible, request_id).await;
                (serde_json::to_value(resp).unwrap(), info)
            }
            JsonRpcBody::Batch(requests) => {
                if requests.len() > self.batch_size_limit() {
                    let resp = JsonRpcResponse::error(
                        serde_json::Value::Null,
                        crate::error::CODE_INVALID_REQUEST,
                        format!("batch size {} exceeds limit {}", requests.len(), self.batch_size_limit()),
                    );
                    return (serde_json::to_value(resp).unwrap(), None);
                }

                let responses = self.dispatch_batch(requests, last_irreversible, request_id).await;
                (serde_json::to_value(responses).unwrap(), None)
            }
        }
    }

    async fn dispatch_one(
        &self,
        request: JsonRpcRequest,
        batch_index: usize,
        last_irreversible: Option<u64>,
        request_id: &str,
    ) -> (JsonRpcResponse, Option<SingleRequestInfo>) {
        match self.prepare_one(request, batch_index, request_id).await {
            Prepared::Done(resp) => (resp, None),
            Prepared::Ready(ready) => {
                let info = SingleRequestInfo::from(&ready.urn);
                let result = self.upstream.send(&ready.urn_key, &ready.outbound).await;
                let resp = self.finish_one(*ready, result, last_irreversible, request_id).await;
                (resp, Some(info))
            }
        }
    }

    async fn dispatch_batch(
        &self,
        requests: Vec<JsonRpcRequest>,
        last_irreversible: Option<u64>,
        request_id: &str,
    ) -> Vec<JsonRpcResponse> {
        let n = requests.len();
        let mut responses: Vec<Option<JsonRpcResponse>> = (0..n).map(|_| None).collect();
        let mut ready: Vec<Option<ReadyRequest>> = Vec::with_capacity(n);

        for (index, request) in requests.into_iter().enumerate() {
            match self.prepare_one(request, index, request_id).await {
                Prepared::Done(resp) => {
                    responses[index] = Some(resp);
                    ready.push(None);
                }
                Prepared::Ready(r) => ready.push(Some(*r)),
            }
        }

        // Group WS-kind items by resolved upstream URL so each group goes
        // out as one array frame instead of one round trip per item.
        let mut ws_groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, slot) in ready.iter().enumerate() {
            if let Some(r) = slot {
                if r.rule.kind == UpstreamKind::Websocket {
                    ws_groups.entry(r.rule.resolved_url()).or_default().push(index);
                }
            }
        }

        for (_url, indices) in ws_groups {
            let urn_key = ready[indices[0]].as_ref().unwrap().urn_key.clone();
            let outbound: Vec<JsonRpcRequest> =
                indices.iter().map(|&i| ready[i].as_ref().unwrap().outbound.clone()).collect();

            match self.upstream.send_batch(&urn_key, &outbound).await {
                Ok(group_responses) => {
                    for (&index, resp) in indices.iter().zip(group_responses) {
                        let r = ready[index].take().unwrap();
                        responses[index] = Some(self.finish_one(r, Ok(resp), last_irreversible, request_id).await);
                    }
                }
                Err(e) => {
                    for &index in &indices {
                        let r = ready[index].take().unwrap();
                        let mut resp = JsonRpcResponse::from_rpc_error(r.ctx.client_id(), &e, Some(request_id));
                        self.cache.remove_inflight(&r.urn_key).await;
                        resp.id = r.ctx.client_id();
                        responses[index] = Some(resp);
                    }
                }
            }
        }

        let remaining: Vec<(usize, ReadyRequest)> =
            ready.into_iter().enumerate().filter_map(|(i, r)| r.map(|r| (i, r))).collect();
        let futures = remaining.into_iter().map(|(index, r)| async move {
            let result = self.upstream.send(&r.urn_key, &r.outbound).await;
            let resp = self.finish_one(r, result, last_irreversible, request_id).await;
            (index, resp)
        });
        for (index, resp) in futures_util::future::join_all(futures).await {
            responses[index] = Some(resp);
        }

        responses.into_iter().map(|r| r.unwrap()).collect()
    }

    /// Validates, canonicalizes, resolves the upstream rule, checks the
    /// translator deny-list, and either returns a cache hit / coalesced
    /// in-flight result directly or registers this call as the in-flight
    /// leader for its URN key and hands back everything needed to send
    /// it.
    async fn prepare_one(&self, request: JsonRpcRequest, batch_index: usize, request_id: &str) -> Prepared {
        if !request.is_valid() {
            return Prepared::Done(JsonRpcResponse::invalid_request(request.id));
        }

        let ctx = RequestContext::new(request, batch_index, Some(request_id.to_string()), None);
        let client_id = ctx.client_id();

        let urn = match ctx.urn(&self.registry.numeric_apis, &self.urn_cache) {
            Ok(urn) => urn.clone(),
            Err(e) => return Prepared::Done(JsonRpcResponse::from_rpc_error(client_id, &e, Some(request_id))),
        };

        if validators::is_broadcast_transaction_request(&urn) {
            if let Err(e) =
                validators::limit_broadcast_transaction_request(&ctx.request.params, &self.registry.limits.broadcast_transaction)
            {
                warn!(urn = %urn, error = %e, "broadcast transaction rejected by limits");
                return Prepared::Done(JsonRpcResponse::from_rpc_error(client_id, &e, Some(request_id)));
            }
        }

        let urn_key = urn.to_string();
        let rule = match bind_upstream(&urn, &self.registry) {
            Ok(rule) => rule.clone(),
            Err(e) => return Prepared::Done(JsonRpcResponse::from_rpc_error(client_id, &e, Some(request_id))),
        };

        if rule.translate_to_appbase {
            if let Err(e) = check_translatable(&urn) {
                warn!(urn = %urn_key, error = %e, "translation denied by deny-list");
                return Prepared::Done(JsonRpcResponse::from_rpc_error(client_id, &e, Some(request_id)));
            }
        }

        if let Some(cached) = self.cache.get(&urn_key).await {
            let mut resp = (*cached).clone();
            resp.id = client_id;
            return Prepared::Done(resp);
        }

        if let Some(mut rx) = self.cache.subscribe_inflight(&urn_key).await {
            if let Ok(shared) = rx.recv().await {
                let mut resp = (*shared).clone();
                resp.id = client_id;
                return Prepared::Done(resp);
            }
            // The in-flight leader errored before broadcasting a result;
            // fall through and become the new leader ourselves.
        }
        let inflight_tx = self.cache.register_inflight(&urn_key).await;

        let outbound = if rule.translate_to_appbase {
            translate_to_appbase(&ctx.request, &urn)
        } else {
            ctx.request.clone()
        };

        let requested_block = if validators::is_get_block_request(&urn) || validators::is_get_block_header_request(&urn) {
            match &urn.params {
                crate::urn::Params::List(items) => items.first().and_then(|v| v.as_u64()),
                _ => None,
            }
        } else {
            None
        };

        Prepared::Ready(Box::new(ReadyRequest {
            ctx,
            urn,
            urn_key,
            rule,
            outbound,
            requested_block,
            inflight_tx,
        }))
    }

    async fn finish_one(
        &self,
        ready: ReadyRequest,
        result: Result<JsonRpcResponse, RpcProxyError>,
        last_irreversible: Option<u64>,
        request_id: &str,
    ) -> JsonRpcResponse {
        let ReadyRequest { ctx, urn, urn_key, rule, requested_block, inflight_tx, .. } = ready;
        let client_id = ctx.client_id();

        let response = match result {
            Ok(mut response) => {
                response.id = client_id;

                if response.error.is_none() {
                    if (validators::is_get_block_request(&urn) || validators::is_get_block_header_request(&urn))
                        && !validators::is_valid_get_block_response(&response_as_value(&response), requested_block)
                    {
                        warn!(urn = %urn_key, "upstream returned a structurally invalid get_block response");
                    } else if let Some(ttl) = ttl_policy::resolve(rule.ttl, &urn.method, &response_as_value(&response), last_irreversible) {
                        self.cache.set(urn_key.clone(), Arc::new(response.clone()), ttl).await;
                    }
                }

                let _ = inflight_tx.send(Arc::new(response.clone()));
                response
            }
            Err(e) => {
                error!(urn = %urn_key, error = %e, "dispatch failed");
                JsonRpcResponse::from_rpc_error(client_id, &e, Some(request_id))
            }
        };

        self.cache.remove_inflight(&urn_key).await;
        response
    }
}

fn response_as_value(response: &JsonRpcResponse) -> serde_json::Value {
    serde_json::to_value(response).unwrap_or(serde_json::Value::Null)
}
