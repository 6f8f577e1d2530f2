use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json};
use tracing::warn;

use crate::error::new_error_id;
use crate::jsonrpc::JsonRpcResponse;

use super::AppState;

const NO_IRREVERSIBLE_BLOCK: u64 = u64::MAX;

fn last_irreversible(state: &AppState) -> Option<u64> {
    match state.last_irreversible.load(Ordering::Relaxed) {
        NO_IRREVERSIBLE_BLOCK => None,
        block => Some(block),
    }
}

/// RPC handler for token-authenticated path: POST /<token>
pub async fn token_rpc_handler(
    State(state): State<AppState>,
    Path(path_token): Path<String>,
    body: String,
) -> impl IntoResponse {
    if let Some(expected_token) = &state.token
        && path_token != *expected_token
    {
        warn!("unauthorized RPC request (bad token path)");
        return unauthorized();
    }
    dispatch_rpc(&state, body).await
}

/// RPC handler for open access: POST /
pub async fn open_rpc_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    if state.token.is_some() {
        warn!("unauthorized RPC request (missing token path)");
        return unauthorized();
    }
    dispatch_rpc(&state, body).await
}

fn unauthorized() -> (StatusCode, HeaderMap, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        HeaderMap::new(),
        Json(
            serde_json::to_value(JsonRpcResponse::error(serde_json::Value::Null, -32000, "Unauthorized"))
                .unwrap(),
        ),
    )
}

/// Every reply (including errors) carries a request id and response-time
/// header so operators can correlate a client-visible failure with log
/// lines; single (non-batch) requests also get their resolved
/// namespace/api/method/params echoed back.
async fn dispatch_rpc(state: &AppState, body: String) -> (StatusCode, HeaderMap, Json<serde_json::Value>) {
    let request_id = new_error_id();
    let start = Instant::now();

    let (result, single) = state.dispatcher.handle_body(&body, last_irreversible(state), &request_id).await;

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "x-rpcproxy-request-id", &request_id);
    insert_header(&mut headers, "x-rpcproxy-response-time", &format!("{:.3}", start.elapsed().as_secs_f64()));
    if let Some(info) = single {
        insert_header(&mut headers, "x-rpcproxy-namespace", &info.namespace);
        if let Some(api) = &info.api {
            insert_header(&mut headers, "x-rpcproxy-api", api);
        }
        insert_header(&mut headers, "x-rpcproxy-method", &info.method);
        if let Some(params) = &info.params {
            insert_header(&mut headers, "x-rpcproxy-params", params);
        }
    }

    (StatusCode::OK, headers, Json(result))
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
