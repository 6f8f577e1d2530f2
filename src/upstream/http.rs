//! HTTP upstream sender (for HTTP-kind upstream rules): a thin
//! request/response wrapper around `reqwest`, shared between the
//! single-backend fallback path and the per-rule dispatch path.

use std::time::Duration;

use reqwest::Client;

use crate::error::RpcProxyError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

#[derive(Clone)]
pub struct HttpSender {
    client: Client,
}

impl HttpSender {
    pub fn new(request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(20)
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }

    pub async fn send(&self, url: &str, request: &JsonRpcRequest) -> Result<JsonRpcResponse, RpcProxyError> {
        let body = serde_json::to_string(request)?;

        let resp = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| RpcProxyError::UpstreamRequest(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(RpcProxyError::UpstreamHttp(resp.status().as_u16()));
        }

        let text = resp.text().await.map_err(|e| RpcProxyError::BodyRead(e.to_string()))?;
        let rpc_response: JsonRpcResponse = serde_json::from_str(&text)?;
        Ok(rpc_response)
    }
}
