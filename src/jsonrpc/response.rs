use serde::{Deserialize, Serialize};

use crate::error::{self, new_error_id, RpcProxyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcResponse {
    pub fn error(id: serde_json::Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    /// Error reply carrying `error.data = { error_id, request_id }` so
    /// operators can correlate a client-visible failure with logs.
    pub fn from_rpc_error(id: serde_json::Value, err: &RpcProxyError, request_id: Option<&str>) -> Self {
        let error_id = new_error_id();
        let mut resp = Self::error(id, err.code(), err.to_string());
        if let Some(e) = resp.error.as_mut() {
            e.data = Some(serde_json::json!({
                "error_id": error_id,
                "rpcproxy_request_id": request_id,
            }));
        }
        resp
    }

    pub fn parse_error() -> Self {
        Self::error(serde_json::Value::Null, error::CODE_PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(id: serde_json::Value) -> Self {
        Self::error(id, error::CODE_INVALID_REQUEST, "Invalid request")
    }

    pub fn internal_error(id: serde_json::Value) -> Self {
        Self::error(id, error::CODE_INTERNAL_ERROR, "Internal error")
    }

    pub fn is_well_formed(&self, expected_id: &serde_json::Value) -> bool {
        self.jsonrpc == "2.0" && &self.id == expected_id && (self.result.is_some() ^ self.error.is_some())
    }
}
