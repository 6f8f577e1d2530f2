//! Legacy-to-appbase request translation: a `dpayd`-namespace call
//! wrapped so the upstream sees an `appbase`-style `call` invocation.

use serde_json::Value;

use crate::error::RpcProxyError;
use crate::jsonrpc::JsonRpcRequest;
use crate::urn::{Params, Urn};

/// Apis with no appbase equivalent: wrapping one of these into a `call`
/// invocation would target an api the appbase side does not expose.
/// `login_api` is the only one in the bare-method/numeric-api tables
/// that never appears in the appbase api table.
const UNTRANSLATABLE_APIS: &[&str] = &["login_api"];

/// Checked before `translate_to_appbase` on any rule with
/// `translate_to_appbase` set; methods in the deny-list fail fast
/// instead of producing a `call` the upstream cannot serve.
pub fn check_translatable(urn: &Urn) -> Result<(), RpcProxyError> {
    if let Some(api) = &urn.api {
        if UNTRANSLATABLE_APIS.contains(&api.as_str()) {
            return Err(RpcProxyError::UntranslatableMethod(urn.to_string()));
        }
    }
    Ok(())
}

/// Rewrites `{"method": <bare or dotted method>, "params": ...}` into
/// `{"method": "call", "params": [api, method, params]}`, preserving the
/// client's `jsonrpc`/`id`. `params` defaults to `[]` when the URN carries
/// no params at all.
pub fn translate_to_appbase(request: &JsonRpcRequest, urn: &Urn) -> JsonRpcRequest {
    let api = urn.api.clone().unwrap_or_else(|| "database_api".to_string());
    let params = match &urn.params {
        Params::Absent => Value::Array(Vec::new()),
        Params::List(items) => Value::Array(items.clone()),
        Params::Map(map) => Value::Object(map.clone()),
    };

    JsonRpcRequest {
        jsonrpc: request.jsonrpc.clone(),
        method: "call".to_string(),
        params: Value::Array(vec![Value::String(api), Value::String(urn.method.clone()), params]),
        id: request.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: Value, id: i64) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Value::from(id),
        }
    }

    #[test]
    fn wraps_bare_method_as_call() {
        let req = request("get_block", serde_json::json!([1000]), 1);
        let urn = Urn {
            namespace: "dpayd".to_string(),
            api: Some("database_api".to_string()),
            method: "get_block".to_string(),
            params: Params::List(vec![Value::from(1000)]),
        };
        let translated = translate_to_appbase(&req, &urn);
        assert_eq!(translated.method, "call");
        assert_eq!(translated.jsonrpc, "2.0");
        assert_eq!(translated.id, Value::from(1));
        assert_eq!(translated.params[0], Value::String("database_api".to_string()));
        assert_eq!(translated.params[1], Value::String("get_block".to_string()));
        assert_eq!(translated.params[2], serde_json::json!([1000]));
    }

    #[test]
    fn login_api_is_untranslatable() {
        let urn = Urn {
            namespace: "dpayd".to_string(),
            api: Some("login_api".to_string()),
            method: "login".to_string(),
            params: Params::Absent,
        };
        let err = check_translatable(&urn).unwrap_err();
        assert!(matches!(err, crate::error::RpcProxyError::UntranslatableMethod(_)));
    }

    #[test]
    fn database_api_is_translatable() {
        let urn = Urn {
            namespace: "dpayd".to_string(),
            api: Some("database_api".to_string()),
            method: "get_block".to_string(),
            params: Params::Absent,
        };
        assert!(check_translatable(&urn).is_ok());
    }

    #[test]
    fn absent_params_becomes_empty_array() {
        let req = request("get_dynamic_global_properties", Value::Null, 2);
        let urn = Urn {
            namespace: "dpayd".to_string(),
            api: Some("database_api".to_string()),
            method: "get_dynamic_global_properties".to_string(),
            params: Params::Absent,
        };
        let translated = translate_to_appbase(&req, &urn);
        assert_eq!(translated.params[2], serde_json::json!([]));
    }
}
