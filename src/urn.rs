//! URN canonicalization: derives a stable identity string from
//! any accepted JSON-RPC request shape. The URN is both the cache key and
//! the routing input for the upstream registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use lru::LruCache;
use serde_json::Value;

use crate::error::RpcProxyError;

/// Appbase APIs recognized by the dotted two-segment and `call`-selector
/// grammar rules. Namespace-determining, not a routing table.
const APPBASE_APIS: &[&str] = &[
    "condenser_api",
    "block_api",
    "database_api",
    "account_by_key_api",
    "follow_api",
    "market_history_api",
    "network_broadcast_api",
    "tags_api",
    "witness_api",
    "rc_api",
    "jsonrpc",
];

/// Bare (dot-free) legacy method names resolved to their api. Anything
/// absent from this table defaults to `database_api`.
const BARE_METHOD_APIS: &[(&str, &str)] = &[
    ("get_block", "database_api"),
    ("get_block_header", "database_api"),
    ("get_accounts", "database_api"),
    ("get_dynamic_global_properties", "database_api"),
    ("broadcast_transaction", "network_broadcast_api"),
    ("broadcast_transaction_synchronous", "network_broadcast_api"),
    ("login", "login_api"),
    ("get_followers", "follow_api"),
    ("get_trending_tags", "tags_api"),
    ("get_ticker", "market_history_api"),
];

const DEFAULT_BARE_API: &str = "database_api";
const LEGACY_NAMESPACE: &str = "dpayd";
const APPBASE_NAMESPACE: &str = "appbase";

/// Params component of a URN: a three-way sum per the Design Notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Params {
    Absent,
    List(Vec<Value>),
    Map(serde_json::Map<String, Value>),
}

impl Params {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            None => Params::Absent,
            Some(Value::Array(items)) => Params::List(items.clone()),
            Some(Value::Object(map)) => Params::Map(map.clone()),
            Some(Value::Null) => Params::Absent,
            Some(other) => Params::List(vec![other.clone()]),
        }
    }

    /// Compact, key-sorted canonical JSON rendering. `[[]]` stays `[[]]`
    /// (not collapsed to `[]`). Public so callers outside URN derivation
    /// (e.g. the `x-rpcproxy-params` response header) can render the
    /// same canonical form without re-deriving it.
    pub fn canonical_json(&self) -> Option<String> {
        match self {
            Params::Absent => None,
            Params::List(items) => Some(serde_json::to_string(items).unwrap_or_default()),
            Params::Map(map) => {
                let sorted = sorted_object(map);
                Some(serde_json::to_string(&sorted).unwrap_or_default())
            }
        }
    }
}

fn sorted_object(map: &serde_json::Map<String, Value>) -> Value {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let mut sorted = serde_json::Map::new();
    for k in keys {
        sorted.insert(k.clone(), sort_value(&map[k]));
    }
    Value::Object(sorted)
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => sorted_object(map),
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

/// Canonical request identity: `(namespace, api, method, params)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urn {
    pub namespace: String,
    pub api: Option<String>,
    pub method: String,
    pub params: Params,
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.", self.namespace)?;
        if let Some(api) = &self.api {
            write!(f, "{api}.")?;
        }
        write!(f, "{}", self.method)?;
        if let Some(params) = self.params.canonical_json() {
            write!(f, ".params={params}")?;
        }
        Ok(())
    }
}

/// Per-method canonicalizer output cache: method parsing dominates hot
/// paths, so we memoize the (namespace, api) split keyed by the raw
/// method string (params still vary per call and are appended fresh).
pub struct UrnCache {
    inner: Mutex<LruCache<String, (String, Option<String>)>>,
}

impl UrnCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl Default for UrnCache {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Derive a URN from a raw JSON-RPC request object.
///
/// `numeric_apis` maps the small-integer api selectors accepted by
/// grammar rule 4 (`method = "call"`) to api names; it is registry data,
/// not a code constant.
pub fn canonicalize(
    method: &str,
    params: Option<&Value>,
    numeric_apis: &HashMap<u64, String>,
    cache: &UrnCache,
) -> Result<Urn, RpcProxyError> {
    if method == "call" {
        return canonicalize_call(params, numeric_apis);
    }

    if let Some(cached) = cache.inner.lock().unwrap().get(method).cloned() {
        let (namespace, api) = cached;
        return Ok(Urn {
            namespace,
            api,
            method: bare_or_dotted_method(method),
            params: Params::from_value(params),
        });
    }

    let segments: Vec<&str> = method.split('.').collect();
    let (namespace, api, bare_method) = match segments.as_slice() {
        [api, m] => {
            if APPBASE_APIS.contains(api) {
                (APPBASE_NAMESPACE.to_string(), Some(api.to_string()), m.to_string())
            } else {
                (api.to_string(), None, m.to_string())
            }
        }
        [ns, api, m] => (ns.to_string(), Some(api.to_string()), m.to_string()),
        [m] => {
            let api = BARE_METHOD_APIS
                .iter()
                .find(|(name, _)| *name == *m)
                .map(|(_, api)| *api)
                .unwrap_or(DEFAULT_BARE_API);
            (LEGACY_NAMESPACE.to_string(), Some(api.to_string()), m.to_string())
        }
        _ => (LEGACY_NAMESPACE.to_string(), Some(DEFAULT_BARE_API.to_string()), method.to_string()),
    };

    cache
        .inner
        .lock()
        .unwrap()
        .put(method.to_string(), (namespace.clone(), api.clone()));

    Ok(Urn {
        namespace,
        api,
        method: bare_method,
        params: Params::from_value(params),
    })
}

fn bare_or_dotted_method(method: &str) -> String {
    method.rsplit('.').next().unwrap_or(method).to_string()
}

fn canonicalize_call(
    params: Option<&Value>,
    numeric_apis: &HashMap<u64, String>,
) -> Result<Urn, RpcProxyError> {
    let items = params
        .and_then(Value::as_array)
        .ok_or_else(|| RpcProxyError::InvalidParams("call requires an array of params".into()))?;

    let selector = items
        .first()
        .ok_or_else(|| RpcProxyError::InvalidParams("call requires an api selector".into()))?;

    let api = match selector {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            let n = n
                .as_u64()
                .ok_or_else(|| RpcProxyError::InvalidParams("negative numeric api selector".into()))?;
            numeric_apis
                .get(&n)
                .cloned()
                .ok_or_else(|| RpcProxyError::InvalidParams(format!("unknown numeric api {n}")))?
        }
        _ => return Err(RpcProxyError::InvalidParams("invalid api selector type".into())),
    };

    let method = items
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcProxyError::InvalidParams("call requires a method name".into()))?
        .to_string();

    let namespace = if APPBASE_APIS.contains(&api.as_str()) {
        APPBASE_NAMESPACE
    } else {
        LEGACY_NAMESPACE
    };

    let call_params = items.get(2).map(|v| Params::from_value(Some(v))).unwrap_or(Params::Absent);

    Ok(Urn {
        namespace: namespace.to_string(),
        api: Some(api),
        method,
        params: call_params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_apis() -> HashMap<u64, String> {
        let mut m = HashMap::new();
        m.insert(0, "database_api".to_string());
        m.insert(1, "login_api".to_string());
        m
    }

    #[test]
    fn bare_method_resolves_via_table() {
        let cache = UrnCache::default();
        let urn = canonicalize(
            "get_block",
            Some(&serde_json::json!([1000])),
            &numeric_apis(),
            &cache,
        )
        .unwrap();
        assert_eq!(urn.to_string(), "dpayd.database_api.get_block.params=[1000]");
    }

    #[test]
    fn bare_method_unknown_defaults_to_database_api() {
        let cache = UrnCache::default();
        let urn = canonicalize("some_unknown_method", None, &numeric_apis(), &cache).unwrap();
        assert_eq!(urn.to_string(), "dpayd.database_api.some_unknown_method");
    }

    #[test]
    fn dotted_two_segment_appbase_api() {
        let cache = UrnCache::default();
        let urn = canonicalize(
            "condenser_api.get_block",
            Some(&serde_json::json!([1000])),
            &numeric_apis(),
            &cache,
        )
        .unwrap();
        assert_eq!(urn.to_string(), "appbase.condenser_api.get_block.params=[1000]");
    }

    #[test]
    fn dotted_two_segment_non_appbase_api() {
        let cache = UrnCache::default();
        let urn = canonicalize("overseer.ping", None, &numeric_apis(), &cache).unwrap();
        assert_eq!(urn.namespace, "overseer");
        assert!(urn.api.is_none());
    }

    #[test]
    fn dotted_three_segment_is_literal() {
        let cache = UrnCache::default();
        let urn = canonicalize("dpayd.database_api.get_block", None, &numeric_apis(), &cache).unwrap();
        assert_eq!(urn.to_string(), "dpayd.database_api.get_block");
    }

    #[test]
    fn call_with_named_api_selector() {
        let cache = UrnCache::default();
        let urn = canonicalize(
            "call",
            Some(&serde_json::json!(["database_api", "get_account_count", []])),
            &numeric_apis(),
            &cache,
        )
        .unwrap();
        // database_api is in the appbase table, so namespace follows appbase
        // even though the call arrived via the legacy `call` selector grammar.
        assert_eq!(urn.to_string(), "appbase.database_api.get_account_count.params=[]");
    }

    #[test]
    fn call_with_non_appbase_api_selector_uses_dpayd_namespace() {
        let cache = UrnCache::default();
        let urn = canonicalize(
            "call",
            Some(&serde_json::json!(["login_api", "login", ["", ""]])),
            &numeric_apis(),
            &cache,
        )
        .unwrap();
        assert_eq!(urn.to_string(), r#"dpayd.login_api.login.params=["",""]"#);
    }

    #[test]
    fn call_with_numeric_api_selector() {
        let cache = UrnCache::default();
        let urn = canonicalize(
            "call",
            Some(&serde_json::json!([1, "login", ["", ""]])),
            &numeric_apis(),
            &cache,
        )
        .unwrap();
        assert_eq!(urn.to_string(), r#"dpayd.login_api.login.params=["",""]"#);
    }

    #[test]
    fn call_with_unknown_numeric_api_selector_errors() {
        let cache = UrnCache::default();
        let err = canonicalize(
            "call",
            Some(&serde_json::json!([42, "login", []])),
            &numeric_apis(),
            &cache,
        )
        .unwrap_err();
        assert!(matches!(err, RpcProxyError::InvalidParams(_)));
    }

    #[test]
    fn call_with_appbase_api_selector_uses_appbase_namespace() {
        let cache = UrnCache::default();
        let urn = canonicalize(
            "call",
            Some(&serde_json::json!(["condenser_api", "get_block", [1000]])),
            &numeric_apis(),
            &cache,
        )
        .unwrap();
        assert_eq!(urn.namespace, "appbase");
    }

    #[test]
    fn call_without_args_is_params_absent() {
        let cache = UrnCache::default();
        let urn = canonicalize(
            "call",
            Some(&serde_json::json!(["database_api", "get_account_count"])),
            &numeric_apis(),
            &cache,
        )
        .unwrap();
        assert_eq!(urn.to_string(), "dpayd.database_api.get_account_count");
    }

    #[test]
    fn nested_empty_list_params_is_not_collapsed() {
        let cache = UrnCache::default();
        let urn = canonicalize(
            "get_block",
            Some(&serde_json::json!([[]])),
            &numeric_apis(),
            &cache,
        )
        .unwrap();
        assert_eq!(urn.to_string(), "dpayd.database_api.get_block.params=[[]]");
    }

    #[test]
    fn object_params_are_key_sorted() {
        let cache = UrnCache::default();
        let urn = canonicalize(
            "get_block",
            Some(&serde_json::json!({"b": 1, "a": 2})),
            &numeric_apis(),
            &cache,
        )
        .unwrap();
        assert_eq!(urn.to_string(), r#"dpayd.database_api.get_block.params={"a":2,"b":1}"#);
    }

    #[test]
    fn urn_derivation_is_deterministic() {
        let cache = UrnCache::default();
        let a = canonicalize("get_block", Some(&serde_json::json!([1000])), &numeric_apis(), &cache).unwrap();
        let b = canonicalize("get_block", Some(&serde_json::json!([1000])), &numeric_apis(), &cache).unwrap();
        assert_eq!(a, b);
    }
}
