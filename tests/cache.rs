use std::sync::Arc;
use std::time::Duration;

use rpcproxy::cache::policy;
use rpcproxy::cache::RpcCache;
use rpcproxy::jsonrpc::JsonRpcResponse;
use rpcproxy::registry::TtlRule;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[test]
fn policy_no_cache_rule() {
    assert_eq!(policy::resolve(TtlRule::NoCache, "get_block", &serde_json::Value::Null, None), None);
}

#[test]
fn policy_fixed_seconds_rule() {
    let ttl = policy::resolve(TtlRule::Seconds(30), "get_accounts", &serde_json::Value::Null, None);
    assert_eq!(ttl, Some(Duration::from_secs(30)));
}

#[test]
fn policy_no_expire_if_irreversible_past_block() {
    let response = serde_json::json!({
        "id": 1,
        "result": {"block_id": "000003e8cc14da92f6beb0f9949a672cda19dd7b"}
    });
    let ttl = policy::resolve(TtlRule::NoExpireIfIrreversible, "get_block", &response, Some(1000));
    assert_eq!(ttl, Some(Duration::MAX));
}

#[test]
fn policy_no_expire_if_irreversible_future_block_falls_back_to_default() {
    let response = serde_json::json!({
        "id": 1,
        "result": {"block_id": "000003e8cc14da92f6beb0f9949a672cda19dd7b"}
    });
    let ttl = policy::resolve(TtlRule::NoExpireIfIrreversible, "get_block", &response, Some(1));
    assert_eq!(ttl, Some(Duration::from_secs(policy::DEFAULT_TTL_SECS)));
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_get_miss() {
    let cache = RpcCache::new(100, 2000);
    assert!(cache.get("nonexistent").await.is_none());
}

#[tokio::test]
async fn store_insert_and_get() {
    let cache = RpcCache::new(100, 2000);
    let resp = Arc::new(JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        result: Some(serde_json::json!("0x123")),
        error: None,
        id: serde_json::json!(1),
    });
    cache.insert("key1".to_string(), resp.clone(), Duration::from_secs(60)).await;
    let cached = cache.get("key1").await;
    assert!(cached.is_some());
    assert_eq!(cached.unwrap().result, resp.result);
}

#[tokio::test]
async fn store_invalidate_removes_entry() {
    let cache = RpcCache::new(100, 2000);
    let resp = Arc::new(JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        result: Some(serde_json::json!(1)),
        error: None,
        id: serde_json::json!(1),
    });
    cache.insert("key1".to_string(), resp, Duration::from_secs(60)).await;
    cache.invalidate("key1").await;
    assert!(cache.get("key1").await.is_none());
}
