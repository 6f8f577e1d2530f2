use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use rpcproxy::jsonrpc::JsonRpcRequest;
use rpcproxy::registry::{LimitsConfig, RegistryConfig, TtlRule, UpstreamKind, UpstreamRegistry, UpstreamRule};
use rpcproxy::upstream::{UpstreamManager, WsPoolConfig};

fn rpc_request(method_name: &str) -> JsonRpcRequest {
    serde_json::from_value(serde_json::json!({
        "jsonrpc": "2.0",
        "method": method_name,
        "params": [],
        "id": 1
    }))
    .unwrap()
}

fn ok_response(result: &str) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "result": result, "id": 1 })
}

fn http_rule(prefix: &str, url: String, retries: u32) -> UpstreamRule {
    UpstreamRule {
        urn_prefix: prefix.to_string(),
        url,
        kind: UpstreamKind::Http,
        ttl: TtlRule::Seconds(3),
        timeout: 5.0,
        retries,
        translate_to_appbase: false,
    }
}

fn ws_pool_config() -> WsPoolConfig {
    WsPoolConfig { min_size: 1, max_size: 2, max_lifetime_messages: 0 }
}

#[tokio::test]
async fn sends_to_the_rule_bound_by_urn_prefix() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_response("0xabc")))
        .mount(&server)
        .await;

    let registry = Arc::new(UpstreamRegistry::new(RegistryConfig {
        numeric_apis: HashMap::new(),
        upstreams: vec![http_rule("dpayd", server.uri(), 1)],
        limits: LimitsConfig::default(),
    }));
    let manager = UpstreamManager::new(registry, Duration::from_secs(5), ws_pool_config());

    let req = rpc_request("get_block");
    let resp = manager.send("dpayd.database_api.get_block", &req).await.unwrap();
    assert_eq!(resp.result.unwrap(), serde_json::json!("0xabc"));
}

#[tokio::test]
async fn unmatched_urn_returns_method_not_found() {
    let registry = Arc::new(UpstreamRegistry::new(RegistryConfig {
        numeric_apis: HashMap::new(),
        upstreams: vec![http_rule("appbase", "http://127.0.0.1:1".to_string(), 1)],
        limits: LimitsConfig::default(),
    }));
    let manager = UpstreamManager::new(registry, Duration::from_secs(1), ws_pool_config());

    let req = rpc_request("get_block");
    let result = manager.send("dpayd.database_api.get_block", &req).await;
    assert!(matches!(result, Err(rpcproxy::error::RpcProxyError::MethodNotFound(_))));
}

#[tokio::test]
async fn retries_against_the_same_backend_before_failing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_response("0xrescued")))
        .mount(&server)
        .await;

    let registry = Arc::new(UpstreamRegistry::new(RegistryConfig {
        numeric_apis: HashMap::new(),
        upstreams: vec![http_rule("dpayd", server.uri(), 2)],
        limits: LimitsConfig::default(),
    }));
    let manager = UpstreamManager::new(registry, Duration::from_secs(5), ws_pool_config());

    let req = rpc_request("get_block");
    let resp = manager.send("dpayd.database_api.get_block", &req).await.unwrap();
    assert_eq!(resp.result.unwrap(), serde_json::json!("0xrescued"));
}

#[tokio::test]
async fn three_consecutive_failures_mark_backend_down_and_notify() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let registry = Arc::new(UpstreamRegistry::new(RegistryConfig {
        numeric_apis: HashMap::new(),
        upstreams: vec![http_rule("dpayd", server.uri(), 1)],
        limits: LimitsConfig::default(),
    }));
    let manager = UpstreamManager::new(registry, Duration::from_secs(5), ws_pool_config());
    let notify = manager.health_notify();

    let req = rpc_request("get_block");
    for _ in 0..3 {
        let _ = manager.send("dpayd.database_api.get_block", &req).await;
    }

    let notified = tokio::time::timeout(Duration::from_millis(50), notify.notified()).await;
    assert!(notified.is_ok(), "health_notify should fire once a backend goes down");

    let statuses = manager.backend_statuses().await;
    assert_eq!(statuses[0].state, "Down");
}

#[tokio::test]
async fn recovered_backend_goes_healthy_after_probe() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "result": {"head_block_number": 42},
            "id": 1
        })))
        .mount(&server)
        .await;

    let registry = Arc::new(UpstreamRegistry::new(RegistryConfig {
        numeric_apis: HashMap::new(),
        upstreams: vec![http_rule("dpayd", server.uri(), 1)],
        limits: LimitsConfig::default(),
    }));
    let manager = UpstreamManager::new(registry, Duration::from_secs(5), ws_pool_config());

    // registers the backend in the manager's tracked set before probing
    let req = rpc_request("get_dynamic_global_properties");
    let _ = manager.send("dpayd.database_api.get_dynamic_global_properties", &req).await;

    manager.check_all_backends(rpcproxy::health::probe_backend_url).await;

    assert!(manager.has_healthy_backend_with_block().await);
}

#[tokio::test]
async fn unreachable_backend_handled_gracefully() {
    let registry = Arc::new(UpstreamRegistry::new(RegistryConfig {
        numeric_apis: HashMap::new(),
        upstreams: vec![http_rule("dpayd", "http://127.0.0.1:1".to_string(), 1)],
        limits: LimitsConfig::default(),
    }));
    let manager = UpstreamManager::new(registry, Duration::from_secs(1), ws_pool_config());

    let req = rpc_request("get_block");
    let result = manager.send("dpayd.database_api.get_block", &req).await;
    assert!(result.is_err());
}
