use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tracing::{error, info, warn};

use rpcproxy::cache::{CacheGroup, RedisCache, RpcCache};
use rpcproxy::config::Config;
use rpcproxy::dispatcher::Dispatcher;
use rpcproxy::handler::status::{health_handler, readiness_handler, status_handler, well_known_healthcheck_handler};
use rpcproxy::handler::rpc::{open_rpc_handler, token_rpc_handler};
use rpcproxy::handler::AppState;
use rpcproxy::health;
use rpcproxy::registry::UpstreamRegistry;
use rpcproxy::upstream::{UpstreamManager, WsPoolConfig};

/// `rpcproxy --health` runs a tiny std-only HTTP probe against a running
/// instance and exits, for use as a Docker `HEALTHCHECK` without curl.
fn maybe_run_health_check() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--health") {
        let port = Config::parse().port;
        std::process::exit(health::run_health_check(port));
    }
}

#[tokio::main]
async fn main() {
    maybe_run_health_check();

    let config = Config::parse();

    let log_level = if config.verbose { "debug,hyper=info,reqwest=info" } else { "warn,rpcproxy=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let token = config.token.clone().filter(|t| !t.is_empty());

    info!(
        port = %config.port,
        targets = ?config.targets,
        upstream_config = ?config.upstream_config,
        cache_ttl = %config.cache_ttl,
        health_interval = %config.health_interval,
        auth = token.is_some(),
        verbose = config.verbose,
        "starting rpcproxy"
    );

    if let Some(ref t) = token {
        info!(path = %format!("/{t}"), "token auth enabled via URL path");
    }

    let registry = Arc::new(build_registry(&config));

    if config.validate_upstreams {
        validate_upstreams(&registry, Duration::from_secs(config.request_timeout)).await;
    }

    let ws_pool_config = WsPoolConfig {
        min_size: config.websocket_pool_minsize,
        max_size: config.websocket_pool_maxsize,
        max_lifetime_messages: config.websocket_max_lifetime_messages,
    };
    let upstream = Arc::new(UpstreamManager::new(
        registry.clone(),
        Duration::from_secs(config.request_timeout),
        ws_pool_config,
    ));

    let memory = RpcCache::new(config.cache_max_size, config.cache_ttl);
    let cache = build_cache_group(&config, memory).await;
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), upstream.clone(), cache));

    let state = AppState {
        upstream: upstream.clone(),
        dispatcher,
        token,
        last_irreversible: Arc::new(AtomicU64::new(u64::MAX)),
    };

    tokio::spawn(health::start_health_checker(upstream.clone(), config.health_interval));
    tokio::spawn(refresh_last_irreversible(upstream.clone(), state.last_irreversible.clone()));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/.well-known/healthcheck.json", get(well_known_healthcheck_handler))
        .route("/readiness", get(readiness_handler))
        .route("/status", get(status_handler))
        .route("/{token}", post(token_rpc_handler))
        .fallback(post(open_rpc_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind");

    info!(addr = %addr, "rpcproxy listening");
    axum::serve(listener, app).await.expect("server error");
}

fn build_registry(config: &Config) -> UpstreamRegistry {
    match &config.upstream_config {
        Some(path) => UpstreamRegistry::from_file(std::path::Path::new(path))
            .unwrap_or_else(|e| panic!("failed to load upstream registry {path}: {e}")),
        None => {
            let url = config.targets.first().cloned().unwrap_or_else(|| "http://localhost:8090".to_string());
            UpstreamRegistry::single_http(url, config.request_timeout as f64, 1)
        }
    }
}

/// Probes every distinct upstream URL once at startup; a backend that
/// fails the probe is logged but does not block the process from
/// starting (the reactive health checker takes over from here). HTTP
/// upstreams get a plain GET; WebSocket upstreams get a single
/// connect/close, since a GET against a `ws://` URL tells us nothing.
async fn validate_upstreams(registry: &UpstreamRegistry, timeout: Duration) {
    let client = reqwest::Client::builder().timeout(timeout).build().expect("failed to build HTTP client");
    for rule in registry.rules() {
        let url = rule.resolved_url();
        match rule.kind {
            rpcproxy::registry::UpstreamKind::Http => match client.get(&url).send().await {
                Ok(_) => info!(url = %url, "upstream reachable"),
                Err(e) => warn!(url = %url, error = %e, "upstream unreachable at startup"),
            },
            rpcproxy::registry::UpstreamKind::Websocket => {
                match tokio::time::timeout(timeout, health::probe_websocket(&url)).await {
                    Ok(Ok(())) => info!(url = %url, "upstream reachable"),
                    Ok(Err(e)) => warn!(url = %url, error = %e, "upstream unreachable at startup"),
                    Err(_) => warn!(url = %url, "upstream connect timed out at startup"),
                }
            }
        }
    }
}

async fn build_cache_group(config: &Config, memory: RpcCache) -> CacheGroup {
    let Some(primary_url) = &config.redis_url else {
        return CacheGroup::memory_only(memory);
    };

    let read_timeout = Duration::from_secs_f64(config.cache_read_timeout);
    let primary = match RedisCache::connect(primary_url, read_timeout).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            error!(url = %primary_url, error = %e, "failed to connect to primary redis, falling back to memory-only cache");
            None
        }
    };

    let mut replicas = Vec::new();
    for url in &config.redis_read_replica_urls {
        match RedisCache::connect(url, read_timeout).await {
            Ok(cache) => replicas.push(cache),
            Err(e) => warn!(url = %url, error = %e, "failed to connect to redis read replica"),
        }
    }

    CacheGroup::new(memory, primary, replicas, config.cache_test_before_add)
}

/// Keeps `AppState::last_irreversible` fresh from the upstream manager's
/// own health-probe block numbers, reusing the manager's stale-block
/// tracking instead of issuing a separate poll.
async fn refresh_last_irreversible(upstream: Arc<UpstreamManager>, slot: Arc<AtomicU64>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    loop {
        ticker.tick().await;
        let statuses = upstream.backend_statuses().await;
        if let Some(block) = statuses.iter().filter_map(|s| s.latest_block).min() {
            slot.store(block, Ordering::Relaxed);
        }
    }
}
