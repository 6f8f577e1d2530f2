use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "rpcproxy", about = "JSON-RPC reverse proxy with URN-based routing, tiered caching, and a WebSocket upstream pool")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "RPCPROXY_PORT", default_value = "9000")]
    pub port: u16,

    /// Path to the upstream registry JSON file. When absent, a
    /// single synthetic HTTP rule built from `--targets` is used instead.
    #[arg(long, env = "RPCPROXY_UPSTREAM_CONFIG_FILE")]
    pub upstream_config: Option<String>,

    /// Comma-separated list of upstream RPC URLs, used only when
    /// `--upstream-config` is not set.
    #[arg(long, env = "RPCPROXY_TARGETS", default_value = "http://localhost:8090", value_delimiter = ',')]
    pub targets: Vec<String>,

    /// Probe every configured upstream at startup and fail fast if none
    /// respond.
    #[arg(long, env = "RPCPROXY_TEST_UPSTREAM_URLS", default_value = "true")]
    pub validate_upstreams: bool,

    /// Maximum number of requests accepted in a single JSON-RPC batch.
    #[arg(long, env = "RPCPROXY_JSONRPC_BATCH_SIZE_LIMIT", default_value = "50")]
    pub jsonrpc_batch_size_limit: usize,

    /// Minimum number of WebSocket connections kept open per upstream.
    #[arg(long, env = "RPCPROXY_WEBSOCKET_POOL_MINSIZE", default_value = "8")]
    pub websocket_pool_minsize: usize,

    /// Maximum number of WebSocket connections opened per upstream.
    #[arg(long, env = "RPCPROXY_WEBSOCKET_POOL_MAXSIZE", default_value = "8")]
    pub websocket_pool_maxsize: usize,

    /// Recycle a WebSocket connection after this many messages (0 = unlimited).
    #[arg(long, env = "RPCPROXY_WEBSOCKET_MAX_LIFETIME_MESSAGES", default_value = "0")]
    pub websocket_max_lifetime_messages: u64,

    /// Default cache TTL in milliseconds, used when an upstream rule's TTL
    /// is `Seconds` only implicitly (the flat `--targets` fallback mode).
    #[arg(long, env = "RPCPROXY_CACHE_TTL", default_value = "3000")]
    pub cache_ttl: u64,

    /// Maximum number of entries kept in the in-process cache tier.
    #[arg(long, env = "RPCPROXY_CACHE_MAX_SIZE", default_value = "10000")]
    pub cache_max_size: u64,

    /// Timeout, in seconds, for a remote (Redis) cache read before it is
    /// treated as a miss.
    #[arg(long, env = "RPCPROXY_CACHE_READ_TIMEOUT", default_value = "1.0")]
    pub cache_read_timeout: f64,

    /// When set, a remote cache write is skipped (with a warning) if an
    /// existing entry under the same key disagrees with the new value.
    #[arg(long, env = "RPCPROXY_CACHE_TEST_BEFORE_ADD", default_value = "false")]
    pub cache_test_before_add: bool,

    /// Primary Redis URL for the remote cache tier. Absent disables it.
    #[arg(long, env = "RPCPROXY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Comma-separated Redis URLs used as read-only replicas.
    #[arg(long, env = "RPCPROXY_REDIS_READ_REPLICA_URLS", value_delimiter = ',')]
    pub redis_read_replica_urls: Vec<String>,

    /// Health check interval in seconds
    #[arg(long, env = "RPCPROXY_HEALTH_INTERVAL", default_value = "1800")]
    pub health_interval: u64,

    /// Upstream request timeout in seconds
    #[arg(long, env = "RPCPROXY_REQUEST_TIMEOUT", default_value = "10")]
    pub request_timeout: u64,

    /// Bearer token for authenticating RPC requests. If set, all RPC requests
    /// must be sent to `POST /<token>`. The `/readiness` and `/status` endpoints
    /// require `Authorization: Bearer <token>`. The `/health` and
    /// `/.well-known/healthcheck.json` endpoints are not protected.
    #[arg(long, env = "RPCPROXY_TOKEN")]
    pub token: Option<String>,

    /// Enable verbose logging. Shows detailed human-readable logs for every
    /// request, cache hit/miss, upstream selection, and health check. When
    /// off, only critical messages and status changes are logged.
    #[arg(short, long, env = "RPCPROXY_VERBOSE", default_value = "false")]
    pub verbose: bool,
}
