use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// JSON-RPC 2.0 error codes used throughout the proxy.
pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_INTERNAL_ERROR: i64 = -32603;
pub const CODE_SERVER_ERROR: i64 = -32000;
pub const CODE_LIMITS_ERROR: i64 = -31999;
pub const CODE_CUSTOM_JSON_OP_LENGTH_ERROR: i64 = -31998;
pub const CODE_UNTRANSLATABLE_METHOD: i64 = -31997;

#[derive(Debug)]
pub enum RpcProxyError {
    /// JSON decode failure on the request body
    ParseError,
    /// JSON-RPC request shape is invalid
    InvalidRequest(String),
    /// No upstream rule matches the derived URN
    MethodNotFound(String),
    /// Params failed validation (e.g. unknown numeric api selector)
    InvalidParams(String),
    /// All upstream backends failed to handle the request
    AllUpstreamsFailed,
    /// A single upstream request failed
    UpstreamRequest(String),
    /// HTTP status error from upstream
    UpstreamHttp(u16),
    /// The upstream WebSocket connection reset mid-request
    ConnectionReset,
    /// The upstream did not reply before the configured timeout
    Timeout,
    /// Failed to serialize/deserialize JSON
    Json(serde_json::Error),
    /// Failed to read response body
    BodyRead(String),
    /// Health probe failed
    HealthProbe(String),
    /// A request-shape limit was violated
    LimitsError(String),
    /// The custom_json inner payload exceeded the configured byte limit
    CustomJsonOpLengthError(usize, usize),
    /// URN method is on the translator's deny-list and cannot be
    /// rewritten into an appbase `call`
    UntranslatableMethod(String),
    /// Unhandled/unexpected failure
    InternalError(String),
}

impl RpcProxyError {
    /// The stable JSON-RPC error code for this error kind.
    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError => CODE_PARSE_ERROR,
            Self::InvalidRequest(_) => CODE_INVALID_REQUEST,
            Self::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            Self::InvalidParams(_) => CODE_INVALID_PARAMS,
            Self::LimitsError(_) => CODE_LIMITS_ERROR,
            Self::CustomJsonOpLengthError(_, _) => CODE_CUSTOM_JSON_OP_LENGTH_ERROR,
            Self::UntranslatableMethod(_) => CODE_UNTRANSLATABLE_METHOD,
            Self::AllUpstreamsFailed
            | Self::UpstreamRequest(_)
            | Self::UpstreamHttp(_)
            | Self::ConnectionReset
            | Self::Timeout => CODE_SERVER_ERROR,
            Self::Json(_) | Self::BodyRead(_) | Self::HealthProbe(_) | Self::InternalError(_) => {
                CODE_INTERNAL_ERROR
            }
        }
    }

    /// True for transient transport errors that the dispatcher should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset | Self::Timeout | Self::UpstreamRequest(_) | Self::UpstreamHttp(_)
        )
    }
}

impl fmt::Display for RpcProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseError => write!(f, "parse error"),
            Self::InvalidRequest(e) => write!(f, "invalid request: {e}"),
            Self::MethodNotFound(e) => write!(f, "method not found: {e}"),
            Self::InvalidParams(e) => write!(f, "invalid params: {e}"),
            Self::AllUpstreamsFailed => write!(f, "all upstream backends failed"),
            Self::UpstreamRequest(e) => write!(f, "upstream request failed: {e}"),
            Self::UpstreamHttp(status) => write!(f, "upstream HTTP {status}"),
            Self::ConnectionReset => write!(f, "upstream connection reset"),
            Self::Timeout => write!(f, "upstream timed out"),
            Self::Json(e) => write!(f, "JSON error: {e}"),
            Self::BodyRead(e) => write!(f, "body read error: {e}"),
            Self::HealthProbe(e) => write!(f, "health probe failed: {e}"),
            Self::LimitsError(e) => write!(f, "request limit violated: {e}"),
            Self::CustomJsonOpLengthError(len, max) => {
                write!(f, "custom_json op length {len} exceeds limit {max}")
            }
            Self::UntranslatableMethod(m) => write!(f, "method is untranslatable to appbase: {m}"),
            Self::InternalError(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for RpcProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RpcProxyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

static ERROR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A short hex id attached to every error response so operators can
/// correlate a client-visible failure with the corresponding log lines.
/// Built from a process-local counter plus the epoch instead of pulling
/// in a UUID dependency for this alone.
pub fn new_error_id() -> String {
    let seq = ERROR_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("{nanos:016x}{seq:08x}")
}
