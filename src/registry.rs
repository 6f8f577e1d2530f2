//! Upstream registry: loads an ordered list of URN-prefix
//! rules from a JSON config file and resolves a URN to the rule whose
//! `urn_prefix` is the longest matching prefix.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RpcProxyError;

/// Symbolic TTL with the total ordering:
/// `NoCache < Seconds(_) < NoExpireIfIrreversible < NoExpire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TtlWire", into = "TtlWire")]
pub enum TtlRule {
    NoCache,
    Seconds(u64),
    NoExpireIfIrreversible,
    NoExpire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum TtlWire {
    Seconds(u64),
    Symbol(String),
}

impl TryFrom<TtlWire> for TtlRule {
    type Error = String;

    fn try_from(wire: TtlWire) -> Result<Self, Self::Error> {
        match wire {
            TtlWire::Seconds(secs) => Ok(TtlRule::Seconds(secs)),
            TtlWire::Symbol(s) => match s.as_str() {
                "no_expire" => Ok(TtlRule::NoExpire),
                "no_cache" => Ok(TtlRule::NoCache),
                "no_expire_if_irreversible" => Ok(TtlRule::NoExpireIfIrreversible),
                other => Err(format!("unknown ttl symbol: {other}")),
            },
        }
    }
}

impl From<TtlRule> for TtlWire {
    fn from(rule: TtlRule) -> Self {
        match rule {
            TtlRule::Seconds(secs) => TtlWire::Seconds(secs),
            TtlRule::NoExpire => TtlWire::Symbol("no_expire".into()),
            TtlRule::NoCache => TtlWire::Symbol("no_cache".into()),
            TtlRule::NoExpireIfIrreversible => TtlWire::Symbol("no_expire_if_irreversible".into()),
        }
    }
}

/// `Seconds` values order by their magnitude against each other; across
/// sentinels the fixed ordering below applies.
impl PartialOrd for TtlRule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TtlRule {
    fn cmp(&self, other: &Self) -> Ordering {
        fn rank(rule: &TtlRule) -> (u8, u64) {
            match rule {
                TtlRule::NoCache => (0, 0),
                TtlRule::Seconds(s) => (1, *s),
                TtlRule::NoExpireIfIrreversible => (2, 0),
                TtlRule::NoExpire => (3, 0),
            }
        }
        rank(self).cmp(&rank(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Http,
    Websocket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamRule {
    pub urn_prefix: String,
    pub url: String,
    #[serde(default = "default_kind")]
    pub kind: UpstreamKind,
    pub ttl: TtlRule,
    pub timeout: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub translate_to_appbase: bool,
}

fn default_kind() -> UpstreamKind {
    UpstreamKind::Http
}

fn default_retries() -> u32 {
    1
}

impl UpstreamRule {
    /// Resolve `url`, substituting it with the named environment variable
    /// when it has the form `$ENV_VAR`. Resolved at call time (not at
    /// load time) so tests can mutate env between resolutions.
    pub fn resolved_url(&self) -> String {
        match self.url.strip_prefix('$') {
            Some(var) => std::env::var(var).unwrap_or_else(|_| self.url.clone()),
            None => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BroadcastTransactionLimits {
    #[serde(default = "default_custom_json_limit")]
    pub max_custom_json_op_length: usize,
    #[serde(default)]
    pub account_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub account_denylist: Option<Vec<String>>,
}

fn default_custom_json_limit() -> usize {
    8192
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LimitsConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub broadcast_transaction: BroadcastTransactionLimits,
}

fn default_batch_size() -> usize {
    50
}

impl Default for TtlRule {
    fn default() -> Self {
        TtlRule::Seconds(3)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    #[serde(default)]
    pub numeric_apis: HashMap<String, String>,
    pub upstreams: Vec<UpstreamRule>,
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Per-process singleton mapping URNs to upstream rules. Owns the rule
/// set for the process lifetime; construction is a pure function of the
/// config file (or, with no file, the synthetic single-rule fallback).
#[derive(Debug, Clone)]
pub struct UpstreamRegistry {
    rules: Vec<UpstreamRule>,
    pub numeric_apis: HashMap<u64, String>,
    pub limits: LimitsConfig,
}

impl UpstreamRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let numeric_apis = config
            .numeric_apis
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u64>().ok().map(|n| (n, v)))
            .collect();

        Self {
            rules: config.upstreams,
            numeric_apis,
            limits: config.limits,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, RpcProxyError> {
        let body = std::fs::read_to_string(path)
            .map_err(|e| RpcProxyError::InternalError(format!("read {}: {e}", path.display())))?;
        let config: RegistryConfig = serde_json::from_str(&body)?;
        info!(path = %path.display(), rules = config.upstreams.len(), "loaded upstream registry");
        Ok(Self::new(config))
    }

    /// A single HTTP rule matching every URN, used when no registry file
    /// is configured (keeps the flat `--targets` list usable without a
    /// registry file at all).
    pub fn single_http(url: String, timeout: f64, retries: u32) -> Self {
        Self::new(RegistryConfig {
            numeric_apis: HashMap::new(),
            upstreams: vec![UpstreamRule {
                urn_prefix: String::new(),
                url,
                kind: UpstreamKind::Http,
                ttl: TtlRule::Seconds(3),
                timeout,
                retries,
                translate_to_appbase: false,
            }],
            limits: LimitsConfig::default(),
        })
    }

    /// Longest-prefix-match resolution; ties broken by registry order.
    pub fn resolve(&self, urn: &str) -> Option<&UpstreamRule> {
        let mut best: Option<&UpstreamRule> = None;
        for rule in &self.rules {
            if urn.starts_with(rule.urn_prefix.as_str()) {
                match best {
                    Some(current) if current.urn_prefix.len() >= rule.urn_prefix.len() => {}
                    _ => best = Some(rule),
                }
            }
        }
        if best.is_none() {
            warn!(urn = %urn, "no upstream rule matched urn");
        }
        best
    }

    pub fn rules(&self) -> &[UpstreamRule] {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(prefix: &str) -> UpstreamRule {
        UpstreamRule {
            urn_prefix: prefix.to_string(),
            url: "http://localhost:1".to_string(),
            kind: UpstreamKind::Http,
            ttl: TtlRule::Seconds(3),
            timeout: 1.0,
            retries: 1,
            translate_to_appbase: false,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let registry = UpstreamRegistry::new(RegistryConfig {
            numeric_apis: HashMap::new(),
            upstreams: vec![rule("dpayd"), rule("dpayd.database_api.get_block")],
            limits: LimitsConfig::default(),
        });
        let resolved = registry.resolve("dpayd.database_api.get_block.params=[1]").unwrap();
        assert_eq!(resolved.urn_prefix, "dpayd.database_api.get_block");
    }

    #[test]
    fn ties_broken_by_registry_order() {
        let registry = UpstreamRegistry::new(RegistryConfig {
            numeric_apis: HashMap::new(),
            upstreams: vec![rule("dpayd"), rule("dpayd")],
            limits: LimitsConfig::default(),
        });
        let resolved = registry.resolve("dpayd.database_api.get_block").unwrap();
        assert_eq!(resolved.url, "http://localhost:1");
    }

    #[test]
    fn no_match_returns_none() {
        let registry = UpstreamRegistry::new(RegistryConfig {
            numeric_apis: HashMap::new(),
            upstreams: vec![rule("appbase")],
            limits: LimitsConfig::default(),
        });
        assert!(registry.resolve("dpayd.database_api.get_block").is_none());
    }

    #[test]
    fn env_var_url_substitution() {
        unsafe {
            std::env::set_var("RPCPROXY_TEST_URL_VAR", "wss://example.invalid");
        }
        let mut r = rule("dpayd");
        r.url = "$RPCPROXY_TEST_URL_VAR".to_string();
        assert_eq!(r.resolved_url(), "wss://example.invalid");
        unsafe {
            std::env::remove_var("RPCPROXY_TEST_URL_VAR");
        }
    }

    #[test]
    fn ttl_total_ordering() {
        assert!(TtlRule::NoCache < TtlRule::Seconds(3));
        assert!(TtlRule::Seconds(3) < TtlRule::NoExpireIfIrreversible);
        assert!(TtlRule::NoExpireIfIrreversible < TtlRule::NoExpire);
    }

    #[test]
    fn ttl_deserializes_from_json() {
        let rule: UpstreamRule = serde_json::from_value(serde_json::json!({
            "urn_prefix": "dpayd",
            "url": "http://localhost",
            "kind": "websocket",
            "ttl": "no_expire_if_irreversible",
            "timeout": 3.0,
            "retries": 2
        }))
        .unwrap();
        assert_eq!(rule.ttl, TtlRule::NoExpireIfIrreversible);
        assert_eq!(rule.kind, UpstreamKind::Websocket);
    }
}
