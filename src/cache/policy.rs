//! TTL policy: resolve a symbolic `TtlRule` into a concrete
//! cache duration, given a response and the last-known irreversible
//! block number.

use std::time::Duration;

use serde_json::Value;

use crate::registry::TtlRule;
use crate::validators::block_num_from_block_id;

pub const DEFAULT_TTL_SECS: u64 = 3;

/// `Duration::MAX` stands in for "indefinite" so callers get one
/// concrete type; `None` means "do not cache at all".
pub fn resolve(
    rule: TtlRule,
    method: &str,
    response: &Value,
    last_irreversible: Option<u64>,
) -> Option<Duration> {
    match rule {
        TtlRule::NoCache => None,
        TtlRule::Seconds(secs) => Some(Duration::from_secs(secs)),
        TtlRule::NoExpire => Some(Duration::MAX),
        TtlRule::NoExpireIfIrreversible => resolve_irreversible(method, response, last_irreversible),
    }
}

/// For `get_block`/`get_block_header` responses only: if the response's
/// `block_id`-derived block number is ≤ the last irreversible block,
/// cache indefinitely; otherwise fall back to the default TTL. A
/// missing/unparseable block number means "do not cache".
fn resolve_irreversible(method: &str, response: &Value, last_irreversible: Option<u64>) -> Option<Duration> {
    if method != "get_block" && method != "get_block_header" {
        return Some(Duration::from_secs(DEFAULT_TTL_SECS));
    }

    let block_num = response
        .get("result")
        .and_then(|r| r.get("block_id"))
        .and_then(Value::as_str)
        .and_then(block_num_from_block_id);

    let (Some(block_num), Some(last_irreversible)) = (block_num, last_irreversible) else {
        return None;
    };

    if block_num <= last_irreversible {
        Some(Duration::MAX)
    } else {
        Some(Duration::from_secs(DEFAULT_TTL_SECS))
    }
}
