//! Validators: well-formedness checks applied before and
//! after dispatch, plus request-shape limits for broadcast methods.

use serde_json::Value;

use crate::error::RpcProxyError;
use crate::registry::BroadcastTransactionLimits;
use crate::urn::Urn;

const BROADCAST_METHODS: &[&str] = &["broadcast_transaction", "broadcast_transaction_synchronous"];

pub fn is_get_block_request(urn: &Urn) -> bool {
    urn.method == "get_block"
}

pub fn is_get_block_header_request(urn: &Urn) -> bool {
    urn.method == "get_block_header"
}

pub fn is_broadcast_transaction_request(urn: &Urn) -> bool {
    BROADCAST_METHODS.contains(&urn.method.as_str())
}

/// Extract the block number encoded in the leading 8 hex characters of
/// `block_id` (big-endian).
pub fn block_num_from_block_id(block_id: &str) -> Option<u64> {
    let prefix = block_id.get(0..8)?;
    u64::from_str_radix(prefix, 16).ok()
}

/// Structural check for `get_block` responses: a `result` object with
/// the expected fields and a `block_id` whose encoded block number
/// matches the requested one.
pub fn is_valid_get_block_response(response: &Value, requested_block: Option<u64>) -> bool {
    let Some(result) = response.get("result").and_then(Value::as_object) else {
        return false;
    };
    const REQUIRED_FIELDS: &[&str] = &[
        "previous",
        "timestamp",
        "witness",
        "block_id",
        "transactions",
        "transaction_ids",
    ];
    if !REQUIRED_FIELDS.iter().all(|f| result.contains_key(*f)) {
        return false;
    }
    let Some(block_id) = result.get("block_id").and_then(Value::as_str) else {
        return false;
    };
    let Some(encoded) = block_num_from_block_id(block_id) else {
        return false;
    };
    match requested_block {
        Some(requested) => encoded == requested,
        None => true,
    }
}

/// Request-shape limit: each `custom_json` operation's inner `json`
/// string must be under the configured byte size.
pub fn limit_custom_json_op_length(
    custom_json: &str,
    limits: &BroadcastTransactionLimits,
) -> Result<(), RpcProxyError> {
    let len = custom_json.len();
    if len > limits.max_custom_json_op_length {
        return Err(RpcProxyError::CustomJsonOpLengthError(len, limits.max_custom_json_op_length));
    }
    Ok(())
}

/// Every `required_auths`/`required_posting_auths` entry must be on the
/// allowlist (if one is configured) and not on the denylist.
pub fn limit_custom_json_account(
    account: &str,
    limits: &BroadcastTransactionLimits,
) -> Result<(), RpcProxyError> {
    if let Some(denylist) = &limits.account_denylist {
        if denylist.iter().any(|a| a == account) {
            return Err(RpcProxyError::LimitsError(format!("account {account} is denylisted")));
        }
    }
    if let Some(allowlist) = &limits.account_allowlist {
        if !allowlist.iter().any(|a| a == account) {
            return Err(RpcProxyError::LimitsError(format!("account {account} is not allowlisted")));
        }
    }
    Ok(())
}

/// Walk a broadcast transaction's operations, applying both shape limits
/// to every `custom_json` operation found. Operations are expected in
/// the `["custom_json", {"required_auths": [...], "required_posting_auths": [...], "json": "..."}]`
/// shape used by dpay/steem/hive transactions.
pub fn limit_broadcast_transaction_request(
    params: &Value,
    limits: &BroadcastTransactionLimits,
) -> Result<(), RpcProxyError> {
    let operations = params
        .as_array()
        .and_then(|args| args.first())
        .and_then(|tx| tx.get("operations"))
        .and_then(Value::as_array);

    let Some(operations) = operations else {
        return Ok(());
    };

    for op in operations {
        let Some(op) = op.as_array() else { continue };
        let (Some(kind), Some(body)) = (op.first().and_then(Value::as_str), op.get(1)) else {
            continue;
        };
        if kind != "custom_json" {
            continue;
        }
        if let Some(json_str) = body.get("json").and_then(Value::as_str) {
            limit_custom_json_op_length(json_str, limits)?;
        }
        for field in ["required_auths", "required_posting_auths"] {
            if let Some(accounts) = body.get(field).and_then(Value::as_array) {
                for account in accounts {
                    if let Some(account) = account.as_str() {
                        limit_custom_json_account(account, limits)?;
                    }
                }
            }
        }
    }
    Ok(())
}
