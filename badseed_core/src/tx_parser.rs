// Transaction parsing - platform agnostic
// Reads SOL balance movements out of `getTransaction` JSON (jsonParsed or json encoding)

use crate::error::CoreError;
use serde_json::Value;

/// Flatten `transaction.message.accountKeys` into plain base58 strings. Parsed
/// encodings carry `{pubkey, signer, writable}` objects, raw ones plain strings.
pub fn normalize_account_keys(tx: &Value) -> Result<Vec<String>, CoreError> {
    let account_keys_arr = tx
        .get("transaction")
        .and_then(|t| t.get("message"))
        .and_then(|m| m.get("accountKeys"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| CoreError::ParseError("Missing accountKeys in transaction".to_string()))?;

    let mut account_keys: Vec<String> = Vec::with_capacity(account_keys_arr.len());
    for key in account_keys_arr {
        if let Some(s) = key.as_str() {
            account_keys.push(s.to_string());
        } else if let Some(pubkey) = key.get("pubkey").and_then(|p| p.as_str()) {
            account_keys.push(pubkey.to_string());
        } else {
            return Err(CoreError::ParseError(format!("Unrecognized account key: {}", key)));
        }
    }

    Ok(account_keys)
}

/// True when the node reports an execution error, or no meta at all.
pub fn is_failed(tx: &Value) -> bool {
    match tx.get("meta") {
        Some(meta) if meta.is_object() => meta.get("err").map(|e| !e.is_null()).unwrap_or(false),
        _ => true,
    }
}

/// Lamport change (`post - pre`) of `account` in this transaction; `None` when
/// the account is not part of it or the balances are missing.
pub fn balance_delta(tx: &Value, account: &str) -> Option<i64> {
    let keys = normalize_account_keys(tx).ok()?;
    let index = keys.iter().position(|k| k == account)?;
    let meta = tx.get("meta")?;
    let pre = meta.get("preBalances")?.as_array()?.get(index)?.as_u64()?;
    let post = meta.get("postBalances")?.as_array()?.get(index)?.as_u64()?;
    Some(post as i64 - pre as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parsed_tx(err: Value) -> Value {
        json!({
            "slot": 10,
            "transaction": {
                "signatures": ["sigA"],
                "message": {
                    "accountKeys": [
                        {"pubkey": "creator", "signer": true, "writable": true},
                        {"pubkey": "donation", "signer": false, "writable": true},
                        {"pubkey": "11111111111111111111111111111111", "signer": false, "writable": false}
                    ]
                }
            },
            "meta": {
                "err": err,
                "preBalances": [5_000_000_000u64, 1_000_000_000u64, 1],
                "postBalances": [2_999_995_000u64, 3_000_000_000u64, 1]
            }
        })
    }

    #[test]
    fn test_balance_delta_by_account() {
        let tx = parsed_tx(Value::Null);
        assert_eq!(balance_delta(&tx, "donation"), Some(2_000_000_000));
        assert_eq!(balance_delta(&tx, "creator"), Some(-2_000_005_000));
        assert_eq!(balance_delta(&tx, "stranger"), None);
    }

    #[test]
    fn test_failed_detection() {
        assert!(!is_failed(&parsed_tx(Value::Null)));
        assert!(is_failed(&parsed_tx(json!({"InstructionError": [0, "Custom"]}))));
        assert!(is_failed(&json!({"transaction": {}})));
    }

    #[test]
    fn test_plain_string_account_keys() {
        let tx = json!({"transaction": {"message": {"accountKeys": ["a", "b"]}}});
        assert_eq!(normalize_account_keys(&tx).unwrap(), vec!["a", "b"]);
        assert!(normalize_account_keys(&json!({})).is_err());
    }
}
