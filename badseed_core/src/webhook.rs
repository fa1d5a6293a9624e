// Push notifications from the webhook provider: authentication, payload
// typing and normalization into inbound transfers

use crate::error::CoreError;
use crate::models::InboundTransfer;
use crate::settings::Settings;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One item of an enhanced-transaction webhook delivery. Only the fields
/// the tracker reads are typed; everything else is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedTransaction {
    pub signature: String,
    #[serde(default)]
    pub slot: Option<u64>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default, alias = "error")]
    pub transaction_error: Option<Value>,
    #[serde(default)]
    pub account_data: Vec<AccountData>,
    #[serde(default)]
    pub native_transfers: Vec<NativeTransfer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountData {
    pub account: String,
    #[serde(default)]
    pub native_balance_change: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTransfer {
    pub from_user_account: String,
    pub to_user_account: String,
    pub amount: u64,
}

/// What a payload says about SOL movement. Per-account balance changes are
/// authoritative; transfer records are only used when no changes were sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum TransferEvidence {
    BalanceDelta { signature: String, changes: Vec<AccountData> },
    TransferRecords { signature: String, transfers: Vec<NativeTransfer> },
}

impl EnhancedTransaction {
    pub fn is_failed(&self) -> bool {
        self.transaction_error.as_ref().map(|e| !e.is_null()).unwrap_or(false)
    }

    /// `None` for failed transactions and items carrying neither shape.
    pub fn evidence(&self) -> Option<TransferEvidence> {
        if self.is_failed() {
            return None;
        }
        if !self.account_data.is_empty() {
            return Some(TransferEvidence::BalanceDelta {
                signature: self.signature.clone(),
                changes: self.account_data.clone(),
            });
        }
        if !self.native_transfers.is_empty() {
            return Some(TransferEvidence::TransferRecords {
                signature: self.signature.clone(),
                transfers: self.native_transfers.clone(),
            });
        }
        None
    }
}

/// Which inflows count as donations.
#[derive(Debug, Clone)]
pub struct InflowFilter {
    pub donation_wallet: String,
    pub creator_wallet: String,
    pub count_third_party: bool,
}

impl InflowFilter {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            donation_wallet: settings.donation_wallet.clone(),
            creator_wallet: settings.creator_wallet.clone(),
            count_third_party: settings.count_third_party_donations,
        }
    }
}

impl TransferEvidence {
    /// Credit to the donation wallet, if any passes the filter.
    pub fn normalize(&self, filter: &InflowFilter) -> Option<InboundTransfer> {
        match self {
            TransferEvidence::BalanceDelta { signature, changes } => {
                let change_of = |account: &str| {
                    changes
                        .iter()
                        .filter(|c| c.account == account)
                        .map(|c| c.native_balance_change)
                        .sum::<i64>()
                };
                let received = change_of(&filter.donation_wallet);
                if received <= 0 {
                    return None;
                }
                if !filter.count_third_party && change_of(&filter.creator_wallet) >= 0 {
                    return None;
                }
                Some(InboundTransfer {
                    to_account: filter.donation_wallet.clone(),
                    lamports: received as u64,
                    signature: signature.clone(),
                })
            }
            TransferEvidence::TransferRecords { signature, transfers } => {
                let lamports: u64 = transfers
                    .iter()
                    .filter(|t| t.to_user_account == filter.donation_wallet)
                    .filter(|t| filter.count_third_party || t.from_user_account == filter.creator_wallet)
                    .map(|t| t.amount)
                    .sum();
                (lamports > 0).then(|| InboundTransfer {
                    to_account: filter.donation_wallet.clone(),
                    lamports,
                    signature: signature.clone(),
                })
            }
        }
    }
}

/// A delivery reduced to what the reconciler needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookBatch {
    pub transfers: Vec<InboundTransfer>,
    /// Last well-formed signature of the delivery, with its slot when sent
    pub last: Option<(String, Option<u64>)>,
}

/// Parse a delivery body. The body must be a JSON array; items that do not
/// match the expected shape are skipped individually.
pub fn parse_batch(body: &[u8], filter: &InflowFilter) -> Result<WebhookBatch, CoreError> {
    let items: Vec<Value> = serde_json::from_slice(body)?;
    debug!("Webhook delivery with {} items", items.len());

    let mut batch = WebhookBatch::default();
    for (i, item) in items.into_iter().enumerate() {
        let tx: EnhancedTransaction = match serde_json::from_value(item) {
            Ok(tx) => tx,
            Err(e) => {
                warn!("Skipping malformed webhook item {}: {}", i, e);
                continue;
            }
        };
        batch.last = Some((tx.signature.clone(), tx.slot));
        if let Some(transfer) = tx.evidence().and_then(|ev| ev.normalize(filter)) {
            batch.transfers.push(transfer);
        }
    }
    Ok(batch)
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

/// Accepts the raw secret or `Bearer <secret>`. Without a configured secret
/// every request is rejected.
pub fn is_authorized(header: Option<&str>, secret: Option<&str>) -> bool {
    let (Some(header), Some(secret)) = (header, secret) else {
        return false;
    };
    let presented = header.trim();
    let presented = presented.strip_prefix("Bearer ").map(str::trim).unwrap_or(presented);
    constant_time_eq(presented.as_bytes(), secret.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(count_third_party: bool) -> InflowFilter {
        InflowFilter {
            donation_wallet: "DONATION".to_string(),
            creator_wallet: "CREATOR".to_string(),
            count_third_party,
        }
    }

    #[test]
    fn test_balance_delta_wins_over_transfers() {
        let body = json!([{
            "signature": "s1",
            "slot": 7,
            "type": "TRANSFER",
            "accountData": [
                {"account": "CREATOR", "nativeBalanceChange": -1_000_005_000i64},
                {"account": "DONATION", "nativeBalanceChange": 1_000_000_000i64}
            ],
            "nativeTransfers": [
                {"fromUserAccount": "CREATOR", "toUserAccount": "DONATION", "amount": 1_000_000_000u64}
            ]
        }]);
        let batch = parse_batch(body.to_string().as_bytes(), &filter(true)).unwrap();
        assert_eq!(
            batch.transfers,
            vec![InboundTransfer {
                to_account: "DONATION".to_string(),
                lamports: 1_000_000_000,
                signature: "s1".to_string()
            }]
        );
        assert_eq!(batch.last, Some(("s1".to_string(), Some(7))));
    }

    #[test]
    fn test_transfer_records_fallback_and_strict_filter() {
        let body = json!([{
            "signature": "s2",
            "nativeTransfers": [
                {"fromUserAccount": "FAN", "toUserAccount": "DONATION", "amount": 300u64},
                {"fromUserAccount": "CREATOR", "toUserAccount": "DONATION", "amount": 200u64},
                {"fromUserAccount": "CREATOR", "toUserAccount": "ELSEWHERE", "amount": 999u64}
            ]
        }]);
        let raw = body.to_string();
        let lenient = parse_batch(raw.as_bytes(), &filter(true)).unwrap();
        assert_eq!(lenient.transfers[0].lamports, 500);
        let strict = parse_batch(raw.as_bytes(), &filter(false)).unwrap();
        assert_eq!(strict.transfers[0].lamports, 200);
        assert_eq!(strict.last, Some(("s2".to_string(), None)));
    }

    #[test]
    fn test_failed_and_malformed_items_are_skipped() {
        let body = json!([
            {"signature": "failed", "transactionError": {"InstructionError": [0, "Custom"]},
             "nativeTransfers": [{"fromUserAccount": "A", "toUserAccount": "DONATION", "amount": 5u64}]},
            {"no_signature": true},
            {"signature": "ok", "nativeTransfers": [{"fromUserAccount": "A", "toUserAccount": "DONATION", "amount": 5u64}]}
        ]);
        let batch = parse_batch(body.to_string().as_bytes(), &filter(true)).unwrap();
        assert_eq!(batch.transfers.len(), 1);
        assert_eq!(batch.transfers[0].signature, "ok");
    }

    #[test]
    fn test_non_array_body_is_error() {
        assert!(parse_batch(b"not json", &filter(true)).is_err());
        assert!(parse_batch(b"{\"signature\":\"x\"}", &filter(true)).is_err());
    }

    #[test]
    fn test_authorization() {
        assert!(is_authorized(Some("s3cret"), Some("s3cret")));
        assert!(is_authorized(Some("Bearer s3cret"), Some("s3cret")));
        assert!(!is_authorized(Some("s3cre"), Some("s3cret")));
        assert!(!is_authorized(Some("s3cretx"), Some("s3cret")));
        assert!(!is_authorized(None, Some("s3cret")));
        assert!(!is_authorized(Some("anything"), None));
    }
}
