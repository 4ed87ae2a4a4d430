//! Domain types for the treasury backend.
//!
//! Wire decoding is deliberately lenient: several backend versions have
//! been observed sending ids as numbers or strings, and the override
//! `changes` document as either an object or a JSON-encoded string. All
//! of that tolerance lives here, at the boundary, so the rest of the
//! crate works with normalized types.

pub mod changes;

pub use changes::{ChangeSet, Changes};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// Collections the backend exposes; names the cache root for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityFamily {
    Transactions,
    OverrideRequests,
    Disbursements,
    Cheques,
    Receipts,
    FundAccounts,
    RecipientAccounts,
}

impl EntityFamily {
    /// Stable name used in cache keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityFamily::Transactions => "transactions",
            EntityFamily::OverrideRequests => "override_requests",
            EntityFamily::Disbursements => "disbursements",
            EntityFamily::Cheques => "cheques",
            EntityFamily::Receipts => "receipts",
            EntityFamily::FundAccounts => "fund_accounts",
            EntityFamily::RecipientAccounts => "recipient_accounts",
        }
    }

    /// All families, for whole-cache sweeps (reconciliation).
    pub fn all() -> &'static [EntityFamily] {
        &[
            EntityFamily::Transactions,
            EntityFamily::OverrideRequests,
            EntityFamily::Disbursements,
            EntityFamily::Cheques,
            EntityFamily::Receipts,
            EntityFamily::FundAccounts,
            EntityFamily::RecipientAccounts,
        ]
    }

    /// The realtime channel carrying mutations for this family.
    ///
    /// Transactions, disbursements and fund accounts share the
    /// disbursements feed (balance updates arrive there).
    pub fn sync_channel(&self) -> SyncChannel {
        match self {
            EntityFamily::Transactions
            | EntityFamily::Disbursements
            | EntityFamily::FundAccounts
            | EntityFamily::RecipientAccounts => SyncChannel::Disbursements,
            EntityFamily::Cheques => SyncChannel::Cheques,
            EntityFamily::Receipts => SyncChannel::Receipts,
            EntityFamily::OverrideRequests => SyncChannel::OverrideTransactions,
        }
    }
}

impl std::fmt::Display for EntityFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Realtime socket channels (one shared connection each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncChannel {
    Disbursements,
    Cheques,
    Receipts,
    OverrideTransactions,
}

impl SyncChannel {
    /// URL path suffix for the channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncChannel::Disbursements => "disbursements",
            SyncChannel::Cheques => "cheques",
            SyncChannel::Receipts => "receipts",
            SyncChannel::OverrideTransactions => "override-transactions",
        }
    }
}

impl std::fmt::Display for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept ids as JSON strings or numbers.
pub(crate) fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Accept optional ids as JSON strings, numbers, or null.
pub(crate) fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Direction of a committed transaction.
///
/// Amounts are stored and displayed as absolute values; sign is inferred
/// from the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Collection,
    Disbursement,
    #[serde(rename = "Override-adjusted", alias = "OverrideAdjusted")]
    OverrideAdjusted,
}

/// An immutable financial record once committed. The client only ever
/// holds a cached, possibly stale, read-only copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Absolute value; direction comes from `kind`.
    pub amount: Decimal,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub fund_account_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub issued_by: Option<String>,
}

/// Lifecycle of an override request. `Approved` and `Rejected` are
/// terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl OverrideStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OverrideStatus::Approved | OverrideStatus::Rejected)
    }
}

/// A proposed amendment to an existing transaction.
///
/// Approval never mutates the cached transaction directly; the server
/// applies the change and the client re-reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub transaction_id: String,
    pub reason: String,
    #[serde(default, deserialize_with = "changes::de_changes")]
    pub changes: Changes,
    #[serde(default)]
    pub status: OverrideStatus,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default)]
    pub review_notes: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Embedded snapshot of the referenced transaction, when the backend
    /// includes the relation.
    #[serde(default)]
    pub transaction: Option<Transaction>,
}

/// Reply from `PUT /override_requests/{id}/review`.
///
/// Different backend versions embed the applied amount in different
/// places; `workflow::resolve_applied_amount` handles the cascade.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewResponse {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub applied_transaction_id: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub approved_amount: Option<Decimal>,
    #[serde(default, deserialize_with = "changes::de_changes")]
    pub changes: Changes,
    #[serde(default)]
    pub fund_account: Option<FundAccount>,
    #[serde(default)]
    pub request: Option<OverrideRequest>,
}

/// A payment acknowledgement, created through the normal collection flow
/// or materialized after an approved override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(deserialize_with = "de_id")]
    pub transaction_id: String,
    pub receipt_no: String,
    pub payer_name: String,
    pub amount: Decimal,
    #[serde(default)]
    pub description: Option<String>,
}

/// Cheque status is a reversible toggle, not a one-way transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChequeStatus {
    #[default]
    Issued,
    Cleared,
}

impl ChequeStatus {
    pub fn toggled(&self) -> ChequeStatus {
        match self {
            ChequeStatus::Issued => ChequeStatus::Cleared,
            ChequeStatus::Cleared => ChequeStatus::Issued,
        }
    }
}

/// A disbursement instrument. Never deleted in this flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cheque {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub cheque_number: String,
    pub bank_name: String,
    pub account_number: String,
    pub payee_name: String,
    pub amount: Decimal,
    #[serde(default)]
    pub issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: ChequeStatus,
    #[serde(default)]
    pub reconciled: bool,
}

/// An outgoing payment row referencing its transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disbursement {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub transaction_id: String,
    #[serde(deserialize_with = "de_id")]
    pub fund_account_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A named balance pool disbursements are charged against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundAccount {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    pub current_balance: Decimal,
}

/// Registered payee account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientAccount {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Draft for `POST /transactions/override`.
#[derive(Debug, Clone, Serialize)]
pub struct OverrideDraft {
    pub transaction_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "ChangeSet::is_empty")]
    pub changes: ChangeSet,
}

/// Draft for a new disbursement (transaction + disbursement rows).
#[derive(Debug, Clone)]
pub struct DisbursementDraft {
    pub fund_account_id: String,
    pub recipient: String,
    pub amount: Decimal,
    pub description: Option<String>,
}

/// Draft for cheque issuance.
#[derive(Debug, Clone, Serialize)]
pub struct ChequeDraft {
    pub cheque_number: String,
    pub bank_name: String,
    pub account_number: String,
    pub payee_name: String,
    pub amount: Decimal,
    pub issue_date: Option<NaiveDate>,
}

/// Draft for receipt creation.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptDraft {
    pub transaction_id: String,
    pub receipt_no: String,
    pub payer_name: String,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Generate a unique-ish receipt number: UTC timestamp plus a short
/// random suffix, e.g. `RCT-20250101120000-3fa9`.
pub fn generate_receipt_no(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("RCT-{}-{}", now.format("%Y%m%d%H%M%S"), &suffix[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_accepts_numeric_id() {
        let txn: Transaction = serde_json::from_value(serde_json::json!({
            "id": 42,
            "type": "Disbursement",
            "amount": 1200.5,
            "fund_account_id": 7
        }))
        .unwrap();
        assert_eq!(txn.id, "42");
        assert_eq!(txn.fund_account_id.as_deref(), Some("7"));
        assert_eq!(txn.kind, TransactionKind::Disbursement);
    }

    #[test]
    fn test_override_adjusted_kind_round_trip() {
        let json = serde_json::to_value(TransactionKind::OverrideAdjusted).unwrap();
        assert_eq!(json, serde_json::json!("Override-adjusted"));
        let back: TransactionKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, TransactionKind::OverrideAdjusted);
    }

    #[test]
    fn test_override_status_terminal() {
        assert!(!OverrideStatus::Pending.is_terminal());
        assert!(OverrideStatus::Approved.is_terminal());
        assert!(OverrideStatus::Rejected.is_terminal());
    }

    #[test]
    fn test_cheque_status_toggle_is_reversible() {
        assert_eq!(ChequeStatus::Issued.toggled(), ChequeStatus::Cleared);
        assert_eq!(ChequeStatus::Cleared.toggled(), ChequeStatus::Issued);
    }

    #[test]
    fn test_receipt_no_shape() {
        let now = chrono::Utc::now();
        let no = generate_receipt_no(now);
        assert!(no.starts_with("RCT-"));
        let parts: Vec<&str> = no.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 14);
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn test_family_channel_mapping() {
        assert_eq!(
            EntityFamily::Transactions.sync_channel(),
            SyncChannel::Disbursements
        );
        assert_eq!(
            EntityFamily::OverrideRequests.sync_channel(),
            SyncChannel::OverrideTransactions
        );
        assert_eq!(EntityFamily::Cheques.sync_channel(), SyncChannel::Cheques);
    }
}
