//! Backend client: the REST surface the sync engine consumes.
//!
//! `BackendApi` is the seam: `HttpBackend` talks to the real server,
//! `mock::MockBackend` scripts responses for tests.
//!
//! Retry policy (network-wide): queries retry at most twice on transport
//! errors; mutations never retry automatically.

pub mod http;
pub mod mock;

pub use http::HttpBackend;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::model::{
    Cheque, ChequeDraft, Disbursement, FundAccount, OverrideDraft, OverrideRequest, Receipt,
    ReceiptDraft, ReviewResponse, Transaction,
};

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors surfaced by the backend client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Server-side validation failure (422); field errors flattened into
    /// one joined message. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Any other non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Network/transport failure. Queries retry these transparently.
    #[error("Request failed: {0}")]
    Transport(String),

    /// The response body did not match the expected shape.
    #[error("Response decode failed: {0}")]
    Decode(String),
}

impl ApiError {
    /// Transport errors are the only retryable class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

/// Reviewer decision for an override request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

/// Body for `PUT /override_requests/{id}/review`.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewSubmission {
    pub status: ReviewDecision,
    pub review_notes: String,
}

/// Body for the dedicated balance service,
/// `PUT /fund-accounts/{id}/balance`.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceAdjustment {
    pub amount: Decimal,
    pub operation: BalanceOperation,
    pub source: String,
}

/// Direction of a balance adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceOperation {
    Deduct,
    Credit,
}

/// The REST surface consumed by the engine.
///
/// Collection listings return raw JSON items because they feed the query
/// cache directly; single-entity operations return typed models.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn list_transactions(&self) -> Result<Vec<Value>>;
    async fn fetch_transaction(&self, id: &str) -> Result<Transaction>;
    async fn create_transaction(&self, body: &Value) -> Result<Transaction>;
    /// Compensating void for the disbursement saga.
    async fn void_transaction(&self, id: &str) -> Result<()>;

    async fn create_override_request(&self, draft: &OverrideDraft) -> Result<OverrideRequest>;
    async fn list_override_requests(&self) -> Result<Vec<Value>>;
    async fn my_override_requests(&self) -> Result<Vec<Value>>;
    async fn review_override_request(
        &self,
        id: &str,
        review: &ReviewSubmission,
    ) -> Result<ReviewResponse>;

    async fn list_disbursements(&self) -> Result<Vec<Value>>;
    async fn create_disbursement(&self, body: &Value) -> Result<Disbursement>;

    async fn list_cheques(&self) -> Result<Vec<Value>>;
    async fn create_cheque(&self, draft: &ChequeDraft) -> Result<Cheque>;
    async fn update_cheque(&self, id: &str, patch: &Value) -> Result<Cheque>;

    async fn list_receipts(&self) -> Result<Vec<Value>>;
    async fn create_receipt(&self, draft: &ReceiptDraft) -> Result<Receipt>;
    async fn delete_receipt(&self, id: &str) -> Result<()>;

    async fn list_fund_accounts(&self) -> Result<Vec<Value>>;
    async fn fetch_fund_account(&self, id: &str) -> Result<FundAccount>;
    /// Direct field overwrite, the fallback when the balance service is
    /// unavailable.
    async fn update_fund_account(&self, id: &str, patch: &Value) -> Result<FundAccount>;
    async fn adjust_fund_balance(
        &self,
        id: &str,
        adjustment: &BalanceAdjustment,
    ) -> Result<FundAccount>;

    async fn list_recipient_accounts_active(&self) -> Result<Vec<Value>>;
}

/// Flatten a 422-style field-error map into one joined message.
///
/// Accepts `{ "errors": { field: [msgs] } }` or a bare field map; any
/// other shape falls back to the raw body text.
pub fn flatten_field_errors(body: &Value) -> String {
    let map = body
        .get("errors")
        .and_then(Value::as_object)
        .or_else(|| body.as_object());

    let Some(map) = map else {
        return body.to_string();
    };

    let mut parts: Vec<String> = Vec::new();
    for (field, messages) in map {
        match messages {
            Value::Array(list) => {
                for message in list {
                    if let Some(text) = message.as_str() {
                        parts.push(format!("{field}: {text}"));
                    }
                }
            }
            Value::String(text) => parts.push(format!("{field}: {text}")),
            other => parts.push(format!("{field}: {other}")),
        }
    }

    if parts.is_empty() {
        body.to_string()
    } else {
        parts.join("; ")
    }
}

/// Accept a bare array or a `{ "data": [...] }` envelope.
pub(crate) fn as_collection(body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(ApiError::Decode(
                "expected a JSON array or a data envelope".to_string(),
            )),
        },
        other => Err(ApiError::Decode(format!(
            "expected a JSON array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_field_errors_joins_messages() {
        let body = json!({
            "errors": {
                "amount": ["must be positive"],
                "reason": ["is required", "is too short"]
            }
        });
        let message = flatten_field_errors(&body);
        assert!(message.contains("amount: must be positive"));
        assert!(message.contains("reason: is required"));
        assert!(message.contains("reason: is too short"));
        assert_eq!(message.matches("; ").count(), 2);
    }

    #[test]
    fn test_flatten_field_errors_accepts_bare_map() {
        let body = json!({ "cheque_number": "has already been taken" });
        assert_eq!(
            flatten_field_errors(&body),
            "cheque_number: has already been taken"
        );
    }

    #[test]
    fn test_as_collection_accepts_envelope() {
        let items = as_collection(json!({ "data": [{ "id": 1 }] })).unwrap();
        assert_eq!(items.len(), 1);
        let items = as_collection(json!([{ "id": 1 }, { "id": 2 }])).unwrap();
        assert_eq!(items.len(), 2);
        assert!(as_collection(json!("nope")).is_err());
    }
}
