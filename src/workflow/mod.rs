//! Override-request workflow: submission and review.
//!
//! Committed transactions are immutable on the client; the only path to
//! amendment is an override request that a reviewer approves or rejects.
//! Approval is applied server-side — the client never edits the cached
//! transaction, it re-reads after invalidation.
//!
//! After an approval the client materializes a paper receipt for the
//! adjustment. Backends disagree about where the applied amount lives in
//! the review reply, so the amount is resolved through a fallback
//! cascade; when every source comes up empty the outcome is flagged for
//! manual receipt entry instead of failing the approval.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::api::{ApiError, BackendApi, ReviewDecision, ReviewSubmission};
use crate::cache::QueryCache;
use crate::config::OverridePolicy;
use crate::model::{
    generate_receipt_no, EntityFamily, OverrideDraft, OverrideRequest, OverrideStatus, Receipt,
    ReceiptDraft, ReviewResponse,
};
use crate::validate::{require_non_empty, ValidationError};

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors from the override workflow.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Approved and rejected are terminal; re-review is refused before
    /// any request is sent.
    #[error("Override request {0} has already been reviewed")]
    AlreadyReviewed(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Result of a review call.
#[derive(Debug)]
pub struct ReviewOutcome {
    /// The request as the server now sees it.
    pub request: OverrideRequest,
    /// Receipt materialized for an approved adjustment, if any.
    pub receipt: Option<Receipt>,
    /// Approval went through but no applied amount could be resolved
    /// anywhere; a receipt must be entered by hand.
    pub needs_manual_receipt: bool,
}

/// Submission and review of override requests.
pub struct OverrideWorkflow {
    api: Arc<dyn BackendApi>,
    cache: Arc<QueryCache>,
    policy: OverridePolicy,
    /// Request ids a receipt was already materialized for. Guards
    /// against double-issuance when a review is retried.
    receipted: Mutex<HashSet<String>>,
}

impl OverrideWorkflow {
    pub fn new(api: Arc<dyn BackendApi>, cache: Arc<QueryCache>, policy: OverridePolicy) -> Self {
        Self {
            api,
            cache,
            policy,
            receipted: Mutex::new(HashSet::new()),
        }
    }

    /// Submit an override request against an existing transaction.
    ///
    /// An empty change-set means "flag for re-review with no concrete
    /// change"; whether that is accepted is a policy knob.
    pub async fn submit(&self, draft: OverrideDraft) -> Result<OverrideRequest> {
        require_non_empty("Reason", &draft.reason)?;

        if draft.changes.is_empty() && !self.policy.allow_empty_changes {
            return Err(ValidationError(
                "Override request must include at least one change".to_string(),
            )
            .into());
        }

        // The referenced transaction must exist; a cached copy is
        // enough, otherwise ask the server.
        let cached = self
            .cache
            .lookup(
                EntityFamily::Transactions,
                &serde_json::Value::String(draft.transaction_id.clone()),
            )
            .await;
        if cached.is_none() {
            self.api.fetch_transaction(&draft.transaction_id).await?;
        }

        let request = self.api.create_override_request(&draft).await?;
        info!(
            request_id = %request.id,
            transaction_id = %request.transaction_id,
            "Override request submitted"
        );

        // Mutation rule: invalidate the family root, never patch.
        self.cache
            .invalidate_family(EntityFamily::OverrideRequests)
            .await;

        Ok(request)
    }

    /// Review a pending request.
    ///
    /// On approval the server applies the amendment; the cached
    /// transactions are invalidated rather than patched, and a receipt
    /// is materialized for the adjustment (at most once per request).
    pub async fn review(
        &self,
        request: &OverrideRequest,
        decision: ReviewDecision,
        notes: &str,
    ) -> Result<ReviewOutcome> {
        if request.status.is_terminal() {
            return Err(WorkflowError::AlreadyReviewed(request.id.clone()));
        }
        require_non_empty("Review notes", notes)?;

        let response = self
            .api
            .review_override_request(
                &request.id,
                &ReviewSubmission {
                    status: decision,
                    review_notes: notes.to_string(),
                },
            )
            .await?;

        let updated = self.updated_request(request, &response, decision, notes);
        self.cache
            .invalidate_family(EntityFamily::OverrideRequests)
            .await;
        // The underlying transaction was rewritten server-side.
        self.cache
            .invalidate_family(EntityFamily::Transactions)
            .await;

        if decision == ReviewDecision::Rejected {
            info!(request_id = %request.id, "Override request rejected");
            return Ok(ReviewOutcome {
                request: updated,
                receipt: None,
                needs_manual_receipt: false,
            });
        }

        self.cache
            .invalidate_family(EntityFamily::FundAccounts)
            .await;

        let (receipt, needs_manual_receipt) = self.materialize_receipt(request, &response).await;
        info!(
            request_id = %request.id,
            receipt = receipt.as_ref().map(|r| r.receipt_no.as_str()),
            "Override request approved"
        );

        Ok(ReviewOutcome {
            request: updated,
            receipt,
            needs_manual_receipt,
        })
    }

    fn updated_request(
        &self,
        request: &OverrideRequest,
        response: &ReviewResponse,
        decision: ReviewDecision,
        notes: &str,
    ) -> OverrideRequest {
        if let Some(echoed) = &response.request {
            return echoed.clone();
        }
        let mut updated = request.clone();
        updated.status = match decision {
            ReviewDecision::Approved => OverrideStatus::Approved,
            ReviewDecision::Rejected => OverrideStatus::Rejected,
        };
        updated.review_notes = Some(notes.to_string());
        updated.reviewed_at = Some(Utc::now());
        updated
    }

    /// Materialize the adjustment receipt, at most once per request.
    ///
    /// Returns `(receipt, needs_manual_receipt)`.
    async fn materialize_receipt(
        &self,
        request: &OverrideRequest,
        response: &ReviewResponse,
    ) -> (Option<Receipt>, bool) {
        {
            let mut receipted = self.lock_receipted();
            if !receipted.insert(request.id.clone()) {
                return (None, false);
            }
        }

        let Some(amount) = self.resolve_applied_amount(request, response).await else {
            warn!(
                request_id = %request.id,
                "No applied amount resolvable, receipt needs manual entry"
            );
            self.forget_receipt(&request.id);
            return (None, true);
        };

        let payer_name = self.resolve_fund_name(request, response).await;
        let transaction_id = response
            .applied_transaction_id
            .clone()
            .unwrap_or_else(|| request.transaction_id.clone());

        let draft = ReceiptDraft {
            transaction_id,
            receipt_no: generate_receipt_no(Utc::now()),
            payer_name,
            amount,
            description: Some(format!(
                "Adjustment for transaction {}",
                request.transaction_id
            )),
        };

        match self.api.create_receipt(&draft).await {
            Ok(receipt) => {
                self.cache.invalidate_family(EntityFamily::Receipts).await;
                (Some(receipt), false)
            }
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "Receipt creation failed");
                self.forget_receipt(&request.id);
                (None, true)
            }
        }
    }

    /// Amount cascade: the review reply first (its `changes`, then its
    /// top-level amount fields), then the cached transaction, then a
    /// fresh fetch, then the embedded snapshot. The request's own
    /// proposal is never consulted: the server may approve a different
    /// amount than was asked for.
    async fn resolve_applied_amount(
        &self,
        request: &OverrideRequest,
        response: &ReviewResponse,
    ) -> Option<Decimal> {
        if let Some(amount) = response.changes.amount() {
            return Some(amount);
        }
        if let Some(amount) = response.amount.or(response.approved_amount) {
            return Some(amount);
        }

        let id = serde_json::Value::String(request.transaction_id.clone());
        if let Some(cached) = self.cache.lookup(EntityFamily::Transactions, &id).await {
            if let Some(amount) = decode_amount(cached.get("amount")) {
                return Some(amount);
            }
        }

        match self.api.fetch_transaction(&request.transaction_id).await {
            Ok(txn) => return Some(txn.amount),
            Err(e) => {
                warn!(
                    transaction_id = %request.transaction_id,
                    error = %e,
                    "Transaction re-fetch failed while resolving applied amount"
                );
            }
        }

        request.transaction.as_ref().map(|txn| txn.amount)
    }

    /// Fund name for the receipt's payer line: embedded in the reply,
    /// else fetched, else a placeholder.
    async fn resolve_fund_name(
        &self,
        request: &OverrideRequest,
        response: &ReviewResponse,
    ) -> String {
        if let Some(fund) = &response.fund_account {
            return fund.name.clone();
        }

        let fund_id = response
            .request
            .as_ref()
            .and_then(|r| r.transaction.as_ref())
            .or(request.transaction.as_ref())
            .and_then(|txn| txn.fund_account_id.clone());

        if let Some(fund_id) = fund_id {
            if let Ok(fund) = self.api.fetch_fund_account(&fund_id).await {
                return fund.name;
            }
        }

        "General Fund".to_string()
    }

    fn lock_receipted(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.receipted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn forget_receipt(&self, request_id: &str) {
        self.lock_receipted().remove(request_id);
    }
}

fn decode_amount(value: Option<&serde_json::Value>) -> Option<Decimal> {
    serde_json::from_value(value?.clone()).ok()
}

#[cfg(test)]
mod tests;
