use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;

use super::*;
use crate::api::mock::MockBackend;
use crate::cache::QueryKey;
use crate::model::{ChangeSet, Changes, Transaction, TransactionKind};

fn txn(id: &str, amount: i64) -> Transaction {
    Transaction {
        id: id.to_string(),
        kind: TransactionKind::Collection,
        amount: Decimal::from(amount),
        recipient: None,
        fund_account_id: Some("fund-1".to_string()),
        created_at: None,
        issued_by: None,
    }
}

fn pending_request(id: &str, transaction_id: &str, changes: Changes) -> OverrideRequest {
    OverrideRequest {
        id: id.to_string(),
        transaction_id: transaction_id.to_string(),
        reason: "typo in amount".to_string(),
        changes,
        status: OverrideStatus::Pending,
        requested_by: None,
        reviewed_by: None,
        review_notes: None,
        created_at: None,
        reviewed_at: None,
        transaction: None,
    }
}

fn amount_changes(amount: i64) -> Changes {
    Changes::Fields(ChangeSet {
        amount: Some(Decimal::from(amount)),
        description: None,
    })
}

fn workflow_with(policy: OverridePolicy) -> (Arc<MockBackend>, Arc<QueryCache>, OverrideWorkflow) {
    let backend = Arc::new(MockBackend::new());
    let cache = Arc::new(QueryCache::new());
    let workflow = OverrideWorkflow::new(backend.clone(), cache.clone(), policy);
    (backend, cache, workflow)
}

fn workflow() -> (Arc<MockBackend>, Arc<QueryCache>, OverrideWorkflow) {
    workflow_with(OverridePolicy::default())
}

async fn seed_transactions(cache: &QueryCache, items: Vec<serde_json::Value>) {
    cache
        .query(QueryKey::root(EntityFamily::Transactions), || async {
            Ok::<_, String>(items)
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_submit_creates_request_and_invalidates_family() {
    let (backend, cache, workflow) = workflow();
    backend.seed_transaction(txn("txn-1", 500));
    let key = QueryKey::root(EntityFamily::OverrideRequests);
    cache
        .query(key.clone(), || async { Ok::<_, String>(vec![]) })
        .await
        .unwrap();

    let request = workflow
        .submit(OverrideDraft {
            transaction_id: "txn-1".to_string(),
            reason: "recipient misspelled".to_string(),
            changes: ChangeSet {
                amount: Some(Decimal::from(450)),
                description: None,
            },
        })
        .await
        .unwrap();

    assert_eq!(request.status, OverrideStatus::Pending);
    // Mutation rule: the family root is stale, never patched in place.
    assert_eq!(cache.is_stale(&key).await, Some(true));
}

#[tokio::test]
async fn test_submit_requires_reason() {
    let (_backend, _cache, workflow) = workflow();
    let result = workflow
        .submit(OverrideDraft {
            transaction_id: "txn-1".to_string(),
            reason: "   ".to_string(),
            changes: ChangeSet::default(),
        })
        .await;
    assert!(matches!(result, Err(WorkflowError::Validation(_))));
}

#[tokio::test]
async fn test_submit_rejects_missing_transaction() {
    let (_backend, _cache, workflow) = workflow();
    let result = workflow
        .submit(OverrideDraft {
            transaction_id: "txn-missing".to_string(),
            reason: "valid reason".to_string(),
            changes: ChangeSet::default(),
        })
        .await;
    assert!(matches!(result, Err(WorkflowError::Api(_))));
}

#[tokio::test]
async fn test_empty_changes_follow_policy() {
    // Default policy: an empty change-set is a legitimate
    // "flag for re-review" request.
    let (backend, _cache, workflow) = workflow();
    backend.seed_transaction(txn("txn-1", 500));
    let draft = OverrideDraft {
        transaction_id: "txn-1".to_string(),
        reason: "needs a second look".to_string(),
        changes: ChangeSet::default(),
    };
    let request = workflow.submit(draft.clone()).await.unwrap();
    assert!(request.changes.is_empty());

    // Strict policy refuses it client-side.
    let (backend, _cache, strict) = workflow_with(OverridePolicy {
        allow_empty_changes: false,
    });
    backend.seed_transaction(txn("txn-1", 500));
    assert!(matches!(
        strict.submit(draft).await,
        Err(WorkflowError::Validation(_))
    ));
}

#[tokio::test]
async fn test_review_refuses_terminal_request_without_api_call() {
    let (backend, _cache, workflow) = workflow();
    let mut request = pending_request("ovr-1", "txn-1", Changes::Empty);
    request.status = OverrideStatus::Approved;

    let result = workflow
        .review(&request, ReviewDecision::Rejected, "changed my mind")
        .await;

    assert!(matches!(result, Err(WorkflowError::AlreadyReviewed(_))));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_review_requires_notes() {
    let (backend, _cache, workflow) = workflow();
    let request = pending_request("ovr-1", "txn-1", Changes::Empty);
    let result = workflow.review(&request, ReviewDecision::Approved, "").await;
    assert!(matches!(result, Err(WorkflowError::Validation(_))));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_rejection_creates_no_receipt() {
    let (backend, cache, workflow) = workflow();
    seed_transactions(&cache, vec![json!({ "id": "txn-1", "amount": "500" })]).await;
    backend.seed_override_request(pending_request("ovr-1", "txn-1", amount_changes(450)));
    let request = pending_request("ovr-1", "txn-1", amount_changes(450));

    let outcome = workflow
        .review(&request, ReviewDecision::Rejected, "not justified")
        .await
        .unwrap();

    assert_eq!(outcome.request.status, OverrideStatus::Rejected);
    assert!(outcome.receipt.is_none());
    assert!(!outcome.needs_manual_receipt);
    assert!(backend.receipts_created().is_empty());

    // Even a rejection may leave server state the client cannot see.
    assert_eq!(
        cache
            .is_stale(&QueryKey::root(EntityFamily::Transactions))
            .await,
        Some(true)
    );
}

#[tokio::test]
async fn test_server_amended_amount_wins_over_proposal() {
    // The reviewer approves a different amount than was requested; the
    // receipt must document what the server applied, not the proposal.
    let (backend, _cache, workflow) = workflow();
    backend.seed_override_request(pending_request("ovr-1", "txn-1", amount_changes(450)));
    backend.push_review_response(ReviewResponse {
        changes: amount_changes(900),
        ..ReviewResponse::default()
    });

    let request = pending_request("ovr-1", "txn-1", amount_changes(450));
    let outcome = workflow
        .review(&request, ReviewDecision::Approved, "approved at the higher figure")
        .await
        .unwrap();

    assert_eq!(outcome.receipt.unwrap().amount, Decimal::from(900));
}

#[tokio::test]
async fn test_approval_materializes_receipt_from_applied_changes() {
    let (backend, cache, workflow) = workflow();
    seed_transactions(&cache, vec![json!({ "id": "txn-1", "amount": "500" })]).await;
    backend.seed_override_request(pending_request("ovr-1", "txn-1", amount_changes(450)));
    let request = pending_request("ovr-1", "txn-1", amount_changes(450));

    let outcome = workflow
        .review(&request, ReviewDecision::Approved, "approved per policy")
        .await
        .unwrap();

    let receipt = outcome.receipt.unwrap();
    assert_eq!(receipt.amount, Decimal::from(450));
    assert_eq!(receipt.transaction_id, "txn-1");
    assert!(receipt.receipt_no.starts_with("RCT-"));
    assert!(!outcome.needs_manual_receipt);

    // Cached transactions are invalidated, never patched in place.
    assert_eq!(
        cache
            .is_stale(&QueryKey::root(EntityFamily::Transactions))
            .await,
        Some(true)
    );
}

#[tokio::test]
async fn test_receipt_issued_at_most_once_per_request() {
    let (backend, cache, workflow) = workflow();
    seed_transactions(&cache, vec![json!({ "id": "txn-1", "amount": "500" })]).await;
    backend.seed_override_request(pending_request("ovr-1", "txn-1", amount_changes(450)));

    // Both calls use a stale pending snapshot, as a double-submitting
    // reviewer would.
    let request = pending_request("ovr-1", "txn-1", amount_changes(450));
    let first = workflow
        .review(&request, ReviewDecision::Approved, "approved")
        .await
        .unwrap();
    let second = workflow
        .review(&request, ReviewDecision::Approved, "approved again")
        .await
        .unwrap();

    assert!(first.receipt.is_some());
    assert!(second.receipt.is_none());
    assert!(!second.needs_manual_receipt);
    assert_eq!(backend.receipts_created().len(), 1);
}

#[tokio::test]
async fn test_amount_falls_back_to_review_response() {
    let (backend, _cache, workflow) = workflow();
    backend.seed_override_request(pending_request("ovr-1", "txn-1", Changes::Empty));
    backend.push_review_response(ReviewResponse {
        amount: Some(Decimal::from(321)),
        ..ReviewResponse::default()
    });

    let request = pending_request("ovr-1", "txn-1", Changes::Empty);
    let outcome = workflow
        .review(&request, ReviewDecision::Approved, "ok")
        .await
        .unwrap();

    assert_eq!(outcome.receipt.unwrap().amount, Decimal::from(321));
}

#[tokio::test]
async fn test_amount_falls_back_to_cached_transaction() {
    let (backend, cache, workflow) = workflow();
    seed_transactions(&cache, vec![json!({ "id": "txn-1", "amount": "275.25" })]).await;
    backend.seed_override_request(pending_request("ovr-1", "txn-1", Changes::Empty));

    let request = pending_request("ovr-1", "txn-1", Changes::Empty);
    let outcome = workflow
        .review(&request, ReviewDecision::Approved, "ok")
        .await
        .unwrap();

    let receipt = outcome.receipt.unwrap();
    assert_eq!(receipt.amount.to_string(), "275.25");
    // The cached copy sufficed; no re-fetch happened.
    assert!(!backend.calls().contains(&"fetch_transaction".to_string()));
}

#[tokio::test]
async fn test_amount_falls_back_to_fresh_fetch() {
    let (backend, _cache, workflow) = workflow();
    backend.seed_transaction(txn("txn-1", 888));
    backend.seed_override_request(pending_request("ovr-1", "txn-1", Changes::Empty));

    let request = pending_request("ovr-1", "txn-1", Changes::Empty);
    let outcome = workflow
        .review(&request, ReviewDecision::Approved, "ok")
        .await
        .unwrap();

    assert_eq!(outcome.receipt.unwrap().amount, Decimal::from(888));
    assert!(backend.calls().contains(&"fetch_transaction".to_string()));
}

#[tokio::test]
async fn test_amount_falls_back_to_embedded_snapshot() {
    let (backend, _cache, workflow) = workflow();
    backend.fail_fetch_transaction(true);
    backend.seed_override_request(pending_request("ovr-1", "txn-1", Changes::Empty));

    let mut request = pending_request("ovr-1", "txn-1", Changes::Empty);
    request.transaction = Some(txn("txn-1", 99));

    let outcome = workflow
        .review(&request, ReviewDecision::Approved, "ok")
        .await
        .unwrap();

    assert_eq!(outcome.receipt.unwrap().amount, Decimal::from(99));
}

#[tokio::test]
async fn test_unresolvable_amount_flags_manual_receipt() {
    let (backend, _cache, workflow) = workflow();
    backend.fail_fetch_transaction(true);
    backend.seed_override_request(pending_request("ovr-1", "txn-1", Changes::Empty));

    let request = pending_request("ovr-1", "txn-1", Changes::Empty);
    let outcome = workflow
        .review(&request, ReviewDecision::Approved, "ok")
        .await
        .unwrap();

    // The approval itself stands; only the receipt is left to a human.
    assert_eq!(outcome.request.status, OverrideStatus::Approved);
    assert!(outcome.receipt.is_none());
    assert!(outcome.needs_manual_receipt);
    assert!(backend.receipts_created().is_empty());
}

#[tokio::test]
async fn test_receipt_payer_uses_fund_name_from_response() {
    let (backend, _cache, workflow) = workflow();
    backend.seed_override_request(pending_request("ovr-1", "txn-1", amount_changes(10)));
    backend.push_review_response(ReviewResponse {
        amount: Some(Decimal::from(10)),
        fund_account: Some(crate::model::FundAccount {
            id: "fund-1".to_string(),
            name: "Water Fund".to_string(),
            current_balance: Decimal::from(1000),
        }),
        ..ReviewResponse::default()
    });

    let request = pending_request("ovr-1", "txn-1", amount_changes(10));
    let outcome = workflow
        .review(&request, ReviewDecision::Approved, "ok")
        .await
        .unwrap();

    assert_eq!(outcome.receipt.unwrap().payer_name, "Water Fund");
}

#[tokio::test]
async fn test_receipt_payer_defaults_to_placeholder() {
    let (backend, _cache, workflow) = workflow();
    backend.seed_override_request(pending_request("ovr-1", "txn-1", amount_changes(10)));

    let request = pending_request("ovr-1", "txn-1", amount_changes(10));
    let outcome = workflow
        .review(&request, ReviewDecision::Approved, "ok")
        .await
        .unwrap();

    assert_eq!(outcome.receipt.unwrap().payer_name, "General Fund");
}
