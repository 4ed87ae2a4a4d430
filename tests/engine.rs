//! End-to-end exercises of the assembled engine against the in-memory
//! backend and socket transport.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::json;

use fundsync::api::mock::MockBackend;
use fundsync::api::{BackendApi, ReviewDecision};
use fundsync::cache::QueryKey;
use fundsync::config::Config;
use fundsync::model::{
    ChangeSet, DisbursementDraft, EntityFamily, FundAccount, OverrideDraft, SyncChannel,
    Transaction, TransactionKind,
};
use fundsync::realtime::mock::MockTransport;
use fundsync::realtime::ChannelState;
use fundsync::Engine;

fn engine() -> (Arc<MockBackend>, Arc<MockTransport>, Engine) {
    let backend = Arc::new(MockBackend::new());
    let transport = MockTransport::new();
    let engine = Engine::with_parts(backend.clone(), transport.clone(), Config::default());
    (backend, transport, engine)
}

fn seed_books(backend: &MockBackend) {
    backend.seed_fund_account(FundAccount {
        id: "fund-1".to_string(),
        name: "Roads Fund".to_string(),
        current_balance: Decimal::from(10_000),
    });
    backend.seed_transaction(Transaction {
        id: "txn-1".to_string(),
        kind: TransactionKind::Collection,
        amount: Decimal::from(500),
        recipient: Some("J. Smith".to_string()),
        fund_account_id: Some("fund-1".to_string()),
        created_at: None,
        issued_by: None,
    });
}

#[tokio::test]
async fn test_disbursement_then_cache_refetch_sees_new_balance() {
    let (backend, _transport, engine) = engine();
    seed_books(&backend);

    // Prime the fund-accounts cache.
    let api = backend.clone();
    let key = QueryKey::root(EntityFamily::FundAccounts);
    engine
        .cache
        .query(key.clone(), || async move { api.list_fund_accounts().await })
        .await
        .unwrap();

    engine
        .ledger
        .disburse(DisbursementDraft {
            fund_account_id: "fund-1".to_string(),
            recipient: "Acme Paving Ltd".to_string(),
            amount: Decimal::from(2_500),
            description: None,
        })
        .await
        .unwrap();

    // The saga invalidated the cached accounts; the next read-through
    // fetch sees the deducted balance.
    assert_eq!(engine.cache.is_stale(&key).await, Some(true));
    let api = backend.clone();
    let accounts = engine
        .cache
        .query(key, || async move { api.list_fund_accounts().await })
        .await
        .unwrap();
    assert_eq!(accounts[0]["current_balance"], json!("7500"));
}

#[tokio::test]
async fn test_override_lifecycle_submit_approve_receipt() {
    let (backend, _transport, engine) = engine();
    seed_books(&backend);

    let request = engine
        .workflow
        .submit(OverrideDraft {
            transaction_id: "txn-1".to_string(),
            reason: "amount keyed wrong".to_string(),
            changes: ChangeSet {
                amount: Some(Decimal::from(450)),
                description: None,
            },
        })
        .await
        .unwrap();

    let outcome = engine
        .workflow
        .review(&request, ReviewDecision::Approved, "verified against paper")
        .await
        .unwrap();

    let receipt = outcome.receipt.expect("approval materializes a receipt");
    assert_eq!(receipt.amount, Decimal::from(450));
    assert_eq!(backend.receipts_created().len(), 1);

    // Re-review of the now-terminal request is refused locally.
    let err = engine
        .workflow
        .review(&outcome.request, ReviewDecision::Rejected, "oops")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already been reviewed"));
}

#[tokio::test(start_paused = true)]
async fn test_socket_patch_flows_into_cache() {
    let (backend, transport, engine) = engine();
    seed_books(&backend);

    let api = backend.clone();
    let key = QueryKey::root(EntityFamily::Transactions);
    engine
        .cache
        .query(key.clone(), || async move { api.list_transactions().await })
        .await
        .unwrap();

    let mut subscription = engine.sync.subscribe(SyncChannel::Disbursements);
    subscription.wait_for(ChannelState::Connected).await;

    transport.latest_server().unwrap().push(
        json!({
            "type": "transaction_updated",
            "data": { "id": "txn-1", "amount": "475", "type": "Collection" },
        })
        .to_string(),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cached = engine.cache.get(&key).await.unwrap();
    assert_eq!(cached[0]["amount"], json!("475"));
}

#[tokio::test]
async fn test_bus_event_invalidates_cache_via_stock_consumer() {
    let (backend, _transport, engine) = engine();
    seed_books(&backend);

    let api = backend.clone();
    let key = QueryKey::root(EntityFamily::FundAccounts);
    engine
        .cache
        .query(key.clone(), || async move { api.list_fund_accounts().await })
        .await
        .unwrap();

    engine.bus.broadcast(fundsync::bus::FundEvent {
        account_id: "fund-1".to_string(),
        kind: fundsync::bus::FundEventKind::Disbursement,
        amount: Decimal::from(100),
        source: "another-session".to_string(),
        balance: None,
        timestamp: 0,
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(engine.cache.is_stale(&key).await, Some(true));
}
