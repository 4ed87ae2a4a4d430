use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::*;
use crate::cache::QueryKey;

struct CountingHandler {
    count: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<FundEvent>>>,
}

impl CountingHandler {
    fn new() -> (Arc<Self>, Arc<AtomicUsize>, Arc<Mutex<Option<FundEvent>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(None));
        let handler = Arc::new(Self {
            count: count.clone(),
            last: last.clone(),
        });
        (handler, count, last)
    }
}

impl FundEventHandler for CountingHandler {
    fn handle(&self, event: FundEvent) -> futures::future::BoxFuture<'static, ()> {
        let count = self.count.clone();
        let last = self.last.clone();
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
            *last.lock().await = Some(event);
        })
    }
}

fn disbursement_event(account_id: &str, amount: i64) -> FundEvent {
    FundEvent {
        account_id: account_id.to_string(),
        kind: FundEventKind::Disbursement,
        amount: Decimal::from(amount),
        source: "disbursement-form".to_string(),
        balance: None,
        timestamp: 0,
    }
}

async fn settle() {
    // Both mechanisms deliver within the storage clear window.
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_event_arrives_via_both_mechanisms() {
    let bus = BroadcastBus::new();
    let (handler, count, last) = CountingHandler::new();
    let _subscription = bus.subscribe(handler);

    bus.broadcast(disbursement_event("fund-1", 250));
    settle().await;

    // Channel delivery plus storage fallback: the same event twice.
    assert_eq!(count.load(Ordering::SeqCst), 2);
    let event = last.lock().await.clone().unwrap();
    assert_eq!(event.account_id, "fund-1");
    assert!(event.timestamp > 0, "broadcast must attach a timestamp");
}

#[tokio::test]
async fn test_unsubscribe_detaches_both_listeners() {
    let bus = BroadcastBus::new();
    let (handler, count, _) = CountingHandler::new();
    let subscription = bus.subscribe(handler);

    bus.broadcast(disbursement_event("fund-1", 10));
    settle().await;
    let delivered = count.load(Ordering::SeqCst);
    assert!(delivered > 0);

    subscription.unsubscribe();
    bus.broadcast(disbursement_event("fund-1", 20));
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), delivered);
}

#[tokio::test]
async fn test_repeated_identical_events_still_fire() {
    let bus = BroadcastBus::new();
    let (handler, count, _) = CountingHandler::new();
    let _subscription = bus.subscribe(handler);

    // Same payload twice; the write-then-clear slot must re-notify.
    bus.broadcast(disbursement_event("fund-1", 99));
    settle().await;
    bus.broadcast(disbursement_event("fund-1", 99));
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_cache_invalidator_is_duplicate_tolerant() {
    let cache = Arc::new(QueryCache::new());
    for family in [EntityFamily::Disbursements, EntityFamily::FundAccounts] {
        cache
            .query(QueryKey::root(family), || async {
                Ok::<_, String>(vec![serde_json::json!({ "id": 1 })])
            })
            .await
            .unwrap();
    }

    let bus = BroadcastBus::new();
    let _subscription = bus.subscribe(Arc::new(CacheInvalidator::new(cache.clone())));

    // Dual delivery means the handler runs (at least) twice per publish.
    bus.broadcast(disbursement_event("fund-1", 300));
    settle().await;

    for family in [EntityFamily::Disbursements, EntityFamily::FundAccounts] {
        assert_eq!(cache.is_stale(&QueryKey::root(family)).await, Some(true));
    }
}

#[tokio::test]
async fn test_invalidation_targets_cover_fund_accounts() {
    for kind in [
        FundEventKind::Disbursement,
        FundEventKind::Collection,
        FundEventKind::OverrideAdjustment,
    ] {
        assert!(invalidation_targets(kind).contains(&EntityFamily::FundAccounts));
    }
}

#[tokio::test]
async fn test_storage_slot_write_then_clear() {
    let slot = storage::StorageSlot::new();
    let mut watcher = slot.watch();

    slot.write("payload".to_string());
    watcher.changed().await.unwrap();
    assert_eq!(watcher.borrow_and_update().as_deref(), Some("payload"));

    // The slot clears itself shortly after the write.
    watcher.changed().await.unwrap();
    assert_eq!(*watcher.borrow_and_update(), None);
}
