//! Side-effect broadcast bus.
//!
//! Notifies sibling sessions of fund side effects (a disbursement
//! reduced fund X by Y) faster than their own server push would. Every
//! publish goes through two redundant mechanisms — a broadcast channel
//! and a storage-slot fallback — to maximize delivery odds, which means
//! subscribers can legitimately see the same event twice. Handlers must
//! be duplicate-tolerant; the stock consumer only invalidates cache
//! families, which is idempotent.
//!
//! No acknowledgement, no delivery guarantee, no cross-session ordering.

pub mod storage;

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::model::EntityFamily;
use storage::StorageSlot;

/// Capacity of the native broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

/// A fund side-effect notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundEvent {
    pub account_id: String,
    #[serde(rename = "type")]
    pub kind: FundEventKind,
    pub amount: Decimal,
    /// Which flow produced the event (e.g. "disbursement-form").
    pub source: String,
    /// New balance when the producer already knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<Decimal>,
    /// Milliseconds since epoch, attached by [`BroadcastBus::broadcast`].
    #[serde(default)]
    pub timestamp: i64,
}

/// Kind of side effect; consumers key off this to pick cache families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundEventKind {
    Disbursement,
    Collection,
    OverrideAdjustment,
}

/// Cache families a consumer should invalidate for an event kind.
pub fn invalidation_targets(kind: FundEventKind) -> &'static [EntityFamily] {
    match kind {
        FundEventKind::Disbursement => &[
            EntityFamily::Disbursements,
            EntityFamily::Transactions,
            EntityFamily::FundAccounts,
        ],
        FundEventKind::Collection => &[
            EntityFamily::Transactions,
            EntityFamily::Receipts,
            EntityFamily::FundAccounts,
        ],
        FundEventKind::OverrideAdjustment => &[
            EntityFamily::Transactions,
            EntityFamily::OverrideRequests,
            EntityFamily::FundAccounts,
        ],
    }
}

/// Handler for bus events.
pub trait FundEventHandler: Send + Sync {
    fn handle(&self, event: FundEvent) -> BoxFuture<'static, ()>;
}

/// The dual-delivery broadcast bus.
pub struct BroadcastBus {
    channel: broadcast::Sender<FundEvent>,
    slot: Arc<StorageSlot>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            channel,
            slot: Arc::new(StorageSlot::new()),
        }
    }

    /// Publish an event through both mechanisms.
    ///
    /// Attaches the current timestamp. Both mechanisms fire on every
    /// call; a subscriber attached to both will see the event twice.
    pub fn broadcast(&self, mut event: FundEvent) {
        event.timestamp = Utc::now().timestamp_millis();

        // Native channel; no receivers is fine.
        let _ = self.channel.send(event.clone());

        // Storage fallback.
        match serde_json::to_string(&event) {
            Ok(payload) => self.slot.write(payload),
            Err(e) => warn!(error = %e, "Fund event did not serialize for storage fallback"),
        }

        debug!(
            account_id = %event.account_id,
            kind = ?event.kind,
            amount = %event.amount,
            "Fund event broadcast"
        );
    }

    /// Raw receiver on the native channel only, for consumers that want
    /// exactly-once-per-publish delivery and can live without the
    /// storage fallback.
    pub fn native_receiver(&self) -> broadcast::Receiver<FundEvent> {
        self.channel.subscribe()
    }

    /// Attach a handler to both delivery mechanisms.
    ///
    /// The returned subscription detaches both listeners when
    /// unsubscribed or dropped.
    pub fn subscribe(&self, handler: Arc<dyn FundEventHandler>) -> Subscription {
        let mut tasks = Vec::with_capacity(2);

        // Native channel listener.
        let mut receiver = self.channel.subscribe();
        let channel_handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => channel_handler.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Bus subscriber lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Storage fallback listener.
        let mut watcher = self.slot.watch();
        tasks.push(tokio::spawn(async move {
            while watcher.changed().await.is_ok() {
                let payload = watcher.borrow_and_update().clone();
                let Some(payload) = payload else {
                    // Slot cleared; nothing to deliver.
                    continue;
                };
                match serde_json::from_str::<FundEvent>(&payload) {
                    Ok(event) => handler.handle(event).await,
                    Err(e) => warn!(error = %e, "Undecodable payload in storage slot"),
                }
            }
        }));

        Subscription { tasks }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for an active bus subscription.
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Detach both listeners.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Stock consumer: invalidates the cache families affected by each
/// event. Safe under duplicate delivery because invalidation is
/// idempotent.
pub struct CacheInvalidator {
    cache: Arc<QueryCache>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        Self { cache }
    }
}

impl FundEventHandler for CacheInvalidator {
    fn handle(&self, event: FundEvent) -> BoxFuture<'static, ()> {
        let cache = self.cache.clone();
        Box::pin(async move {
            for family in invalidation_targets(event.kind) {
                cache.invalidate_family(*family).await;
            }
        })
    }
}

#[cfg(test)]
mod tests;
