//! Realtime sync: server-pushed mutations applied straight to the cache.
//!
//! One shared socket connection per channel, process-wide, with
//! reference-counted subscriptions — the last unsubscribe shuts the
//! channel down. Connection loss triggers exponential-backoff
//! reconnection; after the attempt budget is spent the channel gives up
//! silently (logged, never surfaced to the user).
//!
//! Socket patches, bus events, and local mutation callbacks may race on
//! the same cache entry; all converge because patches are idempotent at
//! entity-id granularity.

pub mod mock;
pub mod transport;

pub use transport::{SocketConnection, SocketTransport, TungsteniteTransport};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::QueryCache;
use crate::config::SocketConfig;
use crate::model::{EntityFamily, SyncChannel};

/// Errors inside the realtime layer. Logged, never user-facing.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Envelope decode failed: {0}")]
    Decode(String),
}

/// Per-channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: the reconnect budget is spent.
    GivenUp,
}

/// Reconnect delay for the given attempt: `min(base * 2^attempt, cap)`.
pub fn reconnect_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let millis = (base.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(cap)
}

/// Server-pushed message envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

struct ChannelEntry {
    refcount: usize,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
}

/// Shared connection manager: one socket per channel, refcounted.
pub struct SyncManager {
    cache: Arc<QueryCache>,
    transport: Arc<dyn SocketTransport>,
    config: SocketConfig,
    token: String,
    channels: Mutex<HashMap<SyncChannel, ChannelEntry>>,
    release_tx: mpsc::UnboundedSender<SyncChannel>,
}

impl SyncManager {
    /// Build a manager over the given transport.
    pub fn new(
        cache: Arc<QueryCache>,
        transport: Arc<dyn SocketTransport>,
        config: SocketConfig,
        token: impl Into<String>,
    ) -> Arc<Self> {
        let (release_tx, mut release_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            cache,
            transport,
            config,
            token: token.into(),
            channels: Mutex::new(HashMap::new()),
            release_tx,
        });

        // Release loop: drops of subscriptions land here.
        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(channel) = release_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.release(channel);
            }
        });

        manager
    }

    /// Subscribe to a channel, opening the shared connection on first
    /// use. Dropping the returned handle releases the reference.
    pub fn subscribe(self: &Arc<Self>, channel: SyncChannel) -> SyncSubscription {
        let mut channels = self.lock_channels();
        let entry = channels
            .entry(channel)
            .or_insert_with(|| self.spawn_channel(channel));
        // A spent channel stays in the map so existing subscribers keep
        // seeing the terminal state; a new subscriber gets a fresh dial
        // with a fresh reconnect budget.
        if *entry.state.borrow() == ChannelState::GivenUp {
            let mut fresh = self.spawn_channel(channel);
            fresh.refcount = entry.refcount;
            let spent = std::mem::replace(entry, fresh);
            spent.task.abort();
            info!(channel = %channel, "Sync channel respawned after give-up");
        }
        entry.refcount += 1;

        debug!(channel = %channel, refcount = entry.refcount, "Sync subscription added");

        SyncSubscription {
            channel,
            state: entry.state.clone(),
            release: self.release_tx.clone(),
        }
    }

    /// Current state of a channel, if open.
    pub fn channel_state(&self, channel: SyncChannel) -> Option<ChannelState> {
        self.lock_channels()
            .get(&channel)
            .map(|entry| *entry.state.borrow())
    }

    fn lock_channels(&self) -> MutexGuard<'_, HashMap<SyncChannel, ChannelEntry>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, channel: SyncChannel) {
        let mut channels = self.lock_channels();
        let Some(entry) = channels.get_mut(&channel) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            let entry = channels.remove(&channel);
            if let Some(entry) = entry {
                let _ = entry.shutdown.send(true);
                entry.task.abort();
                info!(channel = %channel, "Sync channel shut down (last subscriber left)");
            }
        }
    }

    fn spawn_channel(self: &Arc<Self>, channel: SyncChannel) -> ChannelEntry {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        let url = self.channel_url(channel);
        let task = tokio::spawn(run_channel(
            self.cache.clone(),
            self.transport.clone(),
            self.config.clone(),
            channel,
            url,
            state_tx,
            shutdown_rx,
        ));

        ChannelEntry {
            refcount: 0,
            shutdown: shutdown_tx,
            state: state_rx,
            task,
        }
    }

    fn channel_url(&self, channel: SyncChannel) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if self.token.is_empty() {
            format!("{base}/{channel}")
        } else {
            format!("{base}/{channel}?token={}", self.token)
        }
    }
}

/// Refcounted handle to a shared channel.
pub struct SyncSubscription {
    channel: SyncChannel,
    state: watch::Receiver<ChannelState>,
    release: mpsc::UnboundedSender<SyncChannel>,
}

impl SyncSubscription {
    pub fn channel(&self) -> SyncChannel {
        self.channel
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Wait until the channel reaches the given state.
    ///
    /// The underlying `watch` holds only the latest value, so a
    /// transient state that was overwritten before this call cannot be
    /// observed. Callers sequencing transitions must wait for each
    /// intermediate state in turn.
    pub async fn wait_for(&mut self, target: ChannelState) {
        loop {
            if *self.state.borrow_and_update() == target {
                return;
            }
            if self.state.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for SyncSubscription {
    fn drop(&mut self) {
        let _ = self.release.send(self.channel);
    }
}

async fn run_channel(
    cache: Arc<QueryCache>,
    transport: Arc<dyn SocketTransport>,
    config: SocketConfig,
    channel: SyncChannel,
    url: String,
    state_tx: watch::Sender<ChannelState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Reconnect attempts are a lifetime budget for the channel; after
    // the last one the channel is given up for good.
    let mut attempt: u32 = 0;

    loop {
        let _ = state_tx.send(ChannelState::Connecting);

        match transport.connect(&url).await {
            Ok(mut conn) => {
                let _ = state_tx.send(ChannelState::Connected);
                info!(channel = %channel, "Sync channel connected");

                let subscribe = serde_json::json!({
                    "action": "subscribe",
                    "channels": [channel.as_str()],
                })
                .to_string();

                if let Err(e) = conn.send_text(subscribe).await {
                    warn!(channel = %channel, error = %e, "Subscribe message failed");
                } else {
                    message_loop(&cache, channel, conn.as_mut(), &mut shutdown_rx).await;
                    if *shutdown_rx.borrow() {
                        let _ = state_tx.send(ChannelState::Disconnected);
                        return;
                    }
                }
                let _ = state_tx.send(ChannelState::Disconnected);
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Sync channel connect failed");
                let _ = state_tx.send(ChannelState::Disconnected);
            }
        }

        if attempt >= config.max_reconnect_attempts {
            // Silent by design: logged, never surfaced to the user.
            warn!(channel = %channel, attempts = attempt, "Sync channel giving up");
            let _ = state_tx.send(ChannelState::GivenUp);
            return;
        }

        let delay = reconnect_delay(config.reconnect_base(), attempt, config.reconnect_cap());
        attempt += 1;
        debug!(channel = %channel, attempt, delay = ?delay, "Reconnecting after backoff");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn message_loop(
    cache: &QueryCache,
    channel: SyncChannel,
    conn: &mut dyn SocketConnection,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            message = conn.next_text() => match message {
                Some(Ok(text)) => dispatch(cache, channel, &text).await,
                Some(Err(e)) => {
                    warn!(channel = %channel, error = %e, "Sync channel error");
                    return;
                }
                None => {
                    debug!(channel = %channel, "Sync channel closed by server");
                    return;
                }
            }
        }
    }
}

/// Apply one server-pushed envelope to the cache.
async fn dispatch(cache: &QueryCache, channel: SyncChannel, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(channel = %channel, error = %e, "Undecodable sync message");
            return;
        }
    };

    match envelope.kind.as_str() {
        "cheque_cleared" => {
            cache
                .apply_updated(EntityFamily::Cheques, envelope.data)
                .await;
        }
        "override_request_reviewed" => {
            // The server applied the change to the underlying
            // transaction; cached transactions are out of date.
            cache
                .apply_updated(EntityFamily::OverrideRequests, envelope.data)
                .await;
            cache.invalidate_family(EntityFamily::Transactions).await;
        }
        "balance_update" => {
            apply_balance_update(cache, &envelope.data).await;
        }
        kind => {
            let Some((entity, operation)) = kind.rsplit_once('_') else {
                debug!(channel = %channel, kind = %kind, "Ignoring unknown sync message");
                return;
            };
            let Some(family) = family_from_tag(entity) else {
                debug!(channel = %channel, kind = %kind, "Ignoring unknown sync message");
                return;
            };
            match operation {
                "created" => cache.apply_created(family, envelope.data).await,
                "updated" => cache.apply_updated(family, envelope.data).await,
                "deleted" => {
                    let id = envelope.data.get("id").cloned().unwrap_or(envelope.data);
                    cache.apply_deleted(family, &id).await;
                }
                _ => {
                    debug!(channel = %channel, kind = %kind, "Ignoring unknown sync message");
                }
            }
        }
    }
}

async fn apply_balance_update(cache: &QueryCache, data: &Value) {
    let id = data
        .get("account_id")
        .or_else(|| data.get("fund_account_id"))
        .or_else(|| data.get("id"));
    let balance = data
        .get("balance")
        .or_else(|| data.get("current_balance"));

    let (Some(id), Some(balance)) = (id, balance) else {
        warn!("Balance update without account id or balance, ignoring");
        return;
    };

    let mut patch = serde_json::Map::new();
    patch.insert("current_balance".to_string(), balance.clone());
    cache
        .apply_merged(EntityFamily::FundAccounts, id, &patch)
        .await;
}

fn family_from_tag(entity: &str) -> Option<EntityFamily> {
    match entity {
        "transaction" => Some(EntityFamily::Transactions),
        "override_request" => Some(EntityFamily::OverrideRequests),
        "disbursement" => Some(EntityFamily::Disbursements),
        "cheque" => Some(EntityFamily::Cheques),
        "receipt" => Some(EntityFamily::Receipts),
        "fund_account" => Some(EntityFamily::FundAccounts),
        "recipient_account" => Some(EntityFamily::RecipientAccounts),
        _ => None,
    }
}

/// Periodic safety net independent of socket health: invalidate every
/// family root so the next access refetches.
pub fn spawn_reconciler(cache: Arc<QueryCache>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // interval fires immediately; skip the first tick.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("Reconciliation sweep: invalidating all families");
            cache.invalidate_all().await;
        }
    })
}
