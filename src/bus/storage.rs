//! Shared storage slot: the fallback delivery mechanism of the bus.
//!
//! Contract: `write` publishes a payload and then asynchronously clears
//! the slot, so repeated writes of an identical payload still notify
//! watchers. Watchers must treat a cleared (`None`) observation as "no
//! event" — delivery through this mechanism is best-effort and
//! at-most-once per write.

use std::time::Duration;

use tokio::sync::watch;

/// Delay before a written payload is cleared.
const CLEAR_AFTER: Duration = Duration::from_millis(50);

/// A single shared slot with write-then-clear semantics.
pub struct StorageSlot {
    tx: watch::Sender<Option<String>>,
}

impl StorageSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish a payload, then clear the slot shortly after.
    pub fn write(&self, payload: String) {
        // Ignore errors: no watchers is fine.
        let _ = self.tx.send(Some(payload));

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CLEAR_AFTER).await;
            let _ = tx.send(None);
        });
    }

    /// Watch the slot. Receivers observe `Some(payload)` on writes and
    /// `None` on clears.
    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

impl Default for StorageSlot {
    fn default() -> Self {
        Self::new()
    }
}
