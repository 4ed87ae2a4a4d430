//! Read-through query cache keyed by entity family + filter.
//!
//! Staleness is infinite by design: an entry is never considered stale
//! by time, only by explicit invalidation or a realtime patch. Mutations
//! invalidate their family root on success and never touch the cache on
//! failure (no optimistic update, no rollback).
//!
//! Consumers only ever receive `Arc` snapshots; the cache is the single
//! owner of its store.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::model::EntityFamily;

/// Capacity of the cache-event broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Fetch failed for {key}: {message}")]
    Fetch { key: String, message: String },

    #[error("Cached data for {key} did not decode: {message}")]
    Decode { key: String, message: String },
}

/// Structural cache key: family + canonical filter JSON.
///
/// serde_json objects serialize with sorted keys, so deep-equal filters
/// built in different field orders produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    family: EntityFamily,
    filter: String,
}

impl QueryKey {
    /// Key for the unfiltered collection.
    pub fn root(family: EntityFamily) -> Self {
        Self {
            family,
            filter: String::new(),
        }
    }

    /// Key for a filtered view. A null or empty filter maps to the root.
    pub fn new<F: Serialize>(family: EntityFamily, filter: &F) -> Self {
        let filter = match serde_json::to_value(filter) {
            Ok(Value::Null) => String::new(),
            Ok(Value::Object(map)) if map.is_empty() => String::new(),
            Ok(value) => value.to_string(),
            Err(e) => {
                warn!(family = %family, error = %e, "Unserializable filter, using root key");
                String::new()
            }
        };
        Self { family, filter }
    }

    pub fn family(&self) -> EntityFamily {
        self.family
    }

    fn matches(&self, prefix: &KeyPrefix) -> bool {
        self.family == prefix.family && self.filter.starts_with(&prefix.filter_prefix)
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.filter.is_empty() {
            write!(f, "{}", self.family)
        } else {
            write!(f, "{}:{}", self.family, self.filter)
        }
    }
}

/// Invalidation prefix: a family root, or a family plus a partial filter.
#[derive(Debug, Clone)]
pub struct KeyPrefix {
    family: EntityFamily,
    filter_prefix: String,
}

impl KeyPrefix {
    /// Prefix covering every entry of a family.
    pub fn family(family: EntityFamily) -> Self {
        Self {
            family,
            filter_prefix: String::new(),
        }
    }

    /// Prefix covering entries whose canonical filter starts with `prefix`.
    pub fn with_filter(family: EntityFamily, prefix: impl Into<String>) -> Self {
        Self {
            family,
            filter_prefix: prefix.into(),
        }
    }
}

/// Notification emitted on cache changes.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub family: EntityFamily,
    pub kind: CacheEventKind,
}

/// What happened to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    /// A fetch completed and stored fresh data.
    Loaded,
    /// A realtime or local patch modified cached data in place.
    Patched,
    /// Entries were marked for refetch.
    Invalidated,
}

#[derive(Clone)]
struct CacheEntry {
    data: Arc<Vec<Value>>,
    stale: bool,
    fetched_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// The shared query cache.
pub struct QueryCache {
    entries: RwLock<HashMap<QueryKey, CacheEntry>>,
    events: broadcast::Sender<CacheEvent>,
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to cache change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Read-through access.
    ///
    /// Returns the cached snapshot when present and not invalidated;
    /// otherwise runs the fetcher, stores the result, and notifies
    /// subscribers. A failed fetch surfaces the error and leaves any
    /// previous entry untouched.
    pub async fn query<F, Fut, E>(&self, key: QueryKey, fetcher: F) -> Result<Arc<Vec<Value>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<Value>, E>>,
        E: Display,
    {
        // Check under read lock, release before the fetch await.
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&key) {
                if !entry.stale {
                    return Ok(entry.data.clone());
                }
            }
        }

        debug!(key = %key, "Cache miss, fetching");
        let data = fetcher().await.map_err(|e| CacheError::Fetch {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        let data = Arc::new(data);
        let now = Utc::now();
        {
            let mut entries = self.entries.write().await;
            entries.insert(
                key.clone(),
                CacheEntry {
                    data: data.clone(),
                    stale: false,
                    fetched_at: now,
                    updated_at: now,
                },
            );
        }
        self.notify(key.family(), CacheEventKind::Loaded);

        Ok(data)
    }

    /// Snapshot of a fresh entry, if present.
    pub async fn get(&self, key: &QueryKey) -> Option<Arc<Vec<Value>>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| !e.stale)
            .map(|e| e.data.clone())
    }

    /// Find an item by id anywhere in a family, stale entries included.
    ///
    /// Used by fallback chains that prefer any cached copy over a
    /// network round trip.
    pub async fn lookup(&self, family: EntityFamily, id: &Value) -> Option<Value> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(key, _)| key.family() == family)
            .flat_map(|(_, entry)| entry.data.iter())
            .find(|item| matches_id(item, id))
            .cloned()
    }

    /// Mark every entry under the prefix for refetch on next access.
    pub async fn invalidate(&self, prefix: &KeyPrefix) {
        let mut touched = false;
        {
            let mut entries = self.entries.write().await;
            for (key, entry) in entries.iter_mut() {
                if key.matches(prefix) && !entry.stale {
                    entry.stale = true;
                    touched = true;
                }
            }
        }
        if touched {
            debug!(family = %prefix.family, "Cache invalidated");
            self.notify(prefix.family, CacheEventKind::Invalidated);
        }
    }

    /// Invalidate a whole family.
    pub async fn invalidate_family(&self, family: EntityFamily) {
        self.invalidate(&KeyPrefix::family(family)).await;
    }

    /// Invalidate every family (reconciliation sweep).
    pub async fn invalidate_all(&self) {
        for family in EntityFamily::all() {
            self.invalidate_family(*family).await;
        }
    }

    /// Synchronously patch one entry without a network round trip.
    ///
    /// Returns false when the entry does not exist (patching an uncached
    /// list is a no-op until the next full fetch).
    pub async fn set_data<F>(&self, key: &QueryKey, updater: F) -> bool
    where
        F: FnOnce(&[Value]) -> Vec<Value>,
    {
        let patched = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.data = Arc::new(updater(&entry.data));
                    entry.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        };
        if patched {
            self.notify(key.family(), CacheEventKind::Patched);
        }
        patched
    }

    /// Apply a `*_created` event: prepend to every cached list of the
    /// family that does not already contain the id; seed the family root
    /// when the family is entirely uncached.
    ///
    /// Idempotent: a duplicate delivery of the same item is skipped and
    /// emits no event.
    pub async fn apply_created(&self, family: EntityFamily, item: Value) {
        let id = item.get("id").cloned();
        let mut touched = false;
        {
            let mut entries = self.entries.write().await;
            let mut seen_family = false;
            for (key, entry) in entries.iter_mut() {
                if key.family() != family {
                    continue;
                }
                seen_family = true;
                let duplicate = id
                    .as_ref()
                    .map(|id| entry.data.iter().any(|existing| matches_id(existing, id)))
                    .unwrap_or(false);
                if duplicate {
                    continue;
                }
                let mut data = Vec::with_capacity(entry.data.len() + 1);
                data.push(item.clone());
                data.extend(entry.data.iter().cloned());
                entry.data = Arc::new(data);
                entry.updated_at = Utc::now();
                touched = true;
            }
            if !seen_family {
                let now = Utc::now();
                entries.insert(
                    QueryKey::root(family),
                    CacheEntry {
                        data: Arc::new(vec![item]),
                        stale: false,
                        fetched_at: now,
                        updated_at: now,
                    },
                );
                touched = true;
            }
        }
        if touched {
            self.notify(family, CacheEventKind::Patched);
        }
    }

    /// Apply a `*_updated` event: replace the matching item in place in
    /// every cached list. No-op for lists without the id and for an
    /// uncached family. Applying the same event twice yields the same
    /// state as applying it once.
    pub async fn apply_updated(&self, family: EntityFamily, item: Value) {
        let Some(id) = item.get("id").cloned() else {
            warn!(family = %family, "Update event without id, ignoring");
            return;
        };
        let mut touched = false;
        {
            let mut entries = self.entries.write().await;
            for (key, entry) in entries.iter_mut() {
                if key.family() != family {
                    continue;
                }
                if entry.data.iter().any(|existing| matches_id(existing, &id)) {
                    let data = entry
                        .data
                        .iter()
                        .map(|existing| {
                            if matches_id(existing, &id) {
                                item.clone()
                            } else {
                                existing.clone()
                            }
                        })
                        .collect();
                    entry.data = Arc::new(data);
                    entry.updated_at = Utc::now();
                    touched = true;
                }
            }
        }
        if touched {
            self.notify(family, CacheEventKind::Patched);
        }
    }

    /// Apply a `*_deleted` event: remove the matching item by id.
    pub async fn apply_deleted(&self, family: EntityFamily, id: &Value) {
        let mut touched = false;
        {
            let mut entries = self.entries.write().await;
            for (key, entry) in entries.iter_mut() {
                if key.family() != family {
                    continue;
                }
                if entry.data.iter().any(|existing| matches_id(existing, id)) {
                    let data = entry
                        .data
                        .iter()
                        .filter(|existing| !matches_id(existing, id))
                        .cloned()
                        .collect();
                    entry.data = Arc::new(data);
                    entry.updated_at = Utc::now();
                    touched = true;
                }
            }
        }
        if touched {
            self.notify(family, CacheEventKind::Patched);
        }
    }

    /// Merge fields into the matching item (targeted patch, e.g. a
    /// pushed balance update).
    pub async fn apply_merged(
        &self,
        family: EntityFamily,
        id: &Value,
        patch: &serde_json::Map<String, Value>,
    ) {
        let mut touched = false;
        {
            let mut entries = self.entries.write().await;
            for (key, entry) in entries.iter_mut() {
                if key.family() != family {
                    continue;
                }
                if entry.data.iter().any(|existing| matches_id(existing, id)) {
                    let data = entry
                        .data
                        .iter()
                        .map(|existing| {
                            if matches_id(existing, id) {
                                merge_fields(existing, patch)
                            } else {
                                existing.clone()
                            }
                        })
                        .collect();
                    entry.data = Arc::new(data);
                    entry.updated_at = Utc::now();
                    touched = true;
                }
            }
        }
        if touched {
            self.notify(family, CacheEventKind::Patched);
        }
    }

    /// Whether an entry exists and is marked stale. Test/diagnostic hook.
    pub async fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        let entries = self.entries.read().await;
        entries.get(key).map(|e| e.stale)
    }

    /// Timestamps of an entry, when present.
    pub async fn entry_times(&self, key: &QueryKey) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let entries = self.entries.read().await;
        entries.get(key).map(|e| (e.fetched_at, e.updated_at))
    }

    fn notify(&self, family: EntityFamily, kind: CacheEventKind) {
        // Ignore send errors: no subscribers is fine.
        let _ = self.events.send(CacheEvent { family, kind });
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Lenient id equality: string `"7"` matches number `7`.
fn id_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s == &n.to_string()
        }
        _ => false,
    }
}

fn matches_id(item: &Value, id: &Value) -> bool {
    item.get("id").map(|item_id| id_eq(item_id, id)).unwrap_or(false)
}

fn merge_fields(item: &Value, patch: &serde_json::Map<String, Value>) -> Value {
    let mut merged = item.clone();
    if let Value::Object(map) = &mut merged {
        for (field, value) in patch {
            map.insert(field.clone(), value.clone());
        }
    }
    merged
}
