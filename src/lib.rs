//! fundsync: the client-side sync engine for a municipal treasury
//! backend.
//!
//! The engine keeps a read-through query cache with no time-based
//! expiry (entries refresh only on explicit invalidation or a realtime
//! patch), maintains shared websocket channels that patch the cache as
//! the server pushes mutations, and runs the mutation flows the
//! treasury needs: the override-request approval workflow and the
//! disbursement saga with its compensating void.
//!
//! [`Engine`] wires the pieces together; each module is usable on its
//! own.

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod ledger;
pub mod model;
pub mod realtime;
pub mod telemetry;
pub mod validate;
pub mod workflow;

use std::sync::Arc;

use tokio::task::JoinHandle;

use api::{ApiError, BackendApi, HttpBackend};
use bus::{BroadcastBus, CacheInvalidator, Subscription};
use cache::QueryCache;
use config::Config;
use ledger::Ledger;
use realtime::{SocketTransport, SyncManager, TungsteniteTransport};
use workflow::OverrideWorkflow;

/// The assembled sync engine.
pub struct Engine {
    pub cache: Arc<QueryCache>,
    pub bus: Arc<BroadcastBus>,
    pub sync: Arc<SyncManager>,
    pub workflow: OverrideWorkflow,
    pub ledger: Ledger,
    reconciler: Option<JoinHandle<()>>,
    _invalidator: Subscription,
}

impl Engine {
    /// Assemble the engine against the real backend.
    pub fn new(config: Config) -> Result<Self, ApiError> {
        let api: Arc<dyn BackendApi> = Arc::new(HttpBackend::new(&config.api)?);
        Ok(Self::with_parts(api, Arc::new(TungsteniteTransport), config))
    }

    /// Assemble the engine from explicit parts; tests inject mocks here.
    pub fn with_parts(
        api: Arc<dyn BackendApi>,
        transport: Arc<dyn SocketTransport>,
        config: Config,
    ) -> Self {
        let cache = Arc::new(QueryCache::new());
        let bus = Arc::new(BroadcastBus::new());

        let invalidator = bus.subscribe(Arc::new(CacheInvalidator::new(cache.clone())));

        let sync = SyncManager::new(
            cache.clone(),
            transport,
            config.socket.clone(),
            config.api.token.clone(),
        );

        let workflow = OverrideWorkflow::new(
            api.clone(),
            cache.clone(),
            config.override_policy.clone(),
        );
        let ledger = Ledger::new(api, cache.clone(), bus.clone());

        let reconciler = config
            .cache
            .reconcile_interval()
            .map(|interval| realtime::spawn_reconciler(cache.clone(), interval));

        Self {
            cache,
            bus,
            sync,
            workflow,
            ledger,
            reconciler,
            _invalidator: invalidator,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.reconciler.take() {
            task.abort();
        }
    }
}
