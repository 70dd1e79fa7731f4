//! Composition root
//!
//! [`CoinLedger`] owns every long-lived piece of the ledger: storage,
//! recorder, balance cache (and its poller), mutator and side-effect
//! dispatcher. The bank and the trackers are injected.
//!
//! # Example
//!
//! ```no_run
//! use coin_ledger::{CoinLedger, Config, Session, SimulatedBank, Sinks, TracingSink};
//! use coin_ledger::{CreditRequest, TransactionType, UserId};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> coin_ledger::Result<()> {
//!     let ledger = CoinLedger::open(
//!         Config::default(),
//!         Arc::new(SimulatedBank::new()),
//!         Sinks::all(Arc::new(TracingSink)),
//!     )
//!     .await?;
//!
//!     let alice = UserId::new("alice");
//!     ledger
//!         .credit(
//!             &Session::service(),
//!             CreditRequest::new(alice, 500, TransactionType::AdminGrant),
//!         )
//!         .await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    bank::Bank,
    cache::{BalanceCache, CachePoller},
    dispatcher::{spawn_dispatcher, DispatcherHandle, Sinks},
    memory::MemoryStore,
    metrics::Metrics,
    mutator::{BalanceMutator, CreditOutcome, CreditRequest, SpendOutcome, SpendRequest},
    recorder::{HistoryQuery, LedgerRecorder},
    store::{LedgerStore, OutboxStore},
    types::{LedgerEntry, Session, UserId},
    Config, Error, Result, Storage,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::info;

/// Running coin ledger
pub struct CoinLedger {
    config: Config,
    storage: Option<Arc<Storage>>,
    bank: Arc<dyn Bank>,
    recorder: Arc<LedgerRecorder>,
    mutator: Arc<BalanceMutator>,
    cache: Arc<BalanceCache>,
    outbox: Arc<dyn OutboxStore>,
    dispatcher: DispatcherHandle,
    dispatcher_task: JoinHandle<()>,
    poller: Option<CachePoller>,
    metrics: Metrics,
}

impl std::fmt::Debug for CoinLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinLedger")
            .field("service_name", &self.config.service_name)
            .field("persistent", &self.storage.is_some())
            .field("poller", &self.poller.is_some())
            .finish_non_exhaustive()
    }
}

impl CoinLedger {
    /// Open with RocksDB storage under `config.data_dir`
    pub async fn open(config: Config, bank: Arc<dyn Bank>, sinks: Sinks) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(Storage::open(&config)?);
        info!(data_dir = %config.data_dir.display(), "Ledger storage opened");

        Self::assemble(
            config,
            Some(storage.clone()),
            storage.clone(),
            storage,
            bank,
            sinks,
        )
    }

    /// Run without a data directory
    pub async fn in_memory(config: Config, bank: Arc<dyn Bank>, sinks: Sinks) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MemoryStore::new());
        Self::assemble(config, None, store.clone(), store, bank, sinks)
    }

    fn assemble(
        config: Config,
        storage: Option<Arc<Storage>>,
        ledger_store: Arc<dyn LedgerStore>,
        outbox: Arc<dyn OutboxStore>,
        bank: Arc<dyn Bank>,
        sinks: Sinks,
    ) -> Result<Self> {
        let metrics = Metrics::new()?;
        let recorder = Arc::new(LedgerRecorder::new(ledger_store, metrics.clone()));
        let cache = Arc::new(BalanceCache::new(config.cache.channel_capacity));

        let (dispatcher, dispatcher_task) = spawn_dispatcher(
            outbox.clone(),
            sinks,
            config.dispatcher.clone(),
            metrics.clone(),
        );

        let mutator = Arc::new(
            BalanceMutator::new(
                bank.clone(),
                recorder.clone(),
                outbox.clone(),
                cache.clone(),
                config.economy.family_share,
                metrics.clone(),
            )
            .with_dispatcher(dispatcher.clone()),
        );

        let poller = config.cache.poller_enabled.then(|| {
            cache.start_poller(
                bank.clone(),
                Duration::from_millis(config.cache.refresh_interval_ms),
            )
        });

        info!(
            service = %config.service_name,
            version = %config.service_version,
            "Coin ledger started"
        );

        Ok(Self {
            config,
            storage,
            bank,
            recorder,
            mutator,
            cache,
            outbox,
            dispatcher,
            dispatcher_task,
            poller,
            metrics,
        })
    }

    /// Spend coins
    pub async fn spend(&self, session: &Session, request: SpendRequest) -> Result<SpendOutcome> {
        self.mutator.spend(session, request).await
    }

    /// Credit coins
    pub async fn credit(&self, session: &Session, request: CreditRequest) -> Result<CreditOutcome> {
        self.mutator.credit(session, request).await
    }

    /// Transaction history, newest first
    pub fn history(&self, user_id: &UserId, query: &HistoryQuery) -> Result<Vec<LedgerEntry>> {
        self.recorder.history(user_id, query)
    }

    /// Shared mutator, for engines built on top of the ledger
    pub fn mutator(&self) -> Arc<BalanceMutator> {
        self.mutator.clone()
    }

    /// Recorder
    pub fn recorder(&self) -> &LedgerRecorder {
        &self.recorder
    }

    /// Balance cache
    pub fn cache(&self) -> Arc<BalanceCache> {
        self.cache.clone()
    }

    /// Bank
    pub fn bank(&self) -> Arc<dyn Bank> {
        self.bank.clone()
    }

    /// RocksDB storage, when opened on disk
    pub fn storage(&self) -> Option<Arc<Storage>> {
        self.storage.clone()
    }

    /// Outbox
    pub fn outbox(&self) -> &dyn OutboxStore {
        self.outbox.as_ref()
    }

    /// Dispatcher handle
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the poller and the dispatcher
    pub async fn shutdown(self) -> Result<()> {
        if let Some(poller) = self.poller {
            poller.stop().await?;
        }

        self.dispatcher.shutdown().await?;
        self.dispatcher_task
            .await
            .map_err(|e| Error::Concurrency(format!("Dispatcher task failed: {}", e)))?;

        info!("Coin ledger stopped");
        Ok(())
    }
}
