//! Metrics collection for observability
//!
//! Prometheus counters for the ledger and its side-effect pipeline. Each
//! [`Metrics`] owns its registry, so several ledgers (or tests) can live in one
//! process.
//!
//! # Metrics
//!
//! - `coin_ledger_entries_total` - Ledger rows written
//! - `coin_ledger_spends_total{path}` - Spends by bank path (secure/legacy)
//! - `coin_ledger_credits_total{path}` - Credits by bank path
//! - `coin_ledger_schema_drift_total` - Legacy fallbacks taken
//! - `coin_ledger_unrecorded_mutations_total` - Bank commits with no ledger row
//! - `coin_ledger_side_effects_delivered_total` - Outbox deliveries
//! - `coin_ledger_side_effect_failures_total` - Failed delivery attempts
//! - `coin_ledger_side_effects_dead_total` - Records given up on

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::fmt;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Ledger rows written
    pub entries_total: IntCounter,

    /// Spends by path
    pub spends_total: IntCounterVec,

    /// Credits by path
    pub credits_total: IntCounterVec,

    /// Legacy fallbacks taken
    pub schema_drift_total: IntCounter,

    /// Bank commits whose ledger row could not be written
    pub unrecorded_total: IntCounter,

    /// Side effects delivered
    pub side_effects_delivered: IntCounter,

    /// Side effect delivery failures
    pub side_effect_failures: IntCounter,

    /// Side effects abandoned after max attempts
    pub side_effects_dead: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total =
            IntCounter::new("coin_ledger_entries_total", "Ledger rows written")?;
        registry.register(Box::new(entries_total.clone()))?;

        let spends_total = IntCounterVec::new(
            Opts::new("coin_ledger_spends_total", "Spends by bank path"),
            &["path"],
        )?;
        registry.register(Box::new(spends_total.clone()))?;

        let credits_total = IntCounterVec::new(
            Opts::new("coin_ledger_credits_total", "Credits by bank path"),
            &["path"],
        )?;
        registry.register(Box::new(credits_total.clone()))?;

        let schema_drift_total = IntCounter::new(
            "coin_ledger_schema_drift_total",
            "Legacy fallbacks taken after bank schema drift",
        )?;
        registry.register(Box::new(schema_drift_total.clone()))?;

        let unrecorded_total = IntCounter::new(
            "coin_ledger_unrecorded_mutations_total",
            "Committed bank mutations whose ledger row failed",
        )?;
        registry.register(Box::new(unrecorded_total.clone()))?;

        let side_effects_delivered = IntCounter::new(
            "coin_ledger_side_effects_delivered_total",
            "Outbox records delivered",
        )?;
        registry.register(Box::new(side_effects_delivered.clone()))?;

        let side_effect_failures = IntCounter::new(
            "coin_ledger_side_effect_failures_total",
            "Failed outbox delivery attempts",
        )?;
        registry.register(Box::new(side_effect_failures.clone()))?;

        let side_effects_dead = IntCounter::new(
            "coin_ledger_side_effects_dead_total",
            "Outbox records marked failed after max attempts",
        )?;
        registry.register(Box::new(side_effects_dead.clone()))?;

        Ok(Self {
            entries_total,
            spends_total,
            credits_total,
            schema_drift_total,
            unrecorded_total,
            side_effects_delivered,
            side_effect_failures,
            side_effects_dead,
            registry,
        })
    }

    /// Record a ledger row
    pub fn record_entry(&self) {
        self.entries_total.inc();
    }

    /// Record a spend on a path
    pub fn record_spend(&self, path: &str) {
        self.spends_total.with_label_values(&[path]).inc();
    }

    /// Record a credit on a path
    pub fn record_credit(&self, path: &str) {
        self.credits_total.with_label_values(&[path]).inc();
    }

    /// Record a schema-drift fallback
    pub fn record_schema_drift(&self) {
        self.schema_drift_total.inc();
    }

    /// Record a committed mutation with no ledger row
    pub fn record_unrecorded(&self) {
        self.unrecorded_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_total", &self.entries_total.get())
            .field("schema_drift_total", &self.schema_drift_total.get())
            .finish_non_exhaustive()
    }
}
