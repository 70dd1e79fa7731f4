//! Side-effect dispatcher
//!
//! Delivers outbox records to the family, task and war trackers. Runs as a
//! single actor task:
//!
//! ```text
//!  BalanceMutator::credit ──wake()──┐
//!                                   ▼
//!                      mpsc mailbox (bounded)
//!                                   │
//!              ┌────────────────────┴───────────────────┐
//!              │ DispatcherActor                         │
//!              │  wake / drain / poll tick → drain_due() │
//!              └────────────────────┬───────────────────┘
//!                                   ▼
//!          OutboxStore::due() → sink → OutboxStore::update()
//! ```
//!
//! Delivery is at least once. A failed attempt is rescheduled with
//! exponential backoff; after `max_attempts` the record is parked as
//! `Failed` and kept for audit. Nothing here reports back to the credit that
//! produced the record.

use crate::{
    config::DispatcherConfig,
    metrics::Metrics,
    outbox::{OutboxRecord, OutboxStatus, SideEffect},
    store::OutboxStore,
    types::{FamilyId, UserId},
    Error, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Tracker failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl From<&str> for SinkError {
    fn from(msg: &str) -> Self {
        SinkError(msg.to_string())
    }
}

/// Result type for tracker calls
pub type SinkResult<T = ()> = std::result::Result<T, SinkError>;

/// Family statistics tracker
#[async_trait]
pub trait FamilySink: Send + Sync {
    /// Family the user currently belongs to
    async fn family_of(&self, user_id: &UserId) -> SinkResult<Option<FamilyId>>;

    /// Add coins to a family's shared statistics
    async fn add_contribution(
        &self,
        family_id: &FamilyId,
        user_id: &UserId,
        coins: u64,
    ) -> SinkResult;
}

/// Weekly task progress tracker
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Report coins earned
    async fn coins_earned(&self, user_id: &UserId, coins: u64) -> SinkResult;
}

/// Family war progress tracker
#[async_trait]
pub trait WarSink: Send + Sync {
    /// Report coins earned
    async fn coins_earned(&self, user_id: &UserId, coins: u64) -> SinkResult;
}

/// The trackers a dispatcher delivers to
#[derive(Clone)]
pub struct Sinks {
    /// Family statistics
    pub family: Arc<dyn FamilySink>,
    /// Task progress
    pub tasks: Arc<dyn TaskSink>,
    /// War progress
    pub wars: Arc<dyn WarSink>,
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

impl Sinks {
    /// Use one tracker for all three roles
    pub fn all<S>(sink: Arc<S>) -> Self
    where
        S: FamilySink + TaskSink + WarSink + 'static,
    {
        Self {
            family: sink.clone(),
            tasks: sink.clone(),
            wars: sink,
        }
    }

    async fn deliver(&self, effect: &SideEffect) -> SinkResult {
        match effect {
            SideEffect::FamilyContribution {
                user_id,
                contribution,
                ..
            } => match self.family.family_of(user_id).await? {
                Some(family_id) => {
                    self.family
                        .add_contribution(&family_id, user_id, *contribution)
                        .await
                }
                None => {
                    debug!(user_id = %user_id, "No family; contribution skipped");
                    Ok(())
                }
            },
            SideEffect::TaskProgress { user_id, coins } => {
                self.tasks.coins_earned(user_id, *coins).await
            }
            SideEffect::WarProgress { user_id, coins } => {
                self.wars.coins_earned(user_id, *coins).await
            }
        }
    }
}

/// Trackers that only log, for servers without real trackers wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl FamilySink for TracingSink {
    async fn family_of(&self, _user_id: &UserId) -> SinkResult<Option<FamilyId>> {
        Ok(None)
    }

    async fn add_contribution(
        &self,
        family_id: &FamilyId,
        user_id: &UserId,
        coins: u64,
    ) -> SinkResult {
        info!(family_id = %family_id, user_id = %user_id, coins, "Family contribution");
        Ok(())
    }
}

#[async_trait]
impl TaskSink for TracingSink {
    async fn coins_earned(&self, user_id: &UserId, coins: u64) -> SinkResult {
        info!(user_id = %user_id, coins, "Task progress");
        Ok(())
    }
}

#[async_trait]
impl WarSink for TracingSink {
    async fn coins_earned(&self, user_id: &UserId, coins: u64) -> SinkResult {
        info!(user_id = %user_id, coins, "War progress");
        Ok(())
    }
}

/// Outcome of one drain
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Records delivered
    pub delivered: usize,
    /// Records rescheduled
    pub retried: usize,
    /// Records parked as failed
    pub failed: usize,
}

enum DispatcherMessage {
    Wake,
    Drain {
        response: oneshot::Sender<Result<DrainReport>>,
    },
    Shutdown,
}

struct DispatcherActor {
    outbox: Arc<dyn OutboxStore>,
    sinks: Sinks,
    config: DispatcherConfig,
    metrics: Metrics,
    mailbox: mpsc::Receiver<DispatcherMessage>,
}

impl DispatcherActor {
    async fn run(mut self) {
        let period = Duration::from_millis(self.config.poll_interval_ms);
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(DispatcherMessage::Wake) => {
                        if let Err(e) = self.drain_due().await {
                            warn!(error = %e, "Outbox drain failed");
                        }
                    }
                    Some(DispatcherMessage::Drain { response }) => {
                        let _ = response.send(self.drain_due().await);
                    }
                    Some(DispatcherMessage::Shutdown) | None => break,
                },

                _ = timer.tick() => {
                    if let Err(e) = self.drain_due().await {
                        warn!(error = %e, "Outbox drain on tick failed");
                    }
                }
            }
        }

        debug!("Dispatcher stopped");
    }

    async fn drain_due(&mut self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let due = self.outbox.due(Utc::now(), self.config.batch_size)?;

        for mut record in due {
            record.attempts += 1;

            match self.sinks.deliver(&record.effect).await {
                Ok(()) => {
                    record.status = OutboxStatus::Delivered;
                    record.delivered_at = Some(Utc::now());
                    record.last_error = None;
                    self.metrics.side_effects_delivered.inc();
                    report.delivered += 1;
                }
                Err(e) => {
                    self.metrics.side_effect_failures.inc();
                    record.last_error = Some(e.0.clone());

                    if record.attempts >= self.config.max_attempts {
                        record.status = OutboxStatus::Failed;
                        self.metrics.side_effects_dead.inc();
                        report.failed += 1;
                        warn!(
                            record_id = %record.id,
                            effect = record.effect.label(),
                            user_id = %record.effect.user_id(),
                            attempts = record.attempts,
                            error = %e,
                            "Side effect abandoned"
                        );
                    } else {
                        let delay = self.retry_delay(record.attempts);
                        record.next_attempt_at = Utc::now()
                            + chrono::Duration::milliseconds(delay.as_millis() as i64);
                        report.retried += 1;
                        warn!(
                            record_id = %record.id,
                            effect = record.effect.label(),
                            attempts = record.attempts,
                            retry_in = ?delay,
                            error = %e,
                            "Side effect delivery failed, retrying"
                        );
                    }
                }
            }

            self.outbox.update(&record)?;
        }

        if report != DrainReport::default() {
            debug!(?report, "Outbox drained");
        }

        Ok(report)
    }

    /// Exponential backoff: initial, 2x, 4x, ... capped at the maximum
    fn retry_delay(&self, attempts: u32) -> Duration {
        let initial = self.config.initial_retry_delay_ms;
        let factor = 1u64.checked_shl(attempts.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(
            initial
                .saturating_mul(factor)
                .min(self.config.max_retry_delay_ms),
        )
    }
}

/// Handle for the dispatcher actor
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<DispatcherMessage>,
}

impl DispatcherHandle {
    /// Ask for a drain without waiting; a full mailbox already has one queued
    pub fn wake(&self) {
        if let Err(mpsc::error::TrySendError::Closed(_)) =
            self.sender.try_send(DispatcherMessage::Wake)
        {
            debug!("Dispatcher not running; records stay in the outbox");
        }
    }

    /// Drain due records now and report the outcome
    pub async fn drain(&self) -> Result<DrainReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DispatcherMessage::Drain { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Dispatcher mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(DispatcherMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Dispatcher mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the dispatcher actor
pub fn spawn_dispatcher(
    outbox: Arc<dyn OutboxStore>,
    sinks: Sinks,
    config: DispatcherConfig,
    metrics: Metrics,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let actor = DispatcherActor {
        outbox,
        sinks,
        config,
        metrics,
        mailbox: rx,
    };

    let task = tokio::spawn(actor.run());
    (DispatcherHandle { sender: tx }, task)
}

/// Records still waiting for delivery
pub fn pending_records(outbox: &dyn OutboxStore) -> Result<Vec<OutboxRecord>> {
    Ok(outbox
        .records()?
        .into_iter()
        .filter(|r| r.status == OutboxStatus::Pending)
        .collect())
}
