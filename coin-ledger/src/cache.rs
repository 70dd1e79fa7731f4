//! Balance cache service
//!
//! Advisory per-user balance snapshots for display layers. Snapshots are
//! updated after confirmed bank responses (projections) or by re-reading the
//! bank (refresh), and every change is broadcast to subscribers.
//!
//! Nothing in this crate reads the cache to decide whether a mutation is
//! allowed; the bank is the only guard.
//!
//! The optional poller is an actor that refreshes every tracked user on a
//! timer until it is stopped.

use crate::{
    bank::Bank,
    types::{CoinBalance, CoinType, UserId},
    Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

/// Where a snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceOrigin {
    /// Fresh bank read
    Bank,
    /// Derived from a confirmed mutation response
    Projection,
}

/// Cached balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Fungible troll coins
    pub troll_coins: u64,
    /// Trollmonds
    pub trollmonds: u64,
    /// Origin of the latest change
    pub origin: BalanceOrigin,
    /// Time of the latest change
    pub updated_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    fn from_bank(balance: &CoinBalance) -> Self {
        Self {
            troll_coins: balance.troll_coins(),
            trollmonds: balance.trollmonds,
            origin: BalanceOrigin::Bank,
            updated_at: Utc::now(),
        }
    }

    /// Balance of a coin type
    pub fn of(&self, coin_type: CoinType) -> u64 {
        match coin_type {
            CoinType::TrollCoins => self.troll_coins,
            CoinType::Trollmonds => self.trollmonds,
        }
    }
}

/// Broadcast payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdate {
    /// User whose balance changed
    pub user_id: UserId,
    /// New snapshot
    pub snapshot: BalanceSnapshot,
}

/// Injectable balance cache
#[derive(Debug)]
pub struct BalanceCache {
    snapshots: DashMap<UserId, BalanceSnapshot>,
    tracked: DashSet<UserId>,
    updates: broadcast::Sender<BalanceUpdate>,
}

impl BalanceCache {
    /// Create cache with a subscriber channel of `capacity`
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            snapshots: DashMap::new(),
            tracked: DashSet::new(),
            updates,
        }
    }

    /// Current snapshot
    pub fn get(&self, user_id: &UserId) -> Option<BalanceSnapshot> {
        self.snapshots.get(user_id).map(|s| *s)
    }

    /// Record a balance confirmed by a bank response
    pub fn project(&self, user_id: &UserId, coin_type: CoinType, balance: u64) -> BalanceSnapshot {
        let snapshot = {
            let mut entry = self
                .snapshots
                .entry(user_id.clone())
                .or_insert_with(|| BalanceSnapshot {
                    troll_coins: 0,
                    trollmonds: 0,
                    origin: BalanceOrigin::Projection,
                    updated_at: Utc::now(),
                });

            match coin_type {
                CoinType::TrollCoins => entry.troll_coins = balance,
                CoinType::Trollmonds => entry.trollmonds = balance,
            }
            entry.origin = BalanceOrigin::Projection;
            entry.updated_at = Utc::now();
            *entry
        };

        debug!(user_id = %user_id, %coin_type, balance, "Projected balance");
        self.publish(user_id, snapshot);
        snapshot
    }

    /// Re-read a user's balance from the bank
    pub async fn refresh(&self, bank: &dyn Bank, user_id: &UserId) -> Result<BalanceSnapshot> {
        let balance = bank.balance(user_id).await.map_err(Error::from)?;
        let snapshot = BalanceSnapshot::from_bank(&balance);
        self.snapshots.insert(user_id.clone(), snapshot);
        self.publish(user_id, snapshot);
        Ok(snapshot)
    }

    /// Include a user in periodic refreshes
    pub fn track(&self, user_id: UserId) {
        self.tracked.insert(user_id);
    }

    /// Stop refreshing a user and drop their snapshot
    pub fn untrack(&self, user_id: &UserId) {
        self.tracked.remove(user_id);
        self.snapshots.remove(user_id);
    }

    /// Users refreshed by the poller
    pub fn tracked(&self) -> Vec<UserId> {
        self.tracked.iter().map(|u| u.key().clone()).collect()
    }

    /// Receive every snapshot change
    pub fn subscribe(&self) -> broadcast::Receiver<BalanceUpdate> {
        self.updates.subscribe()
    }

    /// Refresh every tracked user; returns how many succeeded
    pub async fn refresh_tracked(&self, bank: &dyn Bank) -> usize {
        let mut refreshed = 0;
        for user_id in self.tracked() {
            match self.refresh(bank, &user_id).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(user_id = %user_id, error = %e, "Balance refresh failed"),
            }
        }
        refreshed
    }

    /// Start refreshing tracked users every `period`
    pub fn start_poller(self: &Arc<Self>, bank: Arc<dyn Bank>, period: Duration) -> CachePoller {
        let (sender, mailbox) = mpsc::channel(16);
        let actor = PollerActor {
            cache: self.clone(),
            bank,
            mailbox,
            period,
        };
        let task = tokio::spawn(actor.run());
        CachePoller { sender, task }
    }

    fn publish(&self, user_id: &UserId, snapshot: BalanceSnapshot) {
        // No subscribers is fine
        let _ = self.updates.send(BalanceUpdate {
            user_id: user_id.clone(),
            snapshot,
        });
    }
}

enum PollerMessage {
    RefreshNow {
        response: oneshot::Sender<usize>,
    },
    Stop,
}

struct PollerActor {
    cache: Arc<BalanceCache>,
    bank: Arc<dyn Bank>,
    mailbox: mpsc::Receiver<PollerMessage>,
    period: Duration,
}

impl PollerActor {
    async fn run(mut self) {
        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(PollerMessage::RefreshNow { response }) => {
                        let refreshed = self.cache.refresh_tracked(self.bank.as_ref()).await;
                        let _ = response.send(refreshed);
                    }
                    Some(PollerMessage::Stop) | None => break,
                },

                _ = timer.tick() => {
                    let refreshed = self.cache.refresh_tracked(self.bank.as_ref()).await;
                    debug!(refreshed, "Balance poller tick");
                }
            }
        }

        debug!("Balance poller stopped");
    }
}

/// Running refresh poller
#[derive(Debug)]
pub struct CachePoller {
    sender: mpsc::Sender<PollerMessage>,
    task: JoinHandle<()>,
}

impl CachePoller {
    /// Refresh tracked users immediately
    pub async fn refresh_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerMessage::RefreshNow { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Poller mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Stop the poller and wait for it to exit
    pub async fn stop(self) -> Result<()> {
        // A closed mailbox means the actor already exited
        let _ = self.sender.send(PollerMessage::Stop).await;
        self.task
            .await
            .map_err(|e| Error::Concurrency(format!("Poller task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBank;
    use crate::types::Bucket;

    #[test]
    fn test_project_updates_one_coin_type() {
        let cache = BalanceCache::new(8);
        let alice = UserId::new("alice");

        cache.project(&alice, CoinType::TrollCoins, 100);
        let snapshot = cache.project(&alice, CoinType::Trollmonds, 7);

        assert_eq!(snapshot.troll_coins, 100);
        assert_eq!(snapshot.trollmonds, 7);
        assert_eq!(snapshot.origin, BalanceOrigin::Projection);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let cache = BalanceCache::new(8);
        let mut updates = cache.subscribe();
        let alice = UserId::new("alice");

        cache.project(&alice, CoinType::TrollCoins, 42);

        let update = updates.recv().await.unwrap();
        assert_eq!(update.user_id, alice);
        assert_eq!(update.snapshot.troll_coins, 42);
    }

    #[tokio::test]
    async fn test_refresh_reads_bank() {
        let cache = BalanceCache::new(8);
        let bank = SimulatedBank::new();
        let alice = UserId::new("alice");
        bank.deposit(&alice, Bucket::Gifted, 30);
        cache.project(&alice, CoinType::TrollCoins, 999);

        let snapshot = cache.refresh(&bank, &alice).await.unwrap();
        assert_eq!(snapshot.troll_coins, 30);
        assert_eq!(snapshot.origin, BalanceOrigin::Bank);
    }

    #[tokio::test]
    async fn test_poller_lifecycle() {
        let cache = Arc::new(BalanceCache::new(8));
        let bank = Arc::new(SimulatedBank::new());
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        bank.deposit(&alice, Bucket::Paid, 5);
        cache.track(alice.clone());
        cache.track(bob.clone());

        let poller = cache.start_poller(bank.clone(), Duration::from_secs(3600));
        assert_eq!(poller.refresh_now().await.unwrap(), 2);
        assert_eq!(cache.get(&alice).unwrap().troll_coins, 5);

        cache.untrack(&bob);
        assert!(cache.get(&bob).is_none());
        assert_eq!(cache.tracked(), vec![alice]);

        poller.stop().await.unwrap();
    }
}
