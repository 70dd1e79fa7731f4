//! Gift exchange metrics
//!
//! - `gift_exchange_purchases_total` - Completed purchases
//! - `gift_exchange_sends_total` - Completed sends
//! - `gift_exchange_broadcaster_earnings_total` - Coins earned by receivers
//! - `gift_exchange_payouts_pending_total` - Sends whose payout credit failed
//! - `gift_exchange_inventory_failures_total` - Purchases whose inventory write failed
//! - `gift_exchange_transfer_failures_total` - Sends whose transfer rows were lost
//! - `gift_exchange_creator_bonuses_total` - Payouts that carried a creator bonus
//! - `gift_exchange_creator_bonus_coins_total` - Bonus coins paid
//! - `gift_exchange_bonus_log_failures_total` - Bonus log rows that were not written

use prometheus::{IntCounter, Registry};
use std::fmt;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Completed purchases
    pub purchases_total: IntCounter,

    /// Completed sends
    pub sends_total: IntCounter,

    /// Coins earned by receivers
    pub broadcaster_earnings_total: IntCounter,

    /// Payout credits that failed
    pub payouts_pending: IntCounter,

    /// Inventory writes that failed after a spend
    pub inventory_failures: IntCounter,

    /// Transfer rows that could not be written
    pub transfer_failures: IntCounter,

    /// Payouts that carried a creator bonus
    pub creator_bonuses_total: IntCounter,

    /// Bonus coins paid
    pub creator_bonus_coins_total: IntCounter,

    /// Bonus log writes that failed
    pub bonus_log_failures: IntCounter,

    registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        Ok(Self {
            purchases_total: counter("gift_exchange_purchases_total", "Completed purchases")?,
            sends_total: counter("gift_exchange_sends_total", "Completed sends")?,
            broadcaster_earnings_total: counter(
                "gift_exchange_broadcaster_earnings_total",
                "Coins earned by receivers",
            )?,
            payouts_pending: counter(
                "gift_exchange_payouts_pending_total",
                "Sends whose payout credit failed",
            )?,
            inventory_failures: counter(
                "gift_exchange_inventory_failures_total",
                "Purchases whose inventory write failed",
            )?,
            transfer_failures: counter(
                "gift_exchange_transfer_failures_total",
                "Sends whose transfer rows were not written",
            )?,
            creator_bonuses_total: counter(
                "gift_exchange_creator_bonuses_total",
                "Payouts that carried a creator bonus",
            )?,
            creator_bonus_coins_total: counter(
                "gift_exchange_creator_bonus_coins_total",
                "Bonus coins paid to contracted creators",
            )?,
            bonus_log_failures: counter(
                "gift_exchange_bonus_log_failures_total",
                "Bonus log rows that were not written",
            )?,
            registry,
        })
    }

    /// Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("purchases_total", &self.purchases_total.get())
            .field("sends_total", &self.sends_total.get())
            .field("payouts_pending", &self.payouts_pending.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered() {
        let metrics = Metrics::new().unwrap();
        metrics.sends_total.inc();
        metrics.broadcaster_earnings_total.inc_by(70);

        let families = metrics.registry().gather();
        assert_eq!(families.len(), 9);
        assert_eq!(metrics.broadcaster_earnings_total.get(), 70);
    }
}
