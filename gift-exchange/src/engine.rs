//! Gift exchange engine
//!
//! Purchases turn coins into inventory through the balance mutator; sends
//! move inventory from sender to receiver and pay the receiver their share.
//!
//! A sent unit goes Owned → In-Transit (inventory decremented, transfer rows
//! written) → Delivered (receiver credited). Nothing past In-Transit is rolled
//! back: a failed payout is reported as [`PayoutStatus::Pending`] and repaired
//! operationally.
//!
//! Receivers under a creator contract get [`CreatorBonus`] on top of their
//! earnings, paid in the same credit.

use crate::{
    bonus::{BonusLog, ContractedCreators, CreatorDirectory},
    catalog::GiftCatalog,
    config::{Config, InventoryFailurePolicy},
    metrics::Metrics,
    store::{InventoryStore, MemoryGiftStore, RocksGiftStore, TransferStore},
    types::{
        CreatorBonus, CreatorBonusRecord, GiftTransferRecord, InventoryRecord, PayoutStatus,
        PurchaseOutcome, RevenueSplit, SendOutcome, SendRequest, TransferDirection,
    },
    Error, Result,
};
use chrono::Utc;
use coin_ledger::{
    BalanceMutator, CoinLedger, CreditRequest, Metadata, Session, SpendRequest, TransactionType,
    UserId,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Gift exchange
pub struct GiftExchange {
    config: Config,
    catalog: Arc<GiftCatalog>,
    mutator: Arc<BalanceMutator>,
    inventory: Arc<dyn InventoryStore>,
    transfers: Arc<dyn TransferStore>,
    creators: Arc<dyn CreatorDirectory>,
    bonus_log: Option<Arc<dyn BonusLog>>,
    metrics: Metrics,
}

impl std::fmt::Debug for GiftExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GiftExchange")
            .field("catalog_items", &self.catalog.len())
            .field("policy", &self.config.inventory_failure_policy)
            .field("bonus_log", &self.bonus_log.is_some())
            .finish_non_exhaustive()
    }
}

impl GiftExchange {
    /// Create from explicit parts.
    ///
    /// Creator contracts come from `config.contracted_creators` until
    /// [`with_creator_directory`](Self::with_creator_directory) replaces them.
    pub fn new(
        config: Config,
        catalog: Arc<GiftCatalog>,
        mutator: Arc<BalanceMutator>,
        inventory: Arc<dyn InventoryStore>,
        transfers: Arc<dyn TransferStore>,
    ) -> Result<Self> {
        config.validate()?;
        let creators = Arc::new(ContractedCreators::new(config.contracted_creators.clone()));

        Ok(Self {
            config,
            catalog,
            mutator,
            inventory,
            transfers,
            creators,
            bonus_log: None,
            metrics: Metrics::new()?,
        })
    }

    /// Look creator contracts up in `directory`
    pub fn with_creator_directory(mut self, directory: Arc<dyn CreatorDirectory>) -> Self {
        self.creators = directory;
        self
    }

    /// Write paid creator bonuses to `log`
    pub fn with_bonus_log(mut self, log: Arc<dyn BonusLog>) -> Self {
        self.bonus_log = Some(log);
        self
    }

    /// Create on top of a running ledger.
    ///
    /// Uses the ledger's RocksDB when it has one, memory otherwise. The
    /// catalog comes from `config.catalog_path`, or the development catalog.
    pub fn from_ledger(config: Config, ledger: &CoinLedger) -> Result<Self> {
        let catalog = match &config.catalog_path {
            Some(path) => {
                let catalog = GiftCatalog::from_file(path)?;
                info!(path = %path.display(), items = catalog.len(), "Gift catalog loaded");
                catalog
            }
            None => {
                warn!("No gift catalog configured, using the development catalog");
                GiftCatalog::development()
            }
        };

        let (inventory, transfers, bonus_log): (
            Arc<dyn InventoryStore>,
            Arc<dyn TransferStore>,
            Arc<dyn BonusLog>,
        ) = match ledger.storage() {
            Some(storage) => {
                let store = Arc::new(RocksGiftStore::new(storage));
                (store.clone(), store.clone(), store)
            }
            None => {
                let store = Arc::new(MemoryGiftStore::new());
                (store.clone(), store.clone(), store)
            }
        };

        Ok(Self::new(
            config,
            Arc::new(catalog),
            ledger.mutator(),
            inventory,
            transfers,
        )?
        .with_bonus_log(bonus_log))
    }

    /// Buy `quantity` units of a gift into `user_id`'s inventory
    pub async fn purchase(
        &self,
        session: &Session,
        user_id: &UserId,
        gift_slug: &str,
        quantity: u32,
    ) -> Result<PurchaseOutcome> {
        if quantity == 0 {
            return Err(Error::InvalidQuantity("quantity must be at least 1".to_string()));
        }
        if !(session.is_service() || session.is_user(user_id)) {
            return Err(coin_ledger::Error::Unauthenticated.into());
        }

        let item = self.catalog.get(gift_slug)?;
        let total_cost = priced(item.coin_cost, quantity)?;

        let metadata = Metadata::new()
            .with("gift_slug", gift_slug)
            .with("quantity", quantity)
            .with("unit_cost", item.coin_cost);

        let spend = self
            .mutator
            .spend(
                session,
                SpendRequest::new(user_id.clone(), coins(total_cost), TransactionType::Purchase)
                    .description(format!("Purchased {} x{}", item.name, quantity))
                    .source_ref(gift_slug)
                    .metadata(metadata),
            )
            .await?;

        // Coins are gone from here on
        let inventory_quantity = match self.inventory.add(user_id, gift_slug, u64::from(quantity)) {
            Ok(owned) => Some(owned),
            Err(err) => {
                self.metrics.inventory_failures.inc();
                match self.config.inventory_failure_policy {
                    InventoryFailurePolicy::ReportSuccess => {
                        warn!(
                            user_id = %user_id,
                            gift_slug,
                            quantity,
                            error = %err,
                            "Gift purchased but inventory not updated"
                        );
                        None
                    }
                    InventoryFailurePolicy::Refund => {
                        self.refund(user_id, gift_slug, total_cost, spend.ledger_ref)
                            .await;
                        return Err(err);
                    }
                }
            }
        };

        self.metrics.purchases_total.inc();
        info!(
            user_id = %user_id,
            gift_slug,
            quantity,
            total_cost,
            "Gift purchased"
        );

        Ok(PurchaseOutcome {
            inventory_quantity,
            remaining_balance: spend.new_balance,
            total_cost,
            ledger_ref: spend.ledger_ref,
        })
    }

    async fn refund(&self, user_id: &UserId, gift_slug: &str, amount: u64, spend_ref: Option<Uuid>) {
        let mut request = CreditRequest::new(user_id.clone(), coins(amount), TransactionType::Refund)
            .description(format!("Refund for undelivered {}", gift_slug))
            .metadata(Metadata::new().with("gift_slug", gift_slug));
        if let Some(entry_id) = spend_ref {
            request = request.source_ref(entry_id.to_string());
        }

        match self.mutator.credit(&Session::service(), request).await {
            Ok(_) => warn!(user_id = %user_id, gift_slug, amount, "Gift purchase refunded"),
            Err(err) => error!(
                user_id = %user_id,
                gift_slug,
                amount,
                error = %err,
                "Gift purchase refund failed"
            ),
        }
    }

    /// Send gifts from the sender's inventory to a receiver
    pub async fn send_from_inventory(
        &self,
        session: &Session,
        request: SendRequest,
    ) -> Result<SendOutcome> {
        if request.quantity == 0 {
            return Err(Error::InvalidQuantity("quantity must be at least 1".to_string()));
        }
        if request.sender_id.as_str().is_empty() {
            return Err(Error::MissingParty("sender".to_string()));
        }
        if request.receiver_id.as_str().is_empty() {
            return Err(Error::MissingParty("receiver".to_string()));
        }
        if !(session.is_service() || session.is_user(&request.sender_id)) {
            return Err(coin_ledger::Error::Unauthenticated.into());
        }

        let item = self.catalog.get(&request.gift_slug)?;
        priced(item.coin_cost, request.quantity)?;
        let split = RevenueSplit::compute(
            item.coin_cost,
            request.quantity,
            item.broadcaster_share(self.config.broadcaster_share),
        )?;

        let wanted = u64::from(request.quantity);
        let available = self.inventory.quantity(&request.sender_id, &request.gift_slug)?;
        if available < wanted {
            return Err(Error::InsufficientInventory {
                available,
                requested: wanted,
            });
        }

        let remaining_quantity =
            self.inventory
                .remove(&request.sender_id, &request.gift_slug, wanted)?;

        // In transit: no rollback past this point
        let now = Utc::now();
        let sent = GiftTransferRecord {
            transfer_id: Uuid::now_v7(),
            user_id: request.sender_id.clone(),
            counterparty_id: request.receiver_id.clone(),
            direction: TransferDirection::Sent,
            gift_slug: request.gift_slug.clone(),
            quantity: request.quantity,
            coin_value: split.sent_value,
            broadcaster_earnings: split.broadcaster_earnings,
            platform_portion: split.platform_portion,
            context: request.context.clone(),
            tier: item.tier.clone(),
            animation: item.animation.clone(),
            created_at: now,
        };
        let received = GiftTransferRecord {
            transfer_id: Uuid::now_v7(),
            user_id: request.receiver_id.clone(),
            counterparty_id: request.sender_id.clone(),
            direction: TransferDirection::Received,
            coin_value: split.broadcaster_earnings,
            ..sent.clone()
        };

        let transfers_recorded = match self.transfers.append(&[sent.clone(), received]) {
            Ok(()) => true,
            Err(err) => {
                self.metrics.transfer_failures.inc();
                error!(
                    transfer_id = %sent.transfer_id,
                    sender = %request.sender_id,
                    receiver = %request.receiver_id,
                    error = %err,
                    "Gift moved but transfer rows not written"
                );
                false
            }
        };

        let (payout, creator_bonus) = self.pay_receiver(&request, &sent, split).await;

        self.metrics.sends_total.inc();
        self.metrics
            .broadcaster_earnings_total
            .inc_by(split.broadcaster_earnings);
        info!(
            transfer_id = %sent.transfer_id,
            sender = %request.sender_id,
            receiver = %request.receiver_id,
            gift_slug = %request.gift_slug,
            quantity = request.quantity,
            sent_value = split.sent_value,
            broadcaster_earnings = split.broadcaster_earnings,
            creator_bonus = creator_bonus.map_or(0, |b| b.bonus_amount),
            "Gift sent"
        );

        Ok(SendOutcome {
            transfer_id: sent.transfer_id,
            split,
            remaining_quantity,
            transfers_recorded,
            payout,
            creator_bonus,
        })
    }

    async fn pay_receiver(
        &self,
        request: &SendRequest,
        sent: &GiftTransferRecord,
        split: RevenueSplit,
    ) -> (PayoutStatus, Option<CreatorBonus>) {
        if split.broadcaster_earnings == 0 {
            return (PayoutStatus::NotRequired, None);
        }

        let bonus = self
            .creator_bonus(&request.receiver_id, split.broadcaster_earnings)
            .await;
        let amount = bonus.map_or(split.broadcaster_earnings, |b| b.total_amount);

        let mut metadata = Metadata::new()
            .with("gift_slug", request.gift_slug.as_str())
            .with("quantity", request.quantity)
            .with("sender_id", request.sender_id.as_str())
            .with("sent_value", split.sent_value);
        if let Some(context) = &request.context {
            metadata = metadata.with("context", context.as_str());
        }
        if let Some(bonus) = &bonus {
            metadata = metadata
                .with("base_amount", bonus.base_amount)
                .with("bonus_amount", bonus.bonus_amount)
                .with("total_amount", bonus.total_amount);
        }

        // Bonus coins come out of the platform portion
        let platform_profit =
            coins(split.platform_portion) - coins(bonus.map_or(0, |b| b.bonus_amount));

        // The platform pays the receiver, so the credit runs as the service role
        let credit = CreditRequest::new(
            request.receiver_id.clone(),
            coins(amount),
            TransactionType::GiftReceived,
        )
        .description(format!("Gift {} x{}", request.gift_slug, request.quantity))
        .source_ref(sent.transfer_id.to_string())
        .idempotency_key(format!("gift-payout:{}", sent.transfer_id))
        .financials(platform_profit, coins(amount))
        .metadata(metadata);

        let payout = match self.mutator.credit(&Session::service(), credit).await {
            Ok(outcome) => {
                if let Some(bonus) = bonus {
                    self.log_bonus(request, sent, bonus, outcome.ledger_ref);
                }
                PayoutStatus::Credited {
                    credited: outcome.credited,
                    ledger_ref: outcome.ledger_ref,
                }
            }
            Err(err) => {
                self.metrics.payouts_pending.inc();
                error!(
                    transfer_id = %sent.transfer_id,
                    receiver = %request.receiver_id,
                    amount,
                    error = %err,
                    "Gift payout failed, left pending"
                );
                PayoutStatus::Pending {
                    reason: err.to_string(),
                }
            }
        };

        (payout, bonus)
    }

    /// Bonus owed to `receiver` on `earnings`; a failed lookup pays none
    async fn creator_bonus(&self, receiver: &UserId, earnings: u64) -> Option<CreatorBonus> {
        match self.creators.is_contracted(receiver).await {
            Ok(true) => {
                let bonus = CreatorBonus::compute(earnings, self.config.creator_bonus_share);
                (bonus.bonus_amount > 0).then_some(bonus)
            }
            Ok(false) => None,
            Err(err) => {
                warn!(
                    receiver = %receiver,
                    error = %err,
                    "Creator contract lookup failed, paying base earnings"
                );
                None
            }
        }
    }

    fn log_bonus(
        &self,
        request: &SendRequest,
        sent: &GiftTransferRecord,
        bonus: CreatorBonus,
        ledger_ref: Option<Uuid>,
    ) {
        self.metrics.creator_bonuses_total.inc();
        self.metrics
            .creator_bonus_coins_total
            .inc_by(bonus.bonus_amount);
        info!(
            creator_id = %request.receiver_id,
            transfer_id = %sent.transfer_id,
            base = bonus.base_amount,
            bonus = bonus.bonus_amount,
            total = bonus.total_amount,
            "Creator bonus paid"
        );

        let Some(log) = &self.bonus_log else {
            return;
        };
        let entry = CreatorBonusRecord {
            bonus_id: Uuid::now_v7(),
            creator_id: request.receiver_id.clone(),
            transfer_id: sent.transfer_id,
            sender_id: request.sender_id.clone(),
            context: request.context.clone(),
            bonus,
            ledger_ref,
            created_at: Utc::now(),
        };
        if let Err(err) = log.record(&entry) {
            self.metrics.bonus_log_failures.inc();
            warn!(
                creator_id = %request.receiver_id,
                transfer_id = %sent.transfer_id,
                error = %err,
                "Creator bonus paid but not logged"
            );
        }
    }

    /// Inventory rows owned by a user
    pub fn inventory(&self, user_id: &UserId) -> Result<Vec<InventoryRecord>> {
        self.inventory.inventory(user_id)
    }

    /// Transfer rows owned by a user, oldest first
    pub fn transfers(&self, user_id: &UserId) -> Result<Vec<GiftTransferRecord>> {
        self.transfers.transfers_for_user(user_id)
    }

    /// Logged creator bonuses for a creator; empty without a bonus log
    pub fn creator_bonuses(&self, creator_id: &UserId) -> Result<Vec<CreatorBonusRecord>> {
        match &self.bonus_log {
            Some(log) => log.bonuses_for_creator(creator_id),
            None => Ok(Vec::new()),
        }
    }

    /// Catalog
    pub fn catalog(&self) -> &GiftCatalog {
        &self.catalog
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

fn coins(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

/// `coin_cost × quantity`, bounded so it can be passed to the ledger
fn priced(coin_cost: u64, quantity: u32) -> Result<u64> {
    coin_cost
        .checked_mul(u64::from(quantity))
        .filter(|total| *total <= i64::MAX as u64)
        .ok_or_else(|| {
            Error::InvalidQuantity(format!(
                "{} × {} exceeds the coin range",
                quantity, coin_cost
            ))
        })
}
