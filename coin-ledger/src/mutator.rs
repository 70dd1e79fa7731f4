//! Balance mutator
//!
//! Public `spend` and `credit` entry points. Each call makes at most one
//! mutation at the bank, then reconciles:
//!
//! 1. ledger row through the [`LedgerRecorder`]
//! 2. advisory cache projection for the session's own user
//! 3. outbox records for family/task/war trackers (credits only)
//!
//! Once the bank has committed, nothing after it can turn the call into a
//! failure. A bank that reports schema drift is served through its legacy
//! RPCs instead.

use crate::{
    bank::{Bank, BankError, CreditCall, SpendCall},
    cache::BalanceCache,
    dispatcher::DispatcherHandle,
    metadata::Metadata,
    metrics::Metrics,
    outbox::{OutboxRecord, SideEffect},
    recorder::{LedgerRecorder, RecordRequest},
    store::OutboxStore,
    types::{Bucket, CoinType, Session, TransactionType, UserId},
    Error, Result,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Which bank RPC family served a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationPath {
    /// Secure spend / credit RPCs
    Secure,
    /// Legacy per-type RPCs
    Legacy,
}

impl MutationPath {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationPath::Secure => "secure",
            MutationPath::Legacy => "legacy",
        }
    }
}

/// Spend request
#[derive(Debug, Clone, PartialEq)]
pub struct SpendRequest {
    /// User whose coins are spent
    pub user_id: UserId,
    /// Amount; must be positive
    pub amount: i64,
    /// Accounting source
    pub transaction_type: TransactionType,
    /// Coin type
    pub coin_type: CoinType,
    /// Description
    pub description: Option<String>,
    /// Metadata
    pub metadata: Metadata,
    /// Reference id (order, gift, ...)
    pub source_ref: Option<String>,
    /// Caller-supplied key; a repeat is replayed by the bank
    pub idempotency_key: Option<String>,
}

impl SpendRequest {
    /// Spend troll coins
    pub fn new(user_id: UserId, amount: i64, transaction_type: TransactionType) -> Self {
        Self {
            user_id,
            amount,
            transaction_type,
            coin_type: CoinType::TrollCoins,
            description: None,
            metadata: Metadata::new(),
            source_ref: None,
            idempotency_key: None,
        }
    }

    /// Set coin type
    pub fn coin_type(mut self, coin_type: CoinType) -> Self {
        self.coin_type = coin_type;
        self
    }

    /// Set description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set metadata
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set reference id
    pub fn source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    /// Set idempotency key
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Successful spend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendOutcome {
    /// Balance of the spent coin type, when the bank reported it
    pub new_balance: Option<u64>,
    /// Ledger row written by this layer
    pub ledger_ref: Option<Uuid>,
    /// Bank path taken
    pub path: MutationPath,
}

/// Credit request
#[derive(Debug, Clone, PartialEq)]
pub struct CreditRequest {
    /// User to credit
    pub user_id: UserId,
    /// Amount; must be positive
    pub amount: i64,
    /// Accounting source; selects the bucket
    pub transaction_type: TransactionType,
    /// Coin type
    pub coin_type: CoinType,
    /// Description
    pub description: Option<String>,
    /// Metadata
    pub metadata: Metadata,
    /// Reference id
    pub source_ref: Option<String>,
    /// Caller-supplied key; a repeat is replayed by the bank
    pub idempotency_key: Option<String>,
    /// Platform profit for financial reporting
    pub platform_profit: Option<i64>,
    /// Liability for financial reporting
    pub liability: Option<i64>,
}

impl CreditRequest {
    /// Credit troll coins
    pub fn new(user_id: UserId, amount: i64, transaction_type: TransactionType) -> Self {
        Self {
            user_id,
            amount,
            transaction_type,
            coin_type: CoinType::TrollCoins,
            description: None,
            metadata: Metadata::new(),
            source_ref: None,
            idempotency_key: None,
            platform_profit: None,
            liability: None,
        }
    }

    /// Set coin type
    pub fn coin_type(mut self, coin_type: CoinType) -> Self {
        self.coin_type = coin_type;
        self
    }

    /// Set description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set metadata
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set reference id
    pub fn source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    /// Set idempotency key
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set financial reporting fields
    pub fn financials(mut self, platform_profit: i64, liability: i64) -> Self {
        self.platform_profit = Some(platform_profit);
        self.liability = Some(liability);
        self
    }
}

/// Successful credit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditOutcome {
    /// Balance after the credit, when known
    pub new_balance: Option<u64>,
    /// Coins the user actually received
    pub credited: u64,
    /// Coins withheld by the bank for loan repayment
    pub repaid: u64,
    /// Bucket credited
    pub bucket: Bucket,
    /// Ledger row written by this layer
    pub ledger_ref: Option<Uuid>,
    /// Bank path taken
    pub path: MutationPath,
}

/// Spend / credit orchestration
pub struct BalanceMutator {
    bank: Arc<dyn Bank>,
    recorder: Arc<LedgerRecorder>,
    outbox: Arc<dyn OutboxStore>,
    cache: Arc<BalanceCache>,
    dispatcher: Option<DispatcherHandle>,
    family_share: Decimal,
    metrics: Metrics,
}

impl std::fmt::Debug for BalanceMutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceMutator")
            .field("family_share", &self.family_share)
            .field("dispatcher", &self.dispatcher.is_some())
            .finish_non_exhaustive()
    }
}

impl BalanceMutator {
    /// Create mutator
    pub fn new(
        bank: Arc<dyn Bank>,
        recorder: Arc<LedgerRecorder>,
        outbox: Arc<dyn OutboxStore>,
        cache: Arc<BalanceCache>,
        family_share: Decimal,
        metrics: Metrics,
    ) -> Self {
        Self {
            bank,
            recorder,
            outbox,
            cache,
            dispatcher: None,
            family_share,
            metrics,
        }
    }

    /// Wake this dispatcher after enqueueing side effects
    pub fn with_dispatcher(mut self, dispatcher: DispatcherHandle) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Spend coins
    pub async fn spend(&self, session: &Session, request: SpendRequest) -> Result<SpendOutcome> {
        let amount = positive_amount(request.amount)?;
        authorize(session, &request.user_id)?;

        if !request.coin_type.is_fungible() {
            return self.spend_non_fungible(session, request, amount).await;
        }

        let call = SpendCall {
            user_id: request.user_id.clone(),
            amount,
            bucket: Bucket::Paid,
            source: request.transaction_type.as_str().to_string(),
            ref_id: request.source_ref.clone(),
            idempotency_key: request.idempotency_key.clone(),
            metadata: request.metadata.clone(),
        };

        let receipt = match self.bank.secure_spend(call).await {
            Ok(receipt) if receipt.success => receipt,
            Ok(receipt) => {
                let reason = receipt
                    .error
                    .unwrap_or_else(|| "spend declined".to_string());
                return Err(Error::BankRejected(reason));
            }
            Err(err) if err.is_schema_drift() => {
                return self.spend_legacy(session, &request, amount, err).await;
            }
            Err(err) => return Err(Error::from_bank(err, amount)),
        };

        if receipt.replayed {
            info!(user_id = %request.user_id, amount, "Spend replayed by bank; already recorded");
            return Ok(SpendOutcome {
                new_balance: receipt.new_balance,
                ledger_ref: None,
                path: MutationPath::Secure,
            });
        }

        let record = RecordRequest::new(request.user_id.clone(), -signed(amount), request.transaction_type)
            .bucket(Bucket::Paid)
            .balance_after(receipt.new_balance)
            .source_ref(request.source_ref)
            .description(request.description)
            .metadata(request.metadata);
        let ledger_ref = self.record_committed(session, record, &[]);

        if let Some(balance) = receipt.new_balance {
            self.project(session, &request.user_id, CoinType::TrollCoins, balance);
        }

        self.metrics.record_spend(MutationPath::Secure.as_str());
        info!(
            user_id = %request.user_id,
            amount,
            transaction_type = %request.transaction_type,
            new_balance = ?receipt.new_balance,
            "Spend committed"
        );

        Ok(SpendOutcome {
            new_balance: receipt.new_balance,
            ledger_ref,
            path: MutationPath::Secure,
        })
    }

    /// Bank RPCs predate the secure spend; the legacy deduction logs itself
    async fn spend_legacy(
        &self,
        session: &Session,
        request: &SpendRequest,
        amount: u64,
        drift: BankError,
    ) -> Result<SpendOutcome> {
        warn!(
            user_id = %request.user_id,
            error = %drift,
            "Bank schema drift on spend; using legacy deduction"
        );
        self.metrics.record_schema_drift();

        let receipt = self
            .bank
            .legacy_deduct(&request.user_id, amount, CoinType::TrollCoins)
            .await
            .map_err(|e| Error::from_bank(e, amount))?;

        self.project(session, &request.user_id, CoinType::TrollCoins, receipt.new_balance);
        self.metrics.record_spend(MutationPath::Legacy.as_str());
        info!(
            user_id = %request.user_id,
            amount,
            new_balance = receipt.new_balance,
            "Spend committed via legacy deduction"
        );

        Ok(SpendOutcome {
            new_balance: Some(receipt.new_balance),
            ledger_ref: None,
            path: MutationPath::Legacy,
        })
    }

    async fn spend_non_fungible(
        &self,
        session: &Session,
        request: SpendRequest,
        amount: u64,
    ) -> Result<SpendOutcome> {
        let receipt = self
            .bank
            .legacy_deduct(&request.user_id, amount, request.coin_type)
            .await
            .map_err(|e| Error::from_bank(e, amount))?;

        let record = RecordRequest::new(request.user_id.clone(), -signed(amount), request.transaction_type)
            .coin_type(request.coin_type)
            .balance_after(Some(receipt.new_balance))
            .source_ref(request.source_ref)
            .description(request.description)
            .metadata(request.metadata);
        let ledger_ref = self.record_committed(session, record, &[]);

        self.project(session, &request.user_id, request.coin_type, receipt.new_balance);
        self.metrics.record_spend(MutationPath::Legacy.as_str());
        info!(
            user_id = %request.user_id,
            amount,
            coin_type = %request.coin_type,
            "Spend committed"
        );

        Ok(SpendOutcome {
            new_balance: Some(receipt.new_balance),
            ledger_ref,
            path: MutationPath::Legacy,
        })
    }

    /// Credit coins
    pub async fn credit(&self, session: &Session, request: CreditRequest) -> Result<CreditOutcome> {
        let amount = positive_amount(request.amount)?;
        authorize(session, &request.user_id)?;

        if !request.coin_type.is_fungible() {
            return self.credit_non_fungible(session, request, amount).await;
        }

        let bucket = request.transaction_type.credit_bucket();
        let call = CreditCall {
            user_id: request.user_id.clone(),
            amount,
            bucket,
            source: request.transaction_type.as_str().to_string(),
            ref_id: request.source_ref.clone(),
            idempotency_key: request.idempotency_key.clone(),
            metadata: request.metadata.clone(),
        };

        let (credited, repaid, new_balance, path) = match self.bank.credit(call).await {
            Ok(receipt) if receipt.replayed => {
                info!(user_id = %request.user_id, amount, "Credit replayed by bank; already recorded");
                return Ok(CreditOutcome {
                    new_balance: receipt.new_balance,
                    credited: receipt.user_gets,
                    repaid: receipt.repay,
                    bucket,
                    ledger_ref: None,
                    path: MutationPath::Secure,
                });
            }
            Ok(receipt) => (
                receipt.user_gets,
                receipt.repay,
                receipt.new_balance,
                MutationPath::Secure,
            ),
            Err(err) if err.is_schema_drift() => {
                warn!(
                    user_id = %request.user_id,
                    error = %err,
                    "Bank schema drift on credit; using legacy balance update"
                );
                self.metrics.record_schema_drift();

                let current = self
                    .bank
                    .balance(&request.user_id)
                    .await
                    .map_err(|e| Error::from_bank(e, amount))?;
                let total = current.troll_coins().saturating_add(amount);
                self.bank
                    .legacy_credit_by_update(&request.user_id, CoinType::TrollCoins, total)
                    .await
                    .map_err(|e| Error::from_bank(e, amount))?;

                (amount, 0, Some(total), MutationPath::Legacy)
            }
            Err(err) => return Err(Error::from_bank(err, amount)),
        };

        let ledger_ref = if credited > 0 {
            let effects = self.side_effects(&request.user_id, credited);

            let mut metadata = request.metadata;
            metadata.insert("requested_amount", amount);
            metadata.insert("repaid", repaid);

            let record = RecordRequest::new(request.user_id.clone(), signed(credited), request.transaction_type)
                .bucket(bucket)
                .balance_after(new_balance)
                .source_ref(request.source_ref)
                .description(request.description)
                .metadata(metadata)
                .financials(request.platform_profit, request.liability);

            let ledger_ref = self.record_committed(session, record, &effects);
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.wake();
            }
            ledger_ref
        } else {
            info!(user_id = %request.user_id, repaid, "Credit fully withheld for loan repayment");
            None
        };

        if session.is_user(&request.user_id) {
            let projected = self
                .cache
                .get(&request.user_id)
                .map(|s| s.troll_coins.saturating_add(credited))
                .or(new_balance);
            if let Some(balance) = projected {
                self.cache
                    .project(&request.user_id, CoinType::TrollCoins, balance);
            }
        }

        self.metrics.record_credit(path.as_str());
        info!(
            user_id = %request.user_id,
            requested = amount,
            credited,
            repaid,
            %bucket,
            transaction_type = %request.transaction_type,
            "Credit committed"
        );

        Ok(CreditOutcome {
            new_balance,
            credited,
            repaid,
            bucket,
            ledger_ref,
            path,
        })
    }

    /// Trollmonds only exist on the legacy per-type columns
    async fn credit_non_fungible(
        &self,
        session: &Session,
        request: CreditRequest,
        amount: u64,
    ) -> Result<CreditOutcome> {
        let current = self
            .bank
            .balance(&request.user_id)
            .await
            .map_err(|e| Error::from_bank(e, amount))?;
        let total = current.trollmonds.saturating_add(amount);
        self.bank
            .legacy_credit_by_update(&request.user_id, request.coin_type, total)
            .await
            .map_err(|e| Error::from_bank(e, amount))?;

        let record = RecordRequest::new(request.user_id.clone(), signed(amount), request.transaction_type)
            .coin_type(request.coin_type)
            .balance_after(Some(total))
            .source_ref(request.source_ref)
            .description(request.description)
            .metadata(request.metadata)
            .financials(request.platform_profit, request.liability);
        let ledger_ref = self.record_committed(session, record, &[]);

        self.project(session, &request.user_id, request.coin_type, total);
        self.metrics.record_credit(MutationPath::Legacy.as_str());
        info!(user_id = %request.user_id, amount, coin_type = %request.coin_type, "Credit committed");

        Ok(CreditOutcome {
            new_balance: Some(total),
            credited: amount,
            repaid: 0,
            bucket: request.transaction_type.credit_bucket(),
            ledger_ref,
            path: MutationPath::Legacy,
        })
    }

    /// Family, task and war events for a fungible credit
    fn side_effects(&self, user_id: &UserId, credited: u64) -> Vec<SideEffect> {
        let mut effects = Vec::with_capacity(3);

        let contribution = (Decimal::from(credited) * self.family_share)
            .floor()
            .to_u64()
            .unwrap_or(0);
        if contribution > 0 {
            effects.push(SideEffect::FamilyContribution {
                user_id: user_id.clone(),
                credited,
                contribution,
            });
        }

        effects.push(SideEffect::TaskProgress {
            user_id: user_id.clone(),
            coins: credited,
        });
        effects.push(SideEffect::WarProgress {
            user_id: user_id.clone(),
            coins: credited,
        });

        effects
    }

    /// Write the ledger row for a mutation the bank already committed.
    ///
    /// The mutation stands even when the row cannot be written.
    fn record_committed(
        &self,
        session: &Session,
        record: RecordRequest,
        effects: &[SideEffect],
    ) -> Option<Uuid> {
        let user_id = record.user_id.clone();
        let amount = record.amount;

        match self.recorder.record_with_effects(session, record, effects) {
            Ok(entry) => Some(entry.entry_id),
            Err(e) => {
                self.metrics.record_unrecorded();
                error!(
                    user_id = %user_id,
                    amount,
                    error = %e,
                    "Ledger write failed after bank commit"
                );

                if !effects.is_empty() {
                    let records: Vec<OutboxRecord> = effects
                        .iter()
                        .cloned()
                        .map(|effect| OutboxRecord::pending(effect, None))
                        .collect();
                    if let Err(e) = self.outbox.enqueue(&records) {
                        warn!(user_id = %user_id, error = %e, "Side effects dropped");
                    }
                }

                None
            }
        }
    }

    fn project(&self, session: &Session, user_id: &UserId, coin_type: CoinType, balance: u64) {
        if session.is_user(user_id) {
            self.cache.project(user_id, coin_type, balance);
        }
    }
}

fn positive_amount(amount: i64) -> Result<u64> {
    match u64::try_from(amount) {
        Ok(amount) if amount > 0 => Ok(amount),
        _ => Err(Error::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        ))),
    }
}

/// Only the service role may move another user's coins
fn authorize(session: &Session, user_id: &UserId) -> Result<()> {
    if session.is_service() || session.is_user(user_id) {
        Ok(())
    } else {
        Err(Error::Unauthenticated)
    }
}

fn signed(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::BankErrorKind;
    use crate::memory::MemoryStore;
    use crate::sim::SimulatedBank;
    use crate::store::LedgerStore;

    struct Fixture {
        bank: Arc<SimulatedBank>,
        store: Arc<MemoryStore>,
        cache: Arc<BalanceCache>,
        mutator: BalanceMutator,
    }

    fn fixture() -> Fixture {
        let bank = Arc::new(SimulatedBank::new());
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(BalanceCache::new(16));
        let metrics = Metrics::new().unwrap();
        let recorder = Arc::new(LedgerRecorder::new(store.clone(), metrics.clone()));
        let mutator = BalanceMutator::new(
            bank.clone(),
            recorder,
            store.clone(),
            cache.clone(),
            Decimal::new(10, 2),
            metrics,
        );
        Fixture {
            bank,
            store,
            cache,
            mutator,
        }
    }

    #[tokio::test]
    async fn test_spend_whole_balance() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.deposit(&alice, Bucket::Paid, 1_000);

        let outcome = f
            .mutator
            .spend(
                &Session::user(alice.clone()),
                SpendRequest::new(alice.clone(), 1_000, TransactionType::Purchase),
            )
            .await
            .unwrap();

        assert_eq!(outcome.new_balance, Some(0));
        assert_eq!(outcome.path, MutationPath::Secure);
        let rows = f.store.entries_for_user(&alice).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, -1_000);
        assert_eq!(Some(rows[0].entry_id), outcome.ledger_ref);
        assert_eq!(f.cache.get(&alice).unwrap().troll_coins, 0);
    }

    #[tokio::test]
    async fn test_non_positive_spend_never_reaches_bank() {
        let f = fixture();
        let alice = UserId::new("alice");

        for amount in [0, -5, i64::MIN] {
            let result = f
                .mutator
                .spend(
                    &Session::user(alice.clone()),
                    SpendRequest::new(alice.clone(), amount, TransactionType::Purchase),
                )
                .await;
            assert!(matches!(result, Err(Error::InvalidAmount(_))));
        }

        assert_eq!(f.bank.calls().secure_spend, 0);
        assert_eq!(f.store.entry_count(), 0);
        assert_eq!(positive_amount(i64::MAX).unwrap(), i64::MAX as u64);
    }

    #[tokio::test]
    async fn test_anonymous_session_rejected() {
        let f = fixture();
        let result = f
            .mutator
            .spend(
                &Session::anonymous(),
                SpendRequest::new(UserId::new("alice"), 5, TransactionType::Purchase),
            )
            .await;
        assert!(matches!(result, Err(Error::Unauthenticated)));
        assert_eq!(f.bank.calls().secure_spend, 0);
    }

    #[tokio::test]
    async fn test_user_session_cannot_move_someone_elses_coins() {
        let f = fixture();
        let alice = UserId::new("alice");
        let mallory = Session::user(UserId::new("mallory"));
        f.bank.deposit(&alice, Bucket::Paid, 100);

        let spent = f
            .mutator
            .spend(
                &mallory,
                SpendRequest::new(alice.clone(), 100, TransactionType::Purchase),
            )
            .await;
        assert!(matches!(spent, Err(Error::Unauthenticated)));

        let credited = f
            .mutator
            .credit(
                &mallory,
                CreditRequest::new(alice.clone(), 1_000, TransactionType::AdminGrant),
            )
            .await;
        assert!(matches!(credited, Err(Error::Unauthenticated)));

        let calls = f.bank.calls();
        assert_eq!(calls.secure_spend, 0);
        assert_eq!(calls.credit, 0);
        assert_eq!(f.store.entry_count(), 0);
        assert_eq!(f.bank.peek(&alice).troll_coins(), 100);
    }

    #[tokio::test]
    async fn test_insufficient_funds_writes_nothing() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.deposit(&alice, Bucket::Paid, 10);

        let result = f
            .mutator
            .spend(
                &Session::user(alice.clone()),
                SpendRequest::new(alice.clone(), 11, TransactionType::Purchase),
            )
            .await;

        assert!(matches!(
            result,
            Err(Error::InsufficientFunds { required: 11, .. })
        ));
        assert_eq!(f.store.entry_count(), 0);
        assert!(f.cache.get(&alice).is_none());
    }

    #[tokio::test]
    async fn test_declined_spend_surfaces_reason() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.deposit(&alice, Bucket::Paid, 10);
        f.bank.decline_next_spend("account frozen");

        let result = f
            .mutator
            .spend(
                &Session::user(alice.clone()),
                SpendRequest::new(alice.clone(), 5, TransactionType::Purchase),
            )
            .await;

        match result {
            Err(Error::BankRejected(reason)) => assert_eq!(reason, "account frozen"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(f.store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_bank() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank
            .fail_next(BankError::new(BankErrorKind::Unavailable, "connection reset"));

        let result = f
            .mutator
            .spend(
                &Session::user(alice.clone()),
                SpendRequest::new(alice, 5, TransactionType::Purchase),
            )
            .await;
        assert!(matches!(result, Err(Error::NoBankConnection(_))));
    }

    #[tokio::test]
    async fn test_schema_drift_spend_uses_legacy_once_without_row() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.deposit(&alice, Bucket::Paid, 100);
        f.bank.set_schema_drift(true);

        let outcome = f
            .mutator
            .spend(
                &Session::user(alice.clone()),
                SpendRequest::new(alice.clone(), 40, TransactionType::EntranceEffect),
            )
            .await
            .unwrap();

        assert_eq!(outcome.path, MutationPath::Legacy);
        assert_eq!(outcome.new_balance, Some(60));
        assert!(outcome.ledger_ref.is_none());
        assert_eq!(f.bank.calls().legacy_deduct, 1);
        assert_eq!(f.store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_trollmond_spend_is_legacy_with_row() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.deposit_trollmonds(&alice, 20);

        let outcome = f
            .mutator
            .spend(
                &Session::user(alice.clone()),
                SpendRequest::new(alice.clone(), 15, TransactionType::PerkPurchase)
                    .coin_type(CoinType::Trollmonds),
            )
            .await
            .unwrap();

        assert_eq!(outcome.new_balance, Some(5));
        assert_eq!(f.bank.calls().secure_spend, 0);
        let row = f.store.entry(outcome.ledger_ref.unwrap()).unwrap();
        assert_eq!(row.coin_type, "trollmonds");
        assert_eq!(row.balance_after, Some(5));
        assert_eq!(f.cache.get(&alice).unwrap().trollmonds, 5);
    }

    #[tokio::test]
    async fn test_ledger_failure_after_commit_still_succeeds() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.deposit(&alice, Bucket::Paid, 100);
        f.store.set_fail_appends(true);

        let outcome = f
            .mutator
            .spend(
                &Session::user(alice.clone()),
                SpendRequest::new(alice.clone(), 30, TransactionType::Purchase),
            )
            .await
            .unwrap();

        assert!(outcome.ledger_ref.is_none());
        assert_eq!(f.bank.peek(&alice).troll_coins(), 70);
    }

    #[tokio::test]
    async fn test_other_users_spend_leaves_session_cache_alone() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.deposit(&alice, Bucket::Paid, 100);

        f.mutator
            .spend(
                &Session::service(),
                SpendRequest::new(alice.clone(), 10, TransactionType::Purchase),
            )
            .await
            .unwrap();

        assert!(f.cache.get(&alice).is_none());
    }

    #[tokio::test]
    async fn test_admin_grant_credits_promo_and_queues_effects() {
        let f = fixture();
        let alice = UserId::new("alice");

        let outcome = f
            .mutator
            .credit(
                &Session::service(),
                CreditRequest::new(alice.clone(), 500, TransactionType::AdminGrant),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bucket, Bucket::Promo);
        assert_eq!(outcome.credited, 500);
        assert_eq!(f.bank.peek(&alice).promo, 500);

        let records = f.store.records().unwrap();
        let effects: Vec<&SideEffect> = records.iter().map(|r| &r.effect).collect();
        assert!(effects.contains(&&SideEffect::FamilyContribution {
            user_id: alice.clone(),
            credited: 500,
            contribution: 50,
        }));
        assert!(effects.contains(&&SideEffect::TaskProgress {
            user_id: alice.clone(),
            coins: 500,
        }));
        assert!(effects.contains(&&SideEffect::WarProgress {
            user_id: alice,
            coins: 500,
        }));
        assert!(records.iter().all(|r| r.entry_id == outcome.ledger_ref));
    }

    #[tokio::test]
    async fn test_loan_repayment_reduces_credited_amount() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.grant_loan(&alice, 1_000);
        f.cache.project(&alice, CoinType::TrollCoins, 10);

        let outcome = f
            .mutator
            .credit(
                &Session::user(alice.clone()),
                CreditRequest::new(alice.clone(), 200, TransactionType::Purchase),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bucket, Bucket::Paid);
        assert_eq!(outcome.credited, 100);
        assert_eq!(outcome.repaid, 100);
        assert_eq!(f.cache.get(&alice).unwrap().troll_coins, 110);

        let row = f.store.entry(outcome.ledger_ref.unwrap()).unwrap();
        assert_eq!(row.amount, 100);
        assert_eq!(row.metadata.get("requested_amount").and_then(|v| v.as_u64()), Some(200));
        assert_eq!(row.metadata.get("repaid").and_then(|v| v.as_u64()), Some(100));
    }

    #[tokio::test]
    async fn test_schema_drift_credit_updates_legacy_total() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.deposit(&alice, Bucket::Paid, 40);
        f.bank.set_schema_drift(true);

        let outcome = f
            .mutator
            .credit(
                &Session::user(alice.clone()),
                CreditRequest::new(alice.clone(), 60, TransactionType::Reward),
            )
            .await
            .unwrap();

        assert_eq!(outcome.path, MutationPath::Legacy);
        assert_eq!(outcome.new_balance, Some(100));
        assert_eq!(f.bank.peek(&alice).troll_coins(), 100);
        assert_eq!(f.bank.calls().legacy_credit_by_update, 1);
        assert!(outcome.ledger_ref.is_some());
    }

    #[tokio::test]
    async fn test_ledger_failure_on_credit_still_queues_effects() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.store.set_fail_appends(true);

        let outcome = f
            .mutator
            .credit(
                &Session::service(),
                CreditRequest::new(alice.clone(), 100, TransactionType::LuckyGiftWin),
            )
            .await
            .unwrap();

        assert!(outcome.ledger_ref.is_none());
        let records = f.store.records().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.entry_id.is_none()));
    }

    #[tokio::test]
    async fn test_trollmond_credit_adds_to_legacy_column() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.bank.deposit_trollmonds(&alice, 3);

        let outcome = f
            .mutator
            .credit(
                &Session::service(),
                CreditRequest::new(alice.clone(), 7, TransactionType::Reward)
                    .coin_type(CoinType::Trollmonds),
            )
            .await
            .unwrap();

        assert_eq!(outcome.new_balance, Some(10));
        assert_eq!(f.bank.peek(&alice).trollmonds, 10);
        assert!(f.store.records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idempotency_key_prevents_double_credit() {
        let f = fixture();
        let alice = UserId::new("alice");

        for _ in 0..2 {
            f.mutator
                .credit(
                    &Session::service(),
                    CreditRequest::new(alice.clone(), 50, TransactionType::Reward)
                        .idempotency_key("daily-login-2026-10-19"),
                )
                .await
                .unwrap();
        }

        assert_eq!(f.bank.peek(&alice).troll_coins(), 50);
        assert_eq!(f.store.entry_count(), 1);
        assert_eq!(f.store.records().unwrap().len(), 3);
    }
}
