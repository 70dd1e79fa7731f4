//! Simulated bank
//!
//! In-process implementation of [`Bank`] for development servers and tests.
//! Every call is applied under one lock, which gives the same "fully applies
//! or fully fails" guarantee the real bank offers.
//!
//! Policies mirrored from the production bank:
//! - fungible spends drain promo, then gifted, then paid coins
//! - while a loan is outstanding, 50% of every paid-bucket credit is withheld
//!   as repayment
//! - a repeated idempotency key replays the first result

use crate::bank::{
    Bank, BankError, BankErrorKind, BankResult, CreditCall, CreditReceipt, LegacyReceipt,
    SpendCall, SpendReceipt,
};
use crate::types::{Bucket, CoinBalance, CoinType, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Share of an incoming paid credit withheld while a loan is outstanding
const LOAN_REPAYMENT_PERCENT: u64 = 50;

#[derive(Debug, Default, Clone, Copy)]
struct Account {
    balance: CoinBalance,
    loan_outstanding: u64,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<UserId, Account>,
    spend_replays: HashMap<String, SpendReceipt>,
    credit_replays: HashMap<String, CreditReceipt>,
}

/// Snapshot of how often each RPC was called
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `secure_spend` calls
    pub secure_spend: usize,
    /// `credit` calls
    pub credit: usize,
    /// `legacy_deduct` calls
    pub legacy_deduct: usize,
    /// `legacy_credit_by_update` calls
    pub legacy_credit_by_update: usize,
}

/// In-process bank
#[derive(Debug, Default)]
pub struct SimulatedBank {
    state: Mutex<State>,
    schema_drift: AtomicBool,
    fail_next: Mutex<Option<BankError>>,
    decline_next_spend: Mutex<Option<String>>,
    secure_spend_calls: AtomicUsize,
    credit_calls: AtomicUsize,
    legacy_deduct_calls: AtomicUsize,
    legacy_update_calls: AtomicUsize,
}

impl SimulatedBank {
    /// Empty bank
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed coins into a bucket without going through `credit`
    pub fn deposit(&self, user_id: &UserId, bucket: Bucket, amount: u64) {
        let mut state = self.state.lock();
        state
            .accounts
            .entry(user_id.clone())
            .or_default()
            .balance
            .credit(bucket, amount);
    }

    /// Seed trollmonds
    pub fn deposit_trollmonds(&self, user_id: &UserId, amount: u64) {
        let mut state = self.state.lock();
        state
            .accounts
            .entry(user_id.clone())
            .or_default()
            .balance
            .trollmonds += amount;
    }

    /// Open a loan that is repaid from paid-bucket credits
    pub fn grant_loan(&self, user_id: &UserId, amount: u64) {
        let mut state = self.state.lock();
        state
            .accounts
            .entry(user_id.clone())
            .or_default()
            .loan_outstanding += amount;
    }

    /// Outstanding loan
    pub fn loan_outstanding(&self, user_id: &UserId) -> u64 {
        self.state
            .lock()
            .accounts
            .get(user_id)
            .map(|a| a.loan_outstanding)
            .unwrap_or(0)
    }

    /// Current balance without counting as an RPC
    pub fn peek(&self, user_id: &UserId) -> CoinBalance {
        self.state
            .lock()
            .accounts
            .get(user_id)
            .map(|a| a.balance)
            .unwrap_or_default()
    }

    /// Emulate a bank whose secure RPCs reference a dropped `coins` column
    pub fn set_schema_drift(&self, drift: bool) {
        self.schema_drift.store(drift, Ordering::SeqCst);
    }

    /// Fail the next RPC of any kind with `error`
    pub fn fail_next(&self, error: BankError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Answer the next secure spend with `success = false`
    pub fn decline_next_spend(&self, reason: impl Into<String>) {
        *self.decline_next_spend.lock() = Some(reason.into());
    }

    /// Call counters
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            secure_spend: self.secure_spend_calls.load(Ordering::SeqCst),
            credit: self.credit_calls.load(Ordering::SeqCst),
            legacy_deduct: self.legacy_deduct_calls.load(Ordering::SeqCst),
            legacy_credit_by_update: self.legacy_update_calls.load(Ordering::SeqCst),
        }
    }

    fn injected_failure(&self) -> BankResult<()> {
        match self.fail_next.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn drift_error(&self) -> BankResult<()> {
        if self.schema_drift.load(Ordering::SeqCst) {
            return Err(BankError::from_backend(
                Some("42703"),
                "column \"coins\" of relation \"wallets\" does not exist",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Bank for SimulatedBank {
    async fn secure_spend(&self, call: SpendCall) -> BankResult<SpendReceipt> {
        self.secure_spend_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        self.drift_error()?;

        if let Some(reason) = self.decline_next_spend.lock().take() {
            return Ok(SpendReceipt {
                success: false,
                new_balance: None,
                error: Some(reason),
                replayed: false,
            });
        }

        let mut state = self.state.lock();
        if let Some(key) = &call.idempotency_key {
            if let Some(receipt) = state.spend_replays.get(key) {
                return Ok(SpendReceipt {
                    replayed: true,
                    ..receipt.clone()
                });
            }
        }

        let account = state.accounts.entry(call.user_id.clone()).or_default();
        if !account.balance.debit_fungible(call.amount) {
            return Err(BankError::new(
                BankErrorKind::InsufficientFunds,
                format!(
                    "Insufficient coins: have {}, need {}",
                    account.balance.troll_coins(),
                    call.amount
                ),
            ));
        }

        let receipt = SpendReceipt {
            success: true,
            new_balance: Some(account.balance.troll_coins()),
            error: None,
            replayed: false,
        };

        if let Some(key) = call.idempotency_key {
            state.spend_replays.insert(key, receipt.clone());
        }

        Ok(receipt)
    }

    async fn credit(&self, call: CreditCall) -> BankResult<CreditReceipt> {
        self.credit_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        self.drift_error()?;

        let mut state = self.state.lock();
        if let Some(key) = &call.idempotency_key {
            if let Some(receipt) = state.credit_replays.get(key) {
                return Ok(CreditReceipt {
                    replayed: true,
                    ..*receipt
                });
            }
        }

        let account = state.accounts.entry(call.user_id.clone()).or_default();

        let repay = if call.bucket == Bucket::Paid && account.loan_outstanding > 0 {
            (call.amount * LOAN_REPAYMENT_PERCENT / 100).min(account.loan_outstanding)
        } else {
            0
        };
        account.loan_outstanding -= repay;

        let user_gets = call.amount - repay;
        account.balance.credit(call.bucket, user_gets);

        let receipt = CreditReceipt {
            user_gets,
            repay,
            new_balance: Some(account.balance.troll_coins()),
            replayed: false,
        };

        if let Some(key) = call.idempotency_key {
            state.credit_replays.insert(key, receipt);
        }

        Ok(receipt)
    }

    async fn legacy_deduct(
        &self,
        user_id: &UserId,
        amount: u64,
        coin_type: CoinType,
    ) -> BankResult<LegacyReceipt> {
        self.legacy_deduct_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;

        let mut state = self.state.lock();
        let account = state.accounts.entry(user_id.clone()).or_default();

        let applied = match coin_type {
            CoinType::TrollCoins => account.balance.debit_fungible(amount),
            CoinType::Trollmonds if account.balance.trollmonds >= amount => {
                account.balance.trollmonds -= amount;
                true
            }
            CoinType::Trollmonds => false,
        };

        if !applied {
            return Err(BankError::new(
                BankErrorKind::InsufficientFunds,
                format!("Insufficient {}", coin_type),
            ));
        }

        Ok(LegacyReceipt {
            new_balance: account.balance.of(coin_type),
        })
    }

    async fn legacy_credit_by_update(
        &self,
        user_id: &UserId,
        coin_type: CoinType,
        new_total: u64,
    ) -> BankResult<()> {
        self.legacy_update_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;

        let mut state = self.state.lock();
        let balance = &mut state.accounts.entry(user_id.clone()).or_default().balance;

        match coin_type {
            CoinType::Trollmonds => balance.trollmonds = new_total,
            CoinType::TrollCoins => {
                let current = balance.troll_coins();
                if new_total >= current {
                    balance.promo += new_total - current;
                } else {
                    balance.debit_fungible(current - new_total);
                }
            }
        }

        Ok(())
    }

    async fn balance(&self, user_id: &UserId) -> BankResult<CoinBalance> {
        self.injected_failure()?;
        Ok(self.peek(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    fn spend_call(user: &UserId, amount: u64, key: Option<&str>) -> SpendCall {
        SpendCall {
            user_id: user.clone(),
            amount,
            bucket: Bucket::Paid,
            source: "purchase".to_string(),
            ref_id: None,
            idempotency_key: key.map(str::to_string),
            metadata: Metadata::new(),
        }
    }

    fn credit_call(user: &UserId, amount: u64, bucket: Bucket) -> CreditCall {
        CreditCall {
            user_id: user.clone(),
            amount,
            bucket,
            source: "purchase".to_string(),
            ref_id: None,
            idempotency_key: None,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_spend_and_insufficient_funds() {
        let bank = SimulatedBank::new();
        let user = UserId::new("u1");
        bank.deposit(&user, Bucket::Paid, 100);

        let receipt = bank.secure_spend(spend_call(&user, 60, None)).await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.new_balance, Some(40));

        let err = bank.secure_spend(spend_call(&user, 41, None)).await.unwrap_err();
        assert_eq!(err.kind, BankErrorKind::InsufficientFunds);
        assert_eq!(bank.peek(&user).troll_coins(), 40);
    }

    #[tokio::test]
    async fn test_idempotent_spend_replays() {
        let bank = SimulatedBank::new();
        let user = UserId::new("u1");
        bank.deposit(&user, Bucket::Paid, 100);

        let first = bank.secure_spend(spend_call(&user, 30, Some("k1"))).await.unwrap();
        let second = bank.secure_spend(spend_call(&user, 30, Some("k1"))).await.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.new_balance, second.new_balance);
        assert_eq!(bank.peek(&user).troll_coins(), 70);
    }

    #[tokio::test]
    async fn test_loan_repayment_on_paid_credit() {
        let bank = SimulatedBank::new();
        let user = UserId::new("u1");
        bank.grant_loan(&user, 30);

        let receipt = bank.credit(credit_call(&user, 100, Bucket::Paid)).await.unwrap();
        assert_eq!(receipt.repay, 30);
        assert_eq!(receipt.user_gets, 70);
        assert_eq!(bank.loan_outstanding(&user), 0);

        // Promo credits are never garnished
        bank.grant_loan(&user, 10);
        let receipt = bank.credit(credit_call(&user, 100, Bucket::Promo)).await.unwrap();
        assert_eq!(receipt.repay, 0);
    }

    #[tokio::test]
    async fn test_schema_drift_only_hits_secure_rpcs() {
        let bank = SimulatedBank::new();
        let user = UserId::new("u1");
        bank.deposit(&user, Bucket::Paid, 10);
        bank.set_schema_drift(true);

        let err = bank.secure_spend(spend_call(&user, 5, None)).await.unwrap_err();
        assert!(err.is_schema_drift());

        let receipt = bank.legacy_deduct(&user, 5, CoinType::TrollCoins).await.unwrap();
        assert_eq!(receipt.new_balance, 5);
    }
}
