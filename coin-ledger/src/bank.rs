//! Authoritative bank boundary
//!
//! The bank performs the actual atomic balance mutation and is the source of
//! truth for every balance. This module only describes the calls the ledger
//! makes and the typed failures it expects back.

use crate::metadata::Metadata;
use crate::types::{Bucket, CoinBalance, CoinType, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure category reported by the bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BankErrorKind {
    /// Bank schema does not match what this layer expects (version skew)
    SchemaDrift,
    /// Not enough coins
    InsufficientFunds,
    /// Declined for any other business reason
    Rejected,
    /// Bank could not be reached or timed out; outcome unknown
    Unavailable,
}

/// Typed bank failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankError {
    /// Category
    pub kind: BankErrorKind,
    /// Backend message
    pub message: String,
}

impl BankError {
    /// New error
    pub fn new(kind: BankErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a raw backend failure.
    ///
    /// Adapters for backends that only report SQL state codes and text call
    /// this once at the boundary so the ledger itself only ever looks at
    /// `kind`. Postgres `42703` is `undefined_column`.
    pub fn from_backend(code: Option<&str>, message: &str) -> Self {
        let lower = message.to_lowercase();
        let missing_column = code == Some("42703")
            || (lower.contains("column") && lower.contains("does not exist"));

        let kind = if missing_column && lower.contains("coins") {
            BankErrorKind::SchemaDrift
        } else if lower.contains("insufficient") {
            BankErrorKind::InsufficientFunds
        } else if code == Some("57014") || lower.contains("timeout") || lower.contains("connection") {
            BankErrorKind::Unavailable
        } else {
            BankErrorKind::Rejected
        };

        Self::new(kind, message)
    }

    /// Whether the fallback to legacy RPCs applies
    pub fn is_schema_drift(&self) -> bool {
        self.kind == BankErrorKind::SchemaDrift
    }
}

impl fmt::Display for BankError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BankError {}

/// Result type for bank calls
pub type BankResult<T> = std::result::Result<T, BankError>;

/// Secure spend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendCall {
    /// User whose coins are spent
    pub user_id: UserId,
    /// Positive amount
    pub amount: u64,
    /// Bucket label the bank accounts the spend against
    pub bucket: Bucket,
    /// Accounting source tag (transaction type)
    pub source: String,
    /// Reference id
    pub ref_id: Option<String>,
    /// Caller-supplied idempotency key
    pub idempotency_key: Option<String>,
    /// Metadata
    pub metadata: Metadata,
}

/// Secure spend result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendReceipt {
    /// Whether the bank applied the spend
    pub success: bool,
    /// Fungible balance after the spend
    pub new_balance: Option<u64>,
    /// Reason when `success` is false
    pub error: Option<String>,
    /// Result of an earlier call with the same idempotency key
    #[serde(default)]
    pub replayed: bool,
}

/// Credit call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditCall {
    /// User to credit
    pub user_id: UserId,
    /// Positive amount requested
    pub amount: u64,
    /// Target bucket
    pub bucket: Bucket,
    /// Accounting source tag (transaction type)
    pub source: String,
    /// Reference id
    pub ref_id: Option<String>,
    /// Caller-supplied idempotency key
    pub idempotency_key: Option<String>,
    /// Metadata
    pub metadata: Metadata,
}

/// Credit result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReceipt {
    /// Coins the user actually receives
    pub user_gets: u64,
    /// Coins withheld to repay an outstanding loan
    pub repay: u64,
    /// Fungible balance after the credit, when reported
    pub new_balance: Option<u64>,
    /// Result of an earlier call with the same idempotency key
    #[serde(default)]
    pub replayed: bool,
}

/// Legacy deduction result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyReceipt {
    /// Balance of the coin type after the deduction
    pub new_balance: u64,
}

/// Authoritative bank operations
#[async_trait]
pub trait Bank: Send + Sync {
    /// Atomically spend fungible coins
    async fn secure_spend(&self, call: SpendCall) -> BankResult<SpendReceipt>;

    /// Atomically credit coins into a bucket; the bank may withhold part of
    /// the amount for loan repayment
    async fn credit(&self, call: CreditCall) -> BankResult<CreditReceipt>;

    /// Legacy per-type deduction; logs internally
    async fn legacy_deduct(
        &self,
        user_id: &UserId,
        amount: u64,
        coin_type: CoinType,
    ) -> BankResult<LegacyReceipt>;

    /// Legacy overwrite of a coin type's total
    async fn legacy_credit_by_update(
        &self,
        user_id: &UserId,
        coin_type: CoinType,
        new_total: u64,
    ) -> BankResult<()>;

    /// Fresh balance read
    async fn balance(&self, user_id: &UserId) -> BankResult<CoinBalance>;
}
