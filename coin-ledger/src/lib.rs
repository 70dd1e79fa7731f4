//! Troll City Coin Ledger
//!
//! Orchestration layer in front of the authoritative coin bank.
//!
//! # Architecture
//!
//! - **Bank is the source of truth**: every mutation is one bank call; this
//!   crate never decides a balance on its own
//! - **Append-only ledger**: one immutable row per committed mutation
//! - **Outbox**: family/task/war side effects are written with the ledger row
//!   and delivered at least once by a dispatcher actor
//! - **Advisory cache**: balance snapshots for display, never for guards
//!
//! # Invariants
//!
//! - Non-positive amounts never reach the bank
//! - A committed bank mutation is never reported as a failure
//! - Ledger rows are never updated or deleted
//! - Side-effect failures never fail a credit

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod bank;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod metrics;
pub mod mutator;
pub mod outbox;
pub mod recorder;
pub mod service;
pub mod sim;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use bank::{Bank, BankError, BankErrorKind, BankResult};
pub use cache::{BalanceCache, BalanceSnapshot, BalanceUpdate};
pub use config::Config;
pub use dispatcher::{FamilySink, Sinks, TaskSink, TracingSink, WarSink};
pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use metadata::Metadata;
pub use mutator::{
    BalanceMutator, CreditOutcome, CreditRequest, MutationPath, SpendOutcome, SpendRequest,
};
pub use recorder::{HistoryQuery, LedgerRecorder, RecordRequest};
pub use service::CoinLedger;
pub use sim::SimulatedBank;
pub use storage::Storage;
pub use types::{
    Bucket, CoinBalance, CoinType, FamilyId, LedgerEntry, Session, TransactionType, UserId,
};
