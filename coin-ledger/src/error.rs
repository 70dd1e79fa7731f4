//! Error types for the coin ledger

use crate::bank::{BankError, BankErrorKind};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Amount is zero, negative or out of range
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// No resolvable acting user
    #[error("Unauthenticated: no acting user")]
    Unauthenticated,

    /// Bank unreachable
    #[error("No bank connection: {0}")]
    NoBankConnection(String),

    /// Bank declined the mutation
    #[error("Bank rejected: {0}")]
    BankRejected(String),

    /// Bank reported insufficient funds
    #[error("Insufficient funds: required {required}, available {available:?}")]
    InsufficientFunds {
        /// Amount requested
        required: u64,
        /// Balance reported by the bank, when it said
        available: Option<u64>,
    },

    /// Storage rejected a row on a schema constraint
    #[error("Constraint violation on {column}: {detail}")]
    ConstraintViolation {
        /// Column that rejected the value
        column: String,
        /// Backend detail
        detail: String,
    },

    /// Ledger entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error was raised before any external call was made
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::InvalidAmount(_) | Error::Unauthenticated)
    }
}

impl Error {
    /// Surface a bank failure for a mutation of `required` coins.
    ///
    /// Schema drift only reaches this point when the legacy path failed too,
    /// so it is reported as a rejection.
    pub fn from_bank(err: BankError, required: u64) -> Self {
        match err.kind {
            BankErrorKind::InsufficientFunds => Error::InsufficientFunds {
                required,
                available: None,
            },
            BankErrorKind::Unavailable => Error::NoBankConnection(err.message),
            BankErrorKind::Rejected | BankErrorKind::SchemaDrift => {
                Error::BankRejected(err.message)
            }
        }
    }
}

impl From<BankError> for Error {
    fn from(err: BankError) -> Self {
        Error::from_bank(err, 0)
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Other(format!("metrics: {}", err))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
