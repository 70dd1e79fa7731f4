//! Error types for the gift exchange

use thiserror::Error;

/// Result type for gift operations
pub type Result<T> = std::result::Result<T, Error>;

/// Gift exchange errors
#[derive(Error, Debug)]
pub enum Error {
    /// Coin ledger error (spend/credit failures are surfaced verbatim)
    #[error("Ledger error: {0}")]
    Ledger(#[from] coin_ledger::Error),

    /// Slug not in the catalog
    #[error("Gift not found: {0}")]
    GiftNotFound(String),

    /// Sender owns fewer units than requested
    #[error("Insufficient inventory: available {available}, requested {requested}")]
    InsufficientInventory {
        /// Units owned
        available: u64,
        /// Units requested
        requested: u64,
    },

    /// Quantity zero or too large to price
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Sender or receiver missing
    #[error("Missing party: {0}")]
    MissingParty(String),

    /// Inventory or transfer storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration or catalog
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the request was rejected before anything moved
    pub fn is_precondition(&self) -> bool {
        match self {
            Error::GiftNotFound(_)
            | Error::InsufficientInventory { .. }
            | Error::InvalidQuantity(_)
            | Error::MissingParty(_) => true,
            Error::Ledger(inner) => inner.is_precondition(),
            _ => false,
        }
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
