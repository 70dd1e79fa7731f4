//! Storage traits consumed by the ledger
//!
//! The ledger never updates or deletes entries; `LedgerStore` only offers an
//! append. Outbox records are the one mutable row kind (delivery state).

use crate::outbox::OutboxRecord;
use crate::types::{LedgerEntry, UserId};
use crate::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Append-only ledger storage
pub trait LedgerStore: Send + Sync {
    /// Append an entry together with the outbox records it produced.
    ///
    /// Either everything is written or nothing is.
    fn append(&self, entry: &LedgerEntry, effects: &[OutboxRecord]) -> Result<()>;

    /// Get entry by ID
    fn entry(&self, entry_id: Uuid) -> Result<LedgerEntry>;

    /// All entries owned by a user, oldest first
    fn entries_for_user(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>>;
}

/// Outbox storage
pub trait OutboxStore: Send + Sync {
    /// Enqueue records outside of a ledger append
    fn enqueue(&self, records: &[OutboxRecord]) -> Result<()>;

    /// Pending records due at `now`, oldest first
    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Persist a record's new delivery state
    fn update(&self, record: &OutboxRecord) -> Result<()>;

    /// Every record, oldest first
    fn records(&self) -> Result<Vec<OutboxRecord>>;
}

/// Column value check shared by the stores: the `coin_type` column is an
/// enumeration.
pub(crate) fn check_coin_type_column(tag: &str, accepted: &[&str]) -> Result<()> {
    if accepted.contains(&tag) {
        Ok(())
    } else {
        Err(crate::Error::ConstraintViolation {
            column: "coin_type".to_string(),
            detail: format!("invalid input value for enum coin_type: \"{}\"", tag),
        })
    }
}
