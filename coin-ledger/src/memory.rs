//! In-memory ledger and outbox store
//!
//! Used for tests and for embedding the ledger without a data directory.
//! Can emulate a legacy schema whose `coin_type` enumeration only knows
//! `paid`/`free`, and can be told to fail appends.

use crate::{
    error::{Error, Result},
    outbox::{OutboxRecord, OutboxStatus},
    store::{check_coin_type_column, LedgerStore, OutboxStore},
    types::{LedgerEntry, UserId},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

const CURRENT_COIN_TYPES: [&str; 4] = ["troll_coins", "trollmonds", "paid", "free"];
const LEGACY_COIN_TYPES: [&str; 2] = ["paid", "free"];

#[derive(Debug, Default)]
struct Tables {
    entries: BTreeMap<Uuid, LedgerEntry>,
    outbox: BTreeMap<Uuid, OutboxRecord>,
    pending: BTreeSet<(DateTime<Utc>, Uuid)>,
}

impl Tables {
    fn put_outbox(&mut self, record: &OutboxRecord) {
        if let Some(previous) = self.outbox.insert(record.id, record.clone()) {
            self.pending.remove(&(previous.next_attempt_at, previous.id));
        }
        if record.status == OutboxStatus::Pending {
            self.pending.insert((record.next_attempt_at, record.id));
        }
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    legacy_schema: AtomicBool,
    fail_appends: AtomicBool,
    append_attempts: AtomicUsize,
}

impl MemoryStore {
    /// Empty store with the current schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store whose `coin_type` column only accepts legacy tags
    pub fn with_legacy_schema() -> Self {
        let store = Self::default();
        store.legacy_schema.store(true, Ordering::SeqCst);
        store
    }

    /// Make every following append fail with a storage error
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Number of append calls, successful or not
    pub fn append_attempts(&self) -> usize {
        self.append_attempts.load(Ordering::SeqCst)
    }

    /// Number of stored entries
    pub fn entry_count(&self) -> usize {
        self.tables.read().entries.len()
    }
}

impl LedgerStore for MemoryStore {
    fn append(&self, entry: &LedgerEntry, effects: &[OutboxRecord]) -> Result<()> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);

        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::Storage("append disabled".to_string()));
        }

        let accepted: &[&str] = if self.legacy_schema.load(Ordering::SeqCst) {
            &LEGACY_COIN_TYPES
        } else {
            &CURRENT_COIN_TYPES
        };
        check_coin_type_column(&entry.coin_type, accepted)?;

        let mut tables = self.tables.write();
        if tables.entries.contains_key(&entry.entry_id) {
            return Err(Error::ConstraintViolation {
                column: "entry_id".to_string(),
                detail: format!("duplicate key {}", entry.entry_id),
            });
        }

        tables.entries.insert(entry.entry_id, entry.clone());
        for record in effects {
            tables.put_outbox(record);
        }

        Ok(())
    }

    fn entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        self.tables
            .read()
            .entries
            .get(&entry_id)
            .cloned()
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))
    }

    fn entries_for_user(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .tables
            .read()
            .entries
            .values()
            .filter(|e| &e.user_id == user_id)
            .cloned()
            .collect())
    }
}

impl OutboxStore for MemoryStore {
    fn enqueue(&self, records: &[OutboxRecord]) -> Result<()> {
        let mut tables = self.tables.write();
        for record in records {
            tables.put_outbox(record);
        }
        Ok(())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .pending
            .iter()
            .take_while(|(due_at, _)| *due_at <= now)
            .filter_map(|(_, id)| tables.outbox.get(id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn update(&self, record: &OutboxRecord) -> Result<()> {
        self.tables.write().put_outbox(record);
        Ok(())
    }

    fn records(&self) -> Result<Vec<OutboxRecord>> {
        Ok(self.tables.read().outbox.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::SideEffect;

    fn task_record(coins: u64) -> OutboxRecord {
        OutboxRecord::pending(
            SideEffect::TaskProgress {
                user_id: UserId::new("alice"),
                coins,
            },
            None,
        )
    }

    #[test]
    fn test_due_follows_schedule_and_skips_settled_records() {
        let store = MemoryStore::new();
        let records: Vec<_> = (1..=3).map(task_record).collect();
        store.enqueue(&records).unwrap();

        let mut delivered = records[0].clone();
        delivered.status = OutboxStatus::Delivered;
        store.update(&delivered).unwrap();

        let mut later = records[1].clone();
        later.next_attempt_at = Utc::now() + chrono::Duration::minutes(5);
        store.update(&later).unwrap();

        let due = store.due(Utc::now(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, records[2].id);

        let due = store.due(Utc::now() + chrono::Duration::minutes(10), 10).unwrap();
        assert_eq!(due.iter().map(|r| r.id).collect::<Vec<_>>(), vec![records[2].id, later.id]);
        assert_eq!(store.records().unwrap().len(), 3);
    }
}
