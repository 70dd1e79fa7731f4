//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `entries` - Append-only ledger entries (key: entry_id)
//! - `user_index` - Entries per user (key: user prefix || entry_id)
//! - `outbox` - Side-effect outbox (key: record id)
//! - `outbox_pending` - Pending outbox records (key: due millis || record id)
//! - `gift_inventory` - Gift inventory rows (key chosen by the gift exchange)
//! - `gift_transfers` - Gift transfer rows (key chosen by the gift exchange)
//! - `gift_bonus_log` - Creator bonus log (key chosen by the gift exchange)
//!
//! Rows are JSON encoded; metadata is free-form and must stay readable by
//! other tooling.
//!
//! A user prefix is the user id's byte length as a big-endian u32 followed by
//! the id itself, so no user's keys can start with another user's prefix.

use crate::{
    error::{Error, Result},
    outbox::{OutboxRecord, OutboxStatus},
    store::{check_coin_type_column, LedgerStore, OutboxStore},
    types::{LedgerEntry, UserId},
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
pub const CF_ENTRIES: &str = "entries";
/// Per-user entry index
pub const CF_USER_INDEX: &str = "user_index";
/// Side-effect outbox
pub const CF_OUTBOX: &str = "outbox";
/// Pending outbox records ordered by due time
pub const CF_OUTBOX_PENDING: &str = "outbox_pending";
/// Gift inventory rows
pub const CF_GIFT_INVENTORY: &str = "gift_inventory";
/// Gift transfer rows
pub const CF_GIFT_TRANSFERS: &str = "gift_transfers";
/// Creator bonus log rows
pub const CF_GIFT_BONUS_LOG: &str = "gift_bonus_log";

const ACCEPTED_COIN_TYPES: [&str; 4] = ["troll_coins", "trollmonds", "paid", "free"];

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_compressed()),
            ColumnFamilyDescriptor::new(CF_USER_INDEX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_OUTBOX, Options::default()),
            ColumnFamilyDescriptor::new(CF_OUTBOX_PENDING, Options::default()),
            ColumnFamilyDescriptor::new(CF_GIFT_INVENTORY, Options::default()),
            ColumnFamilyDescriptor::new(CF_GIFT_TRANSFERS, Self::cf_options_compressed()),
            ColumnFamilyDescriptor::new(CF_GIFT_BONUS_LOG, Self::cf_options_compressed()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB coin ledger");

        let storage = Self { db: Arc::new(db) };
        storage.rebuild_pending_index()?;
        Ok(storage)
    }

    // Column family options

    fn cf_options_compressed() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Generic JSON row helpers (also used by the gift exchange)

    /// Put a JSON row
    pub fn put_json<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let handle = self.cf_handle(cf)?;
        let bytes = serde_json::to_vec(value)?;
        self.db.put_cf(handle, key, bytes)?;
        Ok(())
    }

    /// Put several JSON rows in one write batch
    pub fn put_json_batch<T: Serialize>(&self, cf: &str, rows: &[(Vec<u8>, T)]) -> Result<()> {
        let handle = self.cf_handle(cf)?;
        let mut batch = WriteBatch::default();
        for (key, value) in rows {
            batch.put_cf(handle, key, serde_json::to_vec(value)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Get a JSON row
    pub fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf_handle(cf)?;
        match self.db.get_cf(handle, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete a row
    pub fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        let handle = self.cf_handle(cf)?;
        self.db.delete_cf(handle, key)?;
        Ok(())
    }

    /// All JSON rows whose key starts with `prefix`, in key order
    pub fn scan_prefix_json<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let handle = self.cf_handle(cf)?;
        let mut rows = Vec::new();

        for item in self.db.prefix_iterator_cf(handle, prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push(serde_json::from_slice(&value)?);
        }

        Ok(rows)
    }

    // Index key helpers

    /// Key prefix owned by exactly one user
    pub fn user_key_prefix(user_id: &UserId) -> Vec<u8> {
        let id = user_id.as_str().as_bytes();
        let len = u32::try_from(id.len()).unwrap_or(u32::MAX);
        let mut key = Vec::with_capacity(4 + id.len() + 16);
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(id);
        key
    }

    fn index_key_user_entry(user_id: &UserId, entry_id: Option<Uuid>) -> Vec<u8> {
        let mut key = Self::user_key_prefix(user_id);
        if let Some(id) = entry_id {
            key.extend_from_slice(id.as_bytes());
        }
        key
    }

    fn pending_key(record: &OutboxRecord) -> Vec<u8> {
        let due_ms = u64::try_from(record.next_attempt_at.timestamp_millis()).unwrap_or(0);
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&due_ms.to_be_bytes());
        key.extend_from_slice(record.id.as_bytes());
        key
    }

    fn split_pending_key(key: &[u8]) -> Option<(u64, Uuid)> {
        let due_ms: [u8; 8] = key.get(..8)?.try_into().ok()?;
        let id: [u8; 16] = key.get(8..)?.try_into().ok()?;
        Some((u64::from_be_bytes(due_ms), Uuid::from_bytes(id)))
    }

    /// Stage outbox rows and their pending index entries
    fn stage_outbox(&self, batch: &mut WriteBatch, records: &[OutboxRecord]) -> Result<()> {
        let cf_outbox = self.cf_handle(CF_OUTBOX)?;
        let cf_pending = self.cf_handle(CF_OUTBOX_PENDING)?;
        for record in records {
            batch.put_cf(cf_outbox, record.id.as_bytes(), serde_json::to_vec(record)?);
            if record.status == OutboxStatus::Pending {
                batch.put_cf(cf_pending, Self::pending_key(record), b"");
            }
        }
        Ok(())
    }

    /// Index pending records of an outbox written before the index existed
    fn rebuild_pending_index(&self) -> Result<()> {
        let cf_pending = self.cf_handle(CF_OUTBOX_PENDING)?;
        if self
            .db
            .iterator_cf(cf_pending, IteratorMode::Start)
            .next()
            .is_some()
        {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        let mut indexed = 0usize;
        for record in self.records()? {
            if record.status == OutboxStatus::Pending {
                batch.put_cf(cf_pending, Self::pending_key(&record), b"");
                indexed += 1;
            }
        }

        if indexed > 0 {
            self.db.write(batch)?;
            tracing::info!(indexed, "Outbox pending index rebuilt");
        }
        Ok(())
    }

    /// Records currently in the pending index
    pub fn pending_len(&self) -> Result<usize> {
        let cf_pending = self.cf_handle(CF_OUTBOX_PENDING)?;
        let mut len = 0;
        for item in self.db.iterator_cf(cf_pending, IteratorMode::Start) {
            item?;
            len += 1;
        }
        Ok(len)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

impl LedgerStore for Storage {
    fn append(&self, entry: &LedgerEntry, effects: &[OutboxRecord]) -> Result<()> {
        check_coin_type_column(&entry.coin_type, &ACCEPTED_COIN_TYPES)?;

        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let entry_key = entry.entry_id.as_bytes();

        if self.db.get_pinned_cf(cf_entries, entry_key)?.is_some() {
            return Err(Error::ConstraintViolation {
                column: "entry_id".to_string(),
                detail: format!("duplicate key {}", entry.entry_id),
            });
        }

        let mut batch = WriteBatch::default();

        // 1. Entry
        batch.put_cf(cf_entries, entry_key, serde_json::to_vec(entry)?);

        // 2. Index: user prefix || entry_id -> empty
        let cf_index = self.cf_handle(CF_USER_INDEX)?;
        let idx = Self::index_key_user_entry(&entry.user_id, Some(entry.entry_id));
        batch.put_cf(cf_index, idx, b"");

        // 3. Outbox and pending index
        self.stage_outbox(&mut batch, effects)?;

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(
            entry_id = %entry.entry_id,
            user_id = %entry.user_id,
            effects = effects.len(),
            "Ledger entry appended"
        );

        Ok(())
    }

    fn entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        self.get_json(CF_ENTRIES, entry_id.as_bytes())?
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))
    }

    fn entries_for_user(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>> {
        let cf_index = self.cf_handle(CF_USER_INDEX)?;
        let prefix = Self::index_key_user_entry(user_id, None);

        let mut entries = Vec::new();
        for item in self.db.prefix_iterator_cf(cf_index, &prefix) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }

            // Extract entry_id from key suffix
            let Ok(id_bytes) = <[u8; 16]>::try_from(&key[prefix.len()..]) else {
                tracing::warn!(user_id = %user_id, "Skipping malformed index key");
                continue;
            };
            entries.push(self.entry(Uuid::from_bytes(id_bytes))?);
        }

        Ok(entries)
    }
}

impl OutboxStore for Storage {
    fn enqueue(&self, records: &[OutboxRecord]) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_outbox(&mut batch, records)?;
        self.db.write(batch)?;
        Ok(())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxRecord>> {
        let cf_pending = self.cf_handle(CF_OUTBOX_PENDING)?;
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        let mut due = Vec::new();

        // Index keys sort by due time; stop at the first one in the future
        for item in self.db.iterator_cf(cf_pending, IteratorMode::Start) {
            if due.len() >= limit {
                break;
            }
            let (key, _) = item?;
            let Some((due_ms, id)) = Self::split_pending_key(&key) else {
                tracing::warn!("Skipping malformed outbox index key");
                continue;
            };
            if due_ms > now_ms {
                break;
            }

            match self.get_json::<OutboxRecord>(CF_OUTBOX, id.as_bytes())? {
                Some(record) if record.is_due(now) => due.push(record),
                _ => {}
            }
        }

        Ok(due)
    }

    fn update(&self, record: &OutboxRecord) -> Result<()> {
        let cf_pending = self.cf_handle(CF_OUTBOX_PENDING)?;
        let mut batch = WriteBatch::default();

        if let Some(previous) = self.get_json::<OutboxRecord>(CF_OUTBOX, record.id.as_bytes())? {
            batch.delete_cf(cf_pending, Self::pending_key(&previous));
        }
        self.stage_outbox(&mut batch, std::slice::from_ref(record))?;

        self.db.write(batch)?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<OutboxRecord>> {
        self.scan_prefix_json(CF_OUTBOX, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::outbox::SideEffect;
    use crate::types::TransactionType;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn test_entry(user: &str, amount: i64) -> LedgerEntry {
        LedgerEntry {
            entry_id: Uuid::now_v7(),
            user_id: UserId::new(user),
            claimed_user_id: None,
            amount,
            transaction_type: TransactionType::Purchase,
            coin_type: "troll_coins".to_string(),
            bucket: None,
            source_ref: None,
            description: None,
            metadata: Metadata::new().with("k", "v"),
            balance_after: Some(0),
            platform_profit: None,
            liability: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        assert!(storage.cf_handle(CF_ENTRIES).is_ok());
        assert!(storage.cf_handle(CF_GIFT_INVENTORY).is_ok());
    }

    #[test]
    fn test_append_and_get_entry() {
        let (storage, _temp) = test_storage();
        let entry = test_entry("alice", -100);

        storage.append(&entry, &[]).unwrap();

        let retrieved = storage.entry(entry.entry_id).unwrap();
        assert_eq!(retrieved, entry);
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let (storage, _temp) = test_storage();
        let entry = test_entry("alice", -100);

        storage.append(&entry, &[]).unwrap();
        let err = storage.append(&entry, &[]).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { ref column, .. } if column == "entry_id"));
    }

    #[test]
    fn test_unknown_coin_type_rejected() {
        let (storage, _temp) = test_storage();
        let mut entry = test_entry("alice", 5);
        entry.coin_type = "gold".to_string();

        assert!(storage.append(&entry, &[]).is_err());
        assert!(storage.entries_for_user(&UserId::new("alice")).unwrap().is_empty());
    }

    #[test]
    fn test_entries_for_user_scoped_by_prefix() {
        let (storage, _temp) = test_storage();

        for _ in 0..3 {
            storage.append(&test_entry("alice", 10), &[]).unwrap();
        }
        storage.append(&test_entry("alicea", 10), &[]).unwrap();

        let entries = storage.entries_for_user(&UserId::new("alice")).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].entry_id < w[1].entry_id));
    }

    #[test]
    fn test_append_with_outbox_is_atomic() {
        let (storage, _temp) = test_storage();
        let entry = test_entry("alice", 50);
        let record = OutboxRecord::pending(
            SideEffect::TaskProgress {
                user_id: UserId::new("alice"),
                coins: 50,
            },
            Some(entry.entry_id),
        );

        storage.append(&entry, std::slice::from_ref(&record)).unwrap();

        let due = storage.due(Utc::now(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].entry_id, Some(entry.entry_id));

        let mut delivered = due[0].clone();
        delivered.status = OutboxStatus::Delivered;
        storage.update(&delivered).unwrap();

        assert!(storage.due(Utc::now(), 10).unwrap().is_empty());
        assert_eq!(storage.records().unwrap().len(), 1);
    }

    fn task_record(user: &str, coins: u64) -> OutboxRecord {
        OutboxRecord::pending(
            SideEffect::TaskProgress {
                user_id: UserId::new(user),
                coins,
            },
            None,
        )
    }

    #[test]
    fn test_prefix_sharing_user_ids_stay_apart() {
        let (storage, _temp) = test_storage();

        storage.append(&test_entry("a", 1), &[]).unwrap();
        storage.append(&test_entry("a|b", 2), &[]).unwrap();
        storage.append(&test_entry("a|", 3), &[]).unwrap();

        let a = storage.entries_for_user(&UserId::new("a")).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].amount, 1);

        let ab = storage.entries_for_user(&UserId::new("a|b")).unwrap();
        assert_eq!(ab.len(), 1);
        assert_eq!(ab[0].amount, 2);

        let a_prefix = Storage::user_key_prefix(&UserId::new("a"));
        assert!(!Storage::user_key_prefix(&UserId::new("a|b")).starts_with(&a_prefix));
    }

    #[test]
    fn test_due_reads_only_pending_records() {
        let (storage, _temp) = test_storage();

        let records: Vec<_> = (0..200).map(|i| task_record("alice", i)).collect();
        storage.enqueue(&records).unwrap();
        assert_eq!(storage.pending_len().unwrap(), 200);

        for record in &records[..199] {
            let mut delivered = record.clone();
            delivered.attempts = 1;
            delivered.status = OutboxStatus::Delivered;
            storage.update(&delivered).unwrap();
        }

        // Delivered rows stay for audit but leave the index
        assert_eq!(storage.records().unwrap().len(), 200);
        assert_eq!(storage.pending_len().unwrap(), 1);

        let due = storage.due(Utc::now(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, records[199].id);
    }

    #[test]
    fn test_rescheduled_record_waits_for_its_time() {
        let (storage, _temp) = test_storage();
        let early = task_record("alice", 1);
        let mut later = task_record("bob", 2);
        storage.enqueue(&[early.clone(), later.clone()]).unwrap();

        later.attempts = 1;
        later.next_attempt_at = Utc::now() + chrono::Duration::minutes(5);
        storage.update(&later).unwrap();
        assert_eq!(storage.pending_len().unwrap(), 2);

        let now = storage.due(Utc::now(), 10).unwrap();
        assert_eq!(now.len(), 1);
        assert_eq!(now[0].id, early.id);

        let future = storage
            .due(Utc::now() + chrono::Duration::minutes(10), 10)
            .unwrap();
        assert_eq!(future.len(), 2);
        assert_eq!(future[1].id, later.id);
    }

    #[test]
    fn test_pending_index_rebuilt_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let record = task_record("alice", 25);

        {
            let storage = Storage::open(&config).unwrap();
            storage.enqueue(std::slice::from_ref(&record)).unwrap();
            let cf_pending = storage.cf_handle(CF_OUTBOX_PENDING).unwrap();
            storage
                .db
                .delete_cf(cf_pending, Storage::pending_key(&record))
                .unwrap();
            assert_eq!(storage.pending_len().unwrap(), 0);
        }

        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.pending_len().unwrap(), 1);
        assert_eq!(storage.due(Utc::now(), 10).unwrap()[0].id, record.id);
    }
}
