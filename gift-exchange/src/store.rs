//! Inventory and transfer storage
//!
//! Inventory rows are mutable (quantities move); transfer and bonus rows are
//! append-only. Two implementations: [`MemoryGiftStore`] for tests and
//! embedding, and [`RocksGiftStore`] on top of the ledger's RocksDB column
//! families.

use crate::{
    bonus::BonusLog,
    types::{CreatorBonusRecord, GiftTransferRecord, InventoryRecord},
    Error, Result,
};
use chrono::Utc;
use coin_ledger::{
    storage::{CF_GIFT_BONUS_LOG, CF_GIFT_INVENTORY, CF_GIFT_TRANSFERS},
    Storage, UserId,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Gift inventory storage
pub trait InventoryStore: Send + Sync {
    /// Units of `slug` owned by `user_id` (0 when there is no row)
    fn quantity(&self, user_id: &UserId, slug: &str) -> Result<u64>;

    /// Add units, creating the row if needed; returns the new quantity
    fn add(&self, user_id: &UserId, slug: &str, quantity: u64) -> Result<u64>;

    /// Remove units, deleting the row at zero; returns what is left.
    ///
    /// Fails with `InsufficientInventory` and changes nothing when the row
    /// holds fewer than `quantity` units.
    fn remove(&self, user_id: &UserId, slug: &str, quantity: u64) -> Result<u64>;

    /// All rows owned by a user, by slug
    fn inventory(&self, user_id: &UserId) -> Result<Vec<InventoryRecord>>;
}

/// Append-only transfer storage
pub trait TransferStore: Send + Sync {
    /// Append rows; either all are written or none
    fn append(&self, records: &[GiftTransferRecord]) -> Result<()>;

    /// Rows owned by a user, oldest first
    fn transfers_for_user(&self, user_id: &UserId) -> Result<Vec<GiftTransferRecord>>;
}

fn record(user_id: &UserId, slug: &str, quantity: u64) -> InventoryRecord {
    InventoryRecord {
        user_id: user_id.clone(),
        gift_slug: slug.to_string(),
        quantity,
        updated_at: Utc::now(),
    }
}

#[derive(Debug, Default)]
struct Tables {
    inventory: BTreeMap<(UserId, String), InventoryRecord>,
    transfers: Vec<GiftTransferRecord>,
    bonuses: Vec<CreatorBonusRecord>,
}

/// In-memory gift store with fault injection
#[derive(Debug, Default)]
pub struct MemoryGiftStore {
    tables: RwLock<Tables>,
    fail_inventory_writes: AtomicBool,
    fail_transfer_writes: AtomicBool,
    fail_bonus_writes: AtomicBool,
}

impl MemoryGiftStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make inventory writes fail
    pub fn set_fail_inventory_writes(&self, fail: bool) {
        self.fail_inventory_writes.store(fail, Ordering::SeqCst);
    }

    /// Make transfer appends fail
    pub fn set_fail_transfer_writes(&self, fail: bool) {
        self.fail_transfer_writes.store(fail, Ordering::SeqCst);
    }

    /// Make bonus log appends fail
    pub fn set_fail_bonus_writes(&self, fail: bool) {
        self.fail_bonus_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored transfer rows
    pub fn transfer_count(&self) -> usize {
        self.tables.read().transfers.len()
    }

    fn check_inventory_writable(&self) -> Result<()> {
        if self.fail_inventory_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("inventory write failed (injected)".to_string()));
        }
        Ok(())
    }
}

impl InventoryStore for MemoryGiftStore {
    fn quantity(&self, user_id: &UserId, slug: &str) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .inventory
            .get(&(user_id.clone(), slug.to_string()))
            .map_or(0, |r| r.quantity))
    }

    fn add(&self, user_id: &UserId, slug: &str, quantity: u64) -> Result<u64> {
        self.check_inventory_writable()?;
        let mut tables = self.tables.write();
        let key = (user_id.clone(), slug.to_string());

        let existing = tables.inventory.get(&key).map_or(0, |r| r.quantity);
        let total = existing.saturating_add(quantity);
        if total > 0 {
            tables.inventory.insert(key, record(user_id, slug, total));
        }
        Ok(total)
    }

    fn remove(&self, user_id: &UserId, slug: &str, quantity: u64) -> Result<u64> {
        self.check_inventory_writable()?;
        let mut tables = self.tables.write();
        let key = (user_id.clone(), slug.to_string());

        let available = tables.inventory.get(&key).map_or(0, |r| r.quantity);
        if available < quantity {
            return Err(Error::InsufficientInventory {
                available,
                requested: quantity,
            });
        }

        let left = available - quantity;
        if left == 0 {
            tables.inventory.remove(&key);
        } else {
            tables.inventory.insert(key, record(user_id, slug, left));
        }
        Ok(left)
    }

    fn inventory(&self, user_id: &UserId) -> Result<Vec<InventoryRecord>> {
        Ok(self
            .tables
            .read()
            .inventory
            .values()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect())
    }
}

impl TransferStore for MemoryGiftStore {
    fn append(&self, records: &[GiftTransferRecord]) -> Result<()> {
        if self.fail_transfer_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("transfer write failed (injected)".to_string()));
        }
        self.tables.write().transfers.extend_from_slice(records);
        Ok(())
    }

    fn transfers_for_user(&self, user_id: &UserId) -> Result<Vec<GiftTransferRecord>> {
        Ok(self
            .tables
            .read()
            .transfers
            .iter()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect())
    }
}

impl BonusLog for MemoryGiftStore {
    fn record(&self, entry: &CreatorBonusRecord) -> Result<()> {
        if self.fail_bonus_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("bonus log write failed (injected)".to_string()));
        }
        self.tables.write().bonuses.push(entry.clone());
        Ok(())
    }

    fn bonuses_for_creator(&self, creator_id: &UserId) -> Result<Vec<CreatorBonusRecord>> {
        Ok(self
            .tables
            .read()
            .bonuses
            .iter()
            .filter(|r| &r.creator_id == creator_id)
            .cloned()
            .collect())
    }
}

/// Gift store in the ledger's RocksDB.
///
/// Inventory keys are the ledger's user prefix followed by the slug;
/// transfer and bonus keys are the user prefix followed by the row id.
/// Read-modify-write of inventory rows is serialised by a local lock.
pub struct RocksGiftStore {
    storage: Arc<Storage>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RocksGiftStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksGiftStore").finish_non_exhaustive()
    }
}

impl RocksGiftStore {
    /// Use the gift column families of `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    fn inventory_key(user_id: &UserId, slug: &str) -> Vec<u8> {
        let mut key = Storage::user_key_prefix(user_id);
        key.extend_from_slice(slug.as_bytes());
        key
    }

    fn row_key(user_id: &UserId, id: &Uuid) -> Vec<u8> {
        let mut key = Storage::user_key_prefix(user_id);
        key.extend_from_slice(id.to_string().as_bytes());
        key
    }

    fn read(&self, key: &[u8]) -> Result<Option<InventoryRecord>> {
        Ok(self.storage.get_json(CF_GIFT_INVENTORY, key)?)
    }
}

impl InventoryStore for RocksGiftStore {
    fn quantity(&self, user_id: &UserId, slug: &str) -> Result<u64> {
        let key = Self::inventory_key(user_id, slug);
        Ok(self.read(&key)?.map_or(0, |r| r.quantity))
    }

    fn add(&self, user_id: &UserId, slug: &str, quantity: u64) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let key = Self::inventory_key(user_id, slug);

        let existing = self.read(&key)?.map_or(0, |r| r.quantity);
        let total = existing.saturating_add(quantity);
        if total > 0 {
            self.storage
                .put_json(CF_GIFT_INVENTORY, &key, &record(user_id, slug, total))?;
        }
        Ok(total)
    }

    fn remove(&self, user_id: &UserId, slug: &str, quantity: u64) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let key = Self::inventory_key(user_id, slug);

        let available = self.read(&key)?.map_or(0, |r| r.quantity);
        if available < quantity {
            return Err(Error::InsufficientInventory {
                available,
                requested: quantity,
            });
        }

        let left = available - quantity;
        if left == 0 {
            self.storage.delete(CF_GIFT_INVENTORY, &key)?;
        } else {
            self.storage
                .put_json(CF_GIFT_INVENTORY, &key, &record(user_id, slug, left))?;
        }
        Ok(left)
    }

    fn inventory(&self, user_id: &UserId) -> Result<Vec<InventoryRecord>> {
        Ok(self
            .storage
            .scan_prefix_json(CF_GIFT_INVENTORY, &Storage::user_key_prefix(user_id))?)
    }
}

impl TransferStore for RocksGiftStore {
    fn append(&self, records: &[GiftTransferRecord]) -> Result<()> {
        let rows: Vec<(Vec<u8>, &GiftTransferRecord)> = records
            .iter()
            .map(|r| (Self::row_key(&r.user_id, &r.transfer_id), r))
            .collect();

        Ok(self.storage.put_json_batch(CF_GIFT_TRANSFERS, &rows)?)
    }

    fn transfers_for_user(&self, user_id: &UserId) -> Result<Vec<GiftTransferRecord>> {
        Ok(self
            .storage
            .scan_prefix_json(CF_GIFT_TRANSFERS, &Storage::user_key_prefix(user_id))?)
    }
}

impl BonusLog for RocksGiftStore {
    fn record(&self, entry: &CreatorBonusRecord) -> Result<()> {
        let key = Self::row_key(&entry.creator_id, &entry.bonus_id);
        Ok(self.storage.put_json(CF_GIFT_BONUS_LOG, &key, entry)?)
    }

    fn bonuses_for_creator(&self, creator_id: &UserId) -> Result<Vec<CreatorBonusRecord>> {
        Ok(self
            .storage
            .scan_prefix_json(CF_GIFT_BONUS_LOG, &Storage::user_key_prefix(creator_id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreatorBonus, TransferDirection};

    fn transfer(user: &str, counterparty: &str, direction: TransferDirection) -> GiftTransferRecord {
        GiftTransferRecord {
            transfer_id: Uuid::now_v7(),
            user_id: UserId::new(user),
            counterparty_id: UserId::new(counterparty),
            direction,
            gift_slug: "rose".to_string(),
            quantity: 1,
            coin_value: 1,
            broadcaster_earnings: 0,
            platform_portion: 1,
            context: None,
            tier: "common".to_string(),
            animation: None,
            created_at: Utc::now(),
        }
    }

    fn rocks_store() -> (RocksGiftStore, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = coin_ledger::Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let storage = Arc::new(Storage::open(&config).unwrap());
        (RocksGiftStore::new(storage), temp_dir)
    }

    fn exercise_inventory(store: &dyn InventoryStore) {
        let alice = UserId::new("alice");

        assert_eq!(store.quantity(&alice, "rose").unwrap(), 0);
        assert_eq!(store.add(&alice, "rose", 3).unwrap(), 3);
        assert_eq!(store.add(&alice, "rose", 2).unwrap(), 5);
        assert_eq!(store.remove(&alice, "rose", 4).unwrap(), 1);

        let err = store.remove(&alice, "rose", 2).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientInventory {
                available: 1,
                requested: 2
            }
        ));
        assert_eq!(store.quantity(&alice, "rose").unwrap(), 1);

        assert_eq!(store.remove(&alice, "rose", 1).unwrap(), 0);
        assert!(store.inventory(&alice).unwrap().is_empty());
    }

    fn exercise_prefix_sharing_users(store: &dyn InventoryStore) {
        let a = UserId::new("a");
        let a_b = UserId::new("a|b");

        store.add(&a, "b|rose", 2).unwrap();
        store.add(&a_b, "rose", 7).unwrap();

        assert_eq!(store.quantity(&a, "b|rose").unwrap(), 2);
        assert_eq!(store.quantity(&a_b, "rose").unwrap(), 7);

        let a_rows = store.inventory(&a).unwrap();
        assert_eq!(a_rows.len(), 1);
        assert_eq!(a_rows[0].gift_slug, "b|rose");
        assert_eq!(store.inventory(&a_b).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_inventory() {
        exercise_inventory(&MemoryGiftStore::new());
        exercise_prefix_sharing_users(&MemoryGiftStore::new());
    }

    #[test]
    fn test_rocks_inventory() {
        let (store, _dir) = rocks_store();
        exercise_inventory(&store);
    }

    #[test]
    fn test_rocks_prefix_sharing_users_stay_apart() {
        let (store, _dir) = rocks_store();
        exercise_prefix_sharing_users(&store);

        store
            .append(&[
                transfer("a", "bob", TransferDirection::Sent),
                transfer("a|b", "bob", TransferDirection::Sent),
            ])
            .unwrap();
        assert_eq!(store.transfers_for_user(&UserId::new("a")).unwrap().len(), 1);
        assert_eq!(store.transfers_for_user(&UserId::new("a|b")).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_add_zero_creates_no_row() {
        let store = MemoryGiftStore::new();
        let alice = UserId::new("alice");
        assert_eq!(store.add(&alice, "rose", 0).unwrap(), 0);
        assert!(store.inventory(&alice).unwrap().is_empty());
    }

    #[test]
    fn test_memory_injected_failures() {
        let store = MemoryGiftStore::new();
        let alice = UserId::new("alice");

        store.set_fail_inventory_writes(true);
        assert!(matches!(store.add(&alice, "rose", 1), Err(Error::Storage(_))));

        store.set_fail_transfer_writes(true);
        let rows = [transfer("alice", "bob", TransferDirection::Sent)];
        assert!(matches!(store.append(&rows), Err(Error::Storage(_))));
        assert_eq!(store.transfer_count(), 0);
    }

    #[test]
    fn test_rocks_transfers_scoped_by_user() {
        let (store, _dir) = rocks_store();
        store
            .append(&[
                transfer("alice", "bob", TransferDirection::Sent),
                transfer("bob", "alice", TransferDirection::Received),
                transfer("alice2", "bob", TransferDirection::Sent),
            ])
            .unwrap();

        let alice_rows = store.transfers_for_user(&UserId::new("alice")).unwrap();
        assert_eq!(alice_rows.len(), 1);
        assert_eq!(alice_rows[0].direction, TransferDirection::Sent);

        let bob_rows = store.transfers_for_user(&UserId::new("bob")).unwrap();
        assert_eq!(bob_rows.len(), 1);
        assert_eq!(bob_rows[0].counterparty_id, UserId::new("alice"));
    }

    #[test]
    fn test_rocks_inventory_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = coin_ledger::Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let alice = UserId::new("alice");

        {
            let store = RocksGiftStore::new(Arc::new(Storage::open(&config).unwrap()));
            store.add(&alice, "troll_crown", 2).unwrap();
        }

        let store = RocksGiftStore::new(Arc::new(Storage::open(&config).unwrap()));
        assert_eq!(store.quantity(&alice, "troll_crown").unwrap(), 2);
    }

    #[test]
    fn test_rocks_bonus_log_scoped_by_creator() {
        let (store, _dir) = rocks_store();
        let row = |creator: &str, base: u64| CreatorBonusRecord {
            bonus_id: Uuid::now_v7(),
            creator_id: UserId::new(creator),
            transfer_id: Uuid::now_v7(),
            sender_id: UserId::new("alice"),
            context: Some("stream".to_string()),
            bonus: CreatorBonus::compute(base, crate::types::DEFAULT_CREATOR_BONUS_SHARE),
            ledger_ref: None,
            created_at: Utc::now(),
        };

        store.record(&row("bob", 70)).unwrap();
        store.record(&row("bob", 700)).unwrap();
        store.record(&row("bobby", 70)).unwrap();

        let bob = store.bonuses_for_creator(&UserId::new("bob")).unwrap();
        assert_eq!(bob.len(), 2);
        assert!(bob
            .iter()
            .any(|r| r.bonus.bonus_amount == 70 && r.bonus.total_amount == 770));
    }
}
