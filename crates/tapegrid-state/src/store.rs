//! StateStore — redb-backed catalog for TapeGrid.
//!
//! Provides typed CRUD over devices, media, objects and layouts, atomic
//! resource locks, and the append-only hardware log. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tapegrid_core::{DeviceId, LockOwner, LockTarget, MediumId, epoch_secs};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe catalog backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent catalog at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "catalog opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory catalog (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory catalog opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [DEVICES, MEDIA, OBJECTS, LAYOUTS, LOCKS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(LOGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON records ───────────────────────────────────────

    fn put_record<T: Serialize>(&self, def: JsonTable, key: &str, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    fn delete_record(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device.
    pub fn put_device(&self, device: &DeviceInfo) -> StateResult<()> {
        let key = device.table_key();
        self.put_record(DEVICES, &key, device)?;
        debug!(%key, "device stored");
        Ok(())
    }

    pub fn get_device(&self, id: &DeviceId) -> StateResult<Option<DeviceInfo>> {
        self.get_record(DEVICES, &id.table_key())
    }

    pub fn list_devices(&self) -> StateResult<Vec<DeviceInfo>> {
        self.list_records(DEVICES)
    }

    // ── Media ──────────────────────────────────────────────────────

    /// Insert or update a medium.
    pub fn put_medium(&self, medium: &MediumInfo) -> StateResult<()> {
        let key = medium.table_key();
        self.put_record(MEDIA, &key, medium)?;
        debug!(%key, status = %medium.fs.status, used = medium.used, "medium stored");
        Ok(())
    }

    pub fn get_medium(&self, id: &MediumId) -> StateResult<Option<MediumInfo>> {
        self.get_record(MEDIA, &id.table_key())
    }

    pub fn list_media(&self) -> StateResult<Vec<MediumInfo>> {
        self.list_records(MEDIA)
    }

    /// Remove a medium record. Returns true if it existed.
    pub fn delete_medium(&self, id: &MediumId) -> StateResult<bool> {
        let key = id.table_key();
        let existed = self.delete_record(MEDIA, &key)?;
        debug!(%key, existed, "medium deleted");
        Ok(existed)
    }

    /// Read-modify-write a medium inside one write transaction.
    pub fn update_medium<F>(&self, id: &MediumId, update: F) -> StateResult<MediumInfo>
    where
        F: FnOnce(&mut MediumInfo),
    {
        let key = id.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let medium;
        {
            let mut table = txn.open_table(MEDIA).map_err(map_err!(Table))?;
            let mut current: MediumInfo = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(id.to_string())),
            };
            update(&mut current);
            let value = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            medium = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(medium)
    }

    // ── Objects ────────────────────────────────────────────────────

    /// Insert an object record only if the oid is free.
    pub fn reserve_object(&self, object: &ObjectInfo) -> StateResult<()> {
        let value = serde_json::to_vec(object).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            let taken = table
                .get(object.oid.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if taken {
                return Err(StateError::AlreadyExists(object.oid.clone()));
            }
            table
                .insert(object.oid.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(oid = %object.oid, "object reserved");
        Ok(())
    }

    /// Insert or update an object.
    pub fn put_object(&self, object: &ObjectInfo) -> StateResult<()> {
        self.put_record(OBJECTS, &object.oid, object)
    }

    pub fn get_object(&self, oid: &str) -> StateResult<Option<ObjectInfo>> {
        self.get_record(OBJECTS, oid)
    }

    pub fn list_objects(&self) -> StateResult<Vec<ObjectInfo>> {
        self.list_records(OBJECTS)
    }

    /// Delete an object. Returns true if it existed.
    pub fn delete_object(&self, oid: &str) -> StateResult<bool> {
        let existed = self.delete_record(OBJECTS, oid)?;
        debug!(%oid, existed, "object deleted");
        Ok(existed)
    }

    // ── Layouts ────────────────────────────────────────────────────

    pub fn put_layout(&self, layout: &LayoutInfo) -> StateResult<()> {
        self.put_record(LAYOUTS, &layout.oid, layout)?;
        debug!(oid = %layout.oid, extents = layout.extents.len(), "layout stored");
        Ok(())
    }

    pub fn get_layout(&self, oid: &str) -> StateResult<Option<LayoutInfo>> {
        self.get_record(LAYOUTS, oid)
    }

    pub fn delete_layout(&self, oid: &str) -> StateResult<bool> {
        self.delete_record(LAYOUTS, oid)
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Take `target` for `owner` if it is free or already held by `owner`.
    ///
    /// The check and the insert run in one write transaction, so two
    /// schedulers sharing the database never both succeed.
    pub fn try_lock(&self, target: &LockTarget, owner: &LockOwner) -> StateResult<bool> {
        let key = target.key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let holder: Option<LockRecord> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            acquired = holder.is_none_or(|rec| rec.owner == *owner);
            if acquired {
                let record = LockRecord {
                    key: key.clone(),
                    owner: owner.clone(),
                    timestamp: epoch_secs(),
                };
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, %owner, acquired, "try_lock");
        Ok(acquired)
    }

    /// Release `target` if `owner` holds it. Returns false if the lock was
    /// absent or held by someone else.
    pub fn unlock(&self, target: &LockTarget, owner: &LockOwner) -> StateResult<bool> {
        let key = target.key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let holder: Option<LockRecord> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            released = match holder {
                Some(rec) if rec.owner == *owner => {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    true
                }
                Some(rec) => {
                    warn!(%key, holder = %rec.owner, requester = %owner, "unlock refused: held by another owner");
                    false
                }
                None => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    pub fn lock_holder(&self, target: &LockTarget) -> StateResult<Option<LockRecord>> {
        self.get_record(LOCKS, &target.key())
    }

    pub fn list_locks(&self) -> StateResult<Vec<LockRecord>> {
        self.list_records(LOCKS)
    }

    /// Drop every lock recorded for `hostname`, e.g. after a scheduler
    /// restart. Returns the number removed.
    pub fn unlock_all_for_host(&self, hostname: &str) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let record: LockRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.owner.hostname == hostname {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            count = stale.len() as u32;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            warn!(%hostname, count, "cleared stale locks");
        }
        Ok(count)
    }

    // ── Hardware logs ──────────────────────────────────────────────

    /// Append a log entry, assigning its sequence number.
    pub fn append_log(&self, mut entry: LogEntry) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(LOGS).map_err(map_err!(Table))?;
            seq = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value() + 1)
                .unwrap_or(1);
            entry.seq = seq;
            let value = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
            table
                .insert(seq, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// All log entries in append order.
    pub fn list_logs(&self) -> StateResult<Vec<LogEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let log: LogEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(log);
        }
        Ok(results)
    }

    /// Remove every log entry. Returns the number removed.
    pub fn clear_logs(&self) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(LOGS).map_err(map_err!(Table))?;
            let mut removed = 0;
            table
                .retain(|_, _| {
                    removed += 1;
                    false
                })
                .map_err(map_err!(Write))?;
            count = removed;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }
}
