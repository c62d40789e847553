//! StateStore: redb-backed resource catalog and composed-node persistence.
//!
//! Provides typed access to catalog records and composed nodes. All values
//! are JSON envelopes carrying a record version. Mutations go through
//! optimistic [`Transaction`]s committed with first-committer-wins conflict
//! detection. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::transaction::{Envelope, Transaction, VersionProbe};
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Transaction boundary supplied by the persistence layer.
///
/// `begin` opens an isolated snapshot; `commit` applies its writes or fails
/// with a conflict the caller may retry ([`StateError::is_conflict`]).
/// Dropping an uncommitted transaction rolls it back.
pub trait Persistence: Send + Sync {
    fn begin(&self) -> StateResult<Transaction>;
    fn commit(&self, txn: Transaction) -> StateResult<()>;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for name in ALL_TABLES {
            txn.open_table(definition(name)).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` in a single transaction and commit it, without retrying.
    pub fn write<T>(&self, f: impl FnOnce(&mut Transaction) -> StateResult<T>) -> StateResult<T> {
        let mut txn = self.begin()?;
        let out = f(&mut txn)?;
        self.commit(txn)?;
        Ok(out)
    }

    // ── Generic record access ──────────────────────────────────────

    /// Insert or update a record.
    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        self.write(|txn| txn.put(record))
    }

    /// Get a record by id.
    pub fn get<R: Record>(&self, id: &str) -> StateResult<Option<R>> {
        self.begin()?.get(id)
    }

    /// List all records of one table in id order.
    pub fn list<R: Record>(&self) -> StateResult<Vec<R>> {
        self.begin()?.list()
    }

    /// Delete a record by id. Returns true if it existed.
    pub fn delete<R: Record>(&self, id: &str) -> StateResult<bool> {
        self.write(|txn| {
            let existed = txn.get::<R>(id)?.is_some();
            txn.delete::<R>(id)?;
            Ok(existed)
        })
    }

    /// Committed version of a record, if present.
    pub fn version_of<R: Record>(&self, id: &str) -> StateResult<Option<u64>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(definition(R::TABLE)).map_err(map_err!(Table))?;
        let version = match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let probe: VersionProbe =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Some(probe.version)
            }
            None => None,
        };
        Ok(version)
    }

    // ── Catalog ────────────────────────────────────────────────────

    /// Load a discovery snapshot into the catalog, upserting every record.
    pub fn import_catalog(&self, catalog: &Catalog) -> StateResult<usize> {
        let count = self.write(|txn| {
            let mut count = 0;
            for system in &catalog.systems {
                txn.put(system)?;
                count += 1;
            }
            for processor in &catalog.processors {
                txn.put(processor)?;
                count += 1;
            }
            for memory in &catalog.memory {
                txn.put(memory)?;
                count += 1;
            }
            for nic in &catalog.ethernet_interfaces {
                txn.put(nic)?;
                count += 1;
            }
            for port in &catalog.switch_ports {
                txn.put(port)?;
                count += 1;
            }
            for drive in &catalog.local_drives {
                txn.put(drive)?;
                count += 1;
            }
            for drive in &catalog.remote_drives {
                txn.put(drive)?;
                count += 1;
            }
            Ok(count)
        })?;
        info!(records = count, "catalog imported");
        Ok(count)
    }

    // ── Composed nodes ─────────────────────────────────────────────

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<ComposedNode>> {
        self.get::<ComposedNode>(node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<ComposedNode>> {
        self.list::<ComposedNode>()
    }
}

impl Persistence for StateStore {
    fn begin(&self) -> StateResult<Transaction> {
        Transaction::begin(&self.db)
    }

    fn commit(&self, txn: Transaction) -> StateResult<()> {
        let (txn_id, writes) = txn.into_write_set();
        if writes.is_empty() {
            debug!(txn = txn_id, "read-only transaction finished");
            return Ok(());
        }

        let wtxn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for write in &writes {
            let mut table = wtxn
                .open_table(definition(write.table))
                .map_err(map_err!(Table))?;
            let current = match table.get(write.key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let probe: VersionProbe =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Some(probe.version)
                }
                None => None,
            };
            if current != write.expected {
                debug!(
                    txn = txn_id,
                    table = write.table,
                    key = %write.key,
                    expected = ?write.expected,
                    found = ?current,
                    "commit conflict, aborting"
                );
                // Dropping `wtxn` without committing aborts it.
                return Err(StateError::Conflict {
                    table: write.table.to_string(),
                    key: write.key.clone(),
                });
            }
            match &write.value {
                Some(data) => {
                    let envelope = Envelope {
                        version: current.unwrap_or(0) + 1,
                        data,
                    };
                    let bytes = serde_json::to_vec(&envelope).map_err(map_err!(Serialize))?;
                    table
                        .insert(write.key.as_str(), bytes.as_slice())
                        .map_err(map_err!(Write))?;
                }
                None => {
                    table.remove(write.key.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        wtxn.commit().map_err(map_err!(Transaction))?;
        debug!(txn = txn_id, writes = writes.len(), "transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_system(id: &str) -> ComputerSystem {
        ComputerSystem {
            id: id.to_string(),
            service_id: "rmm-1".to_string(),
            name: format!("system {id}"),
            health: Health::Ok,
            power_state: PowerState::On,
            owner: None,
        }
    }

    fn test_memory(id: &str, system_id: &str, capacity_mib: u64) -> Memory {
        Memory {
            id: id.to_string(),
            system_id: system_id.to_string(),
            capacity_mib: Some(capacity_mib),
            device_type: Some("DDR4".to_string()),
            ..Default::default()
        }
    }

    fn test_node(id: &str) -> ComposedNode {
        ComposedNode {
            id: id.to_string(),
            name: "node".to_string(),
            description: None,
            state: NodeState::Allocated,
            system_id: "sys-1".to_string(),
            resources: vec![ResourceRef::new(ResourceClass::System, "sys-1")],
            assembly: vec![AssemblyStep::PowerOff],
            created_at: 1000,
            updated_at: 1000,
        }
    }

    // ── Record CRUD ────────────────────────────────────────────────

    #[test]
    fn system_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let system = test_system("sys-1");

        store.put(&system).unwrap();
        let retrieved = store.get::<ComputerSystem>("sys-1").unwrap();

        assert_eq!(retrieved, Some(system));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get::<Processor>("nope").unwrap().is_none());
        assert!(store.get_node("nope").unwrap().is_none());
    }

    #[test]
    fn list_returns_records_in_id_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&test_memory("mem-2", "sys-1", 8192)).unwrap();
        store.put(&test_memory("mem-0", "sys-1", 8192)).unwrap();
        store.put(&test_memory("mem-1", "sys-1", 8192)).unwrap();

        let ids: Vec<String> = store
            .list::<Memory>()
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["mem-0", "mem-1", "mem-2"]);
    }

    #[test]
    fn delete_reports_existence() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&test_node("node-1")).unwrap();

        assert!(store.delete::<ComposedNode>("node-1").unwrap());
        assert!(!store.delete::<ComposedNode>("node-1").unwrap());
        assert!(store.list_nodes().unwrap().is_empty());
    }

    #[test]
    fn versions_increase_on_every_write() {
        let store = StateStore::open_in_memory().unwrap();
        let mut system = test_system("sys-1");
        assert_eq!(store.version_of::<ComputerSystem>("sys-1").unwrap(), None);

        store.put(&system).unwrap();
        assert_eq!(store.version_of::<ComputerSystem>("sys-1").unwrap(), Some(1));

        system.owner = Some("node-1".to_string());
        store.put(&system).unwrap();
        assert_eq!(store.version_of::<ComputerSystem>("sys-1").unwrap(), Some(2));
    }

    #[test]
    fn import_catalog_counts_records() {
        let store = StateStore::open_in_memory().unwrap();
        let catalog = Catalog {
            systems: vec![test_system("sys-1"), test_system("sys-2")],
            memory: vec![test_memory("mem-0", "sys-1", 4096)],
            ..Default::default()
        };

        assert_eq!(store.import_catalog(&catalog).unwrap(), 3);
        assert_eq!(store.list::<ComputerSystem>().unwrap().len(), 2);
    }

    // ── Transactions ───────────────────────────────────────────────

    #[test]
    fn transaction_sees_its_own_writes() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&test_system("sys-1")).unwrap();

        let mut txn = store.begin().unwrap();
        let mut system = txn.get::<ComputerSystem>("sys-1").unwrap().unwrap();
        system.owner = Some("node-1".to_string());
        txn.put(&system).unwrap();
        txn.put(&test_system("sys-0")).unwrap();

        let seen = txn.get::<ComputerSystem>("sys-1").unwrap().unwrap();
        assert_eq!(seen.owner.as_deref(), Some("node-1"));
        let listed: Vec<String> = txn
            .list::<ComputerSystem>()
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(listed, ["sys-0", "sys-1"]);

        // Nothing is visible outside until commit.
        assert!(store.get::<ComputerSystem>("sys-0").unwrap().is_none());
        store.commit(txn).unwrap();
        assert!(store.get::<ComputerSystem>("sys-0").unwrap().is_some());
    }

    #[test]
    fn rollback_discards_writes() {
        let store = StateStore::open_in_memory().unwrap();
        let mut txn = store.begin().unwrap();
        txn.put(&test_system("sys-1")).unwrap();
        assert!(txn.is_dirty());
        txn.rollback();

        assert!(store.list::<ComputerSystem>().unwrap().is_empty());
    }

    #[test]
    fn concurrent_writers_on_same_record_conflict() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&test_system("sys-1")).unwrap();

        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();

        let mut a = first.get::<ComputerSystem>("sys-1").unwrap().unwrap();
        a.owner = Some("node-a".to_string());
        first.put(&a).unwrap();

        let mut b = second.get::<ComputerSystem>("sys-1").unwrap().unwrap();
        b.owner = Some("node-b".to_string());
        second.put(&b).unwrap();

        store.commit(first).unwrap();
        let err = store.commit(second).unwrap_err();
        assert!(err.is_conflict(), "expected conflict, got {err}");

        let committed = store.get::<ComputerSystem>("sys-1").unwrap().unwrap();
        assert_eq!(committed.owner.as_deref(), Some("node-a"));
    }

    #[test]
    fn disjoint_writers_both_commit() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&test_system("sys-1")).unwrap();
        store.put(&test_system("sys-2")).unwrap();

        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        // Both scan the whole table, but write different records.
        assert_eq!(first.list::<ComputerSystem>().unwrap().len(), 2);
        assert_eq!(second.list::<ComputerSystem>().unwrap().len(), 2);

        let mut a = first.get::<ComputerSystem>("sys-1").unwrap().unwrap();
        a.owner = Some("node-a".to_string());
        first.put(&a).unwrap();
        let mut b = second.get::<ComputerSystem>("sys-2").unwrap().unwrap();
        b.owner = Some("node-b".to_string());
        second.put(&b).unwrap();

        store.commit(first).unwrap();
        store.commit(second).unwrap();
    }

    #[test]
    fn concurrent_inserts_of_same_key_conflict() {
        let store = StateStore::open_in_memory().unwrap();
        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        first.put(&test_node("node-1")).unwrap();
        second.put(&test_node("node-1")).unwrap();

        store.commit(first).unwrap();
        assert!(store.commit(second).unwrap_err().is_conflict());
    }

    #[test]
    fn snapshot_is_stable_within_transaction() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&test_system("sys-1")).unwrap();

        let mut reader = store.begin().unwrap();
        let mut system = test_system("sys-1");
        system.owner = Some("node-x".to_string());
        store.put(&system).unwrap();

        let seen = reader.get::<ComputerSystem>("sys-1").unwrap().unwrap();
        assert!(seen.owner.is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put(&test_node("node-1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let node = store.get_node("node-1").unwrap();
        assert!(node.is_some());
        assert_eq!(node.unwrap().state, NodeState::Allocated);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list::<ComputerSystem>().unwrap().is_empty());
        assert!(store.list::<RemoteDrive>().unwrap().is_empty());
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(!store.delete::<SwitchPort>("nope").unwrap());
    }
}
