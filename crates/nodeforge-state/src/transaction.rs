//! Optimistic transactions over the redb store.
//!
//! A [`Transaction`] reads from a redb snapshot taken at `begin` and buffers
//! its writes in memory. Every record it reads or writes has its version
//! remembered; at commit the store re-reads each written key inside a redb
//! write transaction and aborts with [`StateError::Conflict`] if another
//! transaction committed a different version first (first committer wins).
//! Rollback is simply dropping the transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::{Record, definition};

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// On-disk representation of every record.
#[derive(Serialize, Deserialize)]
pub(crate) struct Envelope<T> {
    pub version: u64,
    pub data: T,
}

/// Reads only the version of an envelope, ignoring the payload.
#[derive(Deserialize)]
pub(crate) struct VersionProbe {
    pub version: u64,
}

pub(crate) type RecordKey = (&'static str, String);

/// Isolated unit of work against the catalog and composed nodes.
pub struct Transaction {
    id: u64,
    snapshot: ReadTransaction,
    /// Version of each key as first observed (`None` = absent).
    observed: HashMap<RecordKey, Option<u64>>,
    /// Buffered writes; `None` deletes the record.
    writes: BTreeMap<RecordKey, Option<serde_json::Value>>,
}

impl Transaction {
    pub(crate) fn begin(db: &Arc<Database>) -> StateResult<Self> {
        let snapshot = db.begin_read().map_err(map_err!(Transaction))?;
        let id = NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed);
        debug!(txn = id, "transaction started");
        Ok(Self {
            id,
            snapshot,
            observed: HashMap::new(),
            writes: BTreeMap::new(),
        })
    }

    /// Whether any write has been buffered.
    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Discard all buffered writes.
    pub fn rollback(self) {
        debug!(txn = self.id, writes = self.writes.len(), "transaction rolled back");
    }

    /// Read a record by id, seeing this transaction's own writes.
    pub fn get<R: Record>(&mut self, id: &str) -> StateResult<Option<R>> {
        let key: RecordKey = (R::TABLE, id.to_string());
        if let Some(pending) = self.writes.get(&key) {
            return pending.as_ref().map(decode_value::<R>).transpose();
        }
        let stored = self.read_snapshot::<R>(id)?;
        let version = stored.as_ref().map(|e| e.version);
        self.observed.entry(key).or_insert(version);
        Ok(stored.map(|e| e.data))
    }

    /// List every record of a table in key order, overlaid with this
    /// transaction's own writes.
    pub fn list<R: Record>(&mut self) -> StateResult<Vec<R>> {
        let table = self
            .snapshot
            .open_table(definition(R::TABLE))
            .map_err(map_err!(Table))?;
        let mut merged: BTreeMap<String, R> = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let envelope: Envelope<R> =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            let key = key.value().to_string();
            self.observed
                .entry((R::TABLE, key.clone()))
                .or_insert(Some(envelope.version));
            merged.insert(key, envelope.data);
        }
        for ((table_name, key), pending) in &self.writes {
            if *table_name != R::TABLE {
                continue;
            }
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), decode_value::<R>(value)?);
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Buffer an insert or update.
    pub fn put<R: Record>(&mut self, record: &R) -> StateResult<()> {
        let id = record.record_key().to_string();
        self.observe::<R>(&id)?;
        let value = serde_json::to_value(record).map_err(map_err!(Serialize))?;
        self.writes.insert((R::TABLE, id), Some(value));
        Ok(())
    }

    /// Buffer a delete. Deleting an absent record is not an error.
    pub fn delete<R: Record>(&mut self, id: &str) -> StateResult<()> {
        self.observe::<R>(id)?;
        self.writes.insert((R::TABLE, id.to_string()), None);
        Ok(())
    }

    /// Make sure the committed version of `id` is known before writing it.
    fn observe<R: Record>(&mut self, id: &str) -> StateResult<()> {
        let key: RecordKey = (R::TABLE, id.to_string());
        if self.observed.contains_key(&key) {
            return Ok(());
        }
        let version = self.read_version(R::TABLE, id)?;
        self.observed.insert(key, version);
        Ok(())
    }

    fn read_snapshot<R: Record>(&self, id: &str) -> StateResult<Option<Envelope<R>>> {
        let table = self
            .snapshot
            .open_table(definition(R::TABLE))
            .map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let envelope: Envelope<R> =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    fn read_version(&self, table_name: &'static str, id: &str) -> StateResult<Option<u64>> {
        let table = self
            .snapshot
            .open_table(definition(table_name))
            .map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let probe: VersionProbe =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(probe.version))
            }
            None => Ok(None),
        }
    }

    /// Consume the transaction into its write set, each entry paired with
    /// the version it expects to replace.
    pub(crate) fn into_write_set(self) -> (u64, Vec<PendingWrite>) {
        let Transaction {
            id,
            observed,
            writes,
            ..
        } = self;
        let pending = writes
            .into_iter()
            .map(|(key, value)| {
                let expected = observed.get(&key).copied().flatten();
                PendingWrite {
                    table: key.0,
                    key: key.1,
                    expected,
                    value,
                }
            })
            .collect();
        (id, pending)
    }
}

pub(crate) struct PendingWrite {
    pub table: &'static str,
    pub key: String,
    pub expected: Option<u64>,
    pub value: Option<serde_json::Value>,
}

fn decode_value<R: Record>(value: &serde_json::Value) -> StateResult<R> {
    R::deserialize(value).map_err(map_err!(Deserialize))
}
