//! redb table definitions for the nodeforge state store.
//!
//! Each table uses `&str` keys (the record id) and `&[u8]` values holding a
//! JSON envelope `{"version": n, "data": {...}}`. The version is maintained
//! by the store and drives optimistic conflict detection.

use redb::TableDefinition;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::types::*;

pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Computer systems keyed by `{system_id}`.
pub const SYSTEMS: &str = "systems";
/// Processors keyed by `{processor_id}`.
pub const PROCESSORS: &str = "processors";
pub const MEMORY: &str = "memory";
pub const ETHERNET_INTERFACES: &str = "ethernet_interfaces";
pub const SWITCH_PORTS: &str = "switch_ports";
pub const LOCAL_DRIVES: &str = "local_drives";
/// Pooled remote drives keyed by `{drive_id}`.
pub const REMOTE_DRIVES: &str = "remote_drives";
/// Composed nodes keyed by `{node_id}`.
pub const COMPOSED_NODES: &str = "composed_nodes";

pub const ALL_TABLES: [&str; 8] = [
    SYSTEMS,
    PROCESSORS,
    MEMORY,
    ETHERNET_INTERFACES,
    SWITCH_PORTS,
    LOCAL_DRIVES,
    REMOTE_DRIVES,
    COMPOSED_NODES,
];

pub fn definition(name: &'static str) -> Table {
    TableDefinition::new(name)
}

/// A type persisted in one of the store's tables.
pub trait Record: Serialize + DeserializeOwned + Clone {
    const TABLE: &'static str;

    fn record_key(&self) -> &str;
}

macro_rules! impl_record {
    ($($ty:ty => $table:expr),* $(,)?) => {
        $(
            impl Record for $ty {
                const TABLE: &'static str = $table;

                fn record_key(&self) -> &str {
                    &self.id
                }
            }
        )*
    };
}

impl_record! {
    ComputerSystem => SYSTEMS,
    Processor => PROCESSORS,
    Memory => MEMORY,
    EthernetInterface => ETHERNET_INTERFACES,
    SwitchPort => SWITCH_PORTS,
    LocalDrive => LOCAL_DRIVES,
    RemoteDrive => REMOTE_DRIVES,
    ComposedNode => COMPOSED_NODES,
}
