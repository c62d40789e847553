//! Nodeforge resource matchers: pick concrete catalog resources for a
//! requested node.
//!
//! Matching is a pure function of the requested items and the free
//! candidates handed in. It never touches the store and never fails: items
//! without a candidate come back as [`Unmatched`] entries and the allocation
//! strategy decides what that means.
//!
//! # Components
//!
//! - **`engine`**: Shared scan/sort/bind algorithm and the [`ResourceKind`] seam
//! - **`constraints`**: Constraint tables for processors, memory, ethernet
//!   interfaces, local drives and remote drives
//! - **`lookup`**: Neighbor switch port lookup used by VLAN constraints
//! - **`request`**: The requested-node definition

pub mod constraints;
pub mod engine;
pub mod lookup;
pub mod request;

pub use constraints::{
    EthernetKind, LocalDriveKind, MemoryKind, ProcessorKind, RemoteDriveKind,
    match_ethernet_interfaces, match_local_drives, match_memory, match_processors,
    match_remote_drives,
};
pub use engine::{
    AllocationMapping, Binding, Check, Relation, ResourceKind, Selection, Unmatched,
    UnmetConstraint, match_resources,
};
pub use lookup::{LookupError, NeighborLookup, NoNeighbors, SwitchPortIndex};
pub use request::{
    RequestedEthernetInterface, RequestedLocalDrive, RequestedMemory, RequestedNode,
    RequestedProcessor, RequestedRemoteDrive,
};
