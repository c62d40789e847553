//! Domain types for the nodeforge state store.
//!
//! These types represent the resource catalog (computer systems and the
//! discrete components they expose, plus pooled remote drives) and the
//! composed nodes built from them. All types are serializable to/from JSON
//! for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Catalog identity of a hardware resource.
pub type ResourceId = String;

/// Identity of a composed node.
pub type NodeId = String;

/// Identity of a remote management service (chassis manager, storage or
/// fabric service).
pub type ServiceId = String;

// ── Resource classes ───────────────────────────────────────────────

/// The kinds of catalog resources a composed node can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    System,
    Processor,
    Memory,
    EthernetInterface,
    LocalDrive,
    RemoteDrive,
}

impl ResourceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Processor => "processor",
            Self::Memory => "memory",
            Self::EthernetInterface => "ethernet_interface",
            Self::LocalDrive => "local_drive",
            Self::RemoteDrive => "remote_drive",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "system" => Ok(Self::System),
            "processor" => Ok(Self::Processor),
            "memory" => Ok(Self::Memory),
            "ethernet_interface" => Ok(Self::EthernetInterface),
            "local_drive" => Ok(Self::LocalDrive),
            "remote_drive" => Ok(Self::RemoteDrive),
            other => Err(format!("unknown resource class: {other}")),
        }
    }
}

/// Reference from a composed node to a catalog resource it owns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub class: ResourceClass,
    pub id: ResourceId,
}

impl ResourceRef {
    pub fn new(class: ResourceClass, id: impl Into<ResourceId>) -> Self {
        Self {
            class,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.id)
    }
}

/// Health rollup reported by the managing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Ok,
    Warning,
    Critical,
    #[default]
    Unknown,
}

impl Health {
    pub fn is_healthy(self) -> bool {
        self == Health::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

/// A catalog record that can be owned by at most one composed node.
pub trait Allocatable {
    fn resource_id(&self) -> &ResourceId;
    fn owner(&self) -> Option<&NodeId>;
    fn set_owner(&mut self, owner: Option<NodeId>);

    fn is_free(&self) -> bool {
        self.owner().is_none()
    }
}

macro_rules! impl_allocatable {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Allocatable for $ty {
                fn resource_id(&self) -> &ResourceId {
                    &self.id
                }

                fn owner(&self) -> Option<&NodeId> {
                    self.owner.as_ref()
                }

                fn set_owner(&mut self, owner: Option<NodeId>) {
                    self.owner = owner;
                }
            }
        )*
    };
}

// ── Catalog ────────────────────────────────────────────────────────

/// A physical compute system that backs composed nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputerSystem {
    pub id: ResourceId,
    /// Management service through which the system is controlled.
    pub service_id: ServiceId,
    pub name: String,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub owner: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Processor {
    pub id: ResourceId,
    pub system_id: ResourceId,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub instruction_set: Option<String>,
    pub total_cores: Option<u32>,
    pub achievable_speed_mhz: Option<u32>,
    pub owner: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Memory {
    pub id: ResourceId,
    pub system_id: ResourceId,
    pub capacity_mib: Option<u64>,
    /// e.g. "DDR4".
    pub device_type: Option<String>,
    pub speed_mhz: Option<u32>,
    pub manufacturer: Option<String>,
    pub data_width_bits: Option<u32>,
    pub owner: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EthernetInterface {
    pub id: ResourceId,
    pub system_id: ResourceId,
    pub mac_address: Option<String>,
    pub speed_mbps: Option<u32>,
    pub owner: Option<NodeId>,
}

/// A switch port facing an ethernet interface. Used only as side-lookup data
/// when matching VLAN-tagged interfaces; never owned by a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SwitchPort {
    pub id: ResourceId,
    pub switch_id: ResourceId,
    /// MAC address of the interface on the other end of the link.
    pub neighbor_mac: Option<String>,
    pub health: Health,
    pub vlans: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LocalDrive {
    pub id: ResourceId,
    pub system_id: ResourceId,
    pub capacity_gib: Option<u64>,
    /// "hdd" or "ssd".
    pub media_type: Option<String>,
    /// "sata", "sas", "nvme", ...
    pub protocol: Option<String>,
    pub rotation_speed_rpm: Option<u32>,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    pub owner: Option<NodeId>,
}

/// A pooled drive exposed over a storage fabric, attachable to any system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RemoteDrive {
    pub id: ResourceId,
    /// Fabric service that performs attach/detach for this drive.
    pub service_id: ServiceId,
    pub capacity_gib: Option<u64>,
    /// "iscsi", "nvme_over_fabrics", ...
    pub protocol: Option<String>,
    /// Master image the drive was cloned from.
    pub master: Option<String>,
    pub owner: Option<NodeId>,
}

impl_allocatable!(ComputerSystem, Processor, Memory, EthernetInterface, LocalDrive, RemoteDrive);

/// A bulk snapshot of the catalog, as produced by discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Catalog {
    pub systems: Vec<ComputerSystem>,
    pub processors: Vec<Processor>,
    pub memory: Vec<Memory>,
    pub ethernet_interfaces: Vec<EthernetInterface>,
    pub switch_ports: Vec<SwitchPort>,
    pub local_drives: Vec<LocalDrive>,
    pub remote_drives: Vec<RemoteDrive>,
}

// ── Composed node ──────────────────────────────────────────────────

/// Lifecycle of a composed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Allocated,
    Assembling,
    Assembled,
    Failed,
    Removed,
}

impl NodeState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// The normal path only moves forward. Any live state may fail, and only
    /// settled nodes (assembled or failed) may be removed.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Allocated, Assembling) | (Assembling, Assembled) => true,
            (Removed, _) => false,
            (_, Failed) => true,
            (Assembled | Failed, Removed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Allocated => "allocated",
            NodeState::Assembling => "assembling",
            NodeState::Assembled => "assembled",
            NodeState::Failed => "failed",
            NodeState::Removed => "removed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allocated" => Ok(NodeState::Allocated),
            "assembling" => Ok(NodeState::Assembling),
            "assembled" => Ok(NodeState::Assembled),
            "failed" => Ok(NodeState::Failed),
            "removed" => Ok(NodeState::Removed),
            other => Err(format!("unknown node state: {other}")),
        }
    }
}

/// Descriptor of one post-allocation step, persisted with the node so the
/// planned assembly is visible without the in-memory task objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum AssemblyStep {
    MarkAssembling,
    AttachRemoteDrive {
        drive_id: ResourceId,
        service_id: ServiceId,
    },
    PowerOff,
    BootOverride {
        source: String,
    },
    MarkAssembled,
}

impl fmt::Display for AssemblyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyStep::MarkAssembling => f.write_str("mark-assembling"),
            AssemblyStep::AttachRemoteDrive { drive_id, .. } => {
                write!(f, "attach-remote-drive({drive_id})")
            }
            AssemblyStep::PowerOff => f.write_str("power-off"),
            AssemblyStep::BootOverride { source } => write!(f, "boot-override({source})"),
            AssemblyStep::MarkAssembled => f.write_str("mark-assembled"),
        }
    }
}

/// A logical compute system assembled from pooled resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComposedNode {
    pub id: NodeId,
    pub name: String,
    pub description: Option<String>,
    pub state: NodeState,
    /// Backing computer system.
    pub system_id: ResourceId,
    /// Every catalog resource this node owns, the backing system included.
    pub resources: Vec<ResourceRef>,
    pub assembly: Vec<AssemblyStep>,
    /// Unix timestamp (seconds) when the node was allocated.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last state change.
    pub updated_at: u64,
}

impl ComposedNode {
    pub fn owns(&self, resource: &ResourceRef) -> bool {
        self.resources.contains(resource)
    }

    pub fn resources_of(&self, class: ResourceClass) -> impl Iterator<Item = &ResourceRef> {
        self.resources.iter().filter(move |r| r.class == class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        use NodeState::*;
        assert!(Allocated.can_transition_to(Assembling));
        assert!(Assembling.can_transition_to(Assembled));
        assert!(!Allocated.can_transition_to(Assembled));
        assert!(!Assembled.can_transition_to(Assembling));
        assert!(!Assembling.can_transition_to(Allocated));
    }

    #[test]
    fn any_live_state_may_fail() {
        use NodeState::*;
        for state in [Allocated, Assembling, Assembled, Failed] {
            assert!(state.can_transition_to(Failed), "{state} -> failed");
        }
        assert!(!Removed.can_transition_to(Failed));
    }

    #[test]
    fn only_settled_nodes_are_removed() {
        use NodeState::*;
        assert!(Assembled.can_transition_to(Removed));
        assert!(Failed.can_transition_to(Removed));
        assert!(!Allocated.can_transition_to(Removed));
        assert!(!Assembling.can_transition_to(Removed));
    }

    #[test]
    fn node_state_parses_case_insensitively() {
        assert_eq!("Failed".parse::<NodeState>().unwrap(), NodeState::Failed);
        assert!("exploded".parse::<NodeState>().is_err());
    }

    #[test]
    fn resource_class_parses_both_separators() {
        assert_eq!("remote-drive".parse::<ResourceClass>().unwrap(), ResourceClass::RemoteDrive);
        assert_eq!("Local_Drive".parse::<ResourceClass>().unwrap(), ResourceClass::LocalDrive);
        assert!("gpu".parse::<ResourceClass>().is_err());
    }

    #[test]
    fn allocatable_tracks_owner() {
        let mut cpu = Processor {
            id: "cpu-0".to_string(),
            ..Default::default()
        };
        assert!(cpu.is_free());
        cpu.set_owner(Some("node-a".to_string()));
        assert_eq!(cpu.owner().map(String::as_str), Some("node-a"));
        assert!(!cpu.is_free());
    }

    #[test]
    fn assembly_step_serializes_tagged() {
        let step = AssemblyStep::AttachRemoteDrive {
            drive_id: "vol-1".to_string(),
            service_id: "fabric-1".to_string(),
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"step\":\"attach_remote_drive\""));
    }
}
