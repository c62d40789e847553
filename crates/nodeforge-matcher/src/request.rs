//! Requested-node definition: what a caller asks for, per resource class.
//!
//! Every field is optional; `None` means unconstrained. Each requested item
//! may pin a concrete catalog resource through `resource`, which then
//! overrides all of its other constraints.

use serde::{Deserialize, Serialize};

use nodeforge_state::ResourceId;

/// Immutable description of the node a caller wants composed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestedNode {
    pub name: String,
    pub description: Option<String>,
    /// Lower bound on the summed capacity of the backing system's free memory.
    pub total_system_memory_mib: Option<u64>,
    /// Lower bound on the summed core count of the backing system's free processors.
    pub total_system_core_count: Option<u32>,
    /// Pin the backing computer system.
    pub system: Option<ResourceId>,
    pub processors: Vec<RequestedProcessor>,
    pub memory: Vec<RequestedMemory>,
    pub ethernet_interfaces: Vec<RequestedEthernetInterface>,
    pub local_drives: Vec<RequestedLocalDrive>,
    pub remote_drives: Vec<RequestedRemoteDrive>,
}

impl RequestedNode {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Number of requested items across all classes.
    pub fn item_count(&self) -> usize {
        self.processors.len()
            + self.memory.len()
            + self.ethernet_interfaces.len()
            + self.local_drives.len()
            + self.remote_drives.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestedProcessor {
    pub resource: Option<ResourceId>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub instruction_set: Option<String>,
    pub total_cores: Option<u32>,
    pub achievable_speed_mhz: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestedMemory {
    pub resource: Option<ResourceId>,
    /// Satisfied cumulatively by one or more modules.
    pub capacity_mib: Option<u64>,
    pub device_type: Option<String>,
    pub speed_mhz: Option<u32>,
    pub manufacturer: Option<String>,
    pub data_width_bits: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestedEthernetInterface {
    pub resource: Option<ResourceId>,
    pub mac_address: Option<String>,
    pub speed_mbps: Option<u32>,
    /// Tagged VLAN ids. A non-empty list requires a healthy neighbor switch port.
    pub vlans: Vec<u32>,
    pub primary_vlan: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestedLocalDrive {
    pub resource: Option<ResourceId>,
    /// Satisfied cumulatively by one or more drives.
    pub capacity_gib: Option<u64>,
    pub media_type: Option<String>,
    pub protocol: Option<String>,
    pub min_rpm: Option<u32>,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestedRemoteDrive {
    pub resource: Option<ResourceId>,
    pub capacity_gib: Option<u64>,
    pub protocol: Option<String>,
    pub master: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sparse_json_request() {
        let json = r#"{
            "name": "web-1",
            "total_system_core_count": 8,
            "memory": [{ "capacity_mib": 16384 }],
            "ethernet_interfaces": [{ "speed_mbps": 10000, "vlans": [100] }]
        }"#;
        let req: RequestedNode = serde_json::from_str(json).unwrap();

        assert_eq!(req.name, "web-1");
        assert_eq!(req.total_system_core_count, Some(8));
        assert!(req.total_system_memory_mib.is_none());
        assert_eq!(req.memory[0].capacity_mib, Some(16384));
        assert!(req.memory[0].device_type.is_none());
        assert_eq!(req.ethernet_interfaces[0].vlans, [100]);
        assert_eq!(req.item_count(), 2);
    }
}
