//! Request validation, run before any transaction is opened.

use std::collections::HashSet;

use regex::Regex;

use nodeforge_matcher::RequestedNode;

use crate::error::{AllocationError, AllocationResult};

const MAC_PATTERN: &str = r"^[0-9A-Fa-f]{2}([:-][0-9A-Fa-f]{2}){5}$";

const VLAN_RANGE: std::ops::RangeInclusive<u32> = 1..=4094;

/// Reject requests that no catalog could ever satisfy consistently.
pub fn validate_request(requested: &RequestedNode) -> AllocationResult<()> {
    let node = requested.name.as_str();
    if node.trim().is_empty() {
        return Err(AllocationError::validation("<unnamed>", "node name must not be empty"));
    }

    if requested.total_system_memory_mib == Some(0) {
        return Err(AllocationError::validation(node, "total_system_memory_mib must be positive"));
    }
    if requested.total_system_core_count == Some(0) {
        return Err(AllocationError::validation(node, "total_system_core_count must be positive"));
    }

    check_unique_pins(node, "processor", requested.processors.iter().map(|p| p.resource.as_deref()))?;
    check_unique_pins(node, "memory", requested.memory.iter().map(|m| m.resource.as_deref()))?;
    check_unique_pins(
        node,
        "ethernet_interface",
        requested.ethernet_interfaces.iter().map(|e| e.resource.as_deref()),
    )?;
    check_unique_pins(node, "local_drive", requested.local_drives.iter().map(|d| d.resource.as_deref()))?;
    check_unique_pins(node, "remote_drive", requested.remote_drives.iter().map(|d| d.resource.as_deref()))?;

    for (i, p) in requested.processors.iter().enumerate() {
        if p.total_cores == Some(0) {
            return Err(AllocationError::validation(node, format!("processor[{i}]: total_cores must be positive")));
        }
    }
    for (i, m) in requested.memory.iter().enumerate() {
        if m.capacity_mib == Some(0) {
            return Err(AllocationError::validation(node, format!("memory[{i}]: capacity_mib must be positive")));
        }
    }
    for (i, d) in requested.local_drives.iter().enumerate() {
        if d.capacity_gib == Some(0) {
            return Err(AllocationError::validation(node, format!("local_drive[{i}]: capacity_gib must be positive")));
        }
    }
    for (i, d) in requested.remote_drives.iter().enumerate() {
        if d.capacity_gib == Some(0) {
            return Err(AllocationError::validation(node, format!("remote_drive[{i}]: capacity_gib must be positive")));
        }
    }

    let mac_re = Regex::new(MAC_PATTERN).map_err(|e| AllocationError::validation(node, e.to_string()))?;
    for (i, nic) in requested.ethernet_interfaces.iter().enumerate() {
        if let Some(mac) = &nic.mac_address {
            if !mac_re.is_match(mac) {
                return Err(AllocationError::validation(
                    node,
                    format!("ethernet_interface[{i}]: malformed mac_address {mac}"),
                ));
            }
            if nic.resource.is_some() {
                return Err(AllocationError::validation(
                    node,
                    format!("ethernet_interface[{i}]: pins both a resource id and a mac_address"),
                ));
            }
        }
        if let Some(vlan) = nic.vlans.iter().chain(nic.primary_vlan.iter()).find(|v| !VLAN_RANGE.contains(*v)) {
            return Err(AllocationError::validation(
                node,
                format!("ethernet_interface[{i}]: vlan {vlan} outside 1..=4094"),
            ));
        }
        if let Some(primary) = nic.primary_vlan {
            if !nic.vlans.contains(&primary) {
                return Err(AllocationError::validation(
                    node,
                    format!("ethernet_interface[{i}]: primary vlan {primary} is not in its vlan list"),
                ));
            }
        }
    }

    Ok(())
}

fn check_unique_pins<'a>(
    node: &str,
    class: &str,
    pins: impl Iterator<Item = Option<&'a str>>,
) -> AllocationResult<()> {
    let mut seen = HashSet::new();
    for id in pins.flatten() {
        if !seen.insert(id) {
            return Err(AllocationError::validation(node, format!("{class} {id} is pinned more than once")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use nodeforge_matcher::{RequestedEthernetInterface, RequestedMemory, RequestedProcessor};

    use super::*;

    fn reason(result: AllocationResult<()>) -> String {
        match result {
            Err(AllocationError::Validation { reason, .. }) => reason,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_sparse_request() {
        let mut req = RequestedNode::named("web-1");
        req.memory.push(RequestedMemory::default());
        req.ethernet_interfaces.push(RequestedEthernetInterface {
            mac_address: Some("AA:bb:cc:00:11:22".to_string()),
            vlans: vec![100, 200],
            primary_vlan: Some(100),
            ..Default::default()
        });
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        let err = validate_request(&RequestedNode::named("  ")).unwrap_err();
        assert!(matches!(err, AllocationError::Validation { .. }));
    }

    #[test]
    fn rejects_duplicate_pins_within_a_class() {
        let mut req = RequestedNode::named("web-1");
        let pinned = RequestedProcessor {
            resource: Some("cpu-0".to_string()),
            ..Default::default()
        };
        req.processors = vec![pinned.clone(), pinned];
        assert!(reason(validate_request(&req)).contains("pinned more than once"));
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut req = RequestedNode::named("web-1");
        req.memory.push(RequestedMemory {
            capacity_mib: Some(0),
            ..Default::default()
        });
        assert!(reason(validate_request(&req)).contains("capacity_mib"));
    }

    #[test]
    fn rejects_malformed_mac() {
        let mut req = RequestedNode::named("web-1");
        req.ethernet_interfaces.push(RequestedEthernetInterface {
            mac_address: Some("not-a-mac".to_string()),
            ..Default::default()
        });
        assert!(reason(validate_request(&req)).contains("malformed mac_address"));
    }

    #[test]
    fn rejects_out_of_range_vlan() {
        let mut req = RequestedNode::named("web-1");
        req.ethernet_interfaces.push(RequestedEthernetInterface {
            vlans: vec![4095],
            ..Default::default()
        });
        assert!(reason(validate_request(&req)).contains("vlan 4095"));
    }

    #[test]
    fn rejects_pin_combined_with_mac() {
        let mut req = RequestedNode::named("web-1");
        req.ethernet_interfaces.push(RequestedEthernetInterface {
            resource: Some("nic-1".to_string()),
            mac_address: Some("aa:bb:cc:00:11:22".to_string()),
            ..Default::default()
        });
        assert!(reason(validate_request(&req)).contains("pins both"));
    }

    #[test]
    fn rejects_primary_vlan_missing_from_list() {
        let mut req = RequestedNode::named("web-1");
        req.ethernet_interfaces.push(RequestedEthernetInterface {
            vlans: vec![100],
            primary_vlan: Some(200),
            ..Default::default()
        });
        assert!(reason(validate_request(&req)).contains("primary vlan 200"));
    }
}
