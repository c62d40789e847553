//! Catalog side lookups used by relational constraints.

use std::collections::HashMap;

use thiserror::Error;

use nodeforge_state::SwitchPort;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("{matches} switch ports report neighbor {mac}")]
    Ambiguous { mac: String, matches: usize },
}

/// Finds the switch port on the other end of an ethernet interface's link.
pub trait NeighborLookup {
    fn neighbor_port(&self, mac: &str) -> Result<Option<SwitchPort>, LookupError>;
}

/// Lookup for callers that have no switch topology.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNeighbors;

impl NeighborLookup for NoNeighbors {
    fn neighbor_port(&self, _mac: &str) -> Result<Option<SwitchPort>, LookupError> {
        Ok(None)
    }
}

/// In-memory index of switch ports by (case-folded) neighbor MAC address.
#[derive(Debug, Clone, Default)]
pub struct SwitchPortIndex {
    by_mac: HashMap<String, Vec<SwitchPort>>,
}

impl SwitchPortIndex {
    pub fn new(ports: impl IntoIterator<Item = SwitchPort>) -> Self {
        let mut by_mac: HashMap<String, Vec<SwitchPort>> = HashMap::new();
        for port in ports {
            if let Some(mac) = &port.neighbor_mac {
                by_mac.entry(mac.to_ascii_lowercase()).or_default().push(port);
            }
        }
        Self { by_mac }
    }
}

impl NeighborLookup for SwitchPortIndex {
    fn neighbor_port(&self, mac: &str) -> Result<Option<SwitchPort>, LookupError> {
        match self.by_mac.get(&mac.to_ascii_lowercase()).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([port]) => Ok(Some(port.clone())),
            Some(ports) => Err(LookupError::Ambiguous {
                mac: mac.to_string(),
                matches: ports.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(id: &str, mac: &str) -> SwitchPort {
        SwitchPort {
            id: id.to_string(),
            switch_id: "sw-1".to_string(),
            neighbor_mac: Some(mac.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn finds_unique_neighbor_ignoring_case() {
        let index = SwitchPortIndex::new([port("p1", "AA:BB:CC:00:00:01")]);
        let found = index.neighbor_port("aa:bb:cc:00:00:01").unwrap();
        assert_eq!(found.map(|p| p.id), Some("p1".to_string()));
    }

    #[test]
    fn missing_neighbor_is_none() {
        let index = SwitchPortIndex::new([port("p1", "aa:bb:cc:00:00:01")]);
        assert!(index.neighbor_port("aa:bb:cc:00:00:02").unwrap().is_none());
    }

    #[test]
    fn duplicate_neighbor_is_ambiguous() {
        let index = SwitchPortIndex::new([
            port("p1", "aa:bb:cc:00:00:01"),
            port("p2", "aa:bb:cc:00:00:01"),
        ]);
        let err = index.neighbor_port("aa:bb:cc:00:00:01").unwrap_err();
        assert_eq!(
            err,
            LookupError::Ambiguous {
                mac: "aa:bb:cc:00:00:01".to_string(),
                matches: 2
            }
        );
    }
}
