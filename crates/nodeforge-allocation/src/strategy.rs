//! Allocation strategy: pick a backing system and bind every requested item.
//!
//! The strategy runs inside the caller's transaction. It reads the catalog
//! from the transaction snapshot, flips ownership of everything it binds,
//! and returns the node draft. Committing is the caller's job.

use tracing::{debug, info};

use nodeforge_matcher::{
    AllocationMapping, RequestedNode, SwitchPortIndex, match_ethernet_interfaces, match_local_drives,
    match_memory, match_processors, match_remote_drives,
};
use nodeforge_state::{
    Allocatable, AssemblyStep, ComposedNode, ComputerSystem, EthernetInterface, LocalDrive, Memory,
    NodeState, Processor, Record, RemoteDrive, ResourceClass, ResourceRef, SwitchPort, Transaction,
};

use crate::error::{AllocationError, AllocationResult, StateResultExt};

/// Outcome of a successful strategy run.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Draft in state `Allocated`; `assembly` holds the strategy steps.
    pub node: ComposedNode,
    pub system: ComputerSystem,
}

pub trait AllocationStrategy: Send + Sync {
    fn allocate(
        &self,
        txn: &mut Transaction,
        requested: &RequestedNode,
        node_id: &str,
        now: u64,
    ) -> AllocationResult<Allocation>;
}

/// First-fit over free, healthy systems in ascending id order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFitStrategy;

/// Everything bound on one candidate system.
struct SystemFit {
    processors: AllocationMapping<Processor>,
    memory: AllocationMapping<Memory>,
    ethernet_interfaces: AllocationMapping<EthernetInterface>,
    local_drives: AllocationMapping<LocalDrive>,
}

impl SystemFit {
    fn first_unmet(&self, node: &str) -> Option<AllocationError> {
        infeasible(node, &self.processors)
            .or_else(|| infeasible(node, &self.memory))
            .or_else(|| infeasible(node, &self.ethernet_interfaces))
            .or_else(|| infeasible(node, &self.local_drives))
    }
}

fn infeasible<A>(node: &str, mapping: &AllocationMapping<A>) -> Option<AllocationError> {
    mapping.first_unmet().map(|unmet| AllocationError::Infeasible {
        node: node.to_string(),
        class: mapping.class,
        requested_index: Some(unmet.requested_index),
        constraint: unmet.reason.to_string(),
    })
}

fn system_infeasible(node: &str, constraint: impl Into<String>) -> AllocationError {
    AllocationError::Infeasible {
        node: node.to_string(),
        class: ResourceClass::System,
        requested_index: None,
        constraint: constraint.into(),
    }
}

fn free_on<R: Allocatable + Clone>(records: &[R], system_id: &str, on: impl Fn(&R) -> &str) -> Vec<R> {
    records
        .iter()
        .filter(|r| r.is_free() && on(r) == system_id)
        .cloned()
        .collect()
}

/// Every pinned id must name an existing record of its class.
fn check_pins_exist<R: Allocatable>(
    node: &str,
    class: ResourceClass,
    pins: impl Iterator<Item = Option<String>>,
    records: &[R],
) -> AllocationResult<()> {
    for pin in pins.flatten() {
        if !records.iter().any(|r| *r.resource_id() == pin) {
            return Err(AllocationError::validation(
                node,
                format!("pinned {class} {pin} does not exist"),
            ));
        }
    }
    Ok(())
}

fn claim<R: Record + Allocatable>(
    txn: &mut Transaction,
    class: ResourceClass,
    record: &R,
    node_id: &str,
    resources: &mut Vec<ResourceRef>,
) -> AllocationResult<()> {
    let mut owned = record.clone();
    owned.set_owner(Some(node_id.to_string()));
    txn.put(&owned).for_node(node_id)?;
    resources.push(ResourceRef::new(class, owned.resource_id().clone()));
    Ok(())
}

impl AllocationStrategy for FirstFitStrategy {
    fn allocate(
        &self,
        txn: &mut Transaction,
        requested: &RequestedNode,
        node_id: &str,
        now: u64,
    ) -> AllocationResult<Allocation> {
        let name = requested.name.as_str();

        let mut systems: Vec<ComputerSystem> = txn.list().for_node(node_id)?;
        let processors: Vec<Processor> = txn.list().for_node(node_id)?;
        let memory: Vec<Memory> = txn.list().for_node(node_id)?;
        let nics: Vec<EthernetInterface> = txn.list().for_node(node_id)?;
        let switch_ports: Vec<SwitchPort> = txn.list().for_node(node_id)?;
        let local_drives: Vec<LocalDrive> = txn.list().for_node(node_id)?;
        let remote_drives: Vec<RemoteDrive> = txn.list().for_node(node_id)?;

        check_pins_exist(name, ResourceClass::System, std::iter::once(requested.system.clone()), &systems)?;
        check_pins_exist(
            name,
            ResourceClass::Processor,
            requested.processors.iter().map(|p| p.resource.clone()),
            &processors,
        )?;
        check_pins_exist(name, ResourceClass::Memory, requested.memory.iter().map(|m| m.resource.clone()), &memory)?;
        check_pins_exist(
            name,
            ResourceClass::EthernetInterface,
            requested.ethernet_interfaces.iter().map(|e| e.resource.clone()),
            &nics,
        )?;
        check_pins_exist(
            name,
            ResourceClass::LocalDrive,
            requested.local_drives.iter().map(|d| d.resource.clone()),
            &local_drives,
        )?;
        check_pins_exist(
            name,
            ResourceClass::RemoteDrive,
            requested.remote_drives.iter().map(|d| d.resource.clone()),
            &remote_drives,
        )?;

        // Remote drives are pooled, not tied to a system: match them once.
        let free_remote: Vec<RemoteDrive> = remote_drives.into_iter().filter(|d| d.is_free()).collect();
        let remote = match_remote_drives(&requested.remote_drives, free_remote);
        if let Some(err) = infeasible(name, &remote) {
            return Err(err);
        }

        let neighbors = SwitchPortIndex::new(switch_ports);
        systems.sort_by(|a, b| a.id.cmp(&b.id));

        let mut first_failure = None;
        let mut chosen = None;
        for system in systems {
            if let Some(pinned) = &requested.system {
                if system.id != *pinned {
                    continue;
                }
                if !system.is_free() || !system.health.is_healthy() {
                    return Err(system_infeasible(name, format!("pinned system {pinned} is not available")));
                }
            }
            if !system.is_free() || !system.health.is_healthy() {
                continue;
            }

            let sys_processors = free_on(&processors, &system.id, |p| p.system_id.as_str());
            let sys_memory = free_on(&memory, &system.id, |m| m.system_id.as_str());

            if let Some(wanted) = requested.total_system_core_count {
                let cores: u32 = sys_processors.iter().filter_map(|p| p.total_cores).sum();
                if cores < wanted {
                    debug!(system = %system.id, cores, wanted, "skipping system: too few free cores");
                    first_failure.get_or_insert_with(|| {
                        system_infeasible(name, format!("no system with {wanted} free cores"))
                    });
                    continue;
                }
            }
            if let Some(wanted) = requested.total_system_memory_mib {
                let mib: u64 = sys_memory.iter().filter_map(|m| m.capacity_mib).sum();
                if mib < wanted {
                    debug!(system = %system.id, mib, wanted, "skipping system: too little free memory");
                    first_failure.get_or_insert_with(|| {
                        system_infeasible(name, format!("no system with {wanted} MiB free memory"))
                    });
                    continue;
                }
            }

            let fit = SystemFit {
                processors: match_processors(&requested.processors, sys_processors),
                memory: match_memory(&requested.memory, sys_memory),
                ethernet_interfaces: match_ethernet_interfaces(
                    &requested.ethernet_interfaces,
                    free_on(&nics, &system.id, |n| n.system_id.as_str()),
                    &neighbors,
                ),
                local_drives: match_local_drives(
                    &requested.local_drives,
                    free_on(&local_drives, &system.id, |d| d.system_id.as_str()),
                ),
            };
            match fit.first_unmet(name) {
                Some(err) => {
                    debug!(system = %system.id, error = %err, "system does not fit");
                    first_failure.get_or_insert(err);
                }
                None => {
                    chosen = Some((system, fit));
                    break;
                }
            }
        }

        let Some((system, fit)) = chosen else {
            return Err(first_failure
                .unwrap_or_else(|| system_infeasible(name, "no free healthy computer system")));
        };

        let mut resources = Vec::with_capacity(requested.item_count() + 1);
        claim(txn, ResourceClass::System, &system, node_id, &mut resources)?;
        for p in fit.processors.resources() {
            claim(txn, ResourceClass::Processor, p, node_id, &mut resources)?;
        }
        for m in fit.memory.resources() {
            claim(txn, ResourceClass::Memory, m, node_id, &mut resources)?;
        }
        for n in fit.ethernet_interfaces.resources() {
            claim(txn, ResourceClass::EthernetInterface, n, node_id, &mut resources)?;
        }
        for d in fit.local_drives.resources() {
            claim(txn, ResourceClass::LocalDrive, d, node_id, &mut resources)?;
        }

        let mut assembly = vec![AssemblyStep::MarkAssembling];
        for d in remote.resources() {
            claim(txn, ResourceClass::RemoteDrive, d, node_id, &mut resources)?;
            assembly.push(AssemblyStep::AttachRemoteDrive {
                drive_id: d.id.clone(),
                service_id: d.service_id.clone(),
            });
        }

        info!(
            node = node_id,
            name,
            system = %system.id,
            resources = resources.len(),
            "resources allocated"
        );

        let mut system = system;
        system.set_owner(Some(node_id.to_string()));
        let node = ComposedNode {
            id: node_id.to_string(),
            name: requested.name.clone(),
            description: requested.description.clone(),
            state: NodeState::Allocated,
            system_id: system.id.clone(),
            resources,
            assembly,
            created_at: now,
            updated_at: now,
        };
        Ok(Allocation { node, system })
    }
}
