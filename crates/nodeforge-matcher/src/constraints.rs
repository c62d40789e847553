//! Per-class constraint tables.
//!
//! | class | sort threshold | selection |
//! |---|---|---|
//! | processor | total cores | single |
//! | memory | capacity MiB | cumulative |
//! | ethernet interface | speed Mbps | single |
//! | local drive | capacity GiB | cumulative |
//! | remote drive | capacity GiB | single |

use tracing::warn;

use nodeforge_state::{
    EthernetInterface, LocalDrive, Memory, Processor, RemoteDrive, ResourceClass,
};

use crate::engine::{
    AllocationMapping, Check, Relation, ResourceKind, Selection, match_resources,
};
use crate::lookup::{NeighborLookup, NoNeighbors};
use crate::request::*;

fn widen(value: Option<u32>) -> Option<u64> {
    value.map(u64::from)
}

fn exact<'a>(field: &'static str, requested: &'a Option<String>, offered: &'a Option<String>) -> Check<'a> {
    Check::Equals {
        field,
        requested: requested.as_deref(),
        offered: offered.as_deref(),
        ignore_case: false,
    }
}

// ── Processor ──────────────────────────────────────────────────────

pub struct ProcessorKind;

impl ResourceKind for ProcessorKind {
    type Requested = RequestedProcessor;
    type Available = Processor;

    const CLASS: ResourceClass = ResourceClass::Processor;
    const SELECTION: Selection = Selection::Single;
    const THRESHOLD_FIELD: &'static str = "total_cores";

    fn pinned(requested: &RequestedProcessor) -> Option<&str> {
        requested.resource.as_deref()
    }

    fn requested_threshold(requested: &RequestedProcessor) -> Option<u64> {
        widen(requested.total_cores)
    }

    fn available_id(available: &Processor) -> &str {
        &available.id
    }

    fn offered_threshold(available: &Processor) -> Option<u64> {
        widen(available.total_cores)
    }

    fn checks<'a>(requested: &'a RequestedProcessor, available: &'a Processor) -> Vec<Check<'a>> {
        vec![
            Check::AtLeast {
                field: "total_cores",
                requested: widen(requested.total_cores),
                offered: widen(available.total_cores),
            },
            Check::AtLeast {
                field: "achievable_speed_mhz",
                requested: widen(requested.achievable_speed_mhz),
                offered: widen(available.achievable_speed_mhz),
            },
            exact("model", &requested.model, &available.model),
            exact("manufacturer", &requested.manufacturer, &available.manufacturer),
            exact("instruction_set", &requested.instruction_set, &available.instruction_set),
        ]
    }
}

// ── Memory ─────────────────────────────────────────────────────────

pub struct MemoryKind;

impl ResourceKind for MemoryKind {
    type Requested = RequestedMemory;
    type Available = Memory;

    const CLASS: ResourceClass = ResourceClass::Memory;
    const SELECTION: Selection = Selection::Cumulative;
    const THRESHOLD_FIELD: &'static str = "capacity_mib";

    fn pinned(requested: &RequestedMemory) -> Option<&str> {
        requested.resource.as_deref()
    }

    fn requested_threshold(requested: &RequestedMemory) -> Option<u64> {
        requested.capacity_mib
    }

    fn available_id(available: &Memory) -> &str {
        &available.id
    }

    fn offered_threshold(available: &Memory) -> Option<u64> {
        available.capacity_mib
    }

    fn checks<'a>(requested: &'a RequestedMemory, available: &'a Memory) -> Vec<Check<'a>> {
        vec![
            Check::AtLeast {
                field: "speed_mhz",
                requested: widen(requested.speed_mhz),
                offered: widen(available.speed_mhz),
            },
            Check::AtLeast {
                field: "data_width_bits",
                requested: widen(requested.data_width_bits),
                offered: widen(available.data_width_bits),
            },
            exact("device_type", &requested.device_type, &available.device_type),
            exact("manufacturer", &requested.manufacturer, &available.manufacturer),
        ]
    }
}

// ── Ethernet interface ─────────────────────────────────────────────

pub struct EthernetKind;

impl ResourceKind for EthernetKind {
    type Requested = RequestedEthernetInterface;
    type Available = EthernetInterface;

    const CLASS: ResourceClass = ResourceClass::EthernetInterface;
    const SELECTION: Selection = Selection::Single;
    const THRESHOLD_FIELD: &'static str = "speed_mbps";

    fn pinned(requested: &RequestedEthernetInterface) -> Option<&str> {
        requested.resource.as_deref()
    }

    fn requested_threshold(requested: &RequestedEthernetInterface) -> Option<u64> {
        widen(requested.speed_mbps)
    }

    fn available_id(available: &EthernetInterface) -> &str {
        &available.id
    }

    fn offered_threshold(available: &EthernetInterface) -> Option<u64> {
        widen(available.speed_mbps)
    }

    fn checks<'a>(
        requested: &'a RequestedEthernetInterface,
        available: &'a EthernetInterface,
    ) -> Vec<Check<'a>> {
        vec![
            Check::AtLeast {
                field: "speed_mbps",
                requested: widen(requested.speed_mbps),
                offered: widen(available.speed_mbps),
            },
            Check::Equals {
                field: "mac_address",
                requested: requested.mac_address.as_deref(),
                offered: available.mac_address.as_deref(),
                ignore_case: true,
            },
        ]
    }

    fn relation(
        requested: &RequestedEthernetInterface,
        available: &EthernetInterface,
        lookup: &dyn NeighborLookup,
    ) -> Relation {
        if requested.vlans.is_empty() {
            return Relation::Satisfied;
        }
        let Some(mac) = available.mac_address.as_deref() else {
            return Relation::Unsatisfied("neighbor switch port");
        };
        match lookup.neighbor_port(mac) {
            Ok(Some(port)) if port.health.is_healthy() => Relation::Satisfied,
            Ok(Some(_)) => Relation::Unsatisfied("healthy neighbor switch port"),
            Ok(None) => Relation::Unsatisfied("neighbor switch port"),
            Err(e) => {
                warn!(interface = %available.id, error = %e, "ambiguous neighbor switch port, skipping interface");
                Relation::Unsatisfied("unambiguous neighbor switch port")
            }
        }
    }
}

// ── Local drive ────────────────────────────────────────────────────

pub struct LocalDriveKind;

impl ResourceKind for LocalDriveKind {
    type Requested = RequestedLocalDrive;
    type Available = LocalDrive;

    const CLASS: ResourceClass = ResourceClass::LocalDrive;
    const SELECTION: Selection = Selection::Cumulative;
    const THRESHOLD_FIELD: &'static str = "capacity_gib";

    fn pinned(requested: &RequestedLocalDrive) -> Option<&str> {
        requested.resource.as_deref()
    }

    fn requested_threshold(requested: &RequestedLocalDrive) -> Option<u64> {
        requested.capacity_gib
    }

    fn available_id(available: &LocalDrive) -> &str {
        &available.id
    }

    fn offered_threshold(available: &LocalDrive) -> Option<u64> {
        available.capacity_gib
    }

    fn checks<'a>(requested: &'a RequestedLocalDrive, available: &'a LocalDrive) -> Vec<Check<'a>> {
        vec![
            Check::AtLeast {
                field: "rotation_speed_rpm",
                requested: widen(requested.min_rpm),
                offered: widen(available.rotation_speed_rpm),
            },
            exact("media_type", &requested.media_type, &available.media_type),
            exact("protocol", &requested.protocol, &available.protocol),
            exact("manufacturer", &requested.manufacturer, &available.manufacturer),
            exact("serial_number", &requested.serial_number, &available.serial_number),
        ]
    }
}

// ── Remote drive ───────────────────────────────────────────────────

pub struct RemoteDriveKind;

impl ResourceKind for RemoteDriveKind {
    type Requested = RequestedRemoteDrive;
    type Available = RemoteDrive;

    const CLASS: ResourceClass = ResourceClass::RemoteDrive;
    const SELECTION: Selection = Selection::Single;
    const THRESHOLD_FIELD: &'static str = "capacity_gib";

    fn pinned(requested: &RequestedRemoteDrive) -> Option<&str> {
        requested.resource.as_deref()
    }

    fn requested_threshold(requested: &RequestedRemoteDrive) -> Option<u64> {
        requested.capacity_gib
    }

    fn available_id(available: &RemoteDrive) -> &str {
        &available.id
    }

    fn offered_threshold(available: &RemoteDrive) -> Option<u64> {
        available.capacity_gib
    }

    fn checks<'a>(requested: &'a RequestedRemoteDrive, available: &'a RemoteDrive) -> Vec<Check<'a>> {
        vec![
            Check::AtLeast {
                field: "capacity_gib",
                requested: requested.capacity_gib,
                offered: available.capacity_gib,
            },
            exact("protocol", &requested.protocol, &available.protocol),
            exact("master", &requested.master, &available.master),
        ]
    }
}

// ── Convenience entry points ───────────────────────────────────────

pub fn match_processors(
    requested: &[RequestedProcessor],
    available: Vec<Processor>,
) -> AllocationMapping<Processor> {
    match_resources::<ProcessorKind>(requested, available, &NoNeighbors)
}

pub fn match_memory(requested: &[RequestedMemory], available: Vec<Memory>) -> AllocationMapping<Memory> {
    match_resources::<MemoryKind>(requested, available, &NoNeighbors)
}

pub fn match_ethernet_interfaces(
    requested: &[RequestedEthernetInterface],
    available: Vec<EthernetInterface>,
    lookup: &dyn NeighborLookup,
) -> AllocationMapping<EthernetInterface> {
    match_resources::<EthernetKind>(requested, available, lookup)
}

pub fn match_local_drives(
    requested: &[RequestedLocalDrive],
    available: Vec<LocalDrive>,
) -> AllocationMapping<LocalDrive> {
    match_resources::<LocalDriveKind>(requested, available, &NoNeighbors)
}

pub fn match_remote_drives(
    requested: &[RequestedRemoteDrive],
    available: Vec<RemoteDrive>,
) -> AllocationMapping<RemoteDrive> {
    match_resources::<RemoteDriveKind>(requested, available, &NoNeighbors)
}
