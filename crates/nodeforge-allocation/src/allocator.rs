//! Node allocator: the transactional entry point for composing and
//! tearing down nodes.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use nodeforge_core::{ForgeConfig, RetryPolicy};
use nodeforge_matcher::RequestedNode;
use nodeforge_state::{
    Allocatable, AssemblyStep, ComposedNode, ComputerSystem, EthernetInterface, LocalDrive, Memory,
    NodeState, Processor, Record, RemoteDrive, ResourceClass, ResourceRef, Transaction,
};

use crate::assembly::{AssemblyContext, AssemblyTask};
use crate::error::{AllocationError, AllocationResult, StateResultExt};
use crate::retry::{run_in_transaction, timed};
use crate::state_changer::epoch_secs;
use crate::strategy::{AllocationStrategy, FirstFitStrategy};
use crate::validation::validate_request;

/// Subject named by store errors from whole-table node queries.
const ALL_NODES: &str = "*";

/// A freshly composed node and the tasks that assemble it.
pub struct ComposeOutcome {
    pub node: ComposedNode,
    pub tasks: Vec<Box<dyn AssemblyTask>>,
}

pub struct NodeAllocator {
    context: Arc<AssemblyContext>,
    strategy: Arc<dyn AllocationStrategy>,
    compose_retry: RetryPolicy,
    state_retry: RetryPolicy,
    boot_source: String,
}

/// Steps appended after the strategy's own steps.
fn default_suffix(boot_source: &str) -> [AssemblyStep; 3] {
    [
        AssemblyStep::PowerOff,
        AssemblyStep::BootOverride {
            source: boot_source.to_string(),
        },
        AssemblyStep::MarkAssembled,
    ]
}

impl NodeAllocator {
    pub fn new(context: Arc<AssemblyContext>, config: &ForgeConfig) -> Self {
        Self {
            context,
            strategy: Arc::new(FirstFitStrategy),
            compose_retry: config.allocation_retry(),
            state_retry: config.state_retry(),
            boot_source: config.assembly.boot_source.clone(),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AllocationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn context(&self) -> &Arc<AssemblyContext> {
        &self.context
    }

    /// Compose a node for `requested`.
    ///
    /// Matching and every ownership flip happen in one transaction. On an
    /// optimistic conflict the whole attempt is discarded and rerun against
    /// a fresh catalog read. Validation and infeasibility are never retried.
    pub async fn compose(&self, requested: &RequestedNode) -> AllocationResult<ComposeOutcome> {
        validate_request(requested)?;

        let node_id = Uuid::new_v4().to_string();
        let suffix = default_suffix(&self.boot_source);
        let allocation = timed(
            "compose",
            &requested.name,
            run_in_transaction(
                self.context.persistence(),
                self.compose_retry,
                "compose",
                &requested.name,
                |txn| {
                    let mut allocation = self.strategy.allocate(txn, requested, &node_id, epoch_secs())?;
                    allocation.node.assembly.extend(suffix.iter().cloned());
                    txn.put(&allocation.node).for_node(&node_id)?;
                    Ok(allocation)
                },
            ),
        )
        .await?;

        info!(
            node = %allocation.node.id,
            name = %allocation.node.name,
            system = %allocation.system.id,
            steps = allocation.node.assembly.len(),
            "node composed"
        );
        let tasks = self.context.tasks_for_system(&allocation.node, &allocation.system);
        Ok(ComposeOutcome {
            node: allocation.node,
            tasks,
        })
    }

    pub fn get_node(&self, node_id: &str) -> AllocationResult<ComposedNode> {
        let mut txn = self.context.persistence().begin().for_node(node_id)?;
        let node = txn.get::<ComposedNode>(node_id).for_node(node_id)?;
        txn.rollback();
        node.ok_or_else(|| AllocationError::NodeNotFound(node_id.to_string()))
    }

    pub fn list_nodes(&self) -> AllocationResult<Vec<ComposedNode>> {
        let mut txn = self.context.persistence().begin().for_node(ALL_NODES)?;
        let nodes = txn.list::<ComposedNode>().for_node(ALL_NODES)?;
        txn.rollback();
        Ok(nodes)
    }

    /// Remove one resource from a node and return it to the free pool.
    ///
    /// Remote drives are detached on their fabric first. The backing system
    /// cannot be detached; decompose the node instead.
    pub async fn detach(&self, node_id: &str, resource: &ResourceRef) -> AllocationResult<ComposedNode> {
        if resource.class == ResourceClass::System {
            return Err(AllocationError::validation(
                node_id,
                "the backing system cannot be detached; decompose the node instead",
            ));
        }
        let node = self.get_node(node_id)?;
        if !node.owns(resource) {
            return Err(AllocationError::ResourceNotAttached {
                node: node_id.to_string(),
                resource: resource.clone(),
            });
        }

        if resource.class == ResourceClass::RemoteDrive {
            self.detach_remote(&node, &resource.id).await?;
        }

        let node = run_in_transaction(self.context.persistence(), self.state_retry, "detach", node_id, |txn| {
            let mut node = txn
                .get::<ComposedNode>(node_id)
                .for_node(node_id)?
                .ok_or_else(|| AllocationError::NodeNotFound(node_id.to_string()))?;
            if !node.owns(resource) {
                return Err(AllocationError::ResourceNotAttached {
                    node: node_id.to_string(),
                    resource: resource.clone(),
                });
            }
            release_resource(txn, resource, node_id)?;
            node.resources.retain(|r| r != resource);
            node.updated_at = epoch_secs();
            txn.put(&node).for_node(node_id)?;
            Ok(node)
        })
        .await?;

        info!(node = node_id, %resource, "resource detached");
        Ok(node)
    }

    /// Tear a settled node down: detach its remote drives, free every
    /// resource, and delete the node record.
    ///
    /// Returns the final snapshot of the node, in state `Removed`.
    pub async fn decompose(&self, node_id: &str) -> AllocationResult<ComposedNode> {
        let node = self.get_node(node_id)?;
        ensure_removable(&node)?;

        for drive in node.resources_of(ResourceClass::RemoteDrive) {
            self.detach_remote(&node, &drive.id).await?;
        }

        let removed = run_in_transaction(self.context.persistence(), self.state_retry, "decompose", node_id, |txn| {
            let mut node = txn
                .get::<ComposedNode>(node_id)
                .for_node(node_id)?
                .ok_or_else(|| AllocationError::NodeNotFound(node_id.to_string()))?;
            ensure_removable(&node)?;
            for resource in &node.resources {
                release_resource(txn, resource, node_id)?;
            }
            txn.delete::<ComposedNode>(node_id).for_node(node_id)?;
            node.state = NodeState::Removed;
            node.updated_at = epoch_secs();
            Ok(node)
        })
        .await?;

        info!(node = node_id, resources = removed.resources.len(), "node decomposed");
        Ok(removed)
    }

    async fn detach_remote(&self, node: &ComposedNode, drive_id: &str) -> AllocationResult<()> {
        let drive = {
            let mut txn = self.context.persistence().begin().for_node(&node.id)?;
            let drive = txn.get::<RemoteDrive>(drive_id).for_node(&node.id)?;
            txn.rollback();
            drive
        };
        match drive {
            Some(drive) => {
                self.context
                    .detach_remote_drive(&node.id, &drive, &node.system_id)
                    .await
            }
            // Gone from the catalog: nothing left to detach remotely.
            None => Ok(()),
        }
    }
}

fn ensure_removable(node: &ComposedNode) -> AllocationResult<()> {
    if node.state.can_transition_to(NodeState::Removed) {
        Ok(())
    } else {
        Err(AllocationError::InvalidTransition {
            node: node.id.clone(),
            current: node.state,
            requested: NodeState::Removed,
        })
    }
}

fn release<R: Record + Allocatable>(txn: &mut Transaction, id: &str, node_id: &str) -> AllocationResult<()> {
    if let Some(mut record) = txn.get::<R>(id).for_node(node_id)? {
        if record.owner().map(String::as_str) == Some(node_id) {
            record.set_owner(None);
            txn.put(&record).for_node(node_id)?;
        }
    }
    Ok(())
}

fn release_resource(txn: &mut Transaction, resource: &ResourceRef, node_id: &str) -> AllocationResult<()> {
    let id = resource.id.as_str();
    match resource.class {
        ResourceClass::System => release::<ComputerSystem>(txn, id, node_id),
        ResourceClass::Processor => release::<Processor>(txn, id, node_id),
        ResourceClass::Memory => release::<Memory>(txn, id, node_id),
        ResourceClass::EthernetInterface => release::<EthernetInterface>(txn, id, node_id),
        ResourceClass::LocalDrive => release::<LocalDrive>(txn, id, node_id),
        ResourceClass::RemoteDrive => release::<RemoteDrive>(txn, id, node_id),
    }
}
