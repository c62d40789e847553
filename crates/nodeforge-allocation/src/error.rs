//! Allocation error types.

use thiserror::Error;

use nodeforge_coordination::CoordinationError;
use nodeforge_state::{NodeState, ResourceClass, ResourceRef, StateError};

use crate::remote::RemoteError;

/// Errors surfaced by compose, assembly, state changes and detach.
///
/// Every variant names the node (id, or requested name before an id exists)
/// so callers can act without inspecting internals.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// The request is self-inconsistent. Never retried.
    #[error("invalid request for {node}: {reason}")]
    Validation { node: String, reason: String },

    /// Some requested item has no matching candidate. Never retried.
    #[error("cannot compose {node}: {class} {constraint}")]
    Infeasible {
        node: String,
        class: ResourceClass,
        requested_index: Option<usize>,
        constraint: String,
    },

    /// Every attempt lost an optimistic conflict.
    #[error("{operation} for {node} gave up after {attempts} conflicting attempts")]
    RetriesExhausted {
        operation: &'static str,
        node: String,
        attempts: u32,
    },

    #[error("composed node not found: {0}")]
    NodeNotFound(String),

    #[error("node {node} cannot move from {current} to {requested}")]
    InvalidTransition {
        node: String,
        current: NodeState,
        requested: NodeState,
    },

    #[error("node {node} does not own {resource}")]
    ResourceNotAttached { node: String, resource: ResourceRef },

    #[error("lock error for node {node}: {source}")]
    Lock {
        node: String,
        #[source]
        source: CoordinationError,
    },

    #[error("remote call for node {node} failed: {source}")]
    Remote {
        node: String,
        #[source]
        source: RemoteError,
    },

    #[error("state store error for node {node}: {source}")]
    State {
        node: String,
        #[source]
        source: StateError,
    },
}

impl AllocationError {
    /// Whether the failure is a transient optimistic conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, AllocationError::State { source, .. } if source.is_conflict())
    }

    pub(crate) fn validation(node: &str, reason: impl Into<String>) -> Self {
        AllocationError::Validation {
            node: node.to_string(),
            reason: reason.into(),
        }
    }
}

pub type AllocationResult<T> = Result<T, AllocationError>;

/// Names the node a store failure happened for.
pub(crate) trait StateResultExt<T> {
    fn for_node(self, node: &str) -> AllocationResult<T>;
}

impl<T> StateResultExt<T> for Result<T, StateError> {
    fn for_node(self, node: &str) -> AllocationResult<T> {
        self.map_err(|source| AllocationError::State {
            node: node.to_string(),
            source,
        })
    }
}
