//! Isolated, retried state changes of composed nodes.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use nodeforge_core::RetryPolicy;
use nodeforge_state::{ComposedNode, NodeState, Persistence};

use crate::error::{AllocationError, AllocationResult, StateResultExt};
use crate::retry::run_in_transaction;

/// Moves composed nodes through their lifecycle, one transaction per change.
#[derive(Clone)]
pub struct StateChanger {
    persistence: Arc<dyn Persistence>,
    retry: RetryPolicy,
}

impl StateChanger {
    pub fn new(persistence: Arc<dyn Persistence>, retry: RetryPolicy) -> Self {
        Self { persistence, retry }
    }

    /// Set `node_id`'s state to `next`.
    ///
    /// Re-applying the current state succeeds without writing. Illegal
    /// transitions fail immediately and are never retried.
    pub async fn change_state(&self, node_id: &str, next: NodeState) -> AllocationResult<ComposedNode> {
        let node = run_in_transaction(&*self.persistence, self.retry, "change_state", node_id, |txn| {
            let mut node = txn
                .get::<ComposedNode>(node_id)
                .for_node(node_id)?
                .ok_or_else(|| AllocationError::NodeNotFound(node_id.to_string()))?;
            if node.state == next {
                return Ok(node);
            }
            if !node.state.can_transition_to(next) {
                return Err(AllocationError::InvalidTransition {
                    node: node_id.to_string(),
                    current: node.state,
                    requested: next,
                });
            }
            node.state = next;
            node.updated_at = epoch_secs();
            txn.put(&node).for_node(node_id)?;
            Ok(node)
        })
        .await?;

        info!(node = node_id, state = %node.state, "node state changed");
        Ok(node)
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use nodeforge_state::StateStore;

    use super::*;

    fn node(id: &str, state: NodeState) -> ComposedNode {
        ComposedNode {
            id: id.to_string(),
            name: "web-1".to_string(),
            description: None,
            state,
            system_id: "sys-1".to_string(),
            resources: Vec::new(),
            assembly: Vec::new(),
            created_at: 1,
            updated_at: 1,
        }
    }

    fn changer(store: &StateStore) -> StateChanger {
        StateChanger::new(Arc::new(store.clone()), RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn applies_forward_transition() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&node("n-1", NodeState::Allocated)).unwrap();

        let updated = changer(&store).change_state("n-1", NodeState::Assembling).await.unwrap();

        assert_eq!(updated.state, NodeState::Assembling);
        assert_eq!(store.get_node("n-1").unwrap().unwrap().state, NodeState::Assembling);
    }

    #[tokio::test]
    async fn rejects_backward_transition() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&node("n-1", NodeState::Assembled)).unwrap();

        let err = changer(&store).change_state("n-1", NodeState::Allocated).await.unwrap_err();

        assert!(matches!(
            err,
            AllocationError::InvalidTransition {
                current: NodeState::Assembled,
                requested: NodeState::Allocated,
                ..
            }
        ));
        assert_eq!(store.get_node("n-1").unwrap().unwrap().state, NodeState::Assembled);
    }

    #[tokio::test]
    async fn same_state_is_a_noop() {
        let store = StateStore::open_in_memory().unwrap();
        store.put(&node("n-1", NodeState::Failed)).unwrap();
        let before = store.version_of::<ComposedNode>("n-1").unwrap();

        changer(&store).change_state("n-1", NodeState::Failed).await.unwrap();

        assert_eq!(store.version_of::<ComposedNode>("n-1").unwrap(), before);
    }

    #[tokio::test]
    async fn missing_node_is_reported() {
        let store = StateStore::open_in_memory().unwrap();
        let err = changer(&store).change_state("ghost", NodeState::Failed).await.unwrap_err();
        assert!(matches!(err, AllocationError::NodeNotFound(id) if id == "ghost"));
    }
}
