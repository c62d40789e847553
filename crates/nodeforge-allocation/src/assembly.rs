//! Post-allocation assembly.
//!
//! A composed node carries its planned steps as [`AssemblyStep`]
//! descriptors. [`AssemblyContext::tasks_for`] turns them into runnable
//! [`AssemblyTask`]s and [`run_assembly_tasks`] executes them in order,
//! stopping at the first failure and handing that failure to a
//! [`TaskExceptionHandler`] exactly once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use nodeforge_coordination::{HolderId, LockCoordinator, TaskCoordinator};
use nodeforge_core::ForgeConfig;
use nodeforge_state::{AssemblyStep, ComposedNode, ComputerSystem, NodeState, Persistence, RemoteDrive};

use crate::error::{AllocationError, AllocationResult, StateResultExt};
use crate::remote::{PowerAction, RemoteCallError, RemoteError, RemoteService};
use crate::state_changer::StateChanger;

/// Lock serializing attach/detach calls against storage fabrics.
pub const ATTACHMENT_LOCK: &str = "remote-target-attachment";

/// One side-effecting step of node assembly.
#[async_trait]
pub trait AssemblyTask: Send + Sync {
    /// Short human-readable description, used in logs and handler calls.
    fn name(&self) -> String;

    async fn run(&self) -> AllocationResult<()>;
}

/// Decides what a failed chain means.
#[async_trait]
pub trait TaskExceptionHandler: Send + Sync {
    /// Called once with the failing task's name and error. Returning `Ok`
    /// swallows the failure.
    async fn handle(&self, task: &str, error: AllocationError) -> AllocationResult<()>;
}

/// Run `tasks` strictly in order.
///
/// On the first failure no further task runs and `handler` is invoked
/// exactly once; its result becomes the chain's result. Completed tasks are
/// never rolled back.
pub async fn run_assembly_tasks(
    tasks: &[Box<dyn AssemblyTask>],
    handler: &dyn TaskExceptionHandler,
) -> AllocationResult<()> {
    for (index, task) in tasks.iter().enumerate() {
        let name = task.name();
        debug!(task = %name, index, total = tasks.len(), "running assembly task");
        if let Err(e) = task.run().await {
            warn!(task = %name, error = %e, "assembly task failed, stopping chain");
            return handler.handle(&name, e).await;
        }
    }
    Ok(())
}

/// Hands the error straight back to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropagateHandler;

#[async_trait]
impl TaskExceptionHandler for PropagateHandler {
    async fn handle(&self, _task: &str, error: AllocationError) -> AllocationResult<()> {
        Err(error)
    }
}

/// Marks the node `Failed`, then propagates the original error.
pub struct FailNodeHandler {
    node_id: String,
    state: StateChanger,
}

impl FailNodeHandler {
    pub fn new(node_id: impl Into<String>, state: StateChanger) -> Self {
        Self {
            node_id: node_id.into(),
            state,
        }
    }
}

#[async_trait]
impl TaskExceptionHandler for FailNodeHandler {
    async fn handle(&self, task: &str, error: AllocationError) -> AllocationResult<()> {
        error!(node = %self.node_id, task, error = %error, "assembly failed");
        if let Err(e) = self.state.change_state(&self.node_id, NodeState::Failed).await {
            error!(node = %self.node_id, error = %e, "could not mark node failed");
        }
        Err(error)
    }
}

/// Shared dependencies of every assembly task.
pub struct AssemblyContext {
    persistence: Arc<dyn Persistence>,
    state: StateChanger,
    remote: Arc<dyn RemoteService>,
    locks: Arc<LockCoordinator>,
    remote_calls: TaskCoordinator<(), RemoteCallError>,
    lock_timeout: Duration,
    boot_override_attempts: u32,
    boot_override_interval: Duration,
}

impl AssemblyContext {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        remote: Arc<dyn RemoteService>,
        locks: Arc<LockCoordinator>,
        config: &ForgeConfig,
    ) -> Self {
        Self {
            state: StateChanger::new(Arc::clone(&persistence), config.state_retry()),
            persistence,
            remote,
            locks,
            remote_calls: TaskCoordinator::new(),
            lock_timeout: config.lock_timeout(),
            boot_override_attempts: config.assembly.boot_override_attempts,
            boot_override_interval: config.boot_override_interval(),
        }
    }

    pub fn state_changer(&self) -> &StateChanger {
        &self.state
    }

    pub(crate) fn persistence(&self) -> &dyn Persistence {
        &*self.persistence
    }

    /// Build the runnable tasks for a persisted node, looking up its
    /// backing system.
    pub fn tasks_for(self: &Arc<Self>, node: &ComposedNode) -> AllocationResult<Vec<Box<dyn AssemblyTask>>> {
        let mut txn = self.persistence.begin().for_node(&node.id)?;
        let system = txn
            .get::<ComputerSystem>(&node.system_id)
            .for_node(&node.id)?
            .ok_or_else(|| AllocationError::validation(&node.id, format!("backing system {} is gone", node.system_id)))?;
        txn.rollback();
        Ok(self.tasks_for_system(node, &system))
    }

    pub(crate) fn tasks_for_system(
        self: &Arc<Self>,
        node: &ComposedNode,
        system: &ComputerSystem,
    ) -> Vec<Box<dyn AssemblyTask>> {
        let target = Target {
            node_id: node.id.clone(),
            system_id: system.id.clone(),
            service_id: system.service_id.clone(),
        };
        node.assembly
            .iter()
            .map(|step| -> Box<dyn AssemblyTask> {
                let ctx = Arc::clone(self);
                let target = target.clone();
                match step {
                    AssemblyStep::MarkAssembling => Box::new(ChangeStateTask {
                        ctx,
                        target,
                        state: NodeState::Assembling,
                    }),
                    AssemblyStep::MarkAssembled => Box::new(ChangeStateTask {
                        ctx,
                        target,
                        state: NodeState::Assembled,
                    }),
                    AssemblyStep::AttachRemoteDrive { drive_id, service_id } => Box::new(AttachRemoteDriveTask {
                        ctx,
                        target,
                        drive_id: drive_id.clone(),
                        fabric_id: service_id.clone(),
                    }),
                    AssemblyStep::PowerOff => Box::new(PowerOffTask { ctx, target }),
                    AssemblyStep::BootOverride { source } => Box::new(BootOverrideTask {
                        ctx,
                        target,
                        source: source.clone(),
                    }),
                }
            })
            .collect()
    }

    /// Attach `drive` to the node's system under the attachment lock.
    /// Concurrent identical attaches collapse into one remote call.
    async fn attach_remote_drive(&self, target: &Target, drive_id: &str, fabric_id: &str) -> AllocationResult<()> {
        let key = format!("attach:{fabric_id}:{drive_id}");
        let outcome = self
            .remote_calls
            .run(&key, || {
                self.locks.with_lock(ATTACHMENT_LOCK, HolderId::next(), self.lock_timeout, async {
                    self.remote
                        .attach_endpoint(fabric_id, drive_id, &target.system_id)
                        .await
                        .map_err(RemoteCallError::from)
                })
            })
            .await;
        into_allocation_error(&target.node_id, outcome)
    }

    /// Detach `drive` from `system_id`. A drive that is already gone on the
    /// fabric counts as detached.
    pub(crate) async fn detach_remote_drive(
        &self,
        node_id: &str,
        drive: &RemoteDrive,
        system_id: &str,
    ) -> AllocationResult<()> {
        let key = format!("detach:{}:{}", drive.service_id, drive.id);
        let outcome = self
            .remote_calls
            .run(&key, || {
                self.locks.with_lock(ATTACHMENT_LOCK, HolderId::next(), self.lock_timeout, async {
                    match self.remote.detach_endpoint(&drive.service_id, &drive.id, system_id).await {
                        Err(e) if e.is_not_found() => {
                            info!(node = node_id, drive = %drive.id, "remote drive already detached");
                            Ok(())
                        }
                        other => other.map_err(RemoteCallError::from),
                    }
                })
            })
            .await;
        into_allocation_error(node_id, outcome)
    }
}

fn into_allocation_error(node_id: &str, outcome: Result<(), RemoteCallError>) -> AllocationResult<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(RemoteCallError::Coordination(source)) => Err(AllocationError::Lock {
            node: node_id.to_string(),
            source,
        }),
        Err(RemoteCallError::Remote(source)) => Err(AllocationError::Remote {
            node: node_id.to_string(),
            source,
        }),
    }
}

#[derive(Debug, Clone)]
struct Target {
    node_id: String,
    system_id: String,
    /// Management service of the backing system.
    service_id: String,
}

struct ChangeStateTask {
    ctx: Arc<AssemblyContext>,
    target: Target,
    state: NodeState,
}

#[async_trait]
impl AssemblyTask for ChangeStateTask {
    fn name(&self) -> String {
        format!("mark-{}({})", self.state, self.target.node_id)
    }

    async fn run(&self) -> AllocationResult<()> {
        self.ctx.state.change_state(&self.target.node_id, self.state).await?;
        Ok(())
    }
}

struct AttachRemoteDriveTask {
    ctx: Arc<AssemblyContext>,
    target: Target,
    drive_id: String,
    fabric_id: String,
}

#[async_trait]
impl AssemblyTask for AttachRemoteDriveTask {
    fn name(&self) -> String {
        format!("attach-remote-drive({} -> {})", self.drive_id, self.target.system_id)
    }

    async fn run(&self) -> AllocationResult<()> {
        self.ctx
            .attach_remote_drive(&self.target, &self.drive_id, &self.fabric_id)
            .await
    }
}

struct PowerOffTask {
    ctx: Arc<AssemblyContext>,
    target: Target,
}

#[async_trait]
impl AssemblyTask for PowerOffTask {
    fn name(&self) -> String {
        format!("power-off({})", self.target.system_id)
    }

    async fn run(&self) -> AllocationResult<()> {
        self.ctx
            .remote
            .set_power(&self.target.service_id, &self.target.system_id, PowerAction::ForceOff)
            .await
            .map_err(|source| AllocationError::Remote {
                node: self.target.node_id.clone(),
                source,
            })
    }
}

/// Keeps asserting the boot source override until the system reports it.
struct BootOverrideTask {
    ctx: Arc<AssemblyContext>,
    target: Target,
    source: String,
}

#[async_trait]
impl AssemblyTask for BootOverrideTask {
    fn name(&self) -> String {
        format!("boot-override({} -> {})", self.target.system_id, self.source)
    }

    async fn run(&self) -> AllocationResult<()> {
        let Target {
            node_id,
            system_id,
            service_id,
        } = &self.target;
        let remote_error = |source| AllocationError::Remote {
            node: node_id.clone(),
            source,
        };

        for attempt in 1..=self.ctx.boot_override_attempts {
            self.ctx
                .remote
                .set_boot_override(service_id, system_id, &self.source)
                .await
                .map_err(remote_error)?;
            let current = self
                .ctx
                .remote
                .boot_override(service_id, system_id)
                .await
                .map_err(remote_error)?;
            if current.as_deref() == Some(self.source.as_str()) {
                debug!(node = %node_id, system = %system_id, attempt, "boot override acknowledged");
                return Ok(());
            }
            debug!(node = %node_id, system = %system_id, attempt, ?current, "boot override not yet in effect");
            tokio::time::sleep(self.ctx.boot_override_interval).await;
        }

        Err(remote_error(RemoteError::new(
            "boot_override_not_acknowledged",
            format!(
                "{system_id} did not report boot source {} after {} attempts",
                self.source, self.ctx.boot_override_attempts
            ),
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nodeforge_state::StateStore;

    use super::*;

    struct Step {
        label: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl AssemblyTask for Step {
        fn name(&self) -> String {
            self.label.to_string()
        }

        async fn run(&self) -> AllocationResult<()> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                return Err(AllocationError::Remote {
                    node: "n-1".to_string(),
                    source: RemoteError::new("boom", self.label),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        seen: Mutex<Vec<(String, String)>>,
        swallow: bool,
    }

    #[async_trait]
    impl TaskExceptionHandler for CountingHandler {
        async fn handle(&self, task: &str, error: AllocationError) -> AllocationResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push((task.to_string(), error.to_string()));
            if self.swallow { Ok(()) } else { Err(error) }
        }
    }

    fn chain(log: &Arc<Mutex<Vec<&'static str>>>, failing: &[&'static str]) -> Vec<Box<dyn AssemblyTask>> {
        ["A", "B", "C"]
            .into_iter()
            .map(|label| -> Box<dyn AssemblyTask> {
                Box::new(Step {
                    label,
                    fail: failing.contains(&label),
                    log: Arc::clone(log),
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn chain_stops_at_first_failure_and_calls_handler_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = CountingHandler::default();

        let result = run_assembly_tasks(&chain(&log, &["B"]), &handler).await;

        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), ["A", "B"]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen[0].0, "B");
        assert!(seen[0].1.contains("boom"));
    }

    #[tokio::test]
    async fn handler_may_swallow_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = CountingHandler {
            swallow: true,
            ..Default::default()
        };

        let result = run_assembly_tasks(&chain(&log, &["A", "C"]), &handler).await;

        assert!(result.is_ok());
        assert_eq!(*log.lock().unwrap(), ["A"]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_chain_never_calls_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = CountingHandler::default();

        run_assembly_tasks(&chain(&log, &[]), &handler).await.unwrap();

        assert_eq!(*log.lock().unwrap(), ["A", "B", "C"]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fail_node_handler_marks_node_failed() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put(&ComposedNode {
                id: "n-1".to_string(),
                name: "web-1".to_string(),
                description: None,
                state: NodeState::Assembling,
                system_id: "sys-1".to_string(),
                resources: Vec::new(),
                assembly: Vec::new(),
                created_at: 1,
                updated_at: 1,
            })
            .unwrap();
        let changer = StateChanger::new(Arc::new(store.clone()), nodeforge_core::RetryPolicy::immediate(3));
        let handler = FailNodeHandler::new("n-1", changer);

        let err = handler
            .handle("power-off(sys-1)", AllocationError::NodeNotFound("x".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err, AllocationError::NodeNotFound(_)));
        assert_eq!(store.get_node("n-1").unwrap().unwrap().state, NodeState::Failed);
    }
}
