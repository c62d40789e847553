//! nodeforge-allocation: compose nodes and drive their assembly.
//!
//! The [`NodeAllocator`] validates a [`RequestedNode`](nodeforge_matcher::RequestedNode),
//! runs an [`AllocationStrategy`] inside a retried optimistic transaction,
//! and hands back the persisted node together with its assembly tasks.
//!
//! # Architecture
//!
//! ```text
//! NodeAllocator::compose
//!   ├── validate_request
//!   └── run_in_transaction (retry on conflict)
//!       └── FirstFitStrategy → matchers → ownership flips
//! run_assembly_tasks(tasks, handler)
//!   ├── ChangeStateTask → StateChanger (own retried transaction)
//!   ├── AttachRemoteDriveTask → TaskCoordinator → LockCoordinator → RemoteService
//!   ├── PowerOffTask → RemoteService
//!   └── BootOverrideTask → RemoteService (reasserted until acknowledged)
//! ```

pub mod allocator;
pub mod assembly;
pub mod error;
pub mod remote;
pub mod retry;
pub mod state_changer;
pub mod strategy;
pub mod validation;

pub use allocator::{ComposeOutcome, NodeAllocator};
pub use assembly::{
    ATTACHMENT_LOCK, AssemblyContext, AssemblyTask, FailNodeHandler, PropagateHandler,
    TaskExceptionHandler, run_assembly_tasks,
};
pub use error::{AllocationError, AllocationResult};
pub use remote::{DryRunRemote, PowerAction, RemoteCallError, RemoteError, RemoteService};
pub use retry::{run_in_transaction, timed};
pub use state_changer::StateChanger;
pub use strategy::{Allocation, AllocationStrategy, FirstFitStrategy};
pub use validation::validate_request;
