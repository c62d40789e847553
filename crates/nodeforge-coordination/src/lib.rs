//! Coordination primitives that serialize side effects against shared remote
//! resources.
//!
//! - **`lock`**: [`LockCoordinator`]: named, reentrant, FIFO-fair mutual
//!   exclusion with a bounded wait
//! - **`single_flight`**: [`TaskCoordinator`]: collapses concurrent
//!   invocations of the same keyed work into one execution

pub mod error;
pub mod lock;
pub mod single_flight;

pub use error::CoordinationError;
pub use lock::{HolderId, LockCoordinator};
pub use single_flight::TaskCoordinator;
