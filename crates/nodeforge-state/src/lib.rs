//! nodeforge-state: embedded resource catalog and composed-node store.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for computer systems, their processors, memory, ethernet
//! interfaces and local drives, pooled remote drives, switch ports, and the
//! composed nodes built from them.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! wrapped in a versioned envelope. Writes go through optimistic
//! [`Transaction`]s: reads come from a snapshot, writes are buffered, and
//! commit fails with [`StateError::Conflict`] when another transaction
//! changed a written record first.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod transaction;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{Persistence, StateStore};
pub use tables::Record;
pub use transaction::Transaction;
pub use types::*;
