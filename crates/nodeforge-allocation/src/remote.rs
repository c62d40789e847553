//! Boundary to the remote management services.
//!
//! The core never speaks a wire protocol itself; assembly tasks and detach go
//! through [`RemoteService`], and the caller supplies the implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use nodeforge_coordination::CoordinationError;

/// Structured failure reported by a remote service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    /// Status reported by the service, if any (usually an HTTP status).
    pub status: Option<u16>,
}

impl RemoteError {
    pub const NOT_FOUND: &'static str = "not_found";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// The target is already absent on the remote side.
    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND || self.status == Some(404)
    }
}

/// Failure of a coordinated remote call: either the call itself failed, or
/// it never ran because coordination gave up first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteCallError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    On,
    ForceOff,
    GracefulShutdown,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerAction::On => "on",
            PowerAction::ForceOff => "force_off",
            PowerAction::GracefulShutdown => "graceful_shutdown",
        };
        f.write_str(s)
    }
}

/// Calls into the services that manage systems and storage fabrics.
///
/// `service` is the id of the managing service; `system` and `drive` are
/// catalog resource ids.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn set_power(&self, service: &str, system: &str, action: PowerAction) -> Result<(), RemoteError>;

    async fn set_boot_override(&self, service: &str, system: &str, source: &str) -> Result<(), RemoteError>;

    /// The boot source override currently in effect, if any.
    async fn boot_override(&self, service: &str, system: &str) -> Result<Option<String>, RemoteError>;

    /// Expose `drive` to `system` through the fabric `service`.
    async fn attach_endpoint(&self, service: &str, drive: &str, system: &str) -> Result<(), RemoteError>;

    async fn detach_endpoint(&self, service: &str, drive: &str, system: &str) -> Result<(), RemoteError>;
}

/// Acknowledges every call without contacting anything. Boot overrides are
/// remembered so that reading one back reflects the last write.
#[derive(Debug, Default)]
pub struct DryRunRemote {
    boot_overrides: Mutex<HashMap<String, String>>,
}

impl DryRunRemote {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RemoteService for DryRunRemote {
    async fn set_power(&self, service: &str, system: &str, action: PowerAction) -> Result<(), RemoteError> {
        info!(service, system, %action, "dry-run: set power");
        Ok(())
    }

    async fn set_boot_override(&self, service: &str, system: &str, source: &str) -> Result<(), RemoteError> {
        info!(service, system, source, "dry-run: set boot override");
        self.boot_overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(system.to_string(), source.to_string());
        Ok(())
    }

    async fn boot_override(&self, _service: &str, system: &str) -> Result<Option<String>, RemoteError> {
        Ok(self
            .boot_overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(system)
            .cloned())
    }

    async fn attach_endpoint(&self, service: &str, drive: &str, system: &str) -> Result<(), RemoteError> {
        info!(service, drive, system, "dry-run: attach endpoint");
        Ok(())
    }

    async fn detach_endpoint(&self, service: &str, drive: &str, system: &str) -> Result<(), RemoteError> {
        info!(service, drive, system, "dry-run: detach endpoint");
        Ok(())
    }
}
