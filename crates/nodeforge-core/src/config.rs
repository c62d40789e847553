//! nodeforge.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub allocation: AllocationConfig,
    pub state: StateConfig,
    pub locks: LockConfig,
    pub assembly: AssemblyConfig,
}

/// Retry bounds for the compose transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
        }
    }
}

/// Retry bounds for isolated state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 5,
            backoff_max_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// How many times the boot override is reasserted before giving up.
    pub boot_override_attempts: u32,
    pub boot_override_interval_ms: u64,
    /// Boot source requested on the backing system: "pxe", "hdd", ...
    pub boot_source: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            boot_override_attempts: 30,
            boot_override_interval_ms: 1_000,
            boot_source: "pxe".to_string(),
        }
    }
}

impl ForgeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ForgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.allocation.max_attempts == 0 {
            anyhow::bail!("allocation.max_attempts must be at least 1");
        }
        if self.state.max_attempts == 0 {
            anyhow::bail!("state.max_attempts must be at least 1");
        }
        if self.assembly.boot_override_attempts == 0 {
            anyhow::bail!("assembly.boot_override_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn allocation_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.allocation.max_attempts,
            Duration::from_millis(self.allocation.backoff_base_ms),
            Duration::from_millis(self.allocation.backoff_max_ms),
        )
    }

    pub fn state_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.state.max_attempts,
            Duration::from_millis(self.state.backoff_base_ms),
            Duration::from_millis(self.state.backoff_max_ms),
        )
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.locks.acquire_timeout_ms)
    }

    pub fn boot_override_interval(&self) -> Duration {
        Duration::from_millis(self.assembly.boot_override_interval_ms)
    }
}
