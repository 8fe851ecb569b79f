//! Module system traits and lifecycle types

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::context::ModuleContext;

/// Module lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    /// Artifact loaded, dependencies not yet checked
    Installed,
    /// Dependencies satisfied, ready to start
    Resolved,
    /// Activator `start` in progress
    Starting,
    /// Running
    Active,
    /// Activator `stop` in progress
    Stopping,
    /// Removed from the framework (terminal)
    Uninstalled,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Installed => "INSTALLED",
            ModuleState::Resolved => "RESOLVED",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Uninstalled => "UNINSTALLED",
        }
    }

    /// Whether the module is mid-transition
    pub fn is_transient(&self) -> bool {
        matches!(self, ModuleState::Starting | ModuleState::Stopping)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry points a module implements
///
/// `start` may register services, subscribe to events and read
/// configuration through the context. An error (or panic) from `start`
/// rolls the module back to RESOLVED and removes whatever it registered.
/// `stop` is expected to succeed; its errors are logged and the module is
/// stopped regardless.
pub trait ModuleActivator: Send + Sync {
    fn start(&self, context: &ModuleContext) -> anyhow::Result<()>;

    fn stop(&self, context: &ModuleContext) -> anyhow::Result<()>;
}

/// Point-in-time view of an installed module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Numeric install id, unique per framework
    pub id: u64,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub state: ModuleState,
    /// Artifact location, `None` for in-process activators
    pub location: Option<PathBuf>,
    /// Interfaces from the manifest's `provides`
    pub provides: Vec<String>,
    /// Install time in seconds since the Unix epoch
    pub installed_at: u64,
}
