//! CDMF - component and module framework
//!
//! Hosts independently built modules inside one process and gives them a
//! shared set of framework services:
//!
//! - **Module lifecycle**: install, resolve, start, stop and uninstall with
//!   dependency ordering and bounded activator calls
//! - **Service registry**: ranked, property-filtered service lookup with
//!   change listeners
//! - **Configuration admin**: PID-keyed configurations, factory instances
//!   and optional on-disk persistence
//! - **Event bus**: topic-pattern publish/subscribe, sync or pooled
//! - **Security**: per-module permissions with DENY precedence, artifact
//!   verification and resource limits
//! - **Transports**: pluggable endpoint-addressed byte channels
//!
//! ## Usage
//!
//! ```no_run
//! use cdmf::{Framework, FrameworkConfig};
//!
//! let framework = Framework::new(FrameworkConfig::default())?;
//! framework.start()?;
//! framework.install("modules/clock")?;
//! framework.modules().start("clock")?;
//! framework.shutdown();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod concurrency;
pub mod config;
pub mod configuration;
pub mod error;
pub mod event;
pub mod framework;
pub mod module;
pub mod properties;
pub mod security;
pub mod service;
pub mod transport;
pub mod utils;

/// Handle returned by every `add_*_listener` call
pub type ListenerId = u64;

pub use config::FrameworkConfig;
pub use configuration::{Configuration, ConfigurationAdmin};
pub use error::{CdmfError, Result};
pub use event::{Event, EventBus};
pub use framework::{Framework, Subsystems};
pub use module::{
    ModuleActivator, ModuleContext, ModuleInfo, ModuleManager, ModuleManifest, ModuleState,
    Version, VersionRange,
};
pub use properties::{Properties, PropertyValue};
pub use security::{Permission, PermissionManager, PermissionType};
pub use service::{Filter, ServiceReference, ServiceRegistration, ServiceRegistry};
