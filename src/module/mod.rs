//! Module system
//!
//! A module is a directory holding a `module.toml` manifest and a dynamic
//! library exporting an activator, or an activator handed in directly.
//!
//! - **Manifest**: identity, provided interfaces, dependencies, permissions
//! - **Resolution**: dependencies are matched against other modules' provided
//!   interfaces (version ranges plus property filters) or registered services
//! - **Lifecycle**: `INSTALLED -> RESOLVED -> STARTING -> ACTIVE -> STOPPING`
//! - **Context**: each started module gets a context scoped to its identity;
//!   everything it registers is swept when it stops

pub mod activator;
pub mod context;
pub mod dependencies;
pub mod discovery;
pub mod manager;
pub mod manifest;
pub mod traits;
pub mod version;

pub use activator::{load_activator, DynamicActivator};
pub use context::{ModuleContext, SERVICE_VERSION};
pub use dependencies::{DependencyResolution, ModuleDependencies, ModuleNode};
pub use discovery::{DiscoveredModule, ModuleDiscovery};
pub use manager::{ManagerSettings, ModuleManager};
pub use manifest::{Dependency, DependencySpec, ModuleManifest, ProvidedInterface, MANIFEST_FILE};
pub use traits::{ModuleActivator, ModuleInfo, ModuleState};
pub use version::{Version, VersionRange};
