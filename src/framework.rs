//! Framework orchestration
//!
//! Wires the subsystems together and owns the module manager:
//!
//! - permission store, resource limiter and trusted signers
//! - service registry, bridged onto the event bus as `cdmf/service/*`
//! - configuration admin, optionally backed by a storage directory
//! - event bus and the worker pool it posts to
//! - transport registry

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::concurrency::WorkerPool;
use crate::config::FrameworkConfig;
use crate::configuration::ConfigurationAdmin;
use crate::error::Result;
use crate::event::{Event, EventBus, SERVICE_TOPIC_PREFIX};
use crate::module::{
    ManagerSettings, ModuleActivator, ModuleContext, ModuleDiscovery, ModuleInfo,
    ModuleManager, ModuleManifest,
};
use crate::properties::Properties;
use crate::security::{
    DigestVerifier, Permission, PermissionManager, PermissionType, ResourceLimiter,
    TrustedSignerRegistry, SYSTEM_PRINCIPAL,
};
use crate::service::ServiceRegistry;
use crate::transport::TransportRegistry;
use crate::utils::log_error;

/// Topic of resource limit violations
pub const RESOURCE_VIOLATION_TOPIC: &str = "cdmf/resource/VIOLATION";

/// Shared framework services reachable from every module context
pub struct Subsystems {
    pub permissions: Arc<PermissionManager>,
    pub resources: Arc<ResourceLimiter>,
    pub signers: Arc<TrustedSignerRegistry>,
    pub services: ServiceRegistry,
    pub configuration: ConfigurationAdmin,
    pub events: EventBus,
    pub transports: Arc<TransportRegistry>,
    pub pool: Arc<WorkerPool>,
    /// Framework properties, consulted before module manifest properties
    pub properties: Properties,
}

/// One framework instance
pub struct Framework {
    config: FrameworkConfig,
    subsystems: Arc<Subsystems>,
    modules: ModuleManager,
    system_context: ModuleContext,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl Framework {
    /// Build a framework from configuration
    pub fn new(config: FrameworkConfig) -> anyhow::Result<Self> {
        config.validate()?;
        info!("Initializing CDMF framework");

        let pool = Arc::new(WorkerPool::with_capacity(
            config.workers.threads,
            config.workers.queue_capacity,
        ));

        let permissions = Arc::new(PermissionManager::new());
        permissions.set_enforcing(config.security.enforce_permissions);
        permissions.set_default_permissions(config.default_permissions()?);
        permissions.grant(
            SYSTEM_PRINCIPAL,
            Permission::grant(PermissionType::Admin, "*"),
        )?;

        let resources = Arc::new(ResourceLimiter::new());
        resources.set_enabled(config.resources.enabled);

        let configuration = match &config.configuration.storage_dir {
            Some(dir) => ConfigurationAdmin::with_storage(dir)
                .with_context(|| format!("opening configuration store {}", dir.display()))?,
            None => ConfigurationAdmin::new(),
        };

        let events = EventBus::with_pool(pool.clone());
        let services = ServiceRegistry::new();
        bridge_service_events(&services, &events)?;
        bridge_resource_violations(&resources, &events);

        let signers = Arc::new(TrustedSignerRegistry::new());
        let subsystems = Arc::new(Subsystems {
            permissions,
            resources,
            signers: signers.clone(),
            services,
            configuration,
            events,
            transports: Arc::new(TransportRegistry::new()),
            pool,
            properties: config.properties.clone(),
        });

        let modules = ModuleManager::new(
            subsystems.clone(),
            ManagerSettings {
                start_timeout: Duration::from_millis(config.modules.start_timeout_ms),
                stop_timeout: Duration::from_millis(config.modules.stop_timeout_ms),
                require_signature: config.security.require_signature,
            },
        );
        modules.set_verifier(Arc::new(DigestVerifier::new(signers)));

        let system_context = ModuleContext::new(
            SYSTEM_PRINCIPAL,
            Properties::new(),
            Vec::new(),
            subsystems.clone(),
            modules.downgrade(),
        );

        Ok(Self {
            config,
            subsystems,
            modules,
            system_context,
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Load the policy files and, with `auto_start`, every module in `modules_dir`
    ///
    /// Policy files are best effort: a missing or unreadable file is logged
    /// and skipped.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Starting CDMF framework");

        let security = &self.config.security;
        if let Some(path) = &security.permissions_file {
            load_best_effort("permissions", path, |p| {
                self.subsystems.permissions.load_from_file(p)
            });
        }
        if let Some(path) = &security.trusted_signers_file {
            load_best_effort("trusted signers", path, |p| {
                self.subsystems.signers.load_from_file(p)
            });
        }
        if let Some(path) = &self.config.resources.limits_file {
            load_best_effort("resource limits", path, |p| {
                self.subsystems.resources.load_from_file(p)
            });
        }

        if self.config.modules.auto_start {
            let installed = self.install_all()?;
            let failures = self.modules.start_all();
            info!(
                "Auto-start: {} modules installed, {} failed to start",
                installed,
                failures.len()
            );
        }
        Ok(())
    }

    /// Install every module found in the configured modules directory
    pub fn install_all(&self) -> anyhow::Result<usize> {
        let discovered = ModuleDiscovery::new(&self.config.modules.modules_dir)
            .discover_modules()
            .context("discovering modules")?;
        let mut installed = 0;
        for module in discovered {
            match self.install(&module.directory) {
                Ok(_) => installed += 1,
                Err(e) => warn!("Could not install {}: {}", module.manifest.name, e),
            }
        }
        Ok(installed)
    }

    /// Stop all modules; they stay installed
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            info!("Stopping CDMF framework");
        }
        self.modules.stop_all();
    }

    /// Stop and uninstall every module, then stop the worker pool
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down CDMF framework");
        self.modules.shutdown();
        self.system_context.invalidate();
        self.system_context.sweep();
        self.subsystems.pool.shutdown();
        self.started.store(false, Ordering::SeqCst);
    }

    /// Install a module from disk as the system principal
    pub fn install<P: AsRef<Path>>(&self, path: P) -> Result<ModuleInfo> {
        self.modules.install_path(SYSTEM_PRINCIPAL, path.as_ref())
    }

    /// Install an in-process module
    pub fn install_activator(
        &self,
        manifest: ModuleManifest,
        activator: Arc<dyn ModuleActivator>,
    ) -> Result<ModuleInfo> {
        self.modules.install_activator(manifest, activator)
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    pub fn subsystems(&self) -> &Arc<Subsystems> {
        &self.subsystems
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.subsystems.services
    }

    pub fn configuration(&self) -> &ConfigurationAdmin {
        &self.subsystems.configuration
    }

    pub fn events(&self) -> &EventBus {
        &self.subsystems.events
    }

    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.subsystems.permissions
    }

    pub fn resources(&self) -> &Arc<ResourceLimiter> {
        &self.subsystems.resources
    }

    pub fn signers(&self) -> &Arc<TrustedSignerRegistry> {
        &self.subsystems.signers
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.subsystems.transports
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.subsystems.pool
    }

    /// Context acting as the `system` principal (holds `ADMIN`)
    pub fn system_context(&self) -> &ModuleContext {
        &self.system_context
    }
}

impl Drop for Framework {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Republish registry events as `cdmf/service/{REGISTERED,MODIFIED,UNREGISTERING}`
fn bridge_service_events(services: &ServiceRegistry, events: &EventBus) -> Result<()> {
    let events = events.clone();
    services.add_service_listener(None, move |event| {
        let reference = &event.reference;
        let bridged = Event::new(format!("{}{}", SERVICE_TOPIC_PREFIX, event.event_type))
            .with_properties(reference.properties().clone())
            .with_source(reference.module_id());
        events.publish(&bridged);
    })?;
    Ok(())
}

fn bridge_resource_violations(resources: &ResourceLimiter, events: &EventBus) {
    let events = events.clone();
    resources.add_violation_listener(move |violation| {
        let event = Event::new(RESOURCE_VIOLATION_TOPIC)
            .with_property("module.name", violation.module_id.as_str())
            .with_property("resource.kind", violation.kind.as_str())
            .with_property("resource.amount", violation.amount as i64)
            .with_property("resource.soft", violation.limit.soft as i64)
            .with_property("resource.hard", violation.limit.hard as i64)
            .with_property(
                "resource.severity",
                format!("{:?}", violation.severity).to_uppercase(),
            );
        events.publish(&event);
    });
}

fn load_best_effort<F>(what: &str, path: &Path, load: F)
where
    F: FnOnce(&Path) -> Result<usize>,
{
    let context = format!("Could not load {} from {}", what, path.display());
    if let Some(count) = log_error(|| load(path), &context) {
        info!("Loaded {} {} entries from {}", count, what, path.display());
    }
}
