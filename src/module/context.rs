//! Module context
//!
//! The handle an activator uses to reach the framework. Every call is made
//! on behalf of the owning module: permission checks use its identity, and
//! everything it registers or subscribes is tracked so the framework can
//! sweep it away when the module stops.
//!
//! A context is only valid for one start/stop cycle. Once invalidated (the
//! module stopped, or its `start` failed or timed out) every call fails with
//! `InvalidState`.

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::manager::{ManagerShared, ModuleManager};
use super::traits::ModuleInfo;
use super::version::Version;
use crate::configuration::{Configuration, ConfigurationEvent};
use crate::error::{CdmfError, Result};
use crate::event::Event;
use crate::framework::Subsystems;
use crate::properties::{Properties, PropertyValue};
use crate::security::{PermissionType, ResourceKind, ResourceUsage};
use crate::service::{ServiceEvent, ServiceInstance, ServiceReference, ServiceRegistration};
use crate::transport::Transport;
use crate::ListenerId;

/// Property carrying the provided interface version on registered services
pub const SERVICE_VERSION: &str = "service.version";

struct ContextInner {
    module_id: String,
    manifest_properties: Properties,
    provides: Vec<(String, Version)>,
    subsystems: Arc<Subsystems>,
    manager: Weak<ManagerShared>,
    valid: AtomicBool,
    config_listeners: Mutex<Vec<ListenerId>>,
    service_listeners: Mutex<Vec<ListenerId>>,
}

/// Framework access for one module
#[derive(Clone)]
pub struct ModuleContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module_id", &self.inner.module_id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl ModuleContext {
    pub(crate) fn new(
        module_id: &str,
        manifest_properties: Properties,
        provides: Vec<(String, Version)>,
        subsystems: Arc<Subsystems>,
        manager: Weak<ManagerShared>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                module_id: module_id.to_string(),
                manifest_properties,
                provides,
                subsystems,
                manager,
                valid: AtomicBool::new(true),
                config_listeners: Mutex::new(Vec::new()),
                service_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Identity used for permission checks and ownership
    pub fn module_id(&self) -> &str {
        &self.inner.module_id
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CdmfError::InvalidState(format!(
                "context of module {} is no longer valid",
                self.inner.module_id
            )))
        }
    }

    fn require(&self, permission_type: PermissionType, target: &str) -> Result<()> {
        self.ensure_valid()?;
        self.inner
            .subsystems
            .permissions
            .require(&self.inner.module_id, permission_type, target)
    }

    fn manager(&self) -> Result<ModuleManager> {
        self.inner
            .manager
            .upgrade()
            .map(ModuleManager::from_shared)
            .ok_or_else(|| CdmfError::InvalidState("framework has shut down".to_string()))
    }

    // Services

    /// Register a service under `interface`
    ///
    /// `service.version` defaults to the version the manifest declares for
    /// the interface.
    pub fn register_service(
        &self,
        interface: &str,
        instance: ServiceInstance,
        mut properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.require(PermissionType::ServiceRegister, interface)?;
        if !properties.contains_key(SERVICE_VERSION) {
            if let Some((_, version)) = self.inner.provides.iter().find(|(i, _)| i == interface) {
                properties.set(SERVICE_VERSION, version.to_string());
            }
        }

        // Validity is rechecked under the registry lock; a refused record never fires REGISTERED
        let registration = self
            .inner
            .subsystems
            .services
            .register_while(&self.inner.module_id, interface, instance, properties, || {
                self.is_valid()
            })?;

        // Invalidated after admission: the sweep may already have run
        if !self.is_valid() {
            registration.unregister();
            return Err(CdmfError::InvalidState(format!(
                "module {} stopped while registering {}",
                self.inner.module_id, interface
            )));
        }
        Ok(registration)
    }

    /// Register a concrete value
    pub fn register<T: Any + Send + Sync>(
        &self,
        interface: &str,
        service: T,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.register_service(interface, Arc::new(service), properties)
    }

    pub fn get_service_references(
        &self,
        interface: &str,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>> {
        self.require(PermissionType::ServiceGet, interface)?;
        self.inner
            .subsystems
            .services
            .get_service_references(interface, filter)
    }

    pub fn get_service(&self, interface: &str, filter: Option<&str>) -> Result<Option<ServiceInstance>> {
        self.require(PermissionType::ServiceGet, interface)?;
        self.inner.subsystems.services.get_service(interface, filter)
    }

    pub fn get_services(&self, interface: &str, filter: Option<&str>) -> Result<Vec<ServiceInstance>> {
        self.require(PermissionType::ServiceGet, interface)?;
        self.inner.subsystems.services.get_services(interface, filter)
    }

    pub fn get_service_as<T: Any + Send + Sync>(
        &self,
        interface: &str,
        filter: Option<&str>,
    ) -> Result<Option<Arc<T>>> {
        self.require(PermissionType::ServiceGet, interface)?;
        self.inner
            .subsystems
            .services
            .get_service_as::<T>(interface, filter)
    }

    /// Watch registry events for services matching `filter`
    pub fn add_service_listener<F>(&self, filter: Option<&str>, listener: F) -> Result<ListenerId>
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.require(PermissionType::ServiceGet, "*")?;
        let services = &self.inner.subsystems.services;
        let id = services.add_service_listener(filter, listener)?;
        self.inner.service_listeners.lock().push(id);
        if !self.is_valid() {
            services.remove_service_listener(id);
            return Err(CdmfError::InvalidState(format!(
                "module {} stopped while adding a service listener",
                self.inner.module_id
            )));
        }
        Ok(id)
    }

    pub fn remove_service_listener(&self, id: ListenerId) -> Result<bool> {
        self.ensure_valid()?;
        let mut owned = self.inner.service_listeners.lock();
        if !owned.contains(&id) {
            return Ok(false);
        }
        owned.retain(|l| *l != id);
        Ok(self.inner.subsystems.services.remove_service_listener(id))
    }

    // Events

    /// Subscribe to topics matching `pattern`
    pub fn add_event_listener<F>(&self, pattern: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.require(PermissionType::EventSubscribe, pattern)?;
        let events = &self.inner.subsystems.events;
        let id = events.subscribe(&self.inner.module_id, pattern, listener)?;
        if !self.is_valid() {
            events.unsubscribe(id);
            return Err(CdmfError::InvalidState(format!(
                "module {} stopped while subscribing to {}",
                self.inner.module_id, pattern
            )));
        }
        Ok(id)
    }

    /// Remove one of this module's own subscriptions
    pub fn remove_event_listener(&self, id: ListenerId) -> Result<bool> {
        self.ensure_valid()?;
        let events = &self.inner.subsystems.events;
        match events.owner_of(id) {
            Some(owner) if owner == self.inner.module_id => Ok(events.unsubscribe(id)),
            Some(_) => Err(CdmfError::denied(format!(
                "listener {} belongs to another module",
                id
            ))),
            None => Ok(false),
        }
    }

    /// Deliver an event synchronously; returns the number of listeners reached
    pub fn publish_event(&self, event: Event) -> Result<usize> {
        self.require(PermissionType::EventPublish, &event.topic)?;
        let event = event.with_source(self.inner.module_id.as_str());
        Ok(self.inner.subsystems.events.publish(&event))
    }

    /// Deliver an event on the worker pool
    pub fn post_event(&self, event: Event) -> Result<()> {
        self.require(PermissionType::EventPublish, &event.topic)?;
        let event = event.with_source(self.inner.module_id.as_str());
        self.inner.subsystems.events.post(event)
    }

    // Configuration

    /// Watch configurations whose PID matches `filter`
    pub fn add_configuration_listener<F>(&self, filter: &str, listener: F) -> Result<ListenerId>
    where
        F: Fn(&ConfigurationEvent) + Send + Sync + 'static,
    {
        let target = if filter.is_empty() { "*" } else { filter };
        self.require(PermissionType::PropertyRead, target)?;
        let admin = &self.inner.subsystems.configuration;
        let id = admin.add_listener_for(filter, listener);
        self.inner.config_listeners.lock().push(id);
        if !self.is_valid() {
            admin.remove_listener(id);
            return Err(CdmfError::InvalidState(format!(
                "module {} stopped while adding a configuration listener",
                self.inner.module_id
            )));
        }
        Ok(id)
    }

    pub fn remove_configuration_listener(&self, id: ListenerId) -> Result<bool> {
        self.ensure_valid()?;
        let mut owned = self.inner.config_listeners.lock();
        if !owned.contains(&id) {
            return Ok(false);
        }
        owned.retain(|l| *l != id);
        Ok(self.inner.subsystems.configuration.remove_listener(id))
    }

    /// Configuration for `pid`, created empty when unknown
    pub fn get_configuration(&self, pid: &str) -> Result<Configuration> {
        self.require(PermissionType::PropertyRead, pid)?;
        self.inner.subsystems.configuration.get(pid)
    }

    /// Create a configuration; fails when the PID exists
    pub fn create_configuration(&self, pid: &str) -> Result<Configuration> {
        self.require(PermissionType::PropertyWrite, pid)?;
        self.inner.subsystems.configuration.create(pid)
    }

    pub fn create_factory_configuration(
        &self,
        factory_pid: &str,
        instance_name: Option<&str>,
    ) -> Result<Configuration> {
        self.require(PermissionType::PropertyWrite, factory_pid)?;
        self.inner
            .subsystems
            .configuration
            .create_factory(factory_pid, instance_name)
    }

    pub fn delete_configuration(&self, pid: &str) -> Result<()> {
        self.require(PermissionType::PropertyWrite, pid)?;
        self.inner.subsystems.configuration.delete(pid)
    }

    /// Framework property, falling back to the module manifest's properties
    pub fn get_property(&self, key: &str) -> Result<Option<PropertyValue>> {
        self.require(PermissionType::PropertyRead, key)?;
        Ok(self
            .inner
            .subsystems
            .properties
            .get(key)
            .or_else(|| self.inner.manifest_properties.get(key))
            .cloned())
    }

    // Modules

    /// Install another module with this module as the installing principal
    pub fn install_module<P: AsRef<Path>>(&self, path: P) -> Result<ModuleInfo> {
        self.ensure_valid()?;
        self.manager()?
            .install_path(&self.inner.module_id, path.as_ref())
    }

    pub fn start_module(&self, name: &str) -> Result<()> {
        self.require(PermissionType::ModuleExecute, name)?;
        self.manager()?.start(name)
    }

    pub fn stop_module(&self, name: &str) -> Result<()> {
        self.require(PermissionType::ModuleExecute, name)?;
        self.manager()?.stop(name)
    }

    pub fn uninstall_module(&self, name: &str) -> Result<()> {
        self.require(PermissionType::ModuleUnload, name)?;
        self.manager()?.uninstall(name)
    }

    pub fn get_module(&self, name: &str) -> Result<Option<ModuleInfo>> {
        self.ensure_valid()?;
        Ok(self.manager()?.get_module(name))
    }

    pub fn get_modules(&self) -> Result<Vec<ModuleInfo>> {
        self.ensure_valid()?;
        Ok(self.manager()?.modules())
    }

    /// Ask the framework to stop this module
    ///
    /// The stop runs later on a worker thread, so this is safe to call from
    /// inside `start`, `stop` or any listener.
    pub fn stop(&self) -> Result<()> {
        self.ensure_valid()?;
        self.manager()?.request_stop(&self.inner.module_id)
    }

    // Transports and resources

    /// Open a transport; needs `IPC_SEND` on the endpoint
    pub async fn open_transport(&self, endpoint: &str) -> Result<Box<dyn Transport>> {
        self.require(PermissionType::IpcSend, endpoint)?;
        self.inner.subsystems.transports.open(endpoint).await
    }

    /// Report current usage of a resource
    pub fn record_resource_usage(&self, kind: ResourceKind, amount: u64) -> Result<ResourceUsage> {
        self.ensure_valid()?;
        Ok(self
            .inner
            .subsystems
            .resources
            .record_usage(&self.inner.module_id, kind, amount))
    }

    pub fn can_allocate(&self, kind: ResourceKind, amount: u64) -> bool {
        self.inner
            .subsystems
            .resources
            .can_allocate(&self.inner.module_id, kind, amount)
    }

    /// Reserve `amount` against the hard limit
    pub fn allocate(&self, kind: ResourceKind, amount: u64) -> Result<ResourceUsage> {
        self.ensure_valid()?;
        self.inner
            .subsystems
            .resources
            .allocate(&self.inner.module_id, kind, amount)
    }

    pub fn release(&self, kind: ResourceKind, amount: u64) -> Option<ResourceUsage> {
        self.inner
            .subsystems
            .resources
            .release(&self.inner.module_id, kind, amount)
    }

    // Lifecycle plumbing

    pub(crate) fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::SeqCst);
    }

    /// Drop everything the module left behind in the shared subsystems
    pub(crate) fn sweep(&self) {
        let subsystems = &self.inner.subsystems;
        let module_id = &self.inner.module_id;

        let services = subsystems.services.unregister_all(module_id);
        let subscriptions = subsystems.events.unsubscribe_owner(module_id);
        let config_listeners: Vec<ListenerId> =
            self.inner.config_listeners.lock().drain(..).collect();
        for id in &config_listeners {
            subsystems.configuration.remove_listener(*id);
        }
        let service_listeners: Vec<ListenerId> =
            self.inner.service_listeners.lock().drain(..).collect();
        for id in &service_listeners {
            subsystems.services.remove_service_listener(*id);
        }

        if services + subscriptions + config_listeners.len() + service_listeners.len() > 0 {
            debug!(
                "Swept {}: {} services, {} subscriptions, {} configuration listeners, {} service listeners",
                module_id,
                services,
                subscriptions,
                config_listeners.len(),
                service_listeners.len()
            );
        }
    }
}
