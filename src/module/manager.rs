//! Module manager
//!
//! Owns every installed module and drives the lifecycle state machine:
//!
//! ```text
//! INSTALLED -> RESOLVED -> STARTING -> ACTIVE -> STOPPING -> RESOLVED
//!                              |                               ^
//!                              +------- start failed ----------+
//! ```
//!
//! Each module has its own transition lock; the module map lock is never
//! held while a transition lock is taken. Lifecycle events are collected
//! during a transition and published after its lock is released, so event
//! listeners may call back into the manager.
//!
//! The manager also watches the service registry. When a service leaves the
//! registry, or its properties stop matching, ACTIVE modules that can no
//! longer bind a mandatory dependency are stopped.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use super::activator::load_activator;
use super::context::{ModuleContext, SERVICE_VERSION};
use super::dependencies::{DependencyResolution, ModuleDependencies, ModuleNode};
use super::discovery::locate;
use super::manifest::{Dependency, ModuleManifest};
use super::traits::{ModuleActivator, ModuleInfo, ModuleState};
use super::version::{Version, VersionRange};
use crate::error::{CdmfError, Result};
use crate::event::{Event, MODULE_TOPIC_PREFIX};
use crate::framework::Subsystems;
use crate::security::{ModuleVerifier, PermissionType, UnsignedVerifier};
use crate::service::{ServiceEvent, ServiceEventType, ServiceReference};
use crate::utils::{call_with_timeout, current_timestamp};
use crate::ListenerId;

/// Lifecycle tuning
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Upper bound on an activator's `start`
    pub start_timeout: Duration,
    /// Upper bound on an activator's `stop`
    pub stop_timeout: Duration,
    /// Only `VERIFIED` artifacts may be installed
    pub require_signature: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            require_signature: false,
        }
    }
}

thread_local! {
    // Transition locks held by this thread
    static TRANSITIONS: Cell<usize> = const { Cell::new(0) };
    // This thread is running an activator callback
    static IN_ACTIVATOR: Cell<bool> = const { Cell::new(false) };
    // A service departed while this thread held a transition lock
    static SWEEP_PENDING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as holding a transition lock
struct TransitionMarker;

impl TransitionMarker {
    fn enter() -> Self {
        TRANSITIONS.with(|depth| depth.set(depth.get() + 1));
        TransitionMarker
    }

    fn held() -> bool {
        TRANSITIONS.with(|depth| depth.get() > 0)
    }
}

impl Drop for TransitionMarker {
    fn drop(&mut self) {
        TRANSITIONS.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Marks an activator thread for the duration of a callback
struct ActivatorMarker;

impl ActivatorMarker {
    fn enter() -> Self {
        IN_ACTIVATOR.with(|flag| flag.set(true));
        ActivatorMarker
    }

    fn held() -> bool {
        IN_ACTIVATOR.with(|flag| flag.get())
    }
}

impl Drop for ActivatorMarker {
    fn drop(&mut self) {
        IN_ACTIVATOR.with(|flag| flag.set(false));
    }
}

struct Transition<'a> {
    _lock: MutexGuard<'a, ()>,
    _marker: TransitionMarker,
}

#[derive(Default)]
struct Runtime {
    activator: Option<Arc<dyn ModuleActivator>>,
    context: Option<ModuleContext>,
}

struct ModuleEntry {
    id: u64,
    name: String,
    manifest: ModuleManifest,
    version: Version,
    provides: Vec<(String, Version)>,
    dependencies: Vec<Dependency>,
    location: Option<PathBuf>,
    installed_at: u64,
    state: RwLock<ModuleState>,
    transition: Mutex<()>,
    runtime: Mutex<Runtime>,
}

impl ModuleEntry {
    fn state(&self) -> ModuleState {
        *self.state.read()
    }

    fn begin(&self) -> Transition<'_> {
        let marker = TransitionMarker::enter();
        Transition {
            _lock: self.transition.lock(),
            _marker: marker,
        }
    }

    /// ACTIVE with a mandatory dependency on `interface`
    fn binds(&self, interface: &str) -> bool {
        self.state() == ModuleState::Active
            && self
                .dependencies
                .iter()
                .any(|d| !d.optional && d.interface == interface)
    }

    fn set_state(&self, state: ModuleState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        debug!("Module {}: {} -> {}", self.name, previous, state);
    }

    fn info(&self) -> ModuleInfo {
        ModuleInfo {
            id: self.id,
            name: self.name.clone(),
            version: self.version.to_string(),
            description: self.manifest.description.clone(),
            state: self.state(),
            location: self.location.clone(),
            provides: self.provides.iter().map(|(i, _)| i.clone()).collect(),
            installed_at: self.installed_at,
        }
    }

    fn node(&self) -> ModuleNode {
        ModuleNode {
            name: self.name.clone(),
            provides: self.provides.clone(),
            dependencies: self.dependencies.clone(),
        }
    }

    fn event(&self, kind: &str) -> Event {
        Event::new(format!("{}{}", MODULE_TOPIC_PREFIX, kind))
            .with_property("module.name", self.name.as_str())
            .with_property("module.id", self.id as i64)
            .with_property("module.version", self.version.to_string())
    }
}

pub(crate) struct ManagerShared {
    subsystems: Arc<Subsystems>,
    modules: RwLock<BTreeMap<String, Arc<ModuleEntry>>>,
    settings: ManagerSettings,
    verifier: RwLock<Arc<dyn ModuleVerifier>>,
    next_id: AtomicU64,
    watcher: Option<ListenerId>,
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        if let Some(id) = self.watcher {
            self.subsystems.services.remove_service_listener(id);
        }
    }
}

/// Installs, resolves, starts, stops and uninstalls modules
#[derive(Clone)]
pub struct ModuleManager {
    shared: Arc<ManagerShared>,
}

impl ModuleManager {
    pub fn new(subsystems: Arc<Subsystems>, settings: ManagerSettings) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<ManagerShared>| {
            let watcher = watch_services(&subsystems, weak.clone());
            ManagerShared {
                subsystems,
                modules: RwLock::new(BTreeMap::new()),
                settings,
                verifier: RwLock::new(Arc::new(UnsignedVerifier)),
                next_id: AtomicU64::new(1),
                watcher,
            }
        });
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<ManagerShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<ManagerShared> {
        Arc::downgrade(&self.shared)
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.shared.settings
    }

    /// Replace the artifact verifier
    pub fn set_verifier(&self, verifier: Arc<dyn ModuleVerifier>) {
        *self.shared.verifier.write() = verifier;
    }

    fn entry(&self, name: &str) -> Result<Arc<ModuleEntry>> {
        self.shared
            .modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CdmfError::not_found(format!("module {}", name)))
    }

    fn entries(&self) -> Vec<Arc<ModuleEntry>> {
        self.shared.modules.read().values().cloned().collect()
    }

    fn publish(&self, events: Vec<Event>) {
        for event in events {
            self.shared.subsystems.events.publish(&event);
        }
    }

    // Install

    /// Install the module at `path` on behalf of `principal`
    ///
    /// The artifact is verified first, then `principal` needs `MODULE_LOAD`
    /// on the library path. Nothing is loaded unless both pass.
    pub fn install_path(&self, principal: &str, path: &Path) -> Result<ModuleInfo> {
        let discovered = locate(path)?;
        let library = discovered.library_path.clone();

        let verifier = self.shared.verifier.read().clone();
        let verdict = verifier.verify_module(&library);
        if !verdict.permits_load(self.shared.settings.require_signature) {
            warn!("Refusing {}: verification {}", library.display(), verdict);
            return Err(CdmfError::VerifyFailed(format!(
                "{}: {}",
                library.display(),
                verdict
            )));
        }
        debug!("Verification of {}: {}", library.display(), verdict);

        self.shared.subsystems.permissions.require(
            principal,
            PermissionType::ModuleLoad,
            &library.to_string_lossy(),
        )?;

        if self.shared.modules.read().contains_key(&discovered.manifest.name) {
            return Err(CdmfError::Duplicate(format!(
                "module {}",
                discovered.manifest.name
            )));
        }

        let activator = load_activator(&library)?;
        self.insert(discovered.manifest, activator, Some(library))
    }

    /// Install an in-process module
    pub fn install_activator(
        &self,
        manifest: ModuleManifest,
        activator: Arc<dyn ModuleActivator>,
    ) -> Result<ModuleInfo> {
        manifest.validate()?;
        self.insert(manifest, activator, None)
    }

    fn insert(
        &self,
        manifest: ModuleManifest,
        activator: Arc<dyn ModuleActivator>,
        location: Option<PathBuf>,
    ) -> Result<ModuleInfo> {
        let version = manifest.parsed_version()?;
        let provides = manifest.provided()?;
        let dependencies = manifest.parsed_dependencies()?;
        let requested = manifest.parsed_permissions()?;

        let entry = Arc::new(ModuleEntry {
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
            name: manifest.name.clone(),
            manifest,
            version,
            provides,
            dependencies,
            location,
            installed_at: current_timestamp(),
            state: RwLock::new(ModuleState::Installed),
            transition: Mutex::new(()),
            runtime: Mutex::new(Runtime {
                activator: Some(activator),
                context: None,
            }),
        });

        {
            let mut modules = self.shared.modules.write();
            if modules.contains_key(&entry.name) {
                return Err(CdmfError::Duplicate(format!("module {}", entry.name)));
            }
            modules.insert(entry.name.clone(), entry.clone());
        }

        let permissions = &self.shared.subsystems.permissions;
        permissions.apply_defaults(&entry.name)?;
        permissions.grant_all(&entry.name, requested)?;

        info!(
            "Installed module {} {} (id {})",
            entry.name, entry.version, entry.id
        );
        self.publish(vec![entry.event("INSTALLED")]);
        Ok(entry.info())
    }

    // Resolution

    fn resolution(&self) -> DependencyResolution {
        let nodes: Vec<ModuleNode> = self.entries().iter().map(|e| e.node()).collect();
        ModuleDependencies::resolve(&nodes, |dep| self.service_satisfies(dep))
    }

    /// Registered services matching a dependency's interface, filter and range
    fn matching_services(&self, dep: &Dependency) -> Vec<ServiceReference> {
        self.shared
            .subsystems
            .services
            .references_matching(&dep.interface, &dep.filter)
            .into_iter()
            .filter(|r| service_version_in(r, &dep.range))
            .collect()
    }

    fn service_satisfies(&self, dep: &Dependency) -> bool {
        !self.matching_services(dep).is_empty()
    }

    fn check_dependencies(&self, entry: &ModuleEntry) -> Result<()> {
        let unsatisfied: Vec<String> = entry
            .dependencies
            .iter()
            .filter(|d| !d.optional && !self.service_satisfies(d))
            .map(|d| d.to_string())
            .collect();
        if unsatisfied.is_empty() {
            Ok(())
        } else {
            Err(CdmfError::Unresolvable(format!(
                "{} needs services {}",
                entry.name,
                unsatisfied.join(", ")
            )))
        }
    }

    /// Move an INSTALLED module to RESOLVED
    ///
    /// Fails with `Unresolvable` or `ResolveFailed` and leaves the module
    /// INSTALLED when its dependency closure cannot be ordered.
    pub fn resolve(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let resolution = self.resolution();
        let mut events = Vec::new();
        let result = {
            let _transition = entry.begin();
            self.resolve_locked(&entry, &resolution, &mut events)
        };
        self.publish(events);
        result
    }

    fn resolve_locked(
        &self,
        entry: &ModuleEntry,
        resolution: &DependencyResolution,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        match entry.state() {
            ModuleState::Installed => {
                resolution.order_for(&[entry.name.as_str()])?;
                entry.set_state(ModuleState::Resolved);
                events.push(entry.event("RESOLVED"));
                Ok(())
            }
            ModuleState::Uninstalled => Err(CdmfError::InvalidState(format!(
                "module {} is uninstalled",
                entry.name
            ))),
            _ => Ok(()),
        }
    }

    // Start

    /// Start a module, starting its providers first
    pub fn start(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        if entry.state() == ModuleState::Active {
            return Ok(());
        }
        let order = self.resolution().order_for(&[name])?;
        debug!("Start order for {}: {:?}", name, order);
        let result = order
            .iter()
            .try_for_each(|module| self.entry(module).and_then(|entry| self.start_one(&entry)));
        self.settle();
        result
    }

    fn start_one(&self, entry: &Arc<ModuleEntry>) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let _transition = entry.begin();
            self.start_locked(entry, &mut events)
        };
        self.publish(events);
        result
    }

    fn start_locked(&self, entry: &Arc<ModuleEntry>, events: &mut Vec<Event>) -> Result<()> {
        match entry.state() {
            ModuleState::Active => return Ok(()),
            ModuleState::Installed => {
                let resolution = self.resolution();
                self.resolve_locked(entry, &resolution, events)?;
            }
            ModuleState::Resolved => {}
            state => {
                return Err(CdmfError::InvalidState(format!(
                    "module {} is {}",
                    entry.name, state
                )))
            }
        }
        self.check_dependencies(entry)?;

        let activator = entry.runtime.lock().activator.clone().ok_or_else(|| {
            CdmfError::InvalidState(format!("module {} has no activator", entry.name))
        })?;
        let context = ModuleContext::new(
            &entry.name,
            entry.manifest.properties.clone(),
            entry.provides.clone(),
            self.shared.subsystems.clone(),
            Arc::downgrade(&self.shared),
        );
        entry.runtime.lock().context = Some(context.clone());
        entry.set_state(ModuleState::Starting);
        events.push(entry.event("STARTING"));
        info!("Starting module {}", entry.name);

        let ctx = context.clone();
        let outcome = call_with_timeout(
            &format!("start-{}", entry.name),
            self.shared.settings.start_timeout,
            move || {
                let _marker = ActivatorMarker::enter();
                activator.start(&ctx)
            },
        );
        let failure = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(CdmfError::ActivatorFailed(format!(
                "{} start failed: {:#}",
                entry.name, e
            ))),
            Ok(Err(panic)) => Some(CdmfError::ActivatorFailed(format!(
                "{} start panicked: {}",
                entry.name, panic
            ))),
            Err(timed_out) => Some(CdmfError::Timeout(format!(
                "{} start: {}",
                entry.name, timed_out
            ))),
        };

        match failure {
            None => {
                entry.set_state(ModuleState::Active);
                events.push(entry.event("STARTED"));
                info!("Module {} is active", entry.name);
                Ok(())
            }
            Some(err) => {
                error!("{}; rolling back", err);
                context.invalidate();
                context.sweep();
                entry.runtime.lock().context = None;
                entry.set_state(ModuleState::Resolved);
                events.push(entry.event("STOPPED").with_property("error", err.to_string()));
                Err(err)
            }
        }
    }

    // Stop

    /// Stop a module after stopping the modules that depend on it
    ///
    /// Afterwards any ACTIVE module whose mandatory dependencies are no
    /// longer registered is stopped as well.
    pub fn stop(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        match entry.state() {
            ModuleState::Uninstalled => {
                return Err(CdmfError::InvalidState(format!(
                    "module {} is uninstalled",
                    name
                )))
            }
            ModuleState::Installed | ModuleState::Resolved => return Ok(()),
            _ => {}
        }
        self.stop_cascade(name);
        self.stop_unsatisfied();
        Ok(())
    }

    fn stop_cascade(&self, name: &str) {
        let order = self.resolution().stop_order(name);
        debug!("Stop order for {}: {:?}", name, order);
        for module in order {
            if let Ok(entry) = self.entry(&module) {
                self.stop_one(&entry);
            }
        }
    }

    fn stop_unsatisfied(&self) {
        loop {
            let victim = self
                .entries()
                .into_iter()
                .filter(|e| e.state() == ModuleState::Active)
                .find(|e| self.check_dependencies(e).is_err());
            match victim {
                Some(entry) => {
                    warn!(
                        "Stopping module {}: its dependencies are no longer registered",
                        entry.name
                    );
                    self.stop_cascade(&entry.name);
                }
                None => break,
            }
        }
        if !TransitionMarker::held() {
            SWEEP_PENDING.with(|pending| pending.set(false));
        }
    }

    /// A service on `interface` left the registry or was modified
    ///
    /// Outside any transition the unsatisfied sweep runs in place. A thread
    /// holding a transition lock records the sweep for [`settle`](Self::settle);
    /// activator threads hand it to the worker pool.
    fn service_departed(&self, interface: &str) {
        if !self.entries().iter().any(|e| e.binds(interface)) {
            return;
        }
        if TransitionMarker::held() {
            SWEEP_PENDING.with(|pending| pending.set(true));
        } else if ActivatorMarker::held() {
            let manager = self.clone();
            let deferred = self
                .shared
                .subsystems
                .pool
                .execute(move || manager.stop_unsatisfied());
            if deferred.is_err() {
                debug!("Worker pool closed; skipping dependency sweep for {}", interface);
            }
        } else {
            self.stop_unsatisfied();
        }
    }

    /// Run a sweep recorded while this thread held a transition lock
    fn settle(&self) {
        if !TransitionMarker::held() && SWEEP_PENDING.with(|pending| pending.replace(false)) {
            self.stop_unsatisfied();
        }
    }

    fn stop_one(&self, entry: &Arc<ModuleEntry>) {
        let mut events = Vec::new();
        {
            let _transition = entry.begin();
            self.stop_locked(entry, &mut events);
        }
        self.publish(events);
    }

    fn stop_locked(&self, entry: &ModuleEntry, events: &mut Vec<Event>) {
        if entry.state() != ModuleState::Active {
            return;
        }

        // Registrations are revoked before anyone observes the module leaving ACTIVE
        self.shared.subsystems.services.unregister_all(&entry.name);
        entry.set_state(ModuleState::Stopping);
        events.push(entry.event("STOPPING"));
        info!("Stopping module {}", entry.name);

        let (activator, context) = {
            let runtime = entry.runtime.lock();
            (runtime.activator.clone(), runtime.context.clone())
        };
        if let (Some(activator), Some(ctx)) = (activator, context.clone()) {
            let outcome = call_with_timeout(
                &format!("stop-{}", entry.name),
                self.shared.settings.stop_timeout,
                move || {
                    let _marker = ActivatorMarker::enter();
                    activator.stop(&ctx)
                },
            );
            match outcome {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("Module {} stop failed: {:#}", entry.name, e),
                Ok(Err(panic)) => warn!("Module {} stop panicked: {}", entry.name, panic),
                Err(timed_out) => warn!(
                    "Module {} stop {}; forcing RESOLVED",
                    entry.name, timed_out
                ),
            }
        }

        if let Some(context) = context {
            context.invalidate();
            context.sweep();
        }
        entry.runtime.lock().context = None;
        entry.set_state(ModuleState::Resolved);
        events.push(entry.event("STOPPED"));
    }

    /// Stop `name` later on a worker thread
    pub fn request_stop(&self, name: &str) -> Result<()> {
        let manager = self.clone();
        let name = name.to_string();
        self.shared
            .subsystems
            .pool
            .execute(move || {
                if let Err(e) = manager.stop(&name) {
                    warn!("Deferred stop of {} failed: {}", name, e);
                }
            })
            .map_err(CdmfError::from)
    }

    // Uninstall

    /// Stop if needed, then remove the module and release its activator
    ///
    /// RESOLVED modules that depended on it fall back to INSTALLED.
    pub fn uninstall(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        self.stop(name)?;
        let dependents = self.resolution().dependents_of(name);

        let mut events = Vec::new();
        let runtime = {
            let _transition = entry.begin();
            if entry.state() == ModuleState::Uninstalled {
                return Err(CdmfError::not_found(format!("module {}", name)));
            }
            // A start may have slipped in since the stop above
            self.stop_locked(&entry, &mut events);
            entry.set_state(ModuleState::Uninstalled);
            self.shared.modules.write().remove(name);
            std::mem::take(&mut *entry.runtime.lock())
        };

        for dependent in dependents {
            if let Ok(other) = self.entry(&dependent) {
                let _transition = other.begin();
                if other.state() == ModuleState::Resolved {
                    other.set_state(ModuleState::Installed);
                }
            }
        }

        let subsystems = &self.shared.subsystems;
        subsystems.services.unregister_all(name);
        subsystems.events.unsubscribe_owner(name);
        subsystems.permissions.clear(name);
        subsystems.resources.clear_module(name);

        events.push(entry.event("UNINSTALLED"));
        self.publish(events);
        info!("Uninstalled module {}", name);
        self.settle();

        // Destroys the activator, then releases its library
        drop(runtime);
        Ok(())
    }

    // Queries

    pub fn get_module(&self, name: &str) -> Option<ModuleInfo> {
        self.entry(name).ok().map(|e| e.info())
    }

    /// All installed modules, ordered by name
    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.entries().iter().map(|e| e.info()).collect()
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.entry(name).ok().map(|e| e.state())
    }

    pub fn len(&self) -> usize {
        self.shared.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Bulk operations

    /// Start every installed module; returns the failures
    pub fn start_all(&self) -> Vec<(String, CdmfError)> {
        let names: Vec<String> = self.shared.modules.read().keys().cloned().collect();
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.start(&name) {
                warn!("Could not start module {}: {}", name, e);
                failures.push((name, e));
            }
        }
        failures
    }

    /// Stop every module, dependents before providers
    pub fn stop_all(&self) {
        for name in self.resolution().shutdown_order() {
            if let Ok(entry) = self.entry(&name) {
                self.stop_one(&entry);
            }
        }
        self.settle();
    }

    /// Stop and uninstall everything
    pub fn shutdown(&self) {
        self.stop_all();
        for name in self.resolution().shutdown_order() {
            if let Err(e) = self.uninstall(&name) {
                warn!("Could not uninstall module {}: {}", name, e);
            }
        }
    }
}

fn watch_services(subsystems: &Subsystems, manager: Weak<ManagerShared>) -> Option<ListenerId> {
    let listener = move |event: &ServiceEvent| {
        if event.event_type == ServiceEventType::Registered {
            return;
        }
        if let Some(shared) = manager.upgrade() {
            ModuleManager::from_shared(shared).service_departed(event.reference.interface());
        }
    };
    match subsystems.services.add_service_listener(None, listener) {
        Ok(id) => Some(id),
        Err(e) => {
            error!("Could not watch the service registry: {}", e);
            None
        }
    }
}

/// Services without `service.version` match any range
fn service_version_in(reference: &ServiceReference, range: &VersionRange) -> bool {
    match reference.properties().get_string(SERVICE_VERSION) {
        Some(version) => version
            .parse::<Version>()
            .map(|v| range.includes(&v))
            .unwrap_or(false),
        None => true,
    }
}
