//! Service records, references and registration handles

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::registry::RegistryShared;
use crate::error::{CdmfError, Result};
use crate::properties::Properties;

pub const SERVICE_ID: &str = "service.id";
pub const SERVICE_RANKING: &str = "service.ranking";
pub const SERVICE_INTERFACE: &str = "service.interface";
pub const SERVICE_MODULE: &str = "service.module";

/// Type-erased service object
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

pub(crate) struct ServiceRecord {
    pub(crate) id: u64,
    pub(crate) interface: String,
    pub(crate) module_id: String,
    pub(crate) instance: ServiceInstance,
    pub(crate) properties: Properties,
    pub(crate) ranking: i64,
}

impl ServiceRecord {
    /// Lookup order: ranking descending, then id ascending
    pub(crate) fn sort_key(&self) -> (std::cmp::Reverse<i64>, u64) {
        (std::cmp::Reverse(self.ranking), self.id)
    }
}

/// Snapshot of a registered service
///
/// A reference may outlive its registration; the registry does not track who
/// holds one.
#[derive(Clone)]
pub struct ServiceReference {
    record: Arc<ServiceRecord>,
}

impl ServiceReference {
    pub(crate) fn new(record: Arc<ServiceRecord>) -> Self {
        Self { record }
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn interface(&self) -> &str {
        &self.record.interface
    }

    /// Identity of the registering module
    pub fn module_id(&self) -> &str {
        &self.record.module_id
    }

    pub fn ranking(&self) -> i64 {
        self.record.ranking
    }

    pub fn properties(&self) -> &Properties {
        &self.record.properties
    }

    pub fn instance(&self) -> ServiceInstance {
        self.record.instance.clone()
    }

    /// Typed access to the service object
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.record.instance.clone().downcast::<T>().ok()
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.record.id == other.record.id
    }
}

impl Eq for ServiceReference {}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.record.id)
            .field("interface", &self.record.interface)
            .field("module", &self.record.module_id)
            .field("ranking", &self.record.ranking)
            .finish()
    }
}

/// Handle returned by `register`; owner-releasable
pub struct ServiceRegistration {
    id: u64,
    interface: String,
    registry: Weak<RegistryShared>,
    unregistered: AtomicBool,
}

impl ServiceRegistration {
    pub(crate) fn new(id: u64, interface: String, registry: Weak<RegistryShared>) -> Self {
        Self {
            id,
            interface,
            registry,
            unregistered: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Current reference, or `None` once unregistered
    pub fn reference(&self) -> Option<ServiceReference> {
        self.registry.upgrade()?.reference(self.id)
    }

    /// Remove the service; later calls are no-ops
    ///
    /// Returns whether this call removed it.
    pub fn unregister(&self) -> bool {
        if self.unregistered.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.unregister(self.id),
            None => false,
        }
    }

    /// Replace the service properties
    ///
    /// `service.id`, `service.interface` and `service.module` are kept;
    /// `service.ranking` is re-read and the service re-ranked.
    pub fn set_properties(&self, properties: Properties) -> Result<()> {
        if self.unregistered.load(Ordering::SeqCst) {
            return Err(CdmfError::InvalidState(format!(
                "service {} is unregistered",
                self.id
            )));
        }
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| CdmfError::InvalidState("service registry is gone".into()))?;
        registry.modify(self.id, properties)
    }

    pub fn is_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::SeqCst)
            || self
                .registry
                .upgrade()
                .map(|r| r.reference(self.id).is_none())
                .unwrap_or(true)
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("id", &self.id)
            .field("interface", &self.interface)
            .finish()
    }
}
