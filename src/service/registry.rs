//! Service registry
//!
//! Interface-keyed service records. Each interface keeps its records sorted
//! by `(service.ranking DESC, service.id ASC)` so lookups return in order
//! without sorting. Listeners run after the registry lock is released.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::filter::Filter;
use super::registration::{
    ServiceInstance, ServiceRecord, ServiceReference, ServiceRegistration, SERVICE_ID,
    SERVICE_INTERFACE, SERVICE_MODULE, SERVICE_RANKING,
};
use crate::error::{CdmfError, Result};
use crate::properties::Properties;
use crate::utils::contain_panic;
use crate::ListenerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEventType {
    Registered,
    Modified,
    Unregistering,
}

impl ServiceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceEventType::Registered => "REGISTERED",
            ServiceEventType::Modified => "MODIFIED",
            ServiceEventType::Unregistering => "UNREGISTERING",
        }
    }
}

impl fmt::Display for ServiceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub event_type: ServiceEventType,
    pub reference: ServiceReference,
}

pub type ServiceListener = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    filter: Filter,
    listener: ServiceListener,
}

#[derive(Default)]
struct Tables {
    by_interface: HashMap<String, Vec<Arc<ServiceRecord>>>,
    by_id: HashMap<u64, Arc<ServiceRecord>>,
}

impl Tables {
    fn insert(&mut self, record: Arc<ServiceRecord>) {
        let list = self.by_interface.entry(record.interface.clone()).or_default();
        let key = record.sort_key();
        let at = list.partition_point(|r| r.sort_key() < key);
        list.insert(at, record.clone());
        self.by_id.insert(record.id, record);
    }

    fn remove(&mut self, id: u64) -> Option<Arc<ServiceRecord>> {
        let record = self.by_id.remove(&id)?;
        if let Some(list) = self.by_interface.get_mut(&record.interface) {
            list.retain(|r| r.id != id);
            if list.is_empty() {
                self.by_interface.remove(&record.interface);
            }
        }
        Some(record)
    }
}

pub(crate) struct RegistryShared {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
}

impl RegistryShared {
    pub(crate) fn reference(&self, id: u64) -> Option<ServiceReference> {
        self.tables
            .read()
            .by_id
            .get(&id)
            .cloned()
            .map(ServiceReference::new)
    }

    pub(crate) fn unregister(&self, id: u64) -> bool {
        let removed = self.tables.write().remove(id);
        match removed {
            Some(record) => {
                debug!(
                    "Unregistered service {} ({}) of {}",
                    record.id, record.interface, record.module_id
                );
                self.fire(ServiceEventType::Unregistering, ServiceReference::new(record));
                true
            }
            None => false,
        }
    }

    pub(crate) fn modify(&self, id: u64, mut properties: Properties) -> Result<()> {
        let updated = {
            let mut tables = self.tables.write();
            let current = tables
                .by_id
                .get(&id)
                .cloned()
                .ok_or_else(|| CdmfError::not_found(format!("service {}", id)))?;
            let ranking = properties.get_int(SERVICE_RANKING).unwrap_or(0);
            properties.set(SERVICE_ID, current.id as i64);
            properties.set(SERVICE_RANKING, ranking);
            properties.set(SERVICE_INTERFACE, current.interface.clone());
            properties.set(SERVICE_MODULE, current.module_id.clone());

            let record = Arc::new(ServiceRecord {
                id: current.id,
                interface: current.interface.clone(),
                module_id: current.module_id.clone(),
                instance: current.instance.clone(),
                properties,
                ranking,
            });
            tables.remove(id);
            tables.insert(record.clone());
            record
        };
        self.fire(ServiceEventType::Modified, ServiceReference::new(updated));
        Ok(())
    }

    fn fire(&self, event_type: ServiceEventType, reference: ServiceReference) {
        let listeners: Vec<ServiceListener> = self
            .listeners
            .read()
            .iter()
            .filter(|entry| entry.filter.matches(reference.properties()))
            .map(|entry| entry.listener.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        let event = ServiceEvent {
            event_type,
            reference,
        };
        for listener in listeners {
            contain_panic(|| listener(&event), "Service listener failed");
        }
    }
}

/// Service registry for one framework instance
#[derive(Clone)]
pub struct ServiceRegistry {
    shared: Arc<RegistryShared>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                tables: RwLock::new(Tables::default()),
                next_id: AtomicU64::new(1),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Register a type-erased service on behalf of `module_id`
    ///
    /// Assigns `service.id` and fills in the standard properties. The record
    /// is visible to lookups before this returns.
    pub fn register(
        &self,
        module_id: &str,
        interface: &str,
        instance: ServiceInstance,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.register_while(module_id, interface, instance, properties, || true)
    }

    /// Register only if `admit` still holds under the registry write lock
    ///
    /// A refused registration is never visible and fires no event.
    pub(crate) fn register_while<F>(
        &self,
        module_id: &str,
        interface: &str,
        instance: ServiceInstance,
        mut properties: Properties,
        admit: F,
    ) -> Result<ServiceRegistration>
    where
        F: FnOnce() -> bool,
    {
        if interface.is_empty() {
            return Err(CdmfError::invalid("service interface must not be empty"));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let ranking = properties.get_int(SERVICE_RANKING).unwrap_or(0);
        properties.set(SERVICE_ID, id as i64);
        properties.set(SERVICE_RANKING, ranking);
        properties.set(SERVICE_INTERFACE, interface);
        properties.set(SERVICE_MODULE, module_id);

        let record = Arc::new(ServiceRecord {
            id,
            interface: interface.to_string(),
            module_id: module_id.to_string(),
            instance,
            properties,
            ranking,
        });
        {
            let mut tables = self.shared.tables.write();
            if !admit() {
                return Err(CdmfError::InvalidState(format!(
                    "{} may no longer register {}",
                    module_id, interface
                )));
            }
            tables.insert(record.clone());
        }
        debug!(
            "Registered service {} ({}, ranking {}) for {}",
            id, interface, ranking, module_id
        );
        self.shared
            .fire(ServiceEventType::Registered, ServiceReference::new(record));

        Ok(ServiceRegistration::new(
            id,
            interface.to_string(),
            Arc::downgrade(&self.shared),
        ))
    }

    /// Register a concrete value
    pub fn register_service<T: Any + Send + Sync>(
        &self,
        module_id: &str,
        interface: &str,
        service: T,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.register(module_id, interface, Arc::new(service), properties)
    }

    /// Remove a service by id; unknown ids are a no-op
    pub fn unregister(&self, id: u64) -> bool {
        self.shared.unregister(id)
    }

    /// Remove every service registered by a module
    pub fn unregister_all(&self, module_id: &str) -> usize {
        let ids: Vec<u64> = self
            .services_of(module_id)
            .iter()
            .map(ServiceReference::id)
            .collect();
        let removed = ids.into_iter().filter(|id| self.shared.unregister(*id)).count();
        if removed > 0 {
            info!("Unregistered {} services of {}", removed, module_id);
        }
        removed
    }

    /// Services registered by a module, ordered by id
    pub fn services_of(&self, module_id: &str) -> Vec<ServiceReference> {
        let mut refs: Vec<ServiceReference> = self
            .shared
            .tables
            .read()
            .by_id
            .values()
            .filter(|r| r.module_id == module_id)
            .cloned()
            .map(ServiceReference::new)
            .collect();
        refs.sort_by_key(ServiceReference::id);
        refs
    }

    pub fn reference(&self, id: u64) -> Option<ServiceReference> {
        self.shared.reference(id)
    }

    /// Matching references ordered by ranking then id
    pub fn get_service_references(
        &self,
        interface: &str,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>> {
        let filter = Filter::parse(filter.unwrap_or(""))?;
        Ok(self.references_matching(interface, &filter))
    }

    pub fn references_matching(&self, interface: &str, filter: &Filter) -> Vec<ServiceReference> {
        self.shared
            .tables
            .read()
            .by_interface
            .get(interface)
            .map(|list| {
                list.iter()
                    .filter(|r| filter.matches(&r.properties))
                    .cloned()
                    .map(ServiceReference::new)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest-ranked matching reference
    pub fn get_service_reference(
        &self,
        interface: &str,
        filter: Option<&str>,
    ) -> Result<Option<ServiceReference>> {
        Ok(self.get_service_references(interface, filter)?.into_iter().next())
    }

    /// Highest-ranked matching service object
    pub fn get_service(&self, interface: &str, filter: Option<&str>) -> Result<Option<ServiceInstance>> {
        Ok(self
            .get_service_reference(interface, filter)?
            .map(|r| r.instance()))
    }

    /// All matching service objects in lookup order
    pub fn get_services(&self, interface: &str, filter: Option<&str>) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .get_service_references(interface, filter)?
            .iter()
            .map(ServiceReference::instance)
            .collect())
    }

    /// Highest-ranked matching service, downcast to `T`
    pub fn get_service_as<T: Any + Send + Sync>(
        &self,
        interface: &str,
        filter: Option<&str>,
    ) -> Result<Option<Arc<T>>> {
        Ok(self
            .get_service_reference(interface, filter)?
            .and_then(|r| r.downcast::<T>()))
    }

    /// Interfaces with at least one registered service
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .tables
            .read()
            .by_interface
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.shared.tables.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Listen to services whose properties match `filter`
    pub fn add_service_listener<F>(&self, filter: Option<&str>, listener: F) -> Result<ListenerId>
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        let filter = Filter::parse(filter.unwrap_or(""))?;
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.write().push(ListenerEntry {
            id,
            filter,
            listener: Arc::new(listener),
        });
        Ok(id)
    }

    pub fn remove_service_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    trait Logger: Send + Sync {
        fn name(&self) -> &str;
    }

    struct NamedLogger(&'static str);

    impl Logger for NamedLogger {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn logger(name: &'static str) -> Arc<dyn Logger> {
        Arc::new(NamedLogger(name))
    }

    #[test]
    fn test_rank_ordered_lookup() {
        let registry = ServiceRegistry::new();
        registry
            .register_service("m", "ILogger", logger("A"), Properties::new().with(SERVICE_RANKING, 10))
            .unwrap();
        registry
            .register_service("m", "ILogger", logger("B"), Properties::new().with(SERVICE_RANKING, 20))
            .unwrap();

        let head = registry
            .get_service_as::<Arc<dyn Logger>>("ILogger", None)
            .unwrap()
            .unwrap();
        assert_eq!(head.name(), "B");

        let names: Vec<String> = registry
            .get_service_references("ILogger", None)
            .unwrap()
            .iter()
            .map(|r| r.downcast::<Arc<dyn Logger>>().unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn test_equal_rank_orders_by_id() {
        let registry = ServiceRegistry::new();
        let first = registry.register_service("m", "I", 1u32, Properties::new()).unwrap();
        let second = registry.register_service("m", "I", 2u32, Properties::new()).unwrap();
        let ids: Vec<u64> = registry
            .get_service_references("I", None)
            .unwrap()
            .iter()
            .map(ServiceReference::id)
            .collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert!(first.id() < second.id());
    }

    #[test]
    fn test_standard_properties_and_filter() {
        let registry = ServiceRegistry::new();
        let reg = registry
            .register_service("mod.a", "IStore", "x".to_string(), Properties::new().with("kind", "disk"))
            .unwrap();
        let reference = reg.reference().unwrap();
        assert_eq!(reference.properties().get_int(SERVICE_ID), Some(reg.id() as i64));
        assert_eq!(reference.properties().get_int(SERVICE_RANKING), Some(0));
        assert_eq!(reference.properties().get_string(SERVICE_MODULE).as_deref(), Some("mod.a"));

        assert_eq!(registry.get_services("IStore", Some("(kind=disk)")).unwrap().len(), 1);
        assert!(registry.get_service("IStore", Some("(kind=mem*)")).unwrap().is_none());
        assert!(matches!(
            registry.get_service("IStore", Some("(kind=")),
            Err(CdmfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_refused_registration_is_invisible() {
        let registry = ServiceRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        registry
            .add_service_listener(None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let refused = registry.register_while("m", "IGate", Arc::new(1u8), Properties::new(), || false);
        assert!(matches!(refused, Err(CdmfError::InvalidState(_))));
        assert!(registry.get_service("IGate", None).unwrap().is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        registry
            .register_while("m", "IGate", Arc::new(2u8), Properties::new(), || true)
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ServiceRegistry::new();
        let reg = registry.register_service("m", "I", 1u8, Properties::new()).unwrap();
        assert!(reg.unregister());
        assert!(!reg.unregister());
        assert!(reg.is_unregistered());
        assert!(registry.get_service("I", None).unwrap().is_none());
        assert!(registry.interfaces().is_empty());
        assert!(reg.set_properties(Properties::new()).is_err());
    }

    #[test]
    fn test_set_properties_reranks() {
        let registry = ServiceRegistry::new();
        let low = registry.register_service("m", "I", "low", Properties::new()).unwrap();
        registry
            .register_service("m", "I", "mid", Properties::new().with(SERVICE_RANKING, 5))
            .unwrap();
        low.set_properties(Properties::new().with(SERVICE_RANKING, 9).with(SERVICE_ID, 999))
            .unwrap();

        let head = registry.get_service_reference("I", None).unwrap().unwrap();
        assert_eq!(head.id(), low.id());
        assert_eq!(head.properties().get_int(SERVICE_ID), Some(low.id() as i64));
    }

    #[test]
    fn test_unregister_all_and_services_of() {
        let registry = ServiceRegistry::new();
        registry.register_service("a", "I", 1u8, Properties::new()).unwrap();
        registry.register_service("a", "J", 2u8, Properties::new()).unwrap();
        registry.register_service("b", "I", 3u8, Properties::new()).unwrap();
        assert_eq!(registry.services_of("a").len(), 2);
        assert_eq!(registry.unregister_all("a"), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.services_of("b")[0].module_id(), "b");
    }

    #[test]
    fn test_listeners_filtered_and_contained() {
        let registry = ServiceRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.add_service_listener(None, |_| panic!("listener bug")).unwrap();
        registry
            .add_service_listener(Some("(service.interface=ILogger)"), move |e| {
                sink.lock().unwrap().push(e.event_type)
            })
            .unwrap();

        let reg = registry.register_service("m", "ILogger", 1u8, Properties::new()).unwrap();
        registry.register_service("m", "Other", 2u8, Properties::new()).unwrap();
        reg.set_properties(Properties::new()).unwrap();
        reg.unregister();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ServiceEventType::Registered,
                ServiceEventType::Modified,
                ServiceEventType::Unregistering
            ]
        );
    }

    #[test]
    fn test_listener_sees_unregistered_state() {
        let registry = ServiceRegistry::new();
        let inner = registry.clone();
        let visible = Arc::new(Mutex::new(None));
        let sink = visible.clone();
        registry
            .add_service_listener(None, move |e| {
                if e.event_type == ServiceEventType::Unregistering {
                    *sink.lock().unwrap() = Some(inner.reference(e.reference.id()).is_some());
                }
            })
            .unwrap();
        registry.register_service("m", "I", 1u8, Properties::new()).unwrap().unregister();
        assert_eq!(*visible.lock().unwrap(), Some(false));
    }
}
