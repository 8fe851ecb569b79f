//! Service registry
//!
//! Modules publish service objects under an interface name with a property
//! map and look them up with optional LDAP-style filters.

pub mod filter;
pub mod registration;
pub mod registry;

pub use filter::Filter;
pub use registration::{
    ServiceInstance, ServiceReference, ServiceRegistration, SERVICE_ID, SERVICE_INTERFACE,
    SERVICE_MODULE, SERVICE_RANKING,
};
pub use registry::{ServiceEvent, ServiceEventType, ServiceListener, ServiceRegistry};
