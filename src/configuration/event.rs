//! Configuration change events

use std::fmt;
use std::sync::Arc;

use super::admin::ConfigurationAdmin;
use super::config::Configuration;
use crate::properties::Properties;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationEventType {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ConfigurationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigurationEventType::Created => "CREATED",
            ConfigurationEventType::Updated => "UPDATED",
            ConfigurationEventType::Deleted => "DELETED",
        })
    }
}

/// A change to one configuration
///
/// Carries copies of the properties before and after the mutation plus the
/// PID and version of the configuration; it does not keep the configuration
/// itself alive.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationEvent {
    pub event_type: ConfigurationEventType,
    pub pid: String,
    pub factory_pid: Option<String>,
    pub version: u64,
    pub old_properties: Properties,
    pub new_properties: Properties,
}

impl ConfigurationEvent {
    /// Look up the live configuration this event refers to
    pub fn resolve(&self, admin: &ConfigurationAdmin) -> Option<Configuration> {
        admin.find(&self.pid)
    }
}

pub type ConfigurationListener = Arc<dyn Fn(&ConfigurationEvent) + Send + Sync>;
