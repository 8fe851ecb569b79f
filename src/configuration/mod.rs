//! Configuration core
//!
//! PID-keyed configuration objects with factory instances, synchronous
//! change notification and JSON persistence (one file per PID).

pub mod admin;
pub mod config;
pub mod event;
pub mod persistence;

pub use admin::ConfigurationAdmin;
pub use config::Configuration;
pub use event::{ConfigurationEvent, ConfigurationEventType, ConfigurationListener};
pub use persistence::ConfigurationRecord;

use crate::error::{CdmfError, Result};

/// Separates factory PID and instance name in a factory instance PID
pub const FACTORY_SEPARATOR: char = '~';

/// Split a factory instance PID into `(factory_pid, instance_name)`
///
/// Returns `None` for plain PIDs and for PIDs where the separator appears
/// more than once or at either end.
pub fn split_pid(pid: &str) -> Option<(&str, &str)> {
    let (factory, name) = pid.split_once(FACTORY_SEPARATOR)?;
    if factory.is_empty() || name.is_empty() || name.contains(FACTORY_SEPARATOR) {
        return None;
    }
    Some((factory, name))
}

/// Build `factory~name`
pub fn factory_instance_pid(factory_pid: &str, instance_name: &str) -> String {
    format!("{}{}{}", factory_pid, FACTORY_SEPARATOR, instance_name)
}

/// A PID usable for a plain (non-factory) configuration
pub(crate) fn validate_plain_pid(pid: &str) -> Result<()> {
    if pid.is_empty() {
        return Err(CdmfError::invalid("PID must not be empty"));
    }
    if pid.contains(FACTORY_SEPARATOR) {
        return Err(CdmfError::invalid(format!(
            "PID {:?} contains the reserved separator '{}'",
            pid, FACTORY_SEPARATOR
        )));
    }
    Ok(())
}

/// A plain PID or a well-formed factory instance PID
pub(crate) fn validate_pid(pid: &str) -> Result<()> {
    if pid.contains(FACTORY_SEPARATOR) {
        return match split_pid(pid) {
            Some(_) => Ok(()),
            None => Err(CdmfError::invalid(format!("malformed factory PID {:?}", pid))),
        };
    }
    validate_plain_pid(pid)
}

/// PID filter: empty matches all, trailing `*` is a prefix, otherwise substring
pub fn pid_matches(filter: &str, pid: &str) -> bool {
    if filter.is_empty() || filter == "*" {
        return true;
    }
    match filter.strip_suffix('*') {
        Some(prefix) => pid.starts_with(prefix),
        None => pid.contains(filter),
    }
}
