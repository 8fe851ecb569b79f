//! Configuration handle

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};

use super::admin::AdminShared;
use super::event::{ConfigurationEvent, ConfigurationEventType};
use super::persistence::ConfigurationRecord;
use crate::error::{CdmfError, Result};
use crate::properties::{Properties, PropertyValue};

struct ConfigState {
    properties: Properties,
    version: u64,
    deleted: bool,
}

pub(crate) struct ConfigInner {
    pid: String,
    factory_pid: Option<String>,
    state: RwLock<ConfigState>,
    /// Serializes mutation and fan-out so events follow mutation order.
    /// Reentrant so a listener on the notifying thread cannot self-deadlock.
    mutation: ReentrantMutex<()>,
    admin: Weak<AdminShared>,
}

/// Shared handle to one configuration
///
/// Cloning is cheap; all clones observe the same state. After deletion the
/// handle rejects mutation with [`CdmfError::Deleted`] but still reports the
/// final properties.
#[derive(Clone)]
pub struct Configuration {
    inner: Arc<ConfigInner>,
}

impl Configuration {
    pub(crate) fn new(
        pid: String,
        factory_pid: Option<String>,
        properties: Properties,
        admin: Weak<AdminShared>,
    ) -> Self {
        Self {
            inner: Arc::new(ConfigInner {
                pid,
                factory_pid,
                state: RwLock::new(ConfigState {
                    properties,
                    version: 0,
                    deleted: false,
                }),
                mutation: ReentrantMutex::new(()),
                admin,
            }),
        }
    }

    pub fn pid(&self) -> &str {
        &self.inner.pid
    }

    pub fn factory_pid(&self) -> Option<&str> {
        self.inner.factory_pid.as_deref()
    }

    /// Snapshot of the current properties
    pub fn properties(&self) -> Properties {
        self.inner.state.read().properties.clone()
    }

    pub fn get(&self, key: &str) -> Option<PropertyValue> {
        self.inner.state.read().properties.get(key).cloned()
    }

    /// Incremented by every successful mutation
    pub fn version(&self) -> u64 {
        self.inner.state.read().version
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.state.read().deleted
    }

    /// Replace all properties
    pub fn update(&self, properties: Properties) -> Result<()> {
        for (key, value) in properties.iter() {
            ensure_storable(key, value)?;
        }
        self.mutate(|props| {
            *props = properties;
        })
    }

    /// Set one property
    pub fn set(&self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        ensure_storable(&key, &value)?;
        self.mutate(move |props| {
            props.set(key, value);
        })
    }

    /// Remove one property; removing an absent key is still an update
    pub fn remove_property(&self, key: &str) -> Result<Option<PropertyValue>> {
        let mut removed = None;
        self.mutate(|props| {
            removed = props.remove(key);
        })?;
        Ok(removed)
    }

    /// Delete through the owning admin
    pub fn delete(&self) -> Result<()> {
        match self.inner.admin.upgrade() {
            Some(admin) => AdminShared::delete(&admin, self.pid()),
            None => {
                self.mark_deleted()?;
                Ok(())
            }
        }
    }

    pub fn to_record(&self) -> ConfigurationRecord {
        ConfigurationRecord {
            factory_pid: self.inner.factory_pid.clone(),
            pid: self.inner.pid.clone(),
            properties: self.properties(),
        }
    }

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Properties),
    {
        let _ordered = self.inner.mutation.lock();
        let event = {
            let mut state = self.inner.state.write();
            if state.deleted {
                return Err(CdmfError::Deleted(self.inner.pid.clone()));
            }
            let old = state.properties.clone();
            f(&mut state.properties);
            state.version += 1;
            self.event(ConfigurationEventType::Updated, state.version, old, state.properties.clone())
        };

        match self.inner.admin.upgrade() {
            Some(admin) => {
                let persisted = admin.persist(self);
                admin.fire(&event);
                persisted
            }
            None => Ok(()),
        }
    }

    /// Flip the deleted flag and return the DELETED event
    pub(crate) fn mark_deleted(&self) -> Result<ConfigurationEvent> {
        let mut state = self.inner.state.write();
        if state.deleted {
            return Err(CdmfError::Deleted(self.inner.pid.clone()));
        }
        state.deleted = true;
        state.version += 1;
        let snapshot = state.properties.clone();
        Ok(self.event(
            ConfigurationEventType::Deleted,
            state.version,
            snapshot,
            Properties::new(),
        ))
    }

    pub(crate) fn mutation_guard(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.inner.mutation.lock()
    }

    /// Replace properties without notification, for loads from storage
    pub(crate) fn replace_silently(&self, properties: Properties) -> Result<(Properties, u64)> {
        let mut state = self.inner.state.write();
        if state.deleted {
            return Err(CdmfError::Deleted(self.inner.pid.clone()));
        }
        let old = std::mem::replace(&mut state.properties, properties);
        state.version += 1;
        Ok((old, state.version))
    }

    pub(crate) fn event(
        &self,
        event_type: ConfigurationEventType,
        version: u64,
        old_properties: Properties,
        new_properties: Properties,
    ) -> ConfigurationEvent {
        ConfigurationEvent {
            event_type,
            pid: self.inner.pid.clone(),
            factory_pid: self.inner.factory_pid.clone(),
            version,
            old_properties,
            new_properties,
        }
    }

    /// Same underlying configuration
    pub fn ptr_eq(&self, other: &Configuration) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// NaN and infinities have no JSON form
fn ensure_storable(key: &str, value: &PropertyValue) -> Result<()> {
    match value {
        PropertyValue::Double(d) if !d.is_finite() => Err(CdmfError::invalid(format!(
            "property {} is not a finite number",
            key
        ))),
        _ => Ok(()),
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Configuration")
            .field("pid", &self.inner.pid)
            .field("factory_pid", &self.inner.factory_pid)
            .field("version", &state.version)
            .field("deleted", &state.deleted)
            .field("properties", &state.properties)
            .finish()
    }
}
