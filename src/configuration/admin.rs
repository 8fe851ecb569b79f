//! Configuration admin
//!
//! Owns every configuration of one framework instance. `create` fails on an
//! existing PID; `get` returns the existing configuration or creates an empty
//! one. Listeners run synchronously on the mutating thread after the change
//! is applied and after the admin's map lock is released.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::Configuration;
use super::event::{ConfigurationEvent, ConfigurationEventType, ConfigurationListener};
use super::persistence::{self, file_for, json_files, read_record, remove_record, write_record};
use super::{
    factory_instance_pid, pid_matches, split_pid, validate_pid, validate_plain_pid,
    FACTORY_SEPARATOR,
};
use crate::error::{CdmfError, Result};
use crate::properties::Properties;
use crate::utils::contain_panic;
use crate::ListenerId;

struct ListenerEntry {
    id: ListenerId,
    filter: String,
    listener: ConfigurationListener,
}

pub(crate) struct AdminShared {
    configs: RwLock<BTreeMap<String, Configuration>>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
    storage_dir: RwLock<Option<PathBuf>>,
}

impl AdminShared {
    /// Write a configuration through to the storage directory, if any
    pub(crate) fn persist(&self, config: &Configuration) -> Result<()> {
        let Some(dir) = self.storage_dir.read().clone() else {
            return Ok(());
        };
        if config.is_deleted() {
            return Ok(());
        }
        let path = file_for(&dir, config.pid())?;
        write_record(&path, &config.to_record()).map_err(|e| {
            warn!("Failed to persist configuration {}: {}", config.pid(), e);
            e
        })
    }

    /// Deliver an event to every matching listener
    pub(crate) fn fire(&self, event: &ConfigurationEvent) {
        let listeners: Vec<ConfigurationListener> = self
            .listeners
            .read()
            .iter()
            .filter(|entry| pid_matches(&entry.filter, &event.pid))
            .map(|entry| entry.listener.clone())
            .collect();

        debug!(
            "Configuration {} {} (version {}) -> {} listeners",
            event.pid,
            event.event_type,
            event.version,
            listeners.len()
        );
        for listener in listeners {
            contain_panic(
                || listener(event),
                &format!("Configuration listener failed on {}", event.pid),
            );
        }
    }

    pub(crate) fn delete(this: &Arc<Self>, pid: &str) -> Result<()> {
        let config = this
            .configs
            .write()
            .remove(pid)
            .ok_or_else(|| CdmfError::not_found(format!("configuration {}", pid)))?;

        let _ordered = config.mutation_guard();
        let event = config.mark_deleted()?;
        this.fire(&event);

        if let Some(dir) = this.storage_dir.read().clone() {
            remove_record(&file_for(&dir, pid)?)?;
        }
        info!("Deleted configuration {}", pid);
        Ok(())
    }
}

/// Configuration admin for one framework instance
#[derive(Clone)]
pub struct ConfigurationAdmin {
    shared: Arc<AdminShared>,
}

impl ConfigurationAdmin {
    /// In-memory admin without write-through
    pub fn new() -> Self {
        Self {
            shared: Arc::new(AdminShared {
                configs: RwLock::new(BTreeMap::new()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                storage_dir: RwLock::new(None),
            }),
        }
    }

    /// Admin persisting every mutation to `dir`, seeded from its contents
    pub fn with_storage<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let admin = Self::new();
        std::fs::create_dir_all(dir.as_ref())?;
        admin.load_from_directory(dir.as_ref())?;
        admin.set_storage_dir(Some(dir.as_ref().to_path_buf()));
        Ok(admin)
    }

    pub fn set_storage_dir(&self, dir: Option<PathBuf>) {
        *self.shared.storage_dir.write() = dir;
    }

    pub fn storage_dir(&self) -> Option<PathBuf> {
        self.shared.storage_dir.read().clone()
    }

    /// Create a new configuration; fails if the PID exists
    pub fn create(&self, pid: &str) -> Result<Configuration> {
        validate_plain_pid(pid)?;
        let config = {
            let mut configs = self.shared.configs.write();
            if configs.contains_key(pid) {
                return Err(CdmfError::Duplicate(format!("configuration {}", pid)));
            }
            let config = self.new_config(pid.to_string(), None, Properties::new());
            configs.insert(pid.to_string(), config.clone());
            config
        };
        self.announce_created(config)
    }

    /// Existing configuration, or a new empty one
    pub fn get(&self, pid: &str) -> Result<Configuration> {
        validate_pid(pid)?;
        if let Some(existing) = self.shared.configs.read().get(pid) {
            return Ok(existing.clone());
        }

        let config = {
            let mut configs = self.shared.configs.write();
            if let Some(existing) = configs.get(pid) {
                return Ok(existing.clone());
            }
            let factory_pid = split_pid(pid).map(|(factory, _)| factory.to_string());
            let config = self.new_config(pid.to_string(), factory_pid, Properties::new());
            configs.insert(pid.to_string(), config.clone());
            config
        };
        self.announce_created(config)
    }

    /// Existing configuration without creating one
    pub fn find(&self, pid: &str) -> Option<Configuration> {
        self.shared.configs.read().get(pid).cloned()
    }

    pub fn contains(&self, pid: &str) -> bool {
        self.shared.configs.read().contains_key(pid)
    }

    pub fn len(&self) -> usize {
        self.shared.configs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.configs.read().is_empty()
    }

    /// Configurations whose PID matches `filter`, ordered by PID
    pub fn list(&self, filter: &str) -> Vec<Configuration> {
        self.shared
            .configs
            .read()
            .iter()
            .filter(|(pid, _)| pid_matches(filter, pid))
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Delete a configuration
    ///
    /// The deleted flag flips and DELETED fires (with the final properties
    /// as `old_properties`) before the persisted file is removed.
    pub fn delete(&self, pid: &str) -> Result<()> {
        AdminShared::delete(&self.shared, pid)
    }

    /// Create a factory instance `factory_pid~name`
    ///
    /// A unique name is generated when `instance_name` is `None`.
    pub fn create_factory(
        &self,
        factory_pid: &str,
        instance_name: Option<&str>,
    ) -> Result<Configuration> {
        validate_plain_pid(factory_pid)?;
        let name = match instance_name {
            Some(name) if name.is_empty() || name.contains(FACTORY_SEPARATOR) => {
                return Err(CdmfError::invalid(format!(
                    "invalid factory instance name {:?}",
                    name
                )))
            }
            Some(name) => name.to_string(),
            None => Uuid::new_v4().simple().to_string(),
        };
        let pid = factory_instance_pid(factory_pid, &name);

        let config = {
            let mut configs = self.shared.configs.write();
            if configs.contains_key(&pid) {
                return Err(CdmfError::Duplicate(format!("configuration {}", pid)));
            }
            let config =
                self.new_config(pid.clone(), Some(factory_pid.to_string()), Properties::new());
            configs.insert(pid, config.clone());
            config
        };
        self.announce_created(config)
    }

    /// Every instance of a factory, ordered by PID
    pub fn list_factory(&self, factory_pid: &str) -> Vec<Configuration> {
        self.shared
            .configs
            .read()
            .values()
            .filter(|c| c.factory_pid() == Some(factory_pid))
            .cloned()
            .collect()
    }

    /// Listen to events of every configuration
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConfigurationEvent) + Send + Sync + 'static,
    {
        self.add_listener_for("", listener)
    }

    /// Listen to events of configurations whose PID matches `filter`
    pub fn add_listener_for<F>(&self, filter: &str, listener: F) -> ListenerId
    where
        F: Fn(&ConfigurationEvent) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.write().push(ListenerEntry {
            id,
            filter: filter.to_string(),
            listener: Arc::new(listener),
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Load one configuration file
    ///
    /// A new PID fires CREATED, a known one UPDATED. Loading never writes
    /// back to storage.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<Configuration> {
        let record = read_record(path.as_ref())?;
        validate_pid(&record.pid)?;
        let derived = split_pid(&record.pid).map(|(factory, _)| factory.to_string());
        if record.factory_pid.is_some() && record.factory_pid != derived {
            return Err(CdmfError::invalid(format!(
                "factoryPid {:?} does not match pid {}",
                record.factory_pid, record.pid
            )));
        }

        let (config, created) = {
            let mut configs = self.shared.configs.write();
            match configs.get(&record.pid) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let config =
                        self.new_config(record.pid.clone(), derived, record.properties.clone());
                    configs.insert(record.pid.clone(), config.clone());
                    (config, true)
                }
            }
        };

        let ordered = config.mutation_guard();
        let event = if created {
            config.event(
                ConfigurationEventType::Created,
                config.version(),
                Properties::new(),
                config.properties(),
            )
        } else {
            let (old, version) = config.replace_silently(record.properties)?;
            config.event(
                ConfigurationEventType::Updated,
                version,
                old,
                config.properties(),
            )
        };
        self.shared.fire(&event);
        drop(ordered);
        debug!("Loaded configuration {} from {:?}", config.pid(), path.as_ref());
        Ok(config)
    }

    /// Load every `*.json` file in a directory
    ///
    /// Unreadable or malformed files are skipped with a warning. A missing
    /// directory loads nothing.
    pub fn load_from_directory<P: AsRef<Path>>(&self, dir: P) -> Result<usize> {
        let dir = dir.as_ref();
        if !dir.exists() {
            debug!("Configuration directory {:?} does not exist", dir);
            return Ok(0);
        }
        let mut loaded = 0;
        for file in json_files(dir)? {
            match self.load_from_file(&file) {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Skipping configuration file {:?}: {}", file, e),
            }
        }
        info!("Loaded {} configurations from {:?}", loaded, dir);
        Ok(loaded)
    }

    /// Save one configuration to an explicit path
    pub fn save_to_file<P: AsRef<Path>>(&self, pid: &str, path: P) -> Result<()> {
        let config = self
            .find(pid)
            .ok_or_else(|| CdmfError::not_found(format!("configuration {}", pid)))?;
        write_record(path.as_ref(), &config.to_record())
    }

    /// Save every configuration as `{dir}/{pid}.json`
    pub fn save_to_directory<P: AsRef<Path>>(&self, dir: P) -> Result<usize> {
        let configs = self.list("");
        for config in &configs {
            let path = persistence::file_for(dir.as_ref(), config.pid())?;
            write_record(&path, &config.to_record())?;
        }
        Ok(configs.len())
    }

    fn new_config(
        &self,
        pid: String,
        factory_pid: Option<String>,
        properties: Properties,
    ) -> Configuration {
        Configuration::new(pid, factory_pid, properties, Arc::downgrade(&self.shared))
    }

    fn announce_created(&self, config: Configuration) -> Result<Configuration> {
        let _ordered = config.mutation_guard();
        let persisted = self.shared.persist(&config);
        let event = config.event(
            ConfigurationEventType::Created,
            config.version(),
            Properties::new(),
            config.properties(),
        );
        self.shared.fire(&event);
        debug!("Created configuration {}", config.pid());
        persisted.map(|_| config.clone())
    }
}

impl Default for ConfigurationAdmin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(admin: &ConfigurationAdmin) -> Arc<Mutex<Vec<(ConfigurationEventType, String)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        admin.add_listener(move |e| sink.lock().unwrap().push((e.event_type, e.pid.clone())));
        events
    }

    #[test]
    fn test_create_is_duplicate_fail() {
        let admin = ConfigurationAdmin::new();
        admin.create("com.example.db").unwrap();
        let err = admin.create("com.example.db").unwrap_err();
        assert!(matches!(err, CdmfError::Duplicate(_)));
        assert!(matches!(admin.create(""), Err(CdmfError::InvalidArgument(_))));
        assert!(matches!(admin.create("a~b"), Err(CdmfError::InvalidArgument(_))));
    }

    #[test]
    fn test_get_is_idempotent() {
        let admin = ConfigurationAdmin::new();
        let events = recorder(&admin);
        let first = admin.get("svc").unwrap();
        first.set("k", 1).unwrap();
        let second = admin.get("svc").unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(first.properties(), second.properties());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                (ConfigurationEventType::Created, "svc".to_string()),
                (ConfigurationEventType::Updated, "svc".to_string()),
            ]
        );
    }

    #[test]
    fn test_factory_instances() {
        let admin = ConfigurationAdmin::new();
        let primary = admin.create_factory("factory.db", Some("primary")).unwrap();
        assert_eq!(primary.pid(), "factory.db~primary");
        assert_eq!(primary.factory_pid(), Some("factory.db"));
        let generated = admin.create_factory("factory.db", None).unwrap();
        assert_eq!(split_pid(generated.pid()).map(|(f, _)| f), Some("factory.db"));

        let pids: Vec<String> = admin
            .list_factory("factory.db")
            .iter()
            .map(|c| c.pid().to_string())
            .collect();
        assert_eq!(pids.len(), 2);
        assert!(pids.contains(&"factory.db~primary".to_string()));
        assert!(admin.create_factory("factory.db", Some("primary")).is_err());
        assert!(admin.create_factory("factory.db", Some("a~b")).is_err());
    }

    #[test]
    fn test_list_filter() {
        let admin = ConfigurationAdmin::new();
        for pid in ["com.example.a", "com.example.b", "org.other"] {
            admin.create(pid).unwrap();
        }
        assert_eq!(admin.list("").len(), 3);
        assert_eq!(admin.list("com.example.*").len(), 2);
        assert_eq!(admin.list("other").len(), 1);
    }

    #[test]
    fn test_non_finite_doubles_rejected() {
        let admin = ConfigurationAdmin::new();
        let events = recorder(&admin);
        let config = admin.create("sensor").unwrap();
        config.set("gain", 1.5).unwrap();
        let version = config.version();

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                config.set("gain", bad),
                Err(CdmfError::InvalidArgument(_))
            ));
            assert!(matches!(
                config.update(Properties::new().with("ok", 1i64).with("gain", bad)),
                Err(CdmfError::InvalidArgument(_))
            ));
        }

        assert_eq!(config.version(), version);
        assert_eq!(config.get("gain").and_then(|v| v.as_double()), Some(1.5));
        assert!(config.get("ok").is_none());
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_delete_semantics() {
        let admin = ConfigurationAdmin::new();
        let deleted = Arc::new(Mutex::new(None));
        let sink = deleted.clone();
        admin.add_listener(move |e| {
            if e.event_type == ConfigurationEventType::Deleted {
                *sink.lock().unwrap() = Some(e.old_properties.clone());
            }
        });

        let config = admin.create("gone").unwrap();
        config.set("last", "value").unwrap();
        config.delete().unwrap();

        assert!(config.is_deleted());
        assert!(matches!(config.set("x", 1), Err(CdmfError::Deleted(_))));
        assert_eq!(config.properties().get_string("last").as_deref(), Some("value"));
        assert_eq!(
            deleted.lock().unwrap().as_ref().and_then(|p| p.get_string("last")),
            Some("value".to_string())
        );
        assert!(admin.find("gone").is_none());
        assert!(matches!(admin.delete("gone"), Err(CdmfError::NotFound(_))));
    }

    #[test]
    fn test_listener_panic_does_not_block_others() {
        let admin = ConfigurationAdmin::new();
        admin.add_listener(|_| panic!("bad listener"));
        let events = recorder(&admin);
        admin.create("p").unwrap().set("a", true).unwrap();
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_listener_may_call_back_into_admin() {
        let admin = ConfigurationAdmin::new();
        let inner = admin.clone();
        admin.add_listener_for("source", move |e| {
            if e.event_type == ConfigurationEventType::Updated {
                let mirror = inner.get("mirror").unwrap();
                mirror.update(e.new_properties.clone()).unwrap();
                assert_eq!(inner.get("source").unwrap().properties(), e.new_properties);
            }
        });
        admin.get("source").unwrap().set("x", 5).unwrap();
        assert_eq!(admin.get("mirror").unwrap().properties().get_int("x"), Some(5));
    }

    #[test]
    fn test_remove_listener() {
        let admin = ConfigurationAdmin::new();
        let events = Arc::new(Mutex::new(0));
        let sink = events.clone();
        let id = admin.add_listener(move |_| *sink.lock().unwrap() += 1);
        admin.create("a").unwrap();
        assert!(admin.remove_listener(id));
        admin.create("b").unwrap();
        assert_eq!(*events.lock().unwrap(), 1);
    }

    #[test]
    fn test_save_load_save_identical() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");

        let admin = ConfigurationAdmin::new();
        admin
            .create("svc")
            .unwrap()
            .update(
                Properties::new()
                    .with("name", "svc")
                    .with("ratio", 0.25)
                    .with("count", 3)
                    .with("on", true)
                    .with("tags", vec!["a", "b"]),
            )
            .unwrap();
        admin
            .create_factory("factory.db", Some("primary"))
            .unwrap()
            .set("port", 5432)
            .unwrap();
        assert_eq!(admin.save_to_directory(&first).unwrap(), 2);

        let reloaded = ConfigurationAdmin::new();
        assert_eq!(reloaded.load_from_directory(&first).unwrap(), 2);
        reloaded.save_to_directory(&second).unwrap();

        for name in ["svc.json", "factory.db~primary.json"] {
            assert_eq!(
                std::fs::read(first.join(name)).unwrap(),
                std::fs::read(second.join(name)).unwrap()
            );
        }
        assert_eq!(
            reloaded.find("factory.db~primary").unwrap().factory_pid(),
            Some("factory.db")
        );
    }

    #[test]
    fn test_write_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let admin = ConfigurationAdmin::with_storage(dir.path()).unwrap();
        let config = admin.create("persisted").unwrap();
        config.set("k", "v").unwrap();
        let file = dir.path().join("persisted.json");
        assert!(file.exists());

        let restored = ConfigurationAdmin::with_storage(dir.path()).unwrap();
        assert_eq!(
            restored.find("persisted").unwrap().properties().get_string("k").as_deref(),
            Some("v")
        );

        config.delete().unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_load_directory_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), r#"{"pid":"good","properties":{}}"#).unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let admin = ConfigurationAdmin::new();
        assert_eq!(admin.load_from_directory(dir.path()).unwrap(), 1);
        assert!(admin.contains("good"));
        assert_eq!(admin.load_from_directory(dir.path().join("missing")).unwrap(), 0);
    }
}
