//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use cdmf::event::Event;
use cdmf::{Framework, FrameworkConfig, ModuleActivator, ModuleContext};

type Hook = Box<dyn Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync>;

/// Activator assembled from closures; records its calls in a shared log
pub struct TestActivator {
    name: String,
    log: CallLog,
    on_start: Hook,
    on_stop: Hook,
}

impl TestActivator {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            on_start: Box::new(|_| Ok(())),
            on_stop: Box::new(|_| Ok(())),
        }
    }

    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_start = Box::new(f);
        self
    }

    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: Fn(&ModuleContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_stop = Box::new(f);
        self
    }

    pub fn shared(self) -> Arc<dyn ModuleActivator> {
        Arc::new(self)
    }
}

impl ModuleActivator for TestActivator {
    fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
        self.log.push(format!("start:{}", self.name));
        (self.on_start)(context)
    }

    fn stop(&self, context: &ModuleContext) -> anyhow::Result<()> {
        self.log.push(format!("stop:{}", self.name));
        (self.on_stop)(context)
    }
}

/// Ordered record of activator calls and observed events
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Framework with a small pool and short timeouts
pub fn test_framework() -> Framework {
    test_framework_with(|_| {})
}

pub fn test_framework_with<F: FnOnce(&mut FrameworkConfig)>(adjust: F) -> Framework {
    let mut config = FrameworkConfig::default();
    config.workers.threads = 2;
    config.modules.start_timeout_ms = 2_000;
    config.modules.stop_timeout_ms = 2_000;
    adjust(&mut config);
    Framework::new(config).unwrap()
}

/// Record every event on `pattern` as `topic` or `topic:module.name`
pub fn record_events(framework: &Framework, pattern: &str, log: &CallLog) {
    let log = log.clone();
    framework
        .events()
        .subscribe("test-observer", pattern, move |event: &Event| {
            match event.properties.get_string("module.name") {
                Some(name) => log.push(format!("{}:{}", event.topic, name)),
                None => log.push(event.topic.clone()),
            }
        })
        .unwrap();
}

/// Poll until `condition` holds or `timeout` elapses
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Module directory fixture on disk
pub struct ModuleDirFixture {
    pub temp_dir: TempDir,
    pub modules_dir: PathBuf,
}

impl ModuleDirFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let modules_dir = temp_dir.path().join("modules");
        std::fs::create_dir_all(&modules_dir).unwrap();
        Self {
            temp_dir,
            modules_dir,
        }
    }

    /// Write `module.toml` plus a library file with the given bytes
    pub fn create_module(&self, name: &str, version: &str, library_bytes: &[u8]) -> PathBuf {
        let dir = self.modules_dir.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = format!(
            "name = \"{}\"\nversion = \"{}\"\nlibrary = \"lib{}.so\"\n",
            name, version, name
        );
        std::fs::write(dir.join("module.toml"), manifest).unwrap();
        std::fs::write(dir.join(format!("lib{}.so", name)), library_bytes).unwrap();
        dir
    }

    pub fn library_path(&self, name: &str) -> PathBuf {
        self.modules_dir.join(name).join(format!("lib{}.so", name))
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}
