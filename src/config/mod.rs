//! Framework configuration
//!
//! Loaded from TOML or JSON, then adjusted by `CDMF_*` environment
//! variables. Every section has working defaults so an empty file is a
//! valid configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::properties::Properties;
use crate::security::Permission;
use crate::utils::{env_bool, env_int, env_opt};

/// Module loading and lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Directory scanned for module directories (each with a `module.toml`)
    #[serde(default = "default_modules_dir")]
    pub modules_dir: PathBuf,

    /// Install and start every discovered module on framework start
    #[serde(default)]
    pub auto_start: bool,

    /// Upper bound for an activator's `start`
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Upper bound for an activator's `stop`
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_modules_dir() -> PathBuf {
    PathBuf::from("modules")
}

fn default_start_timeout_ms() -> u64 {
    30_000
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            modules_dir: default_modules_dir(),
            auto_start: false,
            start_timeout_ms: default_start_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

/// Permission and verification policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub enforce_permissions: bool,

    /// Only load artifacts that verify against a trusted signer
    #[serde(default)]
    pub require_signature: bool,

    /// Permission file loaded at start (`[module]` sections)
    #[serde(default)]
    pub permissions_file: Option<PathBuf>,

    /// Trusted signer file (`name|email|keypath|fingerprint|enabled`)
    #[serde(default)]
    pub trusted_signers_file: Option<PathBuf>,

    /// Granted to every module on install, `TYPE:TARGET:ACTION`
    #[serde(default = "default_permissions")]
    pub default_permissions: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_permissions() -> Vec<String> {
    [
        "SERVICE_GET:*:GRANT",
        "SERVICE_REGISTER:*:GRANT",
        "EVENT_PUBLISH:*:GRANT",
        "EVENT_SUBSCRIBE:*:GRANT",
        "PROPERTY_READ:*:GRANT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enforce_permissions: true,
            require_signature: false,
            permissions_file: None,
            trusted_signers_file: None,
            default_permissions: default_permissions(),
        }
    }
}

/// Resource accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Limit file (`[module]` sections, `TYPE:SOFT:HARD:ENABLED`)
    #[serde(default)]
    pub limits_file: Option<PathBuf>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limits_file: None,
        }
    }
}

/// Configuration admin storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigurationStoreConfig {
    /// When set, configurations are loaded from and written through to this directory
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_threads")]
    pub threads: usize,

    /// Bound on queued jobs; unbounded when absent
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: default_worker_threads(),
            queue_capacity: None,
        }
    }
}

/// Logging setup used by [`init_logging_from_config`](crate::utils::init_logging_from_config)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `cdmf::module=debug`
    #[serde(default)]
    pub filter: Option<String>,

    /// JSON output (needs the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Top-level framework configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkConfig {
    #[serde(default)]
    pub modules: ModulesConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub resources: ResourcesConfig,

    #[serde(default)]
    pub configuration: ConfigurationStoreConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Framework properties visible to modules through `get_property`
    #[serde(default)]
    pub properties: Properties,
}

impl FrameworkConfig {
    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: FrameworkConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: FrameworkConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load by extension (`.json`, otherwise TOML), apply env overrides, validate
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path)?,
            _ => Self::from_toml_file(path)?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay `CDMF_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_opt("CDMF_MODULES_DIR") {
            self.modules.modules_dir = PathBuf::from(dir);
        }
        if let Some(threads) = env_int::<usize>("CDMF_WORKER_THREADS") {
            self.workers.threads = threads;
        }
        if let Some(enforce) = env_bool("CDMF_ENFORCE_PERMISSIONS") {
            self.security.enforce_permissions = enforce;
        }
        if let Some(require) = env_bool("CDMF_REQUIRE_SIGNATURE") {
            self.security.require_signature = require;
        }
        if let Some(dir) = env_opt("CDMF_CONFIG_DIR") {
            self.configuration.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(filter) = env_opt("CDMF_LOG") {
            self.logging.filter = Some(filter);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers.threads == 0 {
            return Err(anyhow::anyhow!("workers.threads must be greater than 0"));
        }
        if self.workers.queue_capacity == Some(0) {
            return Err(anyhow::anyhow!(
                "workers.queue_capacity must be greater than 0 when set"
            ));
        }
        if self.modules.start_timeout_ms == 0 || self.modules.stop_timeout_ms == 0 {
            return Err(anyhow::anyhow!("module timeouts must be greater than 0"));
        }
        self.default_permissions()?;
        Ok(())
    }

    /// Parsed `security.default_permissions`
    pub fn default_permissions(&self) -> anyhow::Result<Vec<Permission>> {
        self.security
            .default_permissions
            .iter()
            .map(|s| {
                s.parse::<Permission>()
                    .with_context(|| format!("invalid default permission {:?}", s))
            })
            .collect()
    }
}
