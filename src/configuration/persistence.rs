//! JSON persistence for configurations
//!
//! One file per PID named `{pid}.json`:
//! ```json
//! {
//!   "factoryPid": "factory.db",
//!   "pid": "factory.db~primary",
//!   "properties": {
//!     "port": 5432
//!   }
//! }
//! ```
//! Keys are written in sorted order so that saving what was loaded yields the
//! same bytes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CdmfError, Result};
use crate::properties::Properties;

/// On-disk shape of one configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationRecord {
    #[serde(rename = "factoryPid", default, skip_serializing_if = "Option::is_none")]
    pub factory_pid: Option<String>,
    pub pid: String,
    pub properties: Properties,
}

impl ConfigurationRecord {
    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let record: ConfigurationRecord = serde_json::from_str(json)?;
        if record.pid.is_empty() {
            return Err(CdmfError::invalid("configuration file has an empty pid"));
        }
        Ok(record)
    }
}

/// `{dir}/{pid}.json`, rejecting PIDs that would escape `dir`
pub fn file_for(dir: &Path, pid: &str) -> Result<PathBuf> {
    if pid.is_empty() || pid.contains('/') || pid.contains('\\') || pid == "." || pid == ".." {
        return Err(CdmfError::invalid(format!(
            "PID {:?} cannot be used as a file name",
            pid
        )));
    }
    Ok(dir.join(format!("{}.json", pid)))
}

pub fn read_record(path: &Path) -> Result<ConfigurationRecord> {
    let contents = fs::read_to_string(path)?;
    ConfigurationRecord::from_json(&contents)
}

pub fn write_record(path: &Path, record: &ConfigurationRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, record.to_json()?)?;
    Ok(())
}

/// Remove a persisted file; a missing file is not an error
pub fn remove_record(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Every `*.json` file directly inside `dir`, sorted by name
pub fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
