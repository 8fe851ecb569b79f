//! Module manifest parsing and validation
//!
//! Handles parsing `module.toml` manifests and validating module metadata:
//!
//! ```toml
//! name = "com.example.logger"
//! version = "1.2.0"
//! library = "liblogger.so"
//! description = "Console logger"
//!
//! [[provides]]
//! interface = "ILogger"
//! version = "1.2.0"
//!
//! [[dependencies]]
//! interface = "IClock"
//! version = "[1.0,2.0)"
//! filter = "(precision=ms)"
//! optional = false
//!
//! permissions = ["FILE_WRITE:/var/log/*"]
//!
//! [properties]
//! "log.level" = "info"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::version::{Version, VersionRange};
use crate::error::{CdmfError, Result};
use crate::properties::Properties;
use crate::security::Permission;
use crate::service::Filter;

/// Manifest file name inside a module directory
pub const MANIFEST_FILE: &str = "module.toml";

/// Largest accepted manifest
const MAX_MANIFEST_SIZE: usize = 64 * 1024;

/// An interface the module publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidedInterface {
    pub interface: String,
    /// Defaults to the module version
    #[serde(default)]
    pub version: Option<String>,
}

/// A declared dependency on an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub interface: String,
    /// Version range, `*` when absent
    #[serde(default)]
    pub version: Option<String>,
    /// LDAP-style filter over the providing service's properties
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

/// Module manifest (`module.toml` structure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Symbolic name (unique per framework)
    pub name: String,
    pub version: String,
    /// Dynamic library file, relative to the manifest; platform default when absent
    #[serde(default)]
    pub library: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub provides: Vec<ProvidedInterface>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Requested permissions, `TYPE:TARGET:ACTION`
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub properties: Properties,
}

/// Dependency after parsing its range and filter
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub interface: String,
    pub range: VersionRange,
    pub filter: Filter,
    pub optional: bool,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.interface, self.range)?;
        if self.filter != Filter::MatchAll {
            write!(f, " {}", self.filter)?;
        }
        if self.optional {
            f.write_str(" (optional)")?;
        }
        Ok(())
    }
}

impl ModuleManifest {
    /// Minimal manifest, for modules installed from in-process activators
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            library: None,
            description: None,
            author: None,
            provides: Vec::new(),
            dependencies: Vec::new(),
            permissions: Vec::new(),
            properties: Properties::new(),
        }
    }

    /// Builder: declare a provided interface at the module version
    pub fn provides(mut self, interface: impl Into<String>) -> Self {
        self.provides.push(ProvidedInterface {
            interface: interface.into(),
            version: None,
        });
        self
    }

    /// Builder: declare a mandatory dependency
    pub fn requires(mut self, interface: impl Into<String>, range: impl Into<String>) -> Self {
        self.dependencies.push(DependencySpec {
            interface: interface.into(),
            version: Some(range.into()),
            filter: None,
            optional: false,
        });
        self
    }

    /// Builder: request a permission
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    /// Load and validate a manifest file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        if contents.len() > MAX_MANIFEST_SIZE {
            return Err(CdmfError::invalid(format!(
                "manifest {:?} exceeds {} bytes",
                path.as_ref(),
                MAX_MANIFEST_SIZE
            )));
        }
        Self::parse(&contents)
    }

    /// Parse and validate manifest text
    pub fn parse(contents: &str) -> Result<Self> {
        let manifest: ModuleManifest = toml::from_str(contents)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check every field, reporting all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !is_valid_name(&self.name) {
            errors.push(format!(
                "invalid module name {:?} (alphanumeric with '.', '-' or '_')",
                self.name
            ));
        }
        if let Err(e) = self.version.parse::<Version>() {
            errors.push(e.to_string());
        }
        if let Some(library) = &self.library {
            if library.trim().is_empty() {
                errors.push("library must not be empty when set".to_string());
            }
        }
        for provided in &self.provides {
            if provided.interface.trim().is_empty() {
                errors.push("provided interface must not be empty".to_string());
            }
            if let Some(version) = &provided.version {
                if let Err(e) = version.parse::<Version>() {
                    errors.push(format!("provides {}: {}", provided.interface, e));
                }
            }
        }
        for dep in &self.dependencies {
            if dep.interface.trim().is_empty() {
                errors.push("dependency interface must not be empty".to_string());
            }
            if let Some(range) = &dep.version {
                if let Err(e) = range.parse::<VersionRange>() {
                    errors.push(format!("dependency {}: {}", dep.interface, e));
                }
            }
            if let Some(filter) = &dep.filter {
                if let Err(e) = Filter::parse(filter) {
                    errors.push(format!("dependency {}: {}", dep.interface, e));
                }
            }
        }
        for permission in &self.permissions {
            if let Err(e) = permission.parse::<Permission>() {
                errors.push(format!("permission {:?}: {}", permission, e));
            }
        }

        if errors.is_empty() {
            debug!("Manifest validation passed for module: {}", self.name);
            Ok(())
        } else {
            Err(CdmfError::invalid(format!(
                "manifest for {:?} is invalid: {}",
                self.name,
                errors.join("; ")
            )))
        }
    }

    pub fn parsed_version(&self) -> Result<Version> {
        self.version.parse()
    }

    /// Provided interfaces with their effective versions
    pub fn provided(&self) -> Result<Vec<(String, Version)>> {
        let module_version = self.parsed_version()?;
        self.provides
            .iter()
            .map(|p| {
                let version = match &p.version {
                    Some(v) => v.parse()?,
                    None => module_version,
                };
                Ok((p.interface.clone(), version))
            })
            .collect()
    }

    /// Parsed dependencies
    pub fn parsed_dependencies(&self) -> Result<Vec<Dependency>> {
        self.dependencies
            .iter()
            .map(|d| {
                Ok(Dependency {
                    interface: d.interface.clone(),
                    range: d.version.as_deref().unwrap_or("*").parse()?,
                    filter: Filter::parse(d.filter.as_deref().unwrap_or(""))?,
                    optional: d.optional,
                })
            })
            .collect()
    }

    /// Parsed permission requests
    pub fn parsed_permissions(&self) -> Result<Vec<Permission>> {
        self.permissions.iter().map(|p| p.parse()).collect()
    }
}

#[inline]
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 128 {
        return false;
    }
    if !name.chars().next().map_or(false, |c| c.is_alphanumeric()) {
        return false;
    }
    name.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "com.example.logger"
version = "1.2.0"
library = "liblogger.so"
description = "Console logger"
permissions = ["FILE_WRITE:/var/log/*"]

[[provides]]
interface = "ILogger"

[[provides]]
interface = "ILegacyLogger"
version = "0.9"

[[dependencies]]
interface = "IClock"
version = "[1.0,2.0)"
filter = "(precision=ms)"

[[dependencies]]
interface = "IMetrics"
optional = true

[properties]
"log.level" = "info"
"#;

    #[test]
    fn test_parse_sample() {
        let manifest = ModuleManifest::parse(SAMPLE).unwrap();
        assert_eq!(manifest.name, "com.example.logger");
        assert_eq!(
            manifest.provided().unwrap(),
            vec![
                ("ILogger".to_string(), Version::new(1, 2, 0)),
                ("ILegacyLogger".to_string(), Version::new(0, 9, 0)),
            ]
        );
        let deps = manifest.parsed_dependencies().unwrap();
        assert_eq!(deps.len(), 2);
        assert!(deps[0].range.includes(&Version::new(1, 5, 0)));
        assert!(deps[1].optional && deps[1].range.is_any());
        assert_eq!(manifest.properties.get_string("log.level").as_deref(), Some("info"));
        assert_eq!(manifest.parsed_permissions().unwrap().len(), 1);
    }

    #[test]
    fn test_validation_collects_errors() {
        let err = ModuleManifest::parse(
            r#"
name = "-bad name"
version = "one"
permissions = ["NOPE"]

[[dependencies]]
interface = "X"
filter = "(broken"
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("invalid module name"));
        assert!(msg.contains("invalid version"));
        assert!(msg.contains("NOPE"));
        assert!(msg.contains("dependency X"));
    }

    #[test]
    fn test_missing_required_field() {
        assert!(matches!(
            ModuleManifest::parse("name = \"a\""),
            Err(CdmfError::Serialization(_))
        ));
    }

    #[test]
    fn test_builder() {
        let manifest = ModuleManifest::new("clock", "1.0.0")
            .provides("IClock")
            .requires("ITime", "[1.0,2.0)")
            .permission("ADMIN");
        manifest.validate().unwrap();
        assert_eq!(manifest.parsed_dependencies().unwrap()[0].interface, "ITime");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(ModuleManifest::from_file(&path).unwrap().version, "1.2.0");
    }
}
