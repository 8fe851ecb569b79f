//! Module discovery
//!
//! Scans module directories and locates module artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::manifest::{ModuleManifest, MANIFEST_FILE};
use crate::error::{CdmfError, Result};

/// Discovered module information
#[derive(Debug, Clone)]
pub struct DiscoveredModule {
    /// Module directory path
    pub directory: PathBuf,
    /// Module manifest
    pub manifest: ModuleManifest,
    /// Path to the module library
    pub library_path: PathBuf,
}

/// Module discovery scanner
pub struct ModuleDiscovery {
    /// Base directory to scan for modules
    modules_dir: PathBuf,
}

impl ModuleDiscovery {
    pub fn new<P: AsRef<Path>>(modules_dir: P) -> Self {
        Self {
            modules_dir: modules_dir.as_ref().to_path_buf(),
        }
    }

    /// Discover every module directory under the modules directory
    ///
    /// Directories without a manifest are skipped; broken manifests are
    /// logged and skipped. Results are sorted by module name.
    pub fn discover_modules(&self) -> Result<Vec<DiscoveredModule>> {
        info!("Discovering modules in {:?}", self.modules_dir);

        if !self.modules_dir.exists() {
            debug!("Modules directory {:?} does not exist", self.modules_dir);
            return Ok(Vec::new());
        }

        let mut modules = Vec::new();
        for entry in fs::read_dir(&self.modules_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if !path.join(MANIFEST_FILE).exists() {
                debug!("No {} found in {:?}, skipping", MANIFEST_FILE, path);
                continue;
            }
            match locate(&path) {
                Ok(module) => modules.push(module),
                Err(e) => warn!("Skipping module in {:?}: {}", path, e),
            }
        }

        modules.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
        info!("Discovered {} modules", modules.len());
        Ok(modules)
    }

    /// Discover a specific module by directory name
    pub fn discover_module(&self, module_name: &str) -> Result<DiscoveredModule> {
        locate(&self.modules_dir.join(module_name))
    }
}

/// Resolve an install location to its manifest and library
///
/// `path` may be a module directory, its `module.toml`, or the library file
/// itself when a `module.toml` sits next to it.
pub fn locate(path: &Path) -> Result<DiscoveredModule> {
    let (directory, explicit_library) = if path.is_dir() {
        (path.to_path_buf(), None)
    } else if path.is_file() {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if path.file_name().map_or(false, |n| n == MANIFEST_FILE) {
            (parent, None)
        } else {
            (parent, Some(path.to_path_buf()))
        }
    } else {
        return Err(CdmfError::not_found(format!(
            "module location {}",
            path.display()
        )));
    };

    let manifest_path = directory.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(CdmfError::not_found(format!(
            "{} in {}",
            MANIFEST_FILE,
            directory.display()
        )));
    }
    let manifest = ModuleManifest::from_file(&manifest_path)?;

    let library_path = match explicit_library {
        Some(library) => library,
        None => directory.join(library_file_name(&manifest)),
    };
    if !library_path.is_file() {
        return Err(CdmfError::ArtifactLoad(format!(
            "library {} for module {} not found",
            library_path.display(),
            manifest.name
        )));
    }

    Ok(DiscoveredModule {
        directory,
        manifest,
        library_path,
    })
}

/// Library named by the manifest, or the platform default for its name
pub fn library_file_name(manifest: &ModuleManifest) -> PathBuf {
    match &manifest.library {
        Some(library) => PathBuf::from(library),
        None => PathBuf::from(libloading::library_filename(manifest.name.replace(['.', '-'], "_"))),
    }
}
