//! Per-module permission store
//!
//! Keyed by module identity. Reads take a shared lock, grants and revokes an
//! exclusive one. The store is an explicit dependency of the framework rather
//! than a process global, so independent framework instances (and tests) keep
//! independent policy.
//!
//! Permission file format:
//! ```text
//! # comment
//! [module.id]
//! SERVICE_GET:com.example.*:GRANT
//! FILE_WRITE:/etc/*:DENY
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::permissions::{Permission, PermissionAction, PermissionCollection, PermissionType};
use crate::error::{CdmfError, Result};

/// Identity used for operations performed by the host itself
pub const SYSTEM_PRINCIPAL: &str = "system";

/// Permission store for all modules of one framework instance
pub struct PermissionManager {
    modules: RwLock<BTreeMap<String, PermissionCollection>>,
    defaults: RwLock<Vec<Permission>>,
    enforcing: AtomicBool,
}

impl PermissionManager {
    /// Create an empty, enforcing store
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(BTreeMap::new()),
            defaults: RwLock::new(Vec::new()),
            enforcing: AtomicBool::new(true),
        }
    }

    /// Turn enforcement on or off; when off every check passes
    pub fn set_enforcing(&self, enforcing: bool) {
        self.enforcing.store(enforcing, Ordering::SeqCst);
    }

    pub fn is_enforcing(&self) -> bool {
        self.enforcing.load(Ordering::SeqCst)
    }

    /// Add a permission to a module
    ///
    /// A permission whose action is `REVOKE` removes the GRANT with the same
    /// type and target instead of being stored. Returns whether the store changed.
    pub fn grant(&self, module_id: &str, permission: Permission) -> Result<bool> {
        ensure_module_id(module_id)?;
        let mut modules = self.modules.write();
        let collection = modules.entry(module_id.to_string()).or_default();

        if permission.action() == PermissionAction::Revoke {
            let target = Permission::grant(permission.permission_type(), permission.target());
            let removed = collection.remove(&target);
            debug!("Revoke {} from {}: removed={}", target, module_id, removed);
            return Ok(removed);
        }

        let added = collection.add(permission.clone());
        if added {
            debug!("Granted {} to {}", permission, module_id);
        }
        Ok(added)
    }

    /// Grant several permissions at once
    pub fn grant_all<I>(&self, module_id: &str, permissions: I) -> Result<usize>
    where
        I: IntoIterator<Item = Permission>,
    {
        let mut changed = 0;
        for p in permissions {
            if self.grant(module_id, p)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Remove an identical permission entry
    pub fn revoke(&self, module_id: &str, permission: &Permission) -> Result<bool> {
        ensure_module_id(module_id)?;
        let mut modules = self.modules.write();
        let removed = modules
            .get_mut(module_id)
            .map(|c| c.remove(permission))
            .unwrap_or(false);
        if removed {
            debug!("Revoked {} from {}", permission, module_id);
        }
        Ok(removed)
    }

    /// Whether the module holds exactly this permission entry
    pub fn has(&self, module_id: &str, permission: &Permission) -> bool {
        self.modules
            .read()
            .get(module_id)
            .map(|c| c.contains(permission))
            .unwrap_or(false)
    }

    /// Decide a probe for a module
    #[inline]
    pub fn check(&self, module_id: &str, permission_type: PermissionType, target: &str) -> bool {
        if !self.is_enforcing() {
            return true;
        }
        let allowed = self
            .modules
            .read()
            .get(module_id)
            .map(|c| c.implies(permission_type, target))
            .unwrap_or(false);
        if !allowed {
            warn!(
                "Module {} denied {} on {}",
                module_id, permission_type, target
            );
        }
        allowed
    }

    /// [`check`](Self::check) as a `Result`
    pub fn require(
        &self,
        module_id: &str,
        permission_type: PermissionType,
        target: &str,
    ) -> Result<()> {
        if self.check(module_id, permission_type, target) {
            Ok(())
        } else {
            Err(CdmfError::denied(format!(
                "module {} lacks {} on {}",
                module_id, permission_type, target
            )))
        }
    }

    /// All permissions of a module, in insertion order
    pub fn get_all(&self, module_id: &str) -> Vec<Permission> {
        self.modules
            .read()
            .get(module_id)
            .map(|c| c.to_vec())
            .unwrap_or_default()
    }

    /// Permissions of one type held by a module
    pub fn get_by_type(&self, module_id: &str, permission_type: PermissionType) -> Vec<Permission> {
        self.modules
            .read()
            .get(module_id)
            .map(|c| c.by_type(permission_type))
            .unwrap_or_default()
    }

    /// Drop every permission of a module
    pub fn clear(&self, module_id: &str) {
        if self.modules.write().remove(module_id).is_some() {
            debug!("Cleared permissions of {}", module_id);
        }
    }

    /// Module identities that have an entry in the store
    pub fn modules(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    /// Replace the default set applied on module install
    pub fn set_default_permissions(&self, permissions: Vec<Permission>) {
        *self.defaults.write() = permissions;
    }

    pub fn default_permissions(&self) -> Vec<Permission> {
        self.defaults.read().clone()
    }

    /// Grant the default set to a module
    pub fn apply_defaults(&self, module_id: &str) -> Result<usize> {
        let defaults = self.default_permissions();
        self.grant_all(module_id, defaults)
    }

    /// Load a permission file, merging into the store
    ///
    /// Malformed lines are skipped with a warning. Returns the number of
    /// entries applied.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let contents = fs::read_to_string(path.as_ref())?;
        let applied = self.load_from_str(&contents);
        info!(
            "Loaded {} permission entries from {:?}",
            applied,
            path.as_ref()
        );
        Ok(applied)
    }

    /// Parse permission file contents into the store
    pub fn load_from_str(&self, contents: &str) -> usize {
        let mut applied = 0;
        let mut section: Option<String> = None;

        for (index, raw) in contents.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = parse_section(line) {
                if name.is_empty() {
                    warn!("Line {}: empty section name, skipping section", line_no);
                    section = None;
                } else {
                    self.modules.write().entry(name.to_string()).or_default();
                    section = Some(name.to_string());
                }
                continue;
            }

            let Some(module_id) = section.as_deref() else {
                warn!("Line {}: entry outside of a [module] section: {}", line_no, line);
                continue;
            };

            match line.parse::<Permission>() {
                Ok(permission) => {
                    if self.grant(module_id, permission).unwrap_or(false) {
                        applied += 1;
                    }
                }
                Err(e) => warn!("Line {}: skipping malformed permission {:?}: {}", line_no, line, e),
            }
        }
        applied
    }

    /// Render the store in permission file format
    ///
    /// Sections are sorted by module identity; entries keep insertion order.
    pub fn to_config_string(&self) -> String {
        let modules = self.modules.read();
        let mut out = String::from("# CDMF module permissions\n");
        for (module_id, collection) in modules.iter() {
            out.push('\n');
            out.push_str(&format!("[{}]\n", module_id));
            for p in collection.iter() {
                out.push_str(&p.to_string());
                out.push('\n');
            }
        }
        out
    }

    /// Write the store to a permission file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path.as_ref(), self.to_config_string())?;
        debug!("Saved permissions to {:?}", path.as_ref());
        Ok(())
    }
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn parse_section(line: &str) -> Option<&str> {
    line.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::trim)
}

fn ensure_module_id(module_id: &str) -> Result<()> {
    if module_id.is_empty() {
        return Err(CdmfError::invalid("module id must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_wildcard_check() {
        let pm = PermissionManager::new();
        pm.grant("m1", "SERVICE_GET:com.example.*:GRANT".parse().unwrap())
            .unwrap();
        assert!(pm.check("m1", PermissionType::ServiceGet, "com.example.svc"));
        assert!(!pm.check("m1", PermissionType::ServiceGet, "org.other"));
        assert!(!pm.check("unknown", PermissionType::ServiceGet, "com.example.svc"));
    }

    #[test]
    fn test_deny_overrides_grant() {
        let pm = PermissionManager::new();
        pm.grant("m1", "SERVICE_GET:*:GRANT".parse().unwrap()).unwrap();
        pm.grant("m1", "SERVICE_GET:secret.svc:DENY".parse().unwrap())
            .unwrap();
        assert!(!pm.check("m1", PermissionType::ServiceGet, "secret.svc"));
        assert!(pm.check("m1", PermissionType::ServiceGet, "public.svc"));

        // A later GRANT for the same subject does not lift the DENY.
        pm.grant("m1", Permission::grant(PermissionType::ServiceGet, "secret.svc"))
            .unwrap();
        assert!(!pm.check("m1", PermissionType::ServiceGet, "secret.svc"));
    }

    #[test]
    fn test_empty_module_id_rejected() {
        let pm = PermissionManager::new();
        let err = pm
            .grant("", Permission::grant(PermissionType::Admin, "*"))
            .unwrap_err();
        assert!(matches!(err, CdmfError::InvalidArgument(_)));
    }

    #[test]
    fn test_revoke_action_removes_grant() {
        let pm = PermissionManager::new();
        pm.grant("m1", "FILE_READ:/tmp/*".parse().unwrap()).unwrap();
        assert!(pm.check("m1", PermissionType::FileRead, "/tmp/a"));
        assert!(pm.grant("m1", "FILE_READ:/tmp/*:REVOKE".parse().unwrap()).unwrap());
        assert!(!pm.check("m1", PermissionType::FileRead, "/tmp/a"));
        assert!(pm.get_all("m1").is_empty());
    }

    #[test]
    fn test_has_get_by_type_clear() {
        let pm = PermissionManager::new();
        let read = Permission::grant(PermissionType::PropertyRead, "*");
        let publish = Permission::grant(PermissionType::EventPublish, "a/*");
        pm.grant_all("m", vec![read.clone(), publish.clone()]).unwrap();

        assert!(pm.has("m", &read));
        assert_eq!(pm.get_by_type("m", PermissionType::EventPublish), vec![publish.clone()]);
        assert!(pm.revoke("m", &publish).unwrap());
        assert!(!pm.revoke("m", &publish).unwrap());
        pm.clear("m");
        assert!(pm.get_all("m").is_empty());
        assert!(pm.modules().is_empty());
    }

    #[test]
    fn test_not_enforcing_allows_all() {
        let pm = PermissionManager::new();
        pm.set_enforcing(false);
        assert!(pm.check("nobody", PermissionType::Admin, "*"));
        assert!(pm.require("nobody", PermissionType::FileWrite, "/").is_ok());
    }

    #[test]
    fn test_defaults() {
        let pm = PermissionManager::new();
        pm.set_default_permissions(vec![Permission::grant(PermissionType::ServiceGet, "*")]);
        assert_eq!(pm.apply_defaults("m").unwrap(), 1);
        assert!(pm.check("m", PermissionType::ServiceGet, "any"));
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let pm = PermissionManager::new();
        let applied = pm.load_from_str(
            "# header\n\
             SERVICE_GET:*:GRANT\n\
             [m1]\n\
             SERVICE_GET:com.example.*:GRANT\n\
             BOGUS:*:GRANT\n\
             \n\
             [m2]\n\
             ADMIN\n\
             FILE_WRITE:/etc/*:DENY\n",
        );
        assert_eq!(applied, 3);
        assert!(pm.check("m1", PermissionType::ServiceGet, "com.example.x"));
        assert!(pm.check("m2", PermissionType::FileRead, "/etc/passwd"));
        assert!(!pm.check("m2", PermissionType::FileWrite, "/etc/passwd"));
    }

    #[test]
    fn test_save_load_save_identical() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.perm");
        let second = dir.path().join("b.perm");

        let pm = PermissionManager::new();
        pm.grant("zeta", "IPC_SEND:shared-memory:GRANT".parse().unwrap())
            .unwrap();
        pm.grant("alpha", "SERVICE_GET:*:GRANT".parse().unwrap()).unwrap();
        pm.grant("alpha", "SERVICE_GET:secret:DENY".parse().unwrap())
            .unwrap();
        pm.grant("empty", Permission::grant(PermissionType::Admin, "*"))
            .unwrap();
        pm.clear("empty");
        pm.save_to_file(&first).unwrap();

        let reloaded = PermissionManager::new();
        reloaded.load_from_file(&first).unwrap();
        reloaded.save_to_file(&second).unwrap();

        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }
}
