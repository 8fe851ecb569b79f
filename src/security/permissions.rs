//! Declarative permissions
//!
//! A permission is an immutable `(type, target pattern, action)` triple. The
//! target pattern uses a small glob language: `*` matches any run of
//! characters (including none), `?` matches exactly one, everything else is
//! literal and case-sensitive.
//!
//! A [`PermissionCollection`] answers a probe `(type, target)` by scanning all
//! DENY entries first; only if none matches are GRANT entries consulted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CdmfError;

/// Kind of privileged operation a permission governs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionType {
    ServiceGet,
    ServiceRegister,
    ModuleLoad,
    ModuleUnload,
    ModuleExecute,
    FileRead,
    FileWrite,
    NetworkConnect,
    NetworkBind,
    IpcSend,
    IpcReceive,
    PropertyRead,
    PropertyWrite,
    EventPublish,
    EventSubscribe,
    /// Implies every other permission type
    Admin,
}

impl PermissionType {
    /// All sixteen permission types
    pub const ALL: [PermissionType; 16] = [
        PermissionType::ServiceGet,
        PermissionType::ServiceRegister,
        PermissionType::ModuleLoad,
        PermissionType::ModuleUnload,
        PermissionType::ModuleExecute,
        PermissionType::FileRead,
        PermissionType::FileWrite,
        PermissionType::NetworkConnect,
        PermissionType::NetworkBind,
        PermissionType::IpcSend,
        PermissionType::IpcReceive,
        PermissionType::PropertyRead,
        PermissionType::PropertyWrite,
        PermissionType::EventPublish,
        PermissionType::EventSubscribe,
        PermissionType::Admin,
    ];

    /// Canonical name used in permission files
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionType::ServiceGet => "SERVICE_GET",
            PermissionType::ServiceRegister => "SERVICE_REGISTER",
            PermissionType::ModuleLoad => "MODULE_LOAD",
            PermissionType::ModuleUnload => "MODULE_UNLOAD",
            PermissionType::ModuleExecute => "MODULE_EXECUTE",
            PermissionType::FileRead => "FILE_READ",
            PermissionType::FileWrite => "FILE_WRITE",
            PermissionType::NetworkConnect => "NETWORK_CONNECT",
            PermissionType::NetworkBind => "NETWORK_BIND",
            PermissionType::IpcSend => "IPC_SEND",
            PermissionType::IpcReceive => "IPC_RECEIVE",
            PermissionType::PropertyRead => "PROPERTY_READ",
            PermissionType::PropertyWrite => "PROPERTY_WRITE",
            PermissionType::EventPublish => "EVENT_PUBLISH",
            PermissionType::EventSubscribe => "EVENT_SUBSCRIBE",
            PermissionType::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for PermissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionType {
    type Err = CdmfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        PermissionType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| CdmfError::invalid(format!("unknown permission type: {}", s)))
    }
}

/// What a permission entry does with matching probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionAction {
    Grant,
    Deny,
    Revoke,
}

impl PermissionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionAction::Grant => "GRANT",
            PermissionAction::Deny => "DENY",
            PermissionAction::Revoke => "REVOKE",
        }
    }
}

impl fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionAction {
    type Err = CdmfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GRANT" => Ok(PermissionAction::Grant),
            "DENY" => Ok(PermissionAction::Deny),
            "REVOKE" => Ok(PermissionAction::Revoke),
            other => Err(CdmfError::invalid(format!(
                "unknown permission action: {}",
                other
            ))),
        }
    }
}

/// Immutable permission triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    permission_type: PermissionType,
    target: String,
    action: PermissionAction,
}

impl Permission {
    /// Create a permission; an empty target means `*`
    pub fn new(
        permission_type: PermissionType,
        target: impl Into<String>,
        action: PermissionAction,
    ) -> Self {
        let target = target.into();
        Self {
            permission_type,
            target: if target.is_empty() {
                "*".to_string()
            } else {
                target
            },
            action,
        }
    }

    /// GRANT permission for `target`
    pub fn grant(permission_type: PermissionType, target: impl Into<String>) -> Self {
        Self::new(permission_type, target, PermissionAction::Grant)
    }

    /// DENY permission for `target`
    pub fn deny(permission_type: PermissionType, target: impl Into<String>) -> Self {
        Self::new(permission_type, target, PermissionAction::Deny)
    }

    pub fn permission_type(&self) -> PermissionType {
        self.permission_type
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn action(&self) -> PermissionAction {
        self.action
    }

    /// Whether this permission's pattern matches `target`
    pub fn matches_target(&self, target: &str) -> bool {
        glob_match(&self.target, target)
    }

    /// Whether this permission implies the probe `(permission_type, target)`
    ///
    /// DENY never implies anything. ADMIN implies every type and target.
    pub fn implies(&self, permission_type: PermissionType, target: &str) -> bool {
        if self.action == PermissionAction::Deny {
            return false;
        }
        if self.permission_type == PermissionType::Admin {
            return true;
        }
        self.permission_type == permission_type && self.matches_target(target)
    }

    /// Same type and target pattern, ignoring the action
    pub fn same_subject(&self, other: &Permission) -> bool {
        self.permission_type == other.permission_type && self.target == other.target
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.permission_type, self.target, self.action)
    }
}

impl FromStr for Permission {
    type Err = CdmfError;

    /// Parse `TYPE[:TARGET[:ACTION]]`
    ///
    /// Targets may themselves contain `:`; the trailing segment is taken as the
    /// action only when it names one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CdmfError::invalid("empty permission string"));
        }

        let (type_str, rest) = match s.split_once(':') {
            Some((t, rest)) => (t, Some(rest)),
            None => (s, None),
        };
        let permission_type: PermissionType = type_str.parse()?;

        let (target, action) = match rest {
            None => ("*", PermissionAction::Grant),
            Some(rest) => match rest.rsplit_once(':') {
                Some((target, action)) => match action.parse::<PermissionAction>() {
                    Ok(action) => (target, action),
                    Err(_) => (rest, PermissionAction::Grant),
                },
                None => (rest, PermissionAction::Grant),
            },
        };

        Ok(Permission::new(permission_type, target, action))
    }
}

/// Match `text` against a glob `pattern` (`*` any run, `?` one character)
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    // Position of the last `*` seen and the text index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if let Some((star, start)) = backtrack {
            pi = star + 1;
            ti = start + 1;
            backtrack = Some((star, start + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// Ordered permissions owned by one module identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionCollection {
    permissions: Vec<Permission>,
}

impl PermissionCollection {
    /// Create a new empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection from a vector (duplicates are dropped)
    pub fn from_vec(permissions: Vec<Permission>) -> Self {
        let mut collection = Self::new();
        for p in permissions {
            collection.add(p);
        }
        collection
    }

    /// Add a permission; returns `false` if an identical entry exists
    pub fn add(&mut self, permission: Permission) -> bool {
        if self.permissions.contains(&permission) {
            return false;
        }
        self.permissions.push(permission);
        true
    }

    /// Remove an identical entry; returns whether one was removed
    pub fn remove(&mut self, permission: &Permission) -> bool {
        let before = self.permissions.len();
        self.permissions.retain(|p| p != permission);
        self.permissions.len() != before
    }

    /// Whether an identical entry exists
    pub fn contains(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Decide a probe: any matching DENY wins, else any implying GRANT, else denied
    pub fn implies(&self, permission_type: PermissionType, target: &str) -> bool {
        let denied = self.permissions.iter().any(|p| {
            p.action == PermissionAction::Deny
                && p.permission_type == permission_type
                && p.matches_target(target)
        });
        if denied {
            return false;
        }

        self.permissions
            .iter()
            .any(|p| p.action == PermissionAction::Grant && p.implies(permission_type, target))
    }

    /// Entries of one type
    pub fn by_type(&self, permission_type: PermissionType) -> Vec<Permission> {
        self.permissions
            .iter()
            .filter(|p| p.permission_type == permission_type)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    pub fn to_vec(&self) -> Vec<Permission> {
        self.permissions.clone()
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("com.example.*", "com.example.svc"));
        assert!(glob_match("com.example.*", "com.example."));
        assert!(!glob_match("com.example.*", "com.exampl"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*.svc", "x.y.svc"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
        assert!(!glob_match("ABC", "abc"));
        assert!(glob_match("**", "x"));
    }

    #[test]
    fn test_parse_defaults() {
        let p: Permission = "SERVICE_GET".parse().unwrap();
        assert_eq!(p, Permission::grant(PermissionType::ServiceGet, "*"));

        let p: Permission = "FILE_READ:/tmp/*".parse().unwrap();
        assert_eq!(p.target(), "/tmp/*");
        assert_eq!(p.action(), PermissionAction::Grant);

        let p: Permission = "network_connect:localhost:8080:DENY".parse().unwrap();
        assert_eq!(p.permission_type(), PermissionType::NetworkConnect);
        assert_eq!(p.target(), "localhost:8080");
        assert_eq!(p.action(), PermissionAction::Deny);

        let p: Permission = "NETWORK_CONNECT:localhost:8080".parse().unwrap();
        assert_eq!(p.target(), "localhost:8080");
        assert_eq!(p.action(), PermissionAction::Grant);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Permission>().is_err());
        assert!("NOT_A_TYPE:*:GRANT".parse::<Permission>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let p = Permission::deny(PermissionType::ServiceGet, "secret.svc");
        assert_eq!(p.to_string(), "SERVICE_GET:secret.svc:DENY");
        assert_eq!(p.to_string().parse::<Permission>().unwrap(), p);
    }

    #[test]
    fn test_admin_implies_everything() {
        let admin = Permission::grant(PermissionType::Admin, "*");
        for t in PermissionType::ALL {
            assert!(admin.implies(t, "whatever"));
        }
        let denied_admin = Permission::deny(PermissionType::Admin, "*");
        assert!(!denied_admin.implies(PermissionType::ServiceGet, "x"));
    }

    #[test]
    fn test_collection_wildcard_grant() {
        let c = PermissionCollection::from_vec(vec![Permission::grant(
            PermissionType::ServiceGet,
            "com.example.*",
        )]);
        assert!(c.implies(PermissionType::ServiceGet, "com.example.svc"));
        assert!(!c.implies(PermissionType::ServiceGet, "org.other"));
        assert!(!c.implies(PermissionType::ServiceRegister, "com.example.svc"));
    }

    #[test]
    fn test_collection_deny_overrides_grant() {
        let c = PermissionCollection::from_vec(vec![
            Permission::grant(PermissionType::ServiceGet, "*"),
            Permission::deny(PermissionType::ServiceGet, "secret.svc"),
        ]);
        assert!(!c.implies(PermissionType::ServiceGet, "secret.svc"));
        assert!(c.implies(PermissionType::ServiceGet, "public.svc"));

        // Order of insertion is not observable.
        let reversed = PermissionCollection::from_vec(vec![
            Permission::deny(PermissionType::ServiceGet, "secret.svc"),
            Permission::grant(PermissionType::ServiceGet, "*"),
        ]);
        assert!(!reversed.implies(PermissionType::ServiceGet, "secret.svc"));
    }

    #[test]
    fn test_deny_beats_admin_for_same_type_only() {
        let c = PermissionCollection::from_vec(vec![
            Permission::grant(PermissionType::Admin, "*"),
            Permission::deny(PermissionType::FileWrite, "/etc/*"),
        ]);
        assert!(!c.implies(PermissionType::FileWrite, "/etc/passwd"));
        assert!(c.implies(PermissionType::FileWrite, "/tmp/x"));
        assert!(c.implies(PermissionType::FileRead, "/etc/passwd"));
    }

    #[test]
    fn test_collection_dedup_and_remove() {
        let mut c = PermissionCollection::new();
        let p = Permission::grant(PermissionType::EventPublish, "topic/*");
        assert!(c.add(p.clone()));
        assert!(!c.add(p.clone()));
        assert_eq!(c.len(), 1);
        assert!(c.remove(&p));
        assert!(c.is_empty());
    }

    #[test]
    fn test_revoke_entry_is_not_a_grant() {
        let c = PermissionCollection::from_vec(vec![Permission::new(
            PermissionType::ServiceGet,
            "*",
            PermissionAction::Revoke,
        )]);
        assert!(!c.implies(PermissionType::ServiceGet, "x"));
    }
}
