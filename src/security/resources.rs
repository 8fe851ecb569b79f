//! Per-module resource accounting
//!
//! Tracks current and peak usage for each `(module, kind)` pair against an
//! optional soft/hard limit. The limiter only signals violations to its
//! listeners; what happens to an offending module is the caller's decision.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::manager::parse_section;
use crate::error::{CdmfError, Result};
use crate::utils::contain_panic;
use crate::ListenerId;

/// Kind of accounted resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Memory,
    CpuTime,
    Threads,
    FileHandles,
    NetworkConnections,
    IpcMessages,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Memory,
        ResourceKind::CpuTime,
        ResourceKind::Threads,
        ResourceKind::FileHandles,
        ResourceKind::NetworkConnections,
        ResourceKind::IpcMessages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Memory => "MEMORY",
            ResourceKind::CpuTime => "CPU_TIME",
            ResourceKind::Threads => "THREADS",
            ResourceKind::FileHandles => "FILE_HANDLES",
            ResourceKind::NetworkConnections => "NETWORK_CONNECTIONS",
            ResourceKind::IpcMessages => "IPC_MESSAGES",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CdmfError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == upper)
            .ok_or_else(|| CdmfError::invalid(format!("unknown resource kind: {}", s)))
    }
}

/// Soft and hard limit for one resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub kind: ResourceKind,
    pub soft: u64,
    pub hard: u64,
    pub enabled: bool,
}

impl ResourceLimit {
    pub fn new(kind: ResourceKind, soft: u64, hard: u64) -> Self {
        Self {
            kind,
            soft,
            hard,
            enabled: true,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.soft > self.hard {
            return Err(CdmfError::invalid(format!(
                "{}: soft limit {} exceeds hard limit {}",
                self.kind, self.soft, self.hard
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.kind, self.soft, self.hard, self.enabled)
    }
}

impl FromStr for ResourceLimit {
    type Err = CdmfError;

    /// Parse `TYPE:SOFT:HARD[:ENABLED]`
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').map(str::trim).collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(CdmfError::invalid(format!(
                "expected TYPE:SOFT:HARD[:ENABLED], got {:?}",
                s
            )));
        }
        let kind: ResourceKind = parts[0].parse()?;
        let soft = parse_amount(parts[1])?;
        let hard = parse_amount(parts[2])?;
        let enabled = match parts.get(3) {
            None => true,
            Some(&"true") | Some(&"1") => true,
            Some(&"false") | Some(&"0") => false,
            Some(other) => {
                return Err(CdmfError::invalid(format!("invalid enabled flag: {}", other)))
            }
        };
        let limit = ResourceLimit {
            kind,
            soft,
            hard,
            enabled,
        };
        limit.validate()?;
        Ok(limit)
    }
}

fn parse_amount(s: &str) -> Result<u64> {
    s.parse::<u64>()
        .map_err(|_| CdmfError::invalid(format!("invalid amount: {}", s)))
}

/// Usage snapshot for one `(module, kind)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUsage {
    pub kind: ResourceKind,
    pub limit: Option<ResourceLimit>,
    pub current: u64,
    pub peak: u64,
    pub soft_exceeded: bool,
    pub hard_violated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationSeverity {
    Soft,
    Hard,
}

/// Reported to violation listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceViolation {
    pub module_id: String,
    pub kind: ResourceKind,
    pub amount: u64,
    pub limit: ResourceLimit,
    pub severity: ViolationSeverity,
}

pub type ViolationListener = Arc<dyn Fn(&ResourceViolation) + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Entry {
    limit: Option<ResourceLimit>,
    current: u64,
    peak: u64,
    soft_exceeded: bool,
    hard_violated: bool,
}

impl Entry {
    fn active_limit(&self) -> Option<ResourceLimit> {
        self.limit.filter(|l| l.enabled)
    }

    /// Set `current` and refresh the derived fields
    fn set_current(&mut self, amount: u64) -> Option<(ResourceLimit, ViolationSeverity)> {
        self.current = amount;
        self.peak = self.peak.max(amount);
        match self.active_limit() {
            Some(limit) => {
                self.soft_exceeded = amount >= limit.soft;
                self.hard_violated = amount >= limit.hard;
                if self.hard_violated {
                    Some((limit, ViolationSeverity::Hard))
                } else if self.soft_exceeded {
                    Some((limit, ViolationSeverity::Soft))
                } else {
                    None
                }
            }
            None => {
                self.soft_exceeded = false;
                self.hard_violated = false;
                None
            }
        }
    }

    fn snapshot(&self, kind: ResourceKind) -> ResourceUsage {
        ResourceUsage {
            kind,
            limit: self.limit,
            current: self.current,
            peak: self.peak,
            soft_exceeded: self.soft_exceeded,
            hard_violated: self.hard_violated,
        }
    }
}

type ModuleEntries = BTreeMap<ResourceKind, Entry>;

/// Resource limiter for one framework instance
pub struct ResourceLimiter {
    modules: RwLock<BTreeMap<String, ModuleEntries>>,
    listeners: RwLock<Vec<(ListenerId, ViolationListener)>>,
    next_listener: AtomicU64,
    enabled: AtomicBool,
}

impl ResourceLimiter {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            enabled: AtomicBool::new(true),
        }
    }

    /// Globally enable or disable limiting
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!("Resource limiting {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Install or replace a limit
    pub fn set_limit(&self, module_id: &str, limit: ResourceLimit) -> Result<()> {
        if module_id.is_empty() {
            return Err(CdmfError::invalid("module id must not be empty"));
        }
        limit.validate()?;
        let mut modules = self.modules.write();
        let entry = modules
            .entry(module_id.to_string())
            .or_default()
            .entry(limit.kind)
            .or_default();
        entry.limit = Some(limit);
        debug!("Set limit {} for {}", limit, module_id);
        Ok(())
    }

    pub fn remove_limit(&self, module_id: &str, kind: ResourceKind) -> bool {
        let mut modules = self.modules.write();
        match modules.get_mut(module_id).and_then(|m| m.get_mut(&kind)) {
            Some(entry) => {
                let removed = entry.limit.take().is_some();
                entry.soft_exceeded = false;
                entry.hard_violated = false;
                removed
            }
            None => false,
        }
    }

    pub fn get_limit(&self, module_id: &str, kind: ResourceKind) -> Option<ResourceLimit> {
        self.modules
            .read()
            .get(module_id)
            .and_then(|m| m.get(&kind))
            .and_then(|e| e.limit)
    }

    /// Record an absolute usage figure
    ///
    /// Updates `current` and `peak` and sets the soft and hard flags
    /// (`amount >= soft`, `amount >= hard`). Listeners are told about
    /// violations when limiting is enabled.
    pub fn record_usage(&self, module_id: &str, kind: ResourceKind, amount: u64) -> ResourceUsage {
        let (usage, violation) = {
            let mut modules = self.modules.write();
            let entry = modules
                .entry(module_id.to_string())
                .or_default()
                .entry(kind)
                .or_default();
            let violation = entry.set_current(amount);
            (entry.snapshot(kind), violation)
        };

        if let Some((limit, severity)) = violation {
            self.report(module_id, kind, amount, limit, severity);
        }
        usage
    }

    /// Whether `amount` more units fit under the hard limit
    pub fn can_allocate(&self, module_id: &str, kind: ResourceKind, amount: u64) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let modules = self.modules.read();
        match modules.get(module_id).and_then(|m| m.get(&kind)) {
            Some(entry) => match entry.active_limit() {
                Some(limit) => entry.current.saturating_add(amount) < limit.hard,
                None => true,
            },
            None => true,
        }
    }

    /// Checked increment of `current`
    pub fn allocate(&self, module_id: &str, kind: ResourceKind, amount: u64) -> Result<ResourceUsage> {
        let (usage, violation) = {
            let mut modules = self.modules.write();
            let entry = modules
                .entry(module_id.to_string())
                .or_default()
                .entry(kind)
                .or_default();
            let next = entry.current.saturating_add(amount);
            if self.is_enabled() {
                if let Some(limit) = entry.active_limit() {
                    if next >= limit.hard {
                        drop(modules);
                        self.report(module_id, kind, next, limit, ViolationSeverity::Hard);
                        return Err(CdmfError::denied(format!(
                            "module {} would exceed hard {} limit ({} >= {})",
                            module_id, kind, next, limit.hard
                        )));
                    }
                }
            }
            let violation = entry.set_current(next);
            (entry.snapshot(kind), violation)
        };

        if let Some((limit, severity)) = violation {
            self.report(module_id, kind, usage.current, limit, severity);
        }
        Ok(usage)
    }

    /// Decrement `current`, saturating at zero
    pub fn release(&self, module_id: &str, kind: ResourceKind, amount: u64) -> Option<ResourceUsage> {
        let mut modules = self.modules.write();
        let entry = modules.get_mut(module_id)?.get_mut(&kind)?;
        let next = entry.current.saturating_sub(amount);
        entry.set_current(next);
        Some(entry.snapshot(kind))
    }

    pub fn usage(&self, module_id: &str, kind: ResourceKind) -> Option<ResourceUsage> {
        self.modules
            .read()
            .get(module_id)
            .and_then(|m| m.get(&kind))
            .map(|e| e.snapshot(kind))
    }

    /// All tracked kinds of a module
    pub fn usages(&self, module_id: &str) -> Vec<ResourceUsage> {
        self.modules
            .read()
            .get(module_id)
            .map(|m| m.iter().map(|(k, e)| e.snapshot(*k)).collect())
            .unwrap_or_default()
    }

    /// Forget usage figures of a module, keeping its limits
    pub fn reset_usage(&self, module_id: &str) {
        if let Some(entries) = self.modules.write().get_mut(module_id) {
            for entry in entries.values_mut() {
                *entry = Entry {
                    limit: entry.limit,
                    ..Entry::default()
                };
            }
        }
    }

    /// Drop all limits and usage of a module
    pub fn clear_module(&self, module_id: &str) {
        if self.modules.write().remove(module_id).is_some() {
            debug!("Cleared resource accounting of {}", module_id);
        }
    }

    pub fn add_violation_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResourceViolation) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_violation_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn report(
        &self,
        module_id: &str,
        kind: ResourceKind,
        amount: u64,
        limit: ResourceLimit,
        severity: ViolationSeverity,
    ) {
        if !self.is_enabled() {
            return;
        }
        warn!(
            "Module {} {:?} limit reached for {}: {} (soft={}, hard={})",
            module_id, severity, kind, amount, limit.soft, limit.hard
        );
        let violation = ResourceViolation {
            module_id: module_id.to_string(),
            kind,
            amount,
            limit,
            severity,
        };
        let listeners: Vec<ViolationListener> =
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            contain_panic(|| listener(&violation), "Resource violation listener panicked");
        }
    }

    /// Load a limit file, merging into the limiter
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let contents = fs::read_to_string(path.as_ref())?;
        let applied = self.load_from_str(&contents);
        info!("Loaded {} resource limits from {:?}", applied, path.as_ref());
        Ok(applied)
    }

    /// Parse limit file contents; malformed lines are skipped
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
                section = if name.is_empty() {
                    warn!("Line {}: empty section name, skipping section", line_no);
                    None
                } else {
                    Some(name.to_string())
                };
                continue;
            }
            let Some(module_id) = section.as_deref() else {
                warn!("Line {}: limit outside of a [module] section: {}", line_no, line);
                continue;
            };
            match line.parse::<ResourceLimit>() {
                Ok(limit) => {
                    if self.set_limit(module_id, limit).is_ok() {
                        applied += 1;
                    }
                }
                Err(e) => warn!("Line {}: skipping malformed limit {:?}: {}", line_no, line, e),
            }
        }
        applied
    }

    /// Render every configured limit in limit file format
    pub fn to_config_string(&self) -> String {
        let modules = self.modules.read();
        let mut out = String::from("# CDMF resource limits\n");
        for (module_id, entries) in modules.iter() {
            let limits: Vec<ResourceLimit> = entries.values().filter_map(|e| e.limit).collect();
            if limits.is_empty() {
                continue;
            }
            out.push('\n');
            out.push_str(&format!("[{}]\n", module_id));
            for limit in limits {
                out.push_str(&limit.to_string());
                out.push('\n');
            }
        }
        out
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path.as_ref(), self.to_config_string())?;
        Ok(())
    }
}

impl Default for ResourceLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_record_usage_flags() {
        let limiter = ResourceLimiter::new();
        limiter
            .set_limit("m", ResourceLimit::new(ResourceKind::Memory, 100, 200))
            .unwrap();

        let usage = limiter.record_usage("m", ResourceKind::Memory, 50);
        assert!(!usage.soft_exceeded && !usage.hard_violated);

        let usage = limiter.record_usage("m", ResourceKind::Memory, 100);
        assert!(usage.soft_exceeded && !usage.hard_violated);

        let usage = limiter.record_usage("m", ResourceKind::Memory, 200);
        assert!(usage.hard_violated);

        let usage = limiter.record_usage("m", ResourceKind::Memory, 10);
        assert_eq!(usage.current, 10);
        assert_eq!(usage.peak, 200);
        assert!(!usage.soft_exceeded);
    }

    #[test]
    fn test_can_allocate() {
        let limiter = ResourceLimiter::new();
        assert!(limiter.can_allocate("m", ResourceKind::Threads, 1_000));

        limiter
            .set_limit("m", ResourceLimit::new(ResourceKind::Threads, 4, 8))
            .unwrap();
        limiter.record_usage("m", ResourceKind::Threads, 5);
        assert!(limiter.can_allocate("m", ResourceKind::Threads, 2));
        assert!(!limiter.can_allocate("m", ResourceKind::Threads, 3));

        limiter.set_enabled(false);
        assert!(limiter.can_allocate("m", ResourceKind::Threads, 3));
    }

    #[test]
    fn test_disabled_limit_always_allows() {
        let limiter = ResourceLimiter::new();
        let mut limit = ResourceLimit::new(ResourceKind::FileHandles, 1, 2);
        limit.enabled = false;
        limiter.set_limit("m", limit).unwrap();
        assert!(limiter.can_allocate("m", ResourceKind::FileHandles, 50));
    }

    #[test]
    fn test_allocate_release() {
        let limiter = ResourceLimiter::new();
        limiter
            .set_limit("m", ResourceLimit::new(ResourceKind::IpcMessages, 5, 10))
            .unwrap();
        assert_eq!(limiter.allocate("m", ResourceKind::IpcMessages, 9).unwrap().current, 9);
        assert!(limiter.allocate("m", ResourceKind::IpcMessages, 1).is_err());
        assert_eq!(limiter.release("m", ResourceKind::IpcMessages, 4).unwrap().current, 5);
        assert_eq!(limiter.release("m", ResourceKind::IpcMessages, 40).unwrap().current, 0);
    }

    #[test]
    fn test_soft_above_hard_rejected() {
        let limiter = ResourceLimiter::new();
        assert!(limiter
            .set_limit("m", ResourceLimit::new(ResourceKind::Memory, 10, 5))
            .is_err());
    }

    #[test]
    fn test_violation_listener_and_panic_containment() {
        let limiter = ResourceLimiter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        limiter.add_violation_listener(|_| panic!("listener bug"));
        limiter.add_violation_listener(move |v| sink.lock().unwrap().push(v.severity));
        limiter
            .set_limit("m", ResourceLimit::new(ResourceKind::CpuTime, 10, 20))
            .unwrap();

        limiter.record_usage("m", ResourceKind::CpuTime, 15);
        limiter.record_usage("m", ResourceKind::CpuTime, 25);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ViolationSeverity::Soft, ViolationSeverity::Hard]
        );
    }

    #[test]
    fn test_limit_parse() {
        let limit: ResourceLimit = "memory:10:20:0".parse().unwrap();
        assert_eq!(limit.kind, ResourceKind::Memory);
        assert!(!limit.enabled);
        assert!("MEMORY:10".parse::<ResourceLimit>().is_err());
        assert!("MEMORY:10:20:maybe".parse::<ResourceLimit>().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("limits.conf");
        let second = dir.path().join("limits2.conf");

        let limiter = ResourceLimiter::new();
        let applied = limiter.load_from_str(
            "# limits\n[b]\nTHREADS:4:8:true\n[a]\nMEMORY:100:200:1\nCPU_TIME:1:x:true\nIPC_MESSAGES:5:10:false\n",
        );
        assert_eq!(applied, 3);
        limiter.save_to_file(&first).unwrap();

        let reloaded = ResourceLimiter::new();
        reloaded.load_from_file(&first).unwrap();
        reloaded.save_to_file(&second).unwrap();
        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
        assert_eq!(
            reloaded.get_limit("a", ResourceKind::IpcMessages).map(|l| l.enabled),
            Some(false)
        );
    }
}
