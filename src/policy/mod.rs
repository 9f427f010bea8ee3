//! # Policy Engine
//!
//! Translates declarative container policies into kernel-enforced rules
//! keyed by cgroup identity.
//!
//! A [`Policy`] carries a security level, filesystem path rules, and
//! network rules. Loading resolves each path rule inside the container's
//! filesystem view to a `(device, inode)` pair and writes one entry into
//! the pinned filesystem policy map under the container's cgroup id;
//! network rules go into the network map under the same key. Absence of
//! an entry denies: containers run default-deny.
//!
//! ```text
//! (cgroup, dev, ino)        → AccessMask { read | write | exec }
//! (cgroup, network tuple)   → NetAllowMask { create | bind | … | send }
//! ```
//!
//! When the kernel lacks the BPF-LSM surface the engine falls back to a
//! seccomp-bpf filter derived from the security level and network rules;
//! filesystem rules are dropped in that mode and the container carries a
//! capability-degraded marker.

mod bpf;
mod seccomp;

pub use bpf::BpfPolicyBackend;
pub use seccomp::SeccompPolicyBackend;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use seccomp::{apply_filter as seccomp_apply, build_filter as seccomp_filter};

use crate::error::{Error, Result};
use crate::platform::{Capability, Platform};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

// =============================================================================
// Policy Model
// =============================================================================

/// Coarse default posture applied before individual rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Build-time defaults: no network, declared paths only.
    #[default]
    Default,
    /// Additionally blocks process introspection and module loading.
    Restricted,
    /// Additionally blocks nested process creation.
    Strict,
}

/// Filesystem access bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessMask(pub u32);

impl AccessMask {
    pub const READ: AccessMask = AccessMask(1 << 0);
    pub const WRITE: AccessMask = AccessMask(1 << 1);
    pub const EXEC: AccessMask = AccessMask(1 << 2);

    /// Read plus execute, the common rule for mounted package content.
    pub const READ_EXEC: AccessMask = AccessMask(1 << 0 | 1 << 2);

    /// Full access, used for scratch and output trees.
    pub const ALL: AccessMask = AccessMask(0b111);

    pub const fn union(self, other: AccessMask) -> AccessMask {
        AccessMask(self.0 | other.0)
    }

    /// True when every bit in `required` is present.
    pub const fn allows(self, required: AccessMask) -> bool {
        self.0 & required.0 == required.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Network operation bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetAllowMask(pub u32);

impl NetAllowMask {
    pub const CREATE: NetAllowMask = NetAllowMask(1 << 0);
    pub const BIND: NetAllowMask = NetAllowMask(1 << 1);
    pub const CONNECT: NetAllowMask = NetAllowMask(1 << 2);
    pub const LISTEN: NetAllowMask = NetAllowMask(1 << 3);
    pub const ACCEPT: NetAllowMask = NetAllowMask(1 << 4);
    pub const SEND: NetAllowMask = NetAllowMask(1 << 5);

    /// Everything a connecting client needs.
    pub const CLIENT: NetAllowMask = NetAllowMask(1 << 0 | 1 << 2 | 1 << 5);

    pub const fn union(self, other: NetAllowMask) -> NetAllowMask {
        NetAllowMask(self.0 | other.0)
    }

    pub const fn allows(self, required: NetAllowMask) -> bool {
        self.0 & required.0 == required.0
    }
}

/// Address family of a network rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetFamily {
    Unix,
    Inet,
    Inet6,
}

/// Socket type of a network rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetSocketType {
    Stream,
    Dgram,
}

/// One declarative filesystem rule.
///
/// `path` is interpreted inside the container's filesystem view. A
/// trailing `/*` covers the directory's direct entries, `/**` the whole
/// subtree; anything else is a literal path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsRule {
    pub path: PathBuf,
    pub access: AccessMask,
}

impl FsRule {
    pub fn new(path: impl Into<PathBuf>, access: AccessMask) -> Self {
        Self {
            path: path.into(),
            access,
        }
    }
}

/// One declarative network rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetRule {
    pub family: NetFamily,
    pub socket_type: NetSocketType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Remote address, or the UNIX socket path for [`NetFamily::Unix`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub allow: NetAllowMask,
}

/// Windows app-container parameters; accepted and ignored on non-Windows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsPolicyExt {
    #[serde(default)]
    pub app_container_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Complete per-container policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub level: SecurityLevel,
    #[serde(default)]
    pub fs_rules: Vec<FsRule>,
    #[serde(default)]
    pub net_rules: Vec<NetRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<WindowsPolicyExt>,
}

impl Policy {
    /// Default-deny policy at the given level; no rules.
    pub fn deny_all(level: SecurityLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Adds a filesystem rule.
    pub fn allow_fs(mut self, path: impl Into<PathBuf>, access: AccessMask) -> Self {
        self.fs_rules.push(FsRule::new(path, access));
        self
    }

    /// Adds a network rule.
    pub fn allow_net(mut self, rule: NetRule) -> Self {
        self.net_rules.push(rule);
        self
    }
}

// =============================================================================
// Backend Seam
// =============================================================================

/// Result of loading a policy for one container.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    /// Cgroup identity the entries are keyed by.
    pub cgroup_id: u64,
    /// Filesystem map entries written.
    pub fs_entries: usize,
    /// Network map entries written.
    pub net_entries: usize,
    /// Rules dropped during population (missing paths, per-rule failures).
    pub dropped_rules: usize,
    /// True when enforcement is weaker than declared (seccomp fallback or
    /// dropped rules).
    pub degraded: bool,
}

/// Counters surfaced by a policy backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyMetrics {
    /// Entries currently held across both maps.
    pub total_entries: u64,
    /// Successful populate operations.
    pub populate_ok: u64,
    /// Failed populate operations.
    pub populate_failed: u64,
    /// Successful cleanup operations.
    pub cleanup_ok: u64,
    /// Failed cleanup operations.
    pub cleanup_failed: u64,
    /// Duration of the most recent populate, in microseconds.
    pub last_populate_micros: u64,
    /// Duration of the most recent cleanup, in microseconds.
    pub last_cleanup_micros: u64,
}

/// Kernel-facing half of the policy engine.
///
/// Implementations: [`BpfPolicyBackend`] (pinned maps, BPF-LSM
/// enforcement), [`SeccompPolicyBackend`] (syscall filtering only), and
/// [`MemoryPolicyBackend`] (process-local bookkeeping for tests and
/// unprivileged runs).
pub trait PolicyBackend: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// True when the backend can enforce on this host.
    fn is_available(&self) -> bool;

    /// Resolves rules against `rootfs` and writes entries keyed by
    /// `cgroup_id`. Per-rule failures drop the rule with a warning; a
    /// full map fails with `resource-exhausted`.
    fn populate(&self, cgroup_id: u64, policy: &Policy, rootfs: &Path) -> Result<PolicyHandle>;

    /// Removes every entry keyed by `cgroup_id`; returns how many were
    /// removed. Idempotent.
    fn cleanup(&self, cgroup_id: u64) -> Result<usize>;

    /// Current counters.
    fn metrics(&self) -> PolicyMetrics;
}

/// Selects the strongest backend the platform supports.
pub fn select_backend(platform: &Platform) -> Box<dyn PolicyBackend> {
    if platform.has(Capability::BpfLsm) {
        let backend = BpfPolicyBackend::new();
        if backend.is_available() {
            info!("policy backend: bpf-lsm (pinned maps)");
            return Box::new(backend);
        }
    }
    if platform.has(Capability::Seccomp) {
        info!("policy backend: seccomp fallback (filesystem rules not enforced)");
        return Box::new(SeccompPolicyBackend::new());
    }
    info!("policy backend: in-memory bookkeeping only");
    Box::new(MemoryPolicyBackend::new())
}

// =============================================================================
// Rule Resolution
// =============================================================================

/// A filesystem rule resolved to its kernel key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFsRule {
    pub dev: u64,
    pub ino: u64,
    pub access: AccessMask,
}

/// Resolves declared path rules inside the container's filesystem view.
///
/// Missing paths are skipped with a warning and counted as dropped;
/// the caller marks the handle degraded when anything was dropped.
pub fn resolve_fs_rules(rules: &[FsRule], rootfs: &Path) -> (Vec<ResolvedFsRule>, usize) {
    let mut resolved = Vec::new();
    let mut dropped = 0usize;

    for rule in rules {
        let pattern = rule.path.to_string_lossy();
        let (base, walk) = if let Some(prefix) = pattern.strip_suffix("/**") {
            (PathBuf::from(prefix), Some(true))
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            (PathBuf::from(prefix), Some(false))
        } else {
            (rule.path.clone(), None)
        };

        let rel = base.strip_prefix("/").unwrap_or(&base);
        let host_path = rootfs.join(rel);

        let mut targets = Vec::new();
        match walk {
            None => targets.push(host_path),
            Some(recursive) => {
                // The directory itself is part of the rule: opening it for
                // readdir needs an entry too.
                targets.push(host_path.clone());
                collect_entries(&host_path, recursive, &mut targets);
            }
        }

        let mut matched = false;
        for target in targets {
            match stat_ids(&target) {
                Some((dev, ino)) => {
                    matched = true;
                    resolved.push(ResolvedFsRule {
                        dev,
                        ino,
                        access: rule.access,
                    });
                }
                None => {
                    if walk.is_none() {
                        warn!(
                            "policy path {} does not exist in container view, skipping",
                            rule.path.display()
                        );
                    }
                }
            }
        }
        if !matched {
            dropped += 1;
        }
    }

    (resolved, dropped)
}

fn collect_entries(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        out.push(path.clone());
        if recursive && is_dir {
            collect_entries(&path, true, out);
        }
    }
}

#[cfg(unix)]
fn stat_ids(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    std::fs::symlink_metadata(path)
        .ok()
        .map(|m| (m.dev(), m.ino()))
}

#[cfg(not(unix))]
fn stat_ids(_path: &Path) -> Option<(u64, u64)> {
    None
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// Process-local policy bookkeeping.
///
/// Holds the same key/value shape as the pinned maps without touching the
/// kernel. Used by tests and by unprivileged runs where neither BPF-LSM
/// nor seccomp is usable; carries the same saturation semantics.
pub struct MemoryPolicyBackend {
    capacity: usize,
    fs: Mutex<HashMap<(u64, u64, u64), AccessMask>>,
    net: Mutex<HashMap<(u64, u64), NetAllowMask>>,
    populate_ok: AtomicU64,
    populate_failed: AtomicU64,
    cleanup_ok: AtomicU64,
    cleanup_failed: AtomicU64,
    last_populate_micros: AtomicU64,
    last_cleanup_micros: AtomicU64,
}

impl MemoryPolicyBackend {
    pub fn new() -> Self {
        Self::with_capacity(crate::constants::POLICY_MAP_MAX_ENTRIES as usize)
    }

    /// Backend with an explicit slot budget, for saturation tests.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            fs: Mutex::new(HashMap::new()),
            net: Mutex::new(HashMap::new()),
            populate_ok: AtomicU64::new(0),
            populate_failed: AtomicU64::new(0),
            cleanup_ok: AtomicU64::new(0),
            cleanup_failed: AtomicU64::new(0),
            last_populate_micros: AtomicU64::new(0),
            last_cleanup_micros: AtomicU64::new(0),
        }
    }

    /// Filesystem map keys held for `cgroup_id`, for invariant checks.
    pub fn fs_keys(&self, cgroup_id: u64) -> Vec<(u64, u64, u64)> {
        self.fs
            .lock()
            .map(|m| m.keys().filter(|k| k.0 == cgroup_id).copied().collect())
            .unwrap_or_default()
    }

    /// Looks up the access mask for a `(cgroup, dev, ino)` triple.
    pub fn fs_lookup(&self, cgroup_id: u64, dev: u64, ino: u64) -> Option<AccessMask> {
        self.fs
            .lock()
            .ok()
            .and_then(|m| m.get(&(cgroup_id, dev, ino)).copied())
    }

    fn net_key(rule: &NetRule) -> u64 {
        // Stable tuple fold; mirrors the packed wire key of the bpf map.
        let family = match rule.family {
            NetFamily::Unix => 1u64,
            NetFamily::Inet => 2,
            NetFamily::Inet6 => 10,
        };
        let socket_type = match rule.socket_type {
            NetSocketType::Stream => 1u64,
            NetSocketType::Dgram => 2,
        };
        let port = rule.port.unwrap_or(0) as u64;
        let proto = rule.protocol.unwrap_or(0) as u64;
        (family << 48) | (socket_type << 40) | (proto << 32) | (port << 16)
    }
}

impl Default for MemoryPolicyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyBackend for MemoryPolicyBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn populate(&self, cgroup_id: u64, policy: &Policy, rootfs: &Path) -> Result<PolicyHandle> {
        let started = std::time::Instant::now();
        let (resolved, dropped) = resolve_fs_rules(&policy.fs_rules, rootfs);

        let mut fs = self
            .fs
            .lock()
            .map_err(|_| Error::Internal("policy map lock poisoned".into()))?;
        let mut net = self
            .net
            .lock()
            .map_err(|_| Error::Internal("policy map lock poisoned".into()))?;

        if fs.len() + net.len() + resolved.len() + policy.net_rules.len() > self.capacity {
            self.populate_failed.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ResourceExhausted(format!(
                "policy map full ({} slots)",
                self.capacity
            )));
        }

        let mut fs_entries = 0usize;
        for rule in &resolved {
            let entry = fs.entry((cgroup_id, rule.dev, rule.ino)).or_default();
            *entry = entry.union(rule.access);
            fs_entries += 1;
        }

        let mut net_entries = 0usize;
        for rule in &policy.net_rules {
            let entry = net.entry((cgroup_id, Self::net_key(rule))).or_default();
            *entry = entry.union(rule.allow);
            net_entries += 1;
        }

        self.populate_ok.fetch_add(1, Ordering::Relaxed);
        self.last_populate_micros
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        debug!(
            "populated {} fs + {} net entries for cgroup {}",
            fs_entries, net_entries, cgroup_id
        );

        Ok(PolicyHandle {
            cgroup_id,
            fs_entries,
            net_entries,
            dropped_rules: dropped,
            degraded: dropped > 0,
        })
    }

    fn cleanup(&self, cgroup_id: u64) -> Result<usize> {
        let started = std::time::Instant::now();
        let mut fs = self
            .fs
            .lock()
            .map_err(|_| Error::Internal("policy map lock poisoned".into()))?;
        let mut net = self
            .net
            .lock()
            .map_err(|_| Error::Internal("policy map lock poisoned".into()))?;

        let before = fs.len() + net.len();
        fs.retain(|k, _| k.0 != cgroup_id);
        net.retain(|k, _| k.0 != cgroup_id);
        let removed = before - (fs.len() + net.len());

        self.cleanup_ok.fetch_add(1, Ordering::Relaxed);
        self.last_cleanup_micros
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        Ok(removed)
    }

    fn metrics(&self) -> PolicyMetrics {
        let fs_len = self.fs.lock().map(|m| m.len()).unwrap_or(0) as u64;
        let net_len = self.net.lock().map(|m| m.len()).unwrap_or(0) as u64;
        PolicyMetrics {
            total_entries: fs_len + net_len,
            populate_ok: self.populate_ok.load(Ordering::Relaxed),
            populate_failed: self.populate_failed.load(Ordering::Relaxed),
            cleanup_ok: self.cleanup_ok.load(Ordering::Relaxed),
            cleanup_failed: self.cleanup_failed.load(Ordering::Relaxed),
            last_populate_micros: self.last_populate_micros.load(Ordering::Relaxed),
            last_cleanup_micros: self.last_cleanup_micros.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs_with(files: &[&str]) -> TempDir {
        let temp = TempDir::new().unwrap();
        for file in files {
            let path = temp.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"x").unwrap();
        }
        temp
    }

    #[test]
    fn test_access_mask_bits() {
        let mask = AccessMask::READ.union(AccessMask::EXEC);
        assert!(mask.allows(AccessMask::READ));
        assert!(mask.allows(AccessMask::READ_EXEC));
        assert!(!mask.allows(AccessMask::WRITE));
        assert!(AccessMask::default().is_empty());
    }

    #[test]
    fn test_populate_and_cleanup_exact_bookkeeping() {
        let rootfs = rootfs_with(&["opt/pkg/bin/app"]);
        let backend = MemoryPolicyBackend::new();
        let policy =
            Policy::deny_all(SecurityLevel::Default).allow_fs("/opt/pkg/bin/app", AccessMask::READ);

        let handle = backend.populate(7, &policy, rootfs.path()).unwrap();
        assert_eq!(handle.fs_entries, 1);
        assert!(!handle.degraded);
        assert_eq!(backend.fs_keys(7).len(), 1);

        // Another container's entries are keyed separately.
        let handle2 = backend.populate(8, &policy, rootfs.path()).unwrap();
        assert_eq!(handle2.fs_entries, 1);

        let removed = backend.cleanup(7).unwrap();
        assert_eq!(removed, 1);
        assert!(backend.fs_keys(7).is_empty());
        assert_eq!(backend.fs_keys(8).len(), 1);

        // Cleanup is idempotent.
        assert_eq!(backend.cleanup(7).unwrap(), 0);
    }

    #[test]
    fn test_missing_path_dropped_with_degraded_marker() {
        let rootfs = rootfs_with(&[]);
        let backend = MemoryPolicyBackend::new();
        let policy =
            Policy::deny_all(SecurityLevel::Default).allow_fs("/no/such/path", AccessMask::READ);

        let handle = backend.populate(1, &policy, rootfs.path()).unwrap();
        assert_eq!(handle.fs_entries, 0);
        assert_eq!(handle.dropped_rules, 1);
        assert!(handle.degraded);
    }

    #[test]
    fn test_saturation_is_resource_exhausted() {
        let rootfs = rootfs_with(&["a", "b", "c"]);
        let backend = MemoryPolicyBackend::with_capacity(2);
        let policy = Policy::deny_all(SecurityLevel::Default)
            .allow_fs("/a", AccessMask::READ)
            .allow_fs("/b", AccessMask::READ);
        backend.populate(1, &policy, rootfs.path()).unwrap();

        let more = Policy::deny_all(SecurityLevel::Default).allow_fs("/c", AccessMask::READ);
        let err = backend.populate(2, &more, rootfs.path()).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));

        // Existing containers are unaffected.
        assert_eq!(backend.fs_keys(1).len(), 2);
    }

    #[test]
    fn test_subtree_rule_resolution() {
        let rootfs = rootfs_with(&["opt/pkg/bin/app", "opt/pkg/lib/libx.so"]);
        let (resolved, dropped) = resolve_fs_rules(
            &[FsRule::new("/opt/pkg/**", AccessMask::READ_EXEC)],
            rootfs.path(),
        );
        // pkg dir, bin dir, app, lib dir, libx.so
        assert_eq!(resolved.len(), 5);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_enforcement_decision_shape() {
        // The kernel-side check: required bits must all be present.
        let rootfs = rootfs_with(&["opt/pkg/bin/app", "etc/passwd"]);
        let backend = MemoryPolicyBackend::new();
        let policy =
            Policy::deny_all(SecurityLevel::Default).allow_fs("/opt/pkg/bin/app", AccessMask::READ);
        backend.populate(42, &policy, rootfs.path()).unwrap();

        let (resolved, _) = resolve_fs_rules(
            &[FsRule::new("/opt/pkg/bin/app", AccessMask::READ)],
            rootfs.path(),
        );
        let key = resolved[0];
        let mask = backend.fs_lookup(42, key.dev, key.ino).unwrap();
        assert!(mask.allows(AccessMask::READ));
        assert!(!mask.allows(AccessMask::WRITE));

        // /etc/passwd has no entry: default-deny.
        let (passwd, _) = resolve_fs_rules(
            &[FsRule::new("/etc/passwd", AccessMask::READ)],
            rootfs.path(),
        );
        assert!(backend.fs_lookup(42, passwd[0].dev, passwd[0].ino).is_none());
    }
}
