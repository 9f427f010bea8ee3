//! # Seccomp Fallback
//!
//! Applied when the kernel lacks the BPF-LSM surface. The declarative
//! policy is translated into a seccomp-bpf syscall filter; the
//! translation is lossy by design: filesystem rules cannot be expressed
//! and are dropped, so containers running under this backend carry a
//! capability-degraded marker.
//!
//! The filter is built from the security level and the presence of
//! network rules, and is installed by the container child immediately
//! before exec. Once applied it cannot be removed or relaxed.

use super::{Policy, PolicyBackend, PolicyHandle, PolicyMetrics, SecurityLevel};
use crate::error::Result;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Policy backend enforcing only the syscall dimension.
pub struct SeccompPolicyBackend {
    populate_ok: AtomicU64,
    cleanup_ok: AtomicU64,
    last_populate_micros: AtomicU64,
}

impl SeccompPolicyBackend {
    pub fn new() -> Self {
        Self {
            populate_ok: AtomicU64::new(0),
            cleanup_ok: AtomicU64::new(0),
            last_populate_micros: AtomicU64::new(0),
        }
    }
}

impl Default for SeccompPolicyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyBackend for SeccompPolicyBackend {
    fn name(&self) -> &str {
        "seccomp"
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn populate(&self, cgroup_id: u64, policy: &Policy, _rootfs: &Path) -> Result<PolicyHandle> {
        let started = std::time::Instant::now();

        // Filesystem rules have no seccomp expression.
        let dropped = policy.fs_rules.len();
        if dropped > 0 {
            warn!(
                "seccomp fallback drops {} filesystem rule(s) for cgroup {}",
                dropped, cgroup_id
            );
        }

        self.populate_ok.fetch_add(1, Ordering::Relaxed);
        self.last_populate_micros
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        debug!(
            "seccomp policy for cgroup {}: level {:?}, network {}",
            cgroup_id,
            policy.level,
            if policy.net_rules.is_empty() {
                "blocked"
            } else {
                "allowed"
            }
        );

        Ok(PolicyHandle {
            cgroup_id,
            fs_entries: 0,
            net_entries: policy.net_rules.len(),
            dropped_rules: dropped,
            degraded: true,
        })
    }

    fn cleanup(&self, _cgroup_id: u64) -> Result<usize> {
        // The filter dies with the container's processes.
        self.cleanup_ok.fetch_add(1, Ordering::Relaxed);
        Ok(0)
    }

    fn metrics(&self) -> PolicyMetrics {
        PolicyMetrics {
            total_entries: 0,
            populate_ok: self.populate_ok.load(Ordering::Relaxed),
            populate_failed: 0,
            cleanup_ok: self.cleanup_ok.load(Ordering::Relaxed),
            cleanup_failed: 0,
            last_populate_micros: self.last_populate_micros.load(Ordering::Relaxed),
            last_cleanup_micros: 0,
        }
    }
}

// =============================================================================
// Filter Construction (Linux)
// =============================================================================

// Syscall numbers for x86_64 Linux; see /usr/include/asm/unistd_64.h.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod syscall {
    // System control
    pub const REBOOT: i64 = 169;
    pub const KEXEC_LOAD: i64 = 246;
    pub const KEXEC_FILE_LOAD: i64 = 320;

    // Kernel modules
    pub const INIT_MODULE: i64 = 175;
    pub const DELETE_MODULE: i64 = 176;
    pub const FINIT_MODULE: i64 = 313;

    // Filesystem escape
    pub const PIVOT_ROOT: i64 = 155;
    pub const CHROOT: i64 = 161;
    pub const MOUNT: i64 = 165;
    pub const UMOUNT2: i64 = 166;

    // Process introspection
    pub const PTRACE: i64 = 101;
    pub const PROCESS_VM_READV: i64 = 310;
    pub const PROCESS_VM_WRITEV: i64 = 311;

    // Network
    pub const SOCKET: i64 = 41;
    pub const CONNECT: i64 = 42;
    pub const ACCEPT: i64 = 43;
    pub const SENDTO: i64 = 44;
    pub const BIND: i64 = 49;
    pub const LISTEN: i64 = 50;
    pub const SOCKETPAIR: i64 = 53;
    pub const ACCEPT4: i64 = 288;

    // Nested process creation
    pub const FORK: i64 = 57;
    pub const VFORK: i64 = 58;
    pub const CLONE: i64 = 56;
    pub const CLONE3: i64 = 435;
}

/// Syscalls blocked for a policy, before compilation.
///
/// Network syscalls are blocked only when the policy declares no network
/// rules; with rules present the kernel-side tuple checks are
/// unavailable here, so the whole family is allowed (lossy fallback).
/// `execve` is never blocked: the filter is installed before the payload
/// exec, which still has to run.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn blocked_syscalls(policy: &Policy) -> Vec<i64> {
    use syscall::*;

    let mut blocked = vec![
        REBOOT,
        KEXEC_LOAD,
        KEXEC_FILE_LOAD,
        INIT_MODULE,
        DELETE_MODULE,
        FINIT_MODULE,
        PIVOT_ROOT,
        CHROOT,
        MOUNT,
        UMOUNT2,
    ];

    if policy.net_rules.is_empty() {
        blocked.extend([
            SOCKET, CONNECT, ACCEPT, SENDTO, BIND, LISTEN, SOCKETPAIR, ACCEPT4,
        ]);
    }

    if matches!(
        policy.level,
        SecurityLevel::Restricted | SecurityLevel::Strict
    ) {
        blocked.extend([PTRACE, PROCESS_VM_READV, PROCESS_VM_WRITEV]);
    }

    if matches!(policy.level, SecurityLevel::Strict) {
        blocked.extend([FORK, VFORK, CLONE, CLONE3]);
    }

    blocked
}

/// Compiles the filter for `policy` into a loadable BPF program.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn build_filter(policy: &Policy) -> Result<seccompiler::BpfProgram> {
    use crate::error::Error;
    use seccompiler::{SeccompAction, SeccompFilter, SeccompRule, TargetArch};
    use std::collections::BTreeMap;

    let rules: BTreeMap<i64, Vec<SeccompRule>> = blocked_syscalls(policy)
        .into_iter()
        .map(|nr| (nr, vec![]))
        .collect();

    let filter = SeccompFilter::new(
        rules,
        // No rule matched: allow.
        SeccompAction::Allow,
        // Blocked syscall: fail with EPERM rather than killing, so the
        // payload sees `permission-denied`.
        SeccompAction::Errno(libc::EPERM as u32),
        TargetArch::x86_64,
    )
    .map_err(|e| Error::PolicyInvalid(format!("seccomp filter: {}", e)))?;

    filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| {
            Error::PolicyInvalid(format!("seccomp compile: {}", e))
        })
}

/// Installs the compiled filter on the current thread.
///
/// Must run in the container child after the namespace setup and before
/// exec; irreversible once applied.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn apply_filter(program: &seccompiler::BpfProgram) -> Result<()> {
    use crate::error::Error;
    seccompiler::apply_filter(program)
        .map_err(|e| Error::PolicyInvalid(format!("seccomp apply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{NetAllowMask, NetFamily, NetRule, NetSocketType};

    #[test]
    fn test_populate_marks_degraded() {
        let backend = SeccompPolicyBackend::new();
        let policy = Policy::deny_all(SecurityLevel::Default)
            .allow_fs("/opt/pkg", crate::policy::AccessMask::READ);
        let handle = backend
            .populate(3, &policy, Path::new("/nonexistent"))
            .unwrap();
        assert!(handle.degraded);
        assert_eq!(handle.fs_entries, 0);
        assert_eq!(handle.dropped_rules, 1);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_block_list_scales_with_level() {
        let base = Policy::deny_all(SecurityLevel::Default);
        let restricted = Policy::deny_all(SecurityLevel::Restricted);
        let strict = Policy::deny_all(SecurityLevel::Strict);

        let n_base = blocked_syscalls(&base).len();
        let n_restricted = blocked_syscalls(&restricted).len();
        let n_strict = blocked_syscalls(&strict).len();
        assert!(n_base < n_restricted);
        assert!(n_restricted < n_strict);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_net_rules_unblock_sockets() {
        let closed = Policy::deny_all(SecurityLevel::Default);
        let open = Policy::deny_all(SecurityLevel::Default).allow_net(NetRule {
            family: NetFamily::Inet,
            socket_type: NetSocketType::Stream,
            protocol: None,
            port: Some(443),
            address: None,
            allow: NetAllowMask::CLIENT,
        });
        assert!(blocked_syscalls(&closed).contains(&syscall::SOCKET));
        assert!(!blocked_syscalls(&open).contains(&syscall::SOCKET));
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_filter_compiles() {
        let policy = Policy::deny_all(SecurityLevel::Strict);
        let program = build_filter(&policy).unwrap();
        assert!(!program.is_empty());
    }
}
