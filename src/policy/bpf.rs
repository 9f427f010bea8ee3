//! # Pinned BPF Policy Maps
//!
//! User-space side of the BPF-LSM enforcement path. The kernel program
//! (loaded at boot, outside this crate) hooks file-open and socket
//! operations, derives the caller's cgroup identity, and consults two
//! pinned hash maps:
//!
//! | Pin                              | Key                       | Value        |
//! |----------------------------------|---------------------------|--------------|
//! | `/sys/fs/bpf/chef/fs_policy`     | (cgroup, dev, ino)        | access mask  |
//! | `/sys/fs/bpf/chef/net_policy`    | (cgroup, packed tuple)    | allow mask   |
//!
//! This backend owns the map lifecycle: open-by-pin at startup, one
//! update per resolved rule during populate, and a full-scan delete of a
//! container's keys during cleanup. Entries for a live container exist in
//! the map iff the container is in state created or running.
//!
//! Map mutations are individually atomic; concurrent populates for
//! different containers interleave safely without a process lock.

use super::{
    NetFamily, NetRule, NetSocketType, Policy, PolicyBackend, PolicyHandle, PolicyMetrics,
    resolve_fs_rules,
};
use crate::error::{Error, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Map Key Layout (shared with the kernel program)
// =============================================================================

/// Key of the filesystem policy map.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsPolicyKey {
    pub cgroup: u64,
    pub dev: u64,
    pub ino: u64,
}

/// Key of the network policy map.
///
/// For `inet`/`inet6` rules `addr` holds the address bytes; for `unix`
/// rules it holds the first 16 bytes of the SHA-256 of the socket path,
/// which is what the kernel program computes on its side.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetPolicyKey {
    pub cgroup: u64,
    pub family: u16,
    pub socket_type: u16,
    pub protocol: u8,
    pub _pad: u8,
    pub port: u16,
    pub addr: [u8; 16],
}

impl NetPolicyKey {
    /// Packs a declarative rule under a cgroup key.
    pub fn from_rule(cgroup: u64, rule: &NetRule) -> Self {
        let family = match rule.family {
            NetFamily::Unix => libc::AF_UNIX as u16,
            NetFamily::Inet => libc::AF_INET as u16,
            NetFamily::Inet6 => libc::AF_INET6 as u16,
        };
        let socket_type = match rule.socket_type {
            NetSocketType::Stream => libc::SOCK_STREAM as u16,
            NetSocketType::Dgram => libc::SOCK_DGRAM as u16,
        };

        let mut addr = [0u8; 16];
        if let Some(text) = &rule.address {
            match rule.family {
                NetFamily::Unix => {
                    use sha2::{Digest, Sha256};
                    let digest = Sha256::digest(text.as_bytes());
                    addr.copy_from_slice(&digest[..16]);
                }
                NetFamily::Inet => {
                    if let Ok(v4) = text.parse::<std::net::Ipv4Addr>() {
                        addr[..4].copy_from_slice(&v4.octets());
                    }
                }
                NetFamily::Inet6 => {
                    if let Ok(v6) = text.parse::<std::net::Ipv6Addr>() {
                        addr.copy_from_slice(&v6.octets());
                    }
                }
            }
        }

        Self {
            cgroup,
            family,
            socket_type,
            protocol: rule.protocol.unwrap_or(0),
            _pad: 0,
            port: rule.port.unwrap_or(0),
            addr,
        }
    }
}

// =============================================================================
// Linux Implementation
// =============================================================================

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::constants::{FS_POLICY_MAP_PIN, NET_POLICY_MAP_PIN};
    use std::ffi::CString;
    use std::io;
    use std::os::unix::io::RawFd;
    use tracing::{debug, warn};

    const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
    const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
    const BPF_MAP_DELETE_ELEM: libc::c_long = 3;
    const BPF_MAP_GET_NEXT_KEY: libc::c_long = 4;
    const BPF_OBJ_GET: libc::c_long = 7;

    /// Create-or-update flag for map updates.
    const BPF_ANY: u64 = 0;

    /// `bpf_attr` as used by map element commands.
    #[repr(C)]
    #[derive(Default)]
    struct MapElemAttr {
        map_fd: u32,
        _pad: u32,
        key: u64,
        value_or_next_key: u64,
        flags: u64,
    }

    /// `bpf_attr` as used by `BPF_OBJ_GET`.
    #[repr(C)]
    #[derive(Default)]
    struct ObjGetAttr {
        pathname: u64,
        bpf_fd: u32,
        file_flags: u32,
    }

    fn sys_bpf<T>(cmd: libc::c_long, attr: &mut T) -> io::Result<i64> {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                cmd,
                attr as *mut T as *mut libc::c_void,
                std::mem::size_of::<T>() as u32,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc)
        }
    }

    fn obj_get(pin: &str) -> io::Result<RawFd> {
        let path = CString::new(pin).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut attr = ObjGetAttr {
            pathname: path.as_ptr() as u64,
            ..Default::default()
        };
        sys_bpf(BPF_OBJ_GET, &mut attr).map(|fd| fd as RawFd)
    }

    fn map_update<K, V>(fd: RawFd, key: &K, value: &V) -> io::Result<()> {
        let mut attr = MapElemAttr {
            map_fd: fd as u32,
            key: key as *const K as u64,
            value_or_next_key: value as *const V as u64,
            flags: BPF_ANY,
            ..Default::default()
        };
        sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr).map(|_| ())
    }

    fn map_delete<K>(fd: RawFd, key: &K) -> io::Result<()> {
        let mut attr = MapElemAttr {
            map_fd: fd as u32,
            key: key as *const K as u64,
            ..Default::default()
        };
        sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr).map(|_| ())
    }

    /// First key when `key` is `None`, successor otherwise; `None` at the
    /// end of the map.
    fn map_next_key<K: Copy + Default>(fd: RawFd, key: Option<&K>) -> io::Result<Option<K>> {
        let mut next = K::default();
        let mut attr = MapElemAttr {
            map_fd: fd as u32,
            key: key.map(|k| k as *const K as u64).unwrap_or(0),
            value_or_next_key: &mut next as *mut K as u64,
            ..Default::default()
        };
        match sys_bpf(BPF_MAP_GET_NEXT_KEY, &mut attr) {
            Ok(_) => Ok(Some(next)),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn is_saturation(e: &io::Error) -> bool {
        matches!(
            e.raw_os_error(),
            Some(libc::E2BIG) | Some(libc::ENOSPC) | Some(libc::ENOMEM)
        )
    }

    /// Policy backend writing the pinned BPF-LSM maps.
    pub struct BpfPolicyBackend {
        fs_map: Option<RawFd>,
        net_map: Option<RawFd>,
        populate_ok: AtomicU64,
        populate_failed: AtomicU64,
        cleanup_ok: AtomicU64,
        cleanup_failed: AtomicU64,
        last_populate_micros: AtomicU64,
        last_cleanup_micros: AtomicU64,
    }

    impl BpfPolicyBackend {
        /// Opens the pinned maps; the backend is unavailable when either
        /// pin is missing (kernel program not loaded).
        pub fn new() -> Self {
            let fs_map = obj_get(FS_POLICY_MAP_PIN)
                .map_err(|e| debug!("fs policy map pin unavailable: {}", e))
                .ok();
            let net_map = obj_get(NET_POLICY_MAP_PIN)
                .map_err(|e| debug!("net policy map pin unavailable: {}", e))
                .ok();
            Self {
                fs_map,
                net_map,
                populate_ok: AtomicU64::new(0),
                populate_failed: AtomicU64::new(0),
                cleanup_ok: AtomicU64::new(0),
                cleanup_failed: AtomicU64::new(0),
                last_populate_micros: AtomicU64::new(0),
                last_cleanup_micros: AtomicU64::new(0),
            }
        }

        fn count_entries(&self) -> u64 {
            let mut total = 0u64;
            if let Some(fd) = self.fs_map {
                let mut cursor: Option<FsPolicyKey> = None;
                while let Ok(Some(next)) = map_next_key(fd, cursor.as_ref()) {
                    total += 1;
                    cursor = Some(next);
                }
            }
            if let Some(fd) = self.net_map {
                let mut cursor: Option<NetPolicyKey> = None;
                while let Ok(Some(next)) = map_next_key(fd, cursor.as_ref()) {
                    total += 1;
                    cursor = Some(next);
                }
            }
            total
        }
    }

    impl Default for BpfPolicyBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for BpfPolicyBackend {
        fn drop(&mut self) {
            for fd in [self.fs_map.take(), self.net_map.take()].into_iter().flatten() {
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }

    impl PolicyBackend for BpfPolicyBackend {
        fn name(&self) -> &str {
            "bpf-lsm"
        }

        fn is_available(&self) -> bool {
            self.fs_map.is_some() && self.net_map.is_some()
        }

        fn populate(
            &self,
            cgroup_id: u64,
            policy: &Policy,
            rootfs: &Path,
        ) -> Result<PolicyHandle> {
            let started = std::time::Instant::now();
            let (fs_fd, net_fd) = match (self.fs_map, self.net_map) {
                (Some(fs), Some(net)) => (fs, net),
                _ => {
                    self.populate_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::PolicyInvalid(
                        "pinned policy maps are not available".into(),
                    ));
                }
            };

            let (resolved, mut dropped) = resolve_fs_rules(&policy.fs_rules, rootfs);

            let mut fs_entries = 0usize;
            for rule in &resolved {
                let key = FsPolicyKey {
                    cgroup: cgroup_id,
                    dev: rule.dev,
                    ino: rule.ino,
                };
                let value: u32 = rule.access.0;
                match map_update(fs_fd, &key, &value) {
                    Ok(()) => fs_entries += 1,
                    Err(e) if is_saturation(&e) => {
                        self.populate_failed.fetch_add(1, Ordering::Relaxed);
                        // Leave already-written entries for cleanup by the
                        // caller's destroy path.
                        return Err(Error::ResourceExhausted(format!(
                            "fs policy map has no free slot: {}",
                            e
                        )));
                    }
                    Err(e) => {
                        warn!(
                            "dropping fs policy entry (dev {}, ino {}): {}",
                            rule.dev, rule.ino, e
                        );
                        dropped += 1;
                    }
                }
            }

            let mut net_entries = 0usize;
            for rule in &policy.net_rules {
                let key = NetPolicyKey::from_rule(cgroup_id, rule);
                let value: u32 = rule.allow.0;
                match map_update(net_fd, &key, &value) {
                    Ok(()) => net_entries += 1,
                    Err(e) if is_saturation(&e) => {
                        self.populate_failed.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::ResourceExhausted(format!(
                            "net policy map has no free slot: {}",
                            e
                        )));
                    }
                    Err(e) => {
                        warn!("dropping net policy entry: {}", e);
                        dropped += 1;
                    }
                }
            }

            self.populate_ok.fetch_add(1, Ordering::Relaxed);
            self.last_populate_micros
                .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);

            debug!(
                "populated {} fs + {} net map entries for cgroup {} ({} dropped)",
                fs_entries, net_entries, cgroup_id, dropped
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
            let mut removed = 0usize;

            if let Some(fd) = self.fs_map {
                let mut doomed = Vec::new();
                let mut cursor: Option<FsPolicyKey> = None;
                while let Ok(Some(next)) = map_next_key(fd, cursor.as_ref()) {
                    if next.cgroup == cgroup_id {
                        doomed.push(next);
                    }
                    cursor = Some(next);
                }
                for key in doomed {
                    match map_delete(fd, &key) {
                        Ok(()) => removed += 1,
                        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                        Err(e) => {
                            self.cleanup_failed.fetch_add(1, Ordering::Relaxed);
                            return Err(Error::Internal(format!(
                                "fs policy map delete failed: {}",
                                e
                            )));
                        }
                    }
                }
            }

            if let Some(fd) = self.net_map {
                let mut doomed = Vec::new();
                let mut cursor: Option<NetPolicyKey> = None;
                while let Ok(Some(next)) = map_next_key(fd, cursor.as_ref()) {
                    if next.cgroup == cgroup_id {
                        doomed.push(next);
                    }
                    cursor = Some(next);
                }
                for key in doomed {
                    match map_delete(fd, &key) {
                        Ok(()) => removed += 1,
                        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                        Err(e) => {
                            self.cleanup_failed.fetch_add(1, Ordering::Relaxed);
                            return Err(Error::Internal(format!(
                                "net policy map delete failed: {}",
                                e
                            )));
                        }
                    }
                }
            }

            self.cleanup_ok.fetch_add(1, Ordering::Relaxed);
            self.last_cleanup_micros
                .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
            debug!("removed {} map entries for cgroup {}", removed, cgroup_id);
            Ok(removed)
        }

        fn metrics(&self) -> PolicyMetrics {
            PolicyMetrics {
                total_entries: self.count_entries(),
                populate_ok: self.populate_ok.load(Ordering::Relaxed),
                populate_failed: self.populate_failed.load(Ordering::Relaxed),
                cleanup_ok: self.cleanup_ok.load(Ordering::Relaxed),
                cleanup_failed: self.cleanup_failed.load(Ordering::Relaxed),
                last_populate_micros: self.last_populate_micros.load(Ordering::Relaxed),
                last_cleanup_micros: self.last_cleanup_micros.load(Ordering::Relaxed),
            }
        }
    }
}

// =============================================================================
// Non-Linux Stub
// =============================================================================

#[cfg(not(target_os = "linux"))]
mod stub {
    use super::*;

    /// Stub backend for non-Linux platforms; never available.
    pub struct BpfPolicyBackend {
        _private: (),
    }

    impl BpfPolicyBackend {
        pub fn new() -> Self {
            Self { _private: () }
        }
    }

    impl Default for BpfPolicyBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PolicyBackend for BpfPolicyBackend {
        fn name(&self) -> &str {
            "bpf-lsm"
        }

        fn is_available(&self) -> bool {
            false
        }

        fn populate(
            &self,
            _cgroup_id: u64,
            _policy: &Policy,
            _rootfs: &Path,
        ) -> Result<PolicyHandle> {
            Err(Error::PolicyInvalid(
                "bpf-lsm policy backend requires Linux".into(),
            ))
        }

        fn cleanup(&self, _cgroup_id: u64) -> Result<usize> {
            Ok(0)
        }

        fn metrics(&self) -> PolicyMetrics {
            PolicyMetrics::default()
        }
    }
}

// =============================================================================
// Re-exports
// =============================================================================

#[cfg(target_os = "linux")]
pub use linux::BpfPolicyBackend;

#[cfg(not(target_os = "linux"))]
pub use stub::BpfPolicyBackend;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NetAllowMask;

    #[test]
    fn test_net_key_packing() {
        let rule = NetRule {
            family: NetFamily::Inet,
            socket_type: NetSocketType::Stream,
            protocol: Some(6),
            port: Some(443),
            address: Some("10.0.0.1".into()),
            allow: NetAllowMask::CLIENT,
        };
        let key = NetPolicyKey::from_rule(9, &rule);
        assert_eq!(key.cgroup, 9);
        assert_eq!(key.port, 443);
        assert_eq!(key.protocol, 6);
        assert_eq!(&key.addr[..4], &[10, 0, 0, 1]);
        assert_eq!(&key.addr[4..], &[0u8; 12]);
    }

    #[test]
    fn test_unix_rule_hashes_path() {
        let rule = NetRule {
            family: NetFamily::Unix,
            socket_type: NetSocketType::Stream,
            protocol: None,
            port: None,
            address: Some("/run/chef/cvd.sock".into()),
            allow: NetAllowMask::CLIENT,
        };
        let a = NetPolicyKey::from_rule(1, &rule);
        let b = NetPolicyKey::from_rule(1, &rule);
        assert_eq!(a, b);
        assert_ne!(a.addr, [0u8; 16]);
    }

    #[test]
    fn test_fs_key_is_plain_data() {
        assert_eq!(std::mem::size_of::<FsPolicyKey>(), 24);
        let key = FsPolicyKey {
            cgroup: 1,
            dev: 2,
            ino: 3,
        };
        let same = key;
        assert_eq!(key, same);
    }
}
