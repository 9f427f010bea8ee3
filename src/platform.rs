//! Platform detection and capability enumeration.
//!
//! Detects OS, architecture, and available kernel surfaces at runtime to
//! select the container and policy backends, and carries the architecture
//! enum used on the wire between builders and the broker.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Kernel version (if detectable).
    pub kernel_version: Option<String>,
    /// Available capabilities.
    pub capabilities: HashSet<Capability>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Windows,
    Unknown,
}

/// CPU architecture, as carried on the wire.
///
/// The discriminants are stable protocol values; [`Arch::bit`] gives the
/// position used in builder architecture masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86,
    X64,
    Armhf,
    Arm64,
    Riscv64,
}

impl Arch {
    /// All wire architectures, in protocol order.
    pub const ALL: [Arch; 5] = [Arch::X86, Arch::X64, Arch::Armhf, Arch::Arm64, Arch::Riscv64];

    /// Bit position of this architecture in a builder mask.
    pub const fn bit(self) -> u32 {
        match self {
            Self::X86 => 1 << 0,
            Self::X64 => 1 << 1,
            Self::Armhf => 1 << 2,
            Self::Arm64 => 1 << 3,
            Self::Riscv64 => 1 << 4,
        }
    }

    /// Parses a wire architecture name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "x86" => Some(Self::X86),
            "x64" => Some(Self::X64),
            "armhf" => Some(Self::Armhf),
            "arm64" => Some(Self::Arm64),
            "riscv64" => Some(Self::Riscv64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
            Self::Armhf => "armhf",
            Self::Arm64 => "arm64",
            Self::Riscv64 => "riscv64",
        };
        write!(f, "{}", s)
    }
}

/// Set of architectures a builder serves, packed as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArchMask(pub u32);

impl ArchMask {
    /// The empty mask.
    pub const EMPTY: ArchMask = ArchMask(0);

    /// Mask containing a single architecture.
    pub const fn single(arch: Arch) -> Self {
        ArchMask(arch.bit())
    }

    /// Adds an architecture to the mask.
    pub fn with(self, arch: Arch) -> Self {
        ArchMask(self.0 | arch.bit())
    }

    /// Returns true if the mask declares `arch`.
    pub const fn contains(self, arch: Arch) -> bool {
        self.0 & arch.bit() != 0
    }

    /// Returns true if the mask declares nothing.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Architectures present in the mask, in protocol order.
    pub fn architectures(self) -> Vec<Arch> {
        Arch::ALL
            .into_iter()
            .filter(|a| self.contains(*a))
            .collect()
    }
}

impl std::fmt::Display for ArchMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.architectures().iter().map(|a| a.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

/// Kernel surfaces that affect backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Linux namespaces (pid, net, mnt, uts, ipc).
    Namespaces,
    /// Unified cgroup v2 hierarchy.
    CgroupsV2,
    /// Seccomp syscall filtering.
    Seccomp,
    /// BPF LSM hooks registered; pinned policy maps are usable.
    BpfLsm,
    /// Overlay filesystem support for layer composition.
    Overlayfs,
}

impl Platform {
    /// Detects the current platform and its capabilities.
    pub fn detect() -> Self {
        let os = Self::detect_os();
        let arch = Self::detect_arch();
        let kernel_version = Self::detect_kernel_version();
        let capabilities = Self::detect_capabilities(os);

        Self {
            os,
            arch,
            kernel_version,
            capabilities,
        }
    }

    /// Returns true if the capability is available.
    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "windows")))]
        return Os::Unknown;
    }

    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86")]
        return Arch::X86;

        #[cfg(target_arch = "x86_64")]
        return Arch::X64;

        #[cfg(target_arch = "arm")]
        return Arch::Armhf;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "riscv64")]
        return Arch::Riscv64;

        #[cfg(not(any(
            target_arch = "x86",
            target_arch = "x86_64",
            target_arch = "arm",
            target_arch = "aarch64",
            target_arch = "riscv64"
        )))]
        return Arch::X64;
    }

    fn detect_kernel_version() -> Option<String> {
        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("uname")
                .arg("-r")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
        }

        #[cfg(not(unix))]
        None
    }

    fn detect_capabilities(os: Os) -> HashSet<Capability> {
        let mut caps = HashSet::new();

        if os != Os::Linux {
            return caps;
        }

        if Path::new("/proc/self/ns/pid").exists() {
            caps.insert(Capability::Namespaces);
        }

        if Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            caps.insert(Capability::CgroupsV2);
        }

        if Path::new("/proc/sys/kernel/seccomp").exists() {
            caps.insert(Capability::Seccomp);
        }

        // BPF LSM is active when "bpf" appears in the booted LSM list.
        if let Ok(lsms) = std::fs::read_to_string("/sys/kernel/security/lsm")
            && lsms.split(',').any(|l| l.trim() == "bpf")
        {
            caps.insert(Capability::BpfLsm);
        }

        if let Ok(filesystems) = std::fs::read_to_string("/proc/filesystems")
            && filesystems.lines().any(|l| l.trim().ends_with("overlay"))
        {
            caps.insert(Capability::Overlayfs);
        }

        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_wire_names() {
        for arch in Arch::ALL {
            assert_eq!(Arch::parse(&arch.to_string()), Some(arch));
        }
        assert_eq!(Arch::parse("sparc"), None);
        let json = serde_json::to_string(&Arch::Riscv64).unwrap();
        assert_eq!(json, "\"riscv64\"");
    }

    #[test]
    fn test_arch_mask() {
        let mask = ArchMask::EMPTY.with(Arch::X64).with(Arch::Arm64);
        assert!(mask.contains(Arch::X64));
        assert!(mask.contains(Arch::Arm64));
        assert!(!mask.contains(Arch::Riscv64));
        assert_eq!(mask.architectures(), vec![Arch::X64, Arch::Arm64]);
        assert_eq!(mask.to_string(), "x64,arm64");
        assert!(ArchMask::EMPTY.is_empty());
    }

    #[test]
    fn test_arch_bits_distinct() {
        let mut seen = 0u32;
        for arch in Arch::ALL {
            assert_eq!(seen & arch.bit(), 0);
            seen |= arch.bit();
        }
    }

    #[test]
    fn test_detect_reports_something() {
        let platform = Platform::detect();
        #[cfg(target_os = "linux")]
        assert_eq!(platform.os, Os::Linux);
        let _ = platform.capabilities;
    }
}
