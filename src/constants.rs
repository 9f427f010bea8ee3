//! # Chef Runtime Constants
//!
//! Defines resource limits, timeouts, and the on-disk layout for the chef
//! subsystems. These constants are the single source of truth for bounds
//! used throughout the codebase.
//!
//! ## Cross-References
//!
//! - [`crate::pack`]: uses size limits for content-pack extraction
//! - [`crate::layer`]: uses layer-count limits for composition
//! - [`crate::policy`]: uses the pinned map paths and entry limits
//! - [`crate::install`]: uses the filesystem layout and retry bounds
//! - [`crate::build`]: uses scratch sizing and queue limits

use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum container identifier length in bytes.
pub const MAX_CONTAINER_ID_LEN: usize = 63;

/// Maximum live containers per host.
pub const MAX_CONTAINERS: usize = 256;

/// Maximum layers in a single composition.
pub const MAX_LAYERS: usize = 64;

/// Maximum size of a single compressed content pack (512 MiB).
///
/// Validated before extraction starts; oversized packs are rejected whole.
pub const MAX_PACK_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total extracted size of a content pack (4 GiB).
///
/// Enforced during tar extraction, accumulating across entries, so a small
/// compressed pack cannot expand without bound.
pub const MAX_PACK_EXTRACTED_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of entries extracted from one content pack.
pub const MAX_PACK_ENTRIES: usize = 100_000;

/// Default size cap for a build scratch tmpfs (8 GiB).
pub const DEFAULT_SCRATCH_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Maximum queued build requests per builder.
pub const MAX_BUILD_QUEUE: usize = 32;

// =============================================================================
// Timeouts and Retry Bounds
// =============================================================================

/// Grace period between SIGTERM and SIGKILL during container teardown.
pub const DESTROY_GRACE: Duration = Duration::from_secs(5);

/// How long the parent waits for the in-namespace child to report ready.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum download retry attempts before an install transaction fails.
pub const DOWNLOAD_RETRY_MAX: u32 = 3;

/// Base backoff between download retries; doubles per attempt.
pub const DOWNLOAD_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Backoff ceiling for download retries.
pub const DOWNLOAD_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);

// =============================================================================
// Kernel-Side Layout
// =============================================================================

/// Pin path of the filesystem policy map, keyed by (cgroup, dev, ino).
pub const FS_POLICY_MAP_PIN: &str = "/sys/fs/bpf/chef/fs_policy";

/// Pin path of the network policy map, keyed by (cgroup, tuple).
pub const NET_POLICY_MAP_PIN: &str = "/sys/fs/bpf/chef/net_policy";

/// Maximum entries the pinned policy maps hold; populates beyond this
/// fail with `resource-exhausted`.
pub const POLICY_MAP_MAX_ENTRIES: u32 = 8192;

/// Cgroup v2 subtree under which container cgroups are created.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup/chef";

// =============================================================================
// Transaction Identifiers
// =============================================================================

/// Reserved transaction id; `create` returns it on admission failure and
/// never allocates it to a live transaction.
pub const RESERVED_TX_ID: u64 = 0;

// =============================================================================
// Filesystem Layout
// =============================================================================

/// Value exported as `CHEF_HOME` by the profile shim.
pub const CHEF_HOME: &str = "/chef";

/// Resolved filesystem conventions for a host.
///
/// All paths relocate below `SNAP_COMMON` when the installer runs under a
/// confinement wrapper; scratch allocation honours `TMPDIR`.
///
/// | Purpose            | Path                                            |
/// |--------------------|-------------------------------------------------|
/// | Package mounts     | `/var/chef/mnt/<publisher>-<package>`           |
/// | Package archives   | `/var/chef/packs/<publisher>-<package>.pack`    |
/// | Per-revision data  | `/usr/share/chef/<publisher>-<package>/<rev>`   |
/// | Command wrappers   | `/chef/bin/<command>`                           |
/// | Profile shim       | `/etc/profile.d/chef.sh`                        |
#[derive(Debug, Clone)]
pub struct Paths {
    prefix: Option<PathBuf>,
}

impl Paths {
    /// Resolves the layout from the process environment.
    pub fn from_env() -> Self {
        let prefix = std::env::var_os("SNAP_COMMON")
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty());
        Self { prefix }
    }

    /// Layout rooted below an explicit prefix (tests, confinement).
    pub fn with_prefix(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    /// Host-root layout with no relocation.
    pub fn host() -> Self {
        Self { prefix: None }
    }

    fn rooted(&self, absolute: &str) -> PathBuf {
        match &self.prefix {
            Some(prefix) => prefix.join(absolute.trim_start_matches('/')),
            None => PathBuf::from(absolute),
        }
    }

    /// Mount point for an installed package.
    pub fn mount_point(&self, publisher: &str, package: &str) -> PathBuf {
        self.rooted("/var/chef/mnt")
            .join(format!("{}-{}", publisher, package))
    }

    /// On-disk location of a downloaded package archive.
    pub fn pack_path(&self, publisher: &str, package: &str) -> PathBuf {
        self.rooted("/var/chef/packs")
            .join(format!("{}-{}.pack", publisher, package))
    }

    /// Per-revision data directory.
    pub fn revision_dir(&self, publisher: &str, package: &str, revision: u64) -> PathBuf {
        self.rooted("/usr/share/chef")
            .join(format!("{}-{}", publisher, package))
            .join(revision.to_string())
    }

    /// Wrapper path for an exported command.
    pub fn wrapper_path(&self, command: &str) -> PathBuf {
        self.rooted("/chef/bin").join(command)
    }

    /// Directory holding command wrappers.
    pub fn wrapper_dir(&self) -> PathBuf {
        self.rooted("/chef/bin")
    }

    /// Profile shim exporting `CHEF_HOME` and extending `PATH`.
    pub fn profile_shim(&self) -> PathBuf {
        self.rooted("/etc/profile.d/chef.sh")
    }

    /// State root for the installer's persisted document and logs.
    pub fn state_root(&self) -> PathBuf {
        self.rooted("/var/chef/state")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Root under which build scratch storage is allocated.
///
/// Honours `TMPDIR`; falls back to `/tmp`.
pub fn scratch_root() -> PathBuf {
    std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Default work root for container scratch trees.
///
/// `/var/lib/chef/containers` when writable (daemons running as root),
/// a home-relative tree otherwise.
pub fn default_work_root() -> PathBuf {
    let system = PathBuf::from("/var/lib/chef/containers");
    if std::fs::create_dir_all(&system).is_ok() {
        return system;
    }
    dirs::home_dir()
        .map(|home| home.join(".chef").join("containers"))
        .unwrap_or(system)
}

// =============================================================================
// Validation Helpers
// =============================================================================

/// Validates a container identifier.
///
/// Identifiers are short strings: 1..=[`MAX_CONTAINER_ID_LEN`] characters
/// drawn from `[a-zA-Z0-9._-]`, not starting with `.` or `-`.
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container id is empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container id too long");
    }
    if id.starts_with('.') || id.starts_with('-') {
        return Err("container id must not start with '.' or '-'");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err("container id contains invalid characters");
    }
    Ok(())
}

/// Splits a `publisher/package` name into exactly two non-empty components.
pub fn split_package_name(name: &str) -> std::result::Result<(&str, &str), &'static str> {
    let mut parts = name.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(publisher), Some(package), None) if !publisher.is_empty() && !package.is_empty() => {
            Ok((publisher, package))
        }
        _ => Err("package name must be 'publisher/package'"),
    }
}

/// Returns true when a relative path stays inside the tree it is joined
/// to after lexical normalization. Used before copying files across the
/// container boundary.
pub fn path_is_confined(path: &Path) -> bool {
    use std::path::Component;
    let mut depth = 0i32;
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::RootDir | Component::Prefix(_) => return false,
            Component::CurDir => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_container_id() {
        assert!(validate_container_id("build-a1").is_ok());
        assert!(validate_container_id("acme-hello.7").is_ok());
        assert!(validate_container_id("").is_err());
        assert!(validate_container_id(".hidden").is_err());
        assert!(validate_container_id("-flag").is_err());
        assert!(validate_container_id("has space").is_err());
        assert!(validate_container_id(&"x".repeat(MAX_CONTAINER_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_split_package_name() {
        assert_eq!(split_package_name("acme/hello"), Ok(("acme", "hello")));
        assert!(split_package_name("acme").is_err());
        assert!(split_package_name("acme/hello/extra").is_err());
        assert!(split_package_name("/hello").is_err());
        assert!(split_package_name("acme/").is_err());
    }

    #[test]
    fn test_paths_host_layout() {
        let paths = Paths::host();
        assert_eq!(
            paths.mount_point("acme", "hello"),
            PathBuf::from("/var/chef/mnt/acme-hello")
        );
        assert_eq!(
            paths.pack_path("acme", "hello"),
            PathBuf::from("/var/chef/packs/acme-hello.pack")
        );
        assert_eq!(
            paths.revision_dir("acme", "hello", 7),
            PathBuf::from("/usr/share/chef/acme-hello/7")
        );
        assert_eq!(
            paths.wrapper_path("hello"),
            PathBuf::from("/chef/bin/hello")
        );
    }

    #[test]
    fn test_paths_relocated_layout() {
        let paths = Paths::with_prefix("/var/snap/chef/common");
        assert_eq!(
            paths.mount_point("acme", "hello"),
            PathBuf::from("/var/snap/chef/common/var/chef/mnt/acme-hello")
        );
        assert_eq!(
            paths.profile_shim(),
            PathBuf::from("/var/snap/chef/common/etc/profile.d/chef.sh")
        );
    }

    #[test]
    fn test_path_is_confined() {
        assert!(path_is_confined(Path::new("out/pkg.pack")));
        assert!(path_is_confined(Path::new("a/../b")));
        assert!(!path_is_confined(Path::new("../escape")));
        assert!(!path_is_confined(Path::new("/absolute")));
        assert!(!path_is_confined(Path::new("a/../../escape")));
    }
}
