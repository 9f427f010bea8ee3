//! # Build Scratch Storage
//!
//! Each build job owns a fresh scratch tree. On Linux the tree is backed
//! by a sized tmpfs mount (mode 0700, root-owned) so a runaway build
//! cannot fill the host disk; elsewhere, and on hosts that cannot mount,
//! it degrades to a plain directory. The tree is owned exclusively by
//! its allocating job and removed on release.

use crate::constants::scratch_root;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A scratch tree for one build job.
#[derive(Debug)]
pub struct ScratchStorage {
    path: PathBuf,
    mounted: bool,
}

impl ScratchStorage {
    /// Allocates scratch for `id` with a tmpfs size cap in bytes.
    pub fn allocate(id: &str, size: u64) -> Result<Self> {
        let path = scratch_root().join(format!("chef-build-{}", id));
        if path.exists() {
            // Leftovers from a crashed job with the same id are stale;
            // detach a lingering tmpfs before clearing the tree.
            let _ = unmount_tmpfs(&path);
            let _ = fs::remove_dir_all(&path);
        }
        fs::create_dir_all(&path)?;
        set_mode_0700(&path)?;

        let mounted = match mount_tmpfs(&path, size) {
            Ok(()) => true,
            Err(Error::PermissionDenied(reason)) => {
                warn!("tmpfs for {} unavailable ({}), using plain dir", id, reason);
                false
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&path);
                return Err(e);
            }
        };

        debug!(
            "allocated scratch {} (tmpfs: {}, cap {} bytes)",
            path.display(),
            mounted,
            size
        );
        Ok(Self { path, mounted })
    }

    /// Scratch tree root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the tree is tmpfs-backed.
    pub fn is_tmpfs(&self) -> bool {
        self.mounted
    }

    /// Unmounts (when tmpfs-backed) and removes the tree.
    pub fn release(self) -> Result<()> {
        if self.mounted {
            unmount_tmpfs(&self.path)?;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(unix)]
fn set_mode_0700(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(Error::Io)
}

#[cfg(not(unix))]
fn set_mode_0700(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn mount_tmpfs(path: &Path, size: u64) -> Result<()> {
    use nix::errno::Errno;
    use nix::mount::{MsFlags, mount};

    let options = format!("size={},mode=0700,uid=0,gid=0", size);
    match mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(options.as_str()),
    ) {
        Ok(()) => Ok(()),
        Err(e @ (Errno::EPERM | Errno::EACCES)) => {
            Err(Error::PermissionDenied(e.to_string()))
        }
        Err(e) => Err(Error::Internal(format!("tmpfs mount failed: {}", e))),
    }
}

#[cfg(not(target_os = "linux"))]
fn mount_tmpfs(_path: &Path, _size: u64) -> Result<()> {
    Err(Error::PermissionDenied("tmpfs requires Linux".into()))
}

#[cfg(target_os = "linux")]
fn unmount_tmpfs(path: &Path) -> Result<()> {
    use nix::mount::{MntFlags, umount2};
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(Error::Internal(format!("tmpfs unmount failed: {}", e))),
    }
}

#[cfg(not(target_os = "linux"))]
fn unmount_tmpfs(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let scratch = ScratchStorage::allocate("test-scratch-a", 1024 * 1024).unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.exists());
        std::fs::write(path.join("probe"), b"x").unwrap();
        scratch.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_reallocation_clears_stale_tree() {
        let first = ScratchStorage::allocate("test-scratch-b", 1024 * 1024).unwrap();
        std::fs::write(first.path().join("stale"), b"x").unwrap();
        let path = first.path().to_path_buf();
        // Simulate a crashed job: drop without release.
        std::mem::forget(first);

        let second = ScratchStorage::allocate("test-scratch-b", 1024 * 1024).unwrap();
        assert!(!second.path().join("stale").exists());
        assert_eq!(second.path(), path);
        second.release().unwrap();
    }
}
