//! # Layer Composition
//!
//! Turns an ordered description of layers into a single composed rootfs.
//!
//! A composition stacks read-only content (a base rootfs, staged content
//! packs, host binds) under at most one writable upper directory using
//! overlayfs. Ordering is significant: for reads, the **last-listed**
//! layer holding a path wins; writes always land in the upper. With no
//! upper the rootfs is read-only and write attempts fail `read-only`.
//!
//! ```text
//! compose([base, pack-A, pack-B, upper])
//!
//!   merged  ◄─ overlay(lowerdir=pack-B:pack-A:base, upperdir=upper,
//!   rootfs              workdir=<scratch>/work)
//! ```
//!
//! Teardown unmounts in exact reverse of the mount order performed by
//! `compose`, stops the pack servers, and removes the scratch tree.
//! Partial composition failure rolls back everything already mounted
//! unless the composer was built with `keep_on_failure`.

use crate::constants::MAX_LAYERS;
use crate::error::{Error, Result};
use crate::pack::PackServer;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Layer Model
// =============================================================================

/// Source content of a single layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSource {
    /// Directory holding a base root filesystem.
    BaseRootfs(PathBuf),
    /// Content pack archive, staged through a [`PackServer`].
    ContentPack(PathBuf),
    /// Host path made visible inside the composition.
    HostBind(PathBuf),
    /// Scratch directory that receives all writes.
    WritableUpper(PathBuf),
}

/// One unit of rootfs content in a composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Where the content comes from.
    pub source: LayerSource,
    /// Mount point inside the composed rootfs; `None` stacks the layer
    /// into the overlay at `/`.
    pub target: Option<PathBuf>,
    /// Whether the layer is mounted read-only.
    pub read_only: bool,
}

impl Layer {
    /// Base rootfs directory layer.
    pub fn base(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: LayerSource::BaseRootfs(dir.into()),
            target: None,
            read_only: true,
        }
    }

    /// Content pack layer.
    pub fn pack(archive: impl Into<PathBuf>) -> Self {
        Self {
            source: LayerSource::ContentPack(archive.into()),
            target: None,
            read_only: true,
        }
    }

    /// Host bind layer.
    pub fn bind(source: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            source: LayerSource::HostBind(source.into()),
            target: None,
            read_only,
        }
    }

    /// Writable upper layer; must be listed last.
    pub fn upper(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: LayerSource::WritableUpper(dir.into()),
            target: None,
            read_only: false,
        }
    }

    /// Sets the in-rootfs mount point for this layer.
    pub fn at(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    fn source_path(&self) -> &Path {
        match &self.source {
            LayerSource::BaseRootfs(p)
            | LayerSource::ContentPack(p)
            | LayerSource::HostBind(p)
            | LayerSource::WritableUpper(p) => p,
        }
    }
}

/// A mounted composition: the composed rootfs plus its bookkeeping.
///
/// Valid while every contained layer is still mounted; the owning
/// container id is carried for diagnostics, not ownership.
#[derive(Debug)]
pub struct LayerContext {
    /// Owning container identifier.
    pub container_id: String,
    /// Composed rootfs path.
    pub rootfs: PathBuf,
    /// Upper directory, when a writable layer was supplied.
    pub upper: Option<PathBuf>,
    /// Overlay work directory sibling of the upper.
    pub work: Option<PathBuf>,
    /// True when the composition has no writable upper.
    pub read_only: bool,
    /// Layers in composition order.
    layers: Vec<Layer>,
    /// Mount targets in the order they were mounted.
    mounts: Vec<PathBuf>,
    /// Pack servers in composition order.
    servers: Vec<PackServer>,
    /// Host binds applied only inside the target mount namespace.
    deferred_binds: Vec<(PathBuf, PathBuf, bool)>,
    /// Scratch tree owned by this context.
    scratch: PathBuf,
}

impl LayerContext {
    /// Layers in composition order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Digests of the staged content packs, in composition order.
    pub fn pack_digests(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.digest().to_string()).collect()
    }

    /// Host binds that are only applied inside the target mount
    /// namespace: `(source, target, read_only)`.
    pub fn deferred_binds(&self) -> &[(PathBuf, PathBuf, bool)] {
        &self.deferred_binds
    }
}

// =============================================================================
// Composer
// =============================================================================

/// Builds and tears down layer contexts.
#[derive(Debug, Clone)]
pub struct LayerComposer {
    /// Root under which per-container scratch trees are created.
    work_root: PathBuf,
    /// Leave scratch trees behind when composition fails.
    keep_on_failure: bool,
}

impl LayerComposer {
    /// Creates a composer rooted at `work_root`.
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            keep_on_failure: false,
        }
    }

    /// Keeps scratch trees on composition failure for debugging.
    pub fn keep_on_failure(mut self, keep: bool) -> Self {
        self.keep_on_failure = keep;
        self
    }

    /// Validates `layers` and mounts them into a composed rootfs.
    pub fn compose(&self, layers: &[Layer], container_id: &str) -> Result<LayerContext> {
        validate_layers(layers)?;

        let scratch = self.work_root.join(container_id);
        fs::create_dir_all(&scratch)?;

        match self.compose_inner(layers, container_id, &scratch) {
            Ok(ctx) => Ok(ctx),
            Err(e) => {
                if !self.keep_on_failure {
                    let _ = fs::remove_dir_all(&scratch);
                } else {
                    warn!(
                        "composition for '{}' failed, keeping scratch at {}",
                        container_id,
                        scratch.display()
                    );
                }
                Err(e)
            }
        }
    }

    fn compose_inner(
        &self,
        layers: &[Layer],
        container_id: &str,
        scratch: &Path,
    ) -> Result<LayerContext> {
        let mut servers = Vec::new();
        let mut lowers = Vec::new();
        let mut deferred_binds = Vec::new();
        let mut upper = None;

        for (idx, layer) in layers.iter().enumerate() {
            match &layer.source {
                LayerSource::BaseRootfs(dir) => {
                    if !dir.is_dir() {
                        self.stop_servers(servers);
                        return Err(Error::RootfsInvalid(format!(
                            "base rootfs {} is not a directory",
                            dir.display()
                        )));
                    }
                    lowers.push(dir.clone());
                }
                LayerSource::ContentPack(archive) => {
                    let staging = scratch.join("packs").join(idx.to_string());
                    match PackServer::start(archive, &staging) {
                        Ok(server) => {
                            lowers.push(server.serve_root().to_path_buf());
                            servers.push(server);
                        }
                        Err(e) => {
                            self.stop_servers(servers);
                            return Err(e);
                        }
                    }
                }
                LayerSource::HostBind(source) => {
                    if let Some(target) = &layer.target {
                        // Only visible after entering the target mount
                        // namespace; applied by mount_in_namespace.
                        deferred_binds.push((source.clone(), target.clone(), layer.read_only));
                    } else {
                        lowers.push(source.clone());
                    }
                }
                LayerSource::WritableUpper(dir) => {
                    fs::create_dir_all(dir)?;
                    upper = Some(dir.clone());
                }
            }
        }

        let merged = scratch.join("merged");
        // The overlay work directory must live on the upper's filesystem;
        // it is created as a sibling of the upper directory.
        let work = upper.as_ref().map(|u| match u.parent() {
            Some(parent) => parent.join(format!(".work-{}", container_id)),
            None => scratch.join("work"),
        });
        fs::create_dir_all(&merged)?;
        if let Some(work) = &work {
            fs::create_dir_all(work)?;
        }

        let mut mounts = Vec::new();
        match mount_composed(&lowers, upper.as_deref(), work.as_deref(), &merged) {
            Ok(()) => mounts.push(merged.clone()),
            Err(MountError::Unavailable(reason)) => {
                // Unprivileged hosts and kernels without overlayfs fall
                // back to a copy-based merge with the same precedence.
                warn!(
                    "overlay unavailable for '{}' ({}), copying layers",
                    container_id, reason
                );
                if let Err(e) = copy_compose(&lowers, upper.as_deref(), &merged) {
                    self.stop_servers(servers);
                    return Err(e);
                }
            }
            Err(MountError::Failed(e)) => {
                self.stop_servers(servers);
                return Err(e);
            }
        }

        info!(
            "composed rootfs for '{}' at {} ({} lower(s), upper: {})",
            container_id,
            merged.display(),
            lowers.len(),
            upper.is_some()
        );

        Ok(LayerContext {
            container_id: container_id.to_string(),
            rootfs: merged,
            read_only: upper.is_none(),
            upper,
            work,
            layers: layers.to_vec(),
            mounts,
            servers,
            deferred_binds,
            scratch: scratch.to_path_buf(),
        })
    }

    /// Applies the bind operations that only become visible after the
    /// caller has entered the target mount namespace.
    pub fn mount_in_namespace(&self, ctx: &LayerContext) -> Result<()> {
        for (source, target, read_only) in &ctx.deferred_binds {
            let rel = target.strip_prefix("/").unwrap_or(target);
            let dest = ctx.rootfs.join(rel);
            fs::create_dir_all(&dest)?;
            bind_mount(source, &dest, *read_only)?;
            debug!(
                "bound {} -> {} (ro: {})",
                source.display(),
                dest.display(),
                read_only
            );
        }
        Ok(())
    }

    /// Unmounts in reverse order, stops pack servers, removes scratch.
    pub fn destroy(&self, ctx: LayerContext) -> Result<()> {
        let LayerContext {
            container_id,
            mounts,
            servers,
            scratch,
            work,
            ..
        } = ctx;

        let mut first_err = None;
        for mount in mounts.iter().rev() {
            if let Err(e) = unmount(mount) {
                warn!("failed to unmount {}: {}", mount.display(), e);
                first_err.get_or_insert(e);
            }
        }
        for server in servers.into_iter().rev() {
            server.stop();
        }
        // The work directory lives beside the upper, outside this
        // context's scratch tree.
        if let Some(work) = work
            && work.exists()
            && let Err(e) = fs::remove_dir_all(&work)
        {
            warn!("failed to remove work dir {}: {}", work.display(), e);
        }
        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!("failed to remove scratch {}: {}", scratch.display(), e);
            first_err.get_or_insert(Error::Io(e));
        }

        debug!("destroyed layer context for '{}'", container_id);
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn stop_servers(&self, servers: Vec<PackServer>) {
        for server in servers.into_iter().rev() {
            server.stop();
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Checks structural rules before any mount is attempted.
///
/// At most one base rootfs, at most one writable upper, the upper last if
/// present, and no path that would corrupt the overlay option string.
pub fn validate_layers(layers: &[Layer]) -> Result<()> {
    if layers.is_empty() {
        return Err(Error::RootfsInvalid("empty layer list".into()));
    }
    if layers.len() > MAX_LAYERS {
        return Err(Error::RootfsInvalid(format!(
            "{} layers exceeds the limit of {}",
            layers.len(),
            MAX_LAYERS
        )));
    }

    let bases = layers
        .iter()
        .filter(|l| matches!(l.source, LayerSource::BaseRootfs(_)))
        .count();
    if bases > 1 {
        return Err(Error::RootfsInvalid(format!(
            "{} base rootfs layers, at most one allowed",
            bases
        )));
    }

    let uppers: Vec<usize> = layers
        .iter()
        .enumerate()
        .filter(|(_, l)| matches!(l.source, LayerSource::WritableUpper(_)))
        .map(|(i, _)| i)
        .collect();
    if uppers.len() > 1 {
        return Err(Error::RootfsInvalid(format!(
            "{} writable upper layers, at most one allowed",
            uppers.len()
        )));
    }
    if let Some(&idx) = uppers.first()
        && idx != layers.len() - 1
    {
        return Err(Error::RootfsInvalid(
            "writable upper must be the last layer".into(),
        ));
    }

    for layer in layers {
        if matches!(layer.source, LayerSource::WritableUpper(_)) && layer.read_only {
            return Err(Error::RootfsInvalid(
                "writable upper cannot be read-only".into(),
            ));
        }
        if layer.source_path().to_string_lossy().contains(':') {
            return Err(Error::RootfsInvalid(format!(
                "layer path contains ':': {}",
                layer.source_path().display()
            )));
        }
    }

    Ok(())
}

/// Why an overlay mount did not happen: the host cannot do it at all
/// (copy fallback applies) versus the composition itself is bad.
enum MountError {
    Unavailable(String),
    Failed(Error),
}

/// Merges layers by copying, listed order last-wins, the upper on top.
/// Same precedence as the overlay path; writes land directly in the
/// merged tree and are not reflected back into the upper directory.
fn copy_compose(lowers: &[PathBuf], upper: Option<&Path>, merged: &Path) -> Result<()> {
    for lower in lowers {
        copy_tree(lower, merged)?;
    }
    if let Some(upper) = upper {
        copy_tree(upper, merged)?;
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = fs::read_link(entry.path())?;
                let _ = fs::remove_file(&target);
                std::os::unix::fs::symlink(link, &target)?;
            }
        } else {
            let _ = fs::remove_file(&target);
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Builds the overlay `lowerdir` option string.
///
/// The kernel lists the top-most lower first; composition order lists it
/// last, so the listed order is reversed here.
pub fn overlay_lower_string(lowers: &[PathBuf]) -> String {
    lowers
        .iter()
        .rev()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

// =============================================================================
// Mount Plumbing (Linux)
// =============================================================================

#[cfg(target_os = "linux")]
fn mount_composed(
    lowers: &[PathBuf],
    upper: Option<&Path>,
    work: Option<&Path>,
    merged: &Path,
) -> std::result::Result<(), MountError> {
    use nix::errno::Errno;
    use nix::mount::{MsFlags, mount};

    if lowers.is_empty() && upper.is_none() {
        return Err(MountError::Failed(Error::RootfsInvalid(
            "composition produced no mountable layer".into(),
        )));
    }

    // Degenerate shapes need no overlay at all: a single read-only
    // lower, or an upper with nothing underneath.
    let plain_bind = match (lowers, upper) {
        ([only], None) => Some((only.as_path(), true)),
        ([], Some(upper)) => Some((upper, false)),
        _ => None,
    };
    if let Some((source, read_only)) = plain_bind {
        return match bind_mount(source, merged, read_only) {
            Ok(()) => Ok(()),
            Err(Error::PermissionDenied(reason)) => Err(MountError::Unavailable(reason)),
            Err(e) => Err(MountError::Failed(e)),
        };
    }

    let mut options = format!("lowerdir={}", overlay_lower_string(lowers));
    if let (Some(upper), Some(work)) = (upper, work) {
        options.push_str(&format!(
            ",upperdir={},workdir={}",
            upper.display(),
            work.display()
        ));
    }

    match mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    ) {
        Ok(()) => Ok(()),
        Err(e @ (Errno::EPERM | Errno::EACCES | Errno::ENODEV | Errno::ENOSYS)) => {
            Err(MountError::Unavailable(e.to_string()))
        }
        Err(e) => Err(MountError::Failed(Error::RootfsInvalid(format!(
            "overlay mount failed: {}",
            e
        )))),
    }
}

#[cfg(target_os = "linux")]
fn bind_mount(source: &Path, dest: &Path, read_only: bool) -> Result<()> {
    use nix::errno::Errno;
    use nix::mount::{MsFlags, mount};

    mount(
        Some(source),
        dest,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| match e {
        Errno::EPERM | Errno::EACCES => Error::PermissionDenied(format!(
            "bind mount of {}: {}",
            source.display(),
            e
        )),
        e => Error::RootfsInvalid(format!("bind mount failed: {}", e)),
    })?;

    if read_only {
        mount(
            None::<&str>,
            dest,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::RootfsInvalid(format!("read-only remount failed: {}", e)))?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn unmount(target: &Path) -> Result<()> {
    use nix::mount::{MntFlags, umount2};

    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        // Already unmounted counts as success on replay.
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(Error::Internal(format!(
            "unmount of {} failed: {}",
            target.display(),
            e
        ))),
    }
}

// =============================================================================
// Non-Linux Stubs
// =============================================================================

#[cfg(not(target_os = "linux"))]
fn mount_composed(
    _lowers: &[PathBuf],
    _upper: Option<&Path>,
    _work: Option<&Path>,
    _merged: &Path,
) -> std::result::Result<(), MountError> {
    Err(MountError::Unavailable("overlayfs requires Linux".into()))
}

#[cfg(not(target_os = "linux"))]
fn bind_mount(_source: &Path, _dest: &Path, _read_only: bool) -> Result<()> {
    Err(Error::RootfsInvalid("bind mounts require Linux".into()))
}

#[cfg(not(target_os = "linux"))]
fn unmount(_target: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_layer_list_is_rootfs_invalid() {
        let err = validate_layers(&[]).unwrap_err();
        assert!(matches!(err, Error::RootfsInvalid(_)));
    }

    #[test]
    fn test_at_most_one_base() {
        let layers = vec![Layer::base("/a"), Layer::base("/b")];
        assert!(validate_layers(&layers).is_err());
    }

    #[test]
    fn test_upper_must_be_last() {
        let ok = vec![Layer::base("/a"), Layer::upper("/up")];
        assert!(validate_layers(&ok).is_ok());

        let bad = vec![Layer::upper("/up"), Layer::base("/a")];
        assert!(validate_layers(&bad).is_err());

        let two = vec![Layer::base("/a"), Layer::upper("/u1"), Layer::upper("/u2")];
        assert!(validate_layers(&two).is_err());
    }

    #[test]
    fn test_colon_in_path_rejected() {
        let layers = vec![Layer::base("/weird:path")];
        assert!(validate_layers(&layers).is_err());
    }

    #[test]
    fn test_lower_string_reverses_listed_order() {
        let lowers = vec![
            PathBuf::from("/base"),
            PathBuf::from("/pack-a"),
            PathBuf::from("/pack-b"),
        ];
        // pack-b shadows pack-a shadows base, so the kernel sees it first.
        assert_eq!(overlay_lower_string(&lowers), "/pack-b:/pack-a:/base");
    }

    #[test]
    fn test_layer_constructors() {
        let layer = Layer::bind("/var/cache/chef", true).at("/ingredients");
        assert_eq!(layer.target.as_deref(), Some(Path::new("/ingredients")));
        assert!(layer.read_only);
        assert!(matches!(layer.source, LayerSource::HostBind(_)));

        let upper = Layer::upper("/scratch");
        assert!(!upper.read_only);
    }
}
