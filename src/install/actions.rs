//! # State Handler Side Effects
//!
//! Each state handler performs exactly one externally-observable step.
//! Those steps live behind the [`InstallActions`] seam so the runner's
//! sequencing, persistence, and recovery logic stays independent of the
//! filesystem and container plumbing, and failure injection in tests
//! wraps the real implementation instead of patching handlers.
//!
//! Every action is idempotent: replaying it against an on-disk state it
//! already produced yields the same result. Unmounting an absent mount,
//! removing a missing wrapper, and re-creating an existing container for
//! the same package all succeed.

use crate::constants::Paths;
use crate::container::{ContainerConfig, ContainerEngine, SpawnFlags};
use crate::error::{Error, Result};
use crate::install::app::{Application, CommandKind, PackManifest};
use crate::install::transaction::Transaction;
use crate::layer::Layer;
use crate::pack;
use crate::policy::{AccessMask, Policy, SecurityLevel};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fetches pack archives from wherever packages come from.
///
/// The store's HTTP client lives outside this crate; deployments plug it
/// in here. [`LocalFetcher`] serves packs from a directory.
#[async_trait]
pub trait PackFetcher: Send + Sync {
    async fn fetch(&self, name: &str, revision: Option<u64>, dest: &Path) -> Result<()>;
}

/// Fetcher reading packs from a local directory laid out as
/// `<root>/<publisher>-<package>.pack`.
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PackFetcher for LocalFetcher {
    async fn fetch(&self, name: &str, _revision: Option<u64>, dest: &Path) -> Result<()> {
        let file = format!("{}.pack", name.replace('/', "-"));
        let source = self.root.join(file);
        if !source.exists() {
            return Err(Error::PackageNotFound(name.to_string()));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = dest.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        tokio::fs::copy(&source, &tmp).await?;
        tokio::fs::rename(&tmp, dest).await.map_err(Error::Io)
    }
}

/// Side effects the state handlers perform, one per state.
#[async_trait]
pub trait InstallActions: Send + Sync {
    /// Checks preconditions; `installed` is the current record for the
    /// transaction's package, if any.
    async fn verify(&self, tx: &Transaction, installed: Option<&Application>) -> Result<()>;

    /// Brings the pack archive to its on-disk location.
    async fn download(&self, tx: &Transaction) -> Result<()>;

    /// Validates the pack and loads its manifest into the revision dir.
    async fn load(&self, tx: &Transaction) -> Result<PackManifest>;

    /// Makes the pack contents visible at the package mount point.
    async fn mount(&self, tx: &Transaction) -> Result<PathBuf>;

    /// Reverses `mount`; absent mounts succeed.
    async fn unmount(&self, tx: &Transaction) -> Result<()>;

    /// Writes `/chef/bin` wrappers and the profile shim.
    async fn generate_wrappers(&self, app: &Application) -> Result<()>;

    /// Removes the package's wrappers; missing wrappers succeed.
    async fn remove_wrappers(&self, app: &Application) -> Result<()>;

    /// Starts the package's daemons in a container; returns the
    /// container id when one was created.
    async fn start_services(&self, app: &Application) -> Result<Option<String>>;

    /// Stops the package's daemon container; absent containers succeed.
    async fn stop_services(&self, app: &Application) -> Result<()>;

    /// Drops the per-revision data; absent data succeeds.
    async fn unload(&self, tx: &Transaction) -> Result<()>;

    /// Removes the pack archive itself; absent archives succeed.
    async fn uninstall(&self, tx: &Transaction) -> Result<()>;
}

// =============================================================================
// Host Implementation
// =============================================================================

/// Real side effects against the host filesystem and container engine.
pub struct HostActions {
    paths: Paths,
    fetcher: Arc<dyn PackFetcher>,
    engine: Option<Arc<ContainerEngine>>,
}

impl HostActions {
    pub fn new(
        paths: Paths,
        fetcher: Arc<dyn PackFetcher>,
        engine: Option<Arc<ContainerEngine>>,
    ) -> Self {
        Self {
            paths,
            fetcher,
            engine,
        }
    }

    fn pack_path(&self, tx: &Transaction) -> PathBuf {
        self.paths.pack_path(tx.publisher(), tx.package())
    }

    fn mount_point(&self, tx: &Transaction) -> PathBuf {
        self.paths.mount_point(tx.publisher(), tx.package())
    }
}

#[async_trait]
impl InstallActions for HostActions {
    async fn verify(&self, tx: &Transaction, installed: Option<&Application>) -> Result<()> {
        crate::constants::split_package_name(&tx.name)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;

        match tx.tx_type {
            crate::install::TxType::Install => {
                if let Some(app) = installed
                    && Some(app.revision) == tx.revision
                {
                    return Err(Error::PackageAlreadyInstalled(format!(
                        "{} revision {}",
                        tx.name, app.revision
                    )));
                }
                if let Some(source) = &tx.source
                    && !source.exists()
                {
                    return Err(Error::InvalidArgument(format!(
                        "pack source {} does not exist",
                        source.display()
                    )));
                }
                Ok(())
            }
            crate::install::TxType::Uninstall | crate::install::TxType::Update => installed
                .map(|_| ())
                .ok_or_else(|| Error::PackageNotFound(tx.name.clone())),
            crate::install::TxType::ShutdownSweep => Ok(()),
        }
    }

    async fn download(&self, tx: &Transaction) -> Result<()> {
        let dest = self.pack_path(tx);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match &tx.source {
            Some(source) => {
                // Local install: the archive is already on this host.
                let tmp = dest.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
                tokio::fs::copy(source, &tmp).await?;
                tokio::fs::rename(&tmp, &dest).await?;
            }
            None => {
                self.fetcher.fetch(&tx.name, tx.revision, &dest).await?;
            }
        }
        info!("downloaded {} to {}", tx.name, dest.display());
        Ok(())
    }

    async fn load(&self, tx: &Transaction) -> Result<PackManifest> {
        let archive = self.pack_path(tx);
        let manifest = pack::read_manifest(&archive)?;
        if let Some(expected) = tx.revision
            && manifest.revision != expected
        {
            return Err(Error::InvalidArgument(format!(
                "pack holds revision {}, transaction expects {}",
                manifest.revision, expected
            )));
        }

        let revision_dir =
            self.paths
                .revision_dir(tx.publisher(), tx.package(), manifest.revision);
        tokio::fs::create_dir_all(&revision_dir).await?;
        let manifest_json =
            serde_json::to_string_pretty(&manifest).map_err(|e| Error::Internal(e.to_string()))?;
        tokio::fs::write(revision_dir.join("manifest.json"), manifest_json).await?;
        debug!("loaded {} revision {}", tx.name, manifest.revision);
        Ok(manifest)
    }

    async fn mount(&self, tx: &Transaction) -> Result<PathBuf> {
        let archive = self.pack_path(tx);
        let mount_point = self.mount_point(tx);
        pack::stage_pack(&archive, &mount_point)?;
        info!("mounted {} at {}", tx.name, mount_point.display());
        Ok(mount_point)
    }

    async fn unmount(&self, tx: &Transaction) -> Result<()> {
        let mount_point = self.mount_point(tx);
        match tokio::fs::remove_dir_all(&mount_point).await {
            Ok(()) => Ok(()),
            // Already unmounted counts as success on replay.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn generate_wrappers(&self, app: &Application) -> Result<()> {
        for command in &app.commands {
            if command.kind == CommandKind::Executable {
                crate::install::wrappers::generate_wrapper(&self.paths, app, command)?;
            }
        }
        crate::install::wrappers::ensure_profile_shim(&self.paths)
    }

    async fn remove_wrappers(&self, app: &Application) -> Result<()> {
        for command in &app.commands {
            if command.kind == CommandKind::Executable {
                crate::install::wrappers::remove_wrapper(&self.paths, command)?;
            }
        }
        Ok(())
    }

    async fn start_services(&self, app: &Application) -> Result<Option<String>> {
        let daemons: Vec<_> = app
            .commands
            .iter()
            .filter(|c| c.kind == CommandKind::Daemon)
            .collect();
        if daemons.is_empty() {
            return Ok(None);
        }
        let Some(engine) = &self.engine else {
            warn!(
                "no container engine, skipping {} daemon(s) of {}",
                daemons.len(),
                app.name()
            );
            return Ok(None);
        };

        let id = app.container_id();
        let mount = self.paths.mount_point(&app.publisher, &app.package);
        let config = ContainerConfig {
            id: id.clone(),
            layers: vec![Layer::base(&mount)],
            // The package mount is the whole rootfs; daemons may read and
            // execute their own content, nothing else.
            policy: Policy::deny_all(SecurityLevel::Default)
                .allow_fs("/**", AccessMask::READ_EXEC),
            capabilities: crate::container::CapabilitySet::EMPTY,
            hostname: Some(id.clone()),
        };

        match engine.create(config).await {
            Ok(_) => {}
            // Replay after a crash: the package's container is already up.
            Err(Error::ContainerAlreadyExists(_)) => {
                debug!("container '{}' already exists, reusing", id);
                return Ok(Some(id));
            }
            Err(e) => return Err(e),
        }

        for daemon in daemons {
            let mut argv = vec![format!("/{}", daemon.path.display())];
            argv.extend(daemon.arguments.iter().cloned());
            engine
                .spawn(&id, &argv, &[], SpawnFlags { wait: false })
                .await?;
        }
        info!("started services for {} in '{}'", app.name(), id);
        Ok(Some(id))
    }

    async fn stop_services(&self, app: &Application) -> Result<()> {
        let Some(engine) = &self.engine else {
            return Ok(());
        };
        match engine.destroy(&app.container_id()).await {
            Ok(()) => Ok(()),
            // Never started or already gone.
            Err(Error::ContainerNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn unload(&self, tx: &Transaction) -> Result<()> {
        let base = self
            .paths
            .revision_dir(tx.publisher(), tx.package(), 0)
            .parent()
            .map(Path::to_path_buf);
        let Some(package_dir) = base else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(&package_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn uninstall(&self, tx: &Transaction) -> Result<()> {
        match tokio::fs::remove_file(self.pack_path(tx)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
