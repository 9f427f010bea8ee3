//! # Container Engine
//!
//! Creates, runs, and destroys isolated execution environments.
//!
//! The engine composes a rootfs through the [`LayerComposer`], launches a
//! supervisor process inside a fresh namespace set via the selected
//! [`ContainerBackend`], loads the container's [`Policy`] keyed by its
//! cgroup identity, and then serves `spawn`/`kill`/`upload`/`download`
//! until `destroy` tears everything down again.
//!
//! # Lifecycle
//!
//! ```text
//!            create            first spawn           destroy
//! (none) ──► creating ──► created ──► running ──► dying ──► dead
//!                │                                   ▲
//!                └── fatal error ────────────────────┘
//! ```
//!
//! `destroy` from any non-dead state drives dying → dead and is
//! idempotent afterwards; a second destroy returns success without side
//! effects, destroy of an unknown id returns `not-found`.
//!
//! # Concurrency
//!
//! The engine is thread-safe for distinct containers. Operations on a
//! single container serialize state transitions under a per-container
//! lock but wait for child processes outside it, so `destroy` can cancel
//! in-flight `spawn` waits and ongoing uploads/downloads with
//! `cancelled`.

mod linux;
mod process;
mod windows;

pub use linux::LinuxBackend;
pub use process::ProcessBackend;
pub use windows::WindowsBackend;

use crate::constants::{DESTROY_GRACE, MAX_CONTAINERS, validate_container_id};
use crate::error::{Error, Result};
use crate::layer::{Layer, LayerComposer, LayerContext};
use crate::platform::{Capability, Os, Platform};
use crate::policy::{Policy, PolicyBackend, PolicyHandle, SecurityLevel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

// =============================================================================
// Container Model
// =============================================================================

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Namespace setup and policy load in progress.
    Creating,
    /// Created but nothing spawned yet.
    Created,
    /// At least one process has been spawned.
    Running,
    /// Teardown in progress.
    Dying,
    /// Torn down; handle is inert.
    Dead,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Dying => write!(f, "dying"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Linux capabilities retained inside the container.
///
/// Bit positions follow the kernel capability numbers; everything not in
/// the set is dropped from the bounding set after pivot-root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet(pub u64);

impl CapabilitySet {
    /// Drop everything.
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    pub const CHOWN: u64 = 1 << 0;
    pub const DAC_OVERRIDE: u64 = 1 << 1;
    pub const FOWNER: u64 = 1 << 3;
    pub const KILL: u64 = 1 << 5;
    pub const SETGID: u64 = 1 << 6;
    pub const SETUID: u64 = 1 << 7;
    pub const NET_BIND_SERVICE: u64 = 1 << 10;
    pub const SYS_CHROOT: u64 = 1 << 18;

    /// What a package build inside the container needs.
    pub const fn build_default() -> Self {
        CapabilitySet(
            Self::CHOWN | Self::DAC_OVERRIDE | Self::FOWNER | Self::KILL | Self::SETGID
                | Self::SETUID,
        )
    }

    /// True when the capability bit is retained.
    pub const fn retains(self, bit: u64) -> bool {
        self.0 & bit != 0
    }
}

/// Options for creating a container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Host-unique short identifier.
    pub id: String,
    /// Layer description handed to the composer.
    pub layers: Vec<Layer>,
    /// Declarative policy loaded under the container's cgroup.
    pub policy: Policy,
    /// Capabilities retained inside the container.
    pub capabilities: CapabilitySet,
    /// Hostname inside the UTS namespace.
    pub hostname: Option<String>,
}

impl ContainerConfig {
    /// Minimal config with a default-deny policy.
    pub fn new(id: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self {
            id: id.into(),
            layers,
            policy: Policy::deny_all(SecurityLevel::Default),
            capabilities: CapabilitySet::EMPTY,
            hostname: None,
        }
    }
}

/// Flags for [`ContainerEngine::spawn`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnFlags {
    /// Block until the process exits and report its exit code.
    pub wait: bool,
}

/// Result of a spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOutcome {
    /// Container-relative process identifier.
    pub pid: u32,
    /// Exit code when the spawn waited for completion. Signal deaths
    /// report `128 + signo`, mirroring shell convention.
    pub exit_code: Option<i32>,
}

/// Caller-facing view of a container.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub status: ContainerStatus,
    pub rootfs: PathBuf,
    pub cgroup_id: u64,
    pub security_level: SecurityLevel,
    /// True when enforcement is weaker than declared (seccomp fallback,
    /// dropped policy rules).
    pub degraded: bool,
    pub children: Vec<u32>,
}

// =============================================================================
// Backend Seams
// =============================================================================

/// Parent-side handle to the in-namespace supervisor.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Cgroup identity of the container.
    fn cgroup_id(&self) -> u64;

    /// Starts a process inside the container.
    async fn spawn(
        &self,
        argv: &[String],
        envp: &[(String, String)],
        wait: bool,
    ) -> Result<SpawnOutcome>;

    /// Signal-terminates a child; reaped asynchronously. Idempotent.
    async fn kill(&self, pid: u32) -> Result<()>;

    /// Child pids currently tracked.
    async fn children(&self) -> Vec<u32>;

    /// Terminates all children (grace, then force) and exits the
    /// supervisor. Idempotent.
    async fn shutdown(&self, grace: Duration) -> Result<()>;
}

/// OS-level half of the engine: namespace setup and process control.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// True when the backend can launch on this host.
    fn is_available(&self) -> bool;

    /// Launches the container supervisor inside its namespace set and
    /// completes the readiness handshake. Mount operations that are only
    /// visible inside the new mount namespace are performed through
    /// `composer.mount_in_namespace(ctx)` before pivoting root.
    async fn launch(
        &self,
        config: &ContainerConfig,
        ctx: &LayerContext,
        composer: &LayerComposer,
    ) -> Result<Arc<dyn Supervisor>>;
}

/// Selects the strongest backend the platform supports.
pub fn select_backend(platform: &Platform) -> Arc<dyn ContainerBackend> {
    match platform.os {
        Os::Linux if platform.has(Capability::Namespaces) => {
            let backend = LinuxBackend::new();
            if backend.is_available() {
                info!("container backend: linux namespaces");
                return Arc::new(backend);
            }
            info!("container backend: host process (namespace setup unavailable)");
            Arc::new(ProcessBackend::new())
        }
        Os::Windows => Arc::new(WindowsBackend::new()),
        _ => {
            info!("container backend: host process (no isolation support)");
            Arc::new(ProcessBackend::new())
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

struct Inner {
    status: ContainerStatus,
    security_level: SecurityLevel,
    cgroup_id: u64,
    degraded: bool,
    read_only: bool,
    rootfs: PathBuf,
    ctx: Option<LayerContext>,
    policy_handle: Option<PolicyHandle>,
    supervisor: Option<Arc<dyn Supervisor>>,
    children: Vec<u32>,
}

struct Slot {
    state: Mutex<Inner>,
    cancel: watch::Sender<bool>,
}

impl Slot {
    fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }
}

/// The container engine: one per host process.
pub struct ContainerEngine {
    composer: LayerComposer,
    policy: Arc<dyn PolicyBackend>,
    backend: Arc<dyn ContainerBackend>,
    containers: RwLock<HashMap<String, Arc<Slot>>>,
}

impl ContainerEngine {
    /// Builds an engine from explicit parts.
    pub fn new(
        composer: LayerComposer,
        policy: Arc<dyn PolicyBackend>,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        Self {
            composer,
            policy,
            backend,
            containers: RwLock::new(HashMap::new()),
        }
    }

    /// Builds an engine with platform-selected backends.
    pub fn detect(work_root: impl Into<PathBuf>) -> Self {
        let platform = Platform::detect();
        let policy: Arc<dyn PolicyBackend> = crate::policy::select_backend(&platform).into();
        let backend = select_backend(&platform);
        Self::new(LayerComposer::new(work_root), policy, backend)
    }

    /// Creates a container and loads its policy.
    pub async fn create(&self, config: ContainerConfig) -> Result<Container> {
        validate_container_id(&config.id).map_err(|reason| {
            Error::InvalidArgument(format!("container id '{}': {}", config.id, reason))
        })?;

        // Reserve the id while creation is in flight.
        let slot = {
            let mut containers = self.containers.write().await;
            let live = containers
                .values()
                .filter(|s| {
                    s.state
                        .try_lock()
                        .map(|i| i.status != ContainerStatus::Dead)
                        .unwrap_or(true)
                })
                .count();
            if live >= MAX_CONTAINERS {
                return Err(Error::ResourceExhausted(format!(
                    "container limit reached ({})",
                    MAX_CONTAINERS
                )));
            }
            if let Some(existing) = containers.get(&config.id) {
                let dead = existing
                    .state
                    .try_lock()
                    .map(|i| i.status == ContainerStatus::Dead)
                    .unwrap_or(false);
                if !dead {
                    return Err(Error::ContainerAlreadyExists(config.id.clone()));
                }
            }
            let (cancel, _) = watch::channel(false);
            let slot = Arc::new(Slot {
                state: Mutex::new(Inner {
                    status: ContainerStatus::Creating,
                    security_level: config.policy.level,
                    cgroup_id: 0,
                    degraded: false,
                    read_only: true,
                    rootfs: PathBuf::new(),
                    ctx: None,
                    policy_handle: None,
                    supervisor: None,
                    children: Vec::new(),
                }),
                cancel,
            });
            containers.insert(config.id.clone(), Arc::clone(&slot));
            slot
        };

        match self.create_inner(&config, &slot).await {
            Ok(container) => Ok(container),
            Err(e) => {
                // Fatal creation errors go directly to dead; the id
                // becomes reusable.
                self.containers.write().await.remove(&config.id);
                Err(e)
            }
        }
    }

    async fn create_inner(&self, config: &ContainerConfig, slot: &Slot) -> Result<Container> {
        let ctx = self.composer.compose(&config.layers, &config.id)?;
        let rootfs = ctx.rootfs.clone();
        let read_only = ctx.read_only;

        let supervisor = match self.backend.launch(config, &ctx, &self.composer).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self.composer.destroy(ctx);
                return Err(e);
            }
        };
        let cgroup_id = supervisor.cgroup_id();

        // Capabilities were dropped inside the child before this point;
        // population runs parent-side against the composed view.
        let policy_handle = match self.policy.populate(cgroup_id, &config.policy, &rootfs) {
            Ok(h) => h,
            Err(e) => {
                let _ = supervisor.shutdown(DESTROY_GRACE).await;
                let _ = self.policy.cleanup(cgroup_id);
                let _ = self.composer.destroy(ctx);
                return Err(e);
            }
        };
        let degraded = policy_handle.degraded;

        {
            let mut inner = slot.state.lock().await;
            inner.status = ContainerStatus::Created;
            inner.cgroup_id = cgroup_id;
            inner.degraded = degraded;
            inner.read_only = read_only;
            inner.rootfs = rootfs.clone();
            inner.ctx = Some(ctx);
            inner.policy_handle = Some(policy_handle);
            inner.supervisor = Some(supervisor);
        }

        info!(
            "created container '{}' (cgroup {}, backend {}, degraded: {})",
            config.id,
            cgroup_id,
            self.backend.name(),
            degraded
        );

        Ok(Container {
            id: config.id.clone(),
            status: ContainerStatus::Created,
            rootfs,
            cgroup_id,
            security_level: config.policy.level,
            degraded,
            children: Vec::new(),
        })
    }

    /// Starts a process inside the container.
    ///
    /// The first spawn takes the container created → running. With
    /// `flags.wait` the call blocks until the process exits and reports
    /// the exit code; `destroy` cancels the wait with `cancelled`.
    pub async fn spawn(
        &self,
        id: &str,
        argv: &[String],
        envp: &[(String, String)],
        flags: SpawnFlags,
    ) -> Result<SpawnOutcome> {
        if argv.is_empty() {
            return Err(Error::InvalidArgument("empty argv".into()));
        }
        let slot = self.slot(id).await?;
        let mut cancelled = slot.cancelled();

        let supervisor = {
            let mut inner = slot.state.lock().await;
            match inner.status {
                ContainerStatus::Created => inner.status = ContainerStatus::Running,
                ContainerStatus::Running => {}
                _ => return Err(Error::NotRunning(id.to_string())),
            }
            inner
                .supervisor
                .clone()
                .ok_or_else(|| Error::NotRunning(id.to_string()))?
        };

        // Wait outside the per-container lock so destroy can interleave.
        let outcome = tokio::select! {
            result = supervisor.spawn(argv, envp, flags.wait) => result?,
            _ = cancelled.wait_for(|c| *c) => {
                return Err(Error::Cancelled(format!("container '{}' destroyed", id)));
            }
        };

        let mut inner = slot.state.lock().await;
        if outcome.exit_code.is_none() && !inner.children.contains(&outcome.pid) {
            inner.children.push(outcome.pid);
        }
        debug!("spawned pid {} in '{}'", outcome.pid, id);
        Ok(outcome)
    }

    /// Signal-terminates a child process. Idempotent.
    pub async fn kill(&self, id: &str, pid: u32) -> Result<()> {
        let slot = self.slot(id).await?;
        let supervisor = {
            let inner = slot.state.lock().await;
            match inner.status {
                ContainerStatus::Created | ContainerStatus::Running => inner.supervisor.clone(),
                // Children of a dying or dead container are already being
                // terminated; a second kill is a no-op.
                _ => None,
            }
        };
        if let Some(supervisor) = supervisor {
            supervisor.kill(pid).await?;
        }
        Ok(())
    }

    /// Copies a host file into the container. Atomic from the caller's
    /// perspective: written to a temporary name and renamed into place
    /// inside the container's filesystem view.
    pub async fn upload(&self, id: &str, host_path: &Path, container_path: &Path) -> Result<()> {
        let slot = self.slot(id).await?;
        let mut cancelled = slot.cancelled();
        let (rootfs, read_only) = {
            let inner = slot.state.lock().await;
            match inner.status {
                ContainerStatus::Created | ContainerStatus::Running => {}
                _ => return Err(Error::NotRunning(id.to_string())),
            }
            (inner.rootfs.clone(), inner.read_only)
        };
        if read_only {
            return Err(Error::ReadOnly {
                path: container_path.to_path_buf(),
            });
        }

        let dest = resolve_in_rootfs(&rootfs, container_path)?;
        let copy = copy_atomic(host_path.to_path_buf(), dest);
        tokio::select! {
            result = copy => result,
            _ = cancelled.wait_for(|c| *c) => {
                Err(Error::Cancelled(format!("container '{}' destroyed", id)))
            }
        }
    }

    /// Copies a file out of the container to the host. Atomic on the
    /// host side via temporary name plus rename.
    pub async fn download(&self, id: &str, container_path: &Path, host_path: &Path) -> Result<()> {
        let slot = self.slot(id).await?;
        let mut cancelled = slot.cancelled();
        let rootfs = {
            let inner = slot.state.lock().await;
            match inner.status {
                ContainerStatus::Created | ContainerStatus::Running => {}
                _ => return Err(Error::NotRunning(id.to_string())),
            }
            inner.rootfs.clone()
        };

        let source = resolve_in_rootfs(&rootfs, container_path)?;
        let copy = copy_atomic(source, host_path.to_path_buf());
        tokio::select! {
            result = copy => result,
            _ = cancelled.wait_for(|c| *c) => {
                Err(Error::Cancelled(format!("container '{}' destroyed", id)))
            }
        }
    }

    /// Tears the container down: dying → dead.
    ///
    /// Signals all children, waits with a bounded grace period then
    /// force-kills, destroys the layer context, and removes every policy
    /// entry keyed by the container's cgroup. Idempotent after the first
    /// call; unknown ids return `not-found`.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let slot = self.slot(id).await?;

        // Cancel in-flight waits before taking the state lock.
        let _ = slot.cancel.send(true);

        let mut inner = slot.state.lock().await;
        match inner.status {
            ContainerStatus::Dead => return Ok(()),
            ContainerStatus::Dying => return Ok(()),
            _ => inner.status = ContainerStatus::Dying,
        }

        if let Some(supervisor) = inner.supervisor.take()
            && let Err(e) = supervisor.shutdown(DESTROY_GRACE).await
        {
            warn!("supervisor shutdown for '{}': {}", id, e);
        }

        if let Some(handle) = inner.policy_handle.take() {
            match self.policy.cleanup(handle.cgroup_id) {
                Ok(removed) => debug!(
                    "removed {} policy entr(ies) for '{}' ({} were loaded)",
                    removed,
                    id,
                    handle.fs_entries + handle.net_entries
                ),
                Err(e) => warn!("policy cleanup for '{}': {}", id, e),
            }
        }

        if let Some(ctx) = inner.ctx.take()
            && let Err(e) = self.composer.destroy(ctx)
        {
            warn!("layer teardown for '{}': {}", id, e);
        }

        inner.children.clear();
        inner.status = ContainerStatus::Dead;
        info!("destroyed container '{}'", id);
        Ok(())
    }

    /// Returns the caller-facing view of a container.
    pub async fn info(&self, id: &str) -> Result<Container> {
        let slot = self.slot(id).await?;
        let inner = slot.state.lock().await;
        Ok(Container {
            id: id.to_string(),
            status: inner.status,
            rootfs: inner.rootfs.clone(),
            cgroup_id: inner.cgroup_id,
            security_level: inner.security_level,
            degraded: inner.degraded,
            children: inner.children.clone(),
        })
    }

    /// Lists known container ids with their states.
    pub async fn list(&self) -> Vec<(String, ContainerStatus)> {
        let containers = self.containers.read().await;
        let mut out = Vec::with_capacity(containers.len());
        for (id, slot) in containers.iter() {
            let status = slot.state.lock().await.status;
            out.push((id.clone(), status));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Policy metrics from the active backend.
    pub fn policy_metrics(&self) -> crate::policy::PolicyMetrics {
        self.policy.metrics()
    }

    async fn slot(&self, id: &str) -> Result<Arc<Slot>> {
        self.containers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }
}

/// Maps a container-absolute path into the composed rootfs, rejecting
/// traversal outside it.
fn resolve_in_rootfs(rootfs: &Path, container_path: &Path) -> Result<PathBuf> {
    let rel = container_path
        .strip_prefix("/")
        .unwrap_or(container_path);
    if !crate::constants::path_is_confined(rel) {
        return Err(Error::InvalidArgument(format!(
            "path escapes the container: {}",
            container_path.display()
        )));
    }
    Ok(rootfs.join(rel))
}

async fn copy_atomic(source: PathBuf, dest: PathBuf) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = dest.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    tokio::fs::copy(&source, &tmp).await?;
    match tokio::fs::rename(&tmp, &dest).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(Error::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MemoryPolicyBackend;
    use tempfile::TempDir;

    fn test_engine(temp: &TempDir) -> (ContainerEngine, Arc<MemoryPolicyBackend>) {
        let policy = Arc::new(MemoryPolicyBackend::new());
        let backend: Arc<dyn PolicyBackend> = policy.clone();
        let engine = ContainerEngine::new(
            LayerComposer::new(temp.path().join("work")),
            backend,
            Arc::new(ProcessBackend::new()),
        );
        (engine, policy)
    }

    fn host_layers(temp: &TempDir) -> Vec<Layer> {
        let base = temp.path().join("base");
        std::fs::create_dir_all(base.join("bin")).unwrap();
        std::fs::write(base.join("bin/tool"), b"#!/bin/sh\n").unwrap();
        let upper = temp.path().join("upper");
        vec![Layer::base(base), Layer::upper(upper)]
    }

    #[tokio::test]
    async fn test_create_with_empty_layers_is_rootfs_invalid() {
        let temp = TempDir::new().unwrap();
        let (engine, _) = test_engine(&temp);
        let err = engine
            .create(ContainerConfig::new("c1", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RootfsInvalid(_)));
        // The id is reusable after the failed creation.
        assert!(engine.info("c1").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let temp = TempDir::new().unwrap();
        let (engine, _) = test_engine(&temp);
        let err = engine
            .create(ContainerConfig::new("bad id", host_layers(&temp)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_and_policy_bookkeeping() {
        let temp = TempDir::new().unwrap();
        let (engine, policy) = test_engine(&temp);

        let container = engine
            .create(ContainerConfig::new("c1", host_layers(&temp)))
            .await
            .unwrap();
        assert_eq!(container.status, ContainerStatus::Created);
        assert_ne!(container.cgroup_id, 0);

        // Duplicate ids are rejected while the container is alive.
        let err = engine
            .create(ContainerConfig::new("c1", host_layers(&temp)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContainerAlreadyExists(_)));

        let outcome = engine
            .spawn(
                "c1",
                &["/bin/true".to_string()],
                &[],
                SpawnFlags { wait: true },
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(engine.info("c1").await.unwrap().status, ContainerStatus::Running);

        engine.destroy("c1").await.unwrap();
        let info = engine.info("c1").await.unwrap();
        assert_eq!(info.status, ContainerStatus::Dead);
        // No policy entry keyed by the container's cgroup remains.
        assert!(policy.fs_keys(container.cgroup_id).is_empty());

        // Destroy is idempotent after the first call.
        engine.destroy("c1").await.unwrap();
        // Unknown ids are not-found.
        assert!(matches!(
            engine.destroy("nope").await.unwrap_err(),
            Error::ContainerNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_spawn_after_destroy_is_not_running() {
        let temp = TempDir::new().unwrap();
        let (engine, _) = test_engine(&temp);
        engine
            .create(ContainerConfig::new("c2", host_layers(&temp)))
            .await
            .unwrap();
        engine.destroy("c2").await.unwrap();
        let err = engine
            .spawn("c2", &["/bin/true".to_string()], &[], SpawnFlags::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_exit_code_roundtrip() {
        let temp = TempDir::new().unwrap();
        let (engine, _) = test_engine(&temp);
        engine
            .create(ContainerConfig::new("c3", host_layers(&temp)))
            .await
            .unwrap();
        let outcome = engine
            .spawn(
                "c3",
                &["/bin/sh".to_string(), "-c".to_string(), "exit 42".to_string()],
                &[],
                SpawnFlags { wait: true },
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(42));
        engine.destroy("c3").await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let temp = TempDir::new().unwrap();
        let (engine, _) = test_engine(&temp);
        engine
            .create(ContainerConfig::new("c4", host_layers(&temp)))
            .await
            .unwrap();

        let source = temp.path().join("input.txt");
        std::fs::write(&source, b"round trip bytes").unwrap();
        engine
            .upload("c4", &source, Path::new("/data/input.txt"))
            .await
            .unwrap();

        let back = temp.path().join("output.txt");
        engine
            .download("c4", Path::new("/data/input.txt"), &back)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"round trip bytes");

        engine.destroy("c4").await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_to_read_only_rootfs() {
        let temp = TempDir::new().unwrap();
        let (engine, _) = test_engine(&temp);
        let base = temp.path().join("ro-base");
        std::fs::create_dir_all(&base).unwrap();
        engine
            .create(ContainerConfig::new("c5", vec![Layer::base(base)]))
            .await
            .unwrap();

        let source = temp.path().join("f");
        std::fs::write(&source, b"x").unwrap();
        let err = engine
            .upload("c5", &source, Path::new("/f"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly { .. }));
        engine.destroy("c5").await.unwrap();
    }
}
