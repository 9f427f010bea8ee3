//! # Builder (`cookd` core)
//!
//! Maintains a queue of pending build requests and runs them one at a
//! time. For each request the builder:
//!
//! 1. allocates scratch storage (sized tmpfs on Linux),
//! 2. fetches the source tree into scratch,
//! 3. composes a layer context: debootstrap base rootfs + scratch as the
//!    writable upper, with the ingredients cache bound read-only,
//! 4. creates a container with a default-deny filesystem policy extended
//!    by read access to the source, read access to the ingredients
//!    cache, and write access to the output directory,
//! 5. spawns the in-container build driver (`bakectl`) with the recipe
//!    as argument and waits for it,
//! 6. collects the package artifact and the build log,
//! 7. destroys the container and releases the scratch storage.
//!
//! Throughout, the builder emits status transitions
//! (queued → sourcing → building → packing → done|failed) and
//! artifact-ready notifications on its event channel; the daemon
//! forwards them to the broker connection.

use super::request::{ArtifactKind, BuildRequest, BuildStatus};
use super::scratch::ScratchStorage;
use super::source::SourceFetcher;
use crate::constants::MAX_BUILD_QUEUE;
use crate::container::{CapabilitySet, ContainerConfig, ContainerEngine, SpawnFlags};
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::platform::ArchMask;
use crate::policy::{AccessMask, Policy, SecurityLevel};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tracing::{debug, info, warn};

/// Notifications from a builder to its broker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CookEvent {
    Ready { arch_mask: ArchMask },
    Update { queue_size: usize },
    Status { id: String, status: BuildStatus },
    Artifact {
        id: String,
        kind: ArtifactKind,
        uri: String,
    },
}

/// Builder configuration.
#[derive(Debug, Clone)]
pub struct CookConfig {
    /// Architectures this builder serves.
    pub arches: ArchMask,
    /// Debootstrap-produced base rootfs for build containers.
    pub base_rootfs: PathBuf,
    /// Host ingredients cache, bound read-only into builds.
    pub ingredients_dir: PathBuf,
    /// Where collected artifacts land, per request id.
    pub artifacts_dir: PathBuf,
    /// Scratch tmpfs size cap in bytes.
    pub scratch_size: u64,
    /// In-container path of the build driver.
    pub bakectl: String,
}

/// The builder core.
pub struct Cook {
    config: CookConfig,
    engine: Arc<ContainerEngine>,
    fetcher: Arc<dyn SourceFetcher>,
    queue: Mutex<VecDeque<BuildRequest>>,
    events: mpsc::UnboundedSender<CookEvent>,
    work: Notify,
    shutdown: watch::Sender<bool>,
}

impl Cook {
    /// Builds a cook; the receiver carries its broker notifications.
    pub fn new(
        config: CookConfig,
        engine: Arc<ContainerEngine>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CookEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        (
            Arc::new(Self {
                config,
                engine,
                fetcher,
                queue: Mutex::new(VecDeque::new()),
                events,
                work: Notify::new(),
                shutdown,
            }),
            rx,
        )
    }

    /// Announces readiness and the served architecture set.
    pub fn announce_ready(&self) {
        let _ = self.events.send(CookEvent::Ready {
            arch_mask: self.config.arches,
        });
    }

    /// Admits a request into the queue.
    pub async fn submit(&self, request: BuildRequest) -> Result<()> {
        if !self.config.arches.contains(request.arch) {
            return Err(Error::UnknownArch(request.arch.to_string()));
        }
        let queue_size = {
            let mut queue = self.queue.lock().await;
            if queue.len() >= MAX_BUILD_QUEUE {
                return Err(Error::ResourceExhausted(format!(
                    "build queue full ({})",
                    MAX_BUILD_QUEUE
                )));
            }
            info!("queued build {} ({})", request.id, request.arch);
            self.emit_status(&request.id, BuildStatus::Queued);
            queue.push_back(request);
            queue.len()
        };
        let _ = self.events.send(CookEvent::Update { queue_size });
        self.work.notify_one();
        Ok(())
    }

    /// Pending requests.
    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Requests worker shutdown.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.work.notify_one();
    }

    /// Worker loop: drains the queue until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                debug!("cook worker exiting");
                return;
            }
            let next = self.queue.lock().await.pop_front();
            match next {
                Some(request) => {
                    self.execute(request).await;
                    let queue_size = self.queue.lock().await.len();
                    let _ = self.events.send(CookEvent::Update { queue_size });
                }
                None => {
                    tokio::select! {
                        _ = self.work.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    async fn execute(&self, request: BuildRequest) {
        let id = request.id.clone();
        let container_id = format!("build-{}", id);

        self.emit_status(&id, BuildStatus::Sourcing);
        let scratch = match ScratchStorage::allocate(&id, self.config.scratch_size) {
            Ok(scratch) => scratch,
            Err(e) => {
                warn!("build {}: scratch allocation failed: {}", id, e);
                self.emit_status(&id, BuildStatus::Failed);
                return;
            }
        };
        let source_dir = scratch.path().join("source");
        let out_dir = scratch.path().join("out");
        let upper_dir = scratch.path().join("upper");

        let job = self
            .run_job(&request, &container_id, &upper_dir, &source_dir, &out_dir)
            .await;

        // Collect the log even when the build failed; a missing package
        // only counts against successful builds.
        let log_uri = self.collect(&id, &out_dir.join("build.log"), "build.log");
        if let Some(uri) = &log_uri {
            self.emit_artifact(&id, ArtifactKind::Log, uri);
        }

        if let Err(e) = &job {
            warn!("build {} failed: {}", id, e);
        }
        let success = matches!(job, Ok(0));
        if success {
            self.emit_status(&id, BuildStatus::Packing);
            let package = self.collect(&id, &out_dir.join("package.pack"), "package.pack");
            match package {
                Some(uri) => {
                    self.emit_artifact(&id, ArtifactKind::Package, &uri);
                    self.emit_status(&id, BuildStatus::Done);
                }
                None => {
                    warn!("build {} exited 0 but produced no package", id);
                    self.emit_status(&id, BuildStatus::Failed);
                }
            }
        } else {
            self.emit_status(&id, BuildStatus::Failed);
        }

        // Teardown runs regardless of the job outcome.
        match self.engine.destroy(&container_id).await {
            Ok(()) | Err(Error::ContainerNotFound(_)) => {}
            Err(e) => warn!("destroying '{}': {}", container_id, e),
        }
        if let Err(e) = scratch.release() {
            warn!("releasing scratch for {}: {}", id, e);
        }
    }

    /// Fetch, compose, create, and drive the in-container build; returns
    /// the driver's exit code.
    async fn run_job(
        &self,
        request: &BuildRequest,
        container_id: &str,
        upper_dir: &Path,
        source_dir: &Path,
        out_dir: &Path,
    ) -> Result<i32> {
        self.fetcher.fetch(&request.source_url, source_dir).await?;
        tokio::fs::create_dir_all(out_dir).await?;
        tokio::fs::create_dir_all(upper_dir).await?;

        self.emit_status(&request.id, BuildStatus::Building);

        let policy = Policy::deny_all(SecurityLevel::Default)
            // The toolchain in the base rootfs.
            .allow_fs("/bin/**", AccessMask::READ_EXEC)
            .allow_fs("/usr/**", AccessMask::READ_EXEC)
            .allow_fs("/lib/**", AccessMask::READ_EXEC)
            .allow_fs("/lib64/**", AccessMask::READ_EXEC)
            .allow_fs("/etc/**", AccessMask::READ)
            // The job's own trees.
            .allow_fs("/source/**", AccessMask::READ)
            .allow_fs("/ingredients/**", AccessMask::READ)
            .allow_fs("/out/**", AccessMask::ALL)
            .allow_fs("/tmp/**", AccessMask::ALL);

        let config = ContainerConfig {
            id: container_id.to_string(),
            layers: vec![
                Layer::base(&self.config.base_rootfs),
                Layer::bind(&self.config.ingredients_dir, true).at("/ingredients"),
                Layer::bind(source_dir, true).at("/source"),
                Layer::bind(out_dir, false).at("/out"),
                // Scratch-backed upper: all build writes stay inside the
                // job's sized tmpfs.
                Layer::upper(upper_dir),
            ],
            policy,
            capabilities: CapabilitySet::build_default(),
            hostname: Some(container_id.to_string()),
        };

        self.engine.create(config).await?;

        let recipe = format!("/source/{}", request.recipe_path);
        let argv = vec![self.config.bakectl.clone(), recipe];
        let env = vec![
            ("CHEF_BUILD_ID".to_string(), request.id.clone()),
            ("CHEF_OUT".to_string(), "/out".to_string()),
            ("CHEF_ARCH".to_string(), request.arch.to_string()),
        ];
        let outcome = self
            .engine
            .spawn(container_id, &argv, &env, SpawnFlags { wait: true })
            .await?;

        Ok(outcome.exit_code.unwrap_or(127))
    }

    /// Copies a produced file into the artifacts tree; returns its URI.
    fn collect(&self, id: &str, produced: &Path, name: &str) -> Option<String> {
        if !produced.exists() {
            return None;
        }
        let dest_dir = self.config.artifacts_dir.join(id);
        if let Err(e) = std::fs::create_dir_all(&dest_dir) {
            warn!("cannot create artifacts dir for {}: {}", id, e);
            return None;
        }
        let dest = dest_dir.join(name);
        if let Err(e) = std::fs::copy(produced, &dest) {
            warn!("cannot collect {} for {}: {}", name, id, e);
            return None;
        }
        Some(format!("file://{}", dest.display()))
    }

    fn emit_status(&self, id: &str, status: BuildStatus) {
        debug!("build {} -> {}", id, status);
        let _ = self.events.send(CookEvent::Status {
            id: id.to_string(),
            status,
        });
    }

    fn emit_artifact(&self, id: &str, kind: ArtifactKind, uri: &str) {
        let _ = self.events.send(CookEvent::Artifact {
            id: id.to_string(),
            kind,
            uri: uri.to_string(),
        });
    }
}
