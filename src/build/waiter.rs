//! # Broker (`waiterd` core)
//!
//! Routes client build requests to architecture-matched builders and
//! relays status and artifacts back.
//!
//! Builders connect, report their architecture set, and transition to
//! ready. Client submissions run trivial admission checks, pick a ready
//! builder whose set covers the requested architecture (smallest queue
//! wins, ties broken by most-recent-ready), allocate a fresh correlation
//! identifier, and forward the request. All broker state is soft: a
//! restart forgets in-flight requests by design, and queries for unknown
//! ids return `unknown`.

use super::cook::CookEvent;
use super::request::{ArtifactKind, BuildRequest, BuildStatus};
use crate::error::{Error, Result};
use crate::platform::{Arch, ArchMask};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

/// Builder identity within one broker process.
pub type BuilderId = u64;

/// Events relayed to watching clients.
#[derive(Debug, Clone)]
pub struct WaiterEvent {
    pub id: String,
    pub status: BuildStatus,
    /// Failure cause, when there is one (e.g. "builder-lost").
    pub cause: Option<String>,
}

/// Broker-side descriptor of one connected builder. Soft state; lost on
/// disconnect.
struct BuilderEntry {
    arch_mask: ArchMask,
    ready: bool,
    ready_since: Instant,
    queue_size: usize,
    forward: mpsc::UnboundedSender<BuildRequest>,
}

struct TrackedRequest {
    request: BuildRequest,
    builder: BuilderId,
}

/// The build broker.
pub struct Waiter {
    builders: Mutex<HashMap<BuilderId, BuilderEntry>>,
    requests: Mutex<HashMap<String, TrackedRequest>>,
    next_builder: AtomicU64,
    events: broadcast::Sender<WaiterEvent>,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            builders: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            next_builder: AtomicU64::new(1),
            events,
        })
    }

    /// Subscribes to relayed status events.
    pub fn subscribe(&self) -> broadcast::Receiver<WaiterEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Builder Side
    // =========================================================================

    /// Registers a builder connection; the receiver carries requests
    /// forwarded to it. The builder is not eligible until it reports
    /// ready with its architecture set.
    pub async fn builder_connected(&self) -> (BuilderId, mpsc::UnboundedReceiver<BuildRequest>) {
        let id = self.next_builder.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.builders.lock().await.insert(
            id,
            BuilderEntry {
                arch_mask: ArchMask::EMPTY,
                ready: false,
                ready_since: Instant::now(),
                queue_size: 0,
                forward: tx,
            },
        );
        info!("builder {} connected", id);
        (id, rx)
    }

    /// Applies one notification from a builder.
    pub async fn builder_event(&self, id: BuilderId, event: CookEvent) {
        match event {
            CookEvent::Ready { arch_mask } => {
                let mut builders = self.builders.lock().await;
                if let Some(entry) = builders.get_mut(&id) {
                    entry.arch_mask = arch_mask;
                    entry.ready = true;
                    entry.ready_since = Instant::now();
                    info!("builder {} ready for [{}]", id, arch_mask);
                }
            }
            CookEvent::Update { queue_size } => {
                let mut builders = self.builders.lock().await;
                if let Some(entry) = builders.get_mut(&id) {
                    entry.queue_size = queue_size;
                }
            }
            CookEvent::Status { id: req_id, status } => {
                self.relay_status(id, &req_id, status).await;
            }
            CookEvent::Artifact {
                id: req_id,
                kind,
                uri,
            } => {
                let mut requests = self.requests.lock().await;
                match requests.get_mut(&req_id) {
                    Some(tracked) if tracked.builder == id => match kind {
                        ArtifactKind::Log => tracked.request.log_uri = Some(uri),
                        ArtifactKind::Package => tracked.request.package_uri = Some(uri),
                    },
                    _ => warn!("artifact for unknown request {}", req_id),
                }
            }
        }
    }

    async fn relay_status(&self, builder: BuilderId, req_id: &str, status: BuildStatus) {
        let mut requests = self.requests.lock().await;
        let Some(tracked) = requests.get_mut(req_id) else {
            warn!("status for unknown request {}", req_id);
            return;
        };
        if tracked.builder != builder {
            warn!(
                "builder {} reported status for request {} it does not own",
                builder, req_id
            );
            return;
        }
        if !tracked.request.status.can_advance_to(status) {
            debug!(
                "dropping non-monotonic status {} -> {} for {}",
                tracked.request.status, status, req_id
            );
            return;
        }
        tracked.request.status = status;
        drop(requests);
        let _ = self.events.send(WaiterEvent {
            id: req_id.to_string(),
            status,
            cause: None,
        });
    }

    /// Invalidates everything assigned to a disconnected builder.
    pub async fn builder_disconnected(&self, id: BuilderId) {
        self.builders.lock().await.remove(&id);
        let mut lost = Vec::new();
        {
            let mut requests = self.requests.lock().await;
            for (req_id, tracked) in requests.iter_mut() {
                if tracked.builder == id && !tracked.request.status.is_terminal() {
                    tracked.request.status = BuildStatus::Failed;
                    lost.push(req_id.clone());
                }
            }
        }
        info!(
            "builder {} disconnected, {} in-flight request(s) failed",
            id,
            lost.len()
        );
        for req_id in lost {
            let _ = self.events.send(WaiterEvent {
                id: req_id,
                status: BuildStatus::Failed,
                cause: Some("builder-lost".to_string()),
            });
        }
    }

    // =========================================================================
    // Client Side
    // =========================================================================

    /// Admits a build request; returns its queue status and correlation
    /// identifier.
    pub async fn submit(
        &self,
        arch: Arch,
        platform: &str,
        source_url: &str,
        recipe_path: &str,
    ) -> Result<(BuildStatus, String)> {
        if source_url.is_empty() || recipe_path.is_empty() {
            return Err(Error::InvalidArgument(
                "source url and recipe path are required".into(),
            ));
        }

        let builder = self.select_builder(arch).await?;
        let id = uuid::Uuid::now_v7().to_string();
        let request = BuildRequest::new(&id, arch, platform, source_url, recipe_path);

        {
            let builders = self.builders.lock().await;
            let Some(entry) = builders.get(&builder) else {
                return Err(Error::BuilderLost(id));
            };
            if entry.forward.send(request.clone()).is_err() {
                return Err(Error::BuilderLost(id));
            }
        }

        self.requests
            .lock()
            .await
            .insert(id.clone(), TrackedRequest { request, builder });
        info!("admitted build {} ({}) to builder {}", id, arch, builder);
        Ok((BuildStatus::Queued, id))
    }

    /// Round-robin by queue size among ready, architecture-matched
    /// builders: smallest queue wins, ties break to the most recently
    /// ready.
    async fn select_builder(&self, arch: Arch) -> Result<BuilderId> {
        let builders = self.builders.lock().await;
        builders
            .iter()
            .filter(|(_, b)| b.ready && b.arch_mask.contains(arch))
            .min_by(|(_, a), (_, b)| {
                a.queue_size
                    .cmp(&b.queue_size)
                    .then(b.ready_since.cmp(&a.ready_since))
            })
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::UnknownArch(arch.to_string()))
    }

    /// Status of a request; unknown ids report `unknown`.
    pub async fn status(&self, id: &str) -> (Option<Arch>, BuildStatus) {
        let requests = self.requests.lock().await;
        match requests.get(id) {
            Some(tracked) => (Some(tracked.request.arch), tracked.request.status),
            None => (None, BuildStatus::Unknown),
        }
    }

    /// Stored artifact URI; `None` when absent or unknown.
    pub async fn artifact(&self, id: &str, kind: ArtifactKind) -> Option<String> {
        let requests = self.requests.lock().await;
        requests
            .get(id)
            .and_then(|t| t.request.artifact(kind))
            .map(str::to_string)
    }

    /// Connected builders.
    pub async fn builder_count(&self) -> usize {
        self.builders.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ready_builder(
        waiter: &Waiter,
        arches: ArchMask,
        queue: usize,
    ) -> (BuilderId, mpsc::UnboundedReceiver<BuildRequest>) {
        let (id, rx) = waiter.builder_connected().await;
        waiter
            .builder_event(id, CookEvent::Ready { arch_mask: arches })
            .await;
        waiter
            .builder_event(id, CookEvent::Update { queue_size: queue })
            .await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_submit_routes_to_matching_builder() {
        let waiter = Waiter::new();
        let (_, mut rx) =
            ready_builder(&waiter, ArchMask::single(Arch::Arm64), 0).await;

        let (status, id) = waiter
            .submit(Arch::Arm64, "linux", "file:///src", "recipe.yaml")
            .await
            .unwrap();
        assert_eq!(status, BuildStatus::Queued);
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.id, id);
        assert_eq!(forwarded.arch, Arch::Arm64);
    }

    #[tokio::test]
    async fn test_unknown_arch_is_rejected_without_forwarding() {
        let waiter = Waiter::new();
        let (_, mut rx) = ready_builder(&waiter, ArchMask::single(Arch::X64), 0).await;

        let err = waiter
            .submit(Arch::Riscv64, "linux", "file:///src", "recipe.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownArch(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_selection_prefers_smallest_queue() {
        let waiter = Waiter::new();
        let (_busy, mut busy_rx) =
            ready_builder(&waiter, ArchMask::single(Arch::X64), 5).await;
        let (_idle, mut idle_rx) =
            ready_builder(&waiter, ArchMask::single(Arch::X64), 0).await;

        waiter
            .submit(Arch::X64, "linux", "file:///src", "recipe.yaml")
            .await
            .unwrap();
        assert!(idle_rx.try_recv().is_ok());
        assert!(busy_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_relay_is_monotonic() {
        let waiter = Waiter::new();
        let (builder, _rx) = ready_builder(&waiter, ArchMask::single(Arch::X64), 0).await;
        let (_, id) = waiter
            .submit(Arch::X64, "linux", "file:///src", "recipe.yaml")
            .await
            .unwrap();

        waiter
            .builder_event(
                builder,
                CookEvent::Status {
                    id: id.clone(),
                    status: BuildStatus::Building,
                },
            )
            .await;
        assert_eq!(waiter.status(&id).await.1, BuildStatus::Building);

        // A stale, out-of-order report does not regress the status.
        waiter
            .builder_event(
                builder,
                CookEvent::Status {
                    id: id.clone(),
                    status: BuildStatus::Sourcing,
                },
            )
            .await;
        assert_eq!(waiter.status(&id).await.1, BuildStatus::Building);
    }

    #[tokio::test]
    async fn test_builder_disconnect_fails_in_flight() {
        let waiter = Waiter::new();
        let (builder, _rx) = ready_builder(&waiter, ArchMask::single(Arch::Arm64), 0).await;
        let mut events = waiter.subscribe();

        let (_, id) = waiter
            .submit(Arch::Arm64, "linux", "file:///src", "recipe.yaml")
            .await
            .unwrap();
        waiter
            .builder_event(
                builder,
                CookEvent::Status {
                    id: id.clone(),
                    status: BuildStatus::Sourcing,
                },
            )
            .await;
        let _ = events.recv().await;

        waiter.builder_disconnected(builder).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.status, BuildStatus::Failed);
        assert_eq!(event.cause.as_deref(), Some("builder-lost"));

        assert_eq!(waiter.status(&id).await.1, BuildStatus::Failed);
        assert!(waiter.artifact(&id, ArtifactKind::Log).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_request_reports_unknown() {
        let waiter = Waiter::new();
        let (arch, status) = waiter.status("no-such-id").await;
        assert!(arch.is_none());
        assert_eq!(status, BuildStatus::Unknown);
    }

    #[tokio::test]
    async fn test_artifact_updates_stored_request() {
        let waiter = Waiter::new();
        let (builder, _rx) = ready_builder(&waiter, ArchMask::single(Arch::X64), 0).await;
        let (_, id) = waiter
            .submit(Arch::X64, "linux", "file:///src", "recipe.yaml")
            .await
            .unwrap();

        waiter
            .builder_event(
                builder,
                CookEvent::Artifact {
                    id: id.clone(),
                    kind: ArtifactKind::Package,
                    uri: "file:///artifacts/p.pack".into(),
                },
            )
            .await;
        assert_eq!(
            waiter.artifact(&id, ArtifactKind::Package).await.as_deref(),
            Some("file:///artifacts/p.pack")
        );
        assert!(waiter.artifact(&id, ArtifactKind::Log).await.is_none());
    }
}
