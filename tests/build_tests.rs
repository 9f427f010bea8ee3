//! Tests for the build orchestration core: builder admission, the
//! builder→broker event flow, and job failure settling.

use chef::build::{
    ArtifactKind, BuildRequest, BuildStatus, Cook, CookConfig, CookEvent, FileFetcher, Waiter,
};
use chef::container::{ContainerEngine, ProcessBackend};
use chef::layer::LayerComposer;
use chef::platform::{Arch, ArchMask};
use chef::policy::MemoryPolicyBackend;
use chef::Error;
use std::sync::Arc;
use tempfile::TempDir;

fn test_cook(
    temp: &TempDir,
    arches: ArchMask,
) -> (Arc<Cook>, tokio::sync::mpsc::UnboundedReceiver<CookEvent>) {
    let engine = Arc::new(ContainerEngine::new(
        LayerComposer::new(temp.path().join("work")),
        Arc::new(MemoryPolicyBackend::new()),
        Arc::new(ProcessBackend::new()),
    ));
    let config = CookConfig {
        arches,
        base_rootfs: temp.path().join("base"),
        ingredients_dir: temp.path().join("ingredients"),
        artifacts_dir: temp.path().join("artifacts"),
        scratch_size: 64 * 1024 * 1024,
        bakectl: "/usr/bin/bakectl".to_string(),
    };
    std::fs::create_dir_all(temp.path().join("base")).unwrap();
    std::fs::create_dir_all(temp.path().join("ingredients")).unwrap();
    Cook::new(config, engine, Arc::new(FileFetcher::new()))
}

fn request(id: &str, arch: Arch) -> BuildRequest {
    BuildRequest::new(id, arch, "linux", "file:///no/such/source", "recipe.yaml")
}

#[tokio::test]
async fn test_submit_rejects_undeclared_arch() {
    let temp = TempDir::new().unwrap();
    let (cook, _events) = test_cook(&temp, ArchMask::single(Arch::X64));

    let err = cook.submit(request("r1", Arch::Riscv64)).await.unwrap_err();
    assert!(matches!(err, Error::UnknownArch(_)));
    assert_eq!(cook.queue_size().await, 0);
}

#[tokio::test]
async fn test_submit_emits_queued_and_update() {
    let temp = TempDir::new().unwrap();
    let (cook, mut events) = test_cook(&temp, ArchMask::single(Arch::X64));

    cook.submit(request("r1", Arch::X64)).await.unwrap();
    assert_eq!(cook.queue_size().await, 1);

    let first = events.recv().await.unwrap();
    assert!(matches!(
        first,
        CookEvent::Status {
            status: BuildStatus::Queued,
            ..
        }
    ));
    let second = events.recv().await.unwrap();
    assert!(matches!(second, CookEvent::Update { queue_size: 1 }));
}

#[tokio::test]
async fn test_failed_sourcing_settles_as_failed() {
    let temp = TempDir::new().unwrap();
    let (cook, mut events) = test_cook(&temp, ArchMask::single(Arch::X64));

    cook.submit(request("r1", Arch::X64)).await.unwrap();
    let worker = tokio::spawn(Arc::clone(&cook).run());

    // Collect status transitions for r1 until terminal.
    let mut statuses = Vec::new();
    while let Some(event) = events.recv().await {
        if let CookEvent::Status { id, status } = event {
            assert_eq!(id, "r1");
            statuses.push(status);
            if status.is_terminal() {
                break;
            }
        }
    }
    assert_eq!(
        statuses,
        vec![
            BuildStatus::Queued,
            BuildStatus::Sourcing,
            BuildStatus::Failed
        ]
    );

    // Statuses only ever moved forward.
    for pair in statuses.windows(2) {
        assert!(pair[0].can_advance_to(pair[1]));
    }

    cook.stop();
    let _ = worker.await;
}

#[tokio::test]
async fn test_cook_events_drive_broker_state() {
    let temp = TempDir::new().unwrap();
    let (cook, mut cook_events) = test_cook(&temp, ArchMask::single(Arch::Arm64));
    let waiter = Waiter::new();

    // Builder session: connect, announce, and pump events like the
    // daemon's forwarding loop does.
    let (builder_id, mut forwarded) = waiter.builder_connected().await;
    cook.announce_ready();
    while let Ok(event) = cook_events.try_recv() {
        waiter.builder_event(builder_id, event).await;
    }

    let (status, id) = waiter
        .submit(Arch::Arm64, "linux", "file:///src", "recipe.yaml")
        .await
        .unwrap();
    assert_eq!(status, BuildStatus::Queued);

    // The request reached the builder side; admit it there.
    let request = forwarded.recv().await.unwrap();
    assert_eq!(request.id, id);
    cook.submit(request).await.unwrap();
    while let Ok(event) = cook_events.try_recv() {
        waiter.builder_event(builder_id, event).await;
    }

    let (arch, status) = waiter.status(&id).await;
    assert_eq!(arch, Some(Arch::Arm64));
    assert_eq!(status, BuildStatus::Queued);

    // Builder loss fails the in-flight request with a final event.
    let mut broker_events = waiter.subscribe();
    waiter.builder_disconnected(builder_id).await;
    let event = broker_events.recv().await.unwrap();
    assert_eq!(event.id, id);
    assert_eq!(event.status, BuildStatus::Failed);
    assert_eq!(event.cause.as_deref(), Some("builder-lost"));
    assert!(waiter.artifact(&id, ArtifactKind::Log).await.is_none());
}
