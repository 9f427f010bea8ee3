//! Tests for the install state machine.
//!
//! Exercises the runner end to end against a relocated filesystem
//! prefix: happy-path installs, the uninstall rollback chain, crash
//! recovery from a persisted state, and admission failures.

use chef::Paths;
use chef::error::Result;
use chef::install::{
    Application, HostActions, InstallActions, InstallEvent, InstallRunner, LocalFetcher,
    PackManifest, StateStore, Transaction, TxOptions, TxState, TxType,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tempfile::TempDir;

// =============================================================================
// Fixtures
// =============================================================================

/// Builds a pack archive holding a manifest and one executable.
fn make_pack(dir: &Path, revision: u64) -> PathBuf {
    let content = dir.join(format!("pack-content-{}", revision));
    std::fs::create_dir_all(content.join("bin")).unwrap();
    std::fs::write(
        content.join("chef.json"),
        format!(
            r#"{{"revision": {}, "commands": [
                {{"name": "hello", "kind": "executable", "path": "bin/hello"}}
            ]}}"#,
            revision
        ),
    )
    .unwrap();
    std::fs::write(content.join("bin/hello"), b"#!/bin/sh\necho hello\n").unwrap();
    let archive = dir.join(format!("acme-hello-{}.pack", revision));
    chef::pack::write_pack(&content, &archive).unwrap();
    archive
}

struct Fixture {
    _temp: TempDir,
    paths: Paths,
    state_root: PathBuf,
    pack: PathBuf,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let paths = Paths::with_prefix(temp.path().join("root"));
    let state_root = temp.path().join("state");
    let pack = make_pack(temp.path(), 7);
    Fixture {
        paths,
        state_root,
        pack,
        _temp: temp,
    }
}

fn host_actions(fixture: &Fixture) -> Arc<HostActions> {
    Arc::new(HostActions::new(
        fixture.paths.clone(),
        Arc::new(LocalFetcher::new(fixture.state_root.join("never-used"))),
        None,
    ))
}

/// Delegating wrapper with per-action failure injection and counters.
struct FlakyActions {
    inner: Arc<HostActions>,
    fail_unmount_once: AtomicBool,
    download_count: AtomicU32,
}

impl FlakyActions {
    fn new(inner: Arc<HostActions>) -> Self {
        Self {
            inner,
            fail_unmount_once: AtomicBool::new(false),
            download_count: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl InstallActions for FlakyActions {
    async fn verify(&self, tx: &Transaction, installed: Option<&Application>) -> Result<()> {
        self.inner.verify(tx, installed).await
    }
    async fn download(&self, tx: &Transaction) -> Result<()> {
        self.download_count.fetch_add(1, Ordering::SeqCst);
        self.inner.download(tx).await
    }
    async fn load(&self, tx: &Transaction) -> Result<PackManifest> {
        self.inner.load(tx).await
    }
    async fn mount(&self, tx: &Transaction) -> Result<PathBuf> {
        self.inner.mount(tx).await
    }
    async fn unmount(&self, tx: &Transaction) -> Result<()> {
        if self.fail_unmount_once.swap(false, Ordering::SeqCst) {
            return Err(chef::Error::Internal("injected unmount failure".into()));
        }
        self.inner.unmount(tx).await
    }
    async fn generate_wrappers(&self, app: &Application) -> Result<()> {
        self.inner.generate_wrappers(app).await
    }
    async fn remove_wrappers(&self, app: &Application) -> Result<()> {
        self.inner.remove_wrappers(app).await
    }
    async fn start_services(&self, app: &Application) -> Result<Option<String>> {
        self.inner.start_services(app).await
    }
    async fn stop_services(&self, app: &Application) -> Result<()> {
        self.inner.stop_services(app).await
    }
    async fn unload(&self, tx: &Transaction) -> Result<()> {
        self.inner.unload(tx).await
    }
    async fn uninstall(&self, tx: &Transaction) -> Result<()> {
        self.inner.uninstall(tx).await
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_install_happy_path() {
    let fixture = fixture();
    let runner = InstallRunner::new(
        StateStore::open(&fixture.state_root).unwrap(),
        host_actions(&fixture),
    );
    runner.start().await.unwrap();
    let mut events = runner.subscribe();

    let id = runner
        .create(TxOptions::install_from("acme/hello", &fixture.pack))
        .await;
    assert_ne!(id, 0);
    runner.drain().await;

    // The transaction progressed through exactly the install sequence.
    let tx = runner.transaction(id).await.unwrap();
    assert_eq!(tx.state, TxState::Committed);
    let mut visited: Vec<TxState> = tx.log.iter().map(|e| e.state).collect();
    visited.dedup();
    assert_eq!(
        visited,
        vec![
            TxState::Verify,
            TxState::Download,
            TxState::Load,
            TxState::Mount,
            TxState::GenerateWrappers,
            TxState::StartServices,
            TxState::Committed,
        ]
    );

    // Installed view: one application at revision 7.
    assert_eq!(runner.count().await, 1);
    let app = runner.info("acme/hello").await.unwrap();
    assert_eq!(app.revision, 7);

    // The command wrapper exists and resolves to the mounted command.
    let wrapper = fixture.paths.wrapper_path("hello");
    assert!(wrapper.exists());
    let body = std::fs::read_to_string(&wrapper).unwrap();
    assert!(body.contains("acme-hello/bin/hello"));

    // A package-installed event was emitted.
    let mut installed_event = false;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            InstallEvent::PackageInstalled { ref name, revision: 7 } if name == "acme/hello"
        ) {
            installed_event = true;
        }
    }
    assert!(installed_event);

    runner.stop().await;
}

#[tokio::test]
async fn test_uninstall_happy_path_removes_package() {
    let fixture = fixture();
    let runner = InstallRunner::new(
        StateStore::open(&fixture.state_root).unwrap(),
        host_actions(&fixture),
    );
    runner.start().await.unwrap();

    runner
        .create(TxOptions::install_from("acme/hello", &fixture.pack))
        .await;
    runner.drain().await;
    assert_eq!(runner.count().await, 1);

    let id = runner.create(TxOptions::uninstall("acme/hello")).await;
    runner.drain().await;

    let tx = runner.transaction(id).await.unwrap();
    assert_eq!(tx.state, TxState::Committed);
    assert_eq!(runner.count().await, 0);
    assert!(!fixture.paths.wrapper_path("hello").exists());
    assert!(!fixture.paths.mount_point("acme", "hello").exists());

    runner.stop().await;
}

#[tokio::test]
async fn test_uninstall_rollback_on_unmount_failure() {
    let fixture = fixture();
    let actions = Arc::new(FlakyActions::new(host_actions(&fixture)));
    let runner = InstallRunner::new(
        StateStore::open(&fixture.state_root).unwrap(),
        actions.clone(),
    );
    runner.start().await.unwrap();

    runner
        .create(TxOptions::install_from("acme/hello", &fixture.pack))
        .await;
    runner.drain().await;

    // Inject a failure into the uninstall's unmount step.
    actions.fail_unmount_once.store(true, Ordering::SeqCst);
    let id = runner.create(TxOptions::uninstall("acme/hello")).await;
    runner.drain().await;

    // The fail-successor chain re-applied wrappers and services and
    // terminated failed with the application still installed.
    let tx = runner.transaction(id).await.unwrap();
    assert_eq!(tx.state, TxState::Failed);
    assert_eq!(runner.count().await, 1);
    assert!(fixture.paths.mount_point("acme", "hello").exists());
    assert!(fixture.paths.wrapper_path("hello").exists());

    runner.stop().await;
}

#[tokio::test]
async fn test_crash_recovery_resumes_at_persisted_state() {
    let fixture = fixture();

    // Simulate a crash immediately after the download state persisted
    // its completion: the pack is on disk and the row points at load.
    let store = StateStore::open(&fixture.state_root).unwrap();
    let id = store.next_tx_id().unwrap();
    let pack_dest = fixture.paths.pack_path("acme", "hello");
    std::fs::create_dir_all(pack_dest.parent().unwrap()).unwrap();
    std::fs::copy(&fixture.pack, &pack_dest).unwrap();
    store
        .save_transaction(&Transaction {
            id,
            name: "acme/hello".into(),
            description: "install acme/hello".into(),
            tx_type: TxType::Install,
            state: TxState::Load,
            ephemeral: false,
            revision: Some(7),
            source: None,
            retry_count: 0,
            log: Vec::new(),
        })
        .unwrap();
    drop(store);

    let actions = Arc::new(FlakyActions::new(host_actions(&fixture)));
    let runner = InstallRunner::new(
        StateStore::open(&fixture.state_root).unwrap(),
        actions.clone(),
    );
    runner.start().await.unwrap();
    runner.drain().await;

    // Resumed at load, reached committed, and never redid the download.
    let tx = runner.transaction(id).await.unwrap();
    assert_eq!(tx.state, TxState::Committed);
    assert_eq!(actions.download_count.load(Ordering::SeqCst), 0);
    assert_eq!(runner.count().await, 1);
    assert_eq!(runner.info("acme/hello").await.unwrap().revision, 7);

    runner.stop().await;
}

#[tokio::test]
async fn test_crash_recovery_after_mount_rebuilds_context() {
    let fixture = fixture();

    let store = StateStore::open(&fixture.state_root).unwrap();
    let id = store.next_tx_id().unwrap();
    let pack_dest = fixture.paths.pack_path("acme", "hello");
    std::fs::create_dir_all(pack_dest.parent().unwrap()).unwrap();
    std::fs::copy(&fixture.pack, &pack_dest).unwrap();
    chef::pack::stage_pack(&pack_dest, &fixture.paths.mount_point("acme", "hello")).unwrap();
    store
        .save_transaction(&Transaction {
            id,
            name: "acme/hello".into(),
            description: "install acme/hello".into(),
            tx_type: TxType::Install,
            state: TxState::GenerateWrappers,
            ephemeral: false,
            revision: Some(7),
            source: None,
            retry_count: 0,
            log: Vec::new(),
        })
        .unwrap();
    drop(store);

    let runner = InstallRunner::new(
        StateStore::open(&fixture.state_root).unwrap(),
        host_actions(&fixture),
    );
    runner.start().await.unwrap();
    runner.drain().await;

    let tx = runner.transaction(id).await.unwrap();
    assert_eq!(tx.state, TxState::Committed);
    assert!(fixture.paths.wrapper_path("hello").exists());
    assert_eq!(runner.count().await, 1);

    runner.stop().await;
}

#[tokio::test]
async fn test_invalid_package_name_yields_sentinel() {
    let fixture = fixture();
    let runner = InstallRunner::new(
        StateStore::open(&fixture.state_root).unwrap(),
        host_actions(&fixture),
    );
    runner.start().await.unwrap();

    assert_eq!(runner.create(TxOptions::install("no-slash", None)).await, 0);
    assert_eq!(
        runner
            .create(TxOptions::install("a/b/c", None))
            .await,
        0
    );
    // Splitting yields exactly two non-empty components.
    assert_eq!(runner.create(TxOptions::install("/hello", None)).await, 0);

    runner.stop().await;
}

#[tokio::test]
async fn test_install_missing_source_fails_with_log() {
    let fixture = fixture();
    let runner = InstallRunner::new(
        StateStore::open(&fixture.state_root).unwrap(),
        host_actions(&fixture),
    );
    runner.start().await.unwrap();

    let id = runner
        .create(TxOptions::install_from(
            "acme/ghost",
            fixture.state_root.join("no-such.pack"),
        ))
        .await;
    runner.drain().await;

    let tx = runner.transaction(id).await.unwrap();
    assert_eq!(tx.state, TxState::Failed);
    assert!(!tx.log.is_empty());
    assert_eq!(runner.count().await, 0);

    runner.stop().await;
}

#[tokio::test]
async fn test_shutdown_sweep_tears_everything_down() {
    let fixture = fixture();
    let runner = InstallRunner::new(
        StateStore::open(&fixture.state_root).unwrap(),
        host_actions(&fixture),
    );
    runner.start().await.unwrap();

    runner
        .create(TxOptions::install_from("acme/hello", &fixture.pack))
        .await;
    runner.drain().await;
    assert!(fixture.paths.mount_point("acme", "hello").exists());

    let id = runner.create(TxOptions::shutdown_sweep()).await;
    runner.drain().await;

    let tx = runner.transaction(id).await.unwrap();
    assert_eq!(tx.state, TxState::Done);
    assert!(tx.ephemeral);
    assert!(!fixture.paths.mount_point("acme", "hello").exists());
    assert!(!fixture.paths.wrapper_path("hello").exists());

    runner.stop().await;
}

#[tokio::test]
async fn test_non_ephemeral_transactions_survive_restart() {
    let fixture = fixture();

    {
        let runner = InstallRunner::new(
            StateStore::open(&fixture.state_root).unwrap(),
            host_actions(&fixture),
        );
        runner.start().await.unwrap();
        runner
            .create(TxOptions::install_from("acme/hello", &fixture.pack))
            .await;
        runner.drain().await;
        runner.stop().await;
    }

    // A fresh runner over the same store sees the committed transaction
    // and the installed application.
    let runner = InstallRunner::new(
        StateStore::open(&fixture.state_root).unwrap(),
        host_actions(&fixture),
    );
    runner.start().await.unwrap();
    assert_eq!(runner.count().await, 1);
    assert_eq!(runner.info("acme/hello").await.unwrap().revision, 7);
    runner.stop().await;
}
