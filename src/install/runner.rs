//! # Install Runner
//!
//! A single background worker owns the list of live transactions. At
//! start-up it reconstructs non-ephemeral transactions from the
//! persistent store in the state they were last in, then executes each
//! transaction's current state handler; the handler's outcome posts an
//! OK or FAIL event which advances (or diverts) the state per the
//! type's constant state set.
//!
//! ## Persistence discipline
//!
//! The successor state is persisted **before** its handler runs. A crash
//! between persisting and executing replays the handler on restart,
//! which is safe because every action is idempotent; a crash before
//! persisting re-runs the previous handler instead. Either way the
//! resumed state equals the last state successfully persisted.
//!
//! ## Locking
//!
//! All persisted fields are touched only under the state lock. Handlers
//! run their single side effect outside it, so a slow download never
//! blocks `create` or client queries; shutdown delivers a cancellation
//! signal that suspension points (the retry backoff, blocking actions)
//! observe.

use super::actions::InstallActions;
use super::app::Application;
use super::state::{ProtocolState, TxState, TxType, map_state, next_state};
use super::store::StateStore;
use super::transaction::{LogEntry, LogLevel, Transaction};
use crate::constants::{
    DOWNLOAD_RETRY_BACKOFF, DOWNLOAD_RETRY_BACKOFF_MAX, DOWNLOAD_RETRY_MAX, RESERVED_TX_ID,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tracing::{debug, error, info, warn};

/// Events emitted to connected protocol clients.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstallEvent {
    TransactionLog {
        id: u64,
        level: LogLevel,
        timestamp: DateTime<Utc>,
        state: ProtocolState,
        message: String,
    },
    PackageInstalled {
        name: String,
        revision: u64,
    },
    PackageRemoved {
        name: String,
    },
    PackageUpdated {
        name: String,
        revision: u64,
    },
}

/// Options for [`InstallRunner::create`].
#[derive(Debug, Clone)]
pub struct TxOptions {
    pub tx_type: TxType,
    pub name: String,
    pub description: String,
    pub ephemeral: bool,
    pub revision: Option<u64>,
    pub source: Option<PathBuf>,
}

impl TxOptions {
    /// Install from the package store.
    pub fn install(name: impl Into<String>, revision: Option<u64>) -> Self {
        let name = name.into();
        Self {
            description: format!("install {}", name),
            tx_type: TxType::Install,
            name,
            ephemeral: false,
            revision,
            source: None,
        }
    }

    /// Install from a local pack archive.
    pub fn install_from(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        let mut options = Self::install(name, None);
        options.source = Some(source.into());
        options
    }

    /// Uninstall an installed package.
    pub fn uninstall(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: format!("uninstall {}", name),
            tx_type: TxType::Uninstall,
            name,
            ephemeral: false,
            revision: None,
            source: None,
        }
    }

    /// Update an installed package to a new revision.
    pub fn update(name: impl Into<String>, revision: Option<u64>) -> Self {
        let name = name.into();
        Self {
            description: format!("update {}", name),
            tx_type: TxType::Update,
            name,
            ephemeral: false,
            revision,
            source: None,
        }
    }

    /// System shutdown sweep over all installed packages.
    pub fn shutdown_sweep() -> Self {
        Self {
            description: "shutdown sweep".into(),
            tx_type: TxType::ShutdownSweep,
            name: String::new(),
            ephemeral: true,
            revision: None,
            source: None,
        }
    }
}

struct Shared {
    transactions: Vec<Transaction>,
    applications: Vec<Application>,
    /// Applications under construction, keyed by transaction id.
    pending: HashMap<u64, Application>,
}

struct Inner {
    actions: Arc<dyn InstallActions>,
    store: StateStore,
    state: Mutex<Shared>,
    events: broadcast::Sender<InstallEvent>,
    work: Notify,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

/// The install state machine runner.
pub struct InstallRunner {
    inner: Arc<Inner>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl InstallRunner {
    /// Builds a runner over a store and an actions implementation.
    pub fn new(store: StateStore, actions: Arc<dyn InstallActions>) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                actions,
                store,
                state: Mutex::new(Shared {
                    transactions: Vec::new(),
                    applications: Vec::new(),
                    pending: HashMap::new(),
                }),
                events,
                work: Notify::new(),
                shutdown,
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Recovers persisted state and starts the background worker.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.shutdown.send(false);

        {
            let mut shared = self.inner.state.lock().await;
            shared.applications = self.inner.store.load_applications()?;
            let recovered = self.inner.store.load_transactions()?;
            for tx in recovered {
                if !tx.is_terminal() {
                    info!(
                        "resuming transaction {} ({}) at state '{}'",
                        tx.id, tx.name, tx.state
                    );
                }
                shared.transactions.push(tx);
            }
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { worker_loop(inner).await });
        *self.worker.lock().await = Some(handle);
        self.inner.work.notify_one();
        Ok(())
    }

    /// Requests shutdown and waits for the worker to persist ongoing
    /// state and exit.
    pub async fn stop(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        self.inner.work.notify_one();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// True while the worker is active.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Allocates a new transaction; returns its id, or the reserved
    /// sentinel `0` when admission fails.
    pub async fn create(&self, options: TxOptions) -> u64 {
        if options.tx_type != TxType::ShutdownSweep
            && crate::constants::split_package_name(&options.name).is_err()
        {
            warn!("rejecting transaction with invalid name '{}'", options.name);
            return RESERVED_TX_ID;
        }

        let id = match self.inner.store.next_tx_id() {
            Ok(id) => id,
            Err(e) => {
                error!("cannot allocate transaction id: {}", e);
                return RESERVED_TX_ID;
            }
        };

        let tx = Transaction {
            id,
            name: options.name,
            description: options.description,
            tx_type: options.tx_type,
            state: options.tx_type.initial_state(),
            ephemeral: options.ephemeral,
            revision: options.revision,
            source: options.source,
            retry_count: 0,
            log: Vec::new(),
        };

        if let Err(e) = self.inner.store.save_transaction(&tx) {
            error!("cannot persist transaction {}: {}", id, e);
            return RESERVED_TX_ID;
        }

        self.inner.state.lock().await.transactions.push(tx);
        self.inner
            .log(id, LogLevel::Info, "transaction created")
            .await;
        self.inner.work.notify_one();
        id
    }

    /// Records a structured log entry and emits it as a protocol event.
    pub async fn log(&self, id: u64, level: LogLevel, message: impl Into<String>) {
        self.inner.log(id, level, message).await;
    }

    /// Subscribes to installer events.
    pub fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.inner.events.subscribe()
    }

    /// Installed applications.
    pub async fn applications(&self) -> Vec<Application> {
        self.inner.state.lock().await.applications.clone()
    }

    /// Number of installed applications.
    pub async fn count(&self) -> usize {
        self.inner.state.lock().await.applications.len()
    }

    /// Installed-package record by `publisher/package` name.
    pub async fn info(&self, name: &str) -> Result<Application> {
        self.inner
            .state
            .lock()
            .await
            .applications
            .iter()
            .find(|a| a.name() == name)
            .cloned()
            .ok_or_else(|| Error::PackageNotFound(name.to_string()))
    }

    /// Snapshot of a transaction.
    pub async fn transaction(&self, id: u64) -> Option<Transaction> {
        self.inner
            .state
            .lock()
            .await
            .transactions
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Waits until every known transaction is terminal.
    pub async fn drain(&self) {
        loop {
            {
                let shared = self.inner.state.lock().await;
                if shared.transactions.iter().all(|t| t.is_terminal()) {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

impl Inner {
    async fn log(&self, id: u64, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let mut shared = self.state.lock().await;
        let Some(tx) = shared.transactions.iter_mut().find(|t| t.id == id) else {
            return;
        };
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            state: tx.state,
            message: message.clone(),
        };
        let state = tx.state;
        let ephemeral = tx.ephemeral;
        tx.log.push(entry.clone());
        drop(shared);

        if !ephemeral
            && let Err(e) = self.store.append_log(id, &entry)
        {
            warn!("cannot persist log for transaction {}: {}", id, e);
        }
        let _ = self.events.send(InstallEvent::TransactionLog {
            id,
            level,
            timestamp: entry.timestamp,
            state: map_state(state),
            message,
        });
    }
}

// =============================================================================
// Worker
// =============================================================================

async fn worker_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            persist_ongoing(&inner).await;
            debug!("install runner worker exiting");
            return;
        }

        let next = {
            let shared = inner.state.lock().await;
            shared
                .transactions
                .iter()
                .find(|t| !t.is_terminal())
                .map(|t| t.id)
        };

        match next {
            Some(id) => step(&inner, id).await,
            None => {
                tokio::select! {
                    _ = inner.work.notified() => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Persist the ongoing state of every live transaction before exit.
async fn persist_ongoing(inner: &Inner) {
    let shared = inner.state.lock().await;
    for tx in &shared.transactions {
        if !tx.is_terminal()
            && let Err(e) = inner.store.save_transaction(tx)
        {
            error!("cannot persist transaction {} at shutdown: {}", tx.id, e);
        }
    }
}

/// Runs one state handler and advances the transaction.
async fn step(inner: &Arc<Inner>, id: u64) {
    // Snapshot under the state lock; the side effect runs outside it.
    let (tx, installed, pending) = {
        let shared = inner.state.lock().await;
        let Some(tx) = shared.transactions.iter().find(|t| t.id == id) else {
            return;
        };
        let installed = shared
            .applications
            .iter()
            .find(|a| a.name() == tx.name)
            .cloned();
        (tx.clone(), installed, shared.pending.get(&id).cloned())
    };

    let state = tx.state;
    let outcome = dispatch(inner, &tx, installed.as_ref(), pending).await;

    let ok = match &outcome {
        StepOutcome::Ok { .. } => true,
        StepOutcome::Fail(reason) => {
            inner
                .log(id, LogLevel::Error, format!("{}: {}", state, reason))
                .await;
            false
        }
    };

    // Advance under the state lock; persisting the successor before its
    // handler runs is what crash recovery leans on.
    let mut shared = inner.state.lock().await;
    let (tx_type, current) = match shared.transactions.iter().find(|t| t.id == id) {
        Some(t) => (t.tx_type, t.state),
        None => return,
    };
    if current != state {
        // A concurrent mutation would violate the single-worker contract.
        warn!(
            "transaction {} moved from '{}' underneath the worker",
            id, state
        );
        return;
    }

    let mut next = next_state(tx_type.state_set(), state, ok).unwrap_or_else(|| {
        warn!("state '{}' not in the {} set", state, tx_type);
        TxState::Failed
    });

    if let StepOutcome::Ok { app, retry_bumped } = outcome {
        if let Some(app) = app {
            shared.pending.insert(id, app);
        }
        if retry_bumped
            && let Some(tx) = shared.transactions.iter_mut().find(|t| t.id == id)
        {
            tx.retry_count += 1;
        }
    }

    let name = {
        let Some(tx) = shared.transactions.iter_mut().find(|t| t.id == id) else {
            return;
        };
        tx.state = next;
        if let Err(e) = inner.store.save_transaction(tx) {
            // A store failure blocks the transition: divert to the fail
            // successor and keep the in-memory state consistent with it.
            error!("cannot persist transaction {}: {}", id, e);
            next = next_state(tx_type.state_set(), state, false).unwrap_or(TxState::Failed);
            tx.state = next;
            let _ = inner.store.save_transaction(tx);
        }
        tx.name.clone()
    };
    drop(shared);

    inner
        .log(
            id,
            if ok { LogLevel::Info } else { LogLevel::Warning },
            format!("'{}' -> '{}'", state, next),
        )
        .await;

    if next.is_terminal() {
        finalize(inner, id, tx_type, &name, next).await;
    }
}

enum StepOutcome {
    Ok {
        app: Option<Application>,
        retry_bumped: bool,
    },
    Fail(String),
}

impl StepOutcome {
    fn ok() -> Self {
        Self::Ok {
            app: None,
            retry_bumped: false,
        }
    }
}

async fn dispatch(
    inner: &Arc<Inner>,
    tx: &Transaction,
    installed: Option<&Application>,
    pending: Option<Application>,
) -> StepOutcome {
    let actions = &inner.actions;

    // The application a handler operates on: the one under construction
    // for install flows, the installed record for teardown flows. A
    // restart loses the in-memory pending record; install-flow handlers
    // rebuild it from the loaded manifest, which `load` re-reads
    // idempotently.
    let mut rebuilt = false;
    let subject = match tx.tx_type {
        TxType::Install | TxType::Update => match pending.clone() {
            Some(app) => Some(app),
            None if matches!(
                tx.state,
                TxState::Mount | TxState::GenerateWrappers | TxState::StartServices
            ) =>
            {
                match actions.load(tx).await {
                    Ok(manifest) => {
                        rebuilt = true;
                        Some(Application {
                            publisher: tx.publisher().to_string(),
                            package: tx.package().to_string(),
                            revision: manifest.revision,
                            commands: manifest.commands,
                            mount: None,
                            container: None,
                        })
                    }
                    Err(_) => None,
                }
            }
            None => installed.cloned(),
        },
        TxType::Uninstall | TxType::ShutdownSweep => installed.cloned(),
    };

    let result: Result<StepOutcome> = match tx.state {
        TxState::Verify => actions
            .verify(tx, installed)
            .await
            .map(|_| StepOutcome::ok()),
        TxState::Download => actions.download(tx).await.map(|_| StepOutcome::ok()),
        TxState::DownloadRetry => {
            if tx.retry_count >= DOWNLOAD_RETRY_MAX {
                Err(Error::Internal(format!(
                    "download failed after {} attempts",
                    tx.retry_count
                )))
            } else {
                let backoff = DOWNLOAD_RETRY_BACKOFF
                    .saturating_mul(1 << tx.retry_count.min(4))
                    .min(DOWNLOAD_RETRY_BACKOFF_MAX);
                inner
                    .log(
                        tx.id,
                        LogLevel::Info,
                        format!("retrying download in {:?}", backoff),
                    )
                    .await;
                let mut shutdown = inner.shutdown.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => Ok(StepOutcome::Ok {
                        app: None,
                        retry_bumped: true,
                    }),
                    _ = shutdown.wait_for(|s| *s) => {
                        Err(Error::Cancelled("runner shutdown".into()))
                    }
                }
            }
        }
        TxState::Load => actions.load(tx).await.map(|manifest| StepOutcome::Ok {
            app: Some(Application {
                publisher: tx.publisher().to_string(),
                package: tx.package().to_string(),
                revision: manifest.revision,
                commands: manifest.commands,
                mount: None,
                container: None,
            }),
            retry_bumped: false,
        }),
        TxState::Mount => actions.mount(tx).await.map(|mount| StepOutcome::Ok {
            app: subject.map(|mut app| {
                app.mount = Some(mount);
                app
            }),
            retry_bumped: false,
        }),
        TxState::Unmount => actions.unmount(tx).await.map(|_| StepOutcome::ok()),
        TxState::GenerateWrappers => match &subject {
            Some(app) => actions.generate_wrappers(app).await.map(|_| StepOutcome::Ok {
                app: rebuilt.then(|| app.clone()),
                retry_bumped: false,
            }),
            None => Err(Error::Internal("no application for wrappers".into())),
        },
        TxState::RemoveWrappers => match &subject {
            Some(app) => actions.remove_wrappers(app).await.map(|_| StepOutcome::ok()),
            None => Ok(StepOutcome::ok()),
        },
        TxState::StartServices => match subject {
            Some(app) => actions
                .start_services(&app)
                .await
                .map(|container| StepOutcome::Ok {
                    app: Some(Application {
                        container,
                        ..app
                    }),
                    retry_bumped: false,
                }),
            None => Err(Error::Internal("no application for services".into())),
        },
        TxState::StopServices => match &subject {
            Some(app) => actions.stop_services(app).await.map(|_| StepOutcome::ok()),
            None => Ok(StepOutcome::ok()),
        },
        TxState::Unload => actions.unload(tx).await.map(|_| StepOutcome::ok()),
        TxState::Uninstall => actions.uninstall(tx).await.map(|_| StepOutcome::ok()),
        TxState::StopServicesAll
        | TxState::RemoveWrappersAll
        | TxState::UnmountAll
        | TxState::UnloadAll => sweep(inner, tx).await.map(|_| StepOutcome::ok()),
        TxState::Committed | TxState::Failed | TxState::Done => {
            // Terminal states have no handler.
            Ok(StepOutcome::ok())
        }
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) => StepOutcome::Fail(e.to_string()),
    }
}

/// One sweep step applied over every installed application. Per-package
/// failures are logged and do not stop the sweep.
async fn sweep(inner: &Arc<Inner>, tx: &Transaction) -> Result<()> {
    let applications = inner.state.lock().await.applications.clone();
    for app in &applications {
        let result = match tx.state {
            TxState::StopServicesAll => inner.actions.stop_services(app).await,
            TxState::RemoveWrappersAll => inner.actions.remove_wrappers(app).await,
            TxState::UnmountAll => {
                let sweep_tx = Transaction {
                    name: app.name(),
                    ..tx.clone()
                };
                inner.actions.unmount(&sweep_tx).await
            }
            TxState::UnloadAll => {
                let sweep_tx = Transaction {
                    name: app.name(),
                    ..tx.clone()
                };
                inner.actions.unload(&sweep_tx).await
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            inner
                .log(
                    tx.id,
                    LogLevel::Warning,
                    format!("sweep '{}' on {}: {}", tx.state, app.name(), e),
                )
                .await;
        }
    }
    Ok(())
}

/// Bookkeeping when a transaction reaches a terminal state.
async fn finalize(inner: &Arc<Inner>, id: u64, tx_type: TxType, name: &str, state: TxState) {
    if state != TxState::Committed {
        inner.state.lock().await.pending.remove(&id);
        if state == TxState::Failed {
            inner
                .log(id, LogLevel::Error, "transaction failed")
                .await;
        }
        return;
    }

    let mut shared = inner.state.lock().await;
    match tx_type {
        TxType::Install | TxType::Update => {
            let Some(app) = shared.pending.remove(&id) else {
                warn!("transaction {} committed without an application", id);
                return;
            };
            let revision = app.revision;
            shared.applications.retain(|a| a.name() != app.name());
            shared.applications.push(app);
            if let Err(e) = inner.store.save_applications(&shared.applications) {
                error!("cannot persist applications: {}", e);
            }
            drop(shared);
            let event = if tx_type == TxType::Install {
                InstallEvent::PackageInstalled {
                    name: name.to_string(),
                    revision,
                }
            } else {
                InstallEvent::PackageUpdated {
                    name: name.to_string(),
                    revision,
                }
            };
            let _ = inner.events.send(event);
        }
        TxType::Uninstall => {
            shared.applications.retain(|a| a.name() != name);
            if let Err(e) = inner.store.save_applications(&shared.applications) {
                error!("cannot persist applications: {}", e);
            }
            drop(shared);
            let _ = inner.events.send(InstallEvent::PackageRemoved {
                name: name.to_string(),
            });
        }
        TxType::ShutdownSweep => {
            drop(shared);
        }
    }
    inner.log(id, LogLevel::Info, "committed").await;
}
