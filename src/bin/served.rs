//! served - Installer Daemon
//!
//! Hosts the install state machine: accepts install/remove/info/list
//! requests over a Unix socket, persists transactions, recovers them
//! after restarts, and pushes transaction-log and package events to
//! subscribed clients.
//!
//! ## Usage
//!
//! ```sh
//! served [--socket <path>] [--state-root <dir>] [--packs <dir>]
//!        [--work-root <dir>] [--log-level <filter>]
//! ```

use chef::Paths;
use chef::container::ContainerEngine;
use chef::install::{
    HostActions, InstallRunner, LocalFetcher, StateStore, TxOptions,
};
use chef::proto::server::{Connection, bind_socket, default_socket_path};
use chef::proto::{ServeRequest, ServeResponse};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Args {
    socket: PathBuf,
    state_root: Option<PathBuf>,
    packs: PathBuf,
    work_root: PathBuf,
    log_level: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        socket: default_socket_path("served"),
        state_root: None,
        packs: PathBuf::from("/var/chef/store"),
        work_root: chef::constants::default_work_root(),
        log_level: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" => args.socket = iter.next().ok_or("--socket needs a path")?.into(),
            "--state-root" => {
                args.state_root = Some(iter.next().ok_or("--state-root needs a dir")?.into());
            }
            "--packs" => args.packs = iter.next().ok_or("--packs needs a dir")?.into(),
            "--work-root" => args.work_root = iter.next().ok_or("--work-root needs a dir")?.into(),
            "--log-level" => {
                args.log_level = Some(iter.next().ok_or("--log-level needs a filter")?);
            }
            "--help" | "-h" => {
                println!(
                    "usage: served [--socket <path>] [--state-root <dir>] [--packs <dir>] \
                     [--work-root <dir>] [--log-level <filter>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("served: {}", e);
            return ExitCode::FAILURE;
        }
    };
    chef::logging::init(args.log_level.as_deref());

    let paths = Paths::from_env();
    let state_root = args.state_root.clone().unwrap_or_else(|| paths.state_root());
    let store = match StateStore::open(&state_root) {
        Ok(store) => store,
        Err(e) => {
            error!("cannot open state store at {}: {}", state_root.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let engine = Arc::new(ContainerEngine::detect(&args.work_root));
    let actions = Arc::new(HostActions::new(
        paths,
        Arc::new(LocalFetcher::new(&args.packs)),
        Some(engine),
    ));
    let runner = Arc::new(InstallRunner::new(store, actions));
    if let Err(e) = runner.start().await {
        error!("cannot start install runner: {}", e);
        return ExitCode::FAILURE;
    }

    let listener = match bind_socket(&args.socket) {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind {}: {}", args.socket.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!("served ready on {}", args.socket.display());

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install signal handler: {}", e);
            return ExitCode::FAILURE;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let runner = Arc::clone(&runner);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(runner, Connection::new(stream)).await {
                                debug!("connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        }
    }

    // Flush started transactions before exit.
    info!("served stopping, persisting ongoing transactions");
    runner.stop().await;
    ExitCode::SUCCESS
}

async fn serve_connection(runner: Arc<InstallRunner>, mut conn: Connection) -> chef::Result<()> {
    while let Some(request) = conn.read::<ServeRequest>().await? {
        match request {
            ServeRequest::Subscribe => {
                conn.write(&ServeResponse::Ok).await?;
                let mut events = runner.subscribe();
                while let Ok(event) = events.recv().await {
                    conn.write(&ServeResponse::Event { event }).await?;
                }
                return Ok(());
            }
            other => {
                let response = handle(&runner, other).await;
                conn.write(&response).await?;
            }
        }
    }
    Ok(())
}

/// Derives `publisher/package` from a `<publisher>-<package>.pack` file
/// name.
fn name_from_pack_path(path: &std::path::Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let (publisher, package) = stem.split_once('-')?;
    if publisher.is_empty() || package.is_empty() {
        return None;
    }
    Some(format!("{}/{}", publisher, package))
}

async fn handle(runner: &InstallRunner, request: ServeRequest) -> ServeResponse {
    match request {
        ServeRequest::Install { path, package } => {
            let Some(name) = package.or_else(|| name_from_pack_path(&path)) else {
                return ServeResponse::Error {
                    kind: chef::ErrorKind::InvalidArgument,
                    message: format!(
                        "cannot derive a package name from {}",
                        path.display()
                    ),
                };
            };
            let id = runner.create(TxOptions::install_from(name, path)).await;
            ServeResponse::Transaction { id }
        }
        ServeRequest::InstallFromStore {
            package,
            channel,
            revision,
        } => {
            // Channel resolution happens store-side; it rides along in
            // the description for the log.
            let mut options = TxOptions::install(package, revision);
            if let Some(channel) = channel {
                options.description = format!("{} ({})", options.description, channel);
            }
            let id = runner.create(options).await;
            ServeResponse::Transaction { id }
        }
        ServeRequest::Remove { package } => {
            let id = runner.create(TxOptions::uninstall(package)).await;
            ServeResponse::Transaction { id }
        }
        ServeRequest::Info { package } => match runner.info(&package).await {
            Ok(app) => ServeResponse::App { app },
            Err(e) => ServeResponse::from(&e),
        },
        ServeRequest::ListCount => ServeResponse::Count {
            count: runner.count().await,
        },
        ServeRequest::List => ServeResponse::Apps {
            apps: runner.applications().await,
        },
        ServeRequest::Subscribe => ServeResponse::Ok,
    }
}
