//! cvd - Container Daemon
//!
//! Serves the container service over a Unix socket: create, spawn,
//! kill, upload, download, destroy.
//!
//! ## Usage
//!
//! ```sh
//! cvd [--socket <path>] [--work-root <dir>] [--log-level <filter>]
//! ```

use chef::container::ContainerEngine;
use chef::proto::server::{Connection, bind_socket, default_socket_path};
use chef::proto::{CvdRequest, CvdResponse};
use chef::{Error, SpawnFlags};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Args {
    socket: PathBuf,
    work_root: PathBuf,
    log_level: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        socket: default_socket_path("cvd"),
        work_root: chef::constants::default_work_root(),
        log_level: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" => {
                args.socket = iter.next().ok_or("--socket needs a path")?.into();
            }
            "--work-root" => {
                args.work_root = iter.next().ok_or("--work-root needs a dir")?.into();
            }
            "--log-level" => {
                args.log_level = Some(iter.next().ok_or("--log-level needs a filter")?);
            }
            "--help" | "-h" => {
                println!("usage: cvd [--socket <path>] [--work-root <dir>] [--log-level <filter>]");
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
            eprintln!("cvd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    chef::logging::init(args.log_level.as_deref());

    let engine = Arc::new(ContainerEngine::detect(&args.work_root));
    let listener = match bind_socket(&args.socket) {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind {}: {}", args.socket.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!("cvd ready on {}", args.socket.display());

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
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(engine, Connection::new(stream)).await {
                                debug!("connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        }
    }

    // Tear down every live container before exit.
    for (id, _) in engine.list().await {
        if let Err(e) = engine.destroy(&id).await {
            warn!("destroying '{}' at shutdown: {}", id, e);
        }
    }
    info!("cvd exiting");
    ExitCode::SUCCESS
}

async fn serve_connection(
    engine: Arc<ContainerEngine>,
    mut conn: Connection,
) -> chef::Result<()> {
    while let Some(request) = conn.read::<CvdRequest>().await? {
        let response = handle(&engine, request).await;
        conn.write(&response).await?;
    }
    Ok(())
}

async fn handle(engine: &ContainerEngine, request: CvdRequest) -> CvdResponse {
    let result = dispatch(engine, request).await;
    match result {
        Ok(response) => response,
        Err(e) => CvdResponse::from(&e),
    }
}

async fn dispatch(engine: &ContainerEngine, request: CvdRequest) -> Result<CvdResponse, Error> {
    match request {
        CvdRequest::Create {
            id,
            layers,
            policy,
            hostname,
        } => {
            let config = chef::ContainerConfig {
                id,
                layers: layers.into_iter().map(Into::into).collect(),
                policy,
                capabilities: chef::container::CapabilitySet::EMPTY,
                hostname,
            };
            let container = engine.create(config).await?;
            Ok(CvdResponse::Created {
                cgroup_id: container.cgroup_id,
                rootfs: container.rootfs,
            })
        }
        CvdRequest::Spawn {
            id,
            argv,
            env,
            wait,
        } => {
            let outcome = engine.spawn(&id, &argv, &env, SpawnFlags { wait }).await?;
            Ok(CvdResponse::Spawned {
                pid: outcome.pid,
                exit_code: outcome.exit_code,
            })
        }
        CvdRequest::Kill { id, pid } => {
            engine.kill(&id, pid).await?;
            Ok(CvdResponse::Ok)
        }
        CvdRequest::Upload { id, src, dst } => {
            engine.upload(&id, &src, &dst).await?;
            Ok(CvdResponse::Ok)
        }
        CvdRequest::Download { id, src, dst } => {
            engine.download(&id, &src, &dst).await?;
            Ok(CvdResponse::Ok)
        }
        CvdRequest::Destroy { id } => {
            engine.destroy(&id).await?;
            Ok(CvdResponse::Ok)
        }
    }
}
