//! waiterd - Build Broker Daemon
//!
//! Accepts builder and client connections on one socket. Builders open
//! with a `cook` hello, stream their events upward, and receive
//! forwarded build requests; clients issue build/status/artifact
//! requests. In-flight requests are soft state and die with the broker.
//!
//! ## Usage
//!
//! ```sh
//! waiterd [--socket <path>] [--log-level <filter>]
//! ```

use chef::build::{CookEvent, Waiter};
use chef::proto::server::{Connection, bind_socket, default_socket_path};
use chef::proto::{Hello, WaiterRequest, WaiterResponse};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Args {
    socket: PathBuf,
    log_level: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        socket: default_socket_path("waiterd"),
        log_level: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" => args.socket = iter.next().ok_or("--socket needs a path")?.into(),
            "--log-level" => {
                args.log_level = Some(iter.next().ok_or("--log-level needs a filter")?);
            }
            "--help" | "-h" => {
                println!("usage: waiterd [--socket <path>] [--log-level <filter>]");
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
            eprintln!("waiterd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    chef::logging::init(args.log_level.as_deref());

    let waiter = Waiter::new();
    let listener = match bind_socket(&args.socket) {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind {}: {}", args.socket.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!("waiterd ready on {}", args.socket.display());

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
                        let waiter = Arc::clone(&waiter);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(waiter, Connection::new(stream)).await {
                                debug!("connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        }
    }

    info!("waiterd exiting");
    ExitCode::SUCCESS
}

async fn serve_connection(waiter: Arc<Waiter>, mut conn: Connection) -> chef::Result<()> {
    let Some(hello) = conn.read::<Hello>().await? else {
        return Ok(());
    };
    match hello {
        Hello::Cook => serve_builder(waiter, conn).await,
        Hello::Client => serve_client(waiter, conn).await,
    }
}

/// Builder session: forward requests down, apply events up, and
/// invalidate everything on disconnect.
async fn serve_builder(waiter: Arc<Waiter>, conn: Connection) -> chef::Result<()> {
    let (builder_id, mut forwarded) = waiter.builder_connected().await;
    let (mut reader, mut writer) = conn.split();

    let result = loop {
        tokio::select! {
            request = forwarded.recv() => {
                match request {
                    Some(request) => writer.write(&request).await?,
                    None => break Ok(()),
                }
            }
            event = reader.read::<CookEvent>() => {
                match event {
                    Ok(Some(event)) => waiter.builder_event(builder_id, event).await,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        }
    };

    waiter.builder_disconnected(builder_id).await;
    result
}

/// Client session: request/response, no pushes.
async fn serve_client(waiter: Arc<Waiter>, mut conn: Connection) -> chef::Result<()> {
    while let Some(request) = conn.read::<WaiterRequest>().await? {
        let response = match request {
            WaiterRequest::Build {
                arch,
                platform,
                source_url,
                recipe_path,
            } => match waiter.submit(arch, &platform, &source_url, &recipe_path).await {
                Ok((status, id)) => WaiterResponse::Queued { status, id },
                Err(e) => WaiterResponse::from(&e),
            },
            WaiterRequest::Status { id } => {
                let (arch, status) = waiter.status(&id).await;
                WaiterResponse::Status { arch, status }
            }
            WaiterRequest::Artifact { id, kind } => WaiterResponse::Artifact {
                uri: waiter.artifact(&id, kind).await,
            },
        };
        conn.write(&response).await?;
    }
    Ok(())
}
