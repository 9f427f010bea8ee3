//! cookd - Builder Daemon
//!
//! Connects to the broker, announces its architecture set, and executes
//! forwarded build requests inside containers, streaming status and
//! artifact events back.
//!
//! ## Usage
//!
//! ```sh
//! cookd --base-rootfs <dir> [--waiter <socket>] [--arch <list>]
//!       [--ingredients <dir>] [--artifacts <dir>] [--work-root <dir>]
//!       [--bakectl <path>] [--log-level <filter>]
//! ```

use chef::build::{BuildRequest, Cook, CookConfig, FileFetcher};
use chef::constants::DEFAULT_SCRATCH_SIZE;
use chef::container::ContainerEngine;
use chef::platform::{Arch, ArchMask, Platform};
use chef::proto::Hello;
use chef::proto::client::UdsClient;
use chef::proto::server::default_socket_path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug)]
struct Args {
    waiter: PathBuf,
    arches: ArchMask,
    base_rootfs: PathBuf,
    ingredients: PathBuf,
    artifacts: PathBuf,
    work_root: PathBuf,
    bakectl: String,
    log_level: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        waiter: default_socket_path("waiterd"),
        arches: ArchMask::single(Platform::detect().arch),
        base_rootfs: PathBuf::new(),
        ingredients: PathBuf::from("/var/chef/ingredients"),
        artifacts: PathBuf::from("/var/chef/artifacts"),
        work_root: chef::constants::default_work_root(),
        bakectl: "/usr/bin/bakectl".to_string(),
        log_level: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--waiter" => args.waiter = iter.next().ok_or("--waiter needs a path")?.into(),
            "--arch" => {
                let list = iter.next().ok_or("--arch needs a list")?;
                let mut mask = ArchMask::EMPTY;
                for name in list.split(',') {
                    let arch = Arch::parse(name.trim())
                        .ok_or_else(|| format!("unknown architecture: {}", name))?;
                    mask = mask.with(arch);
                }
                args.arches = mask;
            }
            "--base-rootfs" => {
                args.base_rootfs = iter.next().ok_or("--base-rootfs needs a dir")?.into();
            }
            "--ingredients" => {
                args.ingredients = iter.next().ok_or("--ingredients needs a dir")?.into();
            }
            "--artifacts" => args.artifacts = iter.next().ok_or("--artifacts needs a dir")?.into(),
            "--work-root" => args.work_root = iter.next().ok_or("--work-root needs a dir")?.into(),
            "--bakectl" => args.bakectl = iter.next().ok_or("--bakectl needs a path")?,
            "--log-level" => {
                args.log_level = Some(iter.next().ok_or("--log-level needs a filter")?);
            }
            "--help" | "-h" => {
                println!(
                    "usage: cookd --base-rootfs <dir> [--waiter <socket>] [--arch <list>] \
                     [--ingredients <dir>] [--artifacts <dir>] [--work-root <dir>] \
                     [--bakectl <path>] [--log-level <filter>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    if args.base_rootfs.as_os_str().is_empty() {
        return Err("--base-rootfs is required".into());
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("cookd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    chef::logging::init(args.log_level.as_deref());

    let engine = Arc::new(ContainerEngine::detect(&args.work_root));
    let config = CookConfig {
        arches: args.arches,
        base_rootfs: args.base_rootfs.clone(),
        ingredients_dir: args.ingredients.clone(),
        artifacts_dir: args.artifacts.clone(),
        scratch_size: DEFAULT_SCRATCH_SIZE,
        bakectl: args.bakectl.clone(),
    };
    let (cook, mut events) = Cook::new(config, engine, Arc::new(FileFetcher::new()));

    // Broker session: hello, ready, then stream events up and requests
    // down until one side goes away.
    let client = UdsClient::new(&args.waiter);
    let mut stream = match client.connect().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("cannot reach waiterd at {}: {}", args.waiter.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = stream.send(&Hello::Cook).await {
        error!("handshake failed: {}", e);
        return ExitCode::FAILURE;
    }
    let (mut broker_rx, mut broker_tx) = stream.into_split();

    let worker = tokio::spawn(Arc::clone(&cook).run());
    cook.announce_ready();
    info!(
        "cookd serving [{}] via {}",
        args.arches,
        args.waiter.display()
    );

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install signal handler: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break ExitCode::SUCCESS,
            _ = sigterm.recv() => break ExitCode::SUCCESS,
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Err(e) = broker_tx.send(&event).await {
                            error!("lost broker connection: {}", e);
                            break ExitCode::FAILURE;
                        }
                    }
                    None => break ExitCode::SUCCESS,
                }
            }
            request = broker_rx.receive::<BuildRequest>() => {
                match request {
                    Ok(Some(request)) => {
                        if let Err(e) = cook.submit(request).await {
                            warn!("rejected forwarded request: {}", e);
                        }
                    }
                    Ok(None) => {
                        error!("broker closed the connection");
                        break ExitCode::FAILURE;
                    }
                    Err(e) => {
                        error!("broker stream error: {}", e);
                        break ExitCode::FAILURE;
                    }
                }
            }
        }
    };

    cook.stop();
    let _ = worker.await;
    info!("cookd exiting");
    code
}
