//! order - Store Install Client
//!
//! Orders packages from the package store through `served`:
//! `install_from_store` with an optional channel and revision, then
//! optionally follows the transaction's events until it settles.
//!
//! ## Usage
//!
//! ```sh
//! order <publisher/package> [--channel <name>] [--revision <n>] [--wait]
//! ```

use chef::install::{InstallEvent, ProtocolState};
use chef::proto::client::UdsClient;
use chef::proto::server::default_socket_path;
use chef::proto::{ServeRequest, ServeResponse};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug)]
struct Args {
    socket: PathBuf,
    package: String,
    channel: Option<String>,
    revision: Option<u64>,
    wait: bool,
}

fn usage() -> ! {
    eprintln!(
        "usage: order [--socket <path>] <publisher/package> \
         [--channel <name>] [--revision <n>] [--wait]"
    );
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut args = Args {
        socket: default_socket_path("served"),
        package: String::new(),
        channel: None,
        revision: None,
        wait: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" => match iter.next() {
                Some(path) => args.socket = path.into(),
                None => usage(),
            },
            "--channel" => match iter.next() {
                Some(channel) => args.channel = Some(channel),
                None => usage(),
            },
            "--revision" => match iter.next().and_then(|r| r.parse().ok()) {
                Some(revision) => args.revision = Some(revision),
                None => usage(),
            },
            "--wait" => args.wait = true,
            "--help" | "-h" => usage(),
            _ if args.package.is_empty() => args.package = arg,
            _ => usage(),
        }
    }
    if args.package.is_empty() {
        usage();
    }
    args
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = parse_args();
    chef::logging::init(Some("warn"));
    let client = UdsClient::new(&args.socket);

    // Subscribe before ordering so no event of our transaction is lost.
    let mut events = if args.wait {
        let mut stream = match client.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("order: {}", e);
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = stream.send(&ServeRequest::Subscribe).await {
            eprintln!("order: {}", e);
            return ExitCode::FAILURE;
        }
        Some(stream)
    } else {
        None
    };

    let request = ServeRequest::InstallFromStore {
        package: args.package.clone(),
        channel: args.channel.clone(),
        revision: args.revision,
    };
    let response: ServeResponse = match client.call(&request).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("order: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let id = match response {
        ServeResponse::Transaction { id } if id != chef::constants::RESERVED_TX_ID => id,
        ServeResponse::Transaction { .. } => {
            eprintln!("order: transaction rejected");
            return ExitCode::FAILURE;
        }
        ServeResponse::Error { kind, message } => {
            eprintln!("order: {}: {}", kind, message);
            return ExitCode::FAILURE;
        }
        other => {
            eprintln!("order: unexpected response: {:?}", other);
            return ExitCode::FAILURE;
        }
    };
    println!("transaction {}", id);

    let Some(stream) = events.as_mut() else {
        return ExitCode::SUCCESS;
    };

    // Follow our transaction's log until it reaches a terminal state.
    loop {
        match stream.receive::<ServeResponse>().await {
            Ok(Some(ServeResponse::Event { event })) => match event {
                InstallEvent::TransactionLog {
                    id: event_id,
                    state,
                    message,
                    ..
                } if event_id == id => {
                    println!("[{}] {}", state_name(state), message);
                    match state {
                        ProtocolState::Committed | ProtocolState::Done => {
                            return ExitCode::SUCCESS;
                        }
                        ProtocolState::Failed => return ExitCode::FAILURE,
                        _ => {}
                    }
                }
                InstallEvent::PackageInstalled { name, revision }
                    if name == args.package =>
                {
                    println!("installed {} revision {}", name, revision);
                    return ExitCode::SUCCESS;
                }
                _ => {}
            },
            Ok(Some(_)) => {}
            Ok(None) => {
                eprintln!("order: server closed the event stream");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                eprintln!("order: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
}

fn state_name(state: ProtocolState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", state))
}
