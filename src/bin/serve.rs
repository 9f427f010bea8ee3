//! serve - Installer Client
//!
//! Talks to `served`: installs local packs, removes packages, queries
//! installed state, and follows installer events.
//!
//! ## Usage
//!
//! ```sh
//! serve install <pack-path> [<publisher/package>]
//! serve remove <publisher/package>
//! serve info <publisher/package>
//! serve list
//! serve count
//! serve events
//! ```

use chef::proto::client::UdsClient;
use chef::proto::server::default_socket_path;
use chef::proto::{ServeRequest, ServeResponse};
use std::path::PathBuf;
use std::process::ExitCode;

fn usage() -> ! {
    eprintln!(
        "usage: serve [--socket <path>] <command>\n\
         \n\
         commands:\n\
         \x20 install <pack-path> [<publisher/package>]\n\
         \x20 remove <publisher/package>\n\
         \x20 info <publisher/package>\n\
         \x20 list\n\
         \x20 count\n\
         \x20 events"
    );
    std::process::exit(2);
}

fn parse_args() -> (PathBuf, ServeRequest) {
    let mut socket = default_socket_path("served");
    let mut rest: Vec<String> = Vec::new();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" => match iter.next() {
                Some(path) => socket = path.into(),
                None => usage(),
            },
            "--help" | "-h" => usage(),
            _ => rest.push(arg),
        }
    }

    let request = match rest.first().map(String::as_str) {
        Some("install") => match rest.get(1) {
            Some(path) => ServeRequest::Install {
                path: path.into(),
                package: rest.get(2).cloned(),
            },
            None => usage(),
        },
        Some("remove") => match rest.get(1) {
            Some(package) => ServeRequest::Remove {
                package: package.clone(),
            },
            None => usage(),
        },
        Some("info") => match rest.get(1) {
            Some(package) => ServeRequest::Info {
                package: package.clone(),
            },
            None => usage(),
        },
        Some("list") => ServeRequest::List,
        Some("count") => ServeRequest::ListCount,
        Some("events") => ServeRequest::Subscribe,
        _ => usage(),
    };
    (socket, request)
}

#[tokio::main]
async fn main() -> ExitCode {
    let (socket, request) = parse_args();
    chef::logging::init(Some("warn"));
    let client = UdsClient::new(socket);

    if matches!(request, ServeRequest::Subscribe) {
        return follow_events(client).await;
    }

    let response: ServeResponse = match client.call(&request).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("serve: {}", e);
            return ExitCode::FAILURE;
        }
    };
    print_response(response)
}

fn print_response(response: ServeResponse) -> ExitCode {
    match response {
        ServeResponse::Ok => ExitCode::SUCCESS,
        ServeResponse::Transaction { id } => {
            if id == chef::constants::RESERVED_TX_ID {
                eprintln!("serve: transaction rejected");
                return ExitCode::FAILURE;
            }
            println!("transaction {}", id);
            ExitCode::SUCCESS
        }
        ServeResponse::App { app } => {
            println!(
                "{} revision {} ({} command(s))",
                app.name(),
                app.revision,
                app.commands.len()
            );
            ExitCode::SUCCESS
        }
        ServeResponse::Apps { apps } => {
            for app in apps {
                println!("{} {}", app.name(), app.revision);
            }
            ExitCode::SUCCESS
        }
        ServeResponse::Count { count } => {
            println!("{}", count);
            ExitCode::SUCCESS
        }
        ServeResponse::Event { .. } => ExitCode::SUCCESS,
        ServeResponse::Error { kind, message } => {
            eprintln!("serve: {}: {}", kind, message);
            ExitCode::FAILURE
        }
    }
}

async fn follow_events(client: UdsClient) -> ExitCode {
    let mut stream = match client.connect().await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("serve: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = stream.send(&ServeRequest::Subscribe).await {
        eprintln!("serve: {}", e);
        return ExitCode::FAILURE;
    }

    loop {
        match stream.receive::<ServeResponse>().await {
            Ok(Some(ServeResponse::Event { event })) => match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{:?}", event),
            },
            Ok(Some(_)) => {}
            Ok(None) => return ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("serve: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
}
