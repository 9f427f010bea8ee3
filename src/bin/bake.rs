//! bake - Build Client
//!
//! Submits build requests to the broker and queries their status and
//! artifacts.
//!
//! ## Usage
//!
//! ```sh
//! bake build <arch> <source-url> <recipe-path> [--platform <name>]
//! bake status <id>
//! bake artifact <id> <log|package>
//! ```

use chef::build::ArtifactKind;
use chef::platform::Arch;
use chef::proto::client::UdsClient;
use chef::proto::server::default_socket_path;
use chef::proto::{WaiterRequest, WaiterResponse};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug)]
enum Command {
    Build {
        arch: Arch,
        source_url: String,
        recipe_path: String,
        platform: String,
    },
    Status {
        id: String,
    },
    Artifact {
        id: String,
        kind: ArtifactKind,
    },
}

fn usage() -> ! {
    eprintln!(
        "usage: bake [--waiter <socket>] <command>\n\
         \n\
         commands:\n\
         \x20 build <arch> <source-url> <recipe-path> [--platform <name>]\n\
         \x20 status <id>\n\
         \x20 artifact <id> <log|package>"
    );
    std::process::exit(2);
}

fn parse_args() -> (PathBuf, Command) {
    let mut socket = default_socket_path("waiterd");
    let mut rest: Vec<String> = Vec::new();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--waiter" => match iter.next() {
                Some(path) => socket = path.into(),
                None => usage(),
            },
            "--help" | "-h" => usage(),
            _ => rest.push(arg),
        }
    }

    let command = match rest.first().map(String::as_str) {
        Some("build") => {
            if rest.len() < 4 {
                usage();
            }
            let Some(arch) = Arch::parse(&rest[1]) else {
                eprintln!("bake: unknown architecture '{}'", rest[1]);
                std::process::exit(2);
            };
            let platform = match rest.get(4).map(String::as_str) {
                Some("--platform") => rest.get(5).cloned().unwrap_or_else(|| usage()),
                Some(_) => usage(),
                None => "linux".to_string(),
            };
            Command::Build {
                arch,
                source_url: rest[2].clone(),
                recipe_path: rest[3].clone(),
                platform,
            }
        }
        Some("status") => match rest.get(1) {
            Some(id) => Command::Status { id: id.clone() },
            None => usage(),
        },
        Some("artifact") => {
            let (Some(id), Some(kind)) = (rest.get(1), rest.get(2)) else {
                usage();
            };
            let kind = match kind.as_str() {
                "log" => ArtifactKind::Log,
                "package" => ArtifactKind::Package,
                _ => usage(),
            };
            Command::Artifact {
                id: id.clone(),
                kind,
            }
        }
        _ => usage(),
    };
    (socket, command)
}

#[tokio::main]
async fn main() -> ExitCode {
    let (socket, command) = parse_args();
    chef::logging::init(Some("warn"));
    let client = UdsClient::new(socket);

    let request = match &command {
        Command::Build {
            arch,
            source_url,
            recipe_path,
            platform,
        } => WaiterRequest::Build {
            arch: *arch,
            platform: platform.clone(),
            source_url: source_url.clone(),
            recipe_path: recipe_path.clone(),
        },
        Command::Status { id } => WaiterRequest::Status { id: id.clone() },
        Command::Artifact { id, kind } => WaiterRequest::Artifact {
            id: id.clone(),
            kind: *kind,
        },
    };

    let response: WaiterResponse = match client.call(&request).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("bake: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match response {
        WaiterResponse::Queued { status, id } => {
            println!("{} {}", status, id);
            ExitCode::SUCCESS
        }
        WaiterResponse::Status { arch, status } => {
            match arch {
                Some(arch) => println!("{} {}", arch, status),
                None => println!("{}", status),
            }
            ExitCode::SUCCESS
        }
        WaiterResponse::Artifact { uri } => {
            println!("{}", uri.unwrap_or_default());
            ExitCode::SUCCESS
        }
        WaiterResponse::Error { kind, message } => {
            eprintln!("bake: {}: {}", kind, message);
            ExitCode::FAILURE
        }
        WaiterResponse::Event { .. } => {
            eprintln!("bake: unexpected event response");
            ExitCode::FAILURE
        }
    }
}
