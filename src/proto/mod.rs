//! # Control Protocol
//!
//! Wire definitions for the three service roles, carried as
//! newline-delimited JSON over Unix domain sockets:
//!
//! | Socket          | Clients               | Messages                        |
//! |-----------------|-----------------------|---------------------------------|
//! | `served.sock`   | `serve`, `order`      | [`ServeRequest`]/[`ServeResponse`] |
//! | `cvd.sock`      | engine consumers      | [`CvdRequest`]/[`CvdResponse`]  |
//! | `waiterd.sock`  | `bake`, builders      | [`WaiterRequest`]/[`WaiterResponse`], [`CookEvent`] |
//!
//! # Framing
//!
//! Every message is one JSON object terminated by `\n`. Requests carry a
//! `method` tag, responses a `result` tag. Builder connections open with
//! a [`Hello`] line and then stream [`CookEvent`]s upward while
//! [`BuildRequest`]s flow downward.

pub mod client;
pub mod server;

use crate::build::{ArtifactKind, BuildStatus};
use crate::error::ErrorKind;
use crate::install::{Application, InstallEvent};
use crate::layer::{Layer, LayerSource};
use crate::platform::Arch;
use crate::policy::Policy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Longest accepted wire line; longer lines drop the connection.
pub const MAX_LINE_LEN: usize = 256 * 1024;

// =============================================================================
// Installer Service (served)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ServeRequest {
    /// Install from a local pack archive. The package name defaults to
    /// the archive's `<publisher>-<package>.pack` file name.
    Install {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        package: Option<String>,
    },
    /// Install from the package store.
    InstallFromStore {
        package: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<u64>,
    },
    Remove { package: String },
    Info { package: String },
    ListCount,
    List,
    /// Subscribe to installer events; the server then pushes
    /// [`ServeResponse::Event`] lines until the client disconnects.
    Subscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ServeResponse {
    Ok,
    /// Transaction admitted; id `0` is the admission-failure sentinel.
    Transaction { id: u64 },
    App { app: Application },
    Apps { apps: Vec<Application> },
    Count { count: usize },
    Event { event: InstallEvent },
    Error { kind: ErrorKind, message: String },
}

// =============================================================================
// Container Service (cvd)
// =============================================================================

/// Wire form of a layer description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Base { dir: PathBuf },
    Pack { archive: PathBuf },
    Bind {
        source: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PathBuf>,
        read_only: bool,
    },
    Upper { dir: PathBuf },
}

impl From<LayerSpec> for Layer {
    fn from(spec: LayerSpec) -> Self {
        match spec {
            LayerSpec::Base { dir } => Layer::base(dir),
            LayerSpec::Pack { archive } => Layer::pack(archive),
            LayerSpec::Bind {
                source,
                target,
                read_only,
            } => {
                let layer = Layer::bind(source, read_only);
                match target {
                    Some(target) => layer.at(target),
                    None => layer,
                }
            }
            LayerSpec::Upper { dir } => Layer::upper(dir),
        }
    }
}

impl From<&Layer> for LayerSpec {
    fn from(layer: &Layer) -> Self {
        match &layer.source {
            LayerSource::BaseRootfs(dir) => LayerSpec::Base { dir: dir.clone() },
            LayerSource::ContentPack(archive) => LayerSpec::Pack {
                archive: archive.clone(),
            },
            LayerSource::HostBind(source) => LayerSpec::Bind {
                source: source.clone(),
                target: layer.target.clone(),
                read_only: layer.read_only,
            },
            LayerSource::WritableUpper(dir) => LayerSpec::Upper { dir: dir.clone() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CvdRequest {
    Create {
        id: String,
        layers: Vec<LayerSpec>,
        #[serde(default)]
        policy: Policy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
    },
    Spawn {
        id: String,
        argv: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
        #[serde(default)]
        wait: bool,
    },
    Kill { id: String, pid: u32 },
    Upload {
        id: String,
        src: PathBuf,
        dst: PathBuf,
    },
    Download {
        id: String,
        src: PathBuf,
        dst: PathBuf,
    },
    Destroy { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CvdResponse {
    Ok,
    Created { cgroup_id: u64, rootfs: PathBuf },
    Spawned {
        pid: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Error { kind: ErrorKind, message: String },
}

// =============================================================================
// Builder / Broker Services (cookd / waiterd)
// =============================================================================

/// First line of every waiterd connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Hello {
    /// A builder; the connection then streams [`CookEvent`]s upward and
    /// receives forwarded build requests.
    Cook,
    /// A build client issuing [`WaiterRequest`]s.
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum WaiterRequest {
    Build {
        arch: Arch,
        platform: String,
        source_url: String,
        recipe_path: String,
    },
    Status { id: String },
    Artifact { id: String, kind: ArtifactKind },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WaiterResponse {
    Queued { status: BuildStatus, id: String },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arch: Option<Arch>,
        status: BuildStatus,
    },
    Artifact {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
    },
    Event {
        id: String,
        status: BuildStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },
    Error { kind: ErrorKind, message: String },
}

impl From<&crate::error::Error> for CvdResponse {
    fn from(e: &crate::error::Error) -> Self {
        CvdResponse::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<&crate::error::Error> for ServeResponse {
    fn from(e: &crate::error::Error) -> Self {
        ServeResponse::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<&crate::error::Error> for WaiterResponse {
    fn from(e: &crate::error::Error) -> Self {
        WaiterResponse::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tagging() {
        let json = serde_json::to_string(&ServeRequest::InstallFromStore {
            package: "acme/hello".into(),
            channel: Some("stable".into()),
            revision: Some(7),
        })
        .unwrap();
        assert!(json.contains("\"method\":\"install_from_store\""));
        let back: ServeRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ServeRequest::InstallFromStore { .. }));
    }

    #[test]
    fn test_layer_spec_round_trip() {
        let layers = vec![
            Layer::base("/srv/rootfs"),
            Layer::pack("/var/chef/packs/acme-hello.pack"),
            Layer::bind("/var/cache/chef", true).at("/ingredients"),
            Layer::upper("/tmp/scratch"),
        ];
        for layer in &layers {
            let spec = LayerSpec::from(layer);
            let json = serde_json::to_string(&spec).unwrap();
            let back: LayerSpec = serde_json::from_str(&json).unwrap();
            assert_eq!(Layer::from(back), *layer);
        }
    }

    #[test]
    fn test_error_projection_onto_wire() {
        let err = crate::error::Error::ContainerNotFound("c1".into());
        match CvdResponse::from(&err) {
            CvdResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_hello_line() {
        let json = serde_json::to_string(&Hello::Cook).unwrap();
        assert_eq!(json, "{\"role\":\"cook\"}");
    }
}
