//! Installed-package view and the pack manifest it is built from.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a packaged command is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Wrapped into `/chef/bin` for interactive use.
    Executable,
    /// Started in a container when the package commits.
    Daemon,
}

/// One command exported by a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCommand {
    pub name: String,
    pub kind: CommandKind,
    /// Path inside the package mount.
    pub path: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Manifest carried inside a pack as `chef.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackManifest {
    pub revision: u64,
    #[serde(default)]
    pub commands: Vec<AppCommand>,
}

/// An installed package as persisted in `applications.json`.
///
/// The mount and container fields are runtime state and are not
/// persisted; they are re-established when services start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub publisher: String,
    pub package: String,
    pub revision: u64,
    #[serde(default)]
    pub commands: Vec<AppCommand>,
    #[serde(skip)]
    pub mount: Option<PathBuf>,
    #[serde(skip)]
    pub container: Option<String>,
}

impl Application {
    /// The `publisher/package` name.
    pub fn name(&self) -> String {
        format!("{}/{}", self.publisher, self.package)
    }

    /// Container id used for this package's daemons.
    pub fn container_id(&self) -> String {
        format!("{}-{}", self.publisher, self.package)
    }
}
