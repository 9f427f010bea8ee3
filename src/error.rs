//! Error types for the chef runtime layer.

use std::path::PathBuf;

/// Result type alias for chef operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-level error taxonomy.
///
/// Every [`Error`] projects onto exactly one kind via [`Error::kind`];
/// daemons serialize the kind over the wire, clients and state handlers
/// branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    PolicyInvalid,
    RootfsInvalid,
    NotRunning,
    SpawnFailed,
    InternalError,
    Cancelled,
    ReadOnly,
    BuilderLost,
    ProtocolUnknownArch,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidArgument => "invalid-argument",
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::PermissionDenied => "permission-denied",
            Self::ResourceExhausted => "resource-exhausted",
            Self::PolicyInvalid => "policy-invalid",
            Self::RootfsInvalid => "rootfs-invalid",
            Self::NotRunning => "not-running",
            Self::SpawnFailed => "spawn-failed",
            Self::InternalError => "internal-error",
            Self::Cancelled => "cancelled",
            Self::ReadOnly => "read-only",
            Self::BuilderLost => "builder-lost",
            Self::ProtocolUnknownArch => "protocol-unknown-arch",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur across the chef subsystems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container already exists.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Container is not running.
    #[error("container '{0}' is not running")]
    NotRunning(String),

    /// Process spawn inside a container failed.
    #[error("failed to spawn in container '{id}': {reason}")]
    SpawnFailed { id: String, reason: String },

    /// Container creation exhausted a resource (containers, map slots, pids).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation was cancelled by destroy or shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Layer / Rootfs Errors
    // =========================================================================
    /// The layer list or composed rootfs is unusable.
    #[error("invalid rootfs: {0}")]
    RootfsInvalid(String),

    /// Write attempted through a rootfs composed without a writable upper.
    #[error("rootfs is read-only: {}", path.display())]
    ReadOnly { path: PathBuf },

    /// Content pack rejected (bad digest, traversal, size).
    #[error("invalid content pack {}: {reason}", path.display())]
    PackInvalid { path: PathBuf, reason: String },

    // =========================================================================
    // Policy Errors
    // =========================================================================
    /// Policy was malformed or could not be compiled.
    #[error("invalid policy: {0}")]
    PolicyInvalid(String),

    /// The caller lacks permission, or the kernel denied the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // =========================================================================
    // Installer Errors
    // =========================================================================
    /// Package not installed / record missing.
    #[error("package not found: {0}")]
    PackageNotFound(String),

    /// Package already installed at this revision.
    #[error("package already installed: {0}")]
    PackageAlreadyInstalled(String),

    /// Malformed user input (package names, paths, arguments).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Persistent store write failed; blocks state transitions.
    #[error("store write failed at {}: {reason}", path.display())]
    StoreWriteFailed { path: PathBuf, reason: String },

    // =========================================================================
    // Build Orchestration Errors
    // =========================================================================
    /// The builder serving a request disconnected mid-build.
    #[error("builder lost for request {0}")]
    BuilderLost(String),

    /// No builder declares the requested architecture.
    #[error("no builder for architecture: {0}")]
    UnknownArch(String),

    /// Build request not known to the broker.
    #[error("unknown build request: {0}")]
    RequestNotFound(String),

    // =========================================================================
    // Transport / I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Projects this error onto the protocol taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContainerNotFound(_) | Self::PackageNotFound(_) | Self::RequestNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::ContainerAlreadyExists(_) | Self::PackageAlreadyInstalled(_) => {
                ErrorKind::AlreadyExists
            }
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::RootfsInvalid(_) | Self::PackInvalid { .. } => ErrorKind::RootfsInvalid,
            Self::ReadOnly { .. } => ErrorKind::ReadOnly,
            Self::PolicyInvalid(_) => ErrorKind::PolicyInvalid,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::BuilderLost(_) => ErrorKind::BuilderLost,
            Self::UnknownArch(_) => ErrorKind::ProtocolUnknownArch,
            Self::StoreWriteFailed { .. } | Self::Io(_) | Self::Protocol(_) | Self::Internal(_) => {
                ErrorKind::InternalError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_projection() {
        assert_eq!(
            Error::ContainerNotFound("c1".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::ReadOnly {
                path: PathBuf::from("/")
            }
            .kind(),
            ErrorKind::ReadOnly
        );
        assert_eq!(
            Error::UnknownArch("riscv64".into()).kind(),
            ErrorKind::ProtocolUnknownArch
        );
        assert_eq!(Error::BuilderLost("Q1".into()).kind(), ErrorKind::BuilderLost);
    }

    #[test]
    fn test_kind_wire_form() {
        let json = serde_json::to_string(&ErrorKind::ProtocolUnknownArch).unwrap();
        assert_eq!(json, "\"protocol-unknown-arch\"");
        assert_eq!(ErrorKind::SpawnFailed.to_string(), "spawn-failed");
    }
}
