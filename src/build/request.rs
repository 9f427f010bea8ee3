//! Build request model and the monotonic status ladder.

use crate::platform::Arch;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a build request.
///
/// Progression is monotonic except for the terminal step, which is
/// either `done` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Unknown,
    Queued,
    Sourcing,
    Building,
    Packing,
    Done,
    Failed,
}

impl BuildStatus {
    /// Position on the wire-order ladder.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Queued => 1,
            Self::Sourcing => 2,
            Self::Building => 3,
            Self::Packing => 4,
            Self::Done => 5,
            Self::Failed => 6,
        }
    }

    /// Terminal statuses never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// True when moving to `next` preserves monotonicity: strictly
    /// forward, or a jump to a terminal status from any live one.
    pub fn can_advance_to(self, next: BuildStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Queued => "queued",
            Self::Sourcing => "sourcing",
            Self::Building => "building",
            Self::Packing => "packing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Kind of build artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Log,
    Package,
}

/// One build job, as tracked by builders and the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Broker-assigned correlation identifier.
    pub id: String,
    /// Target architecture.
    pub arch: Arch,
    /// Target platform name (e.g. "linux").
    pub platform: String,
    /// Where the source comes from.
    pub source_url: String,
    /// Recipe path within the fetched source tree.
    pub recipe_path: String,
    /// Current status.
    pub status: BuildStatus,
    /// URI of the build log artifact, once reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_uri: Option<String>,
    /// URI of the package artifact, once reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_uri: Option<String>,
}

impl BuildRequest {
    pub fn new(
        id: impl Into<String>,
        arch: Arch,
        platform: impl Into<String>,
        source_url: impl Into<String>,
        recipe_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            arch,
            platform: platform.into(),
            source_url: source_url.into(),
            recipe_path: recipe_path.into(),
            status: BuildStatus::Queued,
            log_uri: None,
            package_uri: None,
        }
    }

    /// Stored artifact URI by kind.
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&str> {
        match kind {
            ArtifactKind::Log => self.log_uri.as_deref(),
            ArtifactKind::Package => self.package_uri.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_monotonic() {
        assert!(BuildStatus::Queued.can_advance_to(BuildStatus::Sourcing));
        assert!(BuildStatus::Sourcing.can_advance_to(BuildStatus::Packing));
        assert!(!BuildStatus::Building.can_advance_to(BuildStatus::Sourcing));
        assert!(!BuildStatus::Building.can_advance_to(BuildStatus::Building));
    }

    #[test]
    fn test_terminal_from_any_live_status() {
        for status in [
            BuildStatus::Queued,
            BuildStatus::Sourcing,
            BuildStatus::Building,
            BuildStatus::Packing,
        ] {
            assert!(status.can_advance_to(BuildStatus::Done));
            assert!(status.can_advance_to(BuildStatus::Failed));
        }
    }

    #[test]
    fn test_terminal_never_advances() {
        assert!(!BuildStatus::Done.can_advance_to(BuildStatus::Failed));
        assert!(!BuildStatus::Failed.can_advance_to(BuildStatus::Done));
        assert!(!BuildStatus::Done.can_advance_to(BuildStatus::Queued));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Sourcing).unwrap(),
            "\"sourcing\""
        );
        assert_eq!(
            serde_json::to_string(&ArtifactKind::Package).unwrap(),
            "\"package\""
        );
    }

    #[test]
    fn test_artifact_lookup() {
        let mut request = BuildRequest::new(
            "Q1",
            Arch::Arm64,
            "linux",
            "file:///src/hello",
            "recipe.yaml",
        );
        assert!(request.artifact(ArtifactKind::Log).is_none());
        request.log_uri = Some("file:///artifacts/Q1/build.log".into());
        assert_eq!(
            request.artifact(ArtifactKind::Log),
            Some("file:///artifacts/Q1/build.log")
        );
    }
}
