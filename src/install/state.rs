//! # Transaction State Sets
//!
//! Each transaction type advances through a fixed, ordered set of states
//! with total OK/FAIL successor functions. The sets are constant data;
//! handlers dispatch on the state value, and the same state can carry
//! different successors in different sets (starting services commits an
//! install but merely closes out a failed uninstall rollback).
//!
//! ```text
//! install:    verify → download ⇄ download-retry
//!                        │
//!                        ▼
//!                      load → mount → generate-wrappers → start-services → committed
//!                               │fail        │fail              │fail
//!                               ▼            ▼                  ▼
//!                             unload ◄── unmount ◄── remove-wrappers   (rollback)
//!                               │
//!                               ▼
//!                             failed
//! ```

use serde::{Deserialize, Serialize};

/// Transaction type; selects the state set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxType {
    Install,
    Uninstall,
    Update,
    ShutdownSweep,
}

impl std::fmt::Display for TxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Uninstall => write!(f, "uninstall"),
            Self::Update => write!(f, "update"),
            Self::ShutdownSweep => write!(f, "shutdown-sweep"),
        }
    }
}

/// Internal transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxState {
    Verify,
    Download,
    DownloadRetry,
    Load,
    Mount,
    GenerateWrappers,
    StartServices,
    StopServices,
    RemoveWrappers,
    Unmount,
    Unload,
    Uninstall,
    StopServicesAll,
    RemoveWrappersAll,
    UnmountAll,
    UnloadAll,
    Committed,
    Failed,
    Done,
}

impl TxState {
    /// Terminal states emit no further events.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed | Self::Done)
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Verify => "verify",
            Self::Download => "download",
            Self::DownloadRetry => "download-retry",
            Self::Load => "load",
            Self::Mount => "mount",
            Self::GenerateWrappers => "generate-wrappers",
            Self::StartServices => "start-services",
            Self::StopServices => "stop-services",
            Self::RemoveWrappers => "remove-wrappers",
            Self::Unmount => "unmount",
            Self::Unload => "unload",
            Self::Uninstall => "uninstall",
            Self::StopServicesAll => "stop-services-all",
            Self::RemoveWrappersAll => "remove-wrappers-all",
            Self::UnmountAll => "unmount-all",
            Self::UnloadAll => "unload-all",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// One row of a state set: the state and its OK/FAIL successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRule {
    pub state: TxState,
    pub on_ok: TxState,
    pub on_fail: TxState,
}

const fn rule(state: TxState, on_ok: TxState, on_fail: TxState) -> StateRule {
    StateRule {
        state,
        on_ok,
        on_fail,
    }
}

/// Install: forward chain with a bounded download retry and a rollback
/// chain (remove-wrappers → unmount → unload) on side-effect failures.
pub const INSTALL_SET: &[StateRule] = &[
    rule(TxState::Verify, TxState::Download, TxState::Failed),
    rule(TxState::Download, TxState::Load, TxState::DownloadRetry),
    rule(TxState::DownloadRetry, TxState::Download, TxState::Failed),
    rule(TxState::Load, TxState::Mount, TxState::Failed),
    rule(TxState::Mount, TxState::GenerateWrappers, TxState::Unload),
    rule(TxState::GenerateWrappers, TxState::StartServices, TxState::Unmount),
    rule(TxState::StartServices, TxState::Committed, TxState::RemoveWrappers),
    rule(TxState::RemoveWrappers, TxState::Unmount, TxState::Unmount),
    rule(TxState::Unmount, TxState::Unload, TxState::Unload),
    rule(TxState::Unload, TxState::Failed, TxState::Failed),
];

/// Uninstall: failures while tearing down re-apply what was removed
/// (generate-wrappers → start-services) and then terminate failed with
/// the application still installed.
pub const UNINSTALL_SET: &[StateRule] = &[
    rule(TxState::Verify, TxState::StopServices, TxState::Failed),
    rule(TxState::StopServices, TxState::RemoveWrappers, TxState::Failed),
    rule(TxState::RemoveWrappers, TxState::Unmount, TxState::GenerateWrappers),
    rule(TxState::Unmount, TxState::Unload, TxState::GenerateWrappers),
    rule(TxState::GenerateWrappers, TxState::StartServices, TxState::Failed),
    rule(TxState::StartServices, TxState::Failed, TxState::Failed),
    rule(TxState::Unload, TxState::Uninstall, TxState::Failed),
    rule(TxState::Uninstall, TxState::Committed, TxState::Failed),
];

/// Update: stop and unhook the old revision, then run the install tail
/// for the new one. Failures after the old revision is unhooked are
/// terminal; the transaction log carries the partial teardown.
pub const UPDATE_SET: &[StateRule] = &[
    rule(TxState::Verify, TxState::StopServices, TxState::Failed),
    rule(TxState::StopServices, TxState::Unmount, TxState::Failed),
    rule(TxState::Unmount, TxState::Unload, TxState::Failed),
    rule(TxState::Unload, TxState::Download, TxState::Failed),
    rule(TxState::Download, TxState::Load, TxState::DownloadRetry),
    rule(TxState::DownloadRetry, TxState::Download, TxState::Failed),
    rule(TxState::Load, TxState::Mount, TxState::Failed),
    rule(TxState::Mount, TxState::GenerateWrappers, TxState::Failed),
    rule(TxState::GenerateWrappers, TxState::StartServices, TxState::Failed),
    rule(TxState::StartServices, TxState::Committed, TxState::Failed),
];

/// Shutdown sweep: best-effort teardown of everything; every failure
/// still advances so the sweep always reaches done.
pub const SHUTDOWN_SWEEP_SET: &[StateRule] = &[
    rule(
        TxState::StopServicesAll,
        TxState::RemoveWrappersAll,
        TxState::RemoveWrappersAll,
    ),
    rule(TxState::RemoveWrappersAll, TxState::UnmountAll, TxState::UnmountAll),
    rule(TxState::UnmountAll, TxState::UnloadAll, TxState::UnloadAll),
    rule(TxState::UnloadAll, TxState::Done, TxState::Done),
];

impl TxType {
    /// The constant state set for this type.
    pub fn state_set(self) -> &'static [StateRule] {
        match self {
            Self::Install => INSTALL_SET,
            Self::Uninstall => UNINSTALL_SET,
            Self::Update => UPDATE_SET,
            Self::ShutdownSweep => SHUTDOWN_SWEEP_SET,
        }
    }

    /// Entry state of the set.
    pub fn initial_state(self) -> TxState {
        self.state_set()[0].state
    }
}

/// Looks up the successor for an event in a state set.
///
/// `None` for states outside the set or already terminal.
pub fn next_state(set: &[StateRule], state: TxState, ok: bool) -> Option<TxState> {
    set.iter()
        .find(|r| r.state == state)
        .map(|r| if ok { r.on_ok } else { r.on_fail })
}

// =============================================================================
// Protocol State Mapping
// =============================================================================

/// Coarse state surfaced to protocol clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolState {
    Unknown,
    Verify,
    Download,
    Load,
    Mount,
    Wrappers,
    Services,
    Cleanup,
    Committed,
    Failed,
    Done,
}

/// Surfaces an internal state to clients.
pub fn map_state(state: TxState) -> ProtocolState {
    match state {
        TxState::Verify => ProtocolState::Verify,
        TxState::Download | TxState::DownloadRetry => ProtocolState::Download,
        TxState::Load | TxState::Unload | TxState::UnloadAll => ProtocolState::Load,
        TxState::Mount | TxState::Unmount | TxState::UnmountAll => ProtocolState::Mount,
        TxState::GenerateWrappers | TxState::RemoveWrappers | TxState::RemoveWrappersAll => {
            ProtocolState::Wrappers
        }
        TxState::StartServices | TxState::StopServices | TxState::StopServicesAll => {
            ProtocolState::Services
        }
        TxState::Uninstall => ProtocolState::Cleanup,
        TxState::Committed => ProtocolState::Committed,
        TxState::Failed => ProtocolState::Failed,
        TxState::Done => ProtocolState::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_happy_path() {
        let mut state = TxType::Install.initial_state();
        let mut visited = vec![state];
        while !state.is_terminal() {
            state = next_state(INSTALL_SET, state, true).unwrap();
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                TxState::Verify,
                TxState::Download,
                TxState::Load,
                TxState::Mount,
                TxState::GenerateWrappers,
                TxState::StartServices,
                TxState::Committed,
            ]
        );
    }

    #[test]
    fn test_install_rollback_chain_from_start_services() {
        let mut state = TxState::StartServices;
        let mut visited = Vec::new();
        state = next_state(INSTALL_SET, state, false).unwrap();
        visited.push(state);
        while !state.is_terminal() {
            state = next_state(INSTALL_SET, state, true).unwrap();
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                TxState::RemoveWrappers,
                TxState::Unmount,
                TxState::Unload,
                TxState::Failed,
            ]
        );
    }

    #[test]
    fn test_download_retry_redispatches_download() {
        assert_eq!(
            next_state(INSTALL_SET, TxState::Download, false),
            Some(TxState::DownloadRetry)
        );
        assert_eq!(
            next_state(INSTALL_SET, TxState::DownloadRetry, true),
            Some(TxState::Download)
        );
        assert_eq!(
            next_state(INSTALL_SET, TxState::DownloadRetry, false),
            Some(TxState::Failed)
        );
    }

    #[test]
    fn test_uninstall_unmount_failure_reapplies() {
        // Scenario: unmount fails mid-uninstall. The fail chain restores
        // wrappers and services, then terminates failed with the package
        // still installed.
        let mut state = next_state(UNINSTALL_SET, TxState::Unmount, false).unwrap();
        assert_eq!(state, TxState::GenerateWrappers);
        let mut visited = vec![state];
        while !state.is_terminal() {
            state = next_state(UNINSTALL_SET, state, true).unwrap();
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                TxState::GenerateWrappers,
                TxState::StartServices,
                TxState::Failed,
            ]
        );
    }

    #[test]
    fn test_uninstall_happy_path() {
        let mut state = TxType::Uninstall.initial_state();
        let mut visited = vec![state];
        while !state.is_terminal() {
            state = next_state(UNINSTALL_SET, state, true).unwrap();
            visited.push(state);
        }
        assert_eq!(
            visited,
            vec![
                TxState::Verify,
                TxState::StopServices,
                TxState::RemoveWrappers,
                TxState::Unmount,
                TxState::Unload,
                TxState::Uninstall,
                TxState::Committed,
            ]
        );
    }

    #[test]
    fn test_shutdown_sweep_always_reaches_done() {
        for pattern in 0u8..16 {
            let mut state = TxType::ShutdownSweep.initial_state();
            let mut step = 0;
            while !state.is_terminal() {
                let ok = pattern & (1 << step) != 0;
                state = next_state(SHUTDOWN_SWEEP_SET, state, ok).unwrap();
                step += 1;
            }
            assert_eq!(state, TxState::Done);
        }
    }

    #[test]
    fn test_every_set_state_has_total_transitions() {
        for set in [INSTALL_SET, UNINSTALL_SET, UPDATE_SET, SHUTDOWN_SWEEP_SET] {
            for rule in set {
                assert!(!rule.state.is_terminal());
                // Successors are either terminal or themselves in the set.
                for next in [rule.on_ok, rule.on_fail] {
                    assert!(
                        next.is_terminal() || set.iter().any(|r| r.state == next),
                        "{:?} -> {:?} leaves the set",
                        rule.state,
                        next
                    );
                }
            }
        }
    }

    #[test]
    fn test_protocol_mapping_is_total() {
        let states = [
            TxState::Verify,
            TxState::Download,
            TxState::DownloadRetry,
            TxState::Load,
            TxState::Mount,
            TxState::GenerateWrappers,
            TxState::StartServices,
            TxState::StopServices,
            TxState::RemoveWrappers,
            TxState::Unmount,
            TxState::Unload,
            TxState::Uninstall,
            TxState::Committed,
            TxState::Failed,
            TxState::Done,
        ];
        for state in states {
            let _ = map_state(state);
        }
        assert_eq!(map_state(TxState::Committed), ProtocolState::Committed);
    }
}
