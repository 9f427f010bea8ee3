//! # Install State Machine
//!
//! Drives installation-related workflows to completion despite crashes.
//!
//! A [`Transaction`] advances through its type's constant state set;
//! the [`InstallRunner`] executes one state handler at a time, persists
//! every transition through the [`StateStore`], and emits
//! [`InstallEvent`]s to connected clients. The side effects themselves
//! live behind [`InstallActions`], with [`HostActions`] as the real
//! implementation.

mod actions;
mod app;
mod runner;
mod state;
mod store;
mod transaction;
pub mod wrappers;

pub use actions::{HostActions, InstallActions, LocalFetcher, PackFetcher};
pub use app::{AppCommand, Application, CommandKind, PackManifest};
pub use runner::{InstallEvent, InstallRunner, TxOptions};
pub use state::{
    INSTALL_SET, ProtocolState, SHUTDOWN_SWEEP_SET, StateRule, TxState, TxType, UNINSTALL_SET,
    UPDATE_SET, map_state, next_state,
};
pub use store::StateStore;
pub use transaction::{LogEntry, LogLevel, Transaction};
