//! Transaction records and their structured logs.

use super::state::{TxState, TxType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a transaction log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One structured log line, stamped with the state it was emitted in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub state: TxState,
    pub message: String,
}

/// A persisted installation workflow.
///
/// Ids are monotonic and never reused; id `0` is the reserved failure
/// sentinel and is never allocated. Non-ephemeral transactions survive
/// process restart in their last persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Monotonic identifier.
    pub id: u64,
    /// `publisher/package` this transaction operates on; empty for the
    /// shutdown sweep.
    pub name: String,
    /// Human-readable description for clients.
    pub description: String,
    /// Type; selects the state set.
    pub tx_type: TxType,
    /// Current state.
    pub state: TxState,
    /// Ephemeral transactions are never persisted.
    pub ephemeral: bool,
    /// Revision being installed or updated to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    /// Local pack source for direct installs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<std::path::PathBuf>,
    /// Download attempts consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// In-memory log; the persisted copy is an append-only line stream.
    #[serde(skip)]
    pub log: Vec<LogEntry>,
}

impl Transaction {
    /// Publisher component of the name.
    pub fn publisher(&self) -> &str {
        self.name.split('/').next().unwrap_or("")
    }

    /// Package component of the name.
    pub fn package(&self) -> &str {
        self.name.split('/').nth(1).unwrap_or("")
    }

    /// True when no further events will be emitted.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_components() {
        let tx = Transaction {
            id: 1,
            name: "acme/hello".into(),
            description: String::new(),
            tx_type: TxType::Install,
            state: TxState::Verify,
            ephemeral: false,
            revision: Some(7),
            source: None,
            retry_count: 0,
            log: Vec::new(),
        };
        assert_eq!(tx.publisher(), "acme");
        assert_eq!(tx.package(), "hello");
        assert!(!tx.is_terminal());
    }

    #[test]
    fn test_round_trips_as_json_without_log() {
        let tx = Transaction {
            id: 3,
            name: "acme/hello".into(),
            description: "install acme/hello".into(),
            tx_type: TxType::Install,
            state: TxState::Download,
            ephemeral: false,
            revision: Some(7),
            source: None,
            retry_count: 1,
            log: vec![LogEntry {
                timestamp: Utc::now(),
                level: LogLevel::Info,
                state: TxState::Verify,
                message: "verified".into(),
            }],
        };
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, TxState::Download);
        assert_eq!(back.retry_count, 1);
        // The log stream is persisted separately.
        assert!(back.log.is_empty());
    }
}
