//! # Installer Persistence
//!
//! On-disk layout under the state root:
//!
//! ```text
//! <state-root>/
//! ├── applications.json        installed-package document (one array)
//! ├── next-id                  transaction id counter
//! └── transactions/
//!     ├── 17.json              persisted transaction row
//!     └── 17.log               append-only structured log stream
//! ```
//!
//! All document writes go through a temp-file + rename so a crash never
//! leaves a torn document. A failed write surfaces as
//! [`Error::StoreWriteFailed`], which blocks the state transition that
//! requested it.

use super::app::Application;
use super::transaction::{LogEntry, Transaction};
use crate::constants::RESERVED_TX_ID;
use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persistent store for the installer's state.
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Opens (creating if necessary) the store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("transactions")).map_err(|e| Error::StoreWriteFailed {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { root })
    }

    /// State root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Applications Document
    // =========================================================================

    /// Loads the installed-application document; empty when absent.
    pub fn load_applications(&self) -> Result<Vec<Application>> {
        let path = self.applications_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| Error::Internal(format!(
            "corrupt applications document at {}: {}",
            path.display(),
            e
        )))
    }

    /// Atomically replaces the installed-application document.
    pub fn save_applications(&self, applications: &[Application]) -> Result<()> {
        let path = self.applications_path();
        let json = serde_json::to_string_pretty(applications)
            .map_err(|e| Error::Internal(e.to_string()))?;
        self.write_atomic(&path, json.as_bytes())
    }

    fn applications_path(&self) -> PathBuf {
        self.root.join("applications.json")
    }

    // =========================================================================
    // Transaction Rows
    // =========================================================================

    /// Allocates the next transaction id. Monotonic across restarts;
    /// never returns the reserved sentinel.
    pub fn next_tx_id(&self) -> Result<u64> {
        let path = self.root.join("next-id");
        let current: u64 = match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse().unwrap_or(RESERVED_TX_ID + 1),
            Err(_) => RESERVED_TX_ID + 1,
        };
        self.write_atomic(&path, (current + 1).to_string().as_bytes())?;
        Ok(current)
    }

    /// Persists a transaction row (no-op for ephemeral transactions).
    pub fn save_transaction(&self, tx: &Transaction) -> Result<()> {
        if tx.ephemeral {
            return Ok(());
        }
        let path = self.tx_path(tx.id);
        let json =
            serde_json::to_string_pretty(tx).map_err(|e| Error::Internal(e.to_string()))?;
        self.write_atomic(&path, json.as_bytes())
    }

    /// Loads every persisted transaction row.
    pub fn load_transactions(&self) -> Result<Vec<Transaction>> {
        let dir = self.root.join("transactions");
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(Error::Io)
                .and_then(|data| {
                    serde_json::from_str::<Transaction>(&data)
                        .map_err(|e| Error::Internal(e.to_string()))
                }) {
                Ok(tx) => out.push(tx),
                Err(e) => warn!("skipping unreadable transaction {}: {}", path.display(), e),
            }
        }
        out.sort_by_key(|tx| tx.id);
        debug!("recovered {} persisted transaction(s)", out.len());
        Ok(out)
    }

    /// Removes a transaction row and its log stream.
    pub fn remove_transaction(&self, id: u64) -> Result<()> {
        for path in [self.tx_path(id), self.log_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn tx_path(&self, id: u64) -> PathBuf {
        self.root.join("transactions").join(format!("{}.json", id))
    }

    // =========================================================================
    // Log Streams
    // =========================================================================

    /// Appends one entry to a transaction's log stream.
    pub fn append_log(&self, id: u64, entry: &LogEntry) -> Result<()> {
        let path = self.log_path(id);
        let mut line = serde_json::to_string(entry).map_err(|e| Error::Internal(e.to_string()))?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::StoreWriteFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        file.write_all(line.as_bytes())
            .map_err(|e| Error::StoreWriteFailed {
                path,
                reason: e.to_string(),
            })
    }

    /// Reads a transaction's log stream; empty when absent.
    pub fn read_log(&self, id: u64) -> Result<Vec<LogEntry>> {
        let path = self.log_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path)?;
        Ok(data
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    fn log_path(&self, id: u64) -> PathBuf {
        self.root.join("transactions").join(format!("{}.log", id))
    }

    // =========================================================================
    // Atomic Writes
    // =========================================================================

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        let write = || -> std::io::Result<()> {
            fs::write(&tmp, data)?;
            fs::rename(&tmp, path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::StoreWriteFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::state::{TxState, TxType};
    use crate::install::transaction::LogLevel;
    use tempfile::TempDir;

    fn sample_tx(id: u64, ephemeral: bool) -> Transaction {
        Transaction {
            id,
            name: "acme/hello".into(),
            description: "install acme/hello".into(),
            tx_type: TxType::Install,
            state: TxState::Download,
            ephemeral,
            revision: Some(7),
            source: None,
            retry_count: 0,
            log: Vec::new(),
        }
    }

    #[test]
    fn test_tx_ids_are_monotonic_and_skip_sentinel() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        let a = store.next_tx_id().unwrap();
        let b = store.next_tx_id().unwrap();
        assert!(a > RESERVED_TX_ID);
        assert!(b > a);

        // A reopened store continues the sequence.
        let store2 = StateStore::open(temp.path()).unwrap();
        let c = store2.next_tx_id().unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_transaction_survives_reload_in_persisted_state() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        store.save_transaction(&sample_tx(5, false)).unwrap();

        let recovered = store.load_transactions().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, 5);
        assert_eq!(recovered[0].state, TxState::Download);
    }

    #[test]
    fn test_ephemeral_transactions_not_persisted() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        store.save_transaction(&sample_tx(6, true)).unwrap();
        assert!(store.load_transactions().unwrap().is_empty());
    }

    #[test]
    fn test_log_stream_appends() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        for i in 0..3 {
            store
                .append_log(
                    9,
                    &LogEntry {
                        timestamp: chrono::Utc::now(),
                        level: LogLevel::Info,
                        state: TxState::Verify,
                        message: format!("step {}", i),
                    },
                )
                .unwrap();
        }
        let entries = store.read_log(9).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].message, "step 2");

        store.remove_transaction(9).unwrap();
        assert!(store.read_log(9).unwrap().is_empty());
    }

    #[test]
    fn test_applications_document_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::open(temp.path()).unwrap();
        assert!(store.load_applications().unwrap().is_empty());

        let apps = vec![Application {
            publisher: "acme".into(),
            package: "hello".into(),
            revision: 7,
            commands: Vec::new(),
            mount: None,
            container: None,
        }];
        store.save_applications(&apps).unwrap();
        let back = store.load_applications().unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].revision, 7);
    }
}
