//! # UDS Server Plumbing
//!
//! Socket binding and per-connection line framing shared by the
//! daemons.
//!
//! Binding removes stale socket files, enforces a 0700 parent
//! directory, and sets socket permissions after the bind so no window
//! exists where a wider-mode socket is connectable.

use super::MAX_LINE_LEN;
use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

/// Default socket permissions: owner plus group.
pub const SOCKET_MODE: u32 = 0o660;

/// Directory permissions for the socket parent.
pub const SOCKET_DIR_MODE: u32 = 0o700;

/// Default socket path for a daemon.
///
/// `$XDG_RUNTIME_DIR/chef/<name>.sock` when the runtime dir is set,
/// `/run/chef/<name>.sock` otherwise.
pub fn default_socket_path(name: &str) -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("/run"));
    base.join("chef").join(format!("{}.sock", name))
}

/// Binds a listening socket at `path`.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        set_mode(parent, SOCKET_DIR_MODE)?;
    }

    // A stale file from a crashed daemon would fail the bind.
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }

    let listener = UnixListener::bind(path).map_err(Error::Io)?;
    set_mode(path, SOCKET_MODE)?;
    info!("listening on {}", path.display());
    Ok(listener)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(Error::Io)
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// One accepted connection with line framing.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            line: String::new(),
        }
    }

    /// Splits into independent halves, for loops that read and write
    /// concurrently.
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        (
            ConnectionReader {
                reader: self.reader,
                line: self.line,
            },
            ConnectionWriter {
                writer: self.writer,
            },
        )
    }

    /// Reads the next message; `None` at end of stream.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        read_message(&mut self.reader, &mut self.line).await
    }

    /// Writes one message followed by a newline.
    pub async fn write<T: Serialize>(&mut self, message: &T) -> Result<()> {
        write_message(&mut self.writer, message).await
    }
}

/// Read half of a split [`Connection`].
pub struct ConnectionReader {
    reader: BufReader<OwnedReadHalf>,
    line: String,
}

impl ConnectionReader {
    /// Reads the next message; `None` at end of stream.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        read_message(&mut self.reader, &mut self.line).await
    }
}

/// Write half of a split [`Connection`].
pub struct ConnectionWriter {
    writer: OwnedWriteHalf,
}

impl ConnectionWriter {
    /// Writes one message followed by a newline.
    pub async fn write<T: Serialize>(&mut self, message: &T) -> Result<()> {
        write_message(&mut self.writer, message).await
    }
}

async fn read_message<T: DeserializeOwned>(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut String,
) -> Result<Option<T>> {
    line.clear();
    let n = reader.read_line(line).await.map_err(Error::Io)?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_LINE_LEN {
        return Err(Error::Protocol(format!(
            "line of {} bytes exceeds the {} byte limit",
            n, MAX_LINE_LEN
        )));
    }
    serde_json::from_str(line.trim())
        .map(Some)
        .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))
}

async fn write_message<T: Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> Result<()> {
    let mut json = serde_json::to_string(message).map_err(|e| Error::Protocol(e.to_string()))?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await.map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("sockets/test.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let listener = bind_socket(&path).unwrap();
        drop(listener);
        // Rebinding over our own leftover also works.
        let _listener = bind_socket(&path).unwrap();
    }

    #[tokio::test]
    async fn test_connection_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("rt.sock");
        let listener = bind_socket(&path).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let stream = UnixStream::connect(&path).await.unwrap();
                let mut conn = Connection::new(stream);
                conn.write(&super::super::Hello::Client).await.unwrap();
                let resp: Option<super::super::ServeResponse> = conn.read().await.unwrap();
                resp
            }
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::new(stream);
        let hello: Option<super::super::Hello> = conn.read().await.unwrap();
        assert!(matches!(hello, Some(super::super::Hello::Client)));
        conn.write(&super::super::ServeResponse::Ok).await.unwrap();

        let resp = client.await.unwrap();
        assert!(matches!(resp, Some(super::super::ServeResponse::Ok)));
    }
}
