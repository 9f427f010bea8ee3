//! # UDS Client
//!
//! Async client used by the CLI tools: connect, send one line-JSON
//! request, read responses. Every operation is bounded by a timeout.

use super::MAX_LINE_LEN;
use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

/// Default timeout for a single request/response exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one daemon socket.
#[derive(Debug, Clone)]
pub struct UdsClient {
    path: PathBuf,
    timeout: Duration,
}

impl UdsClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Socket this client talks to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One-shot request/response exchange on a fresh connection.
    pub async fn call<Req: Serialize, Resp: DeserializeOwned>(&self, request: &Req) -> Result<Resp> {
        let mut stream = self.connect().await?;
        stream.send(request).await?;
        timeout(self.timeout, stream.receive())
            .await
            .map_err(|_| Error::Protocol(format!("timeout talking to {}", self.path.display())))?
            .and_then(|r| {
                r.ok_or_else(|| {
                    Error::Protocol(format!("{} closed the connection", self.path.display()))
                })
            })
    }

    /// Opens a persistent stream, for event subscriptions and builder
    /// sessions.
    pub async fn connect(&self) -> Result<ClientStream> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            Error::Protocol(format!("cannot connect to {}: {}", self.path.display(), e))
        })?;
        let (read_half, write_half) = stream.into_split();
        Ok(ClientStream {
            reader: BufReader::new(read_half),
            writer: write_half,
            line: String::new(),
        })
    }
}

/// A connected client stream with line framing.
pub struct ClientStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl ClientStream {
    /// Sends one message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        send_on(&mut self.writer, message).await
    }

    /// Receives the next message; `None` at end of stream.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        receive_on(&mut self.reader, &mut self.line).await
    }

    /// Splits into independent halves, for sessions that read and write
    /// concurrently (builder connections).
    pub fn into_split(self) -> (ClientReader, ClientWriter) {
        (
            ClientReader {
                reader: self.reader,
                line: self.line,
            },
            ClientWriter {
                writer: self.writer,
            },
        )
    }
}

/// Read half of a split [`ClientStream`].
pub struct ClientReader {
    reader: BufReader<OwnedReadHalf>,
    line: String,
}

impl ClientReader {
    /// Receives the next message; `None` at end of stream.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        receive_on(&mut self.reader, &mut self.line).await
    }
}

/// Write half of a split [`ClientStream`].
pub struct ClientWriter {
    writer: OwnedWriteHalf,
}

impl ClientWriter {
    /// Sends one message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        send_on(&mut self.writer, message).await
    }
}

async fn send_on<T: Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> Result<()> {
    let mut json = serde_json::to_string(message).map_err(|e| Error::Protocol(e.to_string()))?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await.map_err(Error::Io)
}

async fn receive_on<T: DeserializeOwned>(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut String,
) -> Result<Option<T>> {
    line.clear();
    let n = reader.read_line(line).await.map_err(Error::Io)?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_LINE_LEN {
        return Err(Error::Protocol("oversized message".into()));
    }
    serde_json::from_str(line.trim())
        .map(Some)
        .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))
}
