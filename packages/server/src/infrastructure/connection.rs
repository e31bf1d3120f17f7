//! Newline-delimited text transport over one byte stream.
//!
//! ## 責務
//!
//! - 受信: 1 行ずつ読み出す（`\n` / `\r\n` を除去、不正な UTF-8 は置換文字に変換）
//! - 送信: 1 行ずつ書き込み、同時送信を直列化する
//! - 切断: 冪等な close と、キャンセルによる受信待ちの解除

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::domain::ConnectionError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One accepted client stream.
///
/// `send` may be called concurrently from any number of tasks (fan-out and
/// direct replies); the write half sits behind an async mutex so lines are
/// never interleaved. `receive` is only called by the owning session.
pub struct Connection {
    peer: String,
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Connection {
    /// Wrap a stream.
    ///
    /// # Arguments
    ///
    /// * `stream` - Any bidirectional byte stream (TCP in production)
    /// * `peer` - Peer description used in logs
    /// * `cancel` - Cancelling this token closes the connection
    pub fn new<S>(stream: S, peer: impl Into<String>, cancel: CancellationToken) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);

        Self {
            peer: peer.into(),
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Write one line followed by `\n`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the connection is (or becomes,
    /// while waiting for the write lock) closed, and [`ConnectionError::Io`]
    /// if the write fails. Either way the connection is closed afterwards.
    pub async fn send(&self, line: &str) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }

        let mut writer = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ConnectionError::Closed),
            writer = self.writer.lock() => writer,
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ConnectionError::Closed),
            result = write_line(&mut writer, line) => result.map_err(ConnectionError::from),
        };

        if let Err(e) = &result {
            tracing::warn!("Failed to send to {}: {}", self.peer, e);
            self.mark_closed();
        }
        result
    }

    /// Wait for the next inbound line.
    ///
    /// Bytes that are not valid UTF-8 are replaced with `U+FFFD`. Returns
    /// `None` once the peer has closed the stream, a read error occurred, or
    /// the connection was closed locally. After the first `None` every later
    /// call returns `None`.
    pub async fn receive(&self) -> Option<String> {
        if !self.is_open() {
            return None;
        }

        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            result = reader.read_until(b'\n', &mut buf) => result,
        };

        match result {
            Ok(0) => {
                tracing::debug!("Peer {} closed the stream", self.peer);
                self.mark_closed();
                None
            }
            Ok(_) => Some(decode_line(&buf)),
            Err(e) => {
                tracing::warn!("Failed to read from {}: {}", self.peer, e);
                self.mark_closed();
                None
            }
        }
    }

    /// Close the connection. Safe to call any number of times.
    ///
    /// Pending `receive`/`send` calls are woken with end-of-stream/`Closed`
    /// before the write half is shut down.
    pub async fn close(&self) {
        self.mark_closed();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Error shutting down stream to {}: {}", self.peer, e);
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

/// Strip the `\n` / `\r\n` terminator and decode lossily.
fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

async fn write_line(writer: &mut BoxedWriter, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
