//! Stdio-backed wire channel
//!
//! Lets the CLI interoperate with `sz`/`rz` style tools over a pipe or
//! a pty: the process's stdin/stdout become the serial line. A pump
//! task moves stdin into an mpsc queue so timed reads are cancel-safe.

use super::{CancelToken, WireChannel, WireError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Stdout};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Wire channel over the process's standard streams.
pub struct StdioChannel {
    rx: mpsc::Receiver<Bytes>,
    stdout: Stdout,
    read_buf: VecDeque<u8>,
    write_buf: Vec<u8>,
    cancel: CancelToken,
}

impl StdioChannel {
    /// Wrap the current process's stdin/stdout.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut chunk = [0u8; 4096];
            loop {
                match stdin.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&chunk[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self {
            rx,
            stdout: tokio::io::stdout(),
            read_buf: VecDeque::new(),
            write_buf: Vec::new(),
            cancel: CancelToken::new(),
        }
    }
}

impl Default for StdioChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WireChannel for StdioChannel {
    fn bind_cancel(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, WireError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(b) = self.read_buf.pop_front() {
                return Ok(b);
            }
            if self.cancel.is_cancelled() {
                return Err(WireError::Cancelled);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(WireError::Cancelled),
                chunk = self.rx.recv() => match chunk {
                    Some(bytes) => self.read_buf.extend(bytes.iter().copied()),
                    None => return Err(WireError::Eof),
                },
                _ = tokio::time::sleep_until(deadline) => return Err(WireError::Timeout),
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), WireError> {
        self.write_buf.extend_from_slice(data);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), WireError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.write_buf);
        self.stdout
            .write_all(&chunk)
            .await
            .map_err(|e| WireError::Io(e.to_string()))?;
        self.stdout
            .flush()
            .await
            .map_err(|e| WireError::Io(e.to_string()))
    }
}
