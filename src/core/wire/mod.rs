//! Wire layer: a timed, cancellable byte channel
//!
//! Engines never touch sockets or ports directly; they drive a
//! [`WireChannel`] with per-call timeouts. Cancellation is cooperative:
//! a session-scoped [`CancelToken`] wakes blocked reads so the engine
//! can transmit the protocol's abort sequence promptly.

mod loopback;
mod stdio;

pub use loopback::{loopback_pair, LoopbackChannel};
pub use stdio::StdioChannel;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Wire-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// No byte arrived within the timeout
    #[error("read timed out")]
    Timeout,

    /// The session's cancel token fired
    #[error("cancelled")]
    Cancelled,

    /// The peer closed the channel
    #[error("end of stream")]
    Eof,

    /// Underlying transport failure
    #[error("wire I/O error: {0}")]
    Io(String),
}

/// Cooperative cancellation token shared between a session and its wire
/// channel.
///
/// Cancelling sets a latching flag and wakes any blocked reader.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the token and wake all waiters. Idempotent.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve when the token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // Re-check after registering interest so a cancel between the
        // check and the await cannot be missed.
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

/// A bidirectional byte channel with per-call timeouts
///
/// Writes buffer until [`flush`](WireChannel::flush); reads return as
/// soon as a byte is available. All blocking calls observe the bound
/// [`CancelToken`].
#[async_trait]
pub trait WireChannel: Send {
    /// Bind the session's cancel token so blocked reads wake promptly.
    fn bind_cancel(&mut self, token: CancelToken);

    /// Read one byte, waiting at most `timeout`.
    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, WireError>;

    /// Read exactly `buf.len()` bytes, waiting at most `timeout` for
    /// each byte.
    async fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), WireError> {
        for slot in buf.iter_mut() {
            *slot = self.read_byte(timeout).await?;
        }
        Ok(())
    }

    /// Buffer bytes for transmission.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), WireError>;

    /// Force buffered bytes onto the wire.
    async fn flush(&mut self) -> Result<(), WireError>;

    /// Read and discard until the line is quiet for `quiet`.
    ///
    /// Used before resynchronization so stale bytes cannot be mistaken
    /// for a response to the retransmission.
    async fn drain(&mut self, quiet: Duration) -> Result<(), WireError> {
        loop {
            match self.read_byte(quiet).await {
                Ok(_) => continue,
                Err(WireError::Timeout) | Err(WireError::Eof) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}
