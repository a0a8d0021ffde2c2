//! In-memory loopback channel
//!
//! A pair of cross-connected channels built on bounded `mpsc` queues of
//! [`Bytes`]. Used by the test suite to run a sender engine against a
//! receiver engine in the same process, and by the bridge examples to
//! splice engines onto other transports.

use super::{CancelToken, WireChannel, WireError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One end of an in-memory byte channel.
pub struct LoopbackChannel {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    read_buf: VecDeque<u8>,
    write_buf: Vec<u8>,
    cancel: CancelToken,
}

/// Create a cross-connected channel pair with the given queue capacity
/// (in flushed chunks, not bytes).
pub fn loopback_pair(capacity: usize) -> (LoopbackChannel, LoopbackChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        LoopbackChannel {
            tx: a_tx,
            rx: a_rx,
            read_buf: VecDeque::new(),
            write_buf: Vec::new(),
            cancel: CancelToken::new(),
        },
        LoopbackChannel {
            tx: b_tx,
            rx: b_rx,
            read_buf: VecDeque::new(),
            write_buf: Vec::new(),
            cancel: CancelToken::new(),
        },
    )
}

impl LoopbackChannel {
    /// Inject raw bytes into this end's read buffer, bypassing the
    /// peer. Test hook for line-noise and abort-sequence scenarios.
    pub fn inject(&mut self, data: &[u8]) {
        self.read_buf.extend(data.iter().copied());
    }
}

#[async_trait]
impl WireChannel for LoopbackChannel {
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
        let chunk = Bytes::from(std::mem::take(&mut self.write_buf));
        // Send is polled first so an abort sequence still goes out
        // after the cancel token fires; cancellation only breaks a
        // write blocked on a full queue.
        tokio::select! {
            biased;
            sent = self.tx.send(chunk) => sent.map_err(|_| WireError::Eof),
            _ = self.cancel.cancelled() => Err(WireError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let (mut a, mut b) = loopback_pair(8);
        a.write_all(b"ping").await.unwrap();
        a.flush().await.unwrap();

        let mut buf = [0u8; 4];
        b.read_exact(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_write_buffers_until_flush() {
        let (mut a, mut b) = loopback_pair(8);
        a.write_all(b"x").await.unwrap();
        assert_eq!(
            b.read_byte(Duration::from_millis(20)).await,
            Err(WireError::Timeout)
        );
        a.flush().await.unwrap();
        assert_eq!(b.read_byte(Duration::from_secs(1)).await, Ok(b'x'));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut a, _b) = loopback_pair(8);
        let err = a.read_byte(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, WireError::Timeout);
    }

    #[tokio::test]
    async fn test_eof_when_peer_dropped() {
        let (mut a, b) = loopback_pair(8);
        drop(b);
        assert_eq!(
            a.read_byte(Duration::from_secs(1)).await,
            Err(WireError::Eof)
        );
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_read() {
        let (mut a, _b) = loopback_pair(8);
        let token = CancelToken::new();
        a.bind_cancel(token.clone());

        let reader = tokio::spawn(async move {
            a.read_byte(Duration::from_secs(30)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert_eq!(reader.await.unwrap(), Err(WireError::Cancelled));
    }

    #[tokio::test]
    async fn test_drain_discards_pending() {
        let (mut a, mut b) = loopback_pair(8);
        a.write_all(b"stale noise").await.unwrap();
        a.flush().await.unwrap();
        b.drain(Duration::from_millis(20)).await.unwrap();
        assert_eq!(
            b.read_byte(Duration::from_millis(20)).await,
            Err(WireError::Timeout)
        );
    }
}
