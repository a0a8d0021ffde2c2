//! Transfer configuration
//!
//! Timeout and retry knobs with per-flavor defaults. Serializable so
//! they can live in connection profiles.

use crate::core::protocol::{ProtocolError, ProtocolFlavor, XmodemFlavor};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Tunable parameters for one transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Time to wait for a byte, a block response, or a ZMODEM header
    pub timeout: Duration,
    /// Interval between handshake characters while waiting for the
    /// sender to wake up
    pub handshake_interval: Duration,
    /// Handshake characters sent before giving up or falling back
    pub handshake_retries: u32,
    /// Per-block / per-header retry budget
    pub max_retries: u32,
    /// ZMODEM: subpackets between ZCRCQ acknowledgment points when
    /// streaming
    pub ack_window: u32,
    /// ZMODEM: escape all control characters (ESCCTL)
    pub escape_ctl: bool,
    /// Quiet period used when draining line noise before a resync
    pub drain_quiet: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            handshake_interval: Duration::from_secs(3),
            handshake_retries: 6,
            max_retries: 10,
            ack_window: 16,
            escape_ctl: false,
            drain_quiet: Duration::from_millis(500),
        }
    }
}

impl TransferConfig {
    /// Defaults appropriate for a flavor (relaxed XMODEM stretches all
    /// timeouts to 60 s).
    pub fn for_flavor(flavor: ProtocolFlavor) -> Self {
        let mut config = Self::default();
        if let ProtocolFlavor::Xmodem(XmodemFlavor::Relaxed) = flavor {
            config.timeout = Duration::from_secs(60);
            config.handshake_interval = Duration::from_secs(10);
        }
        config
    }

    /// Progress watchdog window: twice the block timeout.
    pub fn watchdog(&self) -> Duration {
        self.timeout * 2
    }

    /// Arm a progress watchdog over this configuration's window.
    pub(crate) fn start_watchdog(&self) -> Watchdog {
        Watchdog::new(self.watchdog())
    }
}

/// Progress watchdog
///
/// Latches the time of the last line activity and fails the transfer
/// once the silence exceeds the configured window. Runs alongside the
/// per-attempt retry budgets: retries bound a noisy line, the watchdog
/// bounds a dead one.
#[derive(Debug)]
pub(crate) struct Watchdog {
    window: Duration,
    fed: Instant,
}

impl Watchdog {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            fed: Instant::now(),
        }
    }

    /// Record line activity: a successful read, a solicitation beacon
    /// going out, or streamed data leaving the buffer.
    pub(crate) fn feed(&mut self) {
        self.fed = Instant::now();
    }

    /// Fail with `Timeout` once the line has been silent past the
    /// window.
    pub(crate) fn check(&self, what: &str) -> Result<(), ProtocolError> {
        if self.fed.elapsed() > self.window {
            return Err(ProtocolError::Timeout(format!(
                "no line activity for {}s while {what}",
                self.window.as_secs()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.ack_window, 16);
        assert_eq!(config.watchdog(), Duration::from_secs(20));
    }

    #[test]
    fn test_relaxed_flavor_stretches_timeouts() {
        let config =
            TransferConfig::for_flavor(ProtocolFlavor::Xmodem(XmodemFlavor::Relaxed));
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_watchdog_trips_after_silence() {
        let watchdog = Watchdog::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(
            watchdog.check("testing"),
            Err(ProtocolError::Timeout(_))
        ));
    }

    #[test]
    fn test_watchdog_feed_resets_window() {
        let mut watchdog = Watchdog::new(Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        watchdog.feed();
        assert!(watchdog.check("testing").is_ok());
    }
}
