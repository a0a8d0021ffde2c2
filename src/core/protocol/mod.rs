//! Protocol identities, flavors, and the error taxonomy
//!
//! Provides:
//! - Protocol and per-protocol flavor enumerations
//! - Frame-level codec errors
//! - The transfer error taxonomy shared by all engines

pub mod checksum;
pub mod zdle;
pub mod zheader;

use std::fmt;
use thiserror::Error;

/// Protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// XMODEM - single file, fixed blocks
    Xmodem,
    /// YMODEM - batch transfer with a metadata block
    Ymodem,
    /// ZMODEM - streaming, header-driven, resumable
    Zmodem,
    /// Kermit - robust packet protocol (no engine in this crate)
    Kermit,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xmodem => write!(f, "XMODEM"),
            Self::Ymodem => write!(f, "YMODEM"),
            Self::Zmodem => write!(f, "ZMODEM"),
            Self::Kermit => write!(f, "Kermit"),
        }
    }
}

/// XMODEM variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmodemFlavor {
    /// Original 128-byte blocks with additive checksum
    Vanilla,
    /// Checksum blocks with long (60 s) timeouts
    Relaxed,
    /// 128-byte blocks with CRC-16
    Crc,
    /// 1024-byte blocks with CRC-16
    OneK,
    /// 1024-byte blocks, streaming, no per-block ACK
    OneKG,
}

/// YMODEM variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YmodemFlavor {
    /// Batch transfer, 1K blocks, CRC-16
    Vanilla,
    /// Streaming without per-block ACK
    G,
}

/// ZMODEM variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZmodemFlavor {
    /// CRC-16 binary headers and subpackets
    Vanilla,
    /// CRC-32 binary headers and subpackets
    Crc32,
}

/// A protocol together with its selected variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFlavor {
    /// XMODEM with variant
    Xmodem(XmodemFlavor),
    /// YMODEM with variant
    Ymodem(YmodemFlavor),
    /// ZMODEM with variant
    Zmodem(ZmodemFlavor),
    /// Kermit (unsupported by the engines here)
    Kermit,
}

impl ProtocolFlavor {
    /// Protocol family of this flavor
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Xmodem(_) => Protocol::Xmodem,
            Self::Ymodem(_) => Protocol::Ymodem,
            Self::Zmodem(_) => Protocol::Zmodem,
            Self::Kermit => Protocol::Kermit,
        }
    }

    /// Human-readable protocol name including the variant
    pub fn name(&self) -> &'static str {
        match self {
            Self::Xmodem(XmodemFlavor::Vanilla) => "XMODEM",
            Self::Xmodem(XmodemFlavor::Relaxed) => "XMODEM (relaxed)",
            Self::Xmodem(XmodemFlavor::Crc) => "XMODEM-CRC",
            Self::Xmodem(XmodemFlavor::OneK) => "XMODEM-1K",
            Self::Xmodem(XmodemFlavor::OneKG) => "XMODEM-1K/G",
            Self::Ymodem(YmodemFlavor::Vanilla) => "YMODEM",
            Self::Ymodem(YmodemFlavor::G) => "YMODEM-G",
            Self::Zmodem(ZmodemFlavor::Vanilla) => "ZMODEM",
            Self::Zmodem(ZmodemFlavor::Crc32) => "ZMODEM/CRC32",
            Self::Kermit => "Kermit",
        }
    }

    /// Nominal block size for the flavor
    ///
    /// ZMODEM uses variable-length subpackets; the value here is the
    /// subpacket size the sender aims for.
    pub fn block_size(&self) -> usize {
        match self {
            Self::Xmodem(XmodemFlavor::OneK | XmodemFlavor::OneKG) => 1024,
            Self::Xmodem(_) => 128,
            Self::Ymodem(_) => 1024,
            Self::Zmodem(_) => 1024,
            Self::Kermit => 94,
        }
    }

    /// Whether the flavor streams data without per-block acknowledgment
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::Xmodem(XmodemFlavor::OneKG) | Self::Ymodem(YmodemFlavor::G) | Self::Zmodem(_)
        )
    }
}

impl fmt::Display for ProtocolFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local files go to the remote side
    Upload,
    /// Remote files land in a local directory
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// Frame codec errors
///
/// Produced by the pure encoders/decoders; engines recover from these
/// locally (retry, resync) before promoting to [`ProtocolError`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Additive checksum mismatch
    #[error("checksum mismatch")]
    BadChecksum,

    /// CRC-16 or CRC-32 mismatch
    #[error("CRC mismatch")]
    BadCrc,

    /// Header or escape sequence that cannot be parsed
    #[error("malformed header")]
    MalformedHeader,

    /// Input ended inside a frame
    #[error("unexpected end of input")]
    UnexpectedEof,
}

/// Transfer error taxonomy
///
/// `Integrity` and `Timeout` are recovered locally via bounded
/// retry/resync; exceeding the budget promotes to `Protocol`. The
/// remaining variants terminate the session immediately.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Checksum/CRC mismatch or malformed frame
    #[error("integrity error: {0}")]
    Integrity(String),

    /// No bytes within the configured window
    #[error("timed out: {0}")]
    Timeout(String),

    /// Impossible sequence or retry budget exceeded
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying channel failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Peer sent the abort sequence
    #[error("remote side cancelled the transfer")]
    RemoteCancel,

    /// cancel_transfer() was invoked locally
    #[error("transfer cancelled")]
    LocalCancel,

    /// Local file open/read/write/seek failure
    #[error("file error: {0}")]
    File(String),

    /// Negotiation produced no usable protocol variant
    #[error("unsupported flavor: {0}")]
    UnsupportedFlavor(String),
}

impl ProtocolError {
    /// Short taxonomy tag used in the session message log
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Integrity(_) => "IntegrityError",
            Self::Timeout(_) => "TimeoutError",
            Self::Protocol(_) => "ProtocolError",
            Self::Io(_) => "IoError",
            Self::RemoteCancel => "RemoteCancel",
            Self::LocalCancel => "LocalCancel",
            Self::File(_) => "FileError",
            Self::UnsupportedFlavor(_) => "UnsupportedFlavor",
        }
    }
}

impl From<FrameError> for ProtocolError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::UnexpectedEof => Self::Io("channel closed mid-frame".into()),
            other => Self::Integrity(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flavor_block_sizes() {
        assert_eq!(ProtocolFlavor::Xmodem(XmodemFlavor::Vanilla).block_size(), 128);
        assert_eq!(ProtocolFlavor::Xmodem(XmodemFlavor::OneK).block_size(), 1024);
        assert_eq!(ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla).block_size(), 1024);
    }

    #[test]
    fn streaming_flavors() {
        assert!(ProtocolFlavor::Xmodem(XmodemFlavor::OneKG).is_streaming());
        assert!(ProtocolFlavor::Ymodem(YmodemFlavor::G).is_streaming());
        assert!(ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32).is_streaming());
        assert!(!ProtocolFlavor::Xmodem(XmodemFlavor::Crc).is_streaming());
    }

    #[test]
    fn error_tags() {
        assert_eq!(ProtocolError::RemoteCancel.tag(), "RemoteCancel");
        assert_eq!(ProtocolError::Timeout("header".into()).tag(), "TimeoutError");
    }
}
