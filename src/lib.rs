//! # serimodem
//!
//! Serial file transfer protocols for byte-oriented, potentially lossy
//! links:
//! - XMODEM (checksum, relaxed, CRC, 1K, 1K-G)
//! - YMODEM (batch, G streaming)
//! - ZMODEM (streaming with rewind recovery and crash resume)
//!
//! ## Features
//!
//! - Sender and receiver state machines over a pluggable byte channel
//! - Shared session model: progress, message log, cancel/skip from any
//!   thread
//! - Pure frame codecs (CRC-16, CRC-32, ZDLE escaping) usable on their
//!   own
//! - Disk and in-memory file stores
//! - CLI with `sx`/`rz`-style send and receive commands
//!
//! ## Example
//!
//! ```rust,no_run
//! use serimodem::{
//!     DiskStore, ProtocolFlavor, StdioChannel, Transfer, TransferConfig, ZmodemFlavor,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let transfer = Transfer::upload(
//!         ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
//!         vec!["big.bin".into()],
//!         TransferConfig::default(),
//!     )
//!     .expect("flavor supported");
//!
//!     let session = transfer.session();
//!     let mut wire = StdioChannel::new();
//!     let state = transfer.run(&mut wire, &DiskStore::new()).await;
//!     println!("{state:?}: {}", session.current_status());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{exit_code_for, ExitCodes};
pub use crate::core::protocol::{
    Direction, FrameError, Protocol, ProtocolError, ProtocolFlavor, XmodemFlavor, YmodemFlavor,
    ZmodemFlavor,
};
pub use crate::core::session::{
    FileInfo, MessageKind, SessionEvent, SessionState, TransferMessage, TransferSession,
};
pub use crate::core::storage::{DiskStore, FileMeta, FileStore, LocalFile, MemoryStore, StorageError};
pub use crate::core::transfer::{ProtocolEngine, Transfer, TransferConfig};
pub use crate::core::wire::{
    loopback_pair, CancelToken, LoopbackChannel, StdioChannel, WireChannel, WireError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
