//! Core module containing the protocol machinery
//!
//! This module provides:
//! - Frame codecs (checksums, CRCs, ZDLE escaping, ZMODEM headers)
//! - Wire layer with timeouts and cooperative cancellation
//! - Local file capability (disk and in-memory)
//! - Session model shared between the engine and its observers
//! - XMODEM / YMODEM / ZMODEM sender and receiver engines

pub mod protocol;
pub mod session;
pub mod storage;
pub mod transfer;
pub mod wire;
