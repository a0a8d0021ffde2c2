//! ZMODEM data link escaping (ZDLE)
//!
//! ZMODEM armors its binary frames so they survive links that eat flow
//! control characters or interpret CAN. An escaped byte is sent as
//! `ZDLE` followed by the byte with bit 6 flipped. The four subpacket
//! terminators are sent as `ZDLE` + terminator letter, unescaped.
//!
//! The encoder and decoder here are pure state machines over bytes so
//! they can be driven from synthetic transcripts in tests.

use super::FrameError;

/// ZMODEM data link escape (also the CAN character)
pub const ZDLE: u8 = 0x18;
/// Escaped form of ZDLE itself
pub const ZDLEE: u8 = ZDLE ^ 0x40;
/// XON - stripped by the decoder, escaped by the encoder
pub const XON: u8 = 0x11;
/// XOFF - stripped by the decoder, escaped by the encoder
pub const XOFF: u8 = 0x13;
/// DLE, escaped to protect links that interpret it
pub const DLE: u8 = 0x10;

/// ZDLE-encoded 0x7F (rubout)
const ZRUB0: u8 = 0x6C;
/// ZDLE-encoded 0xFF
const ZRUB1: u8 = 0x6D;

/// Subpacket terminator: end of frame, no response expected
pub const ZCRCE: u8 = b'h';
/// Subpacket terminator: frame continues nonstop
pub const ZCRCG: u8 = b'i';
/// Subpacket terminator: frame continues, ZACK expected
pub const ZCRCQ: u8 = b'j';
/// Subpacket terminator: end of frame, ZACK expected
pub const ZCRCW: u8 = b'k';

/// Consecutive CAN bytes that signal a remote cancel
pub const CANCEL_RUN: u8 = 5;

/// How a data subpacket was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpacketKind {
    /// ZCRCE - end of frame, header follows, no response expected
    End,
    /// ZCRCG - more subpackets follow without acknowledgment
    Continue,
    /// ZCRCQ - more subpackets follow, receiver must ZACK
    ContinueAck,
    /// ZCRCW - end of frame, receiver must respond before more data
    EndAck,
}

impl SubpacketKind {
    /// The terminator letter sent after ZDLE
    pub fn terminator(self) -> u8 {
        match self {
            Self::End => ZCRCE,
            Self::Continue => ZCRCG,
            Self::ContinueAck => ZCRCQ,
            Self::EndAck => ZCRCW,
        }
    }

    /// Map a terminator letter back to its kind
    pub fn from_terminator(b: u8) -> Option<Self> {
        match b {
            ZCRCE => Some(Self::End),
            ZCRCG => Some(Self::Continue),
            ZCRCQ => Some(Self::ContinueAck),
            ZCRCW => Some(Self::EndAck),
            _ => None,
        }
    }

    /// Whether the receiver owes a ZACK after this terminator
    pub fn wants_ack(self) -> bool {
        matches!(self, Self::ContinueAck | Self::EndAck)
    }

    /// Whether this terminator ends the frame
    pub fn ends_frame(self) -> bool {
        matches!(self, Self::End | Self::EndAck)
    }
}

/// ZDLE encoder
///
/// Tracks the previously emitted raw byte for the `@`-CR rule: a CR
/// following `@` is escaped so "rz\r"-style command lines cannot appear
/// in the armored stream.
#[derive(Debug, Default)]
pub struct ZdleEncoder {
    escape_ctl: bool,
    last: u8,
}

impl ZdleEncoder {
    /// Create an encoder; `escape_ctl` forces escaping of all control
    /// characters (ZRINIT ESCCTL option).
    pub fn new(escape_ctl: bool) -> Self {
        Self { escape_ctl, last: 0 }
    }

    fn needs_escape(&self, b: u8) -> bool {
        match b & 0x7F {
            ZDLE => true,
            DLE | XON | XOFF => true,
            0x0D => self.escape_ctl || (self.last & 0x7F) == b'@',
            c if c < 0x20 => self.escape_ctl,
            _ => false,
        }
    }

    /// Append one byte in escaped form.
    pub fn push(&mut self, out: &mut Vec<u8>, b: u8) {
        if self.needs_escape(b) {
            out.push(ZDLE);
            out.push(b ^ 0x40);
        } else {
            out.push(b);
        }
        self.last = b;
    }

    /// Append a slice in escaped form.
    pub fn extend(&mut self, out: &mut Vec<u8>, data: &[u8]) {
        for &b in data {
            self.push(out, b);
        }
    }

    /// Append an unescaped terminator sequence (`ZDLE` + letter).
    pub fn push_terminator(&mut self, out: &mut Vec<u8>, kind: SubpacketKind) {
        out.push(ZDLE);
        out.push(kind.terminator());
        self.last = kind.terminator();
    }
}

/// One decoded unit from the escaped stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unescaped {
    /// A literal data byte
    Byte(u8),
    /// A subpacket terminator
    Terminator(SubpacketKind),
    /// Five or more consecutive CANs: the peer is aborting
    Cancel,
}

/// Incremental ZDLE decoder
///
/// Feed raw wire bytes one at a time; XON/XOFF noise is swallowed, CAN
/// runs are counted, and escape pairs are folded back into bytes.
#[derive(Debug, Default)]
pub struct ZdleDecoder {
    in_escape: bool,
    can_count: u8,
}

impl ZdleDecoder {
    /// Create a decoder in the ground state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one wire byte.
    ///
    /// Returns `Ok(None)` when the byte was consumed without producing
    /// output (escape prefix, stripped flow control).
    pub fn feed(&mut self, b: u8) -> Result<Option<Unescaped>, FrameError> {
        if !self.in_escape {
            match b {
                ZDLE => {
                    self.in_escape = true;
                    self.can_count = 1;
                    Ok(None)
                }
                XON | XOFF => Ok(None),
                b if b == XON | 0x80 || b == XOFF | 0x80 => Ok(None),
                _ => {
                    self.can_count = 0;
                    Ok(Some(Unescaped::Byte(b)))
                }
            }
        } else {
            match b {
                ZDLE => {
                    // ZDLE is CAN; a run of them is a cancel, not framing.
                    self.can_count = self.can_count.saturating_add(1);
                    if self.can_count >= CANCEL_RUN {
                        self.in_escape = false;
                        self.can_count = 0;
                        return Ok(Some(Unescaped::Cancel));
                    }
                    Ok(None)
                }
                XON | XOFF => Ok(None),
                ZCRCE | ZCRCG | ZCRCQ | ZCRCW => {
                    self.in_escape = false;
                    self.can_count = 0;
                    let kind = SubpacketKind::from_terminator(b)
                        .ok_or(FrameError::MalformedHeader)?;
                    Ok(Some(Unescaped::Terminator(kind)))
                }
                ZRUB0 => {
                    self.in_escape = false;
                    self.can_count = 0;
                    Ok(Some(Unescaped::Byte(0x7F)))
                }
                ZRUB1 => {
                    self.in_escape = false;
                    self.can_count = 0;
                    Ok(Some(Unescaped::Byte(0xFF)))
                }
                b if b & 0x60 == 0x40 => {
                    self.in_escape = false;
                    self.can_count = 0;
                    Ok(Some(Unescaped::Byte(b ^ 0x40)))
                }
                _ => {
                    self.in_escape = false;
                    self.can_count = 0;
                    Err(FrameError::MalformedHeader)
                }
            }
        }
    }
}
