//! ZMODEM header and subpacket codec
//!
//! A ZMODEM header is `<type:1><P0..P3:4>` protected by CRC-16 or
//! CRC-32 and carried in one of three armors:
//! - `ZHEX` - hex-ASCII, CRC-16, used for control exchanges
//! - `ZBIN` - ZDLE-escaped binary, CRC-16
//! - `ZBIN32` - ZDLE-escaped binary, CRC-32
//!
//! Data subpackets trail `ZFILE`/`ZDATA` headers: an escaped payload,
//! a `ZCRC{E,G,Q,W}` terminator, and a CRC covering payload plus the
//! terminator letter.

use super::checksum::{crc16_update, crc16_xmodem, crc32_finish, crc32_init, crc32_update};
use super::zdle::{SubpacketKind, ZdleEncoder, ZDLE};
use super::FrameError;

/// Pad character that precedes every header
pub const ZPAD: u8 = b'*';
/// Armor letter: binary, CRC-16
pub const ZBIN: u8 = b'A';
/// Armor letter: hex-ASCII, CRC-16
pub const ZHEX: u8 = b'B';
/// Armor letter: binary, CRC-32
pub const ZBIN32: u8 = b'C';

/// ZRINIT capability: full duplex
pub const CANFDX: u8 = 0x01;
/// ZRINIT capability: overlapped I/O
pub const CANOVIO: u8 = 0x02;
/// ZRINIT capability: 32-bit CRC
pub const CANFC32: u8 = 0x20;
/// ZRINIT capability: escape all control characters
pub const ESCCTL: u8 = 0x40;

/// ZFILE conversion option: binary transfer
pub const ZCBIN: u8 = 1;
/// ZFILE conversion option: convert newlines
pub const ZCNL: u8 = 2;
/// ZFILE conversion option: resume an interrupted transfer
pub const ZCRESUM: u8 = 3;

/// Header type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderKind {
    /// Request receive init
    Rqinit = 0,
    /// Receive init (capabilities in ZF0)
    Rinit = 1,
    /// Send init (attention sequence follows)
    Sinit = 2,
    /// Acknowledge, position echoed
    Ack = 3,
    /// File metadata follows in a subpacket
    File = 4,
    /// Skip the offered file
    Skip = 5,
    /// Last header was garbled
    Nak = 6,
    /// Abort the batch
    Abort = 7,
    /// Finish the session
    Fin = 8,
    /// Resume or rewind to position
    Rpos = 9,
    /// Data subpackets follow from position
    Data = 10,
    /// End of file at position
    Eof = 11,
    /// Fatal local file error
    Ferr = 12,
    /// Request file CRC
    Crc = 13,
    /// Receiver challenge
    Challenge = 14,
    /// Request complete
    Compl = 15,
    /// Pseudo-header: peer sent a CAN run
    Can = 16,
    /// Request free bytes on filesystem
    Freecnt = 17,
    /// Command from sender
    Command = 18,
}

impl HeaderKind {
    /// Map a wire type byte to a header kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        use HeaderKind::*;
        Some(match b {
            0 => Rqinit,
            1 => Rinit,
            2 => Sinit,
            3 => Ack,
            4 => File,
            5 => Skip,
            6 => Nak,
            7 => Abort,
            8 => Fin,
            9 => Rpos,
            10 => Data,
            11 => Eof,
            12 => Ferr,
            13 => Crc,
            14 => Challenge,
            15 => Compl,
            16 => Can,
            17 => Freecnt,
            18 => Command,
            _ => return None,
        })
    }
}

/// A decoded ZMODEM header: type plus four data bytes P0..P3.
///
/// Position-bearing headers store the offset little-endian (P0 low).
/// Flag-bearing headers use ZF0 = P3 down to ZF3 = P0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Header type
    pub kind: HeaderKind,
    /// P0..P3 as transmitted
    pub data: [u8; 4],
}

impl Header {
    /// Header with all-zero data bytes.
    pub fn new(kind: HeaderKind) -> Self {
        Self { kind, data: [0; 4] }
    }

    /// Header carrying a file position.
    pub fn with_pos(kind: HeaderKind, pos: u32) -> Self {
        Self { kind, data: pos.to_le_bytes() }
    }

    /// Header carrying flag bytes ZF0..ZF3.
    pub fn with_flags(kind: HeaderKind, zf0: u8, zf1: u8, zf2: u8, zf3: u8) -> Self {
        Self { kind, data: [zf3, zf2, zf1, zf0] }
    }

    /// File position for position-bearing headers.
    pub fn pos(&self) -> u32 {
        u32::from_le_bytes(self.data)
    }

    /// ZF0 flag byte (P3).
    pub fn zf0(&self) -> u8 {
        self.data[3]
    }

    /// ZF1 flag byte (P2).
    pub fn zf1(&self) -> u8 {
        self.data[2]
    }

    fn body(&self) -> [u8; 5] {
        [
            self.kind as u8,
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

fn hex_nibble(b: u8) -> Result<u8, FrameError> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        _ => Err(FrameError::MalformedHeader),
    }
}

/// Encode a header in ZHEX armor.
///
/// Hex headers end with CR LF and, except for ZFIN and ZACK, an XON to
/// restart paused senders.
pub fn encode_hex(header: &Header) -> Vec<u8> {
    let body = header.body();
    let crc = crc16_xmodem(&body);

    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[ZPAD, ZPAD, ZDLE, ZHEX]);
    for b in body.iter().chain(crc.to_be_bytes().iter()) {
        out.push(HEX_DIGITS[(b >> 4) as usize]);
        out.push(HEX_DIGITS[(b & 0x0F) as usize]);
    }
    out.push(b'\r');
    out.push(b'\n');
    if !matches!(header.kind, HeaderKind::Fin | HeaderKind::Ack) {
        out.push(super::zdle::XON);
    }
    out
}

/// Decode the 14 hex digits of a ZHEX header body (type, P0..P3, CRC).
pub fn decode_hex_body(digits: &[u8]) -> Result<Header, FrameError> {
    if digits.len() != 14 {
        return Err(FrameError::MalformedHeader);
    }
    let mut bytes = [0u8; 7];
    for (i, pair) in digits.chunks(2).enumerate() {
        bytes[i] = (hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?;
    }
    decode_bin16_body(&bytes)
}

/// Encode a header in ZBIN armor (CRC-16, ZDLE-escaped).
pub fn encode_bin16(header: &Header, escape_ctl: bool) -> Vec<u8> {
    let body = header.body();
    let crc = crc16_xmodem(&body);

    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&[ZPAD, ZDLE, ZBIN]);
    let mut enc = ZdleEncoder::new(escape_ctl);
    enc.extend(&mut out, &body);
    enc.extend(&mut out, &crc.to_be_bytes());
    out
}

/// Encode a header in ZBIN32 armor (CRC-32, ZDLE-escaped).
pub fn encode_bin32(header: &Header, escape_ctl: bool) -> Vec<u8> {
    let body = header.body();
    let crc = crc32_finish(crc32_update(crc32_init(), &body));

    let mut out = Vec::with_capacity(28);
    out.extend_from_slice(&[ZPAD, ZDLE, ZBIN32]);
    let mut enc = ZdleEncoder::new(escape_ctl);
    enc.extend(&mut out, &body);
    enc.extend(&mut out, &crc.to_le_bytes());
    out
}

/// Decode an unescaped 7-byte ZBIN/ZHEX header body.
pub fn decode_bin16_body(bytes: &[u8; 7]) -> Result<Header, FrameError> {
    let crc = crc16_xmodem(&bytes[..5]);
    if crc != u16::from_be_bytes([bytes[5], bytes[6]]) {
        return Err(FrameError::BadCrc);
    }
    let kind = HeaderKind::from_byte(bytes[0]).ok_or(FrameError::MalformedHeader)?;
    Ok(Header {
        kind,
        data: [bytes[1], bytes[2], bytes[3], bytes[4]],
    })
}

/// Decode an unescaped 9-byte ZBIN32 header body.
pub fn decode_bin32_body(bytes: &[u8; 9]) -> Result<Header, FrameError> {
    let crc = crc32_finish(crc32_update(crc32_init(), &bytes[..5]));
    if crc != u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) {
        return Err(FrameError::BadCrc);
    }
    let kind = HeaderKind::from_byte(bytes[0]).ok_or(FrameError::MalformedHeader)?;
    Ok(Header {
        kind,
        data: [bytes[1], bytes[2], bytes[3], bytes[4]],
    })
}

/// Encode a data subpacket: escaped payload, terminator, escaped CRC.
///
/// The CRC covers the payload bytes and the terminator letter.
pub fn encode_subpacket(
    payload: &[u8],
    kind: SubpacketKind,
    crc32: bool,
    escape_ctl: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 8 + 12);
    let mut enc = ZdleEncoder::new(escape_ctl);
    enc.extend(&mut out, payload);
    enc.push_terminator(&mut out, kind);

    if crc32 {
        let mut crc = crc32_update(crc32_init(), payload);
        crc = crc32_update(crc, &[kind.terminator()]);
        enc.extend(&mut out, &crc32_finish(crc).to_le_bytes());
    } else {
        let mut crc = crc16_update(0, payload);
        crc = crc16_update(crc, &[kind.terminator()]);
        enc.extend(&mut out, &crc.to_be_bytes());
    }
    out
}

/// Verify a subpacket CRC over payload + terminator letter.
pub fn verify_subpacket_crc16(payload: &[u8], kind: SubpacketKind, got: u16) -> bool {
    let mut crc = crc16_update(0, payload);
    crc = crc16_update(crc, &[kind.terminator()]);
    crc == got
}

/// Verify a 32-bit subpacket CRC over payload + terminator letter.
pub fn verify_subpacket_crc32(payload: &[u8], kind: SubpacketKind, got: u32) -> bool {
    let mut crc = crc32_update(crc32_init(), payload);
    crc = crc32_update(crc, &[kind.terminator()]);
    crc32_finish(crc) == got
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_header_round_trip() {
        let header = Header::with_pos(HeaderKind::Rpos, 0x0012_3456);
        let wire = encode_hex(&header);
        assert_eq!(&wire[..4], &[ZPAD, ZPAD, ZDLE, ZHEX]);
        let decoded = decode_hex_body(&wire[4..18]).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.pos(), 0x0012_3456);
    }

    #[test]
    fn test_hex_header_xon_suppression() {
        let fin = encode_hex(&Header::new(HeaderKind::Fin));
        assert_ne!(*fin.last().unwrap(), super::super::zdle::XON);
        let rinit = encode_hex(&Header::new(HeaderKind::Rinit));
        assert_eq!(*rinit.last().unwrap(), super::super::zdle::XON);
    }

    #[test]
    fn test_bin16_body_round_trip() {
        let header = Header::with_flags(HeaderKind::Rinit, CANFDX | CANOVIO | CANFC32, 0, 0, 0);
        let body = header.body();
        let crc = crc16_xmodem(&body);
        let mut bytes = [0u8; 7];
        bytes[..5].copy_from_slice(&body);
        bytes[5..].copy_from_slice(&crc.to_be_bytes());
        let decoded = decode_bin16_body(&bytes).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.zf0(), CANFDX | CANOVIO | CANFC32);
    }

    #[test]
    fn test_bin16_bad_crc() {
        let header = Header::new(HeaderKind::Data);
        let body = header.body();
        let crc = crc16_xmodem(&body) ^ 0x0001;
        let mut bytes = [0u8; 7];
        bytes[..5].copy_from_slice(&body);
        bytes[5..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(decode_bin16_body(&bytes), Err(FrameError::BadCrc));
    }

    #[test]
    fn test_bin32_body_round_trip() {
        let header = Header::with_pos(HeaderKind::Eof, 8192);
        let body = header.body();
        let crc = crc32_finish(crc32_update(crc32_init(), &body));
        let mut bytes = [0u8; 9];
        bytes[..5].copy_from_slice(&body);
        bytes[5..].copy_from_slice(&crc.to_le_bytes());
        let decoded = decode_bin32_body(&bytes).expect("decode");
        assert_eq!(decoded.pos(), 8192);
    }

    #[test]
    fn test_subpacket_crc() {
        let payload = b"zmodem data subpacket";
        let wire = encode_subpacket(payload, SubpacketKind::Continue, false, false);
        // Wire ends with ZDLE, terminator, then the 2-byte CRC (none of
        // these bytes need escaping for this payload).
        let n = wire.len();
        assert_eq!(wire[n - 4], ZDLE);
        assert_eq!(wire[n - 3], SubpacketKind::Continue.terminator());
        let got = u16::from_be_bytes([wire[n - 2], wire[n - 1]]);
        assert!(verify_subpacket_crc16(payload, SubpacketKind::Continue, got));
        assert!(!verify_subpacket_crc16(payload, SubpacketKind::End, got));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = [0u8; 7];
        bytes[0] = 42;
        let crc = crc16_xmodem(&bytes[..5]);
        bytes[5..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(decode_bin16_body(&bytes), Err(FrameError::MalformedHeader));
    }
}
