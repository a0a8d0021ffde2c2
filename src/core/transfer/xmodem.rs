//! XMODEM engines
//!
//! Sender and receiver state machines for the XMODEM family:
//! checksum, relaxed, CRC, 1K, and 1K-G streaming. YMODEM builds on
//! the block primitives exported here.

use super::config::{TransferConfig, Watchdog};
use crate::core::protocol::checksum::{crc16_xmodem, sum8};
use crate::core::protocol::{FrameError, ProtocolError, XmodemFlavor};
use crate::core::session::{FileInfo, SessionState, TransferSession};
use crate::core::storage::{FileStore, LocalFile};
use crate::core::wire::{WireChannel, WireError};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

// Control bytes
pub(crate) const SOH: u8 = 0x01; // 128-byte block header
pub(crate) const STX: u8 = 0x02; // 1024-byte block header
pub(crate) const EOT: u8 = 0x04;
pub(crate) const ACK: u8 = 0x06;
pub(crate) const NAK: u8 = 0x15;
pub(crate) const CAN: u8 = 0x18;
pub(crate) const CPMEOF: u8 = 0x1A; // CP/M EOF, pads the last block
pub(crate) const CRC_CHAR: u8 = b'C';
pub(crate) const G_CHAR: u8 = b'G';

/// Block trailer algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Integrity {
    /// 8-bit additive checksum
    Checksum,
    /// CRC-16/XMODEM
    Crc16,
}

impl Integrity {
    pub(crate) fn trailer_len(self) -> usize {
        match self {
            Self::Checksum => 1,
            Self::Crc16 => 2,
        }
    }

    fn append(self, block: &[u8], out: &mut Vec<u8>) {
        match self {
            Self::Checksum => out.push(sum8(block)),
            Self::Crc16 => out.extend_from_slice(&crc16_xmodem(block).to_be_bytes()),
        }
    }

    fn verify(self, block: &[u8], trailer: &[u8]) -> Result<(), FrameError> {
        match self {
            Self::Checksum => {
                if sum8(block) == trailer[0] {
                    Ok(())
                } else {
                    Err(FrameError::BadChecksum)
                }
            }
            Self::Crc16 => {
                let got = u16::from_be_bytes([trailer[0], trailer[1]]);
                if crc16_xmodem(block) == got {
                    Ok(())
                } else {
                    Err(FrameError::BadCrc)
                }
            }
        }
    }
}

/// Map a wire failure into the transfer taxonomy.
pub(crate) fn wire_err(err: WireError, what: &str) -> ProtocolError {
    match err {
        WireError::Timeout => ProtocolError::Timeout(what.to_string()),
        WireError::Cancelled => ProtocolError::LocalCancel,
        WireError::Eof => ProtocolError::Io(format!("channel closed while {what}")),
        WireError::Io(e) => ProtocolError::Io(e),
    }
}

/// Transmit the XMODEM/YMODEM abort sequence.
pub(crate) async fn send_cancel_sequence(chan: &mut dyn WireChannel) {
    let _ = chan.write_all(&[CAN, CAN, CAN]).await;
    let _ = chan.flush().await;
}

/// Build one wire block: header, sequence pair, padded payload,
/// trailer.
pub(crate) fn build_block(seq: u8, data: &[u8], block_size: usize, integrity: Integrity) -> Vec<u8> {
    debug_assert!(data.len() <= block_size);
    let mut packet = Vec::with_capacity(block_size + 5);
    packet.push(if block_size == 1024 { STX } else { SOH });
    packet.push(seq);
    packet.push(!seq);

    let mut block = data.to_vec();
    block.resize(block_size, CPMEOF);
    packet.extend_from_slice(&block);
    integrity.append(&block, &mut packet);
    packet
}

/// A received block after integrity checks.
pub(crate) struct WireBlock {
    pub seq: u8,
    pub data: Vec<u8>,
}

/// Read the remainder of a block whose header byte (SOH/STX) was
/// already consumed.
///
/// The outer `Result` carries fatal wire failures; the inner one
/// carries NAK-able integrity problems. The payload is always consumed
/// so the stream stays aligned.
pub(crate) async fn read_block_body(
    chan: &mut dyn WireChannel,
    header: u8,
    integrity: Integrity,
    timeout: Duration,
) -> Result<Result<WireBlock, FrameError>, ProtocolError> {
    let block_size = if header == STX { 1024 } else { 128 };

    let mut seq_pair = [0u8; 2];
    match chan.read_exact(&mut seq_pair, timeout).await {
        Ok(()) => {}
        Err(WireError::Timeout) => return Ok(Err(FrameError::UnexpectedEof)),
        Err(e) => return Err(wire_err(e, "reading block sequence")),
    }

    let mut payload = vec![0u8; block_size + integrity.trailer_len()];
    match chan.read_exact(&mut payload, timeout).await {
        Ok(()) => {}
        Err(WireError::Timeout) => return Ok(Err(FrameError::UnexpectedEof)),
        Err(e) => return Err(wire_err(e, "reading block payload")),
    }

    let [seq, cmp] = seq_pair;
    if seq ^ cmp != 0xFF {
        return Ok(Err(FrameError::MalformedHeader));
    }

    let (data, trailer) = payload.split_at(block_size);
    match integrity.verify(data, trailer) {
        Ok(()) => Ok(Ok(WireBlock {
            seq,
            data: data.to_vec(),
        })),
        Err(e) => Ok(Err(e)),
    }
}

/// Send a single control byte and flush.
pub(crate) async fn send_control(chan: &mut dyn WireChannel, byte: u8) -> Result<(), ProtocolError> {
    chan.write_all(&[byte])
        .await
        .map_err(|e| wire_err(e, "writing control byte"))?;
    chan.flush().await.map_err(|e| wire_err(e, "flushing control byte"))
}

/// Watch for the second CAN of an abort pair. Returns `RemoteCancel`
/// if it arrives.
pub(crate) async fn confirm_remote_cancel(
    chan: &mut dyn WireChannel,
) -> Result<(), ProtocolError> {
    match chan.read_byte(Duration::from_millis(500)).await {
        Ok(CAN) => Err(ProtocolError::RemoteCancel),
        Ok(_) | Err(WireError::Timeout) => Ok(()),
        Err(e) => Err(wire_err(e, "checking for CAN pair")),
    }
}

/// Bail out with `LocalCancel` if the observer asked for it, emitting
/// the abort sequence first.
pub(crate) async fn check_local_cancel(
    session: &TransferSession,
    chan: &mut dyn WireChannel,
) -> Result<(), ProtocolError> {
    if session.cancel_requested() {
        send_cancel_sequence(chan).await;
        return Err(ProtocolError::LocalCancel);
    }
    Ok(())
}

/// XMODEM receiver engine.
pub(crate) struct XmodemReceiver {
    flavor: XmodemFlavor,
    config: TransferConfig,
    /// Where the received bytes land (XMODEM carries no filename).
    target: PathBuf,
}

impl XmodemReceiver {
    pub(crate) fn new(flavor: XmodemFlavor, config: TransferConfig, target: PathBuf) -> Self {
        Self {
            flavor,
            config,
            target,
        }
    }

    fn preferred_handshake(&self) -> (u8, Integrity, bool) {
        match self.flavor {
            XmodemFlavor::Vanilla | XmodemFlavor::Relaxed => (NAK, Integrity::Checksum, false),
            XmodemFlavor::Crc | XmodemFlavor::OneK => (CRC_CHAR, Integrity::Crc16, false),
            XmodemFlavor::OneKG => (G_CHAR, Integrity::Crc16, true),
        }
    }

    pub(crate) async fn run(
        &mut self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        store: &dyn FileStore,
    ) -> Result<(), ProtocolError> {
        let (handshake, mut integrity, streaming) = self.preferred_handshake();

        session.set_state(SessionState::Transfer);
        let name = self
            .target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".into());
        session.begin_file(FileInfo::new(name, self.target.clone()));
        session.add_info(format!("{} receive started", session.protocol_name()));

        let (mut sink, _) = store
            .open_sink(&self.target, false)
            .await
            .map_err(|e| ProtocolError::File(e.to_string()))?;

        // Handshake: solicit the sender, falling back from CRC to
        // checksum when it stays silent. Each solicitation is a byte
        // out, so the watchdog starts biting once blocks are due.
        let mut watchdog = self.config.start_watchdog();
        let mut first_header = None;
        let mut solicitor = handshake;
        let mut tries = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            send_control(chan, solicitor).await?;
            watchdog.feed();
            match chan.read_byte(self.config.handshake_interval).await {
                Ok(b @ (SOH | STX)) => {
                    first_header = Some(b);
                    break;
                }
                Ok(CAN) => {
                    confirm_remote_cancel(chan).await?;
                }
                Ok(other) => {
                    debug!(byte = other, "ignoring noise during handshake");
                }
                Err(WireError::Timeout) => {
                    tries += 1;
                    if tries == self.config.handshake_retries
                        && matches!(self.flavor, XmodemFlavor::Crc | XmodemFlavor::OneK)
                    {
                        session.add_info("no answer to CRC handshake, retrying with checksum");
                        solicitor = NAK;
                        integrity = Integrity::Checksum;
                    } else if tries >= self.config.handshake_retries * 2 {
                        return Err(ProtocolError::Timeout("handshake".into()));
                    }
                }
                Err(e) => return Err(wire_err(e, "waiting for first block")),
            }
        }
        session.add_info(match integrity {
            Integrity::Crc16 => "sender answered, CRC mode locked",
            Integrity::Checksum => "sender answered, checksum mode locked",
        });

        let mut expected: u8 = 1;
        let mut errors = 0u32;
        let mut header = first_header;

        loop {
            check_local_cancel(session, chan).await?;

            let first = match header.take() {
                Some(b) => b,
                None => match chan.read_byte(self.config.timeout).await {
                    Ok(b) => {
                        watchdog.feed();
                        b
                    }
                    Err(WireError::Timeout) => {
                        watchdog.check("waiting for a block")?;
                        errors += 1;
                        session.note_file_error();
                        if errors > self.config.max_retries {
                            send_cancel_sequence(chan).await;
                            return Err(ProtocolError::Protocol(
                                "too many timeouts waiting for a block".into(),
                            ));
                        }
                        send_control(chan, NAK).await?;
                        continue;
                    }
                    Err(e) => return Err(wire_err(e, "waiting for block header")),
                },
            };

            match first {
                SOH | STX => {
                    let block_size = if first == STX { 1024 } else { 128 };
                    session.set_block_size(block_size);
                    match read_block_body(chan, first, integrity, self.config.timeout).await? {
                        Ok(block) if block.seq == expected => {
                            sink.write_all(&block.data)
                                .await
                                .map_err(|e| ProtocolError::File(e.to_string()))?;
                            expected = expected.wrapping_add(1);
                            errors = 0;
                            session.note_progress(block.data.len() as u64, 1);
                            if !streaming {
                                send_control(chan, ACK).await?;
                            }
                        }
                        Ok(block) if block.seq == expected.wrapping_sub(1) => {
                            // Retransmission after a lost ACK; confirm
                            // without rewriting.
                            debug!(seq = block.seq, "duplicate block acknowledged");
                            if !streaming {
                                send_control(chan, ACK).await?;
                            }
                        }
                        Ok(block) => {
                            send_cancel_sequence(chan).await;
                            return Err(ProtocolError::Protocol(format!(
                                "block {} arrived while expecting {}",
                                block.seq, expected
                            )));
                        }
                        Err(frame_err) => {
                            session.note_file_error();
                            if streaming {
                                send_cancel_sequence(chan).await;
                                return Err(ProtocolError::Integrity(format!(
                                    "{frame_err} in streaming mode"
                                )));
                            }
                            errors += 1;
                            if errors > self.config.max_retries {
                                send_cancel_sequence(chan).await;
                                return Err(ProtocolError::Protocol(format!(
                                    "block {expected} failed {errors} times: {frame_err}"
                                )));
                            }
                            warn!(%frame_err, block = expected, "bad block, requesting resend");
                            chan.drain(self.config.drain_quiet)
                                .await
                                .map_err(|e| wire_err(e, "draining before resync"))?;
                            send_control(chan, NAK).await?;
                        }
                    }
                }
                EOT => {
                    // First EOT gets a NAK; the sender proves it meant
                    // it by repeating.
                    send_control(chan, NAK).await?;
                    let mut eot_tries = 0u32;
                    loop {
                        match chan.read_byte(self.config.timeout).await {
                            Ok(EOT) => {
                                watchdog.feed();
                                send_control(chan, ACK).await?;
                                break;
                            }
                            Ok(other) => {
                                watchdog.feed();
                                debug!(byte = other, "unexpected byte inside EOT dance");
                            }
                            Err(WireError::Timeout) => {
                                watchdog.check("waiting for the second EOT")?;
                                eot_tries += 1;
                                if eot_tries > self.config.max_retries {
                                    return Err(ProtocolError::Timeout("second EOT".into()));
                                }
                                send_control(chan, NAK).await?;
                            }
                            Err(e) => return Err(wire_err(e, "waiting for second EOT")),
                        }
                    }
                    sink.flush()
                        .await
                        .map_err(|e| ProtocolError::File(e.to_string()))?;
                    session.finish_file();
                    session.set_state(SessionState::FileDone);
                    session.add_info("file received");
                    session.set_state(SessionState::End);
                    return Ok(());
                }
                CAN => {
                    confirm_remote_cancel(chan).await?;
                }
                other => {
                    debug!(byte = other, "ignoring noise between blocks");
                }
            }
        }
    }
}

/// XMODEM sender engine.
pub(crate) struct XmodemSender {
    flavor: XmodemFlavor,
    config: TransferConfig,
    path: PathBuf,
}

impl XmodemSender {
    pub(crate) fn new(flavor: XmodemFlavor, config: TransferConfig, path: PathBuf) -> Self {
        Self {
            flavor,
            config,
            path,
        }
    }

    pub(crate) async fn run(
        &mut self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        store: &dyn FileStore,
    ) -> Result<(), ProtocolError> {
        let (mut source, meta) = store
            .open_source(&self.path)
            .await
            .map_err(|e| ProtocolError::File(e.to_string()))?;

        let block_size = match self.flavor {
            XmodemFlavor::OneK | XmodemFlavor::OneKG => 1024,
            _ => 128,
        };

        session.set_state(SessionState::Transfer);
        session.begin_upload_file(0, meta.size as i64, meta.mtime, meta.mode);
        session.set_block_size(block_size);
        let blocks_total = meta.size.div_ceil(block_size as u64);
        session.set_totals(meta.size, blocks_total.max(1));
        session.add_info(format!(
            "{} send started: {} ({} bytes)",
            session.protocol_name(),
            self.path.display(),
            meta.size
        ));

        // Wait for the receiver to announce its mode.
        let mut watchdog = self.config.start_watchdog();
        let (integrity, streaming) = self.await_handshake(session, chan, &mut watchdog).await?;
        session.add_info(match (integrity, streaming) {
            (_, true) => "receiver requested streaming (G) mode",
            (Integrity::Crc16, _) => "receiver requested CRC mode",
            (Integrity::Checksum, _) => "receiver requested checksum mode",
        });

        let mut seq: u8 = 1;
        let mut buf = vec![0u8; block_size];
        loop {
            let mut filled = 0;
            while filled < block_size {
                let n = source
                    .read(&mut buf[filled..])
                    .await
                    .map_err(|e| ProtocolError::File(e.to_string()))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }

            let packet = build_block(seq, &buf[..filled], block_size, integrity);
            self.send_block(session, chan, &packet, seq, streaming, &mut watchdog)
                .await?;
            seq = seq.wrapping_add(1);
            session.note_progress(filled as u64, 1);
            if filled < block_size {
                break;
            }
        }

        // EOT dance: the first EOT draws a NAK, the second an ACK.
        let mut tries = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            send_control(chan, EOT).await?;
            let reply = chan.read_byte(self.config.timeout).await;
            if reply.is_ok() {
                watchdog.feed();
            }
            match reply {
                Ok(ACK) => break,
                Ok(NAK) => continue,
                Ok(CAN) => {
                    confirm_remote_cancel(chan).await?;
                }
                Ok(other) => {
                    debug!(byte = other, "unexpected reply to EOT");
                }
                Err(WireError::Timeout) => {
                    watchdog.check("waiting for the EOT acknowledgment")?;
                    tries += 1;
                    if tries > self.config.max_retries {
                        return Err(ProtocolError::Timeout("EOT acknowledgment".into()));
                    }
                }
                Err(e) => return Err(wire_err(e, "waiting for EOT reply")),
            }
        }

        session.finish_file();
        session.set_state(SessionState::FileDone);
        session.add_info("file sent");
        session.set_state(SessionState::End);
        Ok(())
    }

    async fn await_handshake(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        watchdog: &mut Watchdog,
    ) -> Result<(Integrity, bool), ProtocolError> {
        let mut tries = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            // The receiver may take a while to come up; wait a full
            // watchdog window per attempt.
            let answer = chan.read_byte(self.config.watchdog()).await;
            if answer.is_ok() {
                watchdog.feed();
            }
            match answer {
                Ok(CRC_CHAR) => return Ok((Integrity::Crc16, false)),
                Ok(G_CHAR) => return Ok((Integrity::Crc16, true)),
                Ok(NAK) => return Ok((Integrity::Checksum, false)),
                Ok(CAN) => {
                    confirm_remote_cancel(chan).await?;
                }
                Ok(other) => {
                    debug!(byte = other, "ignoring noise while waiting for handshake");
                }
                Err(WireError::Timeout) => {
                    tries += 1;
                    if tries >= self.config.handshake_retries {
                        return Err(ProtocolError::Timeout("receiver handshake".into()));
                    }
                }
                Err(e) => return Err(wire_err(e, "waiting for handshake")),
            }
        }
    }

    async fn send_block(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        packet: &[u8],
        seq: u8,
        streaming: bool,
        watchdog: &mut Watchdog,
    ) -> Result<(), ProtocolError> {
        let mut retries = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            chan.write_all(packet)
                .await
                .map_err(|e| wire_err(e, "writing block"))?;
            chan.flush().await.map_err(|e| wire_err(e, "flushing block"))?;

            if streaming {
                // Streamed data going out keeps the line alive.
                watchdog.feed();
                // No ACK in G mode, but a receiver abort can already be
                // queued; look without waiting.
                if let Ok(CAN) = chan.read_byte(Duration::ZERO).await {
                    confirm_remote_cancel(chan).await?;
                }
                return Ok(());
            }

            let reply = chan.read_byte(self.config.timeout).await;
            if reply.is_ok() {
                watchdog.feed();
            }
            match reply {
                Ok(ACK) => return Ok(()),
                Ok(NAK) => {
                    retries += 1;
                    session.note_file_error();
                    warn!(seq, retries, "receiver NAKed block, resending");
                }
                Ok(CAN) => {
                    confirm_remote_cancel(chan).await?;
                }
                Ok(other) => {
                    debug!(byte = other, seq, "unexpected reply to block");
                }
                Err(WireError::Timeout) => {
                    watchdog.check("waiting for a block reply")?;
                    retries += 1;
                    session.note_file_error();
                }
                Err(e) => return Err(wire_err(e, "waiting for block reply")),
            }

            if retries > self.config.max_retries {
                send_cancel_sequence(chan).await;
                return Err(ProtocolError::Protocol(format!(
                    "block {seq} rejected {retries} times"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_block_checksum() {
        let packet = build_block(1, &[0xAA; 128], 128, Integrity::Checksum);
        assert_eq!(packet.len(), 1 + 2 + 128 + 1);
        assert_eq!(packet[0], SOH);
        assert_eq!(packet[1], 1);
        assert_eq!(packet[2], 0xFE);
        assert_eq!(*packet.last().unwrap(), sum8(&[0xAA; 128]));
    }

    #[test]
    fn test_build_block_pads_short_data() {
        let packet = build_block(3, b"hi", 128, Integrity::Crc16);
        assert_eq!(packet.len(), 1 + 2 + 128 + 2);
        assert_eq!(&packet[3..5], b"hi");
        assert!(packet[5..131].iter().all(|&b| b == CPMEOF));
    }

    #[test]
    fn test_build_block_1k_uses_stx() {
        let packet = build_block(7, &[0u8; 1024], 1024, Integrity::Crc16);
        assert_eq!(packet[0], STX);
        assert_eq!(packet.len(), 1 + 2 + 1024 + 2);
    }

    #[tokio::test]
    async fn test_read_block_body_round_trip() {
        let (mut a, mut b) = crate::core::wire::loopback_pair(4);
        let packet = build_block(5, b"payload", 128, Integrity::Crc16);
        a.write_all(&packet).await.unwrap();
        a.flush().await.unwrap();

        let header = b.read_byte(Duration::from_secs(1)).await.unwrap();
        assert_eq!(header, SOH);
        let block = read_block_body(&mut b, header, Integrity::Crc16, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.seq, 5);
        assert_eq!(&block.data[..7], b"payload");
        assert_eq!(block.data.len(), 128);
    }

    #[tokio::test]
    async fn test_read_block_body_detects_corruption() {
        let (mut a, mut b) = crate::core::wire::loopback_pair(4);
        let mut packet = build_block(5, b"payload", 128, Integrity::Crc16);
        packet[10] ^= 0x01;
        a.write_all(&packet).await.unwrap();
        a.flush().await.unwrap();

        let header = b.read_byte(Duration::from_secs(1)).await.unwrap();
        let result = read_block_body(&mut b, header, Integrity::Crc16, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.err(), Some(FrameError::BadCrc));
    }

    #[tokio::test]
    async fn test_read_block_body_rejects_bad_seq_pair() {
        let (mut a, mut b) = crate::core::wire::loopback_pair(4);
        let mut packet = build_block(5, b"x", 128, Integrity::Checksum);
        packet[2] = 0x00; // complement no longer matches
        a.write_all(&packet).await.unwrap();
        a.flush().await.unwrap();

        let header = b.read_byte(Duration::from_secs(1)).await.unwrap();
        let result = read_block_body(&mut b, header, Integrity::Checksum, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.err(), Some(FrameError::MalformedHeader));
    }
}
