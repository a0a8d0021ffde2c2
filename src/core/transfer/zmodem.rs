//! ZMODEM engines
//!
//! Header-driven streaming transfer with ZDLE armoring, windowed data
//! subpackets, rewind-based error recovery, and crash recovery from an
//! existing partial file. The receiver drives recovery: any time it is
//! unhappy it names the offset it wants with ZRPOS and the sender
//! restarts there.

use super::config::{TransferConfig, Watchdog};
use super::ymodem::BlockZero;
use crate::core::protocol::zdle::{SubpacketKind, Unescaped, ZdleDecoder, ZDLE};
use crate::core::protocol::zheader::{
    self, decode_bin16_body, decode_bin32_body, decode_hex_body, encode_bin16, encode_bin32,
    encode_hex, encode_subpacket, verify_subpacket_crc16, verify_subpacket_crc32, Header,
    HeaderKind, CANFC32, CANFDX, CANOVIO, ESCCTL, ZBIN, ZBIN32, ZCRESUM, ZHEX, ZPAD,
};
use crate::core::protocol::{FrameError, ProtocolError, ZmodemFlavor};
use crate::core::session::{FileInfo, SessionState, TransferSession};
use crate::core::storage::{FileStore, LocalFile};
use crate::core::wire::{WireChannel, WireError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const CAN: u8 = 0x18;
const BS: u8 = 0x08;
/// Session terminator sent by the sender after the ZFIN exchange.
const OO: [u8; 2] = [b'O', b'O'];
/// Ceiling on one subpacket's payload.
const MAX_SUBPACKET: usize = 1024;
/// Garbage bytes tolerated while hunting for a header; generous
/// because a rewind request races with in-flight streamed subpackets.
const GARBAGE_BUDGET: usize = 64 * 1024;

/// Transmit the ZMODEM attention/abort sequence: eight CANs, then
/// eight backspaces to scrub them from a command line.
pub(crate) async fn send_attention_cancel(chan: &mut dyn WireChannel) {
    let _ = chan.write_all(&[CAN; 8]).await;
    let _ = chan.write_all(&[BS; 8]).await;
    let _ = chan.flush().await;
}

fn wire_err(err: WireError, what: &str) -> ProtocolError {
    match err {
        WireError::Timeout => ProtocolError::Timeout(what.to_string()),
        WireError::Cancelled => ProtocolError::LocalCancel,
        WireError::Eof => ProtocolError::Io(format!("channel closed while {what}")),
        WireError::Io(e) => ProtocolError::Io(e),
    }
}

async fn bail_if_cancelled(
    session: &TransferSession,
    chan: &mut dyn WireChannel,
) -> Result<(), ProtocolError> {
    if session.cancel_requested() {
        send_attention_cancel(chan).await;
        return Err(ProtocolError::LocalCancel);
    }
    Ok(())
}

/// What a header-read attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderEvent {
    Header(Header),
    /// Line noise or a CRC failure; caller resynchronizes
    Garbled,
    /// Nothing parseable arrived in time
    Timeout,
}

/// Read one unescaped unit, mapping a CAN run to `RemoteCancel`.
async fn read_unescaped(
    chan: &mut dyn WireChannel,
    decoder: &mut ZdleDecoder,
    timeout: Duration,
) -> Result<Result<Unescaped, FrameError>, ProtocolError> {
    loop {
        let byte = match chan.read_byte(timeout).await {
            Ok(b) => b,
            Err(WireError::Timeout) => return Ok(Err(FrameError::UnexpectedEof)),
            Err(e) => return Err(wire_err(e, "reading escaped stream")),
        };
        match decoder.feed(byte) {
            Ok(Some(Unescaped::Cancel)) => return Err(ProtocolError::RemoteCancel),
            Ok(Some(unit)) => return Ok(Ok(unit)),
            Ok(None) => continue,
            Err(e) => return Ok(Err(e)),
        }
    }
}

/// Parse a header whose leading ZPAD was already consumed.
async fn read_header_body(
    chan: &mut dyn WireChannel,
    timeout: Duration,
) -> Result<HeaderEvent, ProtocolError> {
    // Optional extra pads, then ZDLE.
    let mut byte = match chan.read_byte(timeout).await {
        Ok(b) => b,
        Err(WireError::Timeout) => return Ok(HeaderEvent::Timeout),
        Err(e) => return Err(wire_err(e, "reading header prefix")),
    };
    while byte == ZPAD {
        byte = match chan.read_byte(timeout).await {
            Ok(b) => b,
            Err(WireError::Timeout) => return Ok(HeaderEvent::Timeout),
            Err(e) => return Err(wire_err(e, "reading header prefix")),
        };
    }
    if byte != ZDLE {
        return Ok(HeaderEvent::Garbled);
    }

    let format = match chan.read_byte(timeout).await {
        Ok(b) => b,
        Err(WireError::Timeout) => return Ok(HeaderEvent::Timeout),
        Err(e) => return Err(wire_err(e, "reading header format")),
    };

    match format {
        ZHEX => {
            let mut digits = [0u8; 14];
            match chan.read_exact(&mut digits, timeout).await {
                Ok(()) => {}
                Err(WireError::Timeout) => return Ok(HeaderEvent::Timeout),
                Err(e) => return Err(wire_err(e, "reading hex header")),
            }
            match decode_hex_body(&digits) {
                Ok(header) => Ok(HeaderEvent::Header(header)),
                Err(_) => Ok(HeaderEvent::Garbled),
            }
        }
        ZBIN => {
            let mut decoder = ZdleDecoder::new();
            let mut body = [0u8; 7];
            for slot in body.iter_mut() {
                match read_unescaped(chan, &mut decoder, timeout).await? {
                    Ok(Unescaped::Byte(b)) => *slot = b,
                    Ok(_) | Err(_) => return Ok(HeaderEvent::Garbled),
                }
            }
            match decode_bin16_body(&body) {
                Ok(header) => Ok(HeaderEvent::Header(header)),
                Err(_) => Ok(HeaderEvent::Garbled),
            }
        }
        ZBIN32 => {
            let mut decoder = ZdleDecoder::new();
            let mut body = [0u8; 9];
            for slot in body.iter_mut() {
                match read_unescaped(chan, &mut decoder, timeout).await? {
                    Ok(Unescaped::Byte(b)) => *slot = b,
                    Ok(_) | Err(_) => return Ok(HeaderEvent::Garbled),
                }
            }
            match decode_bin32_body(&body) {
                Ok(header) => Ok(HeaderEvent::Header(header)),
                Err(_) => Ok(HeaderEvent::Garbled),
            }
        }
        _ => Ok(HeaderEvent::Garbled),
    }
}

/// Hunt for and read one header.
async fn read_header(
    chan: &mut dyn WireChannel,
    timeout: Duration,
) -> Result<HeaderEvent, ProtocolError> {
    let mut can_run = 0u8;
    let mut garbage = 0usize;
    loop {
        let byte = match chan.read_byte(timeout).await {
            Ok(b) => b,
            Err(WireError::Timeout) => return Ok(HeaderEvent::Timeout),
            Err(e) => return Err(wire_err(e, "hunting for header")),
        };
        match byte {
            ZPAD => return read_header_body(chan, timeout).await,
            CAN => {
                can_run += 1;
                if can_run >= 5 {
                    return Err(ProtocolError::RemoteCancel);
                }
            }
            _ => {
                can_run = 0;
                garbage += 1;
                if garbage > GARBAGE_BUDGET {
                    return Ok(HeaderEvent::Garbled);
                }
            }
        }
    }
}

/// Poll for an interrupting header without blocking the data stream.
///
/// Returns `Ok(None)` when the line is silent. CAN runs surface as
/// `RemoteCancel`.
async fn try_read_interrupt(
    chan: &mut dyn WireChannel,
    timeout: Duration,
) -> Result<Option<Header>, ProtocolError> {
    let mut can_run = 0u8;
    loop {
        match chan.read_byte(Duration::ZERO).await {
            Ok(ZPAD) => {
                return match read_header_body(chan, timeout).await? {
                    HeaderEvent::Header(h) => Ok(Some(h)),
                    _ => Ok(None),
                };
            }
            Ok(CAN) => {
                can_run += 1;
                if can_run >= 5 {
                    return Err(ProtocolError::RemoteCancel);
                }
            }
            Ok(other) => {
                debug!(byte = other, "discarding byte while streaming");
                can_run = 0;
            }
            Err(WireError::Timeout) => return Ok(None),
            Err(e) => return Err(wire_err(e, "polling for interrupt")),
        }
    }
}

async fn send_hex_header(
    chan: &mut dyn WireChannel,
    header: &Header,
) -> Result<(), ProtocolError> {
    let wire = encode_hex(header);
    chan.write_all(&wire)
        .await
        .map_err(|e| wire_err(e, "writing header"))?;
    chan.flush().await.map_err(|e| wire_err(e, "flushing header"))
}

async fn send_bin_header(
    chan: &mut dyn WireChannel,
    header: &Header,
    crc32: bool,
    escape_ctl: bool,
) -> Result<(), ProtocolError> {
    let wire = if crc32 {
        encode_bin32(header, escape_ctl)
    } else {
        encode_bin16(header, escape_ctl)
    };
    chan.write_all(&wire)
        .await
        .map_err(|e| wire_err(e, "writing header"))?;
    chan.flush().await.map_err(|e| wire_err(e, "flushing header"))
}

/// Read one data subpacket. Inner errors are recoverable via ZRPOS.
async fn read_subpacket(
    chan: &mut dyn WireChannel,
    crc32: bool,
    timeout: Duration,
) -> Result<Result<(Vec<u8>, SubpacketKind), FrameError>, ProtocolError> {
    let mut decoder = ZdleDecoder::new();
    let mut payload = Vec::with_capacity(MAX_SUBPACKET);

    let kind = loop {
        match read_unescaped(chan, &mut decoder, timeout).await? {
            Ok(Unescaped::Byte(b)) => {
                if payload.len() >= MAX_SUBPACKET * 8 {
                    return Ok(Err(FrameError::MalformedHeader));
                }
                payload.push(b);
            }
            Ok(Unescaped::Terminator(kind)) => break kind,
            Ok(Unescaped::Cancel) => return Err(ProtocolError::RemoteCancel),
            Err(e) => return Ok(Err(e)),
        }
    };

    let crc_len = if crc32 { 4 } else { 2 };
    let mut crc_bytes = [0u8; 4];
    for slot in crc_bytes.iter_mut().take(crc_len) {
        match read_unescaped(chan, &mut decoder, timeout).await? {
            Ok(Unescaped::Byte(b)) => *slot = b,
            Ok(_) => return Ok(Err(FrameError::MalformedHeader)),
            Err(e) => return Ok(Err(e)),
        }
    }

    let ok = if crc32 {
        let got = u32::from_le_bytes(crc_bytes);
        verify_subpacket_crc32(&payload, kind, got)
    } else {
        let got = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
        verify_subpacket_crc16(&payload, kind, got)
    };
    if ok {
        Ok(Ok((payload, kind)))
    } else {
        Ok(Err(FrameError::BadCrc))
    }
}

fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".into())
}

/// ZMODEM receiver engine.
pub(crate) struct ZmodemReceiver {
    flavor: ZmodemFlavor,
    config: TransferConfig,
    directory: PathBuf,
}

enum FileOutcome {
    Received,
    Skipped,
}

impl ZmodemReceiver {
    pub(crate) fn new(flavor: ZmodemFlavor, config: TransferConfig, directory: PathBuf) -> Self {
        Self {
            flavor,
            config,
            directory,
        }
    }

    fn rinit_header(&self) -> Header {
        let mut caps = CANFDX | CANOVIO;
        if self.flavor == ZmodemFlavor::Crc32 {
            caps |= CANFC32;
        }
        if self.config.escape_ctl {
            caps |= ESCCTL;
        }
        Header::with_flags(HeaderKind::Rinit, caps, 0, 0, 0)
    }

    fn use_crc32(&self) -> bool {
        self.flavor == ZmodemFlavor::Crc32
    }

    pub(crate) async fn run(
        &mut self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        store: &dyn FileStore,
    ) -> Result<(), ProtocolError> {
        session.add_info(format!("{} receive started", session.protocol_name()));

        let mut watchdog = self.config.start_watchdog();
        let mut attempts = 0u32;
        loop {
            bail_if_cancelled(session, chan).await?;
            session.set_state(SessionState::FileInfoWait);
            send_hex_header(chan, &self.rinit_header()).await?;
            watchdog.feed();

            match read_header(chan, self.config.timeout).await? {
                HeaderEvent::Header(header) => {
                    watchdog.feed();
                    attempts = 0;
                    match header.kind {
                        HeaderKind::Rqinit => continue,
                        HeaderKind::Sinit => {
                            // Attention string follows; accept and ack.
                            match read_subpacket(chan, self.use_crc32(), self.config.timeout)
                                .await?
                            {
                                Ok((attn, _)) => {
                                    debug!(len = attn.len(), "ZSINIT attention string accepted");
                                    send_hex_header(chan, &Header::new(HeaderKind::Ack)).await?;
                                }
                                Err(_) => {
                                    send_hex_header(chan, &Header::new(HeaderKind::Nak)).await?;
                                }
                            }
                        }
                        HeaderKind::File => {
                            match read_subpacket(chan, self.use_crc32(), self.config.timeout)
                                .await?
                            {
                                Ok((payload, _)) => {
                                    match self
                                        .receive_file(
                                            session,
                                            chan,
                                            store,
                                            &header,
                                            &payload,
                                            &mut watchdog,
                                        )
                                        .await?
                                    {
                                        FileOutcome::Received => {
                                            session.finish_file();
                                            session.set_state(SessionState::FileDone);
                                        }
                                        FileOutcome::Skipped => {
                                            session.set_state(SessionState::FileDone);
                                        }
                                    }
                                }
                                Err(frame_err) => {
                                    warn!(%frame_err, "garbled ZFILE subpacket");
                                    session.note_file_error();
                                    send_hex_header(chan, &Header::new(HeaderKind::Nak)).await?;
                                }
                            }
                        }
                        HeaderKind::Fin => {
                            send_hex_header(chan, &Header::new(HeaderKind::Fin)).await?;
                            // The closing "OO" is best effort.
                            let mut oo = [0u8; 2];
                            let _ = chan.read_exact(&mut oo, Duration::from_millis(500)).await;
                            session.add_info("session finished");
                            session.set_state(SessionState::End);
                            return Ok(());
                        }
                        HeaderKind::Challenge => {
                            // Echo the challenge number back.
                            send_hex_header(
                                chan,
                                &Header::with_pos(HeaderKind::Ack, header.pos()),
                            )
                            .await?;
                        }
                        HeaderKind::Freecnt => {
                            send_hex_header(chan, &Header::with_pos(HeaderKind::Ack, u32::MAX))
                                .await?;
                        }
                        HeaderKind::Abort | HeaderKind::Can => {
                            return Err(ProtocolError::RemoteCancel);
                        }
                        other => {
                            debug!(?other, "unexpected header while idle");
                            send_hex_header(chan, &Header::new(HeaderKind::Nak)).await?;
                        }
                    }
                }
                HeaderEvent::Garbled => {
                    session.note_file_error();
                    chan.drain(self.config.drain_quiet)
                        .await
                        .map_err(|e| wire_err(e, "draining line noise"))?;
                }
                HeaderEvent::Timeout => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        return Err(ProtocolError::Timeout("sender init".into()));
                    }
                }
            }
        }
    }

    /// Handle one announced file through its ZEOF.
    #[allow(clippy::too_many_arguments)]
    async fn receive_file(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        store: &dyn FileStore,
        file_header: &Header,
        payload: &[u8],
        watchdog: &mut Watchdog,
    ) -> Result<FileOutcome, ProtocolError> {
        let Some(meta) = BlockZero::parse(payload) else {
            send_hex_header(chan, &Header::new(HeaderKind::Nak)).await?;
            return Err(ProtocolError::Protocol("empty ZFILE metadata".into()));
        };

        let local_name = sanitize_name(&meta.name);
        let target = self.directory.join(&local_name);
        session.begin_file(FileInfo::new(meta.name.clone(), target.clone()));
        session.set_current_file_meta(meta.size.map_or(-1, |s| s as i64), meta.mtime, meta.mode);
        if let Some(size) = meta.size {
            session.add_to_totals(size, size.div_ceil(MAX_SUBPACKET as u64).max(1));
        }

        // Skip requests are honored here, at the file boundary.
        if session.take_skip_request() {
            session.add_info(format!("skipping \"{local_name}\""));
            if !session.keep_partial() {
                store
                    .delete(&target)
                    .await
                    .map_err(|e| ProtocolError::File(e.to_string()))?;
            }
            send_hex_header(chan, &Header::new(HeaderKind::Skip)).await?;
            return Ok(FileOutcome::Skipped);
        }

        // Crash recovery: pick up where an earlier attempt stopped,
        // either because the sender asked (ZCRESUM) or because a
        // shorter partial file is already on disk.
        let existing = store.existing_size(&target).await.unwrap_or(0);
        let declared = meta.size.unwrap_or(u64::MAX);
        let resume = existing > 0
            && (file_header.zf0() == ZCRESUM || existing < declared);
        let mut offset: u64 = if resume { existing } else { 0 };

        if resume {
            session.add_info(format!(
                "resuming \"{local_name}\" at offset {offset} of {}",
                meta.size.map_or_else(|| "?".into(), |s| s.to_string())
            ));
        } else {
            session.add_info(format!(
                "receiving \"{local_name}\" ({} bytes)",
                meta.size.map_or_else(|| "?".into(), |s| s.to_string())
            ));
        }

        let (mut sink, _) = store
            .open_sink(&target, resume)
            .await
            .map_err(|e| ProtocolError::File(e.to_string()))?;

        session.set_state(SessionState::Transfer);
        if offset > 0 {
            session.note_progress(offset, 0);
        }
        send_hex_header(chan, &Header::with_pos(HeaderKind::Rpos, offset as u32)).await?;

        let mut errors = 0u32;
        loop {
            bail_if_cancelled(session, chan).await?;

            let event = read_header(chan, self.config.timeout).await?;
            if !matches!(event, HeaderEvent::Timeout) {
                watchdog.feed();
            }
            match event {
                HeaderEvent::Header(header) => match header.kind {
                    HeaderKind::Data => {
                        if u64::from(header.pos()) != offset {
                            debug!(
                                got = header.pos(),
                                want = offset,
                                "ZDATA at wrong offset, rewinding sender"
                            );
                            errors += 1;
                            if errors > self.config.max_retries {
                                return Err(ProtocolError::Protocol(
                                    "sender would not rewind".into(),
                                ));
                            }
                            send_hex_header(
                                chan,
                                &Header::with_pos(HeaderKind::Rpos, offset as u32),
                            )
                            .await?;
                            continue;
                        }
                        self.drink_subpackets(
                            session,
                            chan,
                            &mut sink,
                            &mut offset,
                            &mut errors,
                            watchdog,
                        )
                        .await?;
                    }
                    HeaderKind::Eof => {
                        if u64::from(header.pos()) == offset {
                            sink.flush()
                                .await
                                .map_err(|e| ProtocolError::File(e.to_string()))?;
                            session.add_info(format!("\"{local_name}\" received"));
                            return Ok(FileOutcome::Received);
                        }
                        debug!(
                            got = header.pos(),
                            want = offset,
                            "ZEOF at wrong offset, rewinding sender"
                        );
                        errors += 1;
                        if errors > self.config.max_retries {
                            return Err(ProtocolError::Protocol(
                                "ZEOF offset never matched".into(),
                            ));
                        }
                        send_hex_header(chan, &Header::with_pos(HeaderKind::Rpos, offset as u32))
                            .await?;
                    }
                    HeaderKind::File => {
                        // Our ZRPOS was lost; consume the repeated
                        // metadata subpacket and ask again.
                        let _ = read_subpacket(chan, self.use_crc32(), self.config.timeout).await?;
                        send_hex_header(chan, &Header::with_pos(HeaderKind::Rpos, offset as u32))
                            .await?;
                    }
                    HeaderKind::Abort | HeaderKind::Can => {
                        return Err(ProtocolError::RemoteCancel)
                    }
                    other => {
                        debug!(?other, "unexpected header during data phase");
                        errors += 1;
                        if errors > self.config.max_retries {
                            return Err(ProtocolError::Protocol(format!(
                                "unexpected {other:?} during data phase"
                            )));
                        }
                        send_hex_header(chan, &Header::with_pos(HeaderKind::Rpos, offset as u32))
                            .await?;
                    }
                },
                HeaderEvent::Garbled => {
                    session.note_file_error();
                    errors += 1;
                    if errors > self.config.max_retries {
                        return Err(ProtocolError::Protocol(
                            "data phase would not resynchronize".into(),
                        ));
                    }
                    chan.drain(self.config.drain_quiet)
                        .await
                        .map_err(|e| wire_err(e, "draining before rewind"))?;
                    send_hex_header(chan, &Header::with_pos(HeaderKind::Rpos, offset as u32))
                        .await?;
                }
                HeaderEvent::Timeout => {
                    watchdog.check("waiting for a data header")?;
                    errors += 1;
                    if errors > self.config.max_retries {
                        return Err(ProtocolError::Timeout("data header".into()));
                    }
                    send_hex_header(chan, &Header::with_pos(HeaderKind::Rpos, offset as u32))
                        .await?;
                }
            }
        }
    }

    /// Consume streamed subpackets after a matching ZDATA.
    #[allow(clippy::too_many_arguments)]
    async fn drink_subpackets(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        sink: &mut Box<dyn LocalFile>,
        offset: &mut u64,
        errors: &mut u32,
        watchdog: &mut Watchdog,
    ) -> Result<(), ProtocolError> {
        loop {
            bail_if_cancelled(session, chan).await?;
            match read_subpacket(chan, self.use_crc32(), self.config.timeout).await? {
                Ok((payload, kind)) => {
                    watchdog.feed();
                    if let Err(e) = sink.write_all(&payload).await {
                        // Tell the sender the disk failed before dying.
                        let _ = send_hex_header(
                            chan,
                            &Header::with_pos(HeaderKind::Ferr, *offset as u32),
                        )
                        .await;
                        return Err(ProtocolError::File(e.to_string()));
                    }
                    *offset += payload.len() as u64;
                    *errors = 0;
                    session.note_progress(payload.len() as u64, 1);

                    if kind.wants_ack() {
                        send_hex_header(chan, &Header::with_pos(HeaderKind::Ack, *offset as u32))
                            .await?;
                    }
                    if kind.ends_frame() {
                        return Ok(());
                    }
                }
                Err(frame_err) => {
                    warn!(%frame_err, offset = *offset, "bad subpacket, rewinding sender");
                    session.note_file_error();
                    *errors += 1;
                    if *errors > self.config.max_retries {
                        return Err(ProtocolError::Protocol(format!(
                            "subpacket stream failed repeatedly: {frame_err}"
                        )));
                    }
                    chan.drain(self.config.drain_quiet)
                        .await
                        .map_err(|e| wire_err(e, "draining before rewind"))?;
                    send_hex_header(chan, &Header::with_pos(HeaderKind::Rpos, *offset as u32))
                        .await?;
                    return Ok(());
                }
            }
        }
    }
}

/// ZMODEM sender engine.
pub(crate) struct ZmodemSender {
    flavor: ZmodemFlavor,
    config: TransferConfig,
    paths: Vec<PathBuf>,
}

impl ZmodemSender {
    pub(crate) fn new(flavor: ZmodemFlavor, config: TransferConfig, paths: Vec<PathBuf>) -> Self {
        Self {
            flavor,
            config,
            paths,
        }
    }

    pub(crate) async fn run(
        &mut self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        store: &dyn FileStore,
    ) -> Result<(), ProtocolError> {
        session.add_info(format!(
            "{} send started: {} file(s)",
            session.protocol_name(),
            self.paths.len()
        ));

        // Wake the receiver and learn its capabilities.
        let mut watchdog = self.config.start_watchdog();
        let rinit = self.exchange_rqinit(session, chan, &mut watchdog).await?;
        let crc32 = self.flavor == ZmodemFlavor::Crc32 && rinit.zf0() & CANFC32 != 0;
        let escape_ctl = self.config.escape_ctl || rinit.zf0() & ESCCTL != 0;
        session.add_info(if crc32 {
            "receiver ready, using 32-bit CRC"
        } else {
            "receiver ready, using 16-bit CRC"
        });

        let paths = self.paths.clone();
        for (index, path) in paths.iter().enumerate() {
            let (mut source, meta) = store
                .open_source(path)
                .await
                .map_err(|e| ProtocolError::File(e.to_string()))?;

            session.set_state(SessionState::FileInfoWait);
            session.begin_upload_file(index, meta.size as i64, meta.mtime, meta.mode);
            session.add_to_totals(meta.size, meta.size.div_ceil(MAX_SUBPACKET as u64).max(1));

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".into());

            match self
                .offer_file(session, chan, &name, &meta, crc32, escape_ctl, &mut watchdog)
                .await?
            {
                Some(offset) => {
                    session.add_info(format!(
                        "sending \"{name}\" from offset {offset} of {}",
                        meta.size
                    ));
                    session.set_state(SessionState::Transfer);
                    self.send_file_data(
                        session,
                        chan,
                        source.as_mut(),
                        meta.size,
                        offset,
                        crc32,
                        escape_ctl,
                        &mut watchdog,
                    )
                    .await?;
                    session.finish_file();
                    session.set_state(SessionState::FileDone);
                    session.add_info(format!("\"{name}\" sent"));
                }
                None => {
                    session.add_info(format!("receiver skipped \"{name}\""));
                    session.set_state(SessionState::FileDone);
                }
            }
        }

        // ZFIN handshake, then the OO trailer.
        let mut tries = 0u32;
        loop {
            bail_if_cancelled(session, chan).await?;
            send_hex_header(chan, &Header::new(HeaderKind::Fin)).await?;
            match read_header(chan, self.config.timeout).await? {
                HeaderEvent::Header(h) if h.kind == HeaderKind::Fin => {
                    watchdog.feed();
                    break;
                }
                HeaderEvent::Header(h) => {
                    watchdog.feed();
                    debug!(kind = ?h.kind, "unexpected reply to ZFIN");
                }
                HeaderEvent::Garbled | HeaderEvent::Timeout => {
                    watchdog.check("awaiting the ZFIN reply")?;
                    tries += 1;
                    if tries > self.config.max_retries {
                        return Err(ProtocolError::Timeout("ZFIN reply".into()));
                    }
                }
            }
        }
        // The "OO" trailer is a courtesy; a receiver that already hung
        // up does not turn a finished session into a failure.
        let _ = chan.write_all(&OO).await;
        let _ = chan.flush().await;

        session.add_info("session finished");
        session.set_state(SessionState::End);
        Ok(())
    }

    /// Send ZRQINIT until the receiver answers with ZRINIT.
    async fn exchange_rqinit(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        watchdog: &mut Watchdog,
    ) -> Result<Header, ProtocolError> {
        let mut tries = 0u32;
        loop {
            bail_if_cancelled(session, chan).await?;
            send_hex_header(chan, &Header::new(HeaderKind::Rqinit)).await?;
            watchdog.feed();
            match read_header(chan, self.config.timeout).await? {
                HeaderEvent::Header(h) if h.kind == HeaderKind::Rinit => return Ok(h),
                HeaderEvent::Header(h) if h.kind == HeaderKind::Abort => {
                    return Err(ProtocolError::RemoteCancel)
                }
                HeaderEvent::Header(h) => debug!(kind = ?h.kind, "unexpected reply to ZRQINIT"),
                HeaderEvent::Garbled | HeaderEvent::Timeout => {
                    tries += 1;
                    if tries > self.config.max_retries {
                        return Err(ProtocolError::Timeout("ZRINIT".into()));
                    }
                }
            }
        }
    }

    /// Offer one file with ZFILE. Returns the starting offset, or
    /// `None` when the receiver skips it.
    #[allow(clippy::too_many_arguments)]
    async fn offer_file(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        name: &str,
        meta: &crate::core::storage::FileMeta,
        crc32: bool,
        escape_ctl: bool,
        watchdog: &mut Watchdog,
    ) -> Result<Option<u64>, ProtocolError> {
        let block_zero = BlockZero {
            name: name.to_string(),
            size: Some(meta.size),
            mtime: meta.mtime,
            mode: meta.mode,
            serial: None,
        };
        let payload = block_zero.encode();
        let header = Header::with_flags(HeaderKind::File, zheader::ZCBIN, 0, 0, 0);

        let mut tries = 0u32;
        loop {
            bail_if_cancelled(session, chan).await?;
            send_bin_header(chan, &header, crc32, escape_ctl).await?;
            let subpacket = encode_subpacket(&payload, SubpacketKind::EndAck, crc32, escape_ctl);
            chan.write_all(&subpacket)
                .await
                .map_err(|e| wire_err(e, "writing ZFILE metadata"))?;
            chan.flush()
                .await
                .map_err(|e| wire_err(e, "flushing ZFILE metadata"))?;

            let event = read_header(chan, self.config.timeout).await?;
            if let HeaderEvent::Header(_) = event {
                watchdog.feed();
            }
            match event {
                HeaderEvent::Header(h) => match h.kind {
                    HeaderKind::Rpos => return Ok(Some(u64::from(h.pos()))),
                    HeaderKind::Skip => return Ok(None),
                    HeaderKind::Rinit | HeaderKind::Nak => {
                        tries += 1;
                        session.note_file_error();
                        if tries > self.config.max_retries {
                            return Err(ProtocolError::Protocol(
                                "ZFILE never acknowledged".into(),
                            ));
                        }
                    }
                    HeaderKind::Abort | HeaderKind::Can => {
                        return Err(ProtocolError::RemoteCancel)
                    }
                    HeaderKind::Ferr => {
                        return Err(ProtocolError::Protocol(
                            "receiver reported a fatal file error".into(),
                        ))
                    }
                    other => debug!(?other, "unexpected reply to ZFILE"),
                },
                HeaderEvent::Garbled | HeaderEvent::Timeout => {
                    watchdog.check("awaiting the ZFILE reply")?;
                    tries += 1;
                    if tries > self.config.max_retries {
                        return Err(ProtocolError::Timeout("ZFILE reply".into()));
                    }
                }
            }
        }
    }

    /// Stream the file from `offset`, honoring rewind requests, then
    /// complete the ZEOF exchange.
    #[allow(clippy::too_many_arguments)]
    async fn send_file_data(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        source: &mut dyn LocalFile,
        size: u64,
        start_offset: u64,
        crc32: bool,
        escape_ctl: bool,
        watchdog: &mut Watchdog,
    ) -> Result<(), ProtocolError> {
        let mut offset = start_offset.min(size);
        if offset > 0 {
            session.note_progress(offset, 0);
        }

        'rewind: loop {
            source
                .seek(offset)
                .await
                .map_err(|e| ProtocolError::File(e.to_string()))?;

            if offset < size {
                send_bin_header(
                    chan,
                    &Header::with_pos(HeaderKind::Data, offset as u32),
                    crc32,
                    escape_ctl,
                )
                .await?;

                let mut since_ack = 0u32;
                let mut buf = vec![0u8; MAX_SUBPACKET];
                loop {
                    bail_if_cancelled(session, chan).await?;

                    let mut filled = 0;
                    while filled < buf.len() {
                        let n = source
                            .read(&mut buf[filled..])
                            .await
                            .map_err(|e| ProtocolError::File(e.to_string()))?;
                        if n == 0 {
                            break;
                        }
                        filled += n;
                    }

                    let last = offset + filled as u64 >= size || filled < buf.len();
                    since_ack += 1;
                    let kind = if last {
                        SubpacketKind::End
                    } else if since_ack >= self.config.ack_window {
                        since_ack = 0;
                        SubpacketKind::ContinueAck
                    } else {
                        SubpacketKind::Continue
                    };

                    let subpacket = encode_subpacket(&buf[..filled], kind, crc32, escape_ctl);
                    chan.write_all(&subpacket)
                        .await
                        .map_err(|e| wire_err(e, "writing subpacket"))?;
                    chan.flush()
                        .await
                        .map_err(|e| wire_err(e, "flushing subpacket"))?;
                    watchdog.feed();
                    offset += filled as u64;
                    session.note_progress(filled as u64, 1);

                    if kind == SubpacketKind::ContinueAck {
                        // Flow-control point: wait for the window ack.
                        match self.await_window_ack(session, chan, watchdog).await? {
                            Some(rewind_to) => {
                                session.note_file_error();
                                offset = u64::from(rewind_to).min(size);
                                continue 'rewind;
                            }
                            None => {}
                        }
                    } else if let Some(header) =
                        try_read_interrupt(chan, self.config.timeout).await?
                    {
                        if header.kind == HeaderKind::Rpos {
                            session.note_file_error();
                            debug!(to = header.pos(), "receiver rewound the stream");
                            offset = u64::from(header.pos()).min(size);
                            continue 'rewind;
                        }
                    }

                    if last {
                        break;
                    }
                }
            }

            // End of file: exchange ZEOF for the next ZRINIT.
            let mut tries = 0u32;
            loop {
                bail_if_cancelled(session, chan).await?;
                send_bin_header(
                    chan,
                    &Header::with_pos(HeaderKind::Eof, offset as u32),
                    crc32,
                    escape_ctl,
                )
                .await?;
                let event = read_header(chan, self.config.timeout).await?;
                if let HeaderEvent::Header(_) = event {
                    watchdog.feed();
                }
                match event {
                    HeaderEvent::Header(h) => match h.kind {
                        HeaderKind::Rinit => return Ok(()),
                        HeaderKind::Rpos => {
                            session.note_file_error();
                            offset = u64::from(h.pos()).min(size);
                            continue 'rewind;
                        }
                        HeaderKind::Skip => return Ok(()),
                        HeaderKind::Abort | HeaderKind::Can => {
                            return Err(ProtocolError::RemoteCancel)
                        }
                        other => debug!(?other, "unexpected reply to ZEOF"),
                    },
                    HeaderEvent::Garbled | HeaderEvent::Timeout => {
                        watchdog.check("awaiting the ZEOF reply")?;
                        tries += 1;
                        if tries > self.config.max_retries {
                            return Err(ProtocolError::Timeout("ZEOF reply".into()));
                        }
                    }
                }
            }
        }
    }

    /// Wait for the ZACK that answers a ZCRCQ. A ZRPOS here means the
    /// receiver wants a rewind; the offset is returned.
    async fn await_window_ack(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        watchdog: &mut Watchdog,
    ) -> Result<Option<u32>, ProtocolError> {
        let mut tries = 0u32;
        loop {
            bail_if_cancelled(session, chan).await?;
            let event = read_header(chan, self.config.timeout).await?;
            if let HeaderEvent::Header(_) = event {
                watchdog.feed();
            }
            match event {
                HeaderEvent::Header(h) => match h.kind {
                    HeaderKind::Ack => return Ok(None),
                    HeaderKind::Rpos => return Ok(Some(h.pos())),
                    HeaderKind::Abort | HeaderKind::Can => {
                        return Err(ProtocolError::RemoteCancel)
                    }
                    other => debug!(?other, "unexpected header at window ack"),
                },
                HeaderEvent::Garbled | HeaderEvent::Timeout => {
                    watchdog.check("awaiting the window acknowledgment")?;
                    tries += 1;
                    if tries > self.config.max_retries {
                        return Err(ProtocolError::Timeout("window acknowledgment".into()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wire::loopback_pair;

    #[tokio::test]
    async fn test_header_round_trip_hex() {
        let (mut a, mut b) = loopback_pair(4);
        send_hex_header(&mut a, &Header::with_pos(HeaderKind::Rpos, 4096))
            .await
            .unwrap();
        match read_header(&mut b, Duration::from_secs(1)).await.unwrap() {
            HeaderEvent::Header(h) => {
                assert_eq!(h.kind, HeaderKind::Rpos);
                assert_eq!(h.pos(), 4096);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_header_round_trip_bin32() {
        let (mut a, mut b) = loopback_pair(4);
        send_bin_header(&mut a, &Header::with_pos(HeaderKind::Data, 123_456), true, false)
            .await
            .unwrap();
        match read_header(&mut b, Duration::from_secs(1)).await.unwrap() {
            HeaderEvent::Header(h) => {
                assert_eq!(h.kind, HeaderKind::Data);
                assert_eq!(h.pos(), 123_456);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_header_survives_leading_noise() {
        let (mut a, mut b) = loopback_pair(4);
        a.write_all(b"rz waiting to receive.\r\n").await.unwrap();
        a.flush().await.unwrap();
        send_hex_header(&mut a, &Header::new(HeaderKind::Rinit))
            .await
            .unwrap();
        match read_header(&mut b, Duration::from_secs(1)).await.unwrap() {
            HeaderEvent::Header(h) => assert_eq!(h.kind, HeaderKind::Rinit),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subpacket_round_trip() {
        let (mut a, mut b) = loopback_pair(4);
        let payload: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        let wire = encode_subpacket(&payload, SubpacketKind::ContinueAck, true, false);
        a.write_all(&wire).await.unwrap();
        a.flush().await.unwrap();

        let (got, kind) = read_subpacket(&mut b, true, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, payload);
        assert_eq!(kind, SubpacketKind::ContinueAck);
    }

    #[tokio::test]
    async fn test_subpacket_crc_error_detected() {
        let (mut a, mut b) = loopback_pair(4);
        let mut wire = encode_subpacket(b"data bytes", SubpacketKind::End, false, false);
        wire[2] ^= 0x01;
        a.write_all(&wire).await.unwrap();
        a.flush().await.unwrap();

        let result = read_subpacket(&mut b, false, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_can_run_is_remote_cancel() {
        let (mut a, mut b) = loopback_pair(4);
        a.write_all(&[CAN; 8]).await.unwrap();
        a.write_all(&[BS; 8]).await.unwrap();
        a.flush().await.unwrap();

        let err = read_header(&mut b, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::RemoteCancel));
    }
}
