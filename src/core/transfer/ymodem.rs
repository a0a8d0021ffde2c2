//! YMODEM engines
//!
//! YMODEM layers batch semantics over the XMODEM block machinery:
//! every file opens with a metadata block 0 (filename, size, mtime,
//! mode, serial), data restarts at sequence 1, and an all-zero block 0
//! closes the batch. The G flavor streams without per-block ACKs and
//! aborts on the first CRC mismatch.

use super::config::{TransferConfig, Watchdog};
use super::xmodem::{
    build_block, check_local_cancel, confirm_remote_cancel, read_block_body, send_cancel_sequence,
    send_control, wire_err, Integrity, ACK, CAN, CRC_CHAR, EOT, G_CHAR, NAK, SOH, STX,
};
use crate::core::protocol::{ProtocolError, YmodemFlavor};
use crate::core::session::{FileInfo, SessionState, TransferSession};
use crate::core::storage::{FileStore, LocalFile};
use crate::core::wire::{WireChannel, WireError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Metadata parsed from a YMODEM block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockZero {
    pub name: String,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
    pub mode: Option<u32>,
    pub serial: Option<u32>,
}

impl BlockZero {
    /// Encode block-0 payload: NUL-terminated name, then decimal size,
    /// octal mtime, octal mode, decimal serial, space-separated.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.name.len() + 32);
        payload.extend_from_slice(self.name.as_bytes());
        payload.push(0);
        let mut tail = format!("{}", self.size.unwrap_or(0));
        if let Some(mtime) = self.mtime {
            tail.push_str(&format!(" {:o}", mtime.max(0)));
            if let Some(mode) = self.mode {
                tail.push_str(&format!(" {mode:o}"));
                if let Some(serial) = self.serial {
                    tail.push_str(&format!(" {serial}"));
                }
            }
        }
        payload.extend_from_slice(tail.as_bytes());
        payload
    }

    /// Parse a block-0 payload. Returns `None` for the all-zero batch
    /// terminator.
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        let nul = data.iter().position(|&b| b == 0)?;
        if nul == 0 {
            return None;
        }
        let name = String::from_utf8_lossy(&data[..nul]).into_owned();

        let rest = &data[nul + 1..];
        let rest_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let fields = String::from_utf8_lossy(&rest[..rest_end]).into_owned();
        let mut parts = fields.split_whitespace();

        let size = parts.next().and_then(|s| s.parse::<u64>().ok());
        let mtime = parts.next().and_then(|s| i64::from_str_radix(s, 8).ok());
        let mode = parts.next().and_then(|s| u32::from_str_radix(s, 8).ok());
        let serial = parts.next().and_then(|s| s.parse::<u32>().ok());

        Some(Self {
            name,
            size,
            mtime,
            mode,
            serial,
        })
    }
}

/// Keep only the final path component so a hostile sender cannot climb
/// out of the download directory.
fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".into())
}

/// YMODEM receiver engine.
pub(crate) struct YmodemReceiver {
    flavor: YmodemFlavor,
    config: TransferConfig,
    directory: PathBuf,
}

impl YmodemReceiver {
    pub(crate) fn new(flavor: YmodemFlavor, config: TransferConfig, directory: PathBuf) -> Self {
        Self {
            flavor,
            config,
            directory,
        }
    }

    fn handshake_char(&self) -> u8 {
        match self.flavor {
            YmodemFlavor::Vanilla => CRC_CHAR,
            YmodemFlavor::G => G_CHAR,
        }
    }

    fn streaming(&self) -> bool {
        self.flavor == YmodemFlavor::G
    }

    pub(crate) async fn run(
        &mut self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        store: &dyn FileStore,
    ) -> Result<(), ProtocolError> {
        session.add_info(format!("{} batch receive started", session.protocol_name()));
        let mut watchdog = self.config.start_watchdog();

        loop {
            session.set_state(SessionState::FileInfoWait);
            match self.receive_block_zero(session, chan, &mut watchdog).await? {
                Some(meta) => {
                    let local_name = sanitize_name(&meta.name);
                    let target = self.directory.join(&local_name);
                    session.begin_file(FileInfo::new(meta.name.clone(), target.clone()));
                    session.set_current_file_meta(
                        meta.size.map_or(-1, |s| s as i64),
                        meta.mtime,
                        meta.mode,
                    );
                    if let Some(size) = meta.size {
                        session.add_to_totals(size, size.div_ceil(1024).max(1));
                    }
                    session.add_info(format!(
                        "receiving \"{}\" ({} bytes)",
                        local_name,
                        meta.size.map_or_else(|| "?".into(), |s| s.to_string())
                    ));

                    self.receive_file_data(session, chan, store, &target, meta.size, &mut watchdog)
                        .await?;

                    session.finish_file();
                    session.set_state(SessionState::FileDone);
                    session.add_info(format!("\"{local_name}\" received"));
                }
                None => {
                    // All-zero block 0: the batch is over.
                    send_control(chan, ACK).await?;
                    session.add_info("batch complete");
                    session.set_state(SessionState::End);
                    return Ok(());
                }
            }
        }
    }

    /// Solicit and read one block 0. `Ok(None)` is the batch
    /// terminator.
    async fn receive_block_zero(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        watchdog: &mut Watchdog,
    ) -> Result<Option<BlockZero>, ProtocolError> {
        let mut tries = 0u32;
        let mut errors = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            send_control(chan, self.handshake_char()).await?;
            watchdog.feed();

            let first = match chan.read_byte(self.config.handshake_interval).await {
                Ok(b) => b,
                Err(WireError::Timeout) => {
                    tries += 1;
                    if tries >= self.config.handshake_retries * 2 {
                        return Err(ProtocolError::Timeout("block 0".into()));
                    }
                    continue;
                }
                Err(e) => return Err(wire_err(e, "waiting for block 0")),
            };

            match first {
                SOH | STX => {
                    match read_block_body(chan, first, Integrity::Crc16, self.config.timeout)
                        .await?
                    {
                        Ok(block) if block.seq == 0 => {
                            watchdog.feed();
                            let meta = BlockZero::parse(&block.data);
                            if meta.is_some() && !self.streaming() {
                                send_control(chan, ACK).await?;
                            }
                            return Ok(meta);
                        }
                        Ok(block) => {
                            warn!(seq = block.seq, "expected block 0, got data block");
                            send_control(chan, NAK).await?;
                        }
                        Err(frame_err) => {
                            session.note_file_error();
                            errors += 1;
                            if self.streaming() {
                                send_cancel_sequence(chan).await;
                                return Err(ProtocolError::Integrity(format!(
                                    "{frame_err} on block 0 in streaming mode"
                                )));
                            }
                            if errors > self.config.max_retries {
                                send_cancel_sequence(chan).await;
                                return Err(ProtocolError::Protocol(format!(
                                    "block 0 failed repeatedly: {frame_err}"
                                )));
                            }
                            chan.drain(self.config.drain_quiet)
                                .await
                                .map_err(|e| wire_err(e, "draining before resync"))?;
                            send_control(chan, NAK).await?;
                        }
                    }
                }
                CAN => confirm_remote_cancel(chan).await?,
                other => debug!(byte = other, "ignoring noise while soliciting block 0"),
            }
        }
    }

    /// Receive the data blocks of one file through the EOT dance.
    async fn receive_file_data(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        store: &dyn FileStore,
        target: &Path,
        declared_size: Option<u64>,
        watchdog: &mut Watchdog,
    ) -> Result<(), ProtocolError> {
        let (mut sink, _) = store
            .open_sink(target, false)
            .await
            .map_err(|e| ProtocolError::File(e.to_string()))?;

        session.set_state(SessionState::Transfer);
        // Kick the sender into the data phase.
        send_control(chan, self.handshake_char()).await?;

        let mut expected: u8 = 1;
        let mut errors = 0u32;
        let mut written: u64 = 0;

        loop {
            check_local_cancel(session, chan).await?;

            let first = match chan.read_byte(self.config.timeout).await {
                Ok(b) => {
                    watchdog.feed();
                    b
                }
                Err(WireError::Timeout) => {
                    watchdog.check("waiting for a data block")?;
                    errors += 1;
                    session.note_file_error();
                    if self.streaming() || errors > self.config.max_retries {
                        send_cancel_sequence(chan).await;
                        return Err(ProtocolError::Protocol(
                            "too many timeouts waiting for a data block".into(),
                        ));
                    }
                    send_control(chan, NAK).await?;
                    continue;
                }
                Err(e) => return Err(wire_err(e, "waiting for data block")),
            };

            match first {
                SOH | STX => {
                    let block_size = if first == STX { 1024 } else { 128 };
                    session.set_block_size(block_size);
                    match read_block_body(chan, first, Integrity::Crc16, self.config.timeout)
                        .await?
                    {
                        Ok(block) if block.seq == expected => {
                            sink.write_all(&block.data)
                                .await
                                .map_err(|e| ProtocolError::File(e.to_string()))?;
                            expected = expected.wrapping_add(1);
                            errors = 0;

                            // Progress never exceeds the declared size;
                            // the padding is trimmed after EOT.
                            let useful = match declared_size {
                                Some(size) => (size - written.min(size)).min(block.data.len() as u64),
                                None => block.data.len() as u64,
                            };
                            written += block.data.len() as u64;
                            session.note_progress(useful, 1);

                            if !self.streaming() {
                                send_control(chan, ACK).await?;
                            }
                        }
                        Ok(block) if block.seq == expected.wrapping_sub(1) => {
                            debug!(seq = block.seq, "duplicate data block acknowledged");
                            if !self.streaming() {
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
                            if self.streaming() {
                                // G mode has no retransmit path.
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
                            chan.drain(self.config.drain_quiet)
                                .await
                                .map_err(|e| wire_err(e, "draining before resync"))?;
                            send_control(chan, NAK).await?;
                        }
                    }
                }
                EOT => {
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

                    // Trim the CPMEOF padding to the declared length.
                    if let Some(size) = declared_size {
                        sink.truncate(size)
                            .await
                            .map_err(|e| ProtocolError::File(e.to_string()))?;
                    }
                    sink.flush()
                        .await
                        .map_err(|e| ProtocolError::File(e.to_string()))?;
                    return Ok(());
                }
                CAN => confirm_remote_cancel(chan).await?,
                other => debug!(byte = other, "ignoring noise between data blocks"),
            }
        }
    }
}

/// YMODEM sender engine.
pub(crate) struct YmodemSender {
    flavor: YmodemFlavor,
    config: TransferConfig,
    paths: Vec<PathBuf>,
}

impl YmodemSender {
    pub(crate) fn new(flavor: YmodemFlavor, config: TransferConfig, paths: Vec<PathBuf>) -> Self {
        Self {
            flavor,
            config,
            paths,
        }
    }

    fn streaming(&self) -> bool {
        self.flavor == YmodemFlavor::G
    }

    pub(crate) async fn run(
        &mut self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        store: &dyn FileStore,
    ) -> Result<(), ProtocolError> {
        session.add_info(format!(
            "{} batch send started: {} file(s)",
            session.protocol_name(),
            self.paths.len()
        ));
        let mut watchdog = self.config.start_watchdog();

        let paths = self.paths.clone();
        for (index, path) in paths.iter().enumerate() {
            let (mut source, meta) = store
                .open_source(path)
                .await
                .map_err(|e| ProtocolError::File(e.to_string()))?;

            session.set_state(SessionState::FileInfoWait);
            session.begin_upload_file(index, meta.size as i64, meta.mtime, meta.mode);
            session.add_to_totals(meta.size, meta.size.div_ceil(1024).max(1));

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".into());
            let block_zero = BlockZero {
                name: name.clone(),
                size: Some(meta.size),
                mtime: meta.mtime,
                mode: meta.mode,
                serial: None,
            };
            session.add_info(format!("offering \"{name}\" ({} bytes)", meta.size));

            self.send_block_zero(session, chan, &block_zero, &mut watchdog)
                .await?;
            session.set_state(SessionState::Transfer);
            self.send_file_data(session, chan, source.as_mut(), &mut watchdog)
                .await?;

            session.finish_file();
            session.set_state(SessionState::FileDone);
            session.add_info(format!("\"{name}\" sent"));
        }

        // Close the batch with an all-zero block 0.
        self.await_handshake(session, chan, &mut watchdog).await?;
        let packet = build_block(0, &[], 128, Integrity::Crc16);
        chan.write_all(&packet)
            .await
            .map_err(|e| wire_err(e, "writing batch terminator"))?;
        chan.flush()
            .await
            .map_err(|e| wire_err(e, "flushing batch terminator"))?;
        self.await_ack(session, chan, "batch terminator", &mut watchdog)
            .await?;

        session.add_info("batch complete");
        session.set_state(SessionState::End);
        Ok(())
    }

    /// Wait for the receiver's C/G solicitation.
    async fn await_handshake(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        watchdog: &mut Watchdog,
    ) -> Result<(), ProtocolError> {
        let wanted = if self.streaming() { G_CHAR } else { CRC_CHAR };
        let mut tries = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            let answer = chan.read_byte(self.config.watchdog()).await;
            if answer.is_ok() {
                watchdog.feed();
            }
            match answer {
                Ok(b) if b == wanted => return Ok(()),
                Ok(CAN) => confirm_remote_cancel(chan).await?,
                Ok(other) => debug!(byte = other, "ignoring noise awaiting solicitation"),
                Err(WireError::Timeout) => {
                    tries += 1;
                    if tries >= self.config.handshake_retries {
                        return Err(ProtocolError::Timeout("receiver solicitation".into()));
                    }
                }
                Err(e) => return Err(wire_err(e, "awaiting solicitation")),
            }
        }
    }

    async fn await_ack(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        what: &str,
        watchdog: &mut Watchdog,
    ) -> Result<(), ProtocolError> {
        let mut tries = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            let reply = chan.read_byte(self.config.timeout).await;
            if reply.is_ok() {
                watchdog.feed();
            }
            match reply {
                Ok(ACK) => return Ok(()),
                Ok(CAN) => confirm_remote_cancel(chan).await?,
                Ok(other) => debug!(byte = other, "ignoring noise awaiting ACK for {what}"),
                Err(WireError::Timeout) => {
                    watchdog.check("awaiting an acknowledgment")?;
                    tries += 1;
                    if tries > self.config.max_retries {
                        return Err(ProtocolError::Timeout(format!("ACK for {what}")));
                    }
                }
                Err(e) => return Err(wire_err(e, "awaiting ACK")),
            }
        }
    }

    /// Send block 0 and complete its acknowledgment exchange.
    async fn send_block_zero(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        block_zero: &BlockZero,
        watchdog: &mut Watchdog,
    ) -> Result<(), ProtocolError> {
        self.await_handshake(session, chan, watchdog).await?;

        let payload = block_zero.encode();
        let block_size = if payload.len() <= 128 { 128 } else { 1024 };
        let packet = build_block(0, &payload, block_size, Integrity::Crc16);

        let mut retries = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            chan.write_all(&packet)
                .await
                .map_err(|e| wire_err(e, "writing block 0"))?;
            chan.flush()
                .await
                .map_err(|e| wire_err(e, "flushing block 0"))?;

            if self.streaming() {
                // G mode: the receiver answers with another G to start
                // the data phase, no ACK.
                return self.await_handshake(session, chan, watchdog).await;
            }

            let reply = chan.read_byte(self.config.timeout).await;
            if reply.is_ok() {
                watchdog.feed();
            }
            match reply {
                Ok(ACK) => {
                    // ACK is followed by C to open the data phase.
                    return self.await_handshake(session, chan, watchdog).await;
                }
                Ok(NAK) => {
                    retries += 1;
                    session.note_file_error();
                }
                Ok(CAN) => confirm_remote_cancel(chan).await?,
                Ok(other) => debug!(byte = other, "unexpected reply to block 0"),
                Err(WireError::Timeout) => {
                    watchdog.check("awaiting the block 0 reply")?;
                    retries += 1;
                    session.note_file_error();
                }
                Err(e) => return Err(wire_err(e, "awaiting block 0 reply")),
            }
            if retries > self.config.max_retries {
                send_cancel_sequence(chan).await;
                return Err(ProtocolError::Protocol("block 0 rejected repeatedly".into()));
            }
        }
    }

    /// Stream data blocks and run the EOT dance.
    async fn send_file_data(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        source: &mut dyn LocalFile,
        watchdog: &mut Watchdog,
    ) -> Result<(), ProtocolError> {
        let block_size = 1024;
        session.set_block_size(block_size);
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

            // Short tails fit better in a 128-byte block.
            let this_block_size = if filled <= 128 { 128 } else { block_size };
            let packet = build_block(seq, &buf[..filled], this_block_size, Integrity::Crc16);
            self.send_data_block(session, chan, &packet, seq, watchdog)
                .await?;
            seq = seq.wrapping_add(1);
            session.note_progress(filled as u64, 1);

            if filled < block_size {
                break;
            }
        }

        // EOT dance: NAK first, ACK second.
        let mut tries = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            send_control(chan, EOT).await?;
            let reply = chan.read_byte(self.config.timeout).await;
            if reply.is_ok() {
                watchdog.feed();
            }
            match reply {
                Ok(ACK) => return Ok(()),
                Ok(NAK) => continue,
                Ok(CAN) => confirm_remote_cancel(chan).await?,
                Ok(other) => debug!(byte = other, "unexpected reply to EOT"),
                Err(WireError::Timeout) => {
                    watchdog.check("awaiting the EOT acknowledgment")?;
                    tries += 1;
                    if tries > self.config.max_retries {
                        return Err(ProtocolError::Timeout("EOT acknowledgment".into()));
                    }
                }
                Err(e) => return Err(wire_err(e, "awaiting EOT reply")),
            }
        }
    }

    async fn send_data_block(
        &self,
        session: &TransferSession,
        chan: &mut dyn WireChannel,
        packet: &[u8],
        seq: u8,
        watchdog: &mut Watchdog,
    ) -> Result<(), ProtocolError> {
        let mut retries = 0u32;
        loop {
            check_local_cancel(session, chan).await?;
            chan.write_all(packet)
                .await
                .map_err(|e| wire_err(e, "writing data block"))?;
            chan.flush()
                .await
                .map_err(|e| wire_err(e, "flushing data block"))?;

            if self.streaming() {
                watchdog.feed();
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
                    warn!(seq, retries, "receiver NAKed data block, resending");
                }
                Ok(CAN) => confirm_remote_cancel(chan).await?,
                Ok(other) => debug!(byte = other, seq, "unexpected reply to data block"),
                Err(WireError::Timeout) => {
                    watchdog.check("awaiting the data block reply")?;
                    retries += 1;
                    session.note_file_error();
                }
                Err(e) => return Err(wire_err(e, "awaiting data block reply")),
            }
            if retries > self.config.max_retries {
                send_cancel_sequence(chan).await;
                return Err(ProtocolError::Protocol(format!(
                    "data block {seq} rejected {retries} times"
                )));
            }
        }
    }
}
