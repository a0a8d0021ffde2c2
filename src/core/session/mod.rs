//! Transfer session model
//!
//! A [`TransferSession`] encapsulates all the state of one upload or
//! download: the file list, progress counters, the message log, and the
//! cancel/skip control flags. The protocol engine owns all mutation;
//! any number of observers take snapshot reads or request
//! cancellation, so every getter returns a self-consistent view taken
//! under the session's monitor.

use crate::core::protocol::{Direction, Protocol, ProtocolError, ProtocolFlavor};
use crate::core::wire::CancelToken;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, nothing on the wire yet
    Init,
    /// Waiting for file metadata from the remote side
    FileInfoWait,
    /// Moving file data
    Transfer,
    /// A file completed; the batch may continue
    FileDone,
    /// Terminal: the session failed or was cancelled
    Abort,
    /// Terminal: all files transferred
    End,
}

impl SessionState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Abort | Self::End)
    }
}

/// Message severity in the session log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Progress and negotiation notes
    Info,
    /// Failures; the last one explains an abort
    Error,
}

/// One entry in the append-only session log.
#[derive(Debug, Clone)]
pub struct TransferMessage {
    /// Severity
    pub kind: MessageKind,
    /// Human-readable text
    pub text: String,
    /// Wall-clock time the entry was appended
    pub at: DateTime<Utc>,
}

impl TransferMessage {
    fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            at: Utc::now(),
        }
    }

    /// Whether this is an error entry.
    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }
}

/// Per-file transfer state.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Name as exchanged on the wire
    pub remote_name: String,
    /// Where the file lives locally
    pub local_path: PathBuf,
    /// Size in bytes, `-1` when the protocol cannot know it
    pub size: i64,
    /// Modification time, seconds since the Unix epoch
    pub mtime: Option<i64>,
    /// Unix permission bits
    pub mode: Option<u32>,
    /// Bytes moved for this file in this session
    pub bytes_transferred: u64,
    /// Blocks/subpackets moved for this file
    pub blocks_transferred: u64,
    /// Block size in effect
    pub block_size: usize,
    /// Errors (retries, NAKs, rewinds) charged to this file
    pub errors: u32,
    /// When this file started transferring
    pub started_at: Option<DateTime<Utc>>,
    /// When this file finished
    pub finished_at: Option<DateTime<Utc>>,
}

impl FileInfo {
    /// Describe a file about to be transferred.
    pub fn new(remote_name: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_name: remote_name.into(),
            local_path: local_path.into(),
            size: -1,
            mtime: None,
            mode: None,
            bytes_transferred: 0,
            blocks_transferred: 0,
            block_size: 0,
            errors: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Percent complete for this file; `0.0` when the size is unknown.
    pub fn percent_complete(&self) -> f64 {
        if self.size <= 0 {
            return 0.0;
        }
        let pct = (self.bytes_transferred as f64 / self.size as f64) * 100.0;
        pct.clamp(0.0, 100.0)
    }
}

/// Events broadcast to observers on every mutation.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session state changed
    StateChanged(SessionState),
    /// A message was appended to the log
    Message(TransferMessage),
    /// Progress counters moved
    Progress {
        /// Session-wide bytes transferred
        bytes_transferred: u64,
        /// Session-wide blocks transferred
        blocks_transferred: u64,
    },
}

/// Everything guarded by the session monitor.
#[derive(Debug)]
struct SessionCore {
    state: SessionState,
    files: Vec<FileInfo>,
    current_file: Option<usize>,
    bytes_transferred: u64,
    bytes_total: u64,
    blocks_transferred: u64,
    blocks_total: u64,
    start: Option<Instant>,
    end: Option<Instant>,
    last_block: Option<Instant>,
    current_status: String,
    messages: Vec<TransferMessage>,
    block_size: usize,
}

struct SessionShared {
    id: Uuid,
    flavor: ProtocolFlavor,
    direction: Direction,
    transfer_directory: PathBuf,
    cancel: CancelToken,
    skip: AtomicBool,
    keep_partial: AtomicBool,
    core: Mutex<SessionCore>,
    events: broadcast::Sender<SessionEvent>,
}

/// Shared handle to a transfer session.
///
/// Cloning is cheap; all clones observe the same state. The engine is
/// the only mutator, via the `pub(crate)` surface.
#[derive(Clone)]
pub struct TransferSession {
    inner: Arc<SessionShared>,
}

impl TransferSession {
    fn new(flavor: ProtocolFlavor, direction: Direction, dir: PathBuf) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SessionShared {
                id: Uuid::new_v4(),
                flavor,
                direction,
                transfer_directory: dir,
                cancel: CancelToken::new(),
                skip: AtomicBool::new(false),
                keep_partial: AtomicBool::new(true),
                core: Mutex::new(SessionCore {
                    state: SessionState::Init,
                    files: Vec::new(),
                    current_file: None,
                    bytes_transferred: 0,
                    bytes_total: 0,
                    blocks_transferred: 0,
                    blocks_total: 0,
                    start: None,
                    end: None,
                    last_block: None,
                    current_status: String::new(),
                    messages: Vec::new(),
                    block_size: flavor.block_size(),
                }),
                events,
            }),
        }
    }

    /// Construct an upload session from a list of local files.
    pub fn upload(flavor: ProtocolFlavor, paths: Vec<PathBuf>) -> Self {
        let dir = paths
            .first()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let session = Self::new(flavor, Direction::Upload, dir);
        {
            let mut core = session.inner.core.lock();
            for path in paths {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".into());
                core.files.push(FileInfo::new(name, path));
            }
        }
        session
    }

    /// Construct a download session targeting a directory.
    pub fn download(flavor: ProtocolFlavor, directory: PathBuf) -> Self {
        Self::new(flavor, Direction::Download, directory)
    }

    // ---- identity and configuration reads ----

    /// Unique session id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Protocol family.
    pub fn protocol(&self) -> Protocol {
        self.inner.flavor.protocol()
    }

    /// Protocol name including the variant.
    pub fn protocol_name(&self) -> &'static str {
        self.inner.flavor.name()
    }

    /// Selected flavor.
    pub fn flavor(&self) -> ProtocolFlavor {
        self.inner.flavor
    }

    /// Transfer direction.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Whether this session is a download.
    pub fn is_download(&self) -> bool {
        self.inner.direction == Direction::Download
    }

    /// Directory that holds the files of this transfer.
    pub fn transfer_directory(&self) -> PathBuf {
        self.inner.transfer_directory.clone()
    }

    /// Block size in effect (may change during negotiation).
    pub fn block_size(&self) -> usize {
        self.inner.core.lock().block_size
    }

    // ---- snapshot reads ----

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.inner.core.lock().state
    }

    /// Snapshot of the file currently in flight.
    pub fn current_file(&self) -> Option<FileInfo> {
        let core = self.inner.core.lock();
        core.current_file.map(|i| core.files[i].clone())
    }

    /// Snapshot of all files in the session.
    pub fn files(&self) -> Vec<FileInfo> {
        self.inner.core.lock().files.clone()
    }

    /// Session-wide bytes transferred.
    pub fn bytes_transferred(&self) -> u64 {
        self.inner.core.lock().bytes_transferred
    }

    /// Session-wide blocks transferred.
    pub fn blocks_transferred(&self) -> u64 {
        self.inner.core.lock().blocks_transferred
    }

    /// Status line for a UI.
    pub fn current_status(&self) -> String {
        self.inner.core.lock().current_status.clone()
    }

    /// Transfer rate in bytes/second.
    ///
    /// `-1.0` before the transfer starts; `0.0` when the elapsed time
    /// still rounds to zero.
    pub fn transfer_rate(&self) -> f64 {
        let core = self.inner.core.lock();
        let (reference, start) = match core.state {
            SessionState::Init => return -1.0,
            SessionState::FileInfoWait | SessionState::Transfer | SessionState::FileDone => {
                (core.last_block, core.start)
            }
            SessionState::Abort | SessionState::End => (core.end, core.start),
        };
        let (Some(reference), Some(start)) = (reference, start) else {
            return -1.0;
        };
        let secs = reference.duration_since(start).as_secs_f64();
        if secs > 0.0 {
            core.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }

    /// Percent of the whole session completed; `0.0` when totals are
    /// unknown.
    pub fn total_percent_complete(&self) -> f64 {
        let core = self.inner.core.lock();
        if core.state == SessionState::Init || core.bytes_total == 0 {
            return 0.0;
        }
        let pct = (core.bytes_transferred as f64 / core.bytes_total as f64) * 100.0;
        pct.clamp(0.0, 100.0)
    }

    /// Percent of the current file completed.
    ///
    /// XMODEM downloads cannot know the size and always report `0.0`.
    pub fn percent_complete(&self) -> f64 {
        if self.protocol() == Protocol::Xmodem && self.is_download() {
            return 0.0;
        }
        self.current_file().map_or(0.0, |f| f.percent_complete())
    }

    // ---- message log ----

    /// Number of log entries.
    pub fn message_count(&self) -> usize {
        self.inner.core.lock().messages.len()
    }

    /// Number of error entries.
    pub fn error_count(&self) -> usize {
        self.inner
            .core
            .lock()
            .messages
            .iter()
            .filter(|m| m.is_error())
            .count()
    }

    /// Number of info entries.
    pub fn info_count(&self) -> usize {
        self.inner
            .core
            .lock()
            .messages
            .iter()
            .filter(|m| !m.is_error())
            .count()
    }

    /// A specific log entry, if present.
    pub fn message(&self, index: usize) -> Option<TransferMessage> {
        self.inner.core.lock().messages.get(index).cloned()
    }

    /// The most recent log entry.
    pub fn last_message(&self) -> Option<TransferMessage> {
        self.inner.core.lock().messages.last().cloned()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ---- control ----

    /// Request cancellation of the whole transfer.
    ///
    /// The engine notices at its next suspension point, transmits the
    /// protocol's abort sequence, and moves the session to `Abort`.
    /// With `keep_partial` false on a download, the in-flight partial
    /// file is deleted. Idempotent.
    pub fn cancel_transfer(&self, keep_partial: bool) {
        self.inner.keep_partial.store(keep_partial, Ordering::SeqCst);
        self.inner.cancel.cancel();
    }

    /// Request that the current file be skipped.
    ///
    /// Honored only where the protocol allows it (ZMODEM at a file
    /// boundary); XMODEM and YMODEM have no skip capability.
    pub fn skip_file(&self, keep_partial: bool) {
        self.inner.keep_partial.store(keep_partial, Ordering::SeqCst);
        self.inner.skip.store(true, Ordering::SeqCst);
    }

    /// The cancel token observed by the wire channel.
    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    /// Whether cancellation has been requested.
    pub fn cancel_requested(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Whether partial downloads should be kept on abort/skip.
    pub fn keep_partial(&self) -> bool {
        self.inner.keep_partial.load(Ordering::SeqCst)
    }

    /// Consume a pending skip request.
    pub(crate) fn take_skip_request(&self) -> bool {
        self.inner.skip.swap(false, Ordering::SeqCst)
    }

    // ---- engine-side mutators ----

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Move the session to a new state. Terminal states latch.
    pub(crate) fn set_state(&self, state: SessionState) {
        let changed = {
            let mut core = self.inner.core.lock();
            if core.state.is_terminal() {
                debug!(session = %self.inner.id, ?state, "transition after terminal state ignored");
                false
            } else if core.state == state {
                false
            } else {
                core.state = state;
                if core.start.is_none() && state != SessionState::Init {
                    core.start = Some(Instant::now());
                }
                if state.is_terminal() {
                    core.end = Some(Instant::now());
                }
                true
            }
        };
        if changed {
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    /// Set the status line shown to observers.
    pub(crate) fn set_status(&self, status: impl Into<String>) {
        self.inner.core.lock().current_status = status.into();
    }

    /// Append an info message and update the status line.
    pub(crate) fn add_info(&self, text: impl Into<String>) {
        let message = TransferMessage::new(MessageKind::Info, text);
        debug!(session = %self.inner.id, "{}", message.text);
        {
            let mut core = self.inner.core.lock();
            core.current_status = message.text.clone();
            core.messages.push(message.clone());
        }
        self.emit(SessionEvent::Message(message));
    }

    /// Append an error message and update the status line.
    pub(crate) fn add_error(&self, text: impl Into<String>) {
        let message = TransferMessage::new(MessageKind::Error, text);
        debug!(session = %self.inner.id, "{}", message.text);
        {
            let mut core = self.inner.core.lock();
            core.current_status = message.text.clone();
            core.messages.push(message.clone());
        }
        self.emit(SessionEvent::Message(message));
    }

    /// Set session totals once sizes are known.
    pub(crate) fn set_totals(&self, bytes: u64, blocks: u64) {
        let mut core = self.inner.core.lock();
        core.bytes_total = bytes;
        core.blocks_total = blocks;
    }

    /// Add to the session byte/block goals (batch protocols learn file
    /// sizes one at a time).
    pub(crate) fn add_to_totals(&self, bytes: u64, blocks: u64) {
        let mut core = self.inner.core.lock();
        core.bytes_total += bytes;
        core.blocks_total += blocks;
    }

    /// Record the block size negotiation settled on.
    pub(crate) fn set_block_size(&self, block_size: usize) {
        let mut core = self.inner.core.lock();
        core.block_size = block_size;
        if let Some(i) = core.current_file {
            core.files[i].block_size = block_size;
        }
    }

    /// Append a new file (downloads) and make it current.
    pub(crate) fn begin_file(&self, mut info: FileInfo) {
        info.started_at = Some(Utc::now());
        info.block_size = self.block_size();
        let mut core = self.inner.core.lock();
        core.files.push(info);
        core.current_file = Some(core.files.len() - 1);
    }

    /// Make the `index`-th pre-registered file current (uploads).
    pub(crate) fn begin_upload_file(&self, index: usize, size: i64, mtime: Option<i64>, mode: Option<u32>) {
        let mut core = self.inner.core.lock();
        if let Some(file) = core.files.get_mut(index) {
            file.size = size;
            file.mtime = mtime;
            file.mode = mode;
            file.started_at = Some(Utc::now());
        }
        core.current_file = Some(index);
    }

    /// Update the current file's declared metadata.
    pub(crate) fn set_current_file_meta(&self, size: i64, mtime: Option<i64>, mode: Option<u32>) {
        let mut core = self.inner.core.lock();
        if let Some(i) = core.current_file {
            let file = &mut core.files[i];
            file.size = size;
            file.mtime = mtime;
            file.mode = mode;
        }
    }

    /// Account transferred bytes/blocks to the current file and the
    /// session, and stamp the progress clock.
    pub(crate) fn note_progress(&self, bytes: u64, blocks: u64) {
        let (total_bytes, total_blocks) = {
            let mut core = self.inner.core.lock();
            core.bytes_transferred += bytes;
            core.blocks_transferred += blocks;
            core.last_block = Some(Instant::now());
            if let Some(i) = core.current_file {
                let file = &mut core.files[i];
                file.bytes_transferred += bytes;
                file.blocks_transferred += blocks;
            }
            (core.bytes_transferred, core.blocks_transferred)
        };
        self.emit(SessionEvent::Progress {
            bytes_transferred: total_bytes,
            blocks_transferred: total_blocks,
        });
    }

    /// Charge an error (retry, NAK, rewind) to the current file.
    pub(crate) fn note_file_error(&self) {
        let mut core = self.inner.core.lock();
        if let Some(i) = core.current_file {
            core.files[i].errors += 1;
        }
    }

    /// Stamp the current file finished.
    pub(crate) fn finish_file(&self) {
        let mut core = self.inner.core.lock();
        if let Some(i) = core.current_file {
            core.files[i].finished_at = Some(Utc::now());
        }
    }

    /// Record an abort caused by `err`: tagged error message, then the
    /// terminal `Abort` state.
    pub(crate) fn abort_with(&self, err: &ProtocolError) {
        self.add_error(format!("[{}] {err}", err.tag()));
        self.set_state(SessionState::Abort);
    }
}
