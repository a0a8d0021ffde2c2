//! Transfer façade
//!
//! Builds a session, selects the engine for `(protocol, flavor,
//! direction)`, and runs it to a terminal state. Abort handling is
//! centralized here: the protocol's abort sequence goes out on a local
//! cancel, partial downloads are deleted unless the observer asked to
//! keep them, and every failure lands in the session log with its
//! taxonomy tag.

pub mod config;
pub(crate) mod xmodem;
pub(crate) mod ymodem;
pub(crate) mod zmodem;

pub use config::TransferConfig;

use crate::core::protocol::{Direction, Protocol, ProtocolError, ProtocolFlavor};
use crate::core::session::{SessionState, TransferSession};
use crate::core::storage::FileStore;
use crate::core::wire::WireChannel;
use async_trait::async_trait;
use std::path::PathBuf;
use xmodem::{XmodemReceiver, XmodemSender};
use ymodem::{YmodemReceiver, YmodemSender};
use zmodem::{ZmodemReceiver, ZmodemSender};

/// Default local name for an XMODEM download, which carries none.
const XMODEM_DEFAULT_NAME: &str = "received.bin";

/// A protocol engine: runs one session to completion over a wire.
#[async_trait]
pub trait ProtocolEngine: Send {
    /// Drive the session to a terminal state, returning the error that
    /// caused an abort, if any.
    async fn start(
        &mut self,
        session: &TransferSession,
        wire: &mut dyn WireChannel,
        store: &dyn FileStore,
    ) -> Result<(), ProtocolError>;
}

macro_rules! impl_engine {
    ($ty:ty) => {
        #[async_trait]
        impl ProtocolEngine for $ty {
            async fn start(
                &mut self,
                session: &TransferSession,
                wire: &mut dyn WireChannel,
                store: &dyn FileStore,
            ) -> Result<(), ProtocolError> {
                self.run(session, wire, store).await
            }
        }
    };
}

impl_engine!(XmodemSender);
impl_engine!(XmodemReceiver);
impl_engine!(YmodemSender);
impl_engine!(YmodemReceiver);
impl_engine!(ZmodemSender);
impl_engine!(ZmodemReceiver);

/// A prepared transfer: a session plus the engine that will drive it.
pub struct Transfer {
    session: TransferSession,
    engine: Box<dyn ProtocolEngine>,
}

impl Transfer {
    /// Prepare an upload of `paths`.
    pub fn upload(
        flavor: ProtocolFlavor,
        paths: Vec<PathBuf>,
        config: TransferConfig,
    ) -> Result<Self, ProtocolError> {
        if paths.is_empty() {
            return Err(ProtocolError::Protocol("nothing to send".into()));
        }
        let engine: Box<dyn ProtocolEngine> = match flavor {
            ProtocolFlavor::Xmodem(x) => {
                if paths.len() != 1 {
                    return Err(ProtocolError::Protocol(
                        "XMODEM carries exactly one file".into(),
                    ));
                }
                Box::new(XmodemSender::new(x, config, paths[0].clone()))
            }
            ProtocolFlavor::Ymodem(y) => Box::new(YmodemSender::new(y, config, paths.clone())),
            ProtocolFlavor::Zmodem(z) => Box::new(ZmodemSender::new(z, config, paths.clone())),
            ProtocolFlavor::Kermit => {
                return Err(ProtocolError::UnsupportedFlavor(
                    "no Kermit engine is available".into(),
                ))
            }
        };
        Ok(Self {
            session: TransferSession::upload(flavor, paths),
            engine,
        })
    }

    /// Prepare a download into `directory`.
    ///
    /// XMODEM carries no filename; the file lands as
    /// `received.bin` unless [`download_named`](Self::download_named)
    /// is used.
    pub fn download(
        flavor: ProtocolFlavor,
        directory: PathBuf,
        config: TransferConfig,
    ) -> Result<Self, ProtocolError> {
        Self::download_named(flavor, directory, XMODEM_DEFAULT_NAME, config)
    }

    /// Prepare a download, naming the target file for protocols that
    /// do not transmit a name (XMODEM).
    pub fn download_named(
        flavor: ProtocolFlavor,
        directory: PathBuf,
        xmodem_name: &str,
        config: TransferConfig,
    ) -> Result<Self, ProtocolError> {
        let engine: Box<dyn ProtocolEngine> = match flavor {
            ProtocolFlavor::Xmodem(x) => Box::new(XmodemReceiver::new(
                x,
                config,
                directory.join(xmodem_name),
            )),
            ProtocolFlavor::Ymodem(y) => {
                Box::new(YmodemReceiver::new(y, config, directory.clone()))
            }
            ProtocolFlavor::Zmodem(z) => {
                Box::new(ZmodemReceiver::new(z, config, directory.clone()))
            }
            ProtocolFlavor::Kermit => {
                return Err(ProtocolError::UnsupportedFlavor(
                    "no Kermit engine is available".into(),
                ))
            }
        };
        Ok(Self {
            session: TransferSession::download(flavor, directory),
            engine,
        })
    }

    /// Handle for observers: progress, message log, cancel, skip.
    pub fn session(&self) -> TransferSession {
        self.session.clone()
    }

    /// Run the transfer to its terminal state.
    ///
    /// The wire channel is bound to the session's cancel token so a
    /// `cancel_transfer` call interrupts blocked reads. File handles
    /// are released on every exit path; a cancelled download's partial
    /// file is deleted unless `keep_partial` was requested.
    pub async fn run(
        mut self,
        wire: &mut dyn WireChannel,
        store: &dyn FileStore,
    ) -> SessionState {
        wire.bind_cancel(self.session.cancel_token());

        match self.engine.start(&self.session, wire, store).await {
            Ok(()) => {}
            Err(err) => {
                if matches!(err, ProtocolError::LocalCancel) {
                    // The engine may have died inside a blocked read;
                    // make sure the peer hears the abort.
                    match self.session.protocol() {
                        Protocol::Zmodem => zmodem::send_attention_cancel(wire).await,
                        _ => xmodem::send_cancel_sequence(wire).await,
                    }
                }
                if self.session.direction() == Direction::Download
                    && !self.session.keep_partial()
                {
                    if let Some(file) = self.session.current_file() {
                        if file.finished_at.is_none() {
                            let _ = store.delete(&file.local_path).await;
                            self.session
                                .add_info(format!("partial file {} deleted", file.local_path.display()));
                        }
                    }
                }
                self.session.abort_with(&err);
            }
        }
        self.session.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{XmodemFlavor, YmodemFlavor};

    #[test]
    fn test_kermit_has_no_engine() {
        let err = Transfer::upload(
            ProtocolFlavor::Kermit,
            vec![PathBuf::from("/tmp/x")],
            TransferConfig::default(),
        )
        .err()
        .expect("kermit must be rejected");
        assert!(matches!(err, ProtocolError::UnsupportedFlavor(_)));
    }

    #[test]
    fn test_xmodem_rejects_batches() {
        let err = Transfer::upload(
            ProtocolFlavor::Xmodem(XmodemFlavor::Crc),
            vec![PathBuf::from("/a"), PathBuf::from("/b")],
            TransferConfig::default(),
        )
        .err()
        .expect("batch must be rejected");
        assert!(matches!(err, ProtocolError::Protocol(_)));
    }

    #[test]
    fn test_empty_upload_rejected() {
        assert!(Transfer::upload(
            ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla),
            vec![],
            TransferConfig::default(),
        )
        .is_err());
    }

    #[test]
    fn test_download_session_direction() {
        let transfer = Transfer::download(
            ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla),
            PathBuf::from("/tmp"),
            TransferConfig::default(),
        )
        .unwrap();
        assert!(transfer.session().is_download());
        assert_eq!(transfer.session().state(), SessionState::Init);
    }
}
