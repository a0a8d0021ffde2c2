//! CLI exit codes
//!
//! Stable exit codes for scripts and automation.

use crate::core::protocol::ProtocolError;
use crate::core::session::TransferSession;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Transfer completed
    pub const SUCCESS: u8 = 0;

    /// Bad arguments or unusable flag combination
    pub const USAGE: u8 = 1;

    /// The protocol aborted (integrity, sequence, peer cancel)
    pub const PROTOCOL_ABORT: u8 = 2;

    /// Local file or channel I/O failure
    pub const IO_ERROR: u8 = 3;

    /// The user cancelled the transfer
    pub const CANCELLED: u8 = 4;
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "Usage error",
        2 => "Protocol abort",
        3 => "I/O error",
        4 => "Cancelled by user",
        _ => "Unknown error",
    }
}

/// Derive the process exit code from a finished session.
///
/// The last message's taxonomy tag tells local cancels and I/O
/// failures apart from protocol-level aborts.
pub fn exit_code_for(session: &TransferSession) -> ExitCode {
    use crate::core::session::SessionState;

    match session.state() {
        SessionState::End => ExitCode::from(ExitCodes::SUCCESS),
        SessionState::Abort => {
            let tag = session
                .last_message()
                .map(|m| m.text)
                .unwrap_or_default();
            let code = if tag.contains(ProtocolError::LocalCancel.tag()) {
                ExitCodes::CANCELLED
            } else if tag.contains("[IoError]") || tag.contains("[FileError]") {
                ExitCodes::IO_ERROR
            } else {
                ExitCodes::PROTOCOL_ABORT
            };
            ExitCode::from(code)
        }
        // A non-terminal state at exit means the engine died early.
        _ => ExitCode::from(ExitCodes::PROTOCOL_ABORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptions() {
        assert_eq!(exit_code_description(0), "Success");
        assert_eq!(exit_code_description(2), "Protocol abort");
        assert_eq!(exit_code_description(4), "Cancelled by user");
        assert_eq!(exit_code_description(99), "Unknown error");
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ExitCodes::SUCCESS, 0);
        assert_eq!(ExitCodes::USAGE, 1);
        assert_eq!(ExitCodes::PROTOCOL_ABORT, 2);
        assert_eq!(ExitCodes::IO_ERROR, 3);
        assert_eq!(ExitCodes::CANCELLED, 4);
    }
}
