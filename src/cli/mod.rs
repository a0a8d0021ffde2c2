//! CLI support
//!
//! Exit codes and flag-to-flavor mapping shared by the `send` and
//! `receive` subcommands.

pub mod exit_codes;

pub use exit_codes::{exit_code_description, exit_code_for, ExitCodes};

use crate::core::protocol::{ProtocolFlavor, XmodemFlavor, YmodemFlavor, ZmodemFlavor};

/// Resolve the protocol/flavor flags into a [`ProtocolFlavor`].
///
/// Exactly one protocol flag must be set. Flavor flags that make no
/// sense for the chosen protocol are rejected.
#[allow(clippy::fn_params_excessive_bools)]
pub fn resolve_flavor(
    xmodem: bool,
    ymodem: bool,
    zmodem: bool,
    one_k: bool,
    crc: bool,
    g: bool,
    vanilla: bool,
) -> Result<ProtocolFlavor, String> {
    match (xmodem, ymodem, zmodem) {
        (true, false, false) => {
            let flavor = match (one_k, crc, g, vanilla) {
                (true, _, true, _) | (false, false, true, false) => XmodemFlavor::OneKG,
                (true, _, false, _) => XmodemFlavor::OneK,
                (false, true, false, _) => XmodemFlavor::Crc,
                (false, false, false, _) => XmodemFlavor::Vanilla,
                _ => return Err("conflicting XMODEM flavor flags".into()),
            };
            Ok(ProtocolFlavor::Xmodem(flavor))
        }
        (false, true, false) => {
            if one_k || crc {
                return Err("YMODEM always uses 1K blocks with CRC".into());
            }
            Ok(ProtocolFlavor::Ymodem(if g {
                YmodemFlavor::G
            } else {
                YmodemFlavor::Vanilla
            }))
        }
        (false, false, true) => {
            if one_k || crc || g {
                return Err("ZMODEM flavor is selected by negotiation; only --vanilla applies".into());
            }
            Ok(ProtocolFlavor::Zmodem(if vanilla {
                ZmodemFlavor::Vanilla
            } else {
                ZmodemFlavor::Crc32
            }))
        }
        (false, false, false) => Err("select a protocol: --xmodem, --ymodem, or --zmodem".into()),
        _ => Err("select exactly one of --xmodem, --ymodem, --zmodem".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_one_protocol() {
        assert!(resolve_flavor(false, false, false, false, false, false, false).is_err());
        assert!(resolve_flavor(true, true, false, false, false, false, false).is_err());
    }

    #[test]
    fn test_xmodem_flavors() {
        assert_eq!(
            resolve_flavor(true, false, false, false, false, false, true).unwrap(),
            ProtocolFlavor::Xmodem(XmodemFlavor::Vanilla)
        );
        assert_eq!(
            resolve_flavor(true, false, false, false, true, false, false).unwrap(),
            ProtocolFlavor::Xmodem(XmodemFlavor::Crc)
        );
        assert_eq!(
            resolve_flavor(true, false, false, true, false, false, false).unwrap(),
            ProtocolFlavor::Xmodem(XmodemFlavor::OneK)
        );
        assert_eq!(
            resolve_flavor(true, false, false, true, false, true, false).unwrap(),
            ProtocolFlavor::Xmodem(XmodemFlavor::OneKG)
        );
    }

    #[test]
    fn test_ymodem_flavors() {
        assert_eq!(
            resolve_flavor(false, true, false, false, false, false, false).unwrap(),
            ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla)
        );
        assert_eq!(
            resolve_flavor(false, true, false, false, false, true, false).unwrap(),
            ProtocolFlavor::Ymodem(YmodemFlavor::G)
        );
        assert!(resolve_flavor(false, true, false, true, false, false, false).is_err());
    }

    #[test]
    fn test_zmodem_flavors() {
        assert_eq!(
            resolve_flavor(false, false, true, false, false, false, false).unwrap(),
            ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32)
        );
        assert_eq!(
            resolve_flavor(false, false, true, false, false, false, true).unwrap(),
            ProtocolFlavor::Zmodem(ZmodemFlavor::Vanilla)
        );
        assert!(resolve_flavor(false, false, true, false, false, true, false).is_err());
    }
}
