//! Protocol version management

use crate::error::{ProtocolError, Result};

/// USB/IP protocol revision spoken by this implementation (1.1.1)
///
/// Both peers must agree on this value; there is no negotiation.
pub const USBIP_VERSION: u16 = 0x0111;

/// Reject a peer that announced a different protocol revision
pub fn validate_version(version: u16) -> Result<()> {
    if version != USBIP_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            found: version,
            expected: USBIP_VERSION,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_must_match_exactly() {
        assert!(validate_version(USBIP_VERSION).is_ok());
        assert!(validate_version(0x0106).is_err());
        assert!(validate_version(0x0112).is_err());
        assert!(validate_version(0).is_err());
    }
}
