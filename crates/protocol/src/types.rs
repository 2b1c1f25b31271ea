//! CPort identifiers and fixed wire sizes

use crate::error::{ProtocolError, Result};
use std::fmt;

/// Logical channel identifier as seen by the upper protocol layer
///
/// The fabric addresses channels with 16 bits, but this bridge carries the id
/// in a single leading byte, so only `0..=CPORT_ID_MAX` can be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CportId(pub u16);

/// Reserved id marking a buffer as inbound-only
pub const CPORT_ID_BAD: CportId = CportId(u16::MAX);

/// Largest CPort id the one-byte header can carry
pub const CPORT_ID_MAX: u16 = u8::MAX as u16;

/// Header size reserved for the largest SVC message
pub const SVC_MSG_HEADER_SIZE: usize = 64;

/// Receive buffer size for the SVC link: largest header plus a 64 KiB data margin
pub const SVC_MSG_SIZE: usize = SVC_MSG_HEADER_SIZE + 64 * 1024;

impl CportId {
    /// Encode this id as the leading wire byte
    pub fn wire_byte(self) -> Result<u8> {
        if self == CPORT_ID_BAD {
            return Err(ProtocolError::ReservedCport);
        }
        u8::try_from(self.0).map_err(|_| ProtocolError::CportOutOfRange(self.0))
    }
}

impl From<u8> for CportId {
    fn from(byte: u8) -> Self {
        CportId(byte as u16)
    }
}

impl fmt::Display for CportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cport{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_byte_range() {
        assert_eq!(CportId(0).wire_byte(), Ok(0));
        assert_eq!(CportId(255).wire_byte(), Ok(255));
        assert_eq!(
            CportId(256).wire_byte(),
            Err(ProtocolError::CportOutOfRange(256))
        );
    }

    #[test]
    fn test_bad_cport_is_rejected() {
        assert_eq!(CPORT_ID_BAD.wire_byte(), Err(ProtocolError::ReservedCport));
    }

    #[test]
    fn test_svc_buffer_has_data_margin() {
        assert!(SVC_MSG_SIZE >= 64 * 1024);
    }
}
