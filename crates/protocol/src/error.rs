//! Protocol error types

use thiserror::Error;

/// Framing and buffer-contract errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload does not fit the buffer contract
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Inbound frame carried no CPort byte
    #[error("Empty frame: no CPort id present")]
    EmptyFrame,

    /// CPort id cannot be expressed in the one-byte wire header
    #[error("CPort id {0} is out of range for this bridge")]
    CportOutOfRange(u16),

    /// The reserved inbound-only CPort was used for sending
    #[error("CPort id is reserved for inbound data")]
    ReservedCport,

    /// Raw parts handed back do not describe a valid buffer
    #[error("Malformed buffer: expected {expected} bytes of storage, got {actual}")]
    MalformedBuffer { expected: usize, actual: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::PayloadTooLarge {
            size: 5000,
            max: 4096,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("5000"));
        assert!(msg.contains("4096"));

        let msg = ProtocolError::CportOutOfRange(300).to_string();
        assert!(msg.contains("300"));
    }
}
