//! Buffer contract for outbound messages
//!
//! Every outbound message is allocated with reserved space in front of the
//! payload. The transport writes the CPort id into the last reserved byte, so
//! the bytes handed to the bus are contiguous `[cport][payload]` without
//! copying the payload.
//!
//! ```text
//!                 +------------------+
//!                 |  reserved area   | \
//!                 |      . . .       |  }- HEADROOM
//!                 |   cport byte     | /   (last byte written on send)
//!   payload  ---> +------------------+
//!                 | transferred data | \
//!                 |      . . .       |  }- len (at most MAX_PAYLOAD)
//!                 +------------------+
//! ```

use crate::error::{ProtocolError, Result};
use crate::types::CportId;
use std::fmt;

/// Bytes reserved in front of every payload
///
/// Only one byte is needed for the CPort id; four keeps the payload
/// word-aligned for the user.
pub const HEADROOM: usize = 4;

/// Largest payload accepted (one page)
pub const MAX_PAYLOAD: usize = 4096;

/// Offset of the CPort byte inside a buffer's storage
pub const FRAME_OFFSET: usize = HEADROOM - 1;

/// A message buffer that satisfies the headroom contract by construction
#[derive(Clone, PartialEq, Eq)]
pub struct MessageBuffer {
    /// `HEADROOM` reserved bytes followed by the payload
    storage: Vec<u8>,
}

impl MessageBuffer {
    /// Allocate a zeroed payload of `len` bytes
    pub fn new(len: usize) -> Result<Self> {
        check_len(len)?;
        Ok(Self {
            storage: vec![0u8; HEADROOM + len],
        })
    }

    /// Allocate a buffer holding a copy of `payload`
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut buffer = Self::new(payload.len())?;
        buffer.storage[HEADROOM..].copy_from_slice(payload);
        Ok(buffer)
    }

    /// Rebuild a buffer from storage previously taken with [`into_storage`]
    ///
    /// [`into_storage`]: MessageBuffer::into_storage
    pub fn from_storage(storage: Vec<u8>) -> Result<Self> {
        if storage.len() < HEADROOM {
            return Err(ProtocolError::MalformedBuffer {
                expected: HEADROOM,
                actual: storage.len(),
            });
        }
        check_len(storage.len() - HEADROOM)?;
        Ok(Self { storage })
    }

    /// Payload length (excluding headroom)
    pub fn len(&self) -> usize {
        self.storage.len() - HEADROOM
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.storage[HEADROOM..]
    }

    /// Write the CPort id into the headroom byte preceding the payload
    ///
    /// Returns the length of the resulting wire frame.
    pub fn stamp_cport(&mut self, cport: CportId) -> Result<usize> {
        self.storage[FRAME_OFFSET] = cport.wire_byte()?;
        Ok(self.storage.len() - FRAME_OFFSET)
    }

    /// The `[cport][payload]` region as last stamped
    pub fn frame(&self) -> &[u8] {
        &self.storage[FRAME_OFFSET..]
    }

    /// Give up the backing storage (headroom included) for a transfer
    pub fn into_storage(self) -> Vec<u8> {
        self.storage
    }
}

impl Default for MessageBuffer {
    /// An empty payload with headroom reserved
    fn default() -> Self {
        Self {
            storage: vec![0u8; HEADROOM],
        }
    }
}

impl fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("len", &self.len())
            .finish()
    }
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headroom_precedes_payload() {
        let buffer = MessageBuffer::from_payload(&[1, 2, 3]).unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.payload(), &[1, 2, 3]);

        let storage = buffer.into_storage();
        assert_eq!(storage.len(), HEADROOM + 3);
        assert_eq!(&storage[HEADROOM..], &[1, 2, 3]);
    }

    #[test]
    fn test_stamp_writes_byte_before_payload() {
        let mut buffer = MessageBuffer::from_payload(b"abc").unwrap();
        let len = buffer.stamp_cport(CportId(0x42)).unwrap();
        assert_eq!(len, 4);
        assert_eq!(buffer.frame(), &[0x42, b'a', b'b', b'c']);
        // Payload itself is untouched
        assert_eq!(buffer.payload(), b"abc");
    }

    #[test]
    fn test_stamp_rejects_unaddressable_cport() {
        let mut buffer = MessageBuffer::new(1).unwrap();
        assert_eq!(
            buffer.stamp_cport(CportId(256)),
            Err(ProtocolError::CportOutOfRange(256))
        );
    }

    #[test]
    fn test_max_payload_enforced() {
        assert!(MessageBuffer::new(MAX_PAYLOAD).is_ok());
        assert_eq!(
            MessageBuffer::new(MAX_PAYLOAD + 1).unwrap_err(),
            ProtocolError::PayloadTooLarge {
                size: MAX_PAYLOAD + 1,
                max: MAX_PAYLOAD
            }
        );
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let mut buffer = MessageBuffer::new(0).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.stamp_cport(CportId(7)).unwrap(), 1);
        assert_eq!(buffer.frame(), &[7]);
    }

    #[test]
    fn test_from_storage_requires_headroom() {
        assert!(MessageBuffer::from_storage(vec![0; 2]).is_err());
        let buffer = MessageBuffer::from_storage(vec![0, 0, 0, 0, 9]).unwrap();
        assert_eq!(buffer.payload(), &[9]);
    }

    #[test]
    fn test_default_is_empty() {
        let buffer = MessageBuffer::default();
        assert!(buffer.is_empty());
        assert_eq!(buffer.into_storage().len(), HEADROOM);
    }
}
