//! CPort framing on the bulk endpoints
//!
//! Both directions use the same layout: one leading byte naming the CPort,
//! followed by the payload. There is no length field; the USB transfer length
//! delimits the frame. SVC frames on the interrupt endpoint carry no header.

use crate::error::{ProtocolError, Result};
use crate::types::CportId;
use bytes::{BufMut, Bytes, BytesMut};

/// Build a wire frame `[cport][payload]`
///
/// The transport itself frames in place through [`MessageBuffer`]; this is for
/// producing inbound traffic (bridge firmware simulations, tests) where no
/// headroom is available.
///
/// [`MessageBuffer`]: crate::MessageBuffer
pub fn encode_frame(cport: CportId, payload: &[u8]) -> Result<Bytes> {
    let id = cport.wire_byte()?;
    let mut frame = BytesMut::with_capacity(1 + payload.len());
    frame.put_u8(id);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Split a received frame into its CPort and payload
///
/// A zero-length frame has no CPort to route to and is rejected.
pub fn decode_frame(frame: &[u8]) -> Result<(CportId, &[u8])> {
    match frame.split_first() {
        Some((&id, payload)) => Ok((CportId::from(id), payload)),
        None => Err(ProtocolError::EmptyFrame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode_frame(CportId(5), &[0xde, 0xad]).unwrap();
        assert_eq!(&frame[..], &[5, 0xde, 0xad]);
    }

    #[test]
    fn test_decode_splits_leading_byte() {
        let (cport, payload) = decode_frame(&[9, 1, 2, 3]).unwrap();
        assert_eq!(cport, CportId(9));
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_decode_header_only_frame() {
        let (cport, payload) = decode_frame(&[200]).unwrap();
        assert_eq!(cport, CportId(200));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_decode_empty_frame() {
        assert_eq!(decode_frame(&[]), Err(ProtocolError::EmptyFrame));
    }

    #[test]
    fn test_encode_rejects_wide_cport() {
        assert!(encode_frame(CportId(1000), b"x").is_err());
    }
}
