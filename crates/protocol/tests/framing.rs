//! Framing property tests
//!
//! Checks that the in-place outbound framing and the inbound decoder agree on
//! the `[cport][payload]` layout for every addressable CPort.
//!
//! Run with: `cargo test -p protocol --test framing`

use proptest::prelude::*;
use protocol::{
    CportId, FRAME_OFFSET, HEADROOM, MAX_PAYLOAD, MessageBuffer, ProtocolError, decode_frame,
    encode_frame,
};

proptest! {
    #[test]
    fn stamped_buffer_is_cport_then_payload(
        cport in 0u8..=255,
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut buffer = MessageBuffer::from_payload(&payload).unwrap();
        let len = buffer.stamp_cport(CportId::from(cport)).unwrap();

        prop_assert_eq!(len, payload.len() + 1);
        prop_assert_eq!(buffer.frame()[0], cport);
        prop_assert_eq!(&buffer.frame()[1..], &payload[..]);
    }

    #[test]
    fn decode_inverts_in_place_framing(
        cport in 0u8..=255,
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut buffer = MessageBuffer::from_payload(&payload).unwrap();
        buffer.stamp_cport(CportId::from(cport)).unwrap();

        let (decoded_cport, decoded_payload) = decode_frame(buffer.frame()).unwrap();
        prop_assert_eq!(decoded_cport, CportId::from(cport));
        prop_assert_eq!(decoded_payload, &payload[..]);
    }

    #[test]
    fn encode_matches_in_place_framing(
        cport in 0u8..=255,
        payload in proptest::collection::vec(any::<u8>(), 0..128),
    ) {
        let mut buffer = MessageBuffer::from_payload(&payload).unwrap();
        buffer.stamp_cport(CportId::from(cport)).unwrap();

        let encoded = encode_frame(CportId::from(cport), &payload).unwrap();
        prop_assert_eq!(&encoded[..], buffer.frame());
    }

    #[test]
    fn wide_cports_never_reach_the_wire(cport in 256u16..u16::MAX) {
        let mut buffer = MessageBuffer::new(4).unwrap();
        prop_assert_eq!(
            buffer.stamp_cport(CportId(cport)),
            Err(ProtocolError::CportOutOfRange(cport))
        );
    }
}

#[test]
fn test_storage_round_trips_through_transfer() {
    let mut buffer = MessageBuffer::from_payload(b"greybus").unwrap();
    buffer.stamp_cport(CportId(12)).unwrap();

    // Simulate the bus taking ownership of the storage and handing it back
    let storage = buffer.into_storage();
    assert_eq!(storage[FRAME_OFFSET], 12);
    assert_eq!(&storage[HEADROOM..], b"greybus");

    let returned = MessageBuffer::from_storage(storage).unwrap();
    assert_eq!(returned.payload(), b"greybus");
}

#[test]
fn test_full_page_payload_frames() {
    let payload = vec![0xa5; MAX_PAYLOAD];
    let mut buffer = MessageBuffer::from_payload(&payload).unwrap();
    assert_eq!(buffer.stamp_cport(CportId(1)).unwrap(), MAX_PAYLOAD + 1);
}
