//! Wire-level definitions for the gb-bridge transport
//!
//! This crate defines everything that is fixed by the bridge hardware and the
//! upper protocol layer agreeing on a format:
//!
//! - The buffer contract ([`HEADROOM`], [`MAX_PAYLOAD`]) every outbound
//!   message buffer must satisfy
//! - The one-byte CPort framing used on the bulk endpoints
//! - CPort identifiers and their reserved values
//!
//! # Example
//!
//! ```
//! use protocol::{CportId, MessageBuffer, decode_frame};
//!
//! let mut buffer = MessageBuffer::from_payload(b"hello").unwrap();
//! let wire = buffer.stamp_cport(CportId(3)).unwrap();
//! assert_eq!(wire, 6);
//!
//! let (cport, payload) = decode_frame(buffer.frame()).unwrap();
//! assert_eq!(cport, CportId(3));
//! assert_eq!(payload, b"hello");
//! ```

pub mod buffer;
pub mod error;
pub mod frame;
pub mod types;

pub use buffer::{FRAME_OFFSET, HEADROOM, MAX_PAYLOAD, MessageBuffer};
pub use error::{ProtocolError, Result};
pub use frame::{decode_frame, encode_frame};
pub use types::{CPORT_ID_BAD, CPORT_ID_MAX, CportId, SVC_MSG_HEADER_SIZE, SVC_MSG_SIZE};
