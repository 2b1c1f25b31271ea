//! USB request types shared between the transport and bus implementations
//!
//! The transport never talks to a host controller directly. It hands owned
//! [`Urb`]s to a [`HostBus`], and the bus posts one [`Completion`] per
//! successfully submitted request onto the completion queue. The request's
//! buffer travels with it, so ownership of the data follows the I/O.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Identifies a physical bridge on the host (bus number, device address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeId {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Where an outbound request lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Index into the fixed pool
    Pool(u16),
    /// Dynamically allocated overflow request, keyed by a never-reused serial
    Overflow(u32),
}

/// Generation-checked reference to an outbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutSlot {
    pub kind: SlotKind,
    pub generation: u32,
}

/// Identity of a request within one bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrbId {
    /// The single SVC receive request
    SvcIn,
    /// One of the CPort receive requests
    CportIn(u8),
    /// An outbound CPort request
    CportOut(OutSlot),
}

/// Transfer type of a request's endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bulk,
    Interrupt {
        /// Polling interval from the endpoint descriptor
        interval: u8,
    },
}

/// An asynchronous USB request together with the buffer it owns
#[derive(Debug)]
pub struct Urb {
    pub id: UrbId,
    /// Endpoint address (bit 7 set for IN)
    pub endpoint: u8,
    pub kind: TransferKind,
    pub buffer: Vec<u8>,
    /// Start of the transferred region inside `buffer`
    pub offset: usize,
}

impl Urb {
    pub fn is_in(&self) -> bool {
        (self.endpoint & 0x80) != 0
    }

    /// Bytes to send (OUT) or capacity to fill (IN)
    pub fn transfer_len(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    pub fn transfer(&self) -> &[u8] {
        &self.buffer[self.offset..]
    }

    pub fn transfer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..]
    }
}

/// Terminal status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbStatus {
    Completed,
    /// Killed by the host before completing
    Cancelled,
    /// Unlinked by the host controller
    ConnReset,
    /// Host controller is shutting down
    Shutdown,
    /// Device was removed
    NoDevice,
    /// Endpoint halted
    Stall,
    /// Device sent more data than requested
    Overflow,
    /// Bit-stuffing or unknown protocol error
    Proto,
    /// CRC or similar framing error
    IlSeq,
    TimedOut,
    /// Status code this transport does not know about
    Other(i32),
}

impl fmt::Display for UrbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrbStatus::Other(code) => write!(f, "unknown status {}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A finished request, handed back to the transport
#[derive(Debug)]
pub struct Completion {
    pub urb: Urb,
    pub status: UrbStatus,
    /// Bytes actually transferred, counted from `urb.offset`
    pub actual_length: usize,
}

impl Completion {
    /// The bytes actually transferred
    pub fn data(&self) -> &[u8] {
        let start = self.urb.offset;
        let end = (start + self.actual_length).min(self.urb.buffer.len());
        &self.urb.buffer[start..end]
    }
}

/// Setup stage of a control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Bus-level failures reported synchronously
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Device is gone")]
    NoDevice,
    #[error("Endpoint stalled")]
    Pipe,
    #[error("Operation timed out")]
    Timeout,
    #[error("Invalid parameter")]
    InvalidParam,
    #[error("Bus is shutting down")]
    Shutdown,
    #[error("I/O error: {0}")]
    Io(String),
}

/// Submission was refused; the request comes back to the caller
#[derive(Debug, Error)]
#[error("Failed to submit {:?}: {error}", .urb.id)]
pub struct SubmitError {
    pub urb: Urb,
    pub error: BusError,
}

/// A host-side USB stack capable of running asynchronous requests
///
/// Contract:
/// - Every `Ok` from [`submit`](HostBus::submit) results in exactly one
///   [`Completion`] being posted to the completion queue.
/// - An `Err` from `submit` means no completion will ever be posted.
/// - [`unlink`](HostBus::unlink) asks for a request to be aborted and returns
///   at once. The completion still arrives exactly once, possibly later and
///   possibly with the status the transfer finished with anyway.
/// - [`kill`](HostBus::kill) returns only after the killed request's
///   completion has been posted (or immediately, if the request is not in
///   flight). It never invokes the transport re-entrantly.
pub trait HostBus: Send + Sync {
    fn submit(&self, urb: Urb) -> Result<(), SubmitError>;

    /// Asynchronous cancel; never blocks
    fn unlink(&self, id: UrbId);

    /// Synchronous cancel, used during teardown
    fn kill(&self, id: UrbId);

    /// Synchronous OUT control transfer on endpoint 0
    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, BusError>;
}

/// Endpoint transfer type, as read from the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// The parts of an endpoint descriptor the transport cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub transfer_type: EndpointType,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn is_in(&self) -> bool {
        (self.address & 0x80) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urb(endpoint: u8, buffer: Vec<u8>, offset: usize) -> Urb {
        Urb {
            id: UrbId::SvcIn,
            endpoint,
            kind: TransferKind::Bulk,
            buffer,
            offset,
        }
    }

    #[test]
    fn test_endpoint_direction() {
        assert!(urb(0x81, vec![], 0).is_in());
        assert!(!urb(0x02, vec![], 0).is_in());
    }

    #[test]
    fn test_transfer_region_skips_offset() {
        let urb = urb(0x02, vec![0, 0, 0, 7, 1, 2], 3);
        assert_eq!(urb.transfer_len(), 3);
        assert_eq!(urb.transfer(), &[7, 1, 2]);
    }

    #[test]
    fn test_completion_data_is_clamped() {
        let completion = Completion {
            urb: urb(0x81, vec![1, 2, 3], 0),
            status: UrbStatus::Completed,
            actual_length: 10,
        };
        assert_eq!(completion.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_bridge_id_display() {
        let id = BridgeId { bus: 1, address: 12 };
        assert_eq!(id.to_string(), "001:012");
    }
}
