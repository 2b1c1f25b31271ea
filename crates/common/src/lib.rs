//! Common utilities for gb-bridge
//!
//! This crate provides the pieces shared between the transport core and the
//! bus implementations: the USB request types and [`HostBus`] seam, the async
//! completion queue, the upward [`BridgeHandler`] callbacks, error handling
//! and logging setup.

pub mod channel;
pub mod error;
pub mod handler;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{
    BridgeEvent, BridgeEvents, CompletionReceiver, CompletionSender, EventNotifier,
    create_completion_queue, create_event_channel,
};
pub use error::{Error, Result};
pub use handler::BridgeHandler;
pub use logging::setup_logging;
pub use usb_types::{
    BridgeId, BusError, Completion, ControlSetup, EndpointDescriptor, EndpointType, HostBus,
    OutSlot, SlotKind, SubmitError, TransferKind, Urb, UrbId, UrbStatus,
};
