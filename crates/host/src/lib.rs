//! Host side of the gb-bridge transport
//!
//! Carries any number of logical CPort channels between a host and an ES2
//! bridge over a single bulk endpoint pair, plus the SVC control link.
//!
//! - [`bridge`]: the transport core ([`Bridge`], send/cancel, receive,
//!   attach and teardown)
//! - [`registry`]: bridges attached to this host and their dispatchers
//! - [`usb`]: device discovery and the rusb-backed [`common::HostBus`]
//! - [`config`]: TOML configuration for the host binary

pub mod bridge;
pub mod config;
pub mod handler;
pub mod registry;
pub mod usb;

pub use bridge::{
    AttachError, Bridge, BridgeSettings, ControlError, Cookie, SendError, SendErrorKind,
    StatsSnapshot,
};
pub use config::HostConfig;
pub use handler::LogHandler;
pub use registry::HostRegistry;
