//! USB access through rusb
//!
//! `device` finds and claims bridges; `rusb_bus` runs the transport's
//! requests against the claimed handle.

pub mod device;
pub mod rusb_bus;

pub use device::{
    BridgeInfo, OpenedBridge, find_bridges, list_bridges, matches_id_table, open_bridge,
};
pub use rusb_bus::RusbBus;
