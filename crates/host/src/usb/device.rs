//! Bridge discovery and opening
//!
//! Finds ES2 bridges by VID:PID, claims the bridge interface and translates
//! its endpoint descriptors for the transport.

use crate::bridge::AttachError;
use common::{BridgeId, EndpointDescriptor, EndpointType};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, warn};

/// A bridge as seen during enumeration
#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub id: BridgeId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// An opened bridge with its interface claimed
pub struct OpenedBridge {
    pub id: BridgeId,
    pub handle: DeviceHandle<Context>,
    pub interface: u8,
    /// Endpoints of the claimed interface, in descriptor order
    pub endpoints: Vec<EndpointDescriptor>,
    /// Whether a kernel driver was detached and should be given back
    pub kernel_driver_detached: bool,
}

/// Check whether a VID/PID pair is listed in the id table
///
/// Entries are `0xVID:0xPID` with `*` matching any value. An empty table
/// matches nothing.
pub fn matches_id_table(vid: u16, pid: u16, table: &[String]) -> bool {
    table.iter().any(|entry| {
        let Some((filter_vid, filter_pid)) = entry.split_once(':') else {
            return false;
        };
        id_matches(filter_vid, vid) && id_matches(filter_pid, pid)
    })
}

fn id_matches(filter: &str, value: u16) -> bool {
    if filter == "*" {
        return true;
    }
    let hex = filter
        .strip_prefix("0x")
        .or_else(|| filter.strip_prefix("0X"))
        .unwrap_or(filter);
    u16::from_str_radix(hex, 16)
        .map(|v| v == value)
        .unwrap_or(false)
}

/// Identity used for a device in the registry
pub fn bridge_id(device: &Device<Context>) -> BridgeId {
    BridgeId {
        bus: device.bus_number(),
        address: device.address(),
    }
}

/// Every connected device matching the id table
pub fn find_bridges(context: &Context, table: &[String]) -> Result<Vec<Device<Context>>, rusb::Error> {
    let devices = context.devices()?;
    let mut found = Vec::new();

    for device in devices.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!("Skipping device without descriptor: {}", e);
                continue;
            }
        };
        if matches_id_table(desc.vendor_id(), desc.product_id(), table) {
            found.push(device);
        }
    }

    debug!("Found {} matching bridges", found.len());
    Ok(found)
}

/// Describe every connected bridge without claiming it
pub fn list_bridges(context: &Context, table: &[String]) -> Result<Vec<BridgeInfo>, rusb::Error> {
    let mut bridges = Vec::new();
    for device in find_bridges(context, table)? {
        let desc = device.device_descriptor()?;
        let strings = device.open().ok().map(|handle| {
            let read = |idx: Option<u8>| idx.and_then(|i| handle.read_string_descriptor_ascii(i).ok());
            (
                read(desc.manufacturer_string_index()),
                read(desc.product_string_index()),
                read(desc.serial_number_string_index()),
            )
        });
        let (manufacturer, product, serial_number) = strings.unwrap_or((None, None, None));

        bridges.push(BridgeInfo {
            id: bridge_id(&device),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            manufacturer,
            product,
            serial_number,
        });
    }
    Ok(bridges)
}

/// Open a bridge and claim `interface`
///
/// Detaches a bound kernel driver first. On failure nothing stays claimed.
pub fn open_bridge(device: &Device<Context>, interface: u8) -> Result<OpenedBridge, AttachError> {
    let id = bridge_id(device);

    let endpoints = read_endpoints(device, interface)?;

    let handle = device.open().map_err(|e| {
        warn!("Failed to open bridge {}: {}", id, e);
        AttachError::Device(format!("Failed to open device: {}", e))
    })?;

    let kernel_driver_detached = match handle.kernel_driver_active(interface) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {} on bridge {}", interface, id);
            match handle.detach_kernel_driver(interface) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to detach kernel driver from interface {}: {}", interface, e);
                    false
                }
            }
        }
        Ok(false) => false,
        Err(e) => {
            debug!("Could not check kernel driver status for interface {}: {}", interface, e);
            false
        }
    };

    if let Err(e) = handle.claim_interface(interface) {
        warn!("Failed to claim interface {} on bridge {}: {}", interface, id, e);
        if kernel_driver_detached {
            if let Err(e) = handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
        return Err(AttachError::Device(format!(
            "Failed to claim interface {}: {}",
            interface, e
        )));
    }

    debug!("Claimed interface {} on bridge {}", interface, id);
    Ok(OpenedBridge {
        id,
        handle,
        interface,
        endpoints,
        kernel_driver_detached,
    })
}

/// Endpoint descriptors of the first alternate setting of `interface`
fn read_endpoints(
    device: &Device<Context>,
    interface: u8,
) -> Result<Vec<EndpointDescriptor>, AttachError> {
    let config = device
        .active_config_descriptor()
        .map_err(|e| AttachError::Device(format!("Failed to get config descriptor: {}", e)))?;

    let iface = config
        .interfaces()
        .find(|i| i.number() == interface)
        .ok_or_else(|| AttachError::Device(format!("Interface {} not found", interface)))?;

    let setting = iface
        .descriptors()
        .next()
        .ok_or_else(|| AttachError::Device(format!("Interface {} has no settings", interface)))?;

    Ok(setting
        .endpoint_descriptors()
        .map(|ep| EndpointDescriptor {
            address: ep.address(),
            transfer_type: map_transfer_type(ep.transfer_type()),
            interval: ep.interval(),
        })
        .collect())
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> EndpointType {
    match transfer_type {
        rusb::TransferType::Control => EndpointType::Control,
        rusb::TransferType::Isochronous => EndpointType::Isochronous,
        rusb::TransferType::Bulk => EndpointType::Bulk,
        rusb::TransferType::Interrupt => EndpointType::Interrupt,
    }
}
