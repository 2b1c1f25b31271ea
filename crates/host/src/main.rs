//! gb-bridge host
//!
//! Binds every ES2 bridge matching the configured id table and runs the CPort
//! transport over it until Ctrl+C or until the bridge goes away.

use anyhow::{Context, Result};
use clap::Parser;
use common::{BridgeEvent, HostBus, setup_logging};
use host::config::{HostConfig, expand_path};
use host::usb::{RusbBus, find_bridges, list_bridges, open_bridge};
use host::{HostRegistry, LogHandler};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gb-bridge-host")]
#[command(author, version, about = "Host transport for ES2 USB bridges")]
#[command(long_about = "
Binds ES2 bridges and multiplexes CPort traffic over their bulk endpoints.

EXAMPLES:
    # Run with default config
    gb-bridge-host

    # Run with custom config
    gb-bridge-host --config ~/bridge.toml

    # List matching bridges and exit
    gb-bridge-host --list-devices

    # Run with debug logging
    gb-bridge-host --log-level debug

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/gb-bridge/host.toml
    3. /etc/gb-bridge/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching bridges and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        HostConfig::load(Some(expand_path(path))).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("gb-bridge host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let context = rusb::Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&context, &config);
    }

    if config.host.service_mode {
        info!("Running in service mode");
    }
    run(context, config).await
}

fn list_devices_mode(context: &rusb::Context, config: &HostConfig) -> Result<()> {
    let bridges =
        list_bridges(context, &config.usb.devices).context("Failed to enumerate USB devices")?;

    if bridges.is_empty() {
        println!("No matching bridges found.");
        return Ok(());
    }

    println!("Found {} bridge(s):\n", bridges.len());
    for bridge in bridges {
        println!(
            "  [{}] {:04x}:{:04x} - {} {}",
            bridge.id,
            bridge.vendor_id,
            bridge.product_id,
            bridge
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            bridge.product.as_deref().unwrap_or("Unknown Product")
        );
        if let Some(serial) = &bridge.serial_number {
            println!("      Serial: {}", serial);
        }
    }
    Ok(())
}

async fn run(context: rusb::Context, config: HostConfig) -> Result<()> {
    let mut registry = HostRegistry::new();
    let events = registry.events();
    let transport = &config.transport;

    let devices =
        find_bridges(&context, &config.usb.devices).context("Failed to enumerate USB devices")?;
    for device in devices {
        let opened = match open_bridge(&device, config.usb.interface) {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Skipping bridge: {}", e);
                continue;
            }
        };

        let id = opened.id;
        let handler = Arc::new(LogHandler::new(id));
        let endpoints = opened.endpoints;
        let handle = opened.handle;
        let interface = opened.interface;
        let reattach = opened.kernel_driver_detached;

        let attached = registry.attach(
            id,
            &endpoints,
            transport.bridge_settings(),
            transport.queue_depth(),
            handler,
            |completions| {
                Arc::new(RusbBus::new(
                    handle,
                    interface,
                    reattach,
                    completions,
                    transport.bulk_out_timeout(),
                )) as Arc<dyn HostBus>
            },
        );
        if let Err(e) = attached {
            error!("Failed to attach bridge {}: {}", id, e);
        }
    }

    if registry.is_empty() {
        warn!("No bridges attached");
        return Ok(());
    }

    info!("{} bridge(s) attached, press Ctrl+C to shutdown", registry.len());

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            event = events.recv_event() => {
                match event {
                    Ok(BridgeEvent::Disconnected { bridge, status }) => {
                        info!("Bridge {} disconnected ({})", bridge, status);
                        registry.detach(bridge).await;
                        if registry.is_empty() {
                            info!("No bridges left");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Event channel closed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    registry.detach_all().await;
    info!("Host shutdown complete");
    Ok(())
}
