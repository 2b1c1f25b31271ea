//! Integration tests for host configuration files
//!
//! Covers parsing from TOML text, saving and reloading through the
//! filesystem, and rejection of invalid files.

use host::HostConfig;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const MINIMAL_CONFIG: &str = r#"
[host]
service_mode = false
log_level = "info"

[usb]
devices = ["0xffff:0x0002"]
"#;

const FULL_CONFIG: &str = r#"
[host]
service_mode = true
log_level = "debug"

[usb]
devices = ["0xffff:*", "0x1234:0x5678"]
interface = 1

[transport]
out_urbs = 16
in_urbs = 2
max_overflow_urbs = 8
svc_timeout_ms = 250
bulk_out_timeout_ms = 2000
completion_queue_depth = 512
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("host.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_minimal_config_uses_transport_defaults() {
    let config: HostConfig = toml::from_str(MINIMAL_CONFIG).unwrap();
    config.validate().unwrap();

    assert_eq!(config.usb.interface, 0);
    let settings = config.transport.bridge_settings();
    assert_eq!(settings.out_urbs, 8);
    assert_eq!(settings.in_urbs, 4);
    assert_eq!(settings.max_overflow_urbs, 64);
    assert_eq!(settings.svc_timeout, Duration::from_millis(500));
    assert_eq!(config.transport.bulk_out_timeout(), None);
}

#[test]
fn test_full_config() {
    let config: HostConfig = toml::from_str(FULL_CONFIG).unwrap();
    config.validate().unwrap();

    assert!(config.host.service_mode);
    assert_eq!(config.host.log_level, "debug");
    assert_eq!(config.usb.devices.len(), 2);
    assert_eq!(config.usb.interface, 1);

    let transport = &config.transport;
    let settings = transport.bridge_settings();
    assert_eq!(settings.out_urbs, 16);
    assert_eq!(settings.in_urbs, 2);
    assert_eq!(settings.svc_timeout, Duration::from_millis(250));
    assert_eq!(
        transport.bulk_out_timeout(),
        Some(Duration::from_millis(2000))
    );
    assert_eq!(transport.queue_depth(), 512);
}

#[test]
fn test_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("host.toml");

    let mut config = HostConfig::default();
    config.host.log_level = "warn".to_string();
    config.usb.devices = vec!["0x18d1:*".to_string()];
    config.transport.out_urbs = 32;
    config.save(&path).unwrap();

    let loaded = HostConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.host.log_level, "warn");
    assert_eq!(loaded.usb.devices, vec!["0x18d1:*".to_string()]);
    assert_eq!(loaded.transport.out_urbs, 32);
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let result = HostConfig::load(Some(dir.path().join("absent.toml")));
    assert!(result.is_err());
}

#[test]
fn test_load_rejects_malformed_toml() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[host\nlog_level = ");

    let err = HostConfig::load(Some(path)).unwrap_err();
    assert!(err.to_string().contains("Failed to parse"));
}

#[test]
fn test_load_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();

    let path = write_config(&dir, &MINIMAL_CONFIG.replace("info", "loud"));
    assert!(HostConfig::load(Some(path)).is_err());

    let path = write_config(&dir, &MINIMAL_CONFIG.replace("0x0002", "0xzzzz"));
    assert!(HostConfig::load(Some(path)).is_err());

    let path = write_config(
        &dir,
        &MINIMAL_CONFIG.replace(r#"["0xffff:0x0002"]"#, "[]"),
    );
    assert!(HostConfig::load(Some(path)).is_err());

    let path = write_config(&dir, &format!("{}\n[transport]\nin_urbs = 0\n", MINIMAL_CONFIG));
    assert!(HostConfig::load(Some(path)).is_err());
}

#[test]
fn test_missing_required_section() {
    let result: Result<HostConfig, _> = toml::from_str("[host]\nservice_mode = false\n");
    assert!(result.is_err());
}
