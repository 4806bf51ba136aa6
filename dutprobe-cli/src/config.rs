//! Configuration file support for dutprobe.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (DUTPROBE_*)
//! 3. Local config file (./dutprobe.toml)
//! 4. Global config file (~/.config/dutprobe/config.toml)

use directories::ProjectDirs;
use dutprobe::{DeviceParams, Timing};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "dutprobe.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Bootloader baud rate.
    pub baud: Option<u32>,
    /// OS console baud rate.
    pub os_baud: Option<u32>,
}

/// Timing overrides the line operators tune.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    /// Delay between the two RTC readings.
    pub clock_drift_secs: Option<u64>,
    /// Silence around the radio `+++` escape.
    pub radio_guard_ms: Option<u64>,
    /// Radio countdown before the AT probe.
    pub radio_countdown_secs: Option<u64>,
    /// Power-fail GPIO polls.
    pub power_retries: Option<u32>,
    /// Wait for the kernel module banner.
    pub module_timeout_secs: Option<u64>,
}

impl TimingConfig {
    fn merge(&mut self, other: Self) {
        self.clock_drift_secs = other.clock_drift_secs.or(self.clock_drift_secs);
        self.radio_guard_ms = other.radio_guard_ms.or(self.radio_guard_ms);
        self.radio_countdown_secs = other.radio_countdown_secs.or(self.radio_countdown_secs);
        self.power_retries = other.power_retries.or(self.power_retries);
        self.module_timeout_secs = other.module_timeout_secs.or(self.module_timeout_secs);
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection and `watch`.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    /// Per-DUT parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceParams>,
    /// Timing overrides.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dutprobe").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.os_baud.is_some() {
            self.connection.os_baud = other.connection.os_baud;
        }
        for device in other.usb_device {
            if !self.usb_device.contains(&device) {
                self.usb_device.push(device);
            }
        }
        if other.device.is_some() {
            self.device = other.device;
        }
        self.timing.merge(other.timing);
    }

    /// Device parameters, defaulted when the config has none.
    pub fn device_params(&self) -> DeviceParams {
        self.device.clone().unwrap_or_default()
    }

    /// Test timing with the configured overrides applied.
    pub fn timing(&self) -> Timing {
        let mut timing = Timing::default();
        let t = &self.timing;
        if let Some(secs) = t.clock_drift_secs {
            timing.clock_drift.delay_secs = secs;
        }
        if let Some(ms) = t.radio_guard_ms {
            timing.radio.guard = Duration::from_millis(ms);
        }
        if let Some(secs) = t.radio_countdown_secs {
            timing.radio.countdown_secs = secs;
        }
        if let Some(retries) = t.power_retries {
            timing.power.retries = retries;
        }
        timing
    }

    /// Kernel module banner timeout override.
    pub fn module_timeout(&self) -> Option<Duration> {
        self.timing.module_timeout_secs.map(Duration::from_secs)
    }

    /// Remember the serial port in the local config file.
    pub fn save_port(&mut self, serial: &str) -> anyhow::Result<()> {
        self.update_local(|local| local.connection.serial = Some(serial.to_string()))?;
        self.connection.serial = Some(serial.to_string());
        Ok(())
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        // Don't add duplicates
        if self.usb_device.contains(&device) {
            return Ok(());
        }

        self.update_local(|local| {
            if !local.usb_device.contains(&device) {
                local.usb_device.push(device);
            }
        })?;
        self.usb_device.push(device);
        Ok(())
    }

    /// Rewrite the local file, keeping whatever else it contains.
    #[allow(clippy::unused_self)]
    fn update_local(&self, edit: impl FnOnce(&mut Self)) -> anyhow::Result<()> {
        let path = Path::new(LOCAL_CONFIG);
        let mut local = Self::load_from_file(path).unwrap_or_default();
        edit(&mut local);

        let content = toml::to_string_pretty(&local)?;
        fs::write(path, content)?;
        info!("Saved configuration to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dutprobe::WifiSecurity;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.usb_device.is_empty());
        assert!(config.device.is_none());
        assert_eq!(config.timing(), Timing::default());
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x1A86,
            pid: 0x7523,
        };
        assert!(device.matches(0x1A86, 0x7523));
        assert!(!device.matches(0x1A86, 0x7522));
        assert!(!device.matches(0x10C4, 0x7523));
    }

    #[test]
    fn test_config_merge_overrides_and_keeps() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.connection.baud = Some(115200);
        base.timing.power_retries = Some(5);

        let mut other = Config::default();
        other.connection.os_baud = Some(460800);
        other.timing.clock_drift_secs = Some(10);
        base.merge(other);

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.baud, Some(115200));
        assert_eq!(base.connection.os_baud, Some(460800));
        assert_eq!(base.timing.power_retries, Some(5));
        assert_eq!(base.timing.clock_drift_secs, Some(10));
    }

    #[test]
    fn test_config_merge_usb_devices_dedup() {
        let mut base = Config::default();
        base.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });

        let mut other = Config::default();
        other.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });
        other.usb_device.push(UsbDevice { vid: 0x10C4, pid: 0xEA60 });

        base.merge(other);
        assert_eq!(base.usb_device.len(), 2);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
serial = "/dev/ttyUSB0"
baud = 115200
os_baud = 921600

[[usb_device]]
vid = 1027
pid = 24577

[device]
ip_addr = "10.0.0.50"
server_ip = "10.0.0.1"

[device.wifi]
ssid = "factory"
passphrase = "line-4"
security = "wpa3-sae"

[timing]
clock_drift_secs = 5
radio_guard_ms = 1500
power_retries = 20
module_timeout_secs = 240
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.connection.os_baud, Some(921600));
        assert_eq!(config.usb_device, vec![UsbDevice { vid: 0x0403, pid: 0x6001 }]);

        let device = config.device_params();
        assert_eq!(device.ip_addr, "10.0.0.50");
        assert_eq!(device.netmask, "255.255.255.0");
        assert_eq!(device.wifi.security, WifiSecurity::Wpa3Sae);

        let timing = config.timing();
        assert_eq!(timing.clock_drift.delay_secs, 5);
        assert_eq!(timing.radio.guard, Duration::from_millis(1500));
        assert_eq!(timing.radio.countdown_secs, 2);
        assert_eq!(timing.power.retries, 20);
        assert_eq!(config.module_timeout(), Some(Duration::from_secs(240)));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        fs::write(
            &path,
            r#"
[connection]
serial = "/dev/ttyUSB1"
[timing]
radio_countdown_secs = 4
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.timing().radio.countdown_secs, 4);
    }

    #[test]
    fn test_load_from_path_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[connection\nserial = ").unwrap();
        assert_eq!(Config::load_from_path(&path), Config::default());
        assert_eq!(
            Config::load_from_path(Path::new("/nonexistent/path/config.toml")),
            Config::default()
        );
    }

    #[test]
    fn test_global_config_path_names_app() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_string_lossy().contains("dutprobe"));
            assert!(p.to_string_lossy().ends_with("config.toml"));
        }
    }
}
