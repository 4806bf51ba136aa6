//! Device- and run-level parameters supplied by the caller.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::cases::{
    CellularParams, ClockDriftParams, PeripheralParams, PowerLossParams, RadioParams,
    WirelessParams,
};
use crate::error::{Error, Result};

/// Per-DUT values: addressing and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceParams {
    /// Address assigned to the DUT's Ethernet port.
    pub ip_addr: String,
    /// Host the DUT pings.
    pub server_ip: String,
    /// Netmask for `ip_addr`.
    pub netmask: String,
    /// MAC address to program, if any.
    pub mac_addr: Option<String>,
    /// Wi-Fi network to associate with.
    pub wifi: WifiCredentials,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            ip_addr: "192.168.0.218".to_string(),
            server_ip: "192.168.0.1".to_string(),
            netmask: "255.255.255.0".to_string(),
            mac_addr: None,
            wifi: WifiCredentials::default(),
        }
    }
}

/// Wi-Fi network credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WifiCredentials {
    /// Network name.
    pub ssid: String,
    /// Pre-shared key; ignored for open networks.
    pub passphrase: String,
    /// Security mode.
    pub security: WifiSecurity,
}

/// Wi-Fi security mode, as written to the supplicant config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum WifiSecurity {
    /// No encryption.
    Open,
    /// WPA2 personal.
    #[default]
    Wpa2Psk,
    /// WPA3 personal.
    Wpa3Sae,
}

impl WifiSecurity {
    /// `key_mgmt` value for `wpa_supplicant.conf`.
    pub fn key_mgmt(self) -> &'static str {
        match self {
            Self::Open => "NONE",
            Self::Wpa2Psk => "WPA-PSK",
            Self::Wpa3Sae => "SAE",
        }
    }
}

impl fmt::Display for WifiSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Wpa2Psk => "wpa2-psk",
            Self::Wpa3Sae => "wpa3-sae",
        })
    }
}

impl FromStr for WifiSecurity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "none" => Ok(Self::Open),
            "wpa2" | "wpa2-psk" | "wpa-psk" => Ok(Self::Wpa2Psk),
            "wpa3" | "wpa3-sae" | "sae" => Ok(Self::Wpa3Sae),
            other => Err(Error::Config(format!("unknown Wi-Fi security '{other}'"))),
        }
    }
}

/// Timing and protocol constants for every variant.
///
/// Each field has the latest field-proven default; the CLI exposes the
/// ones the line operators tune.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Timing {
    /// Pause between setup commands and the primary command.
    pub command_guard: Duration,
    /// Wait for the primary command's expected output.
    pub command_timeout: Duration,
    /// RTC drift check.
    pub clock_drift: ClockDriftParams,
    /// Radio AT handshake.
    pub radio: RadioParams,
    /// Power-fail detection.
    pub power: PowerLossParams,
    /// Cellular module detection.
    pub cellular: CellularParams,
    /// USB peripheral listing.
    pub peripherals: PeripheralParams,
    /// Wi-Fi association.
    pub wireless: WirelessParams,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_guard: Duration::from_secs(1),
            command_timeout: Duration::from_secs(10),
            clock_drift: ClockDriftParams::default(),
            radio: RadioParams::default(),
            power: PowerLossParams::default(),
            cellular: CellularParams::default(),
            peripherals: PeripheralParams::default(),
            wireless: WirelessParams::default(),
        }
    }
}
