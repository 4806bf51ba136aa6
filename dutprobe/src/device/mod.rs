//! Device discovery and classification.
//!
//! The DUT console is reached through a USB-UART bridge. Ports reported by a
//! [`SerialBackend`] are classified by VID/PID so callers can pick the right
//! one without asking, or match a configured identity exactly.

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::port::{PortInfo, SerialBackend};

/// Known USB-UART bridge families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BridgeKind {
    /// CH340/CH341.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Anything else.
    Unknown,
}

const KNOWN_BRIDGES: &[(u16, &[u16], BridgeKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        BridgeKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], BridgeKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        BridgeKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], BridgeKind::Prolific),
];

impl BridgeKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge was recognised.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A port plus its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path.
    pub name: String,
    /// Classified bridge.
    pub bridge: BridgeKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let bridge = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => BridgeKind::from_vid_pid(vid, pid),
            _ => BridgeKind::Unknown,
        };
        Self {
            name: info.name,
            bridge,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

impl DetectedPort {
    /// Whether this port carries the given USB identity.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == Some(vid) && self.pid == Some(pid)
    }
}

/// Classify a port enumeration.
pub fn classify_ports(ports: Vec<PortInfo>) -> Vec<DetectedPort> {
    ports
        .into_iter()
        .map(|info| {
            let detected = DetectedPort::from(info);
            if let (Some(vid), Some(pid)) = (detected.vid, detected.pid) {
                trace!(
                    "Found USB port: {} (VID: {vid:04X}, PID: {pid:04X}, Bridge: {:?})",
                    detected.name, detected.bridge
                );
            }
            detected
        })
        .collect()
}

/// Enumerate and classify every port on the host.
pub fn detect_ports(backend: &dyn SerialBackend) -> Result<Vec<DetectedPort>> {
    Ok(classify_ports(backend.list_ports()?))
}

/// Pick one port.
///
/// A port carrying one of `identities` wins, then any recognised bridge,
/// then the first port listed.
pub fn select_port(ports: &[DetectedPort], identities: &[(u16, u16)]) -> Result<DetectedPort> {
    for &(vid, pid) in identities {
        if let Some(port) = ports.iter().find(|p| p.matches(vid, pid)) {
            info!("Found device {} (vid:pid={vid:04x}:{pid:04x})", port.name);
            return Ok(port.clone());
        }
    }

    if let Some(port) = ports.iter().find(|p| p.bridge.is_known()) {
        info!(
            "Auto-detected {} USB-UART bridge: {}",
            port.bridge.name(),
            port.name
        );
        return Ok(port.clone());
    }

    if let Some(port) = ports.first() {
        info!("Using first available port: {}", port.name);
        return Ok(port.clone());
    }

    debug!("No serial ports present");
    Err(Error::DeviceNotFound)
}

/// Enumerate, then [`select_port`].
pub fn auto_detect_port(
    backend: &dyn SerialBackend,
    identities: &[(u16, u16)],
) -> Result<DetectedPort> {
    select_port(&detect_ports(backend)?, identities)
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let bridge_info = if port.bridge.is_known() {
                format!(" [{}]", port.bridge.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, bridge_info, product_info)
        })
        .collect()
}
