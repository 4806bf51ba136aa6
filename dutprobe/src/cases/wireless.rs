//! Wi-Fi association.
//!
//! Writes the interface and supplicant configuration as here-documents,
//! brings the interface up, then runs a short sequence of link queries
//! until one of them reports the association.

use std::time::Duration;

use crate::cases::{Evaluation, FailureKind, TestCase, WifiCredentials, WifiSecurity};
use crate::error::{Error, Result};
use crate::protocol::dispatcher::Command;
use crate::session::{BootStage, Session};

/// Association parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WirelessParams {
    /// Wireless interface.
    pub interface: String,
    /// Link queries, tried in order.
    pub diagnostics: Vec<String>,
    /// Token reported once associated.
    pub token: String,
    /// Wait per query.
    pub timeout: Duration,
}

impl Default for WirelessParams {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            diagnostics: vec![
                "iw dev wlan0 link".to_string(),
                "sleep 5; iw dev wlan0 link".to_string(),
            ],
            token: "Connected to".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// `/etc/network/interfaces` here-document.
pub fn interfaces_payload(interface: &str) -> String {
    [
        "cat > /etc/network/interfaces << 'EOF'",
        "auto lo",
        "iface lo inet loopback",
        "",
        &format!("auto {interface}"),
        &format!("iface {interface} inet dhcp"),
        "    wpa-conf /etc/wpa_supplicant.conf",
        "EOF",
    ]
    .join("\n")
}

/// SSID as a supplicant value: quoted when that is lossless, hex otherwise.
///
/// Quoted supplicant strings have no escapes, so a quote, a backslash or
/// any non-printable byte forces the hex form. Hex also keeps line breaks
/// out of the here-document.
fn ssid_value(ssid: &str) -> String {
    let plain = ssid
        .bytes()
        .all(|b| (b' '..=b'~').contains(&b) && b != b'"' && b != b'\\');
    if plain {
        format!("\"{ssid}\"")
    } else {
        ssid.bytes().map(|b| format!("{b:02x}")).collect()
    }
}

/// Passphrase as a quoted supplicant value.
///
/// The supplicant takes everything up to the last quote, so embedded quotes
/// survive. Anything outside printable ASCII is not a valid passphrase and
/// could end the here-document early.
fn passphrase_value(passphrase: &str) -> Result<String> {
    if passphrase.bytes().all(|b| (b' '..=b'~').contains(&b)) {
        Ok(format!("\"{passphrase}\""))
    } else {
        Err(Error::Config(
            "Wi-Fi passphrase must be printable ASCII".to_string(),
        ))
    }
}

/// `/etc/wpa_supplicant.conf` here-document.
pub fn supplicant_payload(credentials: &WifiCredentials) -> Result<String> {
    let mut lines = vec![
        "cat > /etc/wpa_supplicant.conf << 'EOF'".to_string(),
        "ctrl_interface=/var/run/wpa_supplicant".to_string(),
        "network={".to_string(),
        format!("    ssid={}", ssid_value(&credentials.ssid)),
    ];
    match credentials.security {
        WifiSecurity::Open => {},
        WifiSecurity::Wpa2Psk => {
            lines.push(format!("    psk={}", passphrase_value(&credentials.passphrase)?));
        },
        WifiSecurity::Wpa3Sae => {
            lines.push(format!(
                "    sae_password={}",
                passphrase_value(&credentials.passphrase)?
            ));
            lines.push("    ieee80211w=2".to_string());
        },
    }
    lines.push(format!("    key_mgmt={}", credentials.security.key_mgmt()));
    lines.push("}".to_string());
    lines.push("EOF".to_string());
    Ok(lines.join("\n"))
}

/// Configure Wi-Fi and wait for the association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirelessTest {
    credentials: WifiCredentials,
    params: WirelessParams,
}

impl WirelessTest {
    /// Create the test.
    pub fn new(credentials: WifiCredentials, params: WirelessParams) -> Self {
        Self {
            credentials,
            params,
        }
    }
}

impl TestCase for WirelessTest {
    fn name(&self) -> &str {
        "wifi"
    }

    fn required_stage(&self) -> BootStage {
        BootStage::OsReady
    }

    fn execute(&self, session: &mut Session) -> Result<Evaluation> {
        let p = &self.params;

        let supplicant = supplicant_payload(&self.credentials)?;
        session.note("Writing network configuration");
        session.send_quick(&interfaces_payload(&p.interface))?;
        session.send_quick(&supplicant)?;
        session.note(&format!("Bringing up {}", p.interface));
        session.send_quick(&format!("ifup {}", p.interface))?;

        let mut seen = String::new();
        for query in &p.diagnostics {
            session.note(&format!("Running test command: {query}"));
            let exchange = session.send_and_wait(&Command::wait_for(
                query.as_str(),
                p.token.as_str(),
                p.timeout,
            ))?;
            seen.push_str(&exchange.text());
            if exchange.matched {
                session.note("Final Output:");
                session.note(&seen);
                return Ok(Evaluation::pass());
            }
        }

        session.note("Final Output:");
        session.note(&seen);
        Ok(Evaluation::fail(
            FailureKind::Timeout,
            format!("'{}' not reported by any link query", p.token),
        ))
    }
}
