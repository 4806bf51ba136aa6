//! `list-tests` and `list-ports`.

use anyhow::Result;
use console::style;
use dutprobe::{DetectedPort, NativeBackend, TestKind, detect_ports, format_port_list};

use crate::config::Config;

/// Print the test catalogue.
pub(crate) fn cmd_list_tests(json: bool) -> Result<()> {
    if json {
        let tests: Vec<serde_json::Value> = TestKind::ALL
            .iter()
            .map(|kind| {
                serde_json::json!({
                    "name": kind.name(),
                    "stage": kind.required_stage().to_string(),
                    "description": kind.description(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&tests)?);
        return Ok(());
    }

    for kind in TestKind::ALL {
        println!(
            "{:<12} {:<20} {}",
            style(kind.name()).cyan(),
            style(format!("[{}]", kind.required_stage())).dim(),
            kind.description()
        );
    }
    Ok(())
}

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "bridge": port.bridge.name(),
        "known": port.bridge.is_known(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// List serial ports, marking the one auto-selection would pick.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) -> Result<()> {
    let detected = detect_ports(&NativeBackend)?;

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for (port, line) in detected.iter().zip(format_port_list(&detected)) {
        let line = if port.bridge.is_known() {
            style(line).cyan().to_string()
        } else {
            line
        };
        eprintln!("  {} {line}", style("•").green());
    }

    let identities: Vec<(u16, u16)> = config.usb_device.iter().map(|d| (d.vid, d.pid)).collect();
    if let Ok(auto_port) = dutprobe::device::select_port(&detected, &identities) {
        eprintln!(
            "\n{} Auto-selected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }
    Ok(())
}
