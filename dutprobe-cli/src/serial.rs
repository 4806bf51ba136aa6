//! Which serial port the DUT console is on.
//!
//! Resolution order: `--port`, the configured port, then discovery. In
//! non-interactive mode discovery hands the choice to the library's
//! [`auto_detect_port`]; otherwise the user picks from a menu unless exactly
//! one recognised bridge is attached.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    dutprobe::{
        BridgeKind, DetectedPort, Error as DutError, SerialBackend, auto_detect_port,
        detect_ports, format_port_list,
    },
    log::{debug, error, info},
    std::io::IsTerminal,
};

/// How the port may be chosen.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Port given on the command line.
    pub port: Option<String>,
    /// Offer unrecognised ports next to known bridges.
    pub list_all_ports: bool,
    /// Never prompt.
    pub non_interactive: bool,
}

/// The chosen port.
pub struct SelectedPort {
    /// Port as discovered, or a bare entry for a name the host did not list.
    pub port: DetectedPort,
    /// Known bridge or configured `[[usb_device]]`.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// VID/PID pairs from `[[usb_device]]`, in config order.
fn identities(config: &Config) -> Vec<(u16, u16)> {
    config.usb_device.iter().map(|d| (d.vid, d.pid)).collect()
}

/// Resolve the DUT console port.
pub fn select_serial_port(
    options: &SerialOptions,
    config: &Config,
    backend: &dyn SerialBackend,
) -> Result<SelectedPort> {
    if let Some(name) = options.port.as_deref().or(config.connection.serial.as_deref()) {
        debug!("Using named port {name}");
        return Ok(named_port(name, config, backend));
    }

    if options.non_interactive {
        return match auto_detect_port(backend, &identities(config)) {
            Ok(port) => Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            }),
            Err(DutError::DeviceNotFound) => Err(usage_err("No serial ports found")),
            Err(e) => Err(e.into()),
        };
    }

    let mut ports = detect_ports(backend)?;
    if ports.is_empty() {
        return Err(usage_err("No serial ports found. Is the board connected?"));
    }
    ports.sort_by_key(|p| !is_known_device(p, config));

    let known = ports.iter().filter(|p| is_known_device(p, config)).count();
    if known == 1 && !options.list_all_ports {
        let port = ports.swap_remove(0);
        info!("Auto-selected port: {} [{}]", port.name, port.bridge.name());
        return Ok(SelectedPort { port, is_known: true });
    }
    if known > 1 && !options.list_all_ports {
        ports.truncate(known);
    }

    ensure_interactive_terminal()?;
    choose_from_menu(ports, config)
}

/// Look `name` up among the host's ports, falling back to a bare entry.
fn named_port(name: &str, config: &Config, backend: &dyn SerialBackend) -> SelectedPort {
    let ports = detect_ports(backend).unwrap_or_else(|e| {
        debug!("Port enumeration failed: {e}");
        Vec::new()
    });
    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)));

    let port = found.cloned().unwrap_or_else(|| DetectedPort {
        name: name.to_string(),
        bridge: BridgeKind::Unknown,
        vid: None,
        pid: None,
        manufacturer: None,
        product: None,
        serial: None,
    });
    SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    }
}

fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    port.bridge.is_known()
        || identities(config)
            .into_iter()
            .any(|(vid, pid)| port.matches(vid, pid))
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    let DialoguerError::IO(io_err) = err;
    if io_err.kind() == std::io::ErrorKind::Interrupted {
        cancelled()
    } else {
        usage_err("Port selection prompt failed")
    }
}

/// Menu labels, clipped to `width` columns.
fn menu_labels(ports: &[DetectedPort], width: usize) -> Vec<String> {
    format_port_list(ports)
        .iter()
        .map(|label| console::truncate_str(label, width, "\u{2026}").into_owned())
        .collect()
}

fn choose_from_menu(ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} {} serial port(s), known bridges first",
        style("ℹ").blue(),
        ports.len()
    );

    let width = usize::from(console::Term::stderr().size().1).saturating_sub(4);
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the DUT console port")
        .items(&menu_labels(&ports, width))
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let port = selection
        .and_then(|index| ports.into_iter().nth(index))
        .ok_or_else(cancelled)?;
    Ok(SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    })
}

/// Offer to write a hand-picked port to the local config.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    if config.connection.serial.as_deref() == Some(port.name.as_str()) {
        return Ok(());
    }

    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this port for future runs?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);
    if !remember {
        return Ok(());
    }

    let saved = config.save_port(&port.name).and_then(|()| match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config.remember_usb_device(vid, pid),
        _ => Ok(()),
    });
    if let Err(e) = saved {
        error!("Failed to save port configuration: {e}");
    }
    Ok(())
}
