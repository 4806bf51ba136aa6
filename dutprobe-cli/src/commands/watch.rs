//! `watch`: drive the auto-reconnect poller from a host loop.

use anyhow::Result;
use console::style;
use dutprobe::{AutoConnectConfig, AutoConnector, NativeBackend, SystemClock};
use log::info;
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::{Cli, CliError, was_interrupted};

/// Resolve the identity to watch: flags first, then the config.
fn identity(config: &Config, vid: Option<u16>, pid: Option<u16>) -> Result<(u16, u16)> {
    match (vid, pid) {
        (Some(vid), Some(pid)) => Ok((vid, pid)),
        (Some(vid), None) => match config.usb_device.iter().find(|d| d.vid == vid) {
            Some(device) => Ok((vid, device.pid)),
            None => Err(CliError::Usage(format!("no --pid given for VID {vid:04x}")).into()),
        },
        _ => config
            .usb_device
            .first()
            .map(|d| (d.vid, d.pid))
            .ok_or_else(|| {
                CliError::Usage(
                    "no device identity: pass --vid/--pid or add a [[usb_device]] entry".into(),
                )
                .into()
            }),
    }
}

/// Print connect, disconnect and prompt events until Ctrl-C.
pub(crate) fn cmd_watch(
    cli: &Cli,
    config: &Config,
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<()> {
    let (vid, pid) = identity(config, vid, pid)?;
    let mut settings = AutoConnectConfig::new(vid, pid);
    if let Some(baud) = cli.baud.or(config.connection.baud) {
        settings = settings.with_baud(baud);
    }

    let mut connector = AutoConnector::new(Arc::new(NativeBackend), settings, Arc::new(SystemClock))?
        .on_connected(|port| {
            eprintln!(
                "{} Connected to {} @ {}",
                style("✓").green(),
                style(port.name()).cyan(),
                port.baud_rate()
            );
        })
        .on_disconnected(|| eprintln!("{} Disconnected", style("✗").red()))
        .on_prompt(|text| {
            eprintln!("{} Prompt: {}", style("→").green().bold(), text.trim());
        });

    eprintln!(
        "{} Watching for {vid:04x}:{pid:04x} (Ctrl-C to stop)",
        style("📡").cyan()
    );
    connector.start();
    while connector.tick() {
        if was_interrupted() {
            connector.stop();
            break;
        }
        thread::sleep(connector.reconnect_interval());
    }
    info!("Stopped watching");

    Ok(())
}
