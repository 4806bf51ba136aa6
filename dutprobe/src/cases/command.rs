//! Generic setup-then-probe test.
//!
//! Quick-sends a list of setup commands, waits a guard interval, then
//! issues one primary command with send-and-wait. Passes when the primary
//! command's output contains the expected pattern(s).

use std::time::Duration;

use crate::cases::{DeviceParams, Evaluation, FailureKind, TestCase, Timing};
use crate::error::Result;
use crate::protocol::dispatcher::Command;
use crate::session::{BootStage, Session};

/// Setup commands plus one checked command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTest {
    name: String,
    stage: BootStage,
    setup: Vec<String>,
    command: Command,
    guard: Duration,
}

impl CommandTest {
    /// Test running `command` at the bootloader prompt.
    pub fn new(name: impl Into<String>, command: Command) -> Self {
        Self {
            name: name.into(),
            stage: BootStage::BootloaderReady,
            setup: Vec::new(),
            command,
            guard: Duration::from_secs(1),
        }
    }

    /// Quick-send these before the primary command.
    #[must_use]
    pub fn with_setup<I, S>(mut self, setup: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.setup = setup.into_iter().map(Into::into).collect();
        self
    }

    /// Pause between setup and the primary command.
    #[must_use]
    pub fn with_guard(mut self, guard: Duration) -> Self {
        self.guard = guard;
        self
    }

    /// Run in `stage` instead of the bootloader.
    #[must_use]
    pub fn in_stage(mut self, stage: BootStage) -> Self {
        self.stage = stage;
        self
    }

    /// Ethernet: program the address, save, ping the server.
    pub fn network(device: &DeviceParams, timing: &Timing) -> Self {
        let mut setup = vec![
            format!("setenv ipaddr {}", device.ip_addr),
            format!("setenv serverip {}", device.server_ip),
            format!("setenv netmask {}", device.netmask),
        ];
        if let Some(mac) = &device.mac_addr {
            setup.push(format!("setenv ethaddr {mac}"));
        }
        setup.push("saveenv".to_string());

        let probe = Command::wait_for(
            format!("ping {}", device.server_ip),
            format!("host {} is alive", device.server_ip),
            timing.command_timeout,
        );
        Self::new("network", probe)
            .with_setup(setup)
            .with_guard(timing.command_guard)
    }

    /// USB: start the host stack, look for the EHCI controller.
    pub fn usb(timing: &Timing) -> Self {
        let probe = Command::wait_for("usb tree", "u-boot EHCI Host Controller", timing.command_timeout);
        Self::new("usb", probe)
            .with_setup(["usb start"])
            .with_guard(timing.command_guard)
    }

    /// Setup commands in send order.
    pub fn setup(&self) -> &[String] {
        &self.setup
    }

    /// The checked command.
    pub fn command(&self) -> &Command {
        &self.command
    }
}

impl TestCase for CommandTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_stage(&self) -> BootStage {
        self.stage
    }

    fn execute(&self, session: &mut Session) -> Result<Evaluation> {
        session.note("Sending setup commands...");
        for command in &self.setup {
            session.note(&format!("  -> {command}"));
            session.send_quick(command)?;
        }

        session.sleep(self.guard);
        session.note(&format!("Running test command: {}", self.command.text()));
        let exchange = session.issue(&self.command)?;

        session.note("Final Output:");
        session.note(&exchange.text());

        Ok(Evaluation::expect(
            exchange.matched,
            FailureKind::Timeout,
            format!(
                "{} not seen within {} seconds",
                self.command.expect().describe(),
                self.command.timeout().as_secs()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::{run, testkit};

    #[test]
    fn test_network_setup_sequence() {
        let device = DeviceParams {
            mac_addr: Some("00:1a:2b:3c:4d:5e".into()),
            ..Default::default()
        };
        let test = CommandTest::network(&device, &Timing::default());
        assert_eq!(
            test.setup(),
            [
                "setenv ipaddr 192.168.0.218",
                "setenv serverip 192.168.0.1",
                "setenv netmask 255.255.255.0",
                "setenv ethaddr 00:1a:2b:3c:4d:5e",
                "saveenv",
            ]
        );
        assert_eq!(test.command().text(), "ping 192.168.0.1");
    }

    #[test]
    fn test_network_passes_on_alive_banner() {
        let (_clock, device, mut session) = testkit::at_bootloader();
        device.on_write_after(
            "ping 192.168.0.1",
            Duration::from_secs(2),
            "Using ethernet@b0012000 device\r\nhost 192.168.0.1 is alive\r\n",
        );

        let test = CommandTest::network(&DeviceParams::default(), &Timing::default());
        let evaluation = test.execute(&mut session).unwrap();
        assert!(evaluation.passed());
        assert!(device.written_text().contains("saveenv\r\n"));
    }

    #[test]
    fn test_usb_fails_with_timeout_when_controller_missing() {
        let (clock, device, session) = testkit::scripted();
        device.on_write("usb tree", "USB device tree:\r\n");
        let (sink, lines) = testkit::collecting_sink();
        let mut session = session.with_sink(sink);

        let before = clock.elapsed();
        let outcome = run(&CommandTest::usb(&Timing::default()), &mut session);
        assert!(!outcome.passed());
        assert_eq!(
            outcome.failure.map(|f| f.kind),
            Some(FailureKind::Timeout)
        );
        assert!(clock.elapsed() - before >= Duration::from_secs(10));
        assert!(lines.lock().unwrap().iter().any(|l| l == "Final Output:"));
    }
}
