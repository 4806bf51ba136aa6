//! Device session: boot-stage tracking over an exclusively owned port.
//!
//! A [`Session`] owns the open serial handle for one DUT and knows which
//! boot stage the device is in:
//!
//! ```text
//! Disconnected --open @ boot baud--> WaitingForBootPrompt
//! WaitingForBootPrompt --autoboot banner, send magic--> BootloaderReady
//! BootloaderReady --boot command, reopen @ OS baud--> WaitingForOsPrompt
//! WaitingForOsPrompt --module banner, newline, shell banner--> OsReady
//! BootloaderReady | OsReady --reboot command--> WaitingForBootPrompt
//! ```
//!
//! Commands are accepted only while the session sits in the stage the
//! caller last established with [`Session::ensure_stage`]. A transport
//! error at any point closes the port and drops the stage to
//! `Disconnected`; the session never retries on its own.
//!
//! A disconnect does not reset the board. When the session last left the
//! DUT in its OS shell, reaching the bootloader again first checks for that
//! shell at the OS baud rate and reboots out of it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::port::{DEFAULT_READ_TIMEOUT, Port, SerialBackend, SerialConfig};
use crate::protocol::dispatcher::{
    Command, DispatchTiming, Dispatcher, Exchange, Expect, InterruptCheck,
};
use crate::transcript::{Recorder, Sink, Transcript};

/// Baud rate of the bootloader console.
pub const DEFAULT_BOOT_BAUD: u32 = 115_200;
/// Baud rate of the OS shell console.
pub const DEFAULT_OS_BAUD: u32 = 921_600;
/// Pause after opening the port before anything is read.
pub const DEFAULT_CONNECT_SETTLE: Duration = Duration::from_millis(500);
/// Banner printed while the bootloader counts down to unattended boot.
pub const DEFAULT_AUTOBOOT_BANNER: &str = "Hit any key to stop autoboot";
/// Written to abort the autoboot countdown.
pub const DEFAULT_INTERRUPT_MAGIC: &str = "sss";
/// Bootloader command prompt.
pub const DEFAULT_BOOTLOADER_PROMPT: &str = "=>";
/// Printed once the OS has finished loading its drivers.
pub const DEFAULT_MODULE_BANNER: &str = "done loading kernel modules";
/// Printed when the OS shell becomes interactive.
pub const DEFAULT_SHELL_BANNER: &str = "built-in shell";
/// Prompt of an idle OS shell.
pub const DEFAULT_SHELL_PROMPT: &str = "# ";

/// Which console the DUT is presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BootStage {
    /// No open port.
    #[default]
    Disconnected,
    /// Port open at the bootloader baud rate, countdown not yet interrupted.
    WaitingForBootPrompt,
    /// Bootloader prompt accepting commands.
    BootloaderReady,
    /// Boot command issued, OS still coming up.
    WaitingForOsPrompt,
    /// OS shell accepting commands.
    OsReady,
}

impl BootStage {
    /// Whether commands can be issued in this stage.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::BootloaderReady | Self::OsReady)
    }
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::WaitingForBootPrompt => "waiting for autoboot banner",
            Self::BootloaderReady => "bootloader prompt",
            Self::WaitingForOsPrompt => "booting to OS shell",
            Self::OsReady => "OS shell",
        };
        f.write_str(name)
    }
}

/// Callback invoked on every boot-stage change.
pub type StageObserver = Box<dyn FnMut(BootStage) + Send>;

/// Session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Port name/path.
    pub port: String,
    /// Baud rate while the DUT sits in the bootloader.
    pub boot_baud: u32,
    /// Baud rate once the OS shell is up.
    pub os_baud: u32,
    /// Per-call read timeout of the port.
    pub read_timeout: Duration,
    /// Pause after every open before reading.
    pub connect_settle: Duration,
    /// Autoboot countdown banner.
    pub autoboot_banner: String,
    /// Countdown interrupt payload.
    pub interrupt_magic: String,
    /// Bootloader prompt.
    pub bootloader_prompt: String,
    /// How long a bare newline is given to produce the bootloader prompt.
    pub prompt_probe_window: Duration,
    /// How long to watch for the autoboot banner.
    pub boot_prompt_window: Duration,
    /// Hands control from the bootloader to the OS.
    pub boot_command: String,
    /// Reboot command at the bootloader prompt.
    pub bootloader_reboot_command: String,
    /// Reboot command at the OS shell.
    pub os_reboot_command: String,
    /// Module-load-complete banner.
    pub module_banner: String,
    /// Wait for the module banner.
    pub module_timeout: Duration,
    /// Shell-ready banner.
    pub shell_banner: String,
    /// Wait for the shell banner.
    pub shell_timeout: Duration,
    /// Prompt an already running shell answers a newline with.
    pub shell_prompt: String,
    /// Dispatcher timing.
    pub dispatch: DispatchTiming,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            boot_baud: DEFAULT_BOOT_BAUD,
            os_baud: DEFAULT_OS_BAUD,
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_settle: DEFAULT_CONNECT_SETTLE,
            autoboot_banner: DEFAULT_AUTOBOOT_BANNER.to_string(),
            interrupt_magic: DEFAULT_INTERRUPT_MAGIC.to_string(),
            bootloader_prompt: DEFAULT_BOOTLOADER_PROMPT.to_string(),
            prompt_probe_window: Duration::from_secs(1),
            boot_prompt_window: Duration::from_secs(10),
            boot_command: "boot".to_string(),
            bootloader_reboot_command: "reset".to_string(),
            os_reboot_command: "reboot".to_string(),
            module_banner: DEFAULT_MODULE_BANNER.to_string(),
            module_timeout: Duration::from_secs(180),
            shell_banner: DEFAULT_SHELL_BANNER.to_string(),
            shell_timeout: Duration::from_secs(10),
            shell_prompt: DEFAULT_SHELL_PROMPT.to_string(),
            dispatch: DispatchTiming::default(),
        }
    }
}

impl SessionConfig {
    /// Configuration for `port` with default timing.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    /// Set the bootloader baud rate.
    #[must_use]
    pub fn with_boot_baud(mut self, baud: u32) -> Self {
        self.boot_baud = baud;
        self
    }

    /// Set the OS shell baud rate.
    #[must_use]
    pub fn with_os_baud(mut self, baud: u32) -> Self {
        self.os_baud = baud;
        self
    }

    /// Set the module banner timeout.
    #[must_use]
    pub fn with_module_timeout(mut self, timeout: Duration) -> Self {
        self.module_timeout = timeout;
        self
    }

    /// Set the dispatcher timing.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: DispatchTiming) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// One DUT connection and its boot stage.
pub struct Session {
    backend: Arc<dyn SerialBackend>,
    config: SessionConfig,
    dispatcher: Dispatcher,
    port: Option<Box<dyn Port>>,
    stage: BootStage,
    target: BootStage,
    last_ready: Option<BootStage>,
    last_error: Option<String>,
    recorder: Recorder,
    observer: Option<StageObserver>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("port", &self.config.port)
            .field("baud", &self.baud_rate())
            .field("stage", &self.stage)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a disconnected session.
    pub fn new(backend: Arc<dyn SerialBackend>, config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        let dispatcher = Dispatcher::new(clock, config.dispatch.clone());
        Self {
            backend,
            config,
            dispatcher,
            port: None,
            stage: BootStage::Disconnected,
            target: BootStage::BootloaderReady,
            last_ready: None,
            last_error: None,
            recorder: Recorder::default(),
            observer: None,
        }
    }

    /// Session on the host's serial ports and the wall clock.
    #[cfg(feature = "native")]
    pub fn native(config: SessionConfig) -> Self {
        Self::new(
            Arc::new(crate::port::NativeBackend),
            config,
            Arc::new(crate::clock::SystemClock),
        )
    }

    /// Forward transcript and status lines to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Sink) -> Self {
        self.recorder.set_sink(Some(sink));
        self
    }

    /// Replace the progress sink.
    pub fn set_sink(&mut self, sink: Option<Sink>) {
        self.recorder.set_sink(sink);
    }

    /// Stop long waits early once `check` returns `true`.
    ///
    /// Waits in progress fail with [`Error::Interrupted`].
    pub fn set_interrupt(&mut self, check: InterruptCheck) {
        self.dispatcher.set_interrupt(check);
    }

    /// Whether the host asked the run to stop.
    pub fn interrupted(&self) -> bool {
        self.dispatcher.check_interrupt().is_err()
    }

    /// Register a boot-stage observer.
    pub fn on_stage_change(&mut self, observer: StageObserver) {
        self.observer = Some(observer);
    }

    /// Current boot stage.
    pub fn stage(&self) -> BootStage {
        self.stage
    }

    /// Whether a port is open.
    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    /// Baud rate of the open port.
    pub fn baud_rate(&self) -> Option<u32> {
        self.port.as_ref().map(|p| p.baud_rate())
    }

    /// Last error that cost the session its port.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Session parameters.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Time source.
    pub fn clock(&self) -> &dyn Clock {
        self.dispatcher.clock()
    }

    /// Output received so far in this run.
    pub fn transcript(&self) -> &Transcript {
        self.recorder.transcript()
    }

    /// Take the transcript, starting a fresh one.
    pub fn take_transcript(&mut self) -> Transcript {
        self.recorder.take_transcript()
    }

    /// Open the port at the bootloader baud rate.
    ///
    /// A no-op while already connected.
    pub fn connect(&mut self) -> Result<()> {
        if self.port.is_some() {
            debug!("{} already open", self.config.port);
            return Ok(());
        }
        self.open_at(self.config.boot_baud)?;
        self.set_stage(BootStage::WaitingForBootPrompt);
        Ok(())
    }

    /// Close the port. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.close() {
                warn!("Closing {} failed: {e}", port.name());
            }
            info!("Disconnected from {}", self.config.port);
        }
        self.set_stage(BootStage::Disconnected);
    }

    /// Close and reopen at `baud`, keeping the boot stage.
    pub fn reopen(&mut self, baud: u32) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.close() {
                warn!("Closing {} failed: {e}", port.name());
            }
        }
        self.open_at(baud).inspect_err(|_| self.set_stage(BootStage::Disconnected))
    }

    fn open_at(&mut self, baud: u32) -> Result<()> {
        let serial = SerialConfig::new(&self.config.port, baud).with_timeout(self.config.read_timeout);
        let mut port = match self.backend.open(&serial) {
            Ok(port) => port,
            Err(e) => {
                self.last_error = Some(e.to_string());
                return Err(e);
            },
        };
        if let Err(e) = port.clear_buffers() {
            self.last_error = Some(e.to_string());
            let _ = port.close();
            return Err(e);
        }
        self.dispatcher.clock().sleep(self.config.connect_settle);
        info!("Connected to {} @ {baud}", self.config.port);
        self.recorder
            .note(&format!("Connected to {} at {baud} baud", self.config.port));
        self.port = Some(port);
        Ok(())
    }

    /// Watch for the autoboot banner and interrupt the countdown.
    ///
    /// Returns `false` when the banner did not show up within `window`; the
    /// session then stays in `WaitingForBootPrompt`.
    pub fn wait_for_bootloader(&mut self, window: Duration) -> Result<bool> {
        match self.stage {
            BootStage::BootloaderReady => return Ok(true),
            BootStage::WaitingForBootPrompt => {},
            actual => {
                return Err(Error::NotReady {
                    required: BootStage::WaitingForBootPrompt,
                    actual,
                });
            },
        }

        let banner = Expect::Contains(self.config.autoboot_banner.clone());
        let magic = self.config.interrupt_magic.clone();
        let seen = self.with_link(|port, dispatcher, recorder| {
            let exchange = dispatcher.wait_for(port, &banner, window, recorder)?;
            if exchange.matched {
                dispatcher.write_raw(port, magic.as_bytes())?;
            }
            Ok(exchange.matched)
        })?;

        if seen {
            self.recorder.note("U-Boot detected, autoboot stopped");
            self.set_stage(BootStage::BootloaderReady);
        } else {
            debug!("No autoboot banner within {window:?}");
        }
        Ok(seen)
    }

    /// Send a bare newline and look for the bootloader prompt.
    ///
    /// Catches a DUT that already sits at the prompt and will never print
    /// the autoboot banner again. A banner arriving during the probe is
    /// interrupted the same way [`Session::wait_for_bootloader`] does.
    pub fn probe_prompt(&mut self) -> Result<bool> {
        if self.stage == BootStage::BootloaderReady {
            return Ok(true);
        }
        if self.stage != BootStage::WaitingForBootPrompt {
            return Ok(false);
        }

        let banner = self.config.autoboot_banner.clone();
        let prompt_or_banner =
            Expect::AnyOf(vec![self.config.bootloader_prompt.clone(), banner.clone()]);
        let magic = self.config.interrupt_magic.clone();
        let window = self.config.prompt_probe_window;
        let seen = self.with_link(|port, dispatcher, recorder| {
            dispatcher.write_line(port, "")?;
            let exchange = dispatcher.wait_for(port, &prompt_or_banner, window, recorder)?;
            if exchange.matched && exchange.text().contains(&banner) {
                dispatcher.write_raw(port, magic.as_bytes())?;
            }
            Ok(exchange.matched)
        })?;

        if seen {
            self.set_stage(BootStage::BootloaderReady);
        }
        Ok(seen)
    }

    /// Send a bare newline at the OS baud rate and look for a running shell.
    ///
    /// On an answer the session is left in `OsReady` at the OS baud rate,
    /// ready for [`Session::reboot`]. Otherwise the port is back at the
    /// bootloader baud rate in `WaitingForBootPrompt`.
    fn detect_shell(&mut self) -> Result<bool> {
        let switch_baud = self.config.os_baud != self.config.boot_baud;
        if switch_baud {
            self.reopen(self.config.os_baud)?;
        }

        let shell = Expect::AnyOf(vec![
            self.config.shell_prompt.clone(),
            self.config.shell_banner.clone(),
        ]);
        let window = self.config.prompt_probe_window;
        let seen = self.with_link(|port, dispatcher, recorder| {
            dispatcher.write_line(port, "")?;
            Ok(dispatcher.wait_for(port, &shell, window, recorder)?.matched)
        })?;

        if seen {
            self.recorder.note("OS shell still running, rebooting");
            self.set_stage(BootStage::OsReady);
        } else if switch_baud {
            self.reopen(self.config.boot_baud)?;
        }
        Ok(seen)
    }

    /// Reach the bootloader prompt from whatever stage the session is in.
    ///
    /// After a reconnect the DUT may still be in its OS shell, which never
    /// prints the bootloader prompt. The shell is checked first when the
    /// session last reached `OsReady`, and as a fallback once neither the
    /// prompt nor the autoboot banner showed up.
    pub fn ensure_bootloader(&mut self) -> Result<()> {
        let reconnected = match self.stage {
            BootStage::BootloaderReady => return Ok(()),
            BootStage::Disconnected => {
                self.connect()?;
                true
            },
            BootStage::OsReady | BootStage::WaitingForOsPrompt => {
                self.reboot()?;
                false
            },
            BootStage::WaitingForBootPrompt => false,
        };

        let mut shell_checked = false;
        if reconnected && self.last_ready == Some(BootStage::OsReady) {
            shell_checked = true;
            if self.detect_shell()? {
                self.reboot()?;
            }
        }

        if self.probe_prompt()? || self.wait_for_bootloader(self.config.boot_prompt_window)? {
            return Ok(());
        }

        if reconnected && !shell_checked && self.detect_shell()? {
            self.reboot()?;
            if self.wait_for_bootloader(self.config.boot_prompt_window)? {
                return Ok(());
            }
        }
        Err(Error::Timeout(format!(
            "'{}' not seen within {} seconds",
            self.config.autoboot_banner,
            self.config.boot_prompt_window.as_secs()
        )))
    }

    /// Hand off from the bootloader to the OS and wait for its shell.
    pub fn boot_os(&mut self) -> Result<()> {
        if self.stage != BootStage::BootloaderReady {
            return Err(Error::NotReady {
                required: BootStage::BootloaderReady,
                actual: self.stage,
            });
        }

        info!("Booting {} to the OS shell", self.config.port);
        let boot = self.config.boot_command.clone();
        self.with_link(|port, dispatcher, _| dispatcher.write_line(port, &boot))?;
        self.set_stage(BootStage::WaitingForOsPrompt);

        if self.config.os_baud != self.config.boot_baud {
            self.reopen(self.config.os_baud)?;
        }

        let module = Expect::Contains(self.config.module_banner.clone());
        let module_timeout = self.config.module_timeout;
        self.recorder.note(&format!(
            "Waiting for '{}' (up to {} seconds)...",
            self.config.module_banner,
            module_timeout.as_secs()
        ));
        let module_output = self.wait_banner(&module, module_timeout)?;
        let Some(module_output) = module_output else {
            return Err(Error::Timeout(format!(
                "'{}' not seen within {} seconds",
                self.config.module_banner,
                module_timeout.as_secs()
            )));
        };

        let shell_banner = self.config.shell_banner.clone();
        if !module_output.contains(&shell_banner) {
            let shell = Expect::Contains(shell_banner);
            let shell_timeout = self.config.shell_timeout;
            self.with_link(|port, dispatcher, _| dispatcher.write_line(port, ""))?;
            if self.wait_banner(&shell, shell_timeout)?.is_none() {
                return Err(Error::Timeout(format!(
                    "'{}' not seen within {} seconds",
                    self.config.shell_banner,
                    shell_timeout.as_secs()
                )));
            }
        }

        self.set_stage(BootStage::OsReady);
        Ok(())
    }

    /// Reach the OS shell, booting through the bootloader when needed.
    pub fn ensure_os(&mut self) -> Result<()> {
        if self.stage == BootStage::OsReady {
            return Ok(());
        }
        self.ensure_bootloader()?;
        self.boot_os()
    }

    /// Reach `required` and accept commands only in that stage afterwards.
    pub fn ensure_stage(&mut self, required: BootStage) -> Result<()> {
        match required {
            BootStage::BootloaderReady => self.ensure_bootloader()?,
            BootStage::OsReady => self.ensure_os()?,
            other => {
                return Err(Error::Config(format!("'{other}' is not a command stage")));
            },
        }
        self.target = required;
        Ok(())
    }

    /// Reboot the DUT back to its autoboot countdown.
    ///
    /// Leaves the session in `WaitingForBootPrompt`, reopened at the
    /// bootloader baud rate.
    pub fn reboot(&mut self) -> Result<()> {
        let command = match self.stage {
            BootStage::BootloaderReady => self.config.bootloader_reboot_command.clone(),
            BootStage::OsReady | BootStage::WaitingForOsPrompt => {
                self.config.os_reboot_command.clone()
            },
            actual => {
                return Err(Error::NotReady {
                    required: BootStage::BootloaderReady,
                    actual,
                });
            },
        };

        info!("Rebooting {} with '{command}'", self.config.port);
        self.with_link(|port, dispatcher, _| dispatcher.write_line(port, &command))?;
        self.set_stage(BootStage::WaitingForBootPrompt);

        if self.baud_rate() != Some(self.config.boot_baud) {
            self.reopen(self.config.boot_baud)?;
        }
        Ok(())
    }

    /// Fire a setup command and drain its output.
    pub fn send_quick(&mut self, command: &str) -> Result<Vec<u8>> {
        self.require_target()?;
        self.with_link(|port, dispatcher, recorder| dispatcher.send_quick(port, command, recorder))
    }

    /// Send a command and wait for its expected output.
    pub fn send_and_wait(&mut self, command: &Command) -> Result<Exchange> {
        self.require_target()?;
        self.with_link(|port, dispatcher, recorder| {
            dispatcher.send_and_wait(port, command, recorder)
        })
    }

    /// Issue a command according to its send mode.
    pub fn issue(&mut self, command: &Command) -> Result<Exchange> {
        self.require_target()?;
        self.with_link(|port, dispatcher, recorder| dispatcher.issue(port, command, recorder))
    }

    /// Write a line without waiting for anything.
    pub fn write_line(&mut self, text: &str) -> Result<()> {
        self.require_target()?;
        self.with_link(|port, dispatcher, _| dispatcher.write_line(port, text))
    }

    /// Write raw bytes without a terminator.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.require_target()?;
        self.with_link(|port, dispatcher, _| dispatcher.write_raw(port, bytes))
    }

    /// Read whatever is buffered right now.
    pub fn read_pending(&mut self) -> Result<Vec<u8>> {
        self.require_target()?;
        self.with_link(|port, dispatcher, recorder| dispatcher.read_pending(port, recorder))
    }

    /// Collect output for a fixed window.
    pub fn capture(&mut self, window: Duration) -> Result<Vec<u8>> {
        self.require_target()?;
        self.with_link(|port, dispatcher, recorder| dispatcher.capture(port, window, recorder))
    }

    /// Sleep on the session clock.
    pub fn sleep(&self, duration: Duration) {
        self.dispatcher.clock().sleep(duration);
    }

    /// Sleep `seconds` whole seconds, logging one "Wait N seconds" line each.
    ///
    /// Fails with [`Error::Interrupted`] at the next second boundary once
    /// the host asks the run to stop.
    pub fn countdown(&mut self, seconds: u64) -> Result<()> {
        for left in (1..=seconds).rev() {
            self.dispatcher.check_interrupt()?;
            self.recorder.note(&format!("Wait {left} seconds"));
            self.dispatcher.clock().sleep(Duration::from_secs(1));
        }
        Ok(())
    }

    /// Send a status line to the progress sink.
    pub fn note(&mut self, message: &str) {
        self.recorder.note(message);
    }

    /// Wait for `banner`; returns the output seen up to the match.
    fn wait_banner(&mut self, banner: &Expect, timeout: Duration) -> Result<Option<String>> {
        self.with_link(|port, dispatcher, recorder| {
            let exchange = dispatcher.wait_for(port, banner, timeout, recorder)?;
            Ok(exchange.matched.then(|| exchange.text()))
        })
    }

    fn require_target(&self) -> Result<()> {
        if self.stage == self.target {
            Ok(())
        } else {
            Err(Error::NotReady {
                required: self.target,
                actual: self.stage,
            })
        }
    }

    /// Run `op` on the open port; transport loss drops the session.
    fn with_link<T>(
        &mut self,
        op: impl FnOnce(&mut dyn Port, &Dispatcher, &mut Recorder) -> Result<T>,
    ) -> Result<T> {
        let Some(port) = self.port.as_deref_mut() else {
            return Err(Error::TransportDropped(format!(
                "{} is not open",
                self.config.port
            )));
        };

        match op(port, &self.dispatcher, &mut self.recorder) {
            Err(e) if e.is_transport_loss() => {
                self.drop_transport(&e);
                Err(Error::TransportDropped(e.to_string()))
            },
            other => other,
        }
    }

    fn drop_transport(&mut self, cause: &Error) {
        warn!("Lost {}: {cause}", self.config.port);
        self.last_error = Some(cause.to_string());
        if let Some(mut port) = self.port.take() {
            let _ = port.close();
        }
        self.set_stage(BootStage::Disconnected);
    }

    fn set_stage(&mut self, stage: BootStage) {
        if self.stage == stage {
            return;
        }
        info!("{}: {} -> {}", self.config.port, self.stage, stage);
        self.stage = stage;
        if stage.is_ready() {
            self.last_ready = Some(stage);
        }
        if let Some(observer) = self.observer.as_mut() {
            observer(stage);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut port) = self.port.take() {
            let _ = port.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::port::mock::ScriptedDevice;
    use std::sync::Mutex;

    const BANNER: &str = "Hit any key to stop autoboot:  3 \r\n";

    fn session() -> (Arc<ManualClock>, ScriptedDevice, Session) {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        let session = Session::new(
            device.backend(),
            SessionConfig::new("/dev/ttyUSB0"),
            clock.clone(),
        );
        (clock, device, session)
    }

    #[test]
    fn test_connect_opens_at_boot_baud() {
        let (_clock, device, mut session) = session();
        session.connect().unwrap();
        assert_eq!(session.stage(), BootStage::WaitingForBootPrompt);
        assert_eq!(device.opens(), vec![("/dev/ttyUSB0".to_string(), DEFAULT_BOOT_BAUD)]);
    }

    #[test]
    fn test_connect_failure_stays_disconnected() {
        let (_clock, device, mut session) = session();
        device.set_unavailable(true);
        assert!(matches!(session.connect(), Err(Error::PortUnavailable { .. })));
        assert_eq!(session.stage(), BootStage::Disconnected);
        assert!(session.last_error().is_some());
    }

    #[test]
    fn test_disconnect_twice_is_harmless() {
        let (_clock, _device, mut session) = session();
        session.connect().unwrap();
        session.disconnect();
        session.disconnect();
        assert_eq!(session.stage(), BootStage::Disconnected);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_autoboot_banner_reaches_bootloader_and_reboot_returns_to_waiting() {
        let (_clock, device, mut session) = session();
        device.emit_at(Duration::from_secs(2), BANNER);

        session.connect().unwrap();
        assert!(session.wait_for_bootloader(Duration::from_secs(5)).unwrap());
        assert_eq!(session.stage(), BootStage::BootloaderReady);
        assert!(device.written_text().contains(DEFAULT_INTERRUPT_MAGIC));

        session.reboot().unwrap();
        assert_eq!(session.stage(), BootStage::WaitingForBootPrompt);
        assert!(device.written_text().ends_with("reset\r\n"));
    }

    #[test]
    fn test_missing_banner_keeps_waiting_stage() {
        let (clock, _device, mut session) = session();
        session.connect().unwrap();
        let before = clock.elapsed();
        assert!(!session.wait_for_bootloader(Duration::from_secs(3)).unwrap());
        assert_eq!(clock.elapsed() - before, Duration::from_secs(3));
        assert_eq!(session.stage(), BootStage::WaitingForBootPrompt);
    }

    #[test]
    fn test_probe_finds_idle_prompt() {
        let (_clock, device, mut session) = session();
        device.on_write("\r\n", "\r\n=> ");
        session.ensure_stage(BootStage::BootloaderReady).unwrap();
        assert_eq!(session.stage(), BootStage::BootloaderReady);
    }

    #[test]
    fn test_boot_os_switches_baud_and_waits_for_both_banners() {
        let (_clock, device, mut session) = session();
        device.emit_at(Duration::from_secs(2), BANNER);

        let stages = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&stages);
        session.on_stage_change(Box::new(move |stage| seen.lock().unwrap().push(stage)));
        session.ensure_stage(BootStage::BootloaderReady).unwrap();

        device.on_write_after(
            "boot",
            Duration::from_secs(20),
            "Starting kernel ...\r\n[   12.1] done loading kernel modules\r\n",
        );
        device.on_exact_write_once("\r\n", "BusyBox v1.31.1 built-in shell (ash)\r\n# ");

        session.ensure_stage(BootStage::OsReady).unwrap();
        assert_eq!(session.stage(), BootStage::OsReady);
        assert_eq!(session.baud_rate(), Some(DEFAULT_OS_BAUD));
        assert_eq!(
            *stages.lock().unwrap(),
            vec![
                BootStage::WaitingForBootPrompt,
                BootStage::BootloaderReady,
                BootStage::WaitingForOsPrompt,
                BootStage::OsReady,
            ]
        );
        assert_eq!(
            device.opens().last(),
            Some(&("/dev/ttyUSB0".to_string(), DEFAULT_OS_BAUD))
        );

        session.reboot().unwrap();
        assert_eq!(session.stage(), BootStage::WaitingForBootPrompt);
        assert_eq!(session.baud_rate(), Some(DEFAULT_BOOT_BAUD));
        assert!(device.written_text().ends_with("reboot\r\n"));
    }

    #[test]
    fn test_shell_banner_in_module_output_skips_second_wait() {
        let (clock, device, mut session) = session();
        device.emit_at(Duration::from_secs(1), BANNER);
        session.ensure_stage(BootStage::BootloaderReady).unwrap();
        device.on_write_after(
            "boot",
            Duration::from_secs(5),
            "done loading kernel modules\r\nBusyBox v1.31.1 built-in shell (ash)\r\n",
        );

        let before = clock.elapsed();
        session.boot_os().unwrap();
        assert_eq!(session.stage(), BootStage::OsReady);
        assert!(clock.elapsed() - before < Duration::from_secs(6));
    }

    #[test]
    fn test_module_banner_timeout_is_error() {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        device.emit_at(Duration::from_secs(1), BANNER);
        let config = SessionConfig::new("/dev/ttyUSB0").with_module_timeout(Duration::from_secs(5));
        let mut session = Session::new(device.backend(), config, clock.clone());

        session.ensure_bootloader().unwrap();
        let before = clock.elapsed();
        assert!(matches!(session.boot_os(), Err(Error::Timeout(_))));
        assert!(clock.elapsed() - before >= Duration::from_secs(5));
        assert_eq!(session.stage(), BootStage::WaitingForOsPrompt);
    }

    #[test]
    fn test_commands_rejected_outside_target_stage() {
        let (_clock, _device, mut session) = session();
        session.connect().unwrap();
        match session.send_quick("usb start") {
            Err(Error::NotReady { required, actual }) => {
                assert_eq!(required, BootStage::BootloaderReady);
                assert_eq!(actual, BootStage::WaitingForBootPrompt);
            },
            other => panic!("expected NotReady, got {other:?}"),
        }
    }

    #[test]
    fn test_unplug_drops_to_disconnected() {
        let (_clock, device, mut session) = session();
        device.emit_at(Duration::from_secs(1), BANNER);
        session.connect().unwrap();
        session.ensure_bootloader().unwrap();

        device.unplug();
        let err = session.send_quick("version").unwrap_err();
        assert!(matches!(err, Error::TransportDropped(_)));
        assert_eq!(session.stage(), BootStage::Disconnected);
        assert!(!session.is_connected());
    }

    /// Session at the OS shell, the way a finished OS-stage test leaves it.
    fn booted(clock: &Arc<ManualClock>, device: &ScriptedDevice) -> Session {
        device.emit_at(Duration::from_secs(1), BANNER);
        device.on_write_after("boot", Duration::from_secs(20), "done loading kernel modules\r\n");
        device.on_exact_write_once_at(
            DEFAULT_OS_BAUD,
            "\r\n",
            "BusyBox v1.31.1 built-in shell (ash)\r\n# ",
        );
        let mut session = Session::new(
            device.backend(),
            SessionConfig::new("/dev/ttyUSB0"),
            clock.clone(),
        );
        session.ensure_stage(BootStage::OsReady).unwrap();
        session
    }

    #[test]
    fn test_reconnect_from_shell_reboots_to_bootloader() {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        let mut session = booted(&clock, &device);
        session.disconnect();

        device.on_exact_write_once_at(DEFAULT_OS_BAUD, "\r\n", "\r\n# ");
        device.on_write_after("reboot", Duration::from_secs(3), BANNER);
        session.ensure_stage(BootStage::BootloaderReady).unwrap();

        assert_eq!(session.stage(), BootStage::BootloaderReady);
        assert_eq!(session.baud_rate(), Some(DEFAULT_BOOT_BAUD));
        assert!(device.written_text().contains("reboot\r\n"));
        let opens: Vec<u32> = device.opens().into_iter().map(|(_, baud)| baud).collect();
        assert_eq!(
            opens[opens.len() - 3..],
            [DEFAULT_BOOT_BAUD, DEFAULT_OS_BAUD, DEFAULT_BOOT_BAUD]
        );
    }

    #[test]
    fn test_fresh_session_finds_running_shell_after_bootloader_wait() {
        let (clock, device, mut session) = session();
        device.on_exact_write_once_at(DEFAULT_OS_BAUD, "\r\n", "\r\n# ");
        device.on_write_after("reboot", Duration::from_secs(3), BANNER);

        session.ensure_stage(BootStage::BootloaderReady).unwrap();
        assert_eq!(session.stage(), BootStage::BootloaderReady);
        assert!(device.written_text().contains("reboot\r\n"));
        assert!(clock.elapsed() > SessionConfig::default().boot_prompt_window);
    }

    #[test]
    fn test_reconnect_without_shell_still_times_out() {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        let mut session = booted(&clock, &device);
        session.disconnect();

        assert!(matches!(
            session.ensure_stage(BootStage::BootloaderReady),
            Err(Error::Timeout(_))
        ));
        assert!(!device.written_text().contains("reboot"));
        assert_eq!(session.stage(), BootStage::WaitingForBootPrompt);
    }

    #[test]
    fn test_clear_failure_on_open_is_recorded() {
        let (_clock, device, mut session) = session();
        device.set_clear_fails(true);

        assert!(matches!(session.connect(), Err(Error::Io(_))));
        assert_eq!(session.stage(), BootStage::Disconnected);
        assert!(!session.is_connected());
        assert!(session.last_error().unwrap().contains("purge rejected"));
    }

    #[test]
    fn test_countdown_stops_when_interrupted() {
        let (clock, _device, mut session) = session();
        let watched = Arc::clone(&clock);
        session.set_interrupt(Arc::new(move || watched.elapsed() >= Duration::from_secs(2)));
        assert!(!session.interrupted());

        assert!(matches!(session.countdown(10), Err(Error::Interrupted)));
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
        assert!(session.interrupted());
    }
}
