//! Auto-reconnect poller.
//!
//! [`AutoConnector`] watches for a USB-serial device with a fixed VID/PID.
//! It owns no thread and no timer: the host calls [`AutoConnector::tick`]
//! (or [`AutoConnector::periodic_check`]) every
//! [`AutoConnector::reconnect_interval`], always from the same thread and
//! never re-entrantly.
//!
//! Each iteration opens the device when it is absent. When it is present,
//! the iteration checks that it still answers and reports a disconnect
//! if it does not. [`AutoConnector::check_for_prompt`]
//! reports the first bootloader or shell prompt seen on each connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::port::{DEFAULT_READ_TIMEOUT, Port, SerialBackend, SerialConfig};
use crate::protocol::pattern;
use crate::session::DEFAULT_BOOT_BAUD;
use crate::transcript::decode_lossy;

/// Default delay between host-driven iterations.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// Pause between opening the port and flushing it.
const OPEN_SETTLE: Duration = Duration::from_millis(50);

/// Largest chunk read per prompt check.
const PROMPT_READ_CHUNK: usize = 1024;

/// Called with the freshly opened port.
pub type ConnectedCallback = Box<dyn FnMut(&mut dyn Port) + Send>;
/// Called once the port has been closed after a failed liveness check.
pub type DisconnectedCallback = Box<dyn FnMut() + Send>;
/// Called with the text that first matched a prompt pattern.
pub type PromptCallback = Box<dyn FnMut(&str) + Send>;

/// Poller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoConnectConfig {
    /// USB vendor ID to look for.
    pub vid: u16,
    /// USB product ID to look for.
    pub pid: u16,
    /// Baud rate to open at.
    pub baud_rate: u32,
    /// Per-call read timeout.
    pub read_timeout: Duration,
    /// Host timer period.
    pub reconnect_interval: Duration,
    /// Prompt patterns, matched case-insensitively.
    pub prompt_patterns: Vec<String>,
}

impl AutoConnectConfig {
    /// Settings for a device identity with the default timings and prompts.
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            baud_rate: DEFAULT_BOOT_BAUD,
            read_timeout: DEFAULT_READ_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            prompt_patterns: vec!["=>".into(), "U-Boot".into(), "uboot".into()],
        }
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the host timer period.
    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Replace the prompt patterns.
    #[must_use]
    pub fn with_prompt_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prompt_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }
}

/// Host-driven reconnect loop for one device identity.
pub struct AutoConnector {
    backend: Arc<dyn SerialBackend>,
    clock: Arc<dyn Clock>,
    config: AutoConnectConfig,
    prompt: Regex,
    on_connected: Option<ConnectedCallback>,
    on_disconnected: Option<DisconnectedCallback>,
    on_prompt: Option<PromptCallback>,
    port: Option<Box<dyn Port>>,
    last_port: Option<String>,
    seen_prompt: bool,
    running: bool,
}

impl fmt::Debug for AutoConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoConnector")
            .field("config", &self.config)
            .field("last_port", &self.last_port)
            .field("connected", &self.port.is_some())
            .field("seen_prompt", &self.seen_prompt)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl AutoConnector {
    /// Create a poller.
    ///
    /// Fails when the pattern list is empty or a pattern does not compile.
    pub fn new(
        backend: Arc<dyn SerialBackend>,
        config: AutoConnectConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.prompt_patterns.is_empty() {
            return Err(Error::Config("no prompt patterns configured".to_string()));
        }
        let alternation = config
            .prompt_patterns
            .iter()
            .map(|p| format!("(?:{p})"))
            .collect::<Vec<_>>()
            .join("|");
        let prompt = pattern::compile(&format!("(?i){alternation}"))?;

        Ok(Self {
            backend,
            clock,
            config,
            prompt,
            on_connected: None,
            on_disconnected: None,
            on_prompt: None,
            port: None,
            last_port: None,
            seen_prompt: false,
            running: false,
        })
    }

    /// Set the callback invoked after each successful open.
    #[must_use]
    pub fn on_connected(mut self, callback: impl FnMut(&mut dyn Port) + Send + 'static) -> Self {
        self.on_connected = Some(Box::new(callback));
        self
    }

    /// Set the callback invoked when an open port stops answering.
    #[must_use]
    pub fn on_disconnected(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        self.on_disconnected = Some(Box::new(callback));
        self
    }

    /// Set the callback invoked on the first prompt of a connection.
    #[must_use]
    pub fn on_prompt(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_prompt = Some(Box::new(callback));
        self
    }

    /// Delay the host should wait between iterations.
    pub fn reconnect_interval(&self) -> Duration {
        self.config.reconnect_interval
    }

    /// Whether a port is currently open.
    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    /// Whether [`AutoConnector::start`] was called without a later stop.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Name of the open port.
    pub fn last_port(&self) -> Option<&str> {
        self.last_port.as_deref()
    }

    /// The open port, if any.
    pub fn port_mut(&mut self) -> Option<&mut (dyn Port + 'static)> {
        self.port.as_deref_mut()
    }

    /// One non-blocking iteration.
    ///
    /// Without an open port, looks the device up by VID/PID and opens it.
    /// With one, checks it is alive and reports a disconnect otherwise.
    pub fn periodic_check(&mut self) {
        if self.port.is_none() && !self.connect() {
            return;
        }

        let alive = match self.port.as_mut() {
            Some(port) => port.bytes_waiting().map_err(|e| e.to_string()),
            None => return,
        };
        if let Err(e) = alive {
            info!("Serial port probably removed: {e}");
            self.handle_disconnect();
        }
    }

    /// Read what is buffered and report the first prompt of this connection.
    ///
    /// Returns `true` only for the read that first matched.
    pub fn check_for_prompt(&mut self) -> bool {
        let Some(port) = self.port.as_mut() else {
            return false;
        };

        let data = match port.read_available(PROMPT_READ_CHUNK) {
            Ok(data) => data,
            Err(e) => {
                warn!("Serial error while reading: {e}");
                self.handle_disconnect();
                return false;
            },
        };
        if data.is_empty() {
            return false;
        }

        let text = decode_lossy(&data);
        debug!("Serial read: {:?}", text.trim());
        if self.seen_prompt || !self.prompt.is_match(&text) {
            return false;
        }

        self.seen_prompt = true;
        info!(
            "Prompt detected on {}",
            self.last_port.as_deref().unwrap_or_default()
        );
        if let Some(callback) = self.on_prompt.as_mut() {
            callback(&text);
        }
        true
    }

    /// Arm the poller. Returns `false` if it was already running.
    pub fn start(&mut self) -> bool {
        if self.running {
            debug!("Polling already running");
            return false;
        }
        self.running = true;
        true
    }

    /// One host-timer iteration: [`AutoConnector::periodic_check`] followed by
    /// [`AutoConnector::check_for_prompt`].
    ///
    /// Returns `false` once stopped, telling the host not to reschedule.
    pub fn tick(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.periodic_check();
        self.check_for_prompt();
        true
    }

    /// Stop polling and close the port without invoking any callback.
    pub fn stop(&mut self) {
        self.running = false;
        self.close();
    }

    fn connect(&mut self) -> bool {
        let (vid, pid) = (self.config.vid, self.config.pid);
        let name = match self.backend.find_by_vid_pid(vid, pid) {
            Ok(found) => match found.into_iter().next() {
                Some(info) => info.name,
                None => {
                    debug!("No matching serial device found for VID:PID {vid:04x}:{pid:04x}");
                    return false;
                },
            },
            Err(e) => {
                debug!("Failed to enumerate serial ports: {e}");
                return false;
            },
        };
        info!("Found device {name} (vid:pid={vid:04x}:{pid:04x})");

        self.close();
        info!("Opening {name} @ {}", self.config.baud_rate);
        let config = SerialConfig::new(&name, self.config.baud_rate)
            .with_timeout(self.config.read_timeout);
        let mut port = match self.backend.open(&config) {
            Ok(port) => port,
            Err(e) => {
                warn!("Failed to open serial port {name}: {e}");
                return false;
            },
        };

        self.clock.sleep(OPEN_SETTLE);
        if let Err(e) = port.clear_buffers() {
            debug!("Could not flush {name}: {e}");
        }

        if let Some(callback) = self.on_connected.as_mut() {
            callback(port.as_mut());
        }
        self.port = Some(port);
        self.last_port = Some(name);
        self.seen_prompt = false;
        true
    }

    fn handle_disconnect(&mut self) {
        let was_connected = self.port.is_some();
        self.close();
        if was_connected {
            if let Some(callback) = self.on_disconnected.as_mut() {
                callback();
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.close() {
                debug!("Error closing {}: {e}", port.name());
            }
        }
        self.seen_prompt = false;
        self.last_port = None;
    }
}

impl Drop for AutoConnector {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::port::PortInfo;
    use crate::port::mock::ScriptedDevice;

    const VID: u16 = 0x0403;
    const PID: u16 = 0x6001;

    fn dut_port() -> PortInfo {
        PortInfo {
            name: "/dev/ttyUSB0".into(),
            vid: Some(VID),
            pid: Some(PID),
            ..Default::default()
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        device: ScriptedDevice,
        events: Arc<Mutex<Vec<String>>>,
        connector: AutoConnector,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        let events = Arc::new(Mutex::new(Vec::new()));

        let (connected, disconnected, prompt) = (
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
        );
        let connector = AutoConnector::new(
            device.backend(),
            AutoConnectConfig::new(VID, PID),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap()
        .on_connected(move |port| {
            connected
                .lock()
                .unwrap()
                .push(format!("connected {}", port.name()))
        })
        .on_disconnected(move || disconnected.lock().unwrap().push("disconnected".into()))
        .on_prompt(move |_| prompt.lock().unwrap().push("prompt".into()));

        Harness {
            clock,
            device,
            events,
            connector,
        }
    }

    #[test]
    fn test_no_device_calls_nothing() {
        let mut h = harness();
        h.device.set_ports(vec![PortInfo {
            name: "/dev/ttyS0".into(),
            ..Default::default()
        }]);

        h.connector.periodic_check();
        h.connector.periodic_check();
        assert!(!h.connector.is_connected());
        assert!(h.events.lock().unwrap().is_empty());
        assert!(h.device.opens().is_empty());
    }

    #[test]
    fn test_device_found_connects_once() {
        let mut h = harness();
        h.device.set_ports(vec![dut_port()]);

        h.connector.periodic_check();
        h.connector.periodic_check();
        assert!(h.connector.is_connected());
        assert_eq!(h.connector.last_port(), Some("/dev/ttyUSB0"));
        assert_eq!(h.device.opens(), vec![("/dev/ttyUSB0".to_string(), 115_200)]);
        assert_eq!(*h.events.lock().unwrap(), vec!["connected /dev/ttyUSB0"]);
    }

    #[test]
    fn test_unplug_reports_disconnect_then_waits() {
        let mut h = harness();
        h.device.set_ports(vec![dut_port()]);
        h.connector.periodic_check();

        h.device.unplug();
        h.connector.periodic_check();
        assert!(!h.connector.is_connected());

        // Still listed but unopenable: no further callbacks.
        h.connector.periodic_check();
        assert_eq!(
            *h.events.lock().unwrap(),
            vec!["connected /dev/ttyUSB0", "disconnected"]
        );
    }

    #[test]
    fn test_reconnects_after_failed_open() {
        let mut h = harness();
        h.device.set_ports(vec![dut_port()]);
        h.connector.periodic_check();

        h.device.unplug();
        h.connector.periodic_check();
        assert!(!h.connector.is_connected());

        h.device.replug();
        h.device.set_unavailable(true);
        h.connector.periodic_check();
        assert!(!h.connector.is_connected());
        assert_eq!(h.device.opens().len(), 1);

        h.device.set_unavailable(false);
        h.connector.periodic_check();
        assert!(h.connector.is_connected());
        assert_eq!(h.device.opens().len(), 2);
        assert_eq!(
            *h.events.lock().unwrap(),
            vec!["connected /dev/ttyUSB0", "disconnected", "connected /dev/ttyUSB0"]
        );
    }

    #[test]
    fn test_empty_prompt_patterns_rejected() {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        let config = AutoConnectConfig::new(VID, PID).with_prompt_patterns(Vec::<String>::new());
        assert!(matches!(
            AutoConnector::new(device.backend(), config, clock),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_prompt_reported_once_per_connection() {
        let mut h = harness();
        h.device.set_ports(vec![dut_port()]);
        h.device.emit_at(Duration::from_secs(1), "U-BOOT 2020.10\r\n=> ");
        h.device.emit_at(Duration::from_secs(2), "=> ");

        assert!(h.connector.start());
        assert!(!h.connector.start());
        assert!(h.connector.tick());
        h.clock.advance(Duration::from_secs(1));
        assert!(h.connector.tick());
        h.clock.advance(Duration::from_secs(1));
        assert!(!h.connector.check_for_prompt());

        let prompts = h
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "prompt")
            .count();
        assert_eq!(prompts, 1);
    }

    #[test]
    fn test_stop_closes_without_callbacks() {
        let mut h = harness();
        h.device.set_ports(vec![dut_port()]);
        h.connector.start();
        h.connector.tick();

        h.connector.stop();
        assert!(!h.connector.is_connected());
        assert!(!h.connector.tick());
        assert_eq!(*h.events.lock().unwrap(), vec!["connected /dev/ttyUSB0"]);
    }

    #[test]
    fn test_invalid_prompt_pattern_rejected() {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        let config = AutoConnectConfig::new(VID, PID).with_prompt_patterns(["(unclosed"]);
        assert!(AutoConnector::new(device.backend(), config, clock).is_err());
        assert_eq!(
            AutoConnectConfig::new(VID, PID).reconnect_interval,
            DEFAULT_RECONNECT_INTERVAL
        );
    }
}
