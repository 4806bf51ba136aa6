//! Scripted device used by unit tests.
//!
//! A [`ScriptedDevice`] plays the DUT side of the serial link on a simulated
//! timeline: output can be scheduled at fixed times, or emitted in reply to
//! a written command. Every port opened from its backend shares the same
//! device state, so closing and reopening at another baud rate continues the
//! same boot sequence.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, ManualClock};
use crate::error::{Error, Result};
use crate::port::{Port, PortInfo, SerialBackend, SerialConfig};

struct Rule {
    trigger: String,
    delay: Duration,
    reply: Vec<u8>,
    once: bool,
    exact: bool,
    unplug: bool,
    baud: Option<u32>,
}

impl Rule {
    fn matches(&self, written: &str, baud: u32) -> bool {
        if self.baud.is_some_and(|only| only != baud) {
            return false;
        }
        if self.exact {
            written == self.trigger
        } else {
            written.contains(&self.trigger)
        }
    }
}

#[derive(Default)]
struct DeviceState {
    timed: Vec<(Duration, Vec<u8>)>,
    rx: VecDeque<u8>,
    rules: Vec<Rule>,
    written: Vec<u8>,
    opens: Vec<(String, u32)>,
    unplugged: bool,
    unavailable: bool,
    clear_fails: bool,
    ports: Vec<PortInfo>,
}

impl DeviceState {
    fn release(&mut self, now: Duration) {
        self.timed.sort_by_key(|(due, _)| *due);
        while self.timed.first().is_some_and(|(due, _)| *due <= now) {
            let (_, chunk) = self.timed.remove(0);
            self.rx.extend(chunk);
        }
    }
}

/// Handle on the simulated DUT.
#[derive(Clone)]
pub(crate) struct ScriptedDevice {
    state: Arc<Mutex<DeviceState>>,
    clock: Arc<ManualClock>,
}

impl ScriptedDevice {
    pub(crate) fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::default())),
            clock,
        }
    }

    /// Emit `text` once simulated time reaches `at`.
    pub(crate) fn emit_at(&self, at: Duration, text: &str) -> &Self {
        self.emit_bytes_at(at, text.as_bytes())
    }

    pub(crate) fn emit_bytes_at(&self, at: Duration, bytes: &[u8]) -> &Self {
        self.state
            .lock()
            .unwrap()
            .timed
            .push((at, bytes.to_vec()));
        self
    }

    /// Reply to every write containing `trigger`.
    pub(crate) fn on_write(&self, trigger: &str, reply: &str) -> &Self {
        self.add_rule(trigger, Duration::ZERO, reply, false, false)
    }

    /// Reply to the next write containing `trigger` only.
    ///
    /// Once-rules queue up: a single write consumes at most one of them, in
    /// registration order.
    pub(crate) fn on_write_once(&self, trigger: &str, reply: &str) -> &Self {
        self.add_rule(trigger, Duration::ZERO, reply, true, false)
    }

    /// Like [`ScriptedDevice::on_write_once`], replying after `delay`.
    pub(crate) fn on_write_after(&self, trigger: &str, delay: Duration, reply: &str) -> &Self {
        self.add_rule(trigger, delay, reply, true, false)
    }

    /// Reply once to a write that is exactly `text`, such as a bare newline.
    pub(crate) fn on_exact_write_once(&self, text: &str, reply: &str) -> &Self {
        self.add_rule(text, Duration::ZERO, reply, true, true)
    }

    /// Like [`ScriptedDevice::on_exact_write_once`], but only for writes made
    /// at `baud`. Writes at any other rate are line noise to the DUT.
    pub(crate) fn on_exact_write_once_at(&self, baud: u32, text: &str, reply: &str) -> &Self {
        self.push_rule(Rule {
            trigger: text.to_string(),
            delay: Duration::ZERO,
            reply: reply.as_bytes().to_vec(),
            once: true,
            exact: true,
            unplug: false,
            baud: Some(baud),
        })
    }

    fn add_rule(&self, trigger: &str, delay: Duration, reply: &str, once: bool, exact: bool) -> &Self {
        self.push_rule(Rule {
            trigger: trigger.to_string(),
            delay,
            reply: reply.as_bytes().to_vec(),
            once,
            exact,
            unplug: false,
            baud: None,
        })
    }

    fn push_rule(&self, rule: Rule) -> &Self {
        self.state.lock().unwrap().rules.push(rule);
        self
    }

    /// Simulate USB removal right after a write containing `trigger`.
    pub(crate) fn unplug_on_write(&self, trigger: &str) -> &Self {
        self.push_rule(Rule {
            trigger: trigger.to_string(),
            delay: Duration::ZERO,
            reply: Vec::new(),
            once: true,
            exact: false,
            unplug: true,
            baud: None,
        })
    }

    /// Everything the host wrote so far, decoded leniently.
    pub(crate) fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().unwrap().written).into_owned()
    }

    /// `(port, baud)` of every successful open.
    pub(crate) fn opens(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().opens.clone()
    }

    /// Simulate USB removal: every subsequent port operation fails.
    pub(crate) fn unplug(&self) {
        self.state.lock().unwrap().unplugged = true;
    }

    /// Undo [`ScriptedDevice::unplug`]; ports opened afterwards work again.
    pub(crate) fn replug(&self) {
        self.state.lock().unwrap().unplugged = false;
    }

    /// Make subsequent `open` calls fail.
    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Make `clear_buffers` fail on every port, as a wedged driver does.
    pub(crate) fn set_clear_fails(&self, fails: bool) {
        self.state.lock().unwrap().clear_fails = fails;
    }

    /// Ports reported by the backend's enumeration.
    pub(crate) fn set_ports(&self, ports: Vec<PortInfo>) {
        self.state.lock().unwrap().ports = ports;
    }

    pub(crate) fn backend(&self) -> Arc<ScriptedBackend> {
        Arc::new(ScriptedBackend {
            device: self.clone(),
        })
    }

    fn now(&self) -> Duration {
        self.clock.elapsed()
    }
}

pub(crate) struct ScriptedBackend {
    device: ScriptedDevice,
}

impl SerialBackend for ScriptedBackend {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        let mut state = self.device.state.lock().unwrap();
        if state.unavailable || state.unplugged {
            return Err(Error::PortUnavailable {
                port: config.port_name.clone(),
                reason: "device node busy".into(),
            });
        }
        state
            .opens
            .push((config.port_name.clone(), config.baud_rate));
        Ok(Box::new(ScriptedPort {
            device: self.device.clone(),
            name: config.port_name.clone(),
            baud_rate: config.baud_rate,
            timeout: config.timeout,
            open: true,
        }))
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.device.state.lock().unwrap().ports.clone())
    }
}

pub(crate) struct ScriptedPort {
    device: ScriptedDevice,
    name: String,
    baud_rate: u32,
    timeout: Duration,
    open: bool,
}

impl ScriptedPort {
    fn check(&self) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        if self.device.state.lock().unwrap().unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device removed"));
        }
        Ok(())
    }
}

impl Port for ScriptedPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        self.check()?;
        let now = self.device.now();
        let mut state = self.device.state.lock().unwrap();
        state.release(now);
        Ok(state.rx.len())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.check()?;
        let now = self.device.now();
        let mut state = self.device.state.lock().unwrap();
        if state.clear_fails {
            return Err(Error::Io(io::Error::other("purge rejected by driver")));
        }
        state.release(now);
        state.rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        let now = self.device.now();
        let mut state = self.device.state.lock().unwrap();
        state.release(now);
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        let now = self.device.now();
        let mut state = self.device.state.lock().unwrap();
        state.written.extend_from_slice(buf);

        let text = String::from_utf8_lossy(buf).into_owned();
        let baud = self.baud_rate;
        let mut fired = Vec::new();
        let mut unplug = false;
        let mut once_fired = false;
        state.rules.retain(|rule| {
            if !rule.matches(&text, baud) || (rule.once && once_fired) {
                return true;
            }
            fired.push((now + rule.delay, rule.reply.clone()));
            unplug |= rule.unplug;
            if rule.once {
                once_fired = true;
            }
            !rule.once
        });
        state.timed.extend(fired);
        state.release(now);
        state.unplugged |= unplug;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_output_released_with_clock() {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        device.emit_at(Duration::from_secs(1), "hello");
        let backend = device.backend();
        let mut port = backend
            .open(&SerialConfig::new("/dev/ttyMOCK0", 115200))
            .unwrap();

        assert_eq!(port.bytes_waiting().unwrap(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(port.read_available(64).unwrap(), b"hello");
    }

    #[test]
    fn test_reply_rule_fires_on_write() {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        device.on_write_once("version", "v1.0\r\n");
        let backend = device.backend();
        let mut port = backend
            .open(&SerialConfig::new("/dev/ttyMOCK0", 115200))
            .unwrap();

        device.on_write_once("version", "v1.1\r\n");
        device.on_exact_write_once("\r\n", "=> ");

        port.write_all_bytes(b"version\r\n").unwrap();
        assert_eq!(port.read_available(64).unwrap(), b"v1.0\r\n");
        port.write_all_bytes(b"version\r\n").unwrap();
        assert_eq!(port.read_available(64).unwrap(), b"v1.1\r\n");
        port.write_all_bytes(b"version\r\n").unwrap();
        assert_eq!(port.read_available(64).unwrap(), b"");
        port.write_all_bytes(b"\r\n").unwrap();
        assert_eq!(port.read_available(64).unwrap(), b"=> ");
        assert_eq!(device.written_text(), "version\r\nversion\r\nversion\r\n\r\n");
    }

    #[test]
    fn test_baud_bound_rule_ignores_other_rates() {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        device.on_exact_write_once_at(921_600, "\r\n", "# ");
        let backend = device.backend();

        let mut slow = backend
            .open(&SerialConfig::new("/dev/ttyMOCK0", 115_200))
            .unwrap();
        slow.write_all_bytes(b"\r\n").unwrap();
        assert_eq!(slow.read_available(64).unwrap(), b"");

        let mut fast = backend
            .open(&SerialConfig::new("/dev/ttyMOCK0", 921_600))
            .unwrap();
        fast.write_all_bytes(b"\r\n").unwrap();
        assert_eq!(fast.read_available(64).unwrap(), b"# ");
    }
}
