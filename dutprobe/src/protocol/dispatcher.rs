//! Command dispatcher.
//!
//! Two primitives sit on top of a [`Port`]:
//!
//! - **quick-send**: write a command line, then drain whatever comes back for
//!   a short grace window. Used for setup commands whose output nobody checks.
//! - **send-and-wait**: clear the input buffer, write the command, then poll
//!   and accumulate output until the expected pattern shows up or the
//!   deadline passes.
//!
//! Matching always runs against the whole accumulated output, never just the
//! newest chunk: the DUT's byte stream splits at arbitrary points and a
//! banner may straddle two reads.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::transcript::{Recorder, decode_lossy};

/// ASCII ETX (Ctrl-C), stops a DUT-side process that keeps streaming.
pub const ETX: u8 = 0x03;

/// Line terminator appended to every command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Sleep between buffer polls in send-and-wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Pause after a quick-send write before draining starts.
pub const DEFAULT_QUICK_SETTLE: Duration = Duration::from_millis(100);

/// How long a quick-send keeps draining.
pub const DEFAULT_QUICK_GRACE: Duration = Duration::from_millis(100);

/// Sleep between drain reads inside the grace window.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound for a single buffered read.
const READ_CHUNK: usize = 64 * 1024;

/// How a command is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SendMode {
    /// Fire and drain, no result expected.
    #[default]
    Quick,
    /// Block until the expected output appears or the timeout elapses.
    WaitForMatch,
}

/// What the accumulated output must contain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Expect {
    /// Anything goes.
    #[default]
    Nothing,
    /// A single substring.
    Contains(String),
    /// Every substring in the list.
    AllOf(Vec<String>),
    /// At least one substring in the list.
    AnyOf(Vec<String>),
}

impl Expect {
    /// Check decoded output against the expectation.
    pub fn is_satisfied(&self, text: &str) -> bool {
        match self {
            Self::Nothing => true,
            Self::Contains(pattern) => text.contains(pattern.as_str()),
            Self::AllOf(patterns) => patterns.iter().all(|p| text.contains(p.as_str())),
            Self::AnyOf(patterns) => patterns.iter().any(|p| text.contains(p.as_str())),
        }
    }

    /// Human-readable form for log lines.
    pub fn describe(&self) -> String {
        match self {
            Self::Nothing => "<anything>".to_string(),
            Self::Contains(pattern) => format!("'{pattern}'"),
            Self::AllOf(patterns) => join_quoted(patterns, " + "),
            Self::AnyOf(patterns) => join_quoted(patterns, " | "),
        }
    }
}

fn join_quoted(patterns: &[String], separator: &str) -> String {
    patterns
        .iter()
        .map(|p| format!("'{p}'"))
        .collect::<Vec<_>>()
        .join(separator)
}

/// A command line plus how to judge its response. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Command {
    text: String,
    expect: Expect,
    timeout: Duration,
    mode: SendMode,
    abort_on_match: bool,
}

impl Command {
    /// A fire-and-forget setup command.
    pub fn quick(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expect: Expect::Nothing,
            timeout: Duration::ZERO,
            mode: SendMode::Quick,
            abort_on_match: false,
        }
    }

    /// Send `text` and wait up to `timeout` for `pattern`.
    pub fn wait_for(text: impl Into<String>, pattern: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            expect: Expect::Contains(pattern.into()),
            timeout,
            mode: SendMode::WaitForMatch,
            abort_on_match: false,
        }
    }

    /// Send `text` and wait up to `timeout` until every pattern has appeared.
    pub fn wait_for_all<I, S>(text: impl Into<String>, patterns: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            text: text.into(),
            expect: Expect::AllOf(patterns.into_iter().map(Into::into).collect()),
            timeout,
            mode: SendMode::WaitForMatch,
            abort_on_match: false,
        }
    }

    /// Send ETX once the expectation is met.
    #[must_use]
    pub fn with_abort(mut self) -> Self {
        self.abort_on_match = true;
        self
    }

    /// Command line, without terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Expected output.
    pub fn expect(&self) -> &Expect {
        &self.expect
    }

    /// Wait deadline for send-and-wait.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send mode.
    pub fn mode(&self) -> SendMode {
        self.mode
    }

    /// Whether ETX follows a satisfied wait.
    pub fn aborts_on_match(&self) -> bool {
        self.abort_on_match
    }
}

/// Result of one exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    /// Everything received while the exchange was in flight.
    pub output: Vec<u8>,
    /// Whether the expectation was met before the deadline.
    pub matched: bool,
    /// Time spent from write to return.
    pub elapsed: Duration,
}

impl Exchange {
    /// Output decoded leniently.
    pub fn text(&self) -> String {
        decode_lossy(&self.output)
    }
}

/// Dispatcher timing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DispatchTiming {
    /// Sleep between polls in send-and-wait.
    pub poll_interval: Duration,
    /// Pause between a quick-send write and draining.
    pub quick_settle: Duration,
    /// Length of the quick-send drain window.
    pub quick_grace: Duration,
    /// Sleep between drain reads.
    pub drain_interval: Duration,
    /// Appended to every command line.
    pub line_terminator: String,
}

impl Default for DispatchTiming {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            quick_settle: DEFAULT_QUICK_SETTLE,
            quick_grace: DEFAULT_QUICK_GRACE,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            line_terminator: LINE_TERMINATOR.to_string(),
        }
    }
}

/// Host-side stop request, polled by every wait loop.
pub type InterruptCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Issues commands over a port, one at a time.
///
/// The dispatcher holds no port itself; callers hand it the port for each
/// call, so exclusive ownership stays with the session.
#[derive(Clone)]
pub struct Dispatcher {
    clock: Arc<dyn Clock>,
    timing: DispatchTiming,
    interrupt: Option<InterruptCheck>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher on the given clock.
    pub fn new(clock: Arc<dyn Clock>, timing: DispatchTiming) -> Self {
        Self {
            clock,
            timing,
            interrupt: None,
        }
    }

    /// Poll `check` between reads; a `true` aborts the wait in progress.
    pub fn set_interrupt(&mut self, check: InterruptCheck) {
        self.interrupt = Some(check);
    }

    /// `Err(Interrupted)` once the host asked to stop.
    pub fn check_interrupt(&self) -> Result<()> {
        match &self.interrupt {
            Some(check) if check() => Err(Error::Interrupted),
            _ => Ok(()),
        }
    }

    /// The clock used for deadlines and sleeps.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Shared handle to the clock.
    pub fn clock_handle(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Timing in effect.
    pub fn timing(&self) -> &DispatchTiming {
        &self.timing
    }

    /// Write raw bytes, no terminator.
    pub fn write_raw(&self, port: &mut dyn Port, bytes: &[u8]) -> Result<()> {
        trace!("tx {} bytes: {:?}", bytes.len(), decode_lossy(bytes));
        port.write_all_bytes(bytes)
    }

    /// Write `text` followed by the line terminator.
    pub fn write_line(&self, port: &mut dyn Port, text: &str) -> Result<()> {
        let mut line = String::with_capacity(text.len() + self.timing.line_terminator.len());
        line.push_str(text);
        line.push_str(&self.timing.line_terminator);
        self.write_raw(port, line.as_bytes())
    }

    /// Read whatever is buffered right now and record it.
    pub fn read_pending(&self, port: &mut dyn Port, recorder: &mut Recorder) -> Result<Vec<u8>> {
        let chunk = port.read_available(READ_CHUNK)?;
        recorder.record(&chunk);
        Ok(chunk)
    }

    /// Keep reading for `window`, returning everything received.
    pub fn capture(
        &self,
        port: &mut dyn Port,
        window: Duration,
        recorder: &mut Recorder,
    ) -> Result<Vec<u8>> {
        let deadline = self.clock.now() + window;
        let mut output = Vec::new();
        loop {
            self.check_interrupt()?;
            output.extend(self.read_pending(port, recorder)?);
            let left = self.clock.remaining(deadline);
            if left.is_zero() {
                break;
            }
            self.clock.sleep(self.timing.drain_interval.min(left));
        }
        Ok(output)
    }

    /// Write a command and drain its output for the grace window.
    ///
    /// Best effort only: nothing is checked, the drained bytes are returned
    /// for logging.
    pub fn send_quick(
        &self,
        port: &mut dyn Port,
        command: &str,
        recorder: &mut Recorder,
    ) -> Result<Vec<u8>> {
        debug!("quick-send: {}", command.lines().next().unwrap_or_default());
        self.write_line(port, command)?;
        self.clock.sleep(self.timing.quick_settle);
        self.capture(port, self.timing.quick_grace, recorder)
    }

    /// Poll until the accumulated output satisfies `expect`, without writing.
    ///
    /// Returns `matched = true` as soon as the expectation holds, and
    /// `matched = false` once `timeout` has elapsed. Never reports a miss
    /// before the deadline.
    pub fn wait_for(
        &self,
        port: &mut dyn Port,
        expect: &Expect,
        timeout: Duration,
        recorder: &mut Recorder,
    ) -> Result<Exchange> {
        let start = self.clock.now();
        let deadline = start + timeout;
        let mut output = Vec::new();

        loop {
            self.check_interrupt()?;
            let chunk = self.read_pending(port, recorder)?;
            if !chunk.is_empty() {
                output.extend_from_slice(&chunk);
                if expect.is_satisfied(&decode_lossy(&output)) {
                    debug!("matched {} after {:?}", expect.describe(), self.clock.now() - start);
                    return Ok(Exchange {
                        output,
                        matched: true,
                        elapsed: self.clock.now() - start,
                    });
                }
            }

            let left = self.clock.remaining(deadline);
            if left.is_zero() {
                break;
            }
            self.clock.sleep(self.timing.poll_interval.min(left));
        }

        debug!("no match for {} within {timeout:?}", expect.describe());
        Ok(Exchange {
            output,
            matched: false,
            elapsed: self.clock.now() - start,
        })
    }

    /// Write a command and wait for its expected output.
    ///
    /// Stale input is discarded before the write so that output of an
    /// earlier command cannot satisfy this one. Sends [`ETX`] after a match
    /// when the command asks for it.
    pub fn send_and_wait(
        &self,
        port: &mut dyn Port,
        command: &Command,
        recorder: &mut Recorder,
    ) -> Result<Exchange> {
        port.clear_buffers()?;
        self.write_line(port, command.text())?;
        recorder.note(&format!(
            "Waiting for result (up to {} seconds)...",
            command.timeout().as_secs_f32()
        ));

        let exchange = self.wait_for(port, command.expect(), command.timeout(), recorder)?;
        if exchange.matched && command.aborts_on_match() {
            self.write_raw(port, &[ETX])?;
        }
        Ok(exchange)
    }

    /// Issue a command according to its send mode.
    pub fn issue(
        &self,
        port: &mut dyn Port,
        command: &Command,
        recorder: &mut Recorder,
    ) -> Result<Exchange> {
        match command.mode() {
            SendMode::WaitForMatch => self.send_and_wait(port, command, recorder),
            SendMode::Quick => {
                let start = self.clock.now();
                let output = self.send_quick(port, command.text(), recorder)?;
                let matched = command.expect().is_satisfied(&decode_lossy(&output));
                Ok(Exchange {
                    output,
                    matched,
                    elapsed: self.clock.now() - start,
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::port::mock::ScriptedDevice;
    use crate::port::{SerialBackend, SerialConfig};

    fn setup() -> (Arc<ManualClock>, ScriptedDevice, Box<dyn Port>, Dispatcher) {
        let clock = Arc::new(ManualClock::new());
        let device = ScriptedDevice::new(Arc::clone(&clock));
        let port = device
            .backend()
            .open(&SerialConfig::new("/dev/ttyMOCK0", 115200))
            .unwrap();
        let dispatcher = Dispatcher::new(clock.clone(), DispatchTiming::default());
        (clock, device, port, dispatcher)
    }

    #[test]
    fn test_expect_all_of_requires_every_pattern() {
        let expect = Expect::AllOf(vec!["EHCI".into(), "Hub".into()]);
        assert!(expect.is_satisfied("1  Hub (480 Mb/s)\n u-boot EHCI Host Controller"));
        assert!(!expect.is_satisfied("u-boot EHCI Host Controller"));
        assert!(Expect::Nothing.is_satisfied(""));

        let either = Expect::AnyOf(vec!["=>".into(), "autoboot".into()]);
        assert!(either.is_satisfied("Hit any key to stop autoboot"));
        assert!(!either.is_satisfied("Starting kernel"));
    }

    #[test]
    fn test_send_and_wait_matches_pattern_split_across_chunks() {
        let (clock, device, mut port, dispatcher) = setup();
        device.emit_at(Duration::from_millis(300), "host 192.168");
        device.emit_at(Duration::from_millis(700), ".0.1 is al");
        device.emit_at(Duration::from_millis(900), "ive\r\n");

        let mut recorder = Recorder::default();
        let command = Command::wait_for("ping 192.168.0.1", "host 192.168.0.1 is alive", Duration::from_secs(10));
        let exchange = dispatcher.send_and_wait(port.as_mut(), &command, &mut recorder).unwrap();

        assert!(exchange.matched);
        assert!(clock.elapsed() < Duration::from_secs(10));
        assert_eq!(exchange.text(), "host 192.168.0.1 is alive\r\n");
        assert_eq!(recorder.transcript().chunks().len(), 3);
    }

    #[test]
    fn test_send_and_wait_miss_returns_at_deadline_not_before() {
        let (clock, device, mut port, dispatcher) = setup();
        device.on_write("usb tree", "USB device tree:\r\n  1  Hub (480 Mb/s)\r\n");

        let mut recorder = Recorder::default();
        let timeout = Duration::from_millis(1050);
        let command = Command::wait_for("usb tree", "EHCI Host Controller", timeout);
        let exchange = dispatcher.send_and_wait(port.as_mut(), &command, &mut recorder).unwrap();

        assert!(!exchange.matched);
        assert_eq!(clock.elapsed(), timeout);
        assert_eq!(exchange.elapsed, timeout);
        assert!(exchange.text().contains("USB device tree"));
    }

    #[test]
    fn test_send_and_wait_discards_stale_input() {
        let (clock, device, mut port, dispatcher) = setup();
        // Left over from an earlier command; must not satisfy this one.
        device.emit_at(Duration::ZERO, "is alive\r\n");
        clock.advance(Duration::from_millis(10));

        let mut recorder = Recorder::default();
        let command = Command::wait_for("ping 10.0.0.1", "is alive", Duration::from_secs(1));
        let exchange = dispatcher.send_and_wait(port.as_mut(), &command, &mut recorder).unwrap();
        assert!(!exchange.matched);
    }

    #[test]
    fn test_send_and_wait_sends_etx_when_aborting() {
        let (_clock, device, mut port, dispatcher) = setup();
        device.on_write_once("ping -c 100 10.0.0.1", "64 bytes from 10.0.0.1: seq=0\r\n");

        let mut recorder = Recorder::default();
        let command =
            Command::wait_for("ping -c 100 10.0.0.1", "64 bytes", Duration::from_secs(5)).with_abort();
        let exchange = dispatcher.send_and_wait(port.as_mut(), &command, &mut recorder).unwrap();

        assert!(exchange.matched);
        assert!(device.written_text().ends_with("ping -c 100 10.0.0.1\r\n\u{3}"));
    }

    #[test]
    fn test_send_quick_appends_terminator_and_drains() {
        let (clock, device, mut port, dispatcher) = setup();
        device.on_write("saveenv", "Saving Environment to SPI Flash... OK\r\n");

        let mut recorder = Recorder::default();
        let drained = dispatcher.send_quick(port.as_mut(), "saveenv", &mut recorder).unwrap();

        assert_eq!(device.written_text(), "saveenv\r\n");
        assert!(decode_lossy(&drained).contains("OK"));
        assert_eq!(clock.elapsed(), DEFAULT_QUICK_SETTLE + DEFAULT_QUICK_GRACE);
    }

    #[test]
    fn test_issue_dispatches_by_mode() {
        let (_clock, device, mut port, dispatcher) = setup();
        device.on_write("version", "U-Boot 2019.10\r\n");

        let mut recorder = Recorder::default();
        let quick = dispatcher
            .issue(port.as_mut(), &Command::quick("version"), &mut recorder)
            .unwrap();
        assert!(quick.matched);

        let waited = dispatcher
            .issue(
                port.as_mut(),
                &Command::wait_for_all("version", ["U-Boot", "2019"], Duration::from_secs(1)),
                &mut recorder,
            )
            .unwrap();
        assert!(waited.matched);
    }

    #[test]
    fn test_wait_for_stops_when_interrupted() {
        let (clock, _device, mut port, mut dispatcher) = setup();
        let watched = Arc::clone(&clock);
        dispatcher.set_interrupt(Arc::new(move || watched.elapsed() >= Duration::from_secs(2)));

        let mut recorder = Recorder::default();
        let banner = Expect::Contains("done loading kernel modules".into());
        let result = dispatcher.wait_for(port.as_mut(), &banner, Duration::from_secs(180), &mut recorder);

        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(clock.elapsed() < Duration::from_secs(3));
        assert!(matches!(
            dispatcher.capture(port.as_mut(), Duration::from_secs(5), &mut recorder),
            Err(Error::Interrupted)
        ));
    }
}
