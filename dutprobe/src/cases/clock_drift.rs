//! RTC drift check.
//!
//! Reads the bootloader clock twice with a known delay in between and
//! checks that the clock advanced by roughly that delay.

use std::time::Duration;

use log::debug;

use crate::cases::{Evaluation, Extract, FailureKind, TestCase};
use crate::error::{Error, Result};
use crate::protocol::pattern;
use crate::session::{BootStage, Session};
use crate::transcript::decode_lossy;

const TIME_PATTERN: &str = r"Time:\s*(\d+:\d+:\d+)";

/// RTC drift parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClockDriftParams {
    /// Clock read command.
    pub command: String,
    /// Whole seconds between the two reads.
    pub delay_secs: u64,
    /// Wait after the second read before collecting output.
    pub settle: Duration,
    /// Lower tolerance bound, as a fraction of the delay.
    pub lower: f64,
    /// Upper tolerance bound, as a fraction of the delay.
    pub upper: f64,
}

impl Default for ClockDriftParams {
    fn default() -> Self {
        Self {
            command: "date".to_string(),
            delay_secs: 3,
            settle: Duration::from_millis(500),
            lower: 0.5,
            upper: 1.5,
        }
    }
}

/// Parsed clock readings.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    /// First reading.
    pub first: String,
    /// Second reading.
    pub second: String,
    /// Absolute difference in seconds.
    pub delta_secs: u64,
    /// Whether the delta lies within tolerance.
    pub within_tolerance: bool,
}

impl DriftReport {
    /// `Time 1: .., Time 2: .., Delta: N seconds`.
    pub fn summary(&self) -> String {
        format!(
            "Time 1: {}, Time 2: {}, Delta: {} seconds",
            self.first, self.second, self.delta_secs
        )
    }
}

fn to_seconds(time: &str) -> Result<u64> {
    time.split(':').try_fold(0u64, |acc, part| {
        let value: u64 = part
            .parse()
            .map_err(|e| Error::Parse(format!("bad time field '{part}' in '{time}': {e}")))?;
        acc.checked_mul(60)
            .and_then(|acc| acc.checked_add(value))
            .ok_or_else(|| Error::Parse(format!("time '{time}' out of range")))
    })
}

/// Evaluate two `Time: HH:MM:SS` readings in `text` against `elapsed` with
/// the default [0.5x, 1.5x] tolerance.
///
/// Fails with [`Error::Parse`] unless exactly two readings are present.
pub fn evaluate_clock_drift(text: &str, elapsed: Duration) -> Result<DriftReport> {
    let defaults = ClockDriftParams::default();
    evaluate_with_bounds(text, elapsed, defaults.lower, defaults.upper)
}

fn evaluate_with_bounds(text: &str, elapsed: Duration, lower: f64, upper: f64) -> Result<DriftReport> {
    let re = pattern::compile(TIME_PATTERN)?;
    let times = pattern::extract_all(&re, text);
    let [first, second] = <[String; 2]>::try_from(times).map_err(|times| {
        Error::Parse(format!(
            "expected exactly two clock readings, found {}",
            times.len()
        ))
    })?;

    let delta_secs = to_seconds(&first)?.abs_diff(to_seconds(&second)?);
    let expected = elapsed.as_secs_f64();
    #[allow(clippy::cast_precision_loss)]
    let delta = delta_secs as f64;
    let within_tolerance = lower * expected <= delta && delta <= upper * expected;
    debug!("clock delta {delta_secs}s against {expected}s: {within_tolerance}");

    Ok(DriftReport {
        first,
        second,
        delta_secs,
        within_tolerance,
    })
}

/// Two clock reads separated by a countdown.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockDriftTest {
    params: ClockDriftParams,
}

impl ClockDriftTest {
    /// Create the test.
    pub fn new(params: ClockDriftParams) -> Self {
        Self { params }
    }
}

impl TestCase for ClockDriftTest {
    fn name(&self) -> &str {
        "rtc"
    }

    fn required_stage(&self) -> BootStage {
        BootStage::BootloaderReady
    }

    fn execute(&self, session: &mut Session) -> Result<Evaluation> {
        session.note("Reading time...");
        session.write_line(&self.params.command)?;
        session.countdown(self.params.delay_secs)?;

        session.note("Reading time again");
        session.write_line(&self.params.command)?;
        session.sleep(self.params.settle);
        let text = decode_lossy(&session.read_pending()?);

        let report = evaluate_with_bounds(
            &text,
            Duration::from_secs(self.params.delay_secs),
            self.params.lower,
            self.params.upper,
        )?;
        session.note("Final Output:");
        session.note(&report.summary());

        let evaluation = Evaluation::expect(
            report.within_tolerance,
            FailureKind::Mismatch,
            format!(
                "clock advanced {}s, expected about {}s",
                report.delta_secs, self.params.delay_secs
            ),
        );
        Ok(evaluation.with_extract(Extract::Timestamps {
            first: report.first,
            second: report.second,
            delta_secs: report.delta_secs,
        }))
    }
}
