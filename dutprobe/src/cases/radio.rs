//! Radio module AT handshake.
//!
//! Routes the bootloader console to the radio's UART, enters the modem's
//! command mode with the `+++` escape surrounded by guard silence, probes
//! with `AT` and looks for the OK acknowledgement. The console routing is
//! restored afterwards.

use std::time::Duration;

use crate::cases::{Evaluation, FailureKind, TestCase};
use crate::error::Result;
use crate::session::{BootStage, Session};
use crate::transcript::decode_lossy;

/// Radio handshake parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RadioParams {
    /// Console routing commands: the first `setup_before_escape` enable the
    /// radio UART, the rest restore the default console.
    pub setup: Vec<String>,
    /// How many of `setup` run before the escape.
    pub setup_before_escape: usize,
    /// Silence before and after the escape sequence.
    pub guard: Duration,
    /// Command-mode escape.
    pub escape: String,
    /// Wait, in whole seconds, before the probe.
    pub countdown_secs: u64,
    /// Probe written after the countdown.
    pub probe: String,
    /// Wait after the probe and after reading its response.
    pub settle: Duration,
    /// Acknowledgement token.
    pub token: String,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            setup: vec![
                "setenv stdin nuc980_serial0,nuc980_serial2".to_string(),
                "setenv stdout nuc980_serial0,nuc980_serial2".to_string(),
                "setenv stdin nuc980_serial0".to_string(),
                "setenv stdout nuc980_serial0".to_string(),
            ],
            setup_before_escape: 2,
            guard: Duration::from_millis(1200),
            escape: "+++".to_string(),
            countdown_secs: 2,
            probe: "AT\r".to_string(),
            settle: Duration::from_millis(500),
            token: "=> OK".to_string(),
        }
    }
}

/// `+++` / `AT` handshake with the radio module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioTest {
    params: RadioParams,
}

impl RadioTest {
    /// Create the test.
    pub fn new(params: RadioParams) -> Self {
        Self { params }
    }
}

impl TestCase for RadioTest {
    fn name(&self) -> &str {
        "radio"
    }

    fn required_stage(&self) -> BootStage {
        BootStage::BootloaderReady
    }

    fn execute(&self, session: &mut Session) -> Result<Evaluation> {
        let p = &self.params;
        let split = p.setup_before_escape.min(p.setup.len());
        let (enable, restore) = p.setup.split_at(split);

        session.note("Sending setup command");
        for command in enable {
            session.send_quick(command)?;
        }

        session.sleep(p.guard);
        session.note(&format!("Sending setup command {}", p.escape));
        session.write_raw(p.escape.as_bytes())?;
        session.sleep(p.guard);
        session.write_raw(b"\n")?;
        session.countdown(p.countdown_secs)?;

        session.note("Sending AT");
        session.write_raw(p.probe.as_bytes())?;
        session.sleep(p.settle);
        let output = decode_lossy(&session.read_pending()?);
        session.sleep(p.settle);

        for command in restore {
            session.send_quick(command)?;
        }
        session.sleep(p.settle);

        session.note("Final Output:");
        session.note(&output);

        Ok(Evaluation::expect(
            output.contains(&p.token),
            FailureKind::Mismatch,
            format!("'{}' not in the modem response", p.token),
        ))
    }
}
