//! Power-loss detection.
//!
//! Arms the power-fail input, asks the operator to pull power, and polls
//! the GPIO until it reads 0 or the retry budget runs out.

use std::time::Duration;

use crate::cases::{Evaluation, FailureKind, TestCase};
use crate::error::Result;
use crate::session::{BootStage, Session};
use crate::transcript::decode_lossy;

/// Power-loss parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PowerLossParams {
    /// Register writes arming the power-fail input.
    pub setup: Vec<String>,
    /// Pause after setup.
    pub guard: Duration,
    /// GPIO read command.
    pub probe: String,
    /// Attempts before giving up.
    pub retries: u32,
    /// Pause between attempts.
    pub interval: Duration,
    /// Token meaning power is gone.
    pub token: String,
}

impl Default for PowerLossParams {
    fn default() -> Self {
        Self {
            setup: vec![
                "mw 0xb00041b0 0x40000".to_string(),
                "md 0xb00041b0 1".to_string(),
            ],
            guard: Duration::from_millis(200),
            probe: "gpio input 201".to_string(),
            retries: 10,
            interval: Duration::from_secs(1),
            token: "value is 0".to_string(),
        }
    }
}

/// Poll the power-fail GPIO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerLossTest {
    params: PowerLossParams,
}

impl PowerLossTest {
    /// Create the test.
    pub fn new(params: PowerLossParams) -> Self {
        Self { params }
    }
}

impl TestCase for PowerLossTest {
    fn name(&self) -> &str {
        "power"
    }

    fn required_stage(&self) -> BootStage {
        BootStage::BootloaderReady
    }

    fn execute(&self, session: &mut Session) -> Result<Evaluation> {
        let p = &self.params;

        session.note("Sending setup command");
        for command in &p.setup {
            session.send_quick(command)?;
        }
        session.sleep(p.guard);

        session.note("Remove power, checking Power fail:");
        session.write_raw(b"\n")?;

        let mut output = String::new();
        let mut detected = false;
        for left in (1..=p.retries).rev() {
            session.note(&format!(
                "Waiting for power removal (auto timeout in {left} seconds)"
            ));
            session.write_line(&p.probe)?;
            output = decode_lossy(&session.read_pending()?);
            if output.contains(&p.token) {
                session.note("Power fail detected");
                detected = true;
                break;
            }
            session.sleep(p.interval);
        }

        session.note("Final Output:");
        session.note(&output);

        Ok(Evaluation::expect(
            detected,
            FailureKind::Timeout,
            format!("'{}' not read within {} attempts", p.token, p.retries),
        ))
    }
}
