//! USB peripheral listing from the OS shell.

use std::time::Duration;

use crate::cases::{Evaluation, Extract, FailureKind, TestCase};
use crate::error::Result;
use crate::protocol::pattern;
use crate::session::{BootStage, Session};
use crate::transcript::decode_lossy;

/// Listing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PeripheralParams {
    /// Listing command.
    pub command: String,
    /// How long to collect the listing.
    pub window: Duration,
    /// Identifiers that must all appear, checked in this order.
    pub required: Vec<String>,
}

impl Default for PeripheralParams {
    fn default() -> Self {
        Self {
            command: "lsusb".to_string(),
            window: Duration::from_secs(2),
            // EHCI root hub, OHCI root hub, cellular module
            required: vec![
                "1d6b:0002".to_string(),
                "1d6b:0001".to_string(),
                "2c7c:0125".to_string(),
            ],
        }
    }
}

/// Check a listing for every required identifier.
///
/// Fails on the first identifier, in `required` order, that is absent.
pub fn evaluate_listing<S: AsRef<str>>(text: &str, required: &[S]) -> Evaluation {
    match pattern::first_missing(text, required) {
        None => Evaluation::pass(),
        Some(token) => Evaluation::fail(FailureKind::Mismatch, format!("'{token}' not listed"))
            .with_extract(Extract::MissingToken(token.to_string())),
    }
}

/// `lsusb` must list every required device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralTest {
    params: PeripheralParams,
}

impl PeripheralTest {
    /// Create the test.
    pub fn new(params: PeripheralParams) -> Self {
        Self { params }
    }
}

impl TestCase for PeripheralTest {
    fn name(&self) -> &str {
        "peripherals"
    }

    fn required_stage(&self) -> BootStage {
        BootStage::OsReady
    }

    fn execute(&self, session: &mut Session) -> Result<Evaluation> {
        let mut output = session.send_quick(&self.params.command)?;
        output.extend(session.capture(self.params.window)?);

        let text = decode_lossy(&output);
        session.note("Final Output:");
        session.note(&text);

        Ok(evaluate_listing(&text, &self.params.required))
    }
}
