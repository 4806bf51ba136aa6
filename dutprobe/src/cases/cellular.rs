//! Cellular module detection.
//!
//! From the OS shell, tails the module's AT port in the background, asks
//! it for the SIM identifier and looks for a CCID in whatever comes back.
//! The background reader is killed once the answers are collected.

use std::time::Duration;

use crate::cases::{Evaluation, Extract, FailureKind, TestCase};
use crate::error::Result;
use crate::protocol::pattern;
use crate::session::{BootStage, Session};
use crate::transcript::decode_lossy;

/// Cellular detection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CellularParams {
    /// The module's AT command node.
    pub node: String,
    /// AT commands written to the node, in order.
    pub at_commands: Vec<String>,
    /// How long to collect the module's answers.
    pub window: Duration,
    /// Identifier pattern; group 1 is the identifier.
    pub pattern: String,
}

impl Default for CellularParams {
    fn default() -> Self {
        Self {
            node: "/dev/ttyUSB2".to_string(),
            at_commands: vec!["ATE0".to_string(), "AT+CCID".to_string()],
            window: Duration::from_secs(5),
            pattern: r#"CCID:\s*"?(\d{10,22})"#.to_string(),
        }
    }
}

/// Query the cellular module for its CCID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellularTest {
    params: CellularParams,
}

impl CellularTest {
    /// Create the test.
    pub fn new(params: CellularParams) -> Self {
        Self { params }
    }
}

impl TestCase for CellularTest {
    fn name(&self) -> &str {
        "cellular"
    }

    fn required_stage(&self) -> BootStage {
        BootStage::OsReady
    }

    fn execute(&self, session: &mut Session) -> Result<Evaluation> {
        let p = &self.params;
        let re = pattern::compile(&p.pattern)?;

        session.note(&format!("Listening on {}", p.node));
        let mut output = session.send_quick(&format!("cat {} &", p.node))?;
        for at in &p.at_commands {
            session.note(&format!("Sending {at}"));
            output.extend(session.send_quick(&format!(r#"echo -e "{at}\r" > {}"#, p.node))?);
        }
        output.extend(session.capture(p.window)?);
        session.send_quick("kill $!")?;

        let text = decode_lossy(&output);
        session.note("Final Output:");
        session.note(&text);

        Ok(match pattern::extract_first(&re, &text) {
            Some(ccid) => {
                session.note(&format!("CCID: {ccid}"));
                Evaluation::pass().with_extract(Extract::Identifier(ccid))
            },
            None => Evaluation::fail(
                FailureKind::Mismatch,
                format!("no CCID reported on {}", p.node),
            ),
        })
    }
}
