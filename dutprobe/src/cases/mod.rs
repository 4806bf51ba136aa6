//! Test case library.
//!
//! Every hardware check is a [`TestCase`]: a stateless protocol that runs
//! its command choreography over a [`Session`] and returns an
//! [`Evaluation`]. [`run`] is the boundary around it. It establishes the
//! boot stage the case needs, converts every error and panic into a failed
//! [`TestOutcome`], and disconnects the session on every exit path.
//!
//! ## Variants
//!
//! | Kind          | Stage      | Pass condition                              |
//! |---------------|------------|---------------------------------------------|
//! | `network`     | bootloader | ping reports the server alive               |
//! | `usb`         | bootloader | `usb tree` lists the EHCI controller        |
//! | `rtc`         | bootloader | clock advanced by ~the configured delay     |
//! | `radio`       | bootloader | modem answers `AT` with OK                  |
//! | `power`       | bootloader | power-fail GPIO reads 0 within the retries  |
//! | `cellular`    | OS shell   | module reports a CCID                       |
//! | `peripherals` | OS shell   | `lsusb` lists every required ID             |
//! | `wifi`        | OS shell   | `iw` reports the link connected             |

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::session::{BootStage, Session};
use crate::transcript::Transcript;

pub mod cellular;
pub mod clock_drift;
pub mod command;
pub mod params;
pub mod peripherals;
pub mod power;
pub mod radio;
pub mod wireless;

pub use cellular::{CellularParams, CellularTest};
pub use clock_drift::{ClockDriftParams, ClockDriftTest, DriftReport, evaluate_clock_drift};
pub use command::CommandTest;
pub use params::{DeviceParams, Timing, WifiCredentials, WifiSecurity};
pub use peripherals::{PeripheralParams, PeripheralTest, evaluate_listing};
pub use power::{PowerLossParams, PowerLossTest};
pub use radio::{RadioParams, RadioTest};
pub use wireless::{WirelessParams, WirelessTest};

/// One hardware check.
pub trait TestCase: Send {
    /// Display name.
    fn name(&self) -> &str;

    /// Boot stage the choreography runs in.
    fn required_stage(&self) -> BootStage;

    /// Run the choreography. The session is already in
    /// [`TestCase::required_stage`].
    fn execute(&self, session: &mut Session) -> Result<Evaluation>;
}

/// Pass / fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Verdict {
    /// Check succeeded.
    Pass,
    /// Check failed, see [`Failure`].
    Fail,
}

/// Why a test failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FailureKind {
    /// Output arrived but did not satisfy the pass condition.
    Mismatch,
    /// Expected output never arrived.
    Timeout,
    /// Output was malformed; the protocol's assumptions do not hold.
    Parse,
    /// The port could not be opened.
    PortUnavailable,
    /// The device disappeared mid-test.
    TransportDropped,
    /// The session never reached the required stage.
    NotReady,
    /// The host stopped the run.
    Interrupted,
    /// Anything else.
    Other,
}

impl FailureKind {
    /// Classify an error raised inside a run.
    pub fn of(error: &Error) -> Self {
        match error {
            Error::Timeout(_) => Self::Timeout,
            Error::Parse(_) => Self::Parse,
            Error::PortUnavailable { .. } => Self::PortUnavailable,
            Error::NotReady { .. } => Self::NotReady,
            Error::Interrupted => Self::Interrupted,
            e if e.is_transport_loss() => Self::TransportDropped,
            _ => Self::Other,
        }
    }

    /// Verdict label for logs and reports.
    pub fn label(self) -> &'static str {
        match self {
            Self::Parse => "PARSE ERROR",
            _ => "FAIL",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mismatch => "mismatch",
            Self::Timeout => "timeout",
            Self::Parse => "parse error",
            Self::PortUnavailable => "port unavailable",
            Self::TransportDropped => "transport dropped",
            Self::NotReady => "not ready",
            Self::Interrupted => "interrupted",
            Self::Other => "error",
        };
        f.write_str(name)
    }
}

/// A failure with its diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Failure {
    /// Category.
    pub kind: FailureKind,
    /// Human-readable reason.
    pub message: String,
}

/// Structured value pulled out of the DUT's output.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Extract {
    /// The two clock readings of a drift check.
    Timestamps {
        /// First reading, `HH:MM:SS`.
        first: String,
        /// Second reading, `HH:MM:SS`.
        second: String,
        /// Absolute difference in seconds.
        delta_secs: u64,
    },
    /// An identifier such as a SIM CCID.
    Identifier(String),
    /// The first required token that was absent.
    MissingToken(String),
}

/// What a choreography concluded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Evaluation {
    failure: Option<Failure>,
    extract: Option<Extract>,
}

impl Evaluation {
    /// Passed.
    pub fn pass() -> Self {
        Self::default()
    }

    /// Failed for `kind`.
    pub fn fail(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            failure: Some(Failure {
                kind,
                message: message.into(),
            }),
            extract: None,
        }
    }

    /// Pass when `matched`, otherwise fail for `kind`.
    pub fn expect(matched: bool, kind: FailureKind, message: impl Into<String>) -> Self {
        if matched { Self::pass() } else { Self::fail(kind, message) }
    }

    /// Attach an extracted value.
    #[must_use]
    pub fn with_extract(mut self, extract: Extract) -> Self {
        self.extract = Some(extract);
        self
    }

    /// Whether the check passed.
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    /// Failure details.
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Extracted value.
    pub fn extract(&self) -> Option<&Extract> {
        self.extract.as_ref()
    }
}

/// Result of one [`run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    /// Test name.
    pub name: String,
    /// Pass / fail.
    pub verdict: Verdict,
    /// Present when the verdict is [`Verdict::Fail`].
    pub failure: Option<Failure>,
    /// Everything the DUT sent during the run.
    pub transcript: Transcript,
    /// Structured value, when the variant produces one.
    pub extract: Option<Extract>,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl TestOutcome {
    /// The boolean result callers act on.
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Whether the run ended in a parse error rather than an ordinary fail.
    pub fn is_parse_error(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|f| f.kind == FailureKind::Parse)
    }

    /// `PASS`, `FAIL` or `PARSE ERROR`.
    pub fn label(&self) -> &'static str {
        match &self.failure {
            None => "PASS",
            Some(failure) => failure.kind.label(),
        }
    }
}

/// Disconnects the session when dropped, however the run exits.
pub struct SessionGuard<'a> {
    session: &'a mut Session,
}

impl<'a> SessionGuard<'a> {
    /// Guard `session` for the current scope.
    pub fn new(session: &'a mut Session) -> Self {
        Self { session }
    }
}

impl Deref for SessionGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session.disconnect();
    }
}

/// Run one test case: reach its stage, execute, always disconnect.
///
/// Never returns an error. Every failure, including an unreachable port
/// or a panic inside the case, comes back as a [`Verdict::Fail`] outcome.
pub fn run(case: &dyn TestCase, session: &mut Session) -> TestOutcome {
    let start = session.clock().now();
    info!("Running {}", case.name());
    session.note(&format!("Running {} test", case.name()));

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut guard = SessionGuard::new(session);
        guard
            .ensure_stage(case.required_stage())
            .and_then(|()| case.execute(&mut guard))
    }))
    .unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        warn!("{} panicked: {message}", case.name());
        Ok(Evaluation::fail(
            FailureKind::Other,
            format!("test panicked: {message}"),
        ))
    });

    let (failure, extract) = match result {
        Ok(evaluation) => (evaluation.failure, evaluation.extract),
        Err(error) => {
            let kind = FailureKind::of(&error);
            if kind == FailureKind::Parse {
                warn!("{}: {error}", case.name());
            }
            (
                Some(Failure {
                    kind,
                    message: error.to_string(),
                }),
                None,
            )
        },
    };

    let verdict = if failure.is_some() { Verdict::Fail } else { Verdict::Pass };
    match &failure {
        None => session.note(&format!("{}: PASS", case.name())),
        Some(f) => session.note(&format!("{}: {} ({})", case.name(), f.kind.label(), f.message)),
    }
    info!("{} finished: {verdict:?}", case.name());

    TestOutcome {
        name: case.name().to_string(),
        verdict,
        failure,
        transcript: session.take_transcript(),
        extract,
        elapsed: session.clock().now() - start,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Catalogue of built-in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TestKind {
    /// Ethernet reachability (ping).
    Network,
    /// USB host controller enumeration.
    Usb,
    /// Real-time clock drift.
    Rtc,
    /// Radio module AT handshake.
    Radio,
    /// Power-fail detection GPIO.
    Power,
    /// Cellular module presence.
    Cellular,
    /// USB peripheral listing from the OS.
    Peripherals,
    /// Wi-Fi association.
    Wifi,
}

impl TestKind {
    /// Every kind, in the order a full run executes them.
    pub const ALL: [Self; 8] = [
        Self::Network,
        Self::Usb,
        Self::Rtc,
        Self::Radio,
        Self::Power,
        Self::Cellular,
        Self::Peripherals,
        Self::Wifi,
    ];

    /// Identifier used on the command line and in config.
    pub fn name(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Usb => "usb",
            Self::Rtc => "rtc",
            Self::Radio => "radio",
            Self::Power => "power",
            Self::Cellular => "cellular",
            Self::Peripherals => "peripherals",
            Self::Wifi => "wifi",
        }
    }

    /// One-line description.
    pub fn description(self) -> &'static str {
        match self {
            Self::Network => "Ethernet: configure address, ping the server",
            Self::Usb => "USB: start the host controller, list the tree",
            Self::Rtc => "RTC: read the clock twice, check the elapsed time",
            Self::Radio => "Radio: enter command mode with +++, probe with AT",
            Self::Power => "Power loss: poll the power-fail GPIO until it reads 0",
            Self::Cellular => "Cellular: boot the OS, query the module for its CCID",
            Self::Peripherals => "Peripherals: check lsusb for the required IDs",
            Self::Wifi => "Wi-Fi: configure the supplicant, wait for association",
        }
    }

    /// Boot stage the test runs in.
    pub fn required_stage(self) -> BootStage {
        match self {
            Self::Network | Self::Usb | Self::Rtc | Self::Radio | Self::Power => {
                BootStage::BootloaderReady
            },
            Self::Cellular | Self::Peripherals | Self::Wifi => BootStage::OsReady,
        }
    }

    /// Build the test from device parameters and timing.
    pub fn build(self, device: &DeviceParams, timing: &Timing) -> Box<dyn TestCase> {
        match self {
            Self::Network => Box::new(CommandTest::network(device, timing)),
            Self::Usb => Box::new(CommandTest::usb(timing)),
            Self::Rtc => Box::new(ClockDriftTest::new(timing.clock_drift.clone())),
            Self::Radio => Box::new(RadioTest::new(timing.radio.clone())),
            Self::Power => Box::new(PowerLossTest::new(timing.power.clone())),
            Self::Cellular => Box::new(CellularTest::new(timing.cellular.clone())),
            Self::Peripherals => Box::new(PeripheralTest::new(timing.peripherals.clone())),
            Self::Wifi => Box::new(WirelessTest::new(
                device.wifi.clone(),
                timing.wireless.clone(),
            )),
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "network" | "ethernet" | "eth0" => Ok(Self::Network),
            "usb" => Ok(Self::Usb),
            "rtc" | "clock" => Ok(Self::Rtc),
            "radio" | "xbee" => Ok(Self::Radio),
            "power" | "battery" => Ok(Self::Power),
            "cellular" | "lte" => Ok(Self::Cellular),
            "peripherals" | "lsusb" => Ok(Self::Peripherals),
            "wifi" | "wireless" | "wlan" => Ok(Self::Wifi),
            other => Err(Error::Config(format!("unknown test '{other}'"))),
        }
    }
}

/// Build and run one catalogue test.
pub fn run_test(
    kind: TestKind,
    device: &DeviceParams,
    timing: &Timing,
    session: &mut Session,
) -> TestOutcome {
    let case = kind.build(device, timing);
    run(case.as_ref(), session)
}

/// Run several catalogue tests in order on the same session.
///
/// `on_start` sees each kind just before it runs. Once the session's
/// interrupt check fires the remaining tests are skipped; the test in
/// progress ends with [`FailureKind::Interrupted`].
pub fn run_tests(
    kinds: &[TestKind],
    device: &DeviceParams,
    timing: &Timing,
    session: &mut Session,
    mut on_start: impl FnMut(TestKind),
) -> Vec<TestOutcome> {
    let mut outcomes = Vec::with_capacity(kinds.len());
    for kind in kinds {
        if session.interrupted() {
            warn!("Interrupted, skipping remaining tests");
            break;
        }
        on_start(*kind);
        outcomes.push(run_test(*kind, device, timing, session));
    }
    outcomes
}
