//! # dutprobe
//!
//! A library for driving hardware validation tests over a board's serial
//! console.
//!
//! The device under test is reached through a USB-UART bridge. Tests run
//! either at the bootloader prompt or in the OS shell, and this crate takes
//! care of getting the board there first:
//!
//! - Command dispatch with quick-send and send-and-wait semantics
//! - Boot-stage tracking: autoboot interruption, booting to the OS shell,
//!   baud switching and reboots
//! - A library of test cases (network, USB, RTC drift, radio, power loss,
//!   cellular, peripherals, Wi-Fi) reporting pass/fail plus a transcript
//! - An auto-reconnect poller driven by the host's timer
//! - USB-UART bridge discovery
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for parameters and outcomes
//!
//! ## Example
//!
//! ```rust,no_run
//! use dutprobe::{DeviceParams, Session, SessionConfig, TestKind, Timing, run_test};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let mut session = Session::native(SessionConfig::new("/dev/ttyUSB0"))
//!             .with_sink(Box::new(|line| println!("{line}")));
//!
//!         let outcome = run_test(
//!             TestKind::Rtc,
//!             &DeviceParams::default(),
//!             &Timing::default(),
//!             &mut session,
//!         );
//!         println!("{}: {}", outcome.name, outcome.label());
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod autoconnect;
pub mod cases;
pub mod clock;
pub mod device;
pub mod error;
pub mod port;
pub mod protocol;
pub mod session;
pub mod transcript;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeBackend, NativePort};
pub use {
    autoconnect::{AutoConnectConfig, AutoConnector},
    cases::{
        DeviceParams, Evaluation, Extract, Failure, FailureKind, TestCase, TestKind, TestOutcome,
        Timing, Verdict, WifiCredentials, WifiSecurity, run, run_test, run_tests,
    },
    clock::{Clock, SystemClock},
    device::{BridgeKind, DetectedPort, auto_detect_port, detect_ports, format_port_list},
    error::{Error, Result},
    port::{Port, PortInfo, SerialBackend, SerialConfig},
    protocol::{Command, DispatchTiming, Dispatcher, Exchange, Expect, InterruptCheck, SendMode},
    session::{BootStage, Session, SessionConfig},
    transcript::{Sink, Transcript},
};
