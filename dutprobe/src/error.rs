//! Error types for dutprobe.

use std::io;
use thiserror::Error;

use crate::session::BootStage;

/// Result type for dutprobe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dutprobe operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the serial link.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The serial device node could not be opened or claimed.
    #[error("Port {port} unavailable: {reason}")]
    PortUnavailable {
        /// Port name/path that was requested.
        port: String,
        /// Underlying reason reported by the backend.
        reason: String,
    },

    /// An expected banner or prompt was never observed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Response was present but structurally malformed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The device went away in the middle of an exchange.
    #[error("Transport dropped: {0}")]
    TransportDropped(String),

    /// A command was issued while the device sat in the wrong boot stage.
    #[error("Device not ready: requires {required}, currently {actual}")]
    NotReady {
        /// Stage the operation needs.
        required: BootStage,
        /// Stage the session was in.
        actual: BootStage,
    },

    /// No matching device was found during discovery.
    #[error("Device not found")]
    DeviceNotFound,

    /// Invalid configuration value (pattern, parameter).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The host asked the run to stop.
    #[error("Interrupted")]
    Interrupted,
}

impl Error {
    /// Whether this error means the device node disappeared under us.
    pub fn is_transport_loss(&self) -> bool {
        match self {
            Self::TransportDropped(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
            ),
            #[cfg(feature = "native")]
            Self::Serial(e) => matches!(
                e.kind(),
                serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(_)
            ),
            _ => false,
        }
    }
}
