//! Transport abstraction over the serial link to the device under test.
//!
//! The [`Port`] trait is the byte-level contract everything above it relies
//! on: fire-and-forget writes, a non-blocking "how much is buffered" query,
//! bounded reads, buffer reset and an idempotent close. Ports are produced by
//! a [`SerialBackend`], which also enumerates the ports present on the host.
//!
//! ```text
//! +-------------------------------+
//! |  Test cases / Auto-connector  |
//! +---------------+---------------+
//!                 |
//!        +--------v--------+
//!        |     Session     |  boot stage, baud switching
//!        +--------+--------+
//!                 |
//!        +--------v--------+
//!        |   Dispatcher    |  quick-send, send-and-wait
//!        +--------+--------+
//!                 |
//!        +--------v--------+
//!        |   Port trait    |  <- NativePort (serialport)
//!        +-----------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default per-call read timeout, short enough to keep polling loops responsive.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port configuration.
///
/// Framing is fixed at 8 data bits, no parity, one stop bit and no flow
/// control, the console settings of every supported board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Per-call read timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Configuration for `port_name` at `baud_rate` with the default timeout.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Whether this port carries the given USB identity.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == Some(vid) && self.pid == Some(pid)
    }
}

/// An open serial handle, exclusively owned by whoever opened it.
pub trait Port: Read + Write + Send {
    /// Set the per-call read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Get the baud rate the port was opened at.
    fn baud_rate(&self) -> u32;

    /// Number of received bytes waiting in the input buffer. Never blocks.
    fn bytes_waiting(&mut self) -> Result<usize>;

    /// Discard anything queued in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release the device node.
    ///
    /// Closing an already closed port is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Read whatever is currently buffered, up to `max` bytes.
    ///
    /// Returns an empty vector when nothing is waiting.
    fn read_available(&mut self, max: usize) -> Result<Vec<u8>> {
        let waiting = self.bytes_waiting()?;
        if waiting == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; waiting.min(max)];
        match Read::read(self, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            },
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Opens ports and lists what is attached to the host.
pub trait SerialBackend: Send + Sync {
    /// Open a port. Fails with `Error::PortUnavailable` if it cannot be claimed.
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>>;

    /// List all serial ports present on the host.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Find ports matching the given VID/PID.
    fn find_by_vid_pid(&self, vid: u16, pid: u16) -> Result<Vec<PortInfo>> {
        Ok(self
            .list_ports()?
            .into_iter()
            .filter(|p| p.matches(vid, pid))
            .collect())
    }
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::{NativeBackend, NativePort};
