//! Host serial ports through the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortInfo, SerialBackend, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// A device node opened 8N1 without flow control.
pub struct NativePort {
    handle: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open and claim the node named in `config`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let handle = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| Error::PortUnavailable {
                port: config.port_name.clone(),
                reason: e.to_string(),
            })?;
        debug!("Opened {} @ {}", config.port_name, config.baud_rate);

        Ok(Self {
            handle: Some(handle),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    /// The live handle; a closed port reads as a dropped transport.
    fn live(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            handle.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::TransportDropped(format!("{} is closed", self.name)));
        };
        Ok(usize::try_from(handle.bytes_to_read()?).unwrap_or(usize::MAX))
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::TransportDropped(format!("{} is closed", self.name)));
        };
        handle.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            trace!("Released {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.live()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.live()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.live()?.flush()
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => Self {
                name: info.port_name,
                ..Self::default()
            },
        }
    }
}

/// Backend over the host's real device nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl SerialBackend for NativeBackend {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        Ok(Box::new(NativePort::open(config)?))
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }
}
