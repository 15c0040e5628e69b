//! serialport-backed serial session.

use std::io::{self, Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, SerialPort, StopBits};
use tracing::{debug, info, instrument, warn};

use super::traits::{Parity, SerialError, SerialLink, TimedRead, read_until_deadline};

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub parity: Parity,
    /// Upper bound on one underlying read, independent of the caller's timeout.
    pub inter_byte_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            parity: Parity::None,
            inter_byte_timeout_ms: 500,
        }
    }
}

impl SerialSettings {
    pub fn inter_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_byte_timeout_ms)
    }
}

impl TimedRead for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// The process's single serial session.
///
/// Raw 8-bit line, 1 stop bit, no flow control. Settings can only be changed
/// while closed.
pub struct SerialSession {
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialSession {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Replace the settings. Fails while the port is open.
    pub fn reconfigure(&mut self, settings: SerialSettings) -> Result<(), SerialError> {
        if self.port.is_some() {
            return Err(SerialError::Busy(self.settings.path.clone()));
        }
        self.settings = settings;
        Ok(())
    }
}

impl SerialLink for SerialSession {
    #[instrument(level = "info", skip(self), fields(path = %self.settings.path, baud = self.settings.baud_rate))]
    fn open(&mut self) -> Result<(), SerialError> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = serialport::new(&self.settings.path, self.settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(self.settings.parity.into())
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.settings.inter_byte_timeout())
            .open()
            .map_err(|e| SerialError::OpenFailed {
                path: self.settings.path.clone(),
                message: e.to_string(),
            })?;

        info!(line = %format!("8{}1", self.settings.parity), "Serial port opened");
        self.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read_with_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> usize {
        let granularity = self.settings.inter_byte_timeout();
        match self.port.as_mut() {
            Some(port) => read_until_deadline(port, buf, timeout, granularity),
            None => 0,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SerialError> {
        let port = self.port.as_mut().ok_or(SerialError::NotOpen)?;
        port.write_all(data)?;
        if let Err(e) = port.flush() {
            warn!(error = %e, "Serial flush failed");
        }
        Ok(data.len())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(path = %self.settings.path, "Serial port closed");
        }
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.close();
    }
}
