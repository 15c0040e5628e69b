//! Serial link abstraction.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("Failed to open serial port {path}: {message}")]
    OpenFailed { path: String, message: String },

    #[error("Serial port is not open")]
    NotOpen,

    #[error("Serial port {0} is open; close it before reconfiguring")]
    Busy(String),

    #[error("Serial write failed: {0}")]
    Write(#[from] io::Error),
}

/// Line parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => write!(f, "N"),
            Parity::Odd => write!(f, "O"),
            Parity::Even => write!(f, "E"),
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(p: Parity) -> Self {
        match p {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// A byte-oriented serial line.
pub trait SerialLink {
    /// Open the line. Opening an already open line is a no-op.
    fn open(&mut self) -> Result<(), SerialError>;

    fn is_open(&self) -> bool;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Never fails: read errors end the accumulation and are logged.
    fn read_with_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> usize;

    /// Blocking write of the whole buffer.
    fn write(&mut self, data: &[u8]) -> Result<usize, SerialError>;

    /// Release the line. Safe to call when not open.
    fn close(&mut self);
}

/// A reader whose per-call timeout can be changed.
pub trait TimedRead {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Accumulate bytes from `port` until `buf` is full or `timeout` elapses.
///
/// Each underlying read waits at most `granularity`, and never past the
/// deadline, so the call overruns `timeout` by at most one read.
pub fn read_until_deadline<R: TimedRead + ?Sized>(
    port: &mut R,
    buf: &mut [u8],
    timeout: Duration,
    granularity: Duration,
) -> usize {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Err(e) = port.set_read_timeout(remaining.min(granularity)) {
            warn!(error = %e, "Failed to set serial read timeout");
            break;
        }
        match port.read_some(&mut buf[filled..]) {
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!(error = %e, "Serial read failed");
                break;
            }
        }
    }

    filled
}
