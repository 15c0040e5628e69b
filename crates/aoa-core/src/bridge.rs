//! Byte pump between the accessory's bulk endpoints and the serial line.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::events::{BridgeEvent, BridgeObserver, PacketDirection};
use crate::protocol::{BRIDGE_BUFFER_SIZE, BULK_CHUNK_SIZE};
use crate::serial::SerialLink;
use crate::shutdown::ShutdownSignal;
use crate::transport::{ChunkedWriteConfig, TransferOutcome, UsbTransport, write_chunked};

/// Pump timings and mode flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    pub usb_read_timeout_ms: u64,
    pub serial_read_timeout_ms: u64,
    /// Sleep at the end of every iteration.
    pub idle_ms: u64,
    /// Rounded up to a whole number of bulk packets, see `read_buffer_size`.
    pub buffer_size: usize,
    /// Echo USB IN traffic back to USB OUT instead of the serial line. The
    /// serial line is neither opened nor read.
    pub closed_loop: bool,
    /// Never read the serial line.
    pub suppress_reply: bool,
    pub chunk: ChunkedWriteConfig,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            usb_read_timeout_ms: 2,
            serial_read_timeout_ms: 1,
            idle_ms: 1,
            buffer_size: BRIDGE_BUFFER_SIZE,
            closed_loop: false,
            suppress_reply: false,
            chunk: ChunkedWriteConfig::default(),
        }
    }
}

impl PumpConfig {
    pub fn usb_read_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_read_timeout_ms)
    }

    pub fn serial_read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_read_timeout_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    /// Bulk IN transfers must be a multiple of the max packet size.
    pub fn read_buffer_size(&self) -> usize {
        self.buffer_size.max(1).next_multiple_of(BULK_CHUNK_SIZE)
    }
}

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    Disconnected,
    Shutdown,
}

/// Pump for one connected device.
///
/// Each iteration moves USB to serial first, then serial to USB. Nothing is
/// buffered across iterations.
pub struct BridgeLoop<'a, T, S, O>
where
    T: UsbTransport + ?Sized,
    S: SerialLink + ?Sized,
    O: BridgeObserver + ?Sized,
{
    usb: &'a mut T,
    serial: &'a mut S,
    observer: &'a O,
    config: &'a PumpConfig,
    buffer: Vec<u8>,
}

impl<'a, T, S, O> BridgeLoop<'a, T, S, O>
where
    T: UsbTransport + ?Sized,
    S: SerialLink + ?Sized,
    O: BridgeObserver + ?Sized,
{
    pub fn new(usb: &'a mut T, serial: &'a mut S, observer: &'a O, config: &'a PumpConfig) -> Self {
        let size = config.read_buffer_size();
        if size != config.buffer_size {
            warn!(configured = config.buffer_size, size, "Pump buffer rounded to bulk packet size");
        }
        Self {
            usb,
            serial,
            observer,
            config,
            buffer: vec![0u8; size],
        }
    }

    /// Pump until the device goes away or shutdown is requested.
    pub fn run(&mut self, shutdown: &ShutdownSignal) -> PumpExit {
        debug!(
            closed_loop = self.config.closed_loop,
            suppress_reply = self.config.suppress_reply,
            "Bridge running"
        );
        loop {
            if shutdown.is_triggered() {
                return PumpExit::Shutdown;
            }
            if let Some(exit) = self.step() {
                return exit;
            }
            thread::sleep(self.config.idle());
        }
    }

    /// One iteration without the idle sleep. `Some` ends the pump.
    pub fn step(&mut self) -> Option<PumpExit> {
        let received = match self
            .usb
            .bulk_read(&mut self.buffer, self.config.usb_read_timeout())
        {
            TransferOutcome::DeviceGone => return Some(PumpExit::Disconnected),
            TransferOutcome::IoError(e) => {
                trace!(error = %e, "Bulk read failed");
                0
            }
            outcome => outcome.bytes_moved(),
        };

        if received > 0 {
            let data = &self.buffer[..received];
            self.observer.on_event(&BridgeEvent::Packet {
                direction: PacketDirection::Rx,
                data: data.to_vec(),
            });
            if self.config.closed_loop {
                self.observer.on_event(&BridgeEvent::Packet {
                    direction: PacketDirection::Tx,
                    data: data.to_vec(),
                });
                write_chunked(&mut *self.usb, data, &self.config.chunk);
            } else if let Err(e) = self.serial.write(data) {
                warn!(error = %e, len = received, "Serial write failed");
            }
        }

        if !self.config.suppress_reply && !self.config.closed_loop {
            let n = self
                .serial
                .read_with_timeout(&mut self.buffer, self.config.serial_read_timeout());
            if n > 0 {
                let data = &self.buffer[..n];
                self.observer.on_event(&BridgeEvent::Packet {
                    direction: PacketDirection::Tx,
                    data: data.to_vec(),
                });
                let sent = write_chunked(&mut *self.usb, data, &self.config.chunk);
                if sent < n {
                    debug!(sent, len = n, "Reply truncated");
                }
            }
        }

        None
    }
}
