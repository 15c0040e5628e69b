//! Terminal output: traffic dumps and a raw-mode safe log writer.

use std::io::{self, Write};

use aoa_core::events::{BridgeEvent, BridgeObserver, PacketDirection, TracingObserver};
use crossterm::style::Stylize;

/// Format bytes as space-separated upper-case hex.
pub fn hex_line(data: &[u8]) -> String {
    let mut line = String::with_capacity(data.len() * 3);
    for b in data {
        line.push_str(&format!("{:02X} ", b));
    }
    line
}

/// Observer for the CLI: status goes to tracing, traffic optionally to stdout.
pub struct ConsoleObserver {
    hex: bool,
    raw_mode: bool,
    log: TracingObserver,
}

impl ConsoleObserver {
    pub fn new(hex: bool, raw_mode: bool) -> Self {
        Self {
            hex,
            raw_mode,
            log: TracingObserver,
        }
    }

    fn dump(&self, direction: PacketDirection, data: &[u8]) {
        let line = hex_line(data);
        // Blue: device to serial. Red: serial to device.
        let styled = match direction {
            PacketDirection::Rx => line.blue(),
            PacketDirection::Tx => line.red(),
        };
        let eol = if self.raw_mode { "\r\n" } else { "\n" };
        let mut out = io::stdout().lock();
        let _ = write!(out, "{}{}", styled, eol);
        let _ = out.flush();
    }
}

impl BridgeObserver for ConsoleObserver {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::Packet { direction, data } if self.hex => self.dump(*direction, data),
            other => self.log.on_event(other),
        }
    }
}

/// Translates `\n` to `\r\n` while the terminal is in raw mode.
pub struct CrlfWriter<W: Write> {
    inner: W,
    raw_mode: bool,
}

impl<W: Write> CrlfWriter<W> {
    pub fn new(inner: W, raw_mode: bool) -> Self {
        Self { inner, raw_mode }
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.raw_mode {
            return self.inner.write(buf);
        }
        let mut parts = buf.split(|&b| b == b'\n').peekable();
        while let Some(part) = parts.next() {
            self.inner.write_all(part)?;
            if parts.peek().is_some() {
                self.inner.write_all(b"\r\n")?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
