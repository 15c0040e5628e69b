//! Mock serial link for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{SerialError, SerialLink};

#[derive(Debug, Default)]
struct Line {
    open: bool,
    opens: usize,
    closes: usize,
    fail_open: bool,
    incoming: VecDeque<Vec<u8>>,
    written: Vec<u8>,
}

/// In-memory serial line. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockSerial {
    line: Arc<Mutex<Line>>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes the far end will send; each call is delivered by one read.
    pub fn queue_incoming(&self, data: &[u8]) {
        self.line.lock().unwrap().incoming.push_back(data.to_vec());
    }

    pub fn fail_open(&self) {
        self.line.lock().unwrap().fail_open = true;
    }

    /// Everything written to the line so far.
    pub fn written(&self) -> Vec<u8> {
        self.line.lock().unwrap().written.clone()
    }

    pub fn open_count(&self) -> usize {
        self.line.lock().unwrap().opens
    }

    pub fn close_count(&self) -> usize {
        self.line.lock().unwrap().closes
    }
}

impl SerialLink for MockSerial {
    fn open(&mut self) -> Result<(), SerialError> {
        let mut line = self.line.lock().unwrap();
        if line.fail_open {
            return Err(SerialError::OpenFailed {
                path: "mock".into(),
                message: "no such device".into(),
            });
        }
        if !line.open {
            line.open = true;
            line.opens += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.line.lock().unwrap().open
    }

    fn read_with_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> usize {
        let mut line = self.line.lock().unwrap();
        if !line.open {
            return 0;
        }
        let Some(mut chunk) = line.incoming.pop_front() else {
            return 0;
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            line.incoming.push_front(chunk.split_off(n));
        }
        n
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SerialError> {
        let mut line = self.line.lock().unwrap();
        if !line.open {
            return Err(SerialError::NotOpen);
        }
        line.written.extend_from_slice(data);
        Ok(data.len())
    }

    fn close(&mut self) {
        let mut line = self.line.lock().unwrap();
        if line.open {
            line.open = false;
            line.closes += 1;
        }
    }
}
