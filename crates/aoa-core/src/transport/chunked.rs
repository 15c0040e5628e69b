//! Chunked bulk OUT writes with stall detection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{TransferOutcome, UsbTransport};
use crate::protocol::BULK_CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkedWriteConfig {
    pub chunk_size: usize,
    pub chunk_timeout_ms: u64,
    /// Consecutive zero-progress attempts before giving up.
    pub max_stalls: u32,
}

impl Default for ChunkedWriteConfig {
    fn default() -> Self {
        Self {
            chunk_size: BULK_CHUNK_SIZE,
            chunk_timeout_ms: 2,
            max_stalls: 5,
        }
    }
}

impl ChunkedWriteConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

/// Write `data` to the bulk OUT endpoint in `chunk_size` pieces.
///
/// Best effort: returns the number of bytes delivered, which is less than
/// `data.len()` when the device stalls or errors.
pub fn write_chunked<T: UsbTransport + ?Sized>(
    usb: &mut T,
    data: &[u8],
    config: &ChunkedWriteConfig,
) -> usize {
    let chunk_size = config.chunk_size.max(1);
    let mut sent = 0;
    let mut stalls = 0;

    while sent < data.len() {
        let end = (sent + chunk_size).min(data.len());
        match usb.bulk_write(&data[sent..end], config.chunk_timeout()) {
            TransferOutcome::Complete(n) | TransferOutcome::Timeout(n) if n > 0 => {
                sent += n;
                stalls = 0;
                continue;
            }
            TransferOutcome::Complete(_) | TransferOutcome::Timeout(_) => {}
            outcome => {
                debug!(?outcome, sent, total = data.len(), "Bulk write aborted");
                break;
            }
        }

        stalls += 1;
        if stalls >= config.max_stalls {
            debug!(stalls, sent, total = data.len(), "Bulk write stalled");
            break;
        }
    }

    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ACCESSORY_DATA;
    use crate::transport::mock::{MockUsb, MockWrite};
    use crate::transport::UsbBackend;

    fn open_claimed(mock: &MockUsb) -> crate::transport::MockDevice {
        mock.attach(ACCESSORY_DATA, 0);
        let mut dev = mock.open(ACCESSORY_DATA).unwrap();
        dev.claim_interface().unwrap();
        dev
    }

    #[test]
    fn test_payload_split_into_chunks() {
        let mock = MockUsb::new();
        let mut dev = open_claimed(&mock);
        let payload = vec![0xA5u8; 1500];

        let sent = write_chunked(&mut dev, &payload, &ChunkedWriteConfig::default());

        assert_eq!(sent, 1500);
        let sizes: Vec<usize> = mock.bulk_writes().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![512, 512, 476]);
    }

    #[test]
    fn test_stalled_second_chunk_aborts_after_first() {
        let mock = MockUsb::new();
        let mut dev = open_claimed(&mock);
        mock.script_writes([
            MockWrite::Accept,
            MockWrite::Stall,
            MockWrite::Stall,
            MockWrite::Stall,
            MockWrite::Stall,
            MockWrite::Stall,
        ]);

        let sent = write_chunked(&mut dev, &vec![1u8; 1500], &ChunkedWriteConfig::default());

        assert_eq!(sent, 512);
        assert_eq!(mock.bulk_write_attempts(), 6);
    }

    #[test]
    fn test_progress_resets_stall_counter() {
        let mock = MockUsb::new();
        let mut dev = open_claimed(&mock);
        mock.script_writes([
            MockWrite::Stall,
            MockWrite::Stall,
            MockWrite::Stall,
            MockWrite::Stall,
            MockWrite::Partial(100),
            MockWrite::Stall,
            MockWrite::Stall,
            MockWrite::Stall,
            MockWrite::Stall,
        ]);

        let sent = write_chunked(&mut dev, &vec![2u8; 600], &ChunkedWriteConfig::default());

        assert_eq!(sent, 600);
    }

    #[test]
    fn test_hard_error_aborts_immediately() {
        let mock = MockUsb::new();
        let mut dev = open_claimed(&mock);
        mock.script_writes([MockWrite::Accept, MockWrite::Fail]);

        let sent = write_chunked(&mut dev, &vec![3u8; 1500], &ChunkedWriteConfig::default());

        assert_eq!(sent, 512);
        assert_eq!(mock.bulk_write_attempts(), 2);
    }

    #[test]
    fn test_empty_payload_writes_nothing() {
        let mock = MockUsb::new();
        let mut dev = open_claimed(&mock);
        assert_eq!(write_chunked(&mut dev, &[], &ChunkedWriteConfig::default()), 0);
        assert_eq!(mock.bulk_write_attempts(), 0);
    }
}
