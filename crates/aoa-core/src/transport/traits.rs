//! USB Transport layer abstraction.
//!
//! Defines the `UsbBackend` (enumeration) and `UsbTransport` (one open
//! device) traits, allowing different implementations (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{DENIED_VENDORS, DEVICE_CLASS_UNSPECIFIED, UsbId, WILDCARD_ID};
use crate::state::ClaimState;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Interface is not claimed")]
    NotClaimed,

    #[error("Endpoint 0x{address:02X} unavailable: {message}")]
    EndpointUnavailable { address: u8, message: String },

    #[error("Control transfer {request} failed: {message}")]
    ControlFailed { request: u8, message: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one bulk transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Transfer finished; bytes moved.
    Complete(usize),
    /// Timed out after moving this many bytes.
    Timeout(usize),
    /// The device went away.
    DeviceGone,
    /// Any other failure.
    IoError(String),
}

impl TransferOutcome {
    /// Apply the full-size timeout rule for IN transfers.
    ///
    /// A timeout reporting exactly `requested` bytes carries no real data and
    /// counts as zero. Shorter timeouts keep their partial count.
    pub fn discard_spurious(self, requested: usize) -> Self {
        match self {
            TransferOutcome::Timeout(n) if n == requested && n > 0 => TransferOutcome::Timeout(0),
            other => other,
        }
    }

    /// Bytes that may be forwarded.
    pub fn bytes_moved(&self) -> usize {
        match self {
            TransferOutcome::Complete(n) | TransferOutcome::Timeout(n) => *n,
            TransferOutcome::DeviceGone | TransferOutcome::IoError(_) => 0,
        }
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, TransferOutcome::DeviceGone)
    }
}

impl From<TransportError> for TransferOutcome {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Disconnected => TransferOutcome::DeviceGone,
            TransportError::Timeout { .. } => TransferOutcome::Timeout(0),
            other => TransferOutcome::IoError(other.to_string()),
        }
    }
}

/// Which attached devices are handshake candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceFilter {
    /// Any class-0 device whose vendor is not on the deny-list.
    #[default]
    Any,
    /// Exactly this vendor/product pair.
    Ids(UsbId),
}

impl DeviceFilter {
    /// Build a filter from command-line ids. An exact match needs both ids;
    /// `0xFFFF` for either one means "any".
    pub fn from_ids(vendor: u16, product: u16) -> Self {
        if vendor == WILDCARD_ID || product == WILDCARD_ID {
            DeviceFilter::Any
        } else {
            DeviceFilter::Ids(UsbId::new(vendor, product))
        }
    }

    pub fn accepts(&self, id: UsbId, device_class: u8) -> bool {
        match self {
            DeviceFilter::Ids(wanted) => *wanted == id,
            DeviceFilter::Any => {
                device_class == DEVICE_CLASS_UNSPECIFIED && !DENIED_VENDORS.contains(&id.vendor)
            }
        }
    }
}

/// Enumerates and opens devices. Owns whatever context the USB library needs.
pub trait UsbBackend {
    type Device: UsbTransport;

    /// Identities of attached devices accepted by `filter`, in enumeration order.
    fn candidates(&self, filter: &DeviceFilter) -> Result<Vec<UsbId>, TransportError>;

    /// Open the first attached device with this identity. Does not claim.
    fn open(&self, id: UsbId) -> Result<Self::Device, TransportError>;
}

/// One open USB device.
///
/// Dropping an implementation must perform the same teardown as `release`.
pub trait UsbTransport {
    /// Identity the device was opened under.
    fn id(&self) -> UsbId;

    /// Current ownership state.
    fn claim_state(&self) -> ClaimState;

    /// Detach any kernel driver from interface 0, then claim it.
    fn claim_interface(&mut self) -> Result<(), TransportError>;

    /// Vendor IN control transfer.
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Vendor OUT control transfer. Returns bytes sent.
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// One bulk IN attempt into `buf`, with the full-size timeout rule applied.
    fn bulk_read(&mut self, buf: &mut [u8], timeout: Duration) -> TransferOutcome;

    /// One bulk OUT attempt of the whole of `data`.
    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> TransferOutcome;

    /// Undo whatever setup succeeded. Idempotent.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_size_timeout_is_discarded() {
        let outcome = TransferOutcome::Timeout(1024).discard_spurious(1024);
        assert_eq!(outcome.bytes_moved(), 0);
    }

    #[test]
    fn test_partial_timeout_is_kept() {
        let outcome = TransferOutcome::Timeout(17).discard_spurious(1024);
        assert_eq!(outcome, TransferOutcome::Timeout(17));
        assert_eq!(outcome.bytes_moved(), 17);
    }

    #[test]
    fn test_complete_full_size_is_kept() {
        let outcome = TransferOutcome::Complete(1024).discard_spurious(1024);
        assert_eq!(outcome.bytes_moved(), 1024);
    }

    #[test]
    fn test_wildcard_filter_skips_denied_vendors() {
        let filter = DeviceFilter::from_ids(0xFFFF, 0xFFFF);
        assert_eq!(filter, DeviceFilter::Any);
        assert!(filter.accepts(UsbId::new(0x04E8, 0x6860), 0));
        assert!(!filter.accepts(UsbId::new(0x0403, 0x6001), 0));
        assert!(!filter.accepts(UsbId::new(0x0E0F, 0x0003), 0));
        assert!(!filter.accepts(UsbId::new(0x1D6B, 0x0002), 9));
    }

    #[test]
    fn test_half_wildcard_falls_back_to_any() {
        assert_eq!(DeviceFilter::from_ids(0xFFFF, 0x6860), DeviceFilter::Any);
        assert_eq!(DeviceFilter::from_ids(0x04E8, 0xFFFF), DeviceFilter::Any);
        assert!(DeviceFilter::from_ids(0xFFFF, 0x6860).accepts(UsbId::new(0x04E8, 0x6860), 0));
    }

    #[test]
    fn test_explicit_filter_ignores_class() {
        let filter = DeviceFilter::from_ids(0x0403, 0x6001);
        assert!(filter.accepts(UsbId::new(0x0403, 0x6001), 0xFF));
        assert!(!filter.accepts(UsbId::new(0x0403, 0x6010), 0xFF));
    }

    #[test]
    fn test_disconnect_error_maps_to_gone() {
        assert!(TransferOutcome::from(TransportError::Disconnected).is_gone());
        assert_eq!(
            TransferOutcome::from(TransportError::Timeout { timeout_ms: 2 }),
            TransferOutcome::Timeout(0)
        );
    }
}
