//! Protocol constants for the Android Open Accessory (AOA) handshake.
//!
//! Request codes and identities follow the published AOA 1.0/2.0 documents.

use super::UsbId;

// ============================================================================
// Accessory Identities
// ============================================================================

/// Google vendor ID used by every device in accessory mode.
pub const AOA_VENDOR_ID: u16 = 0x18D1;

/// Accessory mode, data interface only.
pub const AOA_PRODUCT_ID: u16 = 0x2D00;

/// Accessory mode with ADB enabled.
pub const AOA_ADB_PRODUCT_ID: u16 = 0x2D01;

/// Identity of a device in plain accessory mode.
pub const ACCESSORY_DATA: UsbId = UsbId::new(AOA_VENDOR_ID, AOA_PRODUCT_ID);

/// Identity of a device in accessory mode with ADB enabled.
pub const ACCESSORY_ADB: UsbId = UsbId::new(AOA_VENDOR_ID, AOA_ADB_PRODUCT_ID);

/// Both accessory identities, in reconnect order.
pub const ACCESSORY_IDENTITIES: [UsbId; 2] = [ACCESSORY_DATA, ACCESSORY_ADB];

// ============================================================================
// Control Requests (Host -> Device, vendor type)
// ============================================================================

/// Query the supported AOA protocol version (IN, 2 bytes, little-endian).
pub const ACCESSORY_GET_PROTOCOL: u8 = 51;

/// Send one identification string (OUT, index selects the string).
pub const ACCESSORY_SEND_STRING: u8 = 52;

/// Ask the device to restart in accessory mode (OUT, no payload).
pub const ACCESSORY_START: u8 = 53;

/// Length of the GET_PROTOCOL response.
pub const PROTOCOL_VERSION_LEN: u16 = 2;

// ============================================================================
// Discovery
// ============================================================================

/// Wildcard vendor/product value accepted on the command line.
pub const WILDCARD_ID: u16 = 0xFFFF;

/// USB device class "defined at interface level". Android phones report it.
pub const DEVICE_CLASS_UNSPECIFIED: u8 = 0x00;

/// FTDI serial bridges enumerate with class 0 but are never Android devices.
pub const FTDI_VENDOR_ID: u16 = 0x0403;

/// VMware virtual USB hub.
pub const VMWARE_VENDOR_ID: u16 = 0x0E0F;

/// Vendors skipped during wildcard discovery.
pub const DENIED_VENDORS: &[u16] = &[FTDI_VENDOR_ID, VMWARE_VENDOR_ID];

// ============================================================================
// Endpoints
// ============================================================================

/// The interface the accessory function lives on.
pub const ACCESSORY_INTERFACE: u8 = 0;

/// Bulk IN endpoint used when descriptors do not name one.
pub const DEFAULT_ENDPOINT_IN: u8 = 0x81;

/// Bulk OUT endpoint used when descriptors do not name one.
pub const DEFAULT_ENDPOINT_OUT: u8 = 0x04;

// ============================================================================
// Sizes
// ============================================================================

/// Bulk OUT chunk size (one high-speed packet).
pub const BULK_CHUNK_SIZE: usize = 512;

/// Size of the shared pump buffer. A multiple of every bulk packet size.
pub const BRIDGE_BUFFER_SIZE: usize = 1024;
