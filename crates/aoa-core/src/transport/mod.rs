//! Transport layer module.

pub mod chunked;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use chunked::{ChunkedWriteConfig, write_chunked};
pub use mock::{MockDevice, MockRead, MockUsb, MockWrite};
pub use self::nusb::{NusbBackend, NusbDevice};
pub use traits::{DeviceFilter, TransferOutcome, TransportError, UsbBackend, UsbTransport};
