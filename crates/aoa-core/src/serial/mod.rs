//! Serial (UART) side of the bridge.

pub mod mock;
pub mod port;
pub mod traits;

pub use mock::MockSerial;
pub use port::{SerialSession, SerialSettings};
pub use traits::{Parity, SerialError, SerialLink, TimedRead, read_until_deadline};
