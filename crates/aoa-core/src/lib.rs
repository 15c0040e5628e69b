//! AOA-Core: Android Open Accessory to UART bridge in Rust.
//!
//! This crate switches an attached Android device into accessory mode and
//! then forwards bytes between its bulk endpoints and a serial port.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: AOA identities, request codes, identification strings
//! - **Transport**: USB abstraction (nusb, mock) and chunked bulk writes
//! - **Serial**: serial line abstraction (serialport, mock)
//! - **State**: handshake state machine and claim bookkeeping
//! - **Bridge**: the byte pump
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator and configuration
//!
//! # Example
//!
//! ```no_run
//! use aoa_core::session::{BridgeConfig, BridgeSession};
//!
//! let mut config = BridgeConfig::default();
//! config.serial.path = "/dev/ttyUSB1".to_string();
//!
//! let mut session = BridgeSession::new(config);
//! session.run().expect("bridge failed");
//! ```

pub mod bridge;
pub mod events;
pub mod protocol;
pub mod retry;
pub mod serial;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use bridge::{BridgeLoop, PumpConfig, PumpExit};
pub use events::{
    BridgeEvent, BridgeObserver, BridgePhase, NullObserver, PacketDirection,
    TracingObserver,
};
pub use protocol::{AccessoryStrings, UsbId};
pub use retry::{RetryPolicy, retry};
pub use serial::{Parity, SerialError, SerialLink, SerialSession, SerialSettings};
pub use session::{BridgeConfig, BridgeSession, SessionError};
pub use shutdown::ShutdownSignal;
pub use state::{AccessoryHandshake, HandshakeConfig, HandshakeError, HandshakeState};
pub use transport::{
    DeviceFilter, MockUsb, NusbBackend, TransferOutcome, TransportError, UsbBackend, UsbTransport,
};
