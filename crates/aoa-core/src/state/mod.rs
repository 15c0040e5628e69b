//! State machine module.

pub mod handshake;
pub mod machine;

pub use handshake::{AccessoryDevice, AccessoryHandshake, HandshakeConfig, HandshakeError};
pub use machine::{ClaimState, HandshakeState, TeardownStep};
