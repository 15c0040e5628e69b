//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow the bridge without
//! tight coupling to the core logic.

use std::fmt;
use std::sync::Mutex;

use crate::protocol::UsbId;
use crate::state::HandshakeState;

/// Bridge session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    /// Looking for a device and running the handshake.
    WaitingForDevice,
    /// Pumping bytes.
    Bridging,
    /// Device went away; resources released.
    Disconnected,
    /// Shutdown requested; session ending.
    ShuttingDown,
}

impl fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgePhase::WaitingForDevice => write!(f, "Waiting for Device"),
            BridgePhase::Bridging => write!(f, "Bridging"),
            BridgePhase::Disconnected => write!(f, "Disconnected"),
            BridgePhase::ShuttingDown => write!(f, "Shutting Down"),
        }
    }
}

/// Direction of a forwarded packet, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Rx, // Receive (Device -> Host)
    Tx, // Transmit (Host -> Device)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Rx => write!(f, "RX"),
            PacketDirection::Tx => write!(f, "TX"),
        }
    }
}

/// Events emitted by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Accessory device ready.
    DeviceConnected {
        native: UsbId,
        accessory: UsbId,
        aoa_version: u16,
    },
    /// Accessory device disconnected.
    DeviceDisconnected,
    /// Session phase changed.
    PhaseChanged { from: BridgePhase, to: BridgePhase },
    /// Handshake state changed.
    HandshakeStep {
        from: HandshakeState,
        to: HandshakeState,
    },
    /// Bytes forwarded across the bridge.
    Packet {
        direction: PacketDirection,
        data: Vec<u8>,
    },
}

/// Observer trait for receiving bridge events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait BridgeObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &BridgeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BridgeObserver for NullObserver {
    fn on_event(&self, _event: &BridgeEvent) {}
}

/// Observer that keeps every event, for inspection.
#[derive(Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<BridgeEvent>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Handshake states entered, in order.
    pub fn handshake_states(&self) -> Vec<HandshakeState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::HandshakeStep { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl BridgeObserver for CollectingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BridgeObserver for TracingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::DeviceConnected {
                native,
                accessory,
                aoa_version,
            } => {
                tracing::info!(
                    native = %native,
                    accessory = %accessory,
                    aoa_version,
                    "Android device connected"
                );
            }
            BridgeEvent::DeviceDisconnected => {
                tracing::warn!("AOA device disconnected");
            }
            BridgeEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            BridgeEvent::HandshakeStep { from, to } => {
                tracing::debug!(from = %from, to = %to, "Handshake state");
            }
            BridgeEvent::Packet { direction, data } => {
                tracing::trace!(dir = %direction, len = data.len(), "Packet");
            }
        }
    }
}
