//! State enums for the accessory handshake and USB claim bookkeeping.

use std::fmt;

/// States of the AOA handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Opening and claiming a candidate device.
    #[default]
    Discovering,
    /// Device was already enumerated in accessory mode.
    AlreadyInAccessoryMode,
    /// Querying the AOA protocol version.
    Probing,
    /// Sending the six identification strings.
    StringsSent,
    /// START issued, handle being released.
    ModeSwitchRequested,
    /// Polling for the accessory-mode identity.
    Reconnecting,
    /// Accessory-mode device opened and claimed.
    Ready,
    /// This candidate cannot be used.
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Discovering => write!(f, "DISCOVERING"),
            HandshakeState::AlreadyInAccessoryMode => write!(f, "ALREADY_ACCESSORY"),
            HandshakeState::Probing => write!(f, "PROBING"),
            HandshakeState::StringsSent => write!(f, "STRINGS_SENT"),
            HandshakeState::ModeSwitchRequested => write!(f, "MODE_SWITCH_REQUESTED"),
            HandshakeState::Reconnecting => write!(f, "RECONNECTING"),
            HandshakeState::Ready => write!(f, "READY"),
            HandshakeState::Failed => write!(f, "FAILED"),
        }
    }
}

impl HandshakeState {
    /// Check if this state ends the handshake.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandshakeState::AlreadyInAccessoryMode | HandshakeState::Ready | HandshakeState::Failed
        )
    }

    /// Check if this state yields a usable device.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            HandshakeState::AlreadyInAccessoryMode | HandshakeState::Ready
        )
    }
}

/// Ownership state of one USB handle.
///
/// `driver_detached` survives from `Opened` into `Claimed` so the kernel
/// driver gets reattached even when the claim itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimState {
    #[default]
    Unopened,
    Opened { driver_detached: bool },
    Claimed { driver_detached: bool },
    Released,
}

/// One action owed at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    ReleaseInterface,
    ReattachKernelDriver,
    CloseHandle,
}

impl ClaimState {
    /// Record a successful kernel driver detach.
    pub fn detached(self) -> Self {
        match self {
            ClaimState::Opened { .. } => ClaimState::Opened {
                driver_detached: true,
            },
            other => other,
        }
    }

    /// Record a successful interface claim.
    pub fn claimed(self) -> Self {
        match self {
            ClaimState::Opened { driver_detached } | ClaimState::Claimed { driver_detached } => {
                ClaimState::Claimed { driver_detached }
            }
            other => other,
        }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimState::Claimed { .. })
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ClaimState::Opened { .. } | ClaimState::Claimed { .. })
    }

    /// The inverse of every setup action taken so far, in reverse order.
    pub fn teardown_steps(&self) -> Vec<TeardownStep> {
        let mut steps = Vec::with_capacity(3);
        let driver_detached = match *self {
            ClaimState::Unopened | ClaimState::Released => return steps,
            ClaimState::Opened { driver_detached } => driver_detached,
            ClaimState::Claimed { driver_detached } => {
                steps.push(TeardownStep::ReleaseInterface);
                driver_detached
            }
        };
        if driver_detached {
            steps.push(TeardownStep::ReattachKernelDriver);
        }
        steps.push(TeardownStep::CloseHandle);
        steps
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimState::Unopened => write!(f, "UNOPENED"),
            ClaimState::Opened { .. } => write!(f, "OPENED"),
            ClaimState::Claimed { .. } => write!(f, "CLAIMED"),
            ClaimState::Released => write!(f, "RELEASED"),
        }
    }
}
