//! Protocol module - AOA identities, request codes and identification strings.

pub mod constants;
pub mod strings;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use constants::*;
pub use strings::{AccessoryStrings, StringIndex};

/// A USB vendor/product pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl UsbId {
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }

    /// Whether this is one of the two accessory-mode identities.
    pub fn is_accessory(&self) -> bool {
        ACCESSORY_IDENTITIES.contains(self)
    }

    /// Whether this identity has ADB enabled alongside the accessory function.
    pub fn has_adb(&self) -> bool {
        *self == ACCESSORY_ADB
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor, self.product)
    }
}
