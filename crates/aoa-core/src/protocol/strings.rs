//! Accessory identification strings.
//!
//! The Android accessory framework matches an app to the accessory by
//! manufacturer, model and version, so these are configurable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a SEND_STRING request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StringIndex {
    Manufacturer = 0,
    Model = 1,
    Description = 2,
    Version = 3,
    Uri = 4,
    Serial = 5,
}

impl StringIndex {
    /// All indices in the order they are sent.
    pub const ALL: [StringIndex; 6] = [
        StringIndex::Manufacturer,
        StringIndex::Model,
        StringIndex::Description,
        StringIndex::Version,
        StringIndex::Uri,
        StringIndex::Serial,
    ];

    pub fn value(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for StringIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StringIndex::Manufacturer => write!(f, "manufacturer"),
            StringIndex::Model => write!(f, "model"),
            StringIndex::Description => write!(f, "description"),
            StringIndex::Version => write!(f, "version"),
            StringIndex::Uri => write!(f, "uri"),
            StringIndex::Serial => write!(f, "serial"),
        }
    }
}

/// Strings identifying this bridge to the Android accessory framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessoryStrings {
    pub manufacturer: String,
    pub model: String,
    pub description: String,
    pub version: String,
    pub uri: String,
    pub serial: String,
}

impl Default for AccessoryStrings {
    fn default() -> Self {
        Self {
            manufacturer: "SHINE".into(),
            model: "Android Accessory Emulator".into(),
            description: "SHINE Android Accessory Emulator".into(),
            version: "1.0".into(),
            uri: "https://github.com/shineworld/uartaccessory".into(),
            serial: "SHINE Emulator".into(),
        }
    }
}

impl AccessoryStrings {
    pub fn get(&self, index: StringIndex) -> &str {
        match index {
            StringIndex::Manufacturer => &self.manufacturer,
            StringIndex::Model => &self.model,
            StringIndex::Description => &self.description,
            StringIndex::Version => &self.version,
            StringIndex::Uri => &self.uri,
            StringIndex::Serial => &self.serial,
        }
    }

    /// Wire payload for one string.
    ///
    /// The manufacturer goes out length-exact, every other string carries a
    /// trailing NUL.
    pub fn payload(&self, index: StringIndex) -> Vec<u8> {
        let mut bytes = self.get(index).as_bytes().to_vec();
        if index != StringIndex::Manufacturer {
            bytes.push(0);
        }
        bytes
    }

    /// All six payloads in send order.
    pub fn payloads(&self) -> impl Iterator<Item = (StringIndex, Vec<u8>)> + '_ {
        StringIndex::ALL.into_iter().map(|i| (i, self.payload(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manufacturer_is_length_exact() {
        let strings = AccessoryStrings::default();
        assert_eq!(strings.payload(StringIndex::Manufacturer), b"SHINE");
    }

    #[test]
    fn test_other_strings_are_nul_terminated() {
        let strings = AccessoryStrings::default();
        assert_eq!(strings.payload(StringIndex::Version), b"1.0\0");
        assert_eq!(strings.payload(StringIndex::Serial), b"SHINE Emulator\0");
    }

    #[test]
    fn test_payload_order_matches_indices() {
        let strings = AccessoryStrings::default();
        let order: Vec<u16> = strings.payloads().map(|(i, _)| i.value()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let strings: AccessoryStrings = toml::from_str("model = \"UART Bridge\"").unwrap();
        assert_eq!(strings.model, "UART Bridge");
        assert_eq!(strings.manufacturer, "SHINE");
    }
}
