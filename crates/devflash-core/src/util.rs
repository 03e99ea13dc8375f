//! Small shared helpers: device ids and hex formatting

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error returned when a string is not a valid device id.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid device id: {0}")]
pub struct InvalidDeviceId(pub String);

/// A 24-character lowercase hex device id.
///
/// Ids are normalized to lowercase on construction; comparison and hashing
/// work on the normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Length of a device id in hex characters.
    pub const LEN: usize = 24;

    /// Validate and normalize a candidate id.
    pub fn new(raw: &str) -> Result<Self, InvalidDeviceId> {
        let trimmed = raw.trim();
        if trimmed.len() != Self::LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidDeviceId(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Whether a string looks like a device id (as opposed to a device name).
    pub fn is_valid(raw: &str) -> bool {
        Self::new(raw).is_ok()
    }

    /// The normalized id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = InvalidDeviceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Format an address the way the programmer tools expect it: `0x` followed
/// by 8 lowercase hex digits.
pub fn format_hex_address(address: u32) -> String {
    format!("{:#010x}", address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_normalizes_valid_ids() {
        let id = DeviceId::new("E00FCE68D23C1A2B3C4D5E6F").expect("valid id");
        assert_eq!(id.as_str(), "e00fce68d23c1a2b3c4d5e6f");
        assert_eq!(id.to_string(), "e00fce68d23c1a2b3c4d5e6f");
    }

    #[test]
    fn rejects_wrong_length_and_non_hex() {
        assert!(DeviceId::new("e00fce68").is_err());
        assert!(DeviceId::new("g00fce68d23c1a2b3c4d5e6f").is_err());
        assert!(DeviceId::new("").is_err());
        assert!(!DeviceId::is_valid("my-device"));
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let id = DeviceId::new("  e00fce68d23c1a2b3c4d5e6f\n").expect("valid id");
        assert_eq!(id.as_str(), "e00fce68d23c1a2b3c4d5e6f");
    }

    #[test]
    fn hex_address_formatting() {
        assert_eq!(format_hex_address(0x0806_0000), "0x08060000");
        assert_eq!(format_hex_address(0), "0x00000000");
        assert_eq!(format_hex_address(0xD400_0000), "0xd4000000");
    }
}
