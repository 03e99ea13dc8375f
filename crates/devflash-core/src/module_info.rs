//! Binary module prefix and suffix parsing
//!
//! Every firmware module starts with a 24-byte prefix describing where the
//! module lives, what it is, and what it depends on, and ends with a CRC-32
//! (ISO-HDLC) of everything before the trailing 4 bytes. devflash only needs
//! the prefix fields and the CRC verdict; dependency checking and the rest of
//! the module format stay with Device OS itself.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::ModuleParseError;

/// Size of the module prefix header in bytes.
pub const MODULE_PREFIX_SIZE: usize = 24;

/// Size of the trailing CRC suffix in bytes.
pub const MODULE_SUFFIX_CRC_SIZE: usize = 4;

/// Module prefix flag: the prefix must be stripped before the image is
/// written to its storage address.
pub const FLAG_DROP_MODULE_INFO: u8 = 0x01;

/// Module prefix flag: the image payload is encrypted.
pub const FLAG_ENCRYPTED: u8 = 0x08;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Module function byte of the prefix header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFunction {
    /// No function (erased or invalid slot)
    None,
    /// Resource blob
    Resource,
    /// Bootloader
    Bootloader,
    /// Monolithic firmware image
    MonoFirmware,
    /// Device OS system part
    SystemPart,
    /// User application
    UserPart,
    /// Settings blob
    Settings,
    /// Network coprocessor firmware
    NcpFirmware,
    /// Radio stack
    RadioStack,
}

impl ModuleFunction {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ModuleFunction::None),
            1 => Some(ModuleFunction::Resource),
            2 => Some(ModuleFunction::Bootloader),
            3 => Some(ModuleFunction::MonoFirmware),
            4 => Some(ModuleFunction::SystemPart),
            5 => Some(ModuleFunction::UserPart),
            6 => Some(ModuleFunction::Settings),
            7 => Some(ModuleFunction::NcpFirmware),
            8 => Some(ModuleFunction::RadioStack),
            _ => None,
        }
    }

    /// Tag used in log output.
    pub fn tag(&self) -> &'static str {
        match self {
            ModuleFunction::None => "none",
            ModuleFunction::Resource => "resource",
            ModuleFunction::Bootloader => "bootloader",
            ModuleFunction::MonoFirmware => "mono_firmware",
            ModuleFunction::SystemPart => "system_part",
            ModuleFunction::UserPart => "user_part",
            ModuleFunction::Settings => "settings",
            ModuleFunction::NcpFirmware => "ncp_firmware",
            ModuleFunction::RadioStack => "radio_stack",
        }
    }
}

/// Dependency declaration carried in the prefix header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleDependency {
    /// Function byte of the dependency
    pub function: u8,
    /// Index of the dependency
    pub index: u8,
    /// Minimum required version
    pub version: u16,
}

/// Decoded module prefix header.
#[derive(Debug, Clone, Copy)]
pub struct ModulePrefix {
    /// Load address of the first byte of the module
    pub start_address: u32,
    /// Address one past the last byte covered by the CRC
    pub end_address: u32,
    /// Prefix flag bits
    pub flags: u8,
    /// Monotonic module version
    pub version: u16,
    /// Target platform id
    pub platform_id: u16,
    /// Module function
    pub function: ModuleFunction,
    /// Module index
    pub index: u8,
    /// Declared dependency
    pub dependency: ModuleDependency,
}

impl ModulePrefix {
    /// Whether the prefix must be dropped before writing.
    pub fn drop_header(&self) -> bool {
        self.flags & FLAG_DROP_MODULE_INFO != 0
    }

    /// Whether the payload is encrypted.
    pub fn encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Module size as stored on the device: the addressed range plus the
    /// 4-byte CRC suffix.
    pub fn module_size(&self) -> u64 {
        u64::from(self.end_address.saturating_sub(self.start_address)) + 4
    }
}

/// Parse the prefix header from the start of a module binary.
///
/// The caller supplies the path only for error reporting.
pub fn parse_prefix(data: &[u8], path: &std::path::Path) -> Result<ModulePrefix, ModuleParseError> {
    if data.len() < MODULE_PREFIX_SIZE + MODULE_SUFFIX_CRC_SIZE {
        return Err(ModuleParseError::TooShort {
            path: path.to_path_buf(),
        });
    }

    let start_address = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let end_address = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    // data[8] is reserved
    let flags = data[9];
    let version = u16::from_le_bytes([data[10], data[11]]);
    let platform_id = u16::from_le_bytes([data[12], data[13]]);
    let function_byte = data[14];
    let index = data[15];
    let dependency = ModuleDependency {
        function: data[16],
        index: data[17],
        version: u16::from_le_bytes([data[18], data[19]]),
    };

    let function =
        ModuleFunction::from_byte(function_byte).ok_or(ModuleParseError::UnknownFunction {
            path: path.to_path_buf(),
            tag: function_byte,
        })?;

    Ok(ModulePrefix {
        start_address,
        end_address,
        flags,
        version,
        platform_id,
        function,
        index,
        dependency,
    })
}

/// Verify the trailing CRC-32 suffix of a module binary.
///
/// The checksum covers everything up to the final 4 bytes, which store the
/// expected value big-endian. Returns `false` for files too short to carry a
/// suffix.
pub fn verify_suffix_crc(data: &[u8]) -> bool {
    if data.len() < MODULE_SUFFIX_CRC_SIZE {
        return false;
    }
    let (body, suffix) = data.split_at(data.len() - MODULE_SUFFIX_CRC_SIZE);
    let expected = u32::from_be_bytes([suffix[0], suffix[1], suffix[2], suffix[3]]);
    CRC32.checksum(body) == expected
}

/// Compute the CRC-32 suffix value for a module body.
pub fn compute_suffix_crc(body: &[u8]) -> u32 {
    CRC32.checksum(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn prefix_bytes(
        start: u32,
        end: u32,
        flags: u8,
        version: u16,
        platform_id: u16,
        function: u8,
        index: u8,
    ) -> Vec<u8> {
        let mut data = vec![0u8; MODULE_PREFIX_SIZE];
        data[0..4].copy_from_slice(&start.to_le_bytes());
        data[4..8].copy_from_slice(&end.to_le_bytes());
        data[9] = flags;
        data[10..12].copy_from_slice(&version.to_le_bytes());
        data[12..14].copy_from_slice(&platform_id.to_le_bytes());
        data[14] = function;
        data[15] = index;
        data
    }

    fn with_crc(mut data: Vec<u8>) -> Vec<u8> {
        let crc = compute_suffix_crc(&data);
        data.extend_from_slice(&crc.to_be_bytes());
        data
    }

    #[test]
    fn parses_prefix_fields() {
        let data = with_crc(prefix_bytes(0x0803_0000, 0x0805_0000, 0x01, 2101, 13, 4, 1));
        let prefix = parse_prefix(&data, Path::new("sys.bin")).expect("prefix");
        assert_eq!(prefix.start_address, 0x0803_0000);
        assert_eq!(prefix.end_address, 0x0805_0000);
        assert_eq!(prefix.version, 2101);
        assert_eq!(prefix.platform_id, 13);
        assert_eq!(prefix.function, ModuleFunction::SystemPart);
        assert_eq!(prefix.index, 1);
        assert!(prefix.drop_header());
        assert!(!prefix.encrypted());
        assert_eq!(prefix.module_size(), 0x0002_0000 + 4);
    }

    #[test]
    fn rejects_short_files() {
        let err = parse_prefix(&[0u8; 8], Path::new("short.bin")).expect_err("too short");
        assert!(matches!(err, ModuleParseError::TooShort { .. }));
    }

    #[test]
    fn rejects_unknown_function() {
        let data = with_crc(prefix_bytes(0, 0x100, 0, 1, 13, 0x2a, 0));
        let err = parse_prefix(&data, Path::new("odd.bin")).expect_err("unknown function");
        assert!(matches!(
            err,
            ModuleParseError::UnknownFunction { tag: 0x2a, .. }
        ));
    }

    #[test]
    fn crc_round_trip() {
        let data = with_crc(prefix_bytes(0, 0x100, 0, 1, 13, 5, 0));
        assert!(verify_suffix_crc(&data));

        let mut corrupted = data.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        assert!(!verify_suffix_crc(&corrupted));
    }

    #[test]
    fn crc_rejects_tiny_input() {
        assert!(!verify_suffix_crc(&[0u8; 3]));
    }
}
