//! Canonical firmware module records
//!
//! A [`Module`] joins a parsed binary prefix with the platform catalog: it
//! knows which platform and slot the file targets, where it must be written,
//! and everything the transports need to write it. Modules are produced by
//! [`parse_module_file`] during release resolution and directory scans.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::catalog::{ModuleType, PlatformCatalog, Storage};
use crate::error::ModuleParseError;
use crate::module_info::{self, ModuleFunction, MODULE_PREFIX_SIZE};

/// Identity of a module within a resolved set.
pub type ModuleKey = (u16, ModuleType, u8);

/// A firmware module binary ready to flash.
#[derive(Debug, Clone)]
pub struct Module {
    /// Target platform id
    pub platform_id: u16,
    /// Target platform short name
    pub platform_name: String,
    /// Module class
    pub module_type: ModuleType,
    /// Module index (1 for un-indexed slots)
    pub index: u8,
    /// Monotonic module version
    pub version: u16,
    /// Target storage region
    pub storage: Storage,
    /// Base address within the target storage
    pub address: u32,
    /// On-device module size (addressed range plus CRC suffix)
    pub module_size: u64,
    /// Size of the prefix header
    pub header_size: u32,
    /// Whether the header must be stripped before writing
    pub drop_header: bool,
    /// Whether the payload is encrypted
    pub encrypted: bool,
    /// Whether the platform requires this slot to be encrypted
    pub needs_encryption: bool,
    /// Whether the trailing CRC matched
    pub crc_valid: bool,
    /// Size of the file on disk
    pub file_size: u64,
    /// Absolute path of the file on disk
    pub file_path: PathBuf,
    /// Whether the file came from the bundled asset directory
    pub is_asset: bool,
}

impl Module {
    /// Identity key `(platform_id, type, index)`; unique within a resolved
    /// module set.
    pub fn key(&self) -> ModuleKey {
        (self.platform_id, self.module_type, self.index)
    }

    /// File name of the backing binary, for log output.
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_path.display().to_string())
    }
}

fn module_type_for_function(
    function: ModuleFunction,
    path: &Path,
) -> Result<ModuleType, ModuleParseError> {
    match function {
        ModuleFunction::UserPart => Ok(ModuleType::UserPart),
        ModuleFunction::SystemPart => Ok(ModuleType::SystemPart),
        ModuleFunction::Bootloader => Ok(ModuleType::Bootloader),
        ModuleFunction::RadioStack => Ok(ModuleType::RadioStack),
        ModuleFunction::NcpFirmware => Ok(ModuleType::NcpFirmware),
        ModuleFunction::MonoFirmware
        | ModuleFunction::Resource
        | ModuleFunction::Settings
        | ModuleFunction::None => Err(ModuleParseError::UnsupportedModule {
            path: path.to_path_buf(),
            function: function.tag(),
        }),
    }
}

/// Parse a candidate firmware file into a canonical [`Module`].
///
/// A CRC mismatch is reported as a warning on the returned record, not a
/// failure; everything else that disqualifies the file is a
/// [`ModuleParseError`], most of which directory scans treat as skippable.
pub fn parse_module_file(
    catalog: &PlatformCatalog,
    path: &Path,
) -> Result<Module, ModuleParseError> {
    let data = fs::read(path).map_err(|source| ModuleParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let prefix = module_info::parse_prefix(&data, path)?;
    let module_type = module_type_for_function(prefix.function, path)?;

    let platform =
        catalog
            .by_id(prefix.platform_id)
            .map_err(|_| ModuleParseError::UnknownPlatform {
                path: path.to_path_buf(),
                platform_id: prefix.platform_id,
            })?;

    // Un-indexed slots are reported as index 1 so the identity key stays
    // total.
    let index = if prefix.index == 0 { 1 } else { prefix.index };

    let descriptor = platform
        .storage_for_module(module_type, index)
        .ok_or_else(|| ModuleParseError::StorageUnknown {
            path: path.to_path_buf(),
            platform: platform.name.to_string(),
            module_type,
            index,
        })?;

    let crc_valid = module_info::verify_suffix_crc(&data);
    if !crc_valid {
        warn!(
            file = %path.display(),
            "Module has an invalid checksum; flashing it anyway"
        );
    }

    Ok(Module {
        platform_id: platform.id,
        platform_name: platform.name.to_string(),
        module_type,
        index,
        version: prefix.version,
        storage: descriptor.storage,
        address: prefix.start_address,
        module_size: prefix.module_size(),
        header_size: MODULE_PREFIX_SIZE as u32,
        drop_header: prefix.drop_header(),
        encrypted: prefix.encrypted(),
        needs_encryption: descriptor.encrypted,
        crc_valid,
        file_size: data.len() as u64,
        file_path: path.to_path_buf(),
        is_asset: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_info::{compute_suffix_crc, FLAG_DROP_MODULE_INFO};
    use std::io::Write;
    use tempfile::TempDir;

    fn write_module(
        dir: &Path,
        name: &str,
        platform_id: u16,
        function: u8,
        index: u8,
        version: u16,
        flags: u8,
    ) -> PathBuf {
        let mut data = vec![0u8; MODULE_PREFIX_SIZE];
        let start: u32 = 0x0003_0000;
        let end: u32 = start + 0x400;
        data[0..4].copy_from_slice(&start.to_le_bytes());
        data[4..8].copy_from_slice(&end.to_le_bytes());
        data[9] = flags;
        data[10..12].copy_from_slice(&version.to_le_bytes());
        data[12..14].copy_from_slice(&platform_id.to_le_bytes());
        data[14] = function;
        data[15] = index;
        data.extend_from_slice(&[0xA5; 64]);
        let crc = compute_suffix_crc(&data);
        data.extend_from_slice(&crc.to_be_bytes());

        let path = dir.join(name);
        let mut file = fs::File::create(&path).expect("create module file");
        file.write_all(&data).expect("write module file");
        path
    }

    #[test]
    fn parses_a_system_part() {
        let dir = TempDir::new().expect("temp dir");
        let catalog = PlatformCatalog::new();
        let path = write_module(dir.path(), "system-part1.bin", 13, 4, 1, 2101, 0);

        let module = parse_module_file(&catalog, &path).expect("module");
        assert_eq!(module.platform_id, 13);
        assert_eq!(module.platform_name, "boron");
        assert_eq!(module.module_type, ModuleType::SystemPart);
        assert_eq!(module.index, 1);
        assert_eq!(module.version, 2101);
        assert_eq!(module.storage, Storage::InternalFlash);
        assert_eq!(module.address, 0x0003_0000);
        assert!(module.crc_valid);
        assert_eq!(
            module.file_size,
            fs::metadata(&path).expect("metadata").len()
        );
        assert_eq!(module.key(), (13, ModuleType::SystemPart, 1));
    }

    #[test]
    fn zero_index_normalizes_to_one() {
        let dir = TempDir::new().expect("temp dir");
        let catalog = PlatformCatalog::new();
        let path = write_module(dir.path(), "tinker.bin", 13, 5, 0, 100, 0);

        let module = parse_module_file(&catalog, &path).expect("module");
        assert_eq!(module.index, 1);
    }

    #[test]
    fn drop_header_flag_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        let catalog = PlatformCatalog::new();
        let path = write_module(
            dir.path(),
            "radio.bin",
            13,
            8,
            0,
            200,
            FLAG_DROP_MODULE_INFO,
        );

        let module = parse_module_file(&catalog, &path).expect("module");
        assert!(module.drop_header);
        assert_eq!(module.header_size, MODULE_PREFIX_SIZE as u32);
    }

    #[test]
    fn unsupported_function_is_skippable() {
        let dir = TempDir::new().expect("temp dir");
        let catalog = PlatformCatalog::new();
        let path = write_module(dir.path(), "mono.bin", 13, 3, 0, 1, 0);

        let err = parse_module_file(&catalog, &path).expect_err("mono firmware rejected");
        assert!(matches!(
            err,
            ModuleParseError::UnsupportedModule {
                function: "mono_firmware",
                ..
            }
        ));
        assert!(err.is_skippable());
    }

    #[test]
    fn unknown_platform_is_skippable() {
        let dir = TempDir::new().expect("temp dir");
        let catalog = PlatformCatalog::new();
        let path = write_module(dir.path(), "mystery.bin", 999, 5, 0, 1, 0);

        let err = parse_module_file(&catalog, &path).expect_err("unknown platform rejected");
        assert!(matches!(
            err,
            ModuleParseError::UnknownPlatform {
                platform_id: 999,
                ..
            }
        ));
        assert!(err.is_skippable());
    }

    #[test]
    fn missing_storage_descriptor_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let catalog = PlatformCatalog::new();
        // Photon has no radio stack slot.
        let path = write_module(dir.path(), "radio.bin", 6, 8, 0, 1, 0);

        let err = parse_module_file(&catalog, &path).expect_err("no storage for slot");
        assert!(matches!(err, ModuleParseError::StorageUnknown { .. }));
    }

    #[test]
    fn corrupted_crc_still_parses() {
        let dir = TempDir::new().expect("temp dir");
        let catalog = PlatformCatalog::new();
        let path = write_module(dir.path(), "user.bin", 13, 5, 0, 1, 0);

        // Flip a payload byte without fixing the suffix.
        let mut data = fs::read(&path).expect("read");
        data[40] ^= 0xff;
        fs::write(&path, &data).expect("write");

        let module = parse_module_file(&catalog, &path).expect("module still parses");
        assert!(!module.crc_valid);
    }
}
