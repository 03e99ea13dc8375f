//! Static catalog of supported hardware platforms
//!
//! Each [`Platform`] describes one class of board: its MCU family, which
//! firmware modules it runs and where they live, how storage regions map to
//! DFU alt-settings, and how a debug adapter talks to it. The catalog is
//! constant data compiled into the binary and loaded once at startup.

use std::fmt;

use crate::data;
use crate::error::CatalogError;

/// MCU family of a platform, used for debug-adapter target selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McuFamily {
    /// STM32F2xx (gen 2 devices)
    Stm32f2xx,
    /// nRF52840 (gen 3 devices)
    Nrf52840,
    /// Realtek RTL872x
    Rtl872x,
}

impl fmt::Display for McuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McuFamily::Stm32f2xx => write!(f, "STM32F2xx"),
            McuFamily::Nrf52840 => write!(f, "nRF52840"),
            McuFamily::Rtl872x => write!(f, "RTL872x"),
        }
    }
}

/// Storage region class on a target board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    /// On-chip flash
    InternalFlash,
    /// External (QSPI/SPI) flash
    ExternalFlash,
    /// Device configuration table region
    Dct,
}

impl Storage {
    /// Resolve a storage tag from an external catalog record.
    pub fn from_tag(tag: &str) -> Result<Self, CatalogError> {
        match tag {
            "internal_flash" => Ok(Storage::InternalFlash),
            "external_flash" => Ok(Storage::ExternalFlash),
            "dct" => Ok(Storage::Dct),
            other => Err(CatalogError::UnknownStorageType(other.to_string())),
        }
    }

    /// Canonical tag used in external records and log output.
    pub fn tag(&self) -> &'static str {
        match self {
            Storage::InternalFlash => "internal_flash",
            Storage::ExternalFlash => "external_flash",
            Storage::Dct => "dct",
        }
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Firmware module classes that devflash can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleType {
    /// User application firmware
    UserPart,
    /// Device OS system part
    SystemPart,
    /// Bootloader
    Bootloader,
    /// Radio stack (SoftDevice and similar)
    RadioStack,
    /// Network coprocessor firmware
    NcpFirmware,
}

impl ModuleType {
    /// Resolve a module-type tag from an external catalog record.
    pub fn from_tag(tag: &str) -> Result<Self, CatalogError> {
        match tag {
            "user_part" => Ok(ModuleType::UserPart),
            "system_part" => Ok(ModuleType::SystemPart),
            "bootloader" => Ok(ModuleType::Bootloader),
            "radio_stack" => Ok(ModuleType::RadioStack),
            "ncp_firmware" => Ok(ModuleType::NcpFirmware),
            other => Err(CatalogError::UnknownModuleType(other.to_string())),
        }
    }

    /// Canonical tag used in external records and log output.
    pub fn tag(&self) -> &'static str {
        match self {
            ModuleType::UserPart => "user_part",
            ModuleType::SystemPart => "system_part",
            ModuleType::Bootloader => "bootloader",
            ModuleType::RadioStack => "radio_stack",
            ModuleType::NcpFirmware => "ncp_firmware",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Where one module slot of a platform is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageDescriptor {
    /// Target storage region class
    pub storage: Storage,
    /// Whether the platform requires this slot to hold an encrypted image
    pub encrypted: bool,
}

/// One module slot in a platform's firmware layout.
#[derive(Debug, Clone, Copy)]
pub struct ModuleSlot {
    /// Module class of this slot
    pub module_type: ModuleType,
    /// Index distinguishing multiple slots of the same class, if any
    pub index: Option<u8>,
    /// Storage descriptor for the slot
    pub descriptor: StorageDescriptor,
}

/// A fixed region of storage (filesystem, device config table).
#[derive(Debug, Clone, Copy)]
pub struct Region {
    /// Storage the region lives in
    pub storage: Storage,
    /// Base address
    pub address: u32,
    /// Size in bytes
    pub size: u32,
}

/// How the debug-adapter transport writes internal flash on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStyle {
    /// `program <file> <addr>` with "** Programming Finished **" on success
    Program,
    /// `flash write_image erase unlock <file> <addr>`; needed where the
    /// flash controller powers up locked
    WriteImageUnlock,
    /// A platform-specific Tcl procedure `f(file, addr)`
    Procedure(&'static str),
}

/// How the debug-adapter transport reads the 24-hex device id.
#[derive(Debug, Clone, Copy)]
pub enum DeviceIdReadProcedure {
    /// `mdb <address> <length>` parsed as raw bytes, optionally prefixed
    /// with a platform-family id prefix
    MemoryDump {
        /// Address of the unique-id words
        address: u32,
        /// Number of bytes to read
        length: usize,
        /// Hex prefix prepended to the dumped bytes
        prefix: Option<&'static str>,
    },
    /// Output of a custom Tcl procedure matched against a regex whose
    /// capture groups concatenate to the id
    Procedure {
        /// Command to execute
        command: &'static str,
        /// Pattern with capture groups
        pattern: &'static str,
    },
}

/// Debug-adapter target configuration for a platform.
#[derive(Debug, Clone, Copy)]
pub struct DebugTargetConfig {
    /// OpenOCD target configuration file
    pub target_config: &'static str,
    /// Flash write command style
    pub flash_style: FlashStyle,
    /// Whether SRST must be asserted while connecting
    pub assert_srst_on_connect: bool,
    /// How to read the device id over the debug port
    pub device_id: DeviceIdReadProcedure,
    /// Platform-specific run/reset procedure, if the plain `reset run`
    /// does not restart the firmware
    pub run_procedure: Option<&'static str>,
}

/// A class of hardware board with a fixed MCU, storage layout, and firmware
/// module set.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Stable numeric platform id
    pub id: u16,
    /// Short name used in paths and on the command line
    pub name: &'static str,
    /// Human-readable name
    pub display_name: &'static str,
    /// MCU family
    pub mcu: McuFamily,
    /// Firmware module layout
    pub modules: &'static [ModuleSlot],
    /// Storage-to-alt-setting map for the raw programmer
    pub alt_settings: &'static [(Storage, u8)],
    /// Whether the platform runs a radio stack module
    pub has_radio_stack: bool,
    /// Whether the platform runs NCP firmware
    pub has_ncp_firmware: bool,
    /// Filesystem region, if the platform has one
    pub filesystem: Option<Region>,
    /// Device configuration table region, if the platform has one
    pub device_config_table: Option<Region>,
    /// Debug-adapter target configuration, if flashable via an adapter
    pub debug: Option<DebugTargetConfig>,
}

impl Platform {
    /// Storage descriptor for a module slot.
    ///
    /// Selects the unique descriptor when the type has no indexed slots,
    /// the slot matching `index` when multiple exist, and `None` otherwise.
    pub fn storage_for_module(
        &self,
        module_type: ModuleType,
        index: u8,
    ) -> Option<StorageDescriptor> {
        let mut matching = self
            .modules
            .iter()
            .filter(|slot| slot.module_type == module_type);
        let first = matching.next()?;
        if matching.clone().next().is_none() && first.index.is_none() {
            return Some(first.descriptor);
        }
        std::iter::once(first)
            .chain(matching)
            .find(|slot| slot.index == Some(index))
            .map(|slot| slot.descriptor)
    }

    /// DFU alt-setting for a storage region, if the raw programmer can
    /// address it on this platform.
    pub fn alt_setting(&self, storage: Storage) -> Option<u8> {
        self.alt_settings
            .iter()
            .find(|(s, _)| *s == storage)
            .map(|(_, alt)| *alt)
    }
}

/// The full table of supported platforms.
#[derive(Debug, Clone)]
pub struct PlatformCatalog {
    platforms: Vec<Platform>,
}

impl PlatformCatalog {
    /// Build the catalog from compiled-in platform data.
    pub fn new() -> Self {
        Self {
            platforms: data::platforms(),
        }
    }

    /// Look up a platform by numeric id.
    pub fn by_id(&self, id: u16) -> Result<&Platform, CatalogError> {
        self.platforms
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| CatalogError::UnknownPlatform(id.to_string()))
    }

    /// Look up a platform by short name.
    pub fn by_name(&self, name: &str) -> Result<&Platform, CatalogError> {
        self.platforms
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| CatalogError::UnknownPlatform(name.to_string()))
    }

    /// All cataloged platforms.
    pub fn iter(&self) -> impl Iterator<Item = &Platform> {
        self.platforms.iter()
    }
}

impl Default for PlatformCatalog {
    fn default() -> Self {
        Self::new()
    }
}
