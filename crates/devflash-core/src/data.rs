//! Compiled-in platform definitions
//!
//! One entry per supported board. Addresses and region sizes follow the
//! shipped Device OS memory maps; module layouts list every slot devflash is
//! allowed to write.

use crate::catalog::{
    DebugTargetConfig, DeviceIdReadProcedure, FlashStyle, McuFamily, ModuleSlot, ModuleType,
    Platform, Region, Storage, StorageDescriptor,
};

const INTERNAL: StorageDescriptor = StorageDescriptor {
    storage: Storage::InternalFlash,
    encrypted: false,
};

const EXTERNAL: StorageDescriptor = StorageDescriptor {
    storage: Storage::ExternalFlash,
    encrypted: false,
};

const fn slot(module_type: ModuleType, index: Option<u8>, descriptor: StorageDescriptor) -> ModuleSlot {
    ModuleSlot {
        module_type,
        index,
        descriptor,
    }
}

// Gen 2 (STM32F2xx): bootloader + indexed system parts + user part, DCT in
// internal flash sectors 1-2.
const GEN2_ALT_SETTINGS: &[(Storage, u8)] = &[
    (Storage::InternalFlash, 0),
    (Storage::Dct, 1),
    (Storage::ExternalFlash, 2),
];

const PHOTON_MODULES: &[ModuleSlot] = &[
    slot(ModuleType::Bootloader, None, INTERNAL),
    slot(ModuleType::SystemPart, Some(1), INTERNAL),
    slot(ModuleType::SystemPart, Some(2), INTERNAL),
    slot(ModuleType::UserPart, None, INTERNAL),
];

const ELECTRON_MODULES: &[ModuleSlot] = &[
    slot(ModuleType::Bootloader, None, INTERNAL),
    slot(ModuleType::SystemPart, Some(1), INTERNAL),
    slot(ModuleType::SystemPart, Some(2), INTERNAL),
    slot(ModuleType::SystemPart, Some(3), INTERNAL),
    slot(ModuleType::UserPart, None, INTERNAL),
];

const STM32F2_DEBUG: DebugTargetConfig = DebugTargetConfig {
    target_config: "target/stm32f2x.cfg",
    flash_style: FlashStyle::WriteImageUnlock,
    assert_srst_on_connect: false,
    device_id: DeviceIdReadProcedure::MemoryDump {
        address: 0x1FFF_7A10,
        length: 12,
        prefix: None,
    },
    run_procedure: None,
};

// Gen 3 (nRF52840): SoftDevice radio stack below the system part, LittleFS
// on external flash. The DCT is emulated in internal flash.
const GEN3_ALT_SETTINGS: &[(Storage, u8)] = &[(Storage::InternalFlash, 0), (Storage::Dct, 1)];

const GEN3_FILESYSTEM: Region = Region {
    storage: Storage::ExternalFlash,
    address: 0x0060_0000,
    size: 0x0020_0000,
};

const GEN3_DCT: Region = Region {
    storage: Storage::InternalFlash,
    address: 0x000F_4000,
    size: 0x0000_8000,
};

const GEN3_MODULES: &[ModuleSlot] = &[
    slot(ModuleType::Bootloader, None, INTERNAL),
    slot(ModuleType::RadioStack, None, INTERNAL),
    slot(ModuleType::SystemPart, Some(1), INTERNAL),
    slot(ModuleType::UserPart, None, INTERNAL),
];

const ARGON_MODULES: &[ModuleSlot] = &[
    slot(ModuleType::Bootloader, None, INTERNAL),
    slot(ModuleType::RadioStack, None, INTERNAL),
    slot(ModuleType::SystemPart, Some(1), INTERNAL),
    slot(ModuleType::UserPart, None, INTERNAL),
    slot(ModuleType::NcpFirmware, None, EXTERNAL),
];

const TRACKER_MODULES: &[ModuleSlot] = &[
    slot(ModuleType::Bootloader, None, INTERNAL),
    slot(ModuleType::RadioStack, None, INTERNAL),
    slot(ModuleType::SystemPart, Some(1), INTERNAL),
    slot(ModuleType::UserPart, None, INTERNAL),
    slot(
        ModuleType::NcpFirmware,
        None,
        StorageDescriptor {
            storage: Storage::ExternalFlash,
            encrypted: true,
        },
    ),
];

// The nRF52840 FICR device id is 8 bytes; the family id prefix completes the
// 24-hex device id.
const NRF52_DEBUG: DebugTargetConfig = DebugTargetConfig {
    target_config: "target/nrf52.cfg",
    flash_style: FlashStyle::Program,
    assert_srst_on_connect: false,
    device_id: DeviceIdReadProcedure::MemoryDump {
        address: 0x1000_0060,
        length: 8,
        prefix: Some("e00fce68"),
    },
    run_procedure: None,
};

const TRACKER_DEBUG: DebugTargetConfig = DebugTargetConfig {
    target_config: "target/nrf52.cfg",
    flash_style: FlashStyle::Program,
    assert_srst_on_connect: false,
    device_id: DeviceIdReadProcedure::Procedure {
        command: "tracker_read_device_id",
        pattern: r"(?i)device id:\s*([0-9a-f]{8})([0-9a-f]{16})",
    },
    run_procedure: None,
};

// RTL872x: external flash is not DFU-addressable; the flash loader is a Tcl
// procedure shipped with the target config.
const P2_ALT_SETTINGS: &[(Storage, u8)] = &[(Storage::InternalFlash, 0), (Storage::Dct, 1)];

const P2_MODULES: &[ModuleSlot] = &[
    slot(ModuleType::Bootloader, None, INTERNAL),
    slot(ModuleType::SystemPart, Some(1), INTERNAL),
    slot(ModuleType::UserPart, None, INTERNAL),
];

const P2_FILESYSTEM: Region = Region {
    storage: Storage::ExternalFlash,
    address: 0x0860_0000,
    size: 0x0020_0000,
};

const RTL872X_DEBUG: DebugTargetConfig = DebugTargetConfig {
    target_config: "target/rtl872x.cfg",
    flash_style: FlashStyle::Procedure("rtl872x_flash_write_bin"),
    assert_srst_on_connect: true,
    device_id: DeviceIdReadProcedure::Procedure {
        command: "rtl872x_read_device_id",
        pattern: r"(?i)efuse device id:\s*([0-9a-f]{24})",
    },
    run_procedure: Some("rtl872x_run"),
};

pub(crate) fn platforms() -> Vec<Platform> {
    vec![
        Platform {
            id: 6,
            name: "photon",
            display_name: "Photon",
            mcu: McuFamily::Stm32f2xx,
            modules: PHOTON_MODULES,
            alt_settings: GEN2_ALT_SETTINGS,
            has_radio_stack: false,
            has_ncp_firmware: false,
            filesystem: None,
            device_config_table: Some(Region {
                storage: Storage::Dct,
                address: 0x0800_4000,
                size: 0x0000_8000,
            }),
            debug: Some(STM32F2_DEBUG),
        },
        Platform {
            id: 10,
            name: "electron",
            display_name: "Electron",
            mcu: McuFamily::Stm32f2xx,
            modules: ELECTRON_MODULES,
            alt_settings: GEN2_ALT_SETTINGS,
            has_radio_stack: false,
            has_ncp_firmware: false,
            filesystem: None,
            device_config_table: Some(Region {
                storage: Storage::Dct,
                address: 0x0800_4000,
                size: 0x0000_8000,
            }),
            debug: Some(STM32F2_DEBUG),
        },
        Platform {
            id: 12,
            name: "argon",
            display_name: "Argon",
            mcu: McuFamily::Nrf52840,
            modules: ARGON_MODULES,
            alt_settings: GEN3_ALT_SETTINGS,
            has_radio_stack: true,
            has_ncp_firmware: true,
            filesystem: Some(GEN3_FILESYSTEM),
            device_config_table: Some(GEN3_DCT),
            debug: Some(NRF52_DEBUG),
        },
        Platform {
            id: 13,
            name: "boron",
            display_name: "Boron",
            mcu: McuFamily::Nrf52840,
            modules: GEN3_MODULES,
            alt_settings: GEN3_ALT_SETTINGS,
            has_radio_stack: true,
            has_ncp_firmware: false,
            filesystem: Some(GEN3_FILESYSTEM),
            device_config_table: Some(GEN3_DCT),
            debug: Some(NRF52_DEBUG),
        },
        Platform {
            id: 23,
            name: "bsom",
            display_name: "B SoM",
            mcu: McuFamily::Nrf52840,
            modules: GEN3_MODULES,
            alt_settings: GEN3_ALT_SETTINGS,
            has_radio_stack: true,
            has_ncp_firmware: false,
            filesystem: Some(GEN3_FILESYSTEM),
            device_config_table: Some(GEN3_DCT),
            debug: Some(NRF52_DEBUG),
        },
        Platform {
            id: 26,
            name: "tracker",
            display_name: "Tracker",
            mcu: McuFamily::Nrf52840,
            modules: TRACKER_MODULES,
            alt_settings: GEN3_ALT_SETTINGS,
            has_radio_stack: true,
            has_ncp_firmware: true,
            filesystem: Some(GEN3_FILESYSTEM),
            device_config_table: Some(GEN3_DCT),
            debug: Some(TRACKER_DEBUG),
        },
        Platform {
            id: 32,
            name: "p2",
            display_name: "P2",
            mcu: McuFamily::Rtl872x,
            modules: P2_MODULES,
            alt_settings: P2_ALT_SETTINGS,
            has_radio_stack: false,
            has_ncp_firmware: false,
            filesystem: Some(P2_FILESYSTEM),
            device_config_table: None,
            debug: Some(RTL872X_DEBUG),
        },
    ]
}
