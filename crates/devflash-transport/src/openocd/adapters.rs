//! Known debug adapters and probe-able MCU targets

use devflash_core::McuFamily;

/// First control port; adapter `index` gets `BASE_CONTROL_PORT + index - 1`.
pub const BASE_CONTROL_PORT: u16 = 4444;

/// An MCU family as seen from the debug port.
#[derive(Debug, Clone, Copy)]
pub struct McuTarget {
    /// Family this entry detects
    pub family: McuFamily,
    /// Substring of the debug-port designer/manufacturer announcement,
    /// matched case-insensitively against the probe transcript
    pub probe_pattern: &'static str,
    /// Target configuration file for this family
    pub target_config: &'static str,
}

/// Probe-able MCU families, in match priority order.
pub const MCU_TARGETS: &[McuTarget] = &[
    McuTarget {
        family: McuFamily::Nrf52840,
        probe_pattern: "Nordic",
        target_config: "target/nrf52.cfg",
    },
    McuTarget {
        family: McuFamily::Stm32f2xx,
        probe_pattern: "STMicroelectronics",
        target_config: "target/stm32f2x.cfg",
    },
    McuTarget {
        family: McuFamily::Rtl872x,
        probe_pattern: "Realtek",
        target_config: "target/rtl872x.cfg",
    },
];

/// Look up the probe entry for a family.
pub fn mcu_target(family: McuFamily) -> Option<&'static McuTarget> {
    MCU_TARGETS.iter().find(|t| t.family == family)
}

/// A supported USB debug adapter model.
#[derive(Debug, Clone, Copy)]
pub struct DebugAdapterKind {
    /// Short name used in device locators
    pub name: &'static str,
    /// Human-readable name
    pub display_name: &'static str,
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Daemon interface configuration file
    pub interface_config: &'static str,
    /// Command that pins the daemon to one adapter by serial
    pub serial_command: Option<&'static str>,
    /// Wire transport to select
    pub transport: &'static str,
    /// MCU families this adapter can drive
    pub supported: &'static [McuFamily],
    /// Extra initialization commands, if the adapter needs them
    pub extra_init: Option<&'static str>,
}

const ALL_FAMILIES: &[McuFamily] = &[
    McuFamily::Nrf52840,
    McuFamily::Stm32f2xx,
    McuFamily::Rtl872x,
];

/// Adapter models recognized by VID:PID.
pub const ADAPTERS: &[DebugAdapterKind] = &[
    DebugAdapterKind {
        name: "daplink",
        display_name: "CMSIS-DAP debug probe",
        vendor_id: 0x0d28,
        product_id: 0x0204,
        interface_config: "interface/cmsis-dap.cfg",
        serial_command: Some("cmsis_dap_serial"),
        transport: "swd",
        supported: ALL_FAMILIES,
        extra_init: None,
    },
    DebugAdapterKind {
        name: "stlink-v2",
        display_name: "ST-Link/V2",
        vendor_id: 0x0483,
        product_id: 0x3748,
        interface_config: "interface/stlink.cfg",
        serial_command: Some("hla_serial"),
        transport: "hla_swd",
        supported: &[McuFamily::Stm32f2xx],
        extra_init: None,
    },
    DebugAdapterKind {
        name: "jlink",
        display_name: "SEGGER J-Link",
        vendor_id: 0x1366,
        product_id: 0x0101,
        interface_config: "interface/jlink.cfg",
        serial_command: Some("jlink serial"),
        transport: "swd",
        supported: ALL_FAMILIES,
        extra_init: Some("jlink usb"),
    },
];

/// Find an adapter model by USB identity.
pub fn find_adapter(vendor_id: u16, product_id: u16) -> Option<&'static DebugAdapterKind> {
    ADAPTERS
        .iter()
        .find(|a| a.vendor_id == vendor_id && a.product_id == product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapters_are_found_by_usb_identity() {
        let adapter = find_adapter(0x0d28, 0x0204).expect("daplink");
        assert_eq!(adapter.name, "daplink");
        assert!(find_adapter(0x1234, 0x5678).is_none());
    }

    #[test]
    fn stlink_only_supports_stm32() {
        let adapter = find_adapter(0x0483, 0x3748).expect("stlink");
        assert_eq!(adapter.supported, &[McuFamily::Stm32f2xx][..]);
    }

    #[test]
    fn every_family_has_a_probe_entry() {
        for family in ALL_FAMILIES {
            assert!(mcu_target(*family).is_some(), "no probe entry for {family}");
        }
    }
}
