//! USB bus access
//!
//! [`UsbBus`] is the thin seam over libusb that the transports (and the
//! fleet coordinator's pre-probe) share. Device identity comes from the
//! serial-number string descriptor, which running firmware sets to the
//! 24-hex device id; the product id encodes the platform and whether the
//! device is in its normal or programmer (DFU) mode.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::TransportError;

/// Vendor id of the supported boards.
pub const USB_VENDOR_ID: u16 = 0x2b04;

/// Product-id base for devices running application firmware.
pub const PID_RUN_BASE: u16 = 0xc000;

/// Product-id base for devices in programmer (DFU) mode.
pub const PID_DFU_BASE: u16 = 0xd000;

/// Vendor control request: enter the safe non-cloud listening mode.
pub const REQUEST_ENTER_LISTENING_MODE: u8 = 0x01;

/// Vendor control request: switch to programmer (DFU) mode.
pub const REQUEST_ENTER_DFU_MODE: u8 = 0x02;

/// Vendor control request: reset the device.
pub const REQUEST_RESET: u8 = 0x03;

/// Vendor control request: begin a firmware update of `value` bytes.
pub const REQUEST_UPDATE_START: u8 = 0x10;

/// Vendor control request: one chunk of firmware data.
pub const REQUEST_UPDATE_DATA: u8 = 0x11;

/// Vendor control request: finish and apply the firmware update.
pub const REQUEST_UPDATE_FINISH: u8 = 0x12;

/// Firmware-update transfer chunk size.
pub const UPDATE_CHUNK_SIZE: usize = 4096;

/// Mode a board's product id places it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbDeviceMode {
    /// Running application firmware
    Run,
    /// Programmer (DFU) mode
    Dfu,
}

/// Decode `(platform_id, mode)` from a product id, if it is one of ours.
pub fn decode_pid(product_id: u16) -> Option<(u16, UsbDeviceMode)> {
    match product_id & 0xf000 {
        PID_RUN_BASE => Some((product_id & 0x0fff, UsbDeviceMode::Run)),
        PID_DFU_BASE => Some((product_id & 0x0fff, UsbDeviceMode::Dfu)),
        _ => None,
    }
}

/// Product id of a platform in the given mode.
pub fn encode_pid(platform_id: u16, mode: UsbDeviceMode) -> u16 {
    let base = match mode {
        UsbDeviceMode::Run => PID_RUN_BASE,
        UsbDeviceMode::Dfu => PID_DFU_BASE,
    };
    base | (platform_id & 0x0fff)
}

/// One enumerated USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Serial-number descriptor, rendered printable
    pub serial: Option<String>,
    /// Bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
    /// `bus-port[.port...]` path, stable across re-enumeration
    pub port_path: String,
}

impl UsbDeviceInfo {
    /// `(platform_id, mode)` when the product id is one of ours.
    pub fn decode(&self) -> Option<(u16, UsbDeviceMode)> {
        if self.vendor_id != USB_VENDOR_ID {
            return None;
        }
        decode_pid(self.product_id)
    }
}

/// Render a string descriptor for display and id extraction: printable
/// ASCII passes through, control and DEL bytes become `\xNN`, everything
/// else becomes `?`.
pub fn render_descriptor_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() {
            let byte = ch as u8;
            if ch.is_ascii_control() || byte == 0x7f {
                let _ = write!(out, "\\x{byte:02x}");
            } else {
                out.push(ch);
            }
        } else {
            out.push('?');
        }
    }
    out
}

/// Access to the host USB bus.
#[async_trait]
pub trait UsbBus: Send + Sync {
    /// Enumerate devices devflash cares about: boards with our vendor id
    /// plus known debug adapters.
    async fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>, TransportError>;

    /// Open a device for control transfers.
    async fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbDeviceIo>, TransportError>;
}

/// An open USB device handle.
#[async_trait]
pub trait UsbDeviceIo: Send {
    /// Vendor control transfer, host to device.
    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Vendor control transfer, device to host.
    async fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Ask the OS to reset the port the device is on.
    async fn reset_port(&mut self) -> Result<(), TransportError>;
}

/// libusb-backed bus.
pub struct RusbBus;

impl RusbBus {
    /// Create a bus handle.
    pub fn new() -> Self {
        Self
    }
}

impl Default for RusbBus {
    fn default() -> Self {
        Self::new()
    }
}

fn enumerate_blocking() -> Result<Vec<UsbDeviceInfo>, TransportError> {
    let mut found = Vec::new();
    for device in rusb::devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(err) => {
                trace!(%err, "Skipping device without a readable descriptor");
                continue;
            }
        };
        let ours = descriptor.vendor_id() == USB_VENDOR_ID;
        let adapter = crate::openocd::adapters::find_adapter(
            descriptor.vendor_id(),
            descriptor.product_id(),
        )
        .is_some();
        if !ours && !adapter {
            continue;
        }

        let port_path = match device.port_numbers() {
            Ok(ports) if !ports.is_empty() => {
                let joined = ports
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(".");
                format!("{}-{}", device.bus_number(), joined)
            }
            _ => format!("{}-{}", device.bus_number(), device.address()),
        };

        // Identity needs a short-lived open; devices we cannot open are
        // still listed, just without a serial.
        let serial = match device.open() {
            Ok(handle) => handle
                .read_languages(Duration::from_millis(250))
                .ok()
                .and_then(|languages| languages.first().copied())
                .and_then(|language| {
                    handle
                        .read_serial_number_string(
                            language,
                            &descriptor,
                            Duration::from_millis(250),
                        )
                        .ok()
                })
                .map(|raw| render_descriptor_string(&raw)),
            Err(err) => {
                debug!(
                    bus = device.bus_number(),
                    address = device.address(),
                    %err,
                    "Cannot open device to read its serial"
                );
                None
            }
        };

        found.push(UsbDeviceInfo {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            serial,
            bus: device.bus_number(),
            address: device.address(),
            port_path,
        });
    }
    Ok(found)
}

#[async_trait]
impl UsbBus for RusbBus {
    async fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        tokio::task::spawn_blocking(enumerate_blocking)
            .await
            .map_err(|e| TransportError::Usb(format!("enumeration task failed: {e}")))?
    }

    async fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbDeviceIo>, TransportError> {
        let target = info.clone();
        let handle = tokio::task::spawn_blocking(move || -> Result<_, TransportError> {
            for device in rusb::devices()?.iter() {
                if device.bus_number() != target.bus || device.address() != target.address {
                    continue;
                }
                return Ok(device.open()?);
            }
            Err(TransportError::DeviceNotFound(target.port_path.clone()))
        })
        .await
        .map_err(|e| TransportError::Usb(format!("open task failed: {e}")))??;

        Ok(Box::new(RusbDeviceIo { handle }))
    }
}

struct RusbDeviceIo {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
}

const VENDOR_OUT: u8 = 0x40; // host-to-device | vendor | device
const VENDOR_IN: u8 = 0xc0; // device-to-host | vendor | device

#[async_trait]
impl UsbDeviceIo for RusbDeviceIo {
    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.handle
            .write_control(VENDOR_OUT, request, value, index, data, timeout)?;
        Ok(())
    }

    async fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut buffer = vec![0u8; length];
        let read = self
            .handle
            .read_control(VENDOR_IN, request, value, index, &mut buffer, timeout)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    async fn reset_port(&mut self) -> Result<(), TransportError> {
        self.handle.reset()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_encoding_round_trips() {
        for platform_id in [6u16, 13, 26, 32] {
            for mode in [UsbDeviceMode::Run, UsbDeviceMode::Dfu] {
                let pid = encode_pid(platform_id, mode);
                assert_eq!(decode_pid(pid), Some((platform_id, mode)));
            }
        }
    }

    #[test]
    fn foreign_pids_do_not_decode() {
        assert_eq!(decode_pid(0x5740), None);
        assert_eq!(decode_pid(0x0001), None);
    }

    #[test]
    fn descriptor_rendering_keeps_printable_ascii() {
        assert_eq!(
            render_descriptor_string("e00fce68d23c1a2b3c4d5e6f"),
            "e00fce68d23c1a2b3c4d5e6f"
        );
        assert_eq!(render_descriptor_string("ABC 123"), "ABC 123");
    }

    #[test]
    fn descriptor_rendering_escapes_control_and_del() {
        assert_eq!(render_descriptor_string("a\u{1}b"), "a\\x01b");
        assert_eq!(render_descriptor_string("x\u{7f}"), "x\\x7f");
    }

    #[test]
    fn descriptor_rendering_masks_non_ascii() {
        assert_eq!(render_descriptor_string("sérial"), "s?rial");
        assert_eq!(render_descriptor_string("序列"), "??");
    }

    #[test]
    fn decode_requires_our_vendor_id() {
        let info = UsbDeviceInfo {
            vendor_id: 0x0483,
            product_id: encode_pid(13, UsbDeviceMode::Run),
            serial: None,
            bus: 1,
            address: 4,
            port_path: "1-4".to_string(),
        };
        assert_eq!(info.decode(), None);
    }
}
