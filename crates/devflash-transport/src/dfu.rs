//! Raw programmer (DFU) transport
//!
//! Writes files to specific storage alt-settings by invoking the external
//! `dfu-util` programmer. The USB handle is only used to switch a running
//! device into programmer mode and to find it again afterwards; it is closed
//! before the programmer runs because the programmer claims the interface
//! itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use devflash_core::util::format_hex_address;
use devflash_core::{DeviceId, Module, ModuleType, PlatformCatalog, Storage};

use crate::device::{DeviceDiscovery, DeviceHandle, FlashDevice, FlashOutcome};
use crate::error::TransportError;
use crate::process::exec_with_timeout;
use crate::usb::{
    encode_pid, UsbBus, UsbDeviceInfo, UsbDeviceIo, UsbDeviceMode, USB_VENDOR_ID,
    REQUEST_ENTER_DFU_MODE, REQUEST_RESET,
};
use crate::{RAW_WRITE_TIMEOUT, REOPEN_TIMEOUT};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const ENUMERATION_POLL: Duration = Duration::from_millis(500);

/// Discovery and flashing through the external raw programmer.
pub struct DfuTransport {
    bus: Arc<dyn UsbBus>,
    catalog: Arc<PlatformCatalog>,
    programmer: PathBuf,
}

impl DfuTransport {
    /// Create the transport; the programmer binary is resolved via `PATH`.
    pub fn new(bus: Arc<dyn UsbBus>, catalog: Arc<PlatformCatalog>) -> Self {
        Self {
            bus,
            catalog,
            programmer: PathBuf::from("dfu-util"),
        }
    }

    /// Override the programmer executable (used by tests).
    pub fn with_programmer(mut self, programmer: impl Into<PathBuf>) -> Self {
        self.programmer = programmer.into();
        self
    }

    async fn candidates(&self) -> Result<Vec<(UsbDeviceInfo, u16, UsbDeviceMode)>, TransportError> {
        Ok(self
            .bus
            .enumerate()
            .await?
            .into_iter()
            .filter_map(|info| info.decode().map(|(platform, mode)| (info, platform, mode)))
            .collect())
    }

    /// Whether the serial string is usable for `-S` selection: present and
    /// unique among currently enumerated candidates.
    fn serial_is_unambiguous(candidates: &[(UsbDeviceInfo, u16, UsbDeviceMode)], serial: &str) -> bool {
        !serial.is_empty()
            && candidates
                .iter()
                .filter(|(info, _, _)| info.serial.as_deref() == Some(serial))
                .count()
                == 1
    }

    async fn device_from(
        &self,
        info: UsbDeviceInfo,
        platform_id: u16,
        mode: UsbDeviceMode,
        id: DeviceId,
        use_serial: bool,
    ) -> Result<Box<dyn FlashDevice>, TransportError> {
        let io = self.bus.open(&info).await?;
        Ok(Box::new(DfuDevice {
            bus: Arc::clone(&self.bus),
            catalog: Arc::clone(&self.catalog),
            programmer: self.programmer.clone(),
            io: Some(io),
            info,
            mode,
            id,
            platform_id,
            use_serial,
        }))
    }
}

#[async_trait]
impl DeviceDiscovery for DfuTransport {
    async fn list(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(self
            .candidates()
            .await?
            .iter()
            .map(|(info, platform, _)| DeviceHandle {
                id: info
                    .serial
                    .as_deref()
                    .and_then(|serial| DeviceId::new(serial).ok()),
                platform_id: Some(*platform),
                address: info.port_path.clone(),
            })
            .collect())
    }

    async fn open(&self, handle: &DeviceHandle) -> Result<Box<dyn FlashDevice>, TransportError> {
        let candidates = self.candidates().await?;
        let (info, platform, mode) = candidates
            .iter()
            .find(|(info, _, _)| info.port_path == handle.address)
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound(handle.address.clone()))?;

        let id = info
            .serial
            .as_deref()
            .and_then(|serial| DeviceId::new(serial).ok())
            .ok_or_else(|| TransportError::OpenFailed {
                device: handle.label(),
                reason: "device did not report a valid id".to_string(),
            })?;

        let use_serial = info
            .serial
            .as_deref()
            .map(|serial| Self::serial_is_unambiguous(&candidates, serial))
            .unwrap_or(false);

        self.device_from(info, platform, mode, id, use_serial).await
    }

    async fn open_by_id(
        &self,
        id: &DeviceId,
        timeout: Duration,
    ) -> Result<Box<dyn FlashDevice>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let candidates = self.candidates().await?;
            let found = candidates
                .iter()
                .find(|(info, _, _)| {
                    info.serial
                        .as_deref()
                        .map(|serial| serial.eq_ignore_ascii_case(id.as_str()))
                        .unwrap_or(false)
                })
                .cloned();
            if let Some((info, platform, mode)) = found {
                let use_serial = info
                    .serial
                    .as_deref()
                    .map(|serial| Self::serial_is_unambiguous(&candidates, serial))
                    .unwrap_or(false);
                match self.device_from(info, platform, mode, id.clone(), use_serial).await {
                    Ok(device) => return Ok(device),
                    Err(err) => {
                        debug!(device = %id, %err, "Open attempt failed; retrying");
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::DeviceNotFound(id.to_string()));
            }
            tokio::time::sleep(ENUMERATION_POLL).await;
        }
    }
}

/// One device reachable through the raw programmer.
pub struct DfuDevice {
    bus: Arc<dyn UsbBus>,
    catalog: Arc<PlatformCatalog>,
    programmer: PathBuf,
    io: Option<Box<dyn UsbDeviceIo>>,
    info: UsbDeviceInfo,
    mode: UsbDeviceMode,
    id: DeviceId,
    platform_id: u16,
    use_serial: bool,
}

impl DfuDevice {
    fn alt_setting(&self, storage: Storage) -> Option<u8> {
        self.catalog
            .by_id(self.platform_id)
            .ok()
            .and_then(|platform| platform.alt_setting(storage))
    }

    /// Switch a running device into programmer mode and wait for it to come
    /// back on the bus.
    async fn enter_programmer_mode(&mut self) -> Result<(), TransportError> {
        if self.mode == UsbDeviceMode::Dfu {
            return Ok(());
        }
        info!(device = %self.id, "Switching device to programmer mode");
        if self.io.is_none() {
            self.reopen().await?;
        }
        if let Some(io) = self.io.as_mut() {
            io.control_out(REQUEST_ENTER_DFU_MODE, 0, 0, &[], CONTROL_TIMEOUT)
                .await?;
        }
        self.io = None;
        self.wait_for_mode(UsbDeviceMode::Dfu).await
    }

    async fn wait_for_mode(&mut self, mode: UsbDeviceMode) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + REOPEN_TIMEOUT;
        loop {
            let devices = self.bus.enumerate().await?;
            let found = devices.into_iter().find(|info| {
                info.decode().map(|(_, m)| m) == Some(mode)
                    && info
                        .serial
                        .as_deref()
                        .map(|serial| serial.eq_ignore_ascii_case(self.id.as_str()))
                        .unwrap_or(false)
            });
            if let Some(info) = found {
                self.info = info;
                self.mode = mode;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::OpenFailed {
                    device: self.id.to_string(),
                    reason: format!("device did not re-enumerate in {mode:?} mode"),
                });
            }
            tokio::time::sleep(ENUMERATION_POLL).await;
        }
    }

    async fn reopen(&mut self) -> Result<(), TransportError> {
        self.io = Some(self.bus.open(&self.info).await?);
        Ok(())
    }

    fn programmer_args(&self, file: &Path, alt: u8, address: u32) -> Vec<String> {
        let pid = encode_pid(self.platform_id, UsbDeviceMode::Dfu);
        let mut args = vec![
            "-d".to_string(),
            format!("{USB_VENDOR_ID:04x}:{pid:04x}"),
        ];
        if self.use_serial {
            args.push("-S".to_string());
            args.push(self.id.to_string());
        } else {
            args.push("-p".to_string());
            args.push(self.info.port_path.clone());
        }
        args.extend([
            "-a".to_string(),
            alt.to_string(),
            "-s".to_string(),
            format_hex_address(address),
            "-D".to_string(),
            file.display().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl FlashDevice for DfuDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn platform_id(&self) -> Option<u16> {
        Some(self.platform_id)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.io = None;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        info!(device = %self.id, "Resetting device");
        if self.io.is_none() {
            self.reopen().await?;
        }
        let io = self.io.as_mut().ok_or(TransportError::DeviceNotOpen)?;
        match self.mode {
            UsbDeviceMode::Run => {
                io.control_out(REQUEST_RESET, 0, 0, &[], CONTROL_TIMEOUT).await?;
            }
            UsbDeviceMode::Dfu => {
                // No reset request in programmer mode; a port reset reboots
                // the bootloader into the application.
                io.reset_port().await?;
            }
        }
        self.io = None;
        Ok(())
    }

    async fn prepare_to_flash(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn can_flash_module(&self, module: &Module) -> bool {
        // Writing a bootloader over raw DFU bricks the device if it is
        // interrupted; the update-request path applies it safely instead.
        module.module_type != ModuleType::Bootloader && self.alt_setting(module.storage).is_some()
    }

    fn can_write_to_flash(&self, storage: Storage) -> bool {
        self.alt_setting(storage).is_some()
    }

    async fn write_to_flash(
        &mut self,
        file: &Path,
        storage: Storage,
        address: u32,
    ) -> Result<(), TransportError> {
        let alt = self
            .alt_setting(storage)
            .ok_or(TransportError::UnsupportedStorage(storage))?;

        self.enter_programmer_mode().await?;

        // The programmer claims the interface; our handle must not hold it.
        self.io = None;

        let args = self.programmer_args(file, alt, address);
        info!(
            device = %self.id,
            file = %file.display(),
            %storage,
            address = %format_hex_address(address),
            "Writing via raw programmer"
        );
        let mut command = Command::new(&self.programmer);
        command.args(&args);
        let output = exec_with_timeout(command, RAW_WRITE_TIMEOUT).await?;
        if !output.success() {
            warn!(
                device = %self.id,
                exit_code = output.exit_code,
                "Programmer failed"
            );
            return Err(TransportError::ProgrammerFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        self.reopen().await
    }

    async fn flash_module(&mut self, module: &Module) -> Result<FlashOutcome, TransportError> {
        self.write_to_flash(&module.file_path, module.storage, module.address)
            .await?;
        Ok(FlashOutcome {
            reset_pending: false,
        })
    }
}
