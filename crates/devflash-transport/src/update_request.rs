//! Update-request transport
//!
//! Streams whole module images to running firmware over vendor control
//! requests. This path can deliver any module type (it is the only safe way
//! to replace a bootloader) but exposes no raw storage writes; the firmware
//! decides where the image lands based on its own module header.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use devflash_core::{DeviceId, Module, Storage};

use crate::device::{DeviceDiscovery, DeviceHandle, FlashDevice, FlashOutcome};
use crate::error::TransportError;
use crate::usb::{
    UsbBus, UsbDeviceInfo, UsbDeviceIo, UsbDeviceMode, REQUEST_ENTER_LISTENING_MODE,
    REQUEST_RESET, REQUEST_UPDATE_DATA, REQUEST_UPDATE_FINISH, REQUEST_UPDATE_START,
    UPDATE_CHUNK_SIZE,
};
use crate::UPDATE_REQUEST_TIMEOUT;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const ENUMERATION_POLL: Duration = Duration::from_millis(500);

/// Discovery over the USB update-request path.
pub struct UpdateRequestTransport {
    bus: Arc<dyn UsbBus>,
}

impl UpdateRequestTransport {
    /// Create the transport over a USB bus.
    pub fn new(bus: Arc<dyn UsbBus>) -> Self {
        Self { bus }
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
}

fn handle_for(info: &UsbDeviceInfo, platform_id: u16) -> DeviceHandle {
    DeviceHandle {
        id: info
            .serial
            .as_deref()
            .and_then(|serial| DeviceId::new(serial).ok()),
        platform_id: Some(platform_id),
        address: info.port_path.clone(),
    }
}

#[async_trait]
impl DeviceDiscovery for UpdateRequestTransport {
    async fn list(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(self
            .candidates()
            .await?
            .iter()
            .map(|(info, platform, _)| handle_for(info, *platform))
            .collect())
    }

    async fn open(&self, handle: &DeviceHandle) -> Result<Box<dyn FlashDevice>, TransportError> {
        let candidates = self.candidates().await?;
        let (info, platform, _) = candidates
            .into_iter()
            .find(|(info, _, _)| info.port_path == handle.address)
            .ok_or_else(|| TransportError::DeviceNotFound(handle.address.clone()))?;

        let id = info
            .serial
            .as_deref()
            .and_then(|serial| DeviceId::new(serial).ok())
            .ok_or_else(|| TransportError::OpenFailed {
                device: handle.label(),
                reason: "device did not report a valid id".to_string(),
            })?;

        let io = self.bus.open(&info).await?;
        Ok(Box::new(UpdateRequestDevice {
            io: Some(io),
            id,
            platform_id: Some(platform),
        }))
    }

    async fn open_by_id(
        &self,
        id: &DeviceId,
        timeout: Duration,
    ) -> Result<Box<dyn FlashDevice>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let candidates = self.candidates().await?;
            let found = candidates.into_iter().find(|(info, _, mode)| {
                *mode == UsbDeviceMode::Run
                    && info
                        .serial
                        .as_deref()
                        .map(|serial| serial.eq_ignore_ascii_case(id.as_str()))
                        .unwrap_or(false)
            });
            if let Some((info, platform, _)) = found {
                match self.bus.open(&info).await {
                    Ok(io) => {
                        return Ok(Box::new(UpdateRequestDevice {
                            io: Some(io),
                            id: id.clone(),
                            platform_id: Some(platform),
                        }));
                    }
                    Err(err) => {
                        debug!(device = %id, %err, "Open attempt failed; device may still be re-enumerating");
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

/// One device reachable over the update-request path.
pub struct UpdateRequestDevice {
    io: Option<Box<dyn UsbDeviceIo>>,
    id: DeviceId,
    platform_id: Option<u16>,
}

impl UpdateRequestDevice {
    fn io(&mut self) -> Result<&mut Box<dyn UsbDeviceIo>, TransportError> {
        self.io.as_mut().ok_or(TransportError::DeviceNotOpen)
    }

    async fn transfer(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let size = data.len() as u32;
        let io = self.io()?;

        io.control_out(
            REQUEST_UPDATE_START,
            0,
            0,
            &size.to_le_bytes(),
            CONTROL_TIMEOUT,
        )
        .await?;

        for (sequence, chunk) in data.chunks(UPDATE_CHUNK_SIZE).enumerate() {
            io.control_out(
                REQUEST_UPDATE_DATA,
                sequence as u16,
                0,
                chunk,
                CONTROL_TIMEOUT,
            )
            .await?;
        }

        io.control_out(REQUEST_UPDATE_FINISH, 0, 0, &[], CONTROL_TIMEOUT)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FlashDevice for UpdateRequestDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn platform_id(&self) -> Option<u16> {
        self.platform_id
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.io = None;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        info!(device = %self.id, "Resetting device");
        self.io()?
            .control_out(REQUEST_RESET, 0, 0, &[], CONTROL_TIMEOUT)
            .await?;
        // The device drops off the bus while it restarts.
        self.io = None;
        Ok(())
    }

    async fn prepare_to_flash(&mut self) -> Result<(), TransportError> {
        debug!(device = %self.id, "Entering listening mode");
        self.io()?
            .control_out(REQUEST_ENTER_LISTENING_MODE, 0, 0, &[], CONTROL_TIMEOUT)
            .await
    }

    fn can_flash_module(&self, _module: &Module) -> bool {
        true
    }

    fn can_write_to_flash(&self, _storage: Storage) -> bool {
        false
    }

    async fn write_to_flash(
        &mut self,
        _file: &Path,
        _storage: Storage,
        _address: u32,
    ) -> Result<(), TransportError> {
        Err(TransportError::NotSupported(
            "the update-request transport has no raw storage access",
        ))
    }

    async fn flash_module(&mut self, module: &Module) -> Result<FlashOutcome, TransportError> {
        let data = tokio::fs::read(&module.file_path).await?;
        info!(
            device = %self.id,
            module = %module.module_type,
            file = %module.file_name(),
            bytes = data.len(),
            "Sending module via update request"
        );

        tokio::time::timeout(UPDATE_REQUEST_TIMEOUT, self.transfer(&data))
            .await
            .map_err(|_| TransportError::CommandTimeout {
                command: format!("update-request transfer of {}", module.file_name()),
                timeout: UPDATE_REQUEST_TIMEOUT,
            })??;

        Ok(FlashOutcome { reset_pending: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{usb_device, MockUsbBus};
    use crate::usb::{REQUEST_UPDATE_DATA, REQUEST_UPDATE_START};
    use std::io::Write;

    const BORON_ID: &str = "e00fce68d23c1a2b3c4d5e6f";

    fn test_module(dir: &std::path::Path, payload: usize) -> Module {
        let path = dir.join("module.bin");
        let mut file = std::fs::File::create(&path).expect("create module");
        file.write_all(&vec![0xabu8; payload]).expect("write module");
        Module {
            platform_id: 13,
            platform_name: "boron".to_string(),
            module_type: devflash_core::ModuleType::Bootloader,
            index: 1,
            version: 1,
            storage: Storage::InternalFlash,
            address: 0,
            module_size: payload as u64,
            header_size: 24,
            drop_header: false,
            encrypted: false,
            needs_encryption: false,
            crc_valid: true,
            file_size: payload as u64,
            file_path: path,
            is_asset: false,
        }
    }

    #[tokio::test]
    async fn lists_devices_with_decoded_identity() {
        let bus = Arc::new(MockUsbBus::new(vec![usb_device(
            13,
            UsbDeviceMode::Run,
            BORON_ID,
            1,
            4,
        )]));
        let transport = UpdateRequestTransport::new(bus);
        let handles = transport.list().await.expect("list");
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].platform_id, Some(13));
        assert_eq!(
            handles[0].id.as_ref().map(|id| id.to_string()),
            Some(BORON_ID.to_string())
        );
    }

    #[tokio::test]
    async fn flash_module_chunks_the_image() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let bus = Arc::new(MockUsbBus::new(vec![usb_device(
            13,
            UsbDeviceMode::Run,
            BORON_ID,
            1,
            4,
        )]));
        let transport = UpdateRequestTransport::new(Arc::clone(&bus) as Arc<dyn UsbBus>);

        let id = DeviceId::new(BORON_ID).expect("id");
        let mut device = transport
            .open_by_id(&id, Duration::from_secs(1))
            .await
            .expect("open");

        let module = test_module(dir.path(), UPDATE_CHUNK_SIZE + 100);
        let outcome = device.flash_module(&module).await.expect("flash");
        assert!(outcome.reset_pending);

        let calls = bus.recorded_calls();
        assert_eq!(calls[0].request, REQUEST_UPDATE_START);
        assert_eq!(
            calls[0].data,
            ((UPDATE_CHUNK_SIZE + 100) as u32).to_le_bytes().to_vec()
        );
        let data_calls: Vec<_> = calls
            .iter()
            .filter(|c| c.request == REQUEST_UPDATE_DATA)
            .collect();
        assert_eq!(data_calls.len(), 2);
        assert_eq!(data_calls[0].data.len(), UPDATE_CHUNK_SIZE);
        assert_eq!(data_calls[1].data.len(), 100);
        assert_eq!(data_calls[1].value, 1);
        assert_eq!(calls.last().map(|c| c.request), Some(REQUEST_UPDATE_FINISH));
    }

    #[tokio::test]
    async fn open_by_id_times_out_when_device_never_appears() {
        let bus = Arc::new(MockUsbBus::new(Vec::new()));
        let transport = UpdateRequestTransport::new(bus);
        let id = DeviceId::new(BORON_ID).expect("id");
        let err = match transport.open_by_id(&id, Duration::from_millis(50)).await {
            Ok(_) => panic!("no device"),
            Err(e) => e,
        };
        assert!(matches!(err, TransportError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn operations_after_close_fail_with_device_not_open() {
        let bus = Arc::new(MockUsbBus::new(vec![usb_device(
            13,
            UsbDeviceMode::Run,
            BORON_ID,
            1,
            4,
        )]));
        let transport = UpdateRequestTransport::new(bus);
        let id = DeviceId::new(BORON_ID).expect("id");
        let mut device = transport
            .open_by_id(&id, Duration::from_secs(1))
            .await
            .expect("open");
        device.close().await.expect("close");
        let err = device.prepare_to_flash().await.expect_err("closed");
        assert!(matches!(err, TransportError::DeviceNotOpen));
    }
}
