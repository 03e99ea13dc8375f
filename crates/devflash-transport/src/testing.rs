//! Shared test doubles for the transport crate

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::usb::{UsbBus, UsbDeviceInfo, UsbDeviceIo};

/// One recorded control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ControlCall {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

/// Scripted USB bus: a mutable device list plus a log of every control
/// transfer issued through handles it opened.
pub(crate) struct MockUsbBus {
    pub devices: Mutex<Vec<UsbDeviceInfo>>,
    pub calls: Arc<Mutex<Vec<ControlCall>>>,
}

impl MockUsbBus {
    pub fn new(devices: Vec<UsbDeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn recorded_calls(&self) -> Vec<ControlCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn set_devices(&self, devices: Vec<UsbDeviceInfo>) {
        *self.devices.lock().expect("devices lock") = devices;
    }
}

#[async_trait]
impl UsbBus for MockUsbBus {
    async fn enumerate(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        Ok(self.devices.lock().expect("devices lock").clone())
    }

    async fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbDeviceIo>, TransportError> {
        let known = self
            .devices
            .lock()
            .expect("devices lock")
            .iter()
            .any(|d| d.bus == info.bus && d.address == info.address);
        if !known {
            return Err(TransportError::DeviceNotFound(info.port_path.clone()));
        }
        Ok(Box::new(MockDeviceIo {
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct MockDeviceIo {
    calls: Arc<Mutex<Vec<ControlCall>>>,
}

#[async_trait]
impl UsbDeviceIo for MockDeviceIo {
    async fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.calls.lock().expect("calls lock").push(ControlCall {
            request,
            value,
            index,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.calls.lock().expect("calls lock").push(ControlCall {
            request,
            value,
            index,
            data: Vec::new(),
        });
        Ok(vec![0u8; length])
    }

    async fn reset_port(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Convenience constructor for an enumerated device record.
pub(crate) fn usb_device(
    platform_id: u16,
    mode: crate::usb::UsbDeviceMode,
    serial: &str,
    bus: u8,
    address: u8,
) -> UsbDeviceInfo {
    UsbDeviceInfo {
        vendor_id: crate::usb::USB_VENDOR_ID,
        product_id: crate::usb::encode_pid(platform_id, mode),
        serial: Some(serial.to_string()),
        bus,
        address,
        port_path: format!("{bus}-{address}"),
    }
}
