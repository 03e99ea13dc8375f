//! Device capability interfaces
//!
//! Two seams replace the source's class hierarchy: [`DeviceDiscovery`] finds
//! candidate devices and opens them, [`FlashDevice`] is one opened device.
//! The fleet coordinator parameterizes on a primary discovery implementation
//! and the per-device flasher consumes two device interfaces (primary plus
//! the update-request fallback).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use devflash_core::{DeviceId, Module, Storage};

use crate::error::TransportError;

/// A device a discovery pass found, possibly not yet fully identified.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    /// Device id, once known
    pub id: Option<DeviceId>,
    /// Platform id, once known
    pub platform_id: Option<u16>,
    /// Transport-specific locator (USB path, adapter serial)
    pub address: String,
}

impl DeviceHandle {
    /// Display label: the id when known, the locator otherwise.
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => id.to_string(),
            None => self.address.clone(),
        }
    }
}

/// Result of streaming a module to a device.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashOutcome {
    /// The device will reset itself to apply the module; the handle must be
    /// reopened before the next operation
    pub reset_pending: bool,
}

/// Enumerates and opens devices over one transport.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Candidate devices currently visible to this transport.
    async fn list(&self) -> Result<Vec<DeviceHandle>, TransportError>;

    /// Open a specific enumerated device.
    async fn open(&self, handle: &DeviceHandle) -> Result<Box<dyn FlashDevice>, TransportError>;

    /// Open a device by id, retrying until `timeout` while it re-enumerates.
    async fn open_by_id(
        &self,
        id: &DeviceId,
        timeout: Duration,
    ) -> Result<Box<dyn FlashDevice>, TransportError>;
}

/// One opened device on one transport.
#[async_trait]
pub trait FlashDevice: Send {
    /// Device id.
    fn id(&self) -> &DeviceId;

    /// Platform id, when the transport could determine it.
    fn platform_id(&self) -> Option<u16>;

    /// Release the device. Safe to call more than once.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Restart the device firmware.
    async fn reset(&mut self) -> Result<(), TransportError>;

    /// Put the device into a state where flashing is safe.
    async fn prepare_to_flash(&mut self) -> Result<(), TransportError>;

    /// Whether this transport can deliver the module at all.
    fn can_flash_module(&self, module: &Module) -> bool;

    /// Whether this transport can write raw data to the given storage.
    fn can_write_to_flash(&self, storage: Storage) -> bool;

    /// Write a file to a raw storage address.
    async fn write_to_flash(
        &mut self,
        file: &Path,
        storage: Storage,
        address: u32,
    ) -> Result<(), TransportError>;

    /// Deliver a whole module through the transport's own mechanism.
    async fn flash_module(&mut self, module: &Module) -> Result<FlashOutcome, TransportError>;
}
