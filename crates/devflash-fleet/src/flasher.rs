//! Per-device flashing state machine
//!
//! One run of [`flash_device`] takes a device through the full sequence:
//! partition the module list by what the primary transport can write
//! directly, flash the direct partition with retries and a final reset, then
//! switch to the update-request transport for everything else (bootloaders,
//! NCP images, anything without raw storage access). Module order within
//! each partition is preserved, and a retry resumes from the first module
//! that has not yet been written.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use devflash_core::{DeviceId, Module};
use devflash_transport::{DeviceDiscovery, DeviceHandle, FlashDevice, REOPEN_TIMEOUT};

use crate::error::FleetError;

/// How long to wait for re-enumeration before switching transports.
const TRANSPORT_SWITCH_DELAY: Duration = Duration::from_secs(3);

/// Per-job flasher options.
#[derive(Debug, Clone)]
pub struct FlasherConfig {
    /// How many times a failed phase may be retried
    pub max_retries: u32,
    /// Scratch directory for header-stripped module images
    pub temp_dir: PathBuf,
}

/// Flash all applicable modules onto one device.
pub async fn flash_device(
    primary: &dyn DeviceDiscovery,
    update_request: &dyn DeviceDiscovery,
    handle: &DeviceHandle,
    modules: &[Module],
    config: &FlasherConfig,
) -> Result<(), FleetError> {
    let id = handle
        .id
        .clone()
        .ok_or_else(|| FleetError::DeviceNotFound(handle.label()))?;

    let mut device = primary
        .open(handle)
        .await
        .map_err(|source| FleetError::FlashFailed {
            device: id.to_string(),
            source,
        })?;

    // The partition is computed once, against the device we just opened,
    // and never revised mid-job.
    let mut direct = VecDeque::new();
    let mut via_update = VecDeque::new();
    for module in modules {
        if module.needs_encryption && !module.encrypted {
            warn!(
                device = %id,
                module = %module.file_name(),
                "Platform requires this module slot to be encrypted; skipping unencrypted image"
            );
            continue;
        }
        if device.can_flash_module(module) && device.can_write_to_flash(module.storage) {
            direct.push_back(module.clone());
        } else {
            via_update.push_back(module.clone());
        }
    }
    info!(
        device = %id,
        direct = direct.len(),
        via_update = via_update.len(),
        "Starting flash job"
    );

    let mut materialized = HashMap::new();
    let device_temp = config.temp_dir.join(id.as_str());

    let mut retries_left = config.max_retries;
    let result = run_phases(
        primary,
        update_request,
        &id,
        &mut device,
        &mut direct,
        &mut via_update,
        &mut retries_left,
        &device_temp,
        &mut materialized,
    )
    .await;

    let _ = device.close().await;
    let _ = tokio::fs::remove_dir_all(&device_temp).await;

    result.map_err(|source| FleetError::FlashFailed {
        device: id.to_string(),
        source,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_phases(
    primary: &dyn DeviceDiscovery,
    update_request: &dyn DeviceDiscovery,
    id: &DeviceId,
    device: &mut Box<dyn FlashDevice>,
    direct: &mut VecDeque<Module>,
    via_update: &mut VecDeque<Module>,
    retries_left: &mut u32,
    device_temp: &Path,
    materialized: &mut HashMap<PathBuf, PathBuf>,
) -> Result<(), devflash_transport::TransportError> {
    // Direct phase: raw writes over the primary transport, then one reset.
    if !direct.is_empty() {
        let mut reset_done = false;
        loop {
            let attempt = direct_attempt(device, direct, device_temp, materialized).await;
            match attempt {
                Ok(()) => {
                    reset_done = true;
                    break;
                }
                Err(err) => {
                    let _ = device.close().await;
                    if *retries_left == 0 {
                        return Err(err);
                    }
                    *retries_left -= 1;
                    warn!(
                        device = %id,
                        %err,
                        retries_left = *retries_left,
                        "Direct flash attempt failed; retrying from the first unfinished module"
                    );
                    *device = primary.open_by_id(id, REOPEN_TIMEOUT).await?;
                }
            }
        }
        debug_assert!(reset_done);
    }

    // Update-request phase: stream the remaining modules through running
    // firmware, reopening around self-resets.
    if !via_update.is_empty() {
        let _ = device.close().await;
        debug!(device = %id, "Waiting for re-enumeration before switching transports");
        tokio::time::sleep(TRANSPORT_SWITCH_DELAY).await;

        loop {
            let attempt = update_attempt(update_request, id, via_update).await;
            match attempt {
                Ok(()) => break,
                Err(err) => {
                    if *retries_left == 0 {
                        return Err(err);
                    }
                    *retries_left -= 1;
                    warn!(
                        device = %id,
                        %err,
                        retries_left = *retries_left,
                        "Update-request attempt failed; retrying from the first unfinished module"
                    );
                }
            }
        }
    }

    Ok(())
}

/// One pass over the remaining direct modules; pops each module only after
/// its write succeeded so retries resume at the right place.
async fn direct_attempt(
    device: &mut Box<dyn FlashDevice>,
    remaining: &mut VecDeque<Module>,
    device_temp: &Path,
    materialized: &mut HashMap<PathBuf, PathBuf>,
) -> Result<(), devflash_transport::TransportError> {
    device.prepare_to_flash().await?;
    while let Some(module) = remaining.front() {
        let file = prepared_file(module, device_temp, materialized).await?;
        info!(
            device = %device.id(),
            module = %module.module_type,
            file = %module.file_name(),
            "Writing module"
        );
        device
            .write_to_flash(&file, module.storage, module.address)
            .await?;
        remaining.pop_front();
    }
    device.reset().await
}

/// One pass over the remaining update-request modules.
async fn update_attempt(
    update_request: &dyn DeviceDiscovery,
    id: &DeviceId,
    remaining: &mut VecDeque<Module>,
) -> Result<(), devflash_transport::TransportError> {
    let mut device = update_request.open_by_id(id, REOPEN_TIMEOUT).await?;
    device.prepare_to_flash().await?;

    while let Some(module) = remaining.front() {
        info!(
            device = %id,
            module = %module.module_type,
            file = %module.file_name(),
            "Sending module"
        );
        let outcome = device.flash_module(module).await?;
        remaining.pop_front();
        if outcome.reset_pending && !remaining.is_empty() {
            device.close().await?;
            device = update_request.open_by_id(id, REOPEN_TIMEOUT).await?;
        }
    }

    let result = device.reset().await;
    let _ = device.close().await;
    result
}

/// Path to the file to write for a module: the original, or a header-
/// stripped copy materialized once per source path in the device's temp
/// directory.
async fn prepared_file(
    module: &Module,
    device_temp: &Path,
    materialized: &mut HashMap<PathBuf, PathBuf>,
) -> Result<PathBuf, devflash_transport::TransportError> {
    if !module.drop_header {
        return Ok(module.file_path.clone());
    }
    if let Some(path) = materialized.get(&module.file_path) {
        return Ok(path.clone());
    }

    tokio::fs::create_dir_all(device_temp).await?;
    let stripped = device_temp.join(module.file_name());
    let data = tokio::fs::read(&module.file_path).await?;
    let offset = (module.header_size as usize).min(data.len());
    tokio::fs::write(&stripped, &data[offset..]).await?;
    debug!(
        file = %module.file_name(),
        header = module.header_size,
        "Materialized header-stripped image"
    );

    materialized.insert(module.file_path.clone(), stripped.clone());
    Ok(stripped)
}
