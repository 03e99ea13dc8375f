//! Fleet coordinator
//!
//! Enumerates candidate devices across transports, reconciles requested
//! targets (ids, names, platform hints) against what is attached and what
//! the registry knows, and dispatches per-device flash jobs with bounded
//! parallelism. The first failure is captured and re-raised after every
//! device has reached a terminal state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use devflash_core::{DeviceId, Module, PlatformCatalog};
use devflash_transport::{DeviceDiscovery, DeviceHandle};

use crate::error::FleetError;
use crate::flasher::{flash_device, FlasherConfig};
use crate::registry::DeviceRegistry;

const INTERROGATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fleet-wide options.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Per-device retry budget
    pub max_retries: u32,
    /// Maximum concurrent device jobs; `None` is unbounded
    pub max_jobs: Option<usize>,
    /// Scratch directory handed to per-device flashers
    pub temp_dir: PathBuf,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_jobs: None,
            temp_dir: std::env::temp_dir().join("devflash"),
        }
    }
}

/// One requested target from the command line.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    /// Device id or user-assigned name
    pub id_or_name: String,
    /// Platform short-name hint (`<device>:<platform>`)
    pub platform_hint: Option<String>,
}

/// Coordinates discovery, target resolution, and dispatch.
pub struct FleetCoordinator {
    catalog: Arc<PlatformCatalog>,
    primary: Arc<dyn DeviceDiscovery>,
    update_request: Arc<dyn DeviceDiscovery>,
    /// Transport used only to pre-probe `id → platform` before opening
    /// devices on the primary transport.
    prober: Arc<dyn DeviceDiscovery>,
    registry: Option<Arc<dyn DeviceRegistry>>,
}

impl FleetCoordinator {
    /// Build a coordinator over a primary transport and the update-request
    /// fallback.
    pub fn new(
        catalog: Arc<PlatformCatalog>,
        primary: Arc<dyn DeviceDiscovery>,
        update_request: Arc<dyn DeviceDiscovery>,
    ) -> Self {
        let prober = Arc::clone(&update_request);
        Self {
            catalog,
            primary,
            update_request,
            prober,
            registry: None,
        }
    }

    /// Attach a device registry for name resolution and platform lookup.
    pub fn with_registry(mut self, registry: Arc<dyn DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Enumerate devices on the primary transport, filling in platform ids
    /// from a USB pre-probe where the transport itself cannot tell.
    pub async fn enumerate_devices(
        &self,
        config: &FleetConfig,
    ) -> Result<Vec<DeviceHandle>, FleetError> {
        let probed: HashMap<DeviceId, u16> = match self.prober.list().await {
            Ok(handles) => handles
                .into_iter()
                .filter_map(|h| match (h.id, h.platform_id) {
                    (Some(id), Some(platform)) => Some((id, platform)),
                    _ => None,
                })
                .collect(),
            Err(err) => {
                warn!(%err, "USB pre-probe failed; platforms must come from elsewhere");
                HashMap::new()
            }
        };
        debug!(probed = probed.len(), "USB pre-probe complete");

        let candidates = self.primary.list().await?;
        info!(candidates = candidates.len(), "Enumerating devices");

        let semaphore = Arc::new(Semaphore::new(config.max_jobs.unwrap_or(Semaphore::MAX_PERMITS)));
        let mut interrogations = FuturesUnordered::new();
        for handle in candidates {
            let semaphore = Arc::clone(&semaphore);
            let probed = &probed;
            interrogations.push(async move {
                let _permit = semaphore.acquire().await.ok()?;
                self.interrogate(handle, probed, config.max_retries).await
            });
        }

        let mut devices = Vec::new();
        while let Some(result) = interrogations.next().await {
            if let Some(handle) = result {
                devices.push(handle);
            }
        }

        if devices.is_empty() {
            return Err(FleetError::NoDevicesFound);
        }
        devices.sort_by(|a, b| a.label().cmp(&b.label()));
        Ok(devices)
    }

    /// Open one candidate, read its identity, and close it again.
    async fn interrogate(
        &self,
        handle: DeviceHandle,
        probed: &HashMap<DeviceId, u16>,
        max_retries: u32,
    ) -> Option<DeviceHandle> {
        let mut attempts_left = max_retries + 1;
        loop {
            attempts_left -= 1;
            match tokio::time::timeout(INTERROGATE_TIMEOUT, self.primary.open(&handle)).await {
                Ok(Ok(mut device)) => {
                    let id = device.id().clone();
                    let platform_id = device
                        .platform_id()
                        .or_else(|| probed.get(&id).copied());
                    let _ = device.close().await;
                    return Some(DeviceHandle {
                        id: Some(id),
                        platform_id,
                        address: handle.address,
                    });
                }
                Ok(Err(err)) if attempts_left > 0 => {
                    debug!(device = %handle.label(), %err, attempts_left, "Open failed; retrying");
                }
                Ok(Err(err)) => {
                    warn!(device = %handle.label(), %err, "Skipping device that would not open");
                    return None;
                }
                Err(_) if attempts_left > 0 => {
                    debug!(device = %handle.label(), attempts_left, "Open timed out; retrying");
                }
                Err(_) => {
                    warn!(device = %handle.label(), "Skipping device that would not open in time");
                    return None;
                }
            }
        }
    }

    /// Match requested targets against the local device set, consulting the
    /// registry once for names and missing platforms.
    pub async fn resolve_targets(
        &self,
        local: &[DeviceHandle],
        requested: &[TargetSpec],
    ) -> Result<Vec<DeviceHandle>, FleetError> {
        let mut selected: Vec<DeviceHandle> = Vec::new();
        let mut names_to_resolve: Vec<TargetSpec> = Vec::new();

        if requested.is_empty() {
            selected = local.to_vec();
        } else {
            for spec in requested {
                if let Ok(id) = DeviceId::new(&spec.id_or_name) {
                    let mut handle = local
                        .iter()
                        .find(|h| h.id.as_ref() == Some(&id))
                        .cloned()
                        .ok_or_else(|| FleetError::DeviceNotFound(id.to_string()))?;
                    if handle.platform_id.is_none() {
                        handle.platform_id = self.platform_from_hint(spec)?;
                    }
                    selected.push(handle);
                } else {
                    names_to_resolve.push(spec.clone());
                }
            }
        }

        let needs_registry = !names_to_resolve.is_empty()
            || selected.iter().any(|h| h.platform_id.is_none());

        if needs_registry {
            let registry = self.registry.as_ref().ok_or_else(|| {
                FleetError::AuthenticationRequired(
                    "resolving device names requires a registry access token".to_string(),
                )
            })?;

            // One listing serves every name and every missing platform.
            let user = registry.get_user_info().await?;
            debug!(user = %user.username, "Registry token validated");
            let registry_devices = registry.list_devices().await?;

            for spec in &names_to_resolve {
                let entry = registry_devices
                    .iter()
                    .find(|d| d.name.as_deref() == Some(spec.id_or_name.as_str()))
                    .ok_or_else(|| FleetError::DeviceNotFound(spec.id_or_name.clone()))?;
                let id = DeviceId::new(&entry.id)
                    .map_err(|_| FleetError::DeviceNotFound(entry.id.clone()))?;
                let mut handle = local
                    .iter()
                    .find(|h| h.id.as_ref() == Some(&id))
                    .cloned()
                    .ok_or_else(|| FleetError::DeviceNotFound(spec.id_or_name.clone()))?;
                if handle.platform_id.is_none() {
                    handle.platform_id = Some(entry.platform_id);
                }
                selected.push(handle);
            }

            for handle in selected.iter_mut().filter(|h| h.platform_id.is_none()) {
                let id = handle.id.as_ref().map(|id| id.to_string()).unwrap_or_default();
                if let Some(entry) = registry_devices.iter().find(|d| d.id.eq_ignore_ascii_case(&id))
                {
                    handle.platform_id = Some(entry.platform_id);
                }
            }

            // Product devices get flagged as development devices so the
            // cloud does not immediately flash them back.
            for handle in &selected {
                let Some(id) = handle.id.as_ref() else { continue };
                let entry = registry_devices
                    .iter()
                    .find(|d| d.id.eq_ignore_ascii_case(id.as_str()));
                if let Some(entry) = entry {
                    if let Some(product) = entry.product_id {
                        info!(device = %id, product, "Marking product device as development");
                        registry.update_device(&entry.id, true, Some(product)).await?;
                    }
                }
            }
        }

        for handle in &selected {
            if handle.platform_id.is_none() {
                return Err(FleetError::UnknownPlatform(handle.label()));
            }
        }

        Ok(selected)
    }

    fn platform_from_hint(&self, spec: &TargetSpec) -> Result<Option<u16>, FleetError> {
        match &spec.platform_hint {
            Some(hint) => Ok(Some(self.catalog.by_name(hint)?.id)),
            None => Ok(None),
        }
    }

    /// Flash every selected device, bounded by `max_jobs`, capturing the
    /// first failure while letting every other device finish.
    pub async fn dispatch(
        &self,
        devices: &[DeviceHandle],
        modules: &[Module],
        config: &FleetConfig,
    ) -> Result<(), FleetError> {
        let semaphore = Arc::new(Semaphore::new(config.max_jobs.unwrap_or(Semaphore::MAX_PERMITS)));
        let first_error: Arc<Mutex<Option<FleetError>>> = Arc::new(Mutex::new(None));

        let flasher_config = FlasherConfig {
            max_retries: config.max_retries,
            temp_dir: config.temp_dir.clone(),
        };

        let mut jobs = FuturesUnordered::new();
        for handle in devices {
            let semaphore = Arc::clone(&semaphore);
            let first_error = Arc::clone(&first_error);
            let flasher_config = flasher_config.clone();
            let device_modules: Vec<Module> = modules
                .iter()
                .filter(|m| Some(m.platform_id) == handle.platform_id)
                .cloned()
                .collect();

            jobs.push(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if device_modules.is_empty() {
                    warn!(device = %handle.label(), "No modules for this device's platform; skipping");
                    return;
                }
                info!(device = %handle.label(), modules = device_modules.len(), "Flashing device");
                match flash_device(
                    self.primary.as_ref(),
                    self.update_request.as_ref(),
                    handle,
                    &device_modules,
                    &flasher_config,
                )
                .await
                {
                    Ok(()) => info!(device = %handle.label(), "Device flashed"),
                    Err(err) => {
                        warn!(device = %handle.label(), %err, "Device failed");
                        let mut slot = first_error.lock().await;
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
            });
        }

        while jobs.next().await.is_some() {}

        let mut slot = first_error.lock().await;
        match slot.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
