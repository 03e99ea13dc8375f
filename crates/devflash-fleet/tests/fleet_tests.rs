//! Flasher and coordinator scenarios against mock transports

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use devflash_core::{DeviceId, Module, ModuleType, PlatformCatalog, Storage};
use devflash_fleet::registry::{DeviceRegistry, RegistryDevice, UserInfo};
use devflash_fleet::{flash_device, FlasherConfig, FleetConfig, FleetCoordinator, FleetError, TargetSpec};
use devflash_transport::{
    DeviceDiscovery, DeviceHandle, FlashDevice, FlashOutcome, TransportError,
};

const BORON_ID: &str = "e00fce68d23c1a2b3c4d5e6f";
const SECOND_ID: &str = "e00fce68aaaaaaaaaaaaaaaa";

fn module(name: &str, module_type: ModuleType, platform_id: u16) -> Module {
    Module {
        platform_id,
        platform_name: "boron".to_string(),
        module_type,
        index: 1,
        version: 1,
        storage: Storage::InternalFlash,
        address: 0x3_0000,
        module_size: 64,
        header_size: 24,
        drop_header: false,
        encrypted: false,
        needs_encryption: false,
        crc_valid: true,
        file_size: 64,
        file_path: PathBuf::from(name),
        is_asset: false,
    }
}

/// Shared observation state across every mock device and transport.
#[derive(Default)]
struct FleetState {
    log: Mutex<Vec<String>>,
    failing_device: Mutex<Option<String>>,
    write_failures_remaining: AtomicU32,
    resets: AtomicU32,
    active_jobs: AtomicUsize,
    max_active_jobs: AtomicUsize,
}

impl FleetState {
    fn record(&self, entry: impl Into<String>) {
        self.log.lock().expect("log lock").push(entry.into());
    }

    fn fail_writes_of(&self, device: &str, count: u32) {
        *self.failing_device.lock().expect("failing lock") = Some(device.to_string());
        self.write_failures_remaining.store(count, Ordering::SeqCst);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }
}

#[derive(Clone)]
struct MockDeviceSpec {
    id: DeviceId,
    platform_id: u16,
}

/// One mock transport; `raw` behaves like the DFU path (raw writes, no
/// bootloader), `usb` like the update-request path (module streaming only).
struct MockTransport {
    name: &'static str,
    devices: Vec<MockDeviceSpec>,
    state: Arc<FleetState>,
}

impl MockTransport {
    fn new(name: &'static str, devices: Vec<MockDeviceSpec>, state: Arc<FleetState>) -> Self {
        Self {
            name,
            devices,
            state,
        }
    }

    fn device_for(&self, id: &DeviceId) -> Option<Box<dyn FlashDevice>> {
        let spec = self.devices.iter().find(|d| &d.id == id)?;
        Some(Box::new(MockDevice {
            transport: self.name,
            spec: spec.clone(),
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

#[async_trait]
impl DeviceDiscovery for MockTransport {
    async fn list(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(self
            .devices
            .iter()
            .map(|spec| DeviceHandle {
                id: Some(spec.id.clone()),
                platform_id: Some(spec.platform_id),
                address: format!("{}:{}", self.name, spec.id),
            })
            .collect())
    }

    async fn open(&self, handle: &DeviceHandle) -> Result<Box<dyn FlashDevice>, TransportError> {
        let id = handle
            .id
            .clone()
            .ok_or_else(|| TransportError::DeviceNotFound(handle.address.clone()))?;
        self.state.record(format!("{}:open {}", self.name, id));
        self.device_for(&id)
            .ok_or_else(|| TransportError::DeviceNotFound(id.to_string()))
    }

    async fn open_by_id(
        &self,
        id: &DeviceId,
        _timeout: Duration,
    ) -> Result<Box<dyn FlashDevice>, TransportError> {
        self.state.record(format!("{}:open {}", self.name, id));
        self.device_for(id)
            .ok_or_else(|| TransportError::DeviceNotFound(id.to_string()))
    }
}

struct MockDevice {
    transport: &'static str,
    spec: MockDeviceSpec,
    state: Arc<FleetState>,
    open: bool,
}

#[async_trait]
impl FlashDevice for MockDevice {
    fn id(&self) -> &DeviceId {
        &self.spec.id
    }

    fn platform_id(&self) -> Option<u16> {
        Some(self.spec.platform_id)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.state.record(format!("{}:close {}", self.transport, self.spec.id));
            self.open = false;
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.state.record(format!("{}:reset {}", self.transport, self.spec.id));
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn prepare_to_flash(&mut self) -> Result<(), TransportError> {
        self.state
            .record(format!("{}:prepare {}", self.transport, self.spec.id));
        Ok(())
    }

    fn can_flash_module(&self, module: &Module) -> bool {
        match self.transport {
            "raw" => module.module_type != ModuleType::Bootloader,
            _ => true,
        }
    }

    fn can_write_to_flash(&self, _storage: Storage) -> bool {
        self.transport == "raw"
    }

    async fn write_to_flash(
        &mut self,
        file: &Path,
        _storage: Storage,
        _address: u32,
    ) -> Result<(), TransportError> {
        let active = self.state.active_jobs.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active_jobs.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.state.active_jobs.fetch_sub(1, Ordering::SeqCst);

        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let failing = self
            .state
            .failing_device
            .lock()
            .expect("failing lock")
            .as_deref()
            .map(|id| id == self.spec.id.as_str())
            .unwrap_or(false);
        if failing
            && self
                .state
                .write_failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            self.state.record(format!("{}:write-failed {name}", self.transport));
            return Err(TransportError::ProgrammerFailed {
                exit_code: 1,
                stderr: "lost device".to_string(),
            });
        }

        self.state.record(format!("{}:write {name}", self.transport));
        Ok(())
    }

    async fn flash_module(&mut self, module: &Module) -> Result<FlashOutcome, TransportError> {
        self.state
            .record(format!("{}:flash {}", self.transport, module.file_name()));
        Ok(FlashOutcome { reset_pending: true })
    }
}

fn handle_for(id: &str, platform_id: u16) -> DeviceHandle {
    DeviceHandle {
        id: Some(DeviceId::new(id).expect("id")),
        platform_id: Some(platform_id),
        address: format!("raw:{id}"),
    }
}

fn flasher_config(dir: &tempfile::TempDir, max_retries: u32) -> FlasherConfig {
    FlasherConfig {
        max_retries,
        temp_dir: dir.path().to_path_buf(),
    }
}

fn fleet(state: &Arc<FleetState>, ids: &[(&str, u16)]) -> (MockTransport, MockTransport) {
    let specs: Vec<_> = ids
        .iter()
        .map(|(id, platform)| MockDeviceSpec {
            id: DeviceId::new(id).expect("id"),
            platform_id: *platform,
        })
        .collect();
    (
        MockTransport::new("raw", specs.clone(), Arc::clone(state)),
        MockTransport::new("usb", specs, Arc::clone(state)),
    )
}

#[tokio::test(start_paused = true)]
async fn failed_write_retries_from_the_failing_module() {
    let state = Arc::new(FleetState::default());
    state.fail_writes_of(BORON_ID, 1);
    let (raw, usb) = fleet(&state, &[(BORON_ID, 13)]);
    let dir = tempfile::TempDir::new().expect("temp dir");

    let modules = vec![
        module("system-part1.bin", ModuleType::SystemPart, 13),
        module("tinker.bin", ModuleType::UserPart, 13),
    ];
    flash_device(
        &raw,
        &usb,
        &handle_for(BORON_ID, 13),
        &modules,
        &flasher_config(&dir, 2),
    )
    .await
    .expect("second attempt succeeds");

    let log = state.log();
    let failed = log
        .iter()
        .position(|e| e == "raw:write-failed system-part1.bin")
        .expect("first write fails");
    let retried = log
        .iter()
        .position(|e| e == "raw:write system-part1.bin")
        .expect("failing module is retried first");
    assert!(failed < retried, "retry must resume at the failed module: {log:?}");
    assert!(
        log.iter().any(|e| e == "raw:write tinker.bin"),
        "remaining modules still flash: {log:?}"
    );
    assert_eq!(
        state.resets.load(Ordering::SeqCst),
        1,
        "exactly one reset after the direct phase: {log:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_propagate_the_write_error() {
    let state = Arc::new(FleetState::default());
    state.fail_writes_of(BORON_ID, 10);
    let (raw, usb) = fleet(&state, &[(BORON_ID, 13)]);
    let dir = tempfile::TempDir::new().expect("temp dir");

    let modules = vec![module("system-part1.bin", ModuleType::SystemPart, 13)];
    let err = flash_device(
        &raw,
        &usb,
        &handle_for(BORON_ID, 13),
        &modules,
        &flasher_config(&dir, 2),
    )
    .await
    .expect_err("all attempts fail");

    match err {
        FleetError::FlashFailed { device, source } => {
            assert_eq!(device, BORON_ID);
            assert!(matches!(source, TransportError::ProgrammerFailed { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Initial attempt plus two retries.
    let attempts = state
        .log()
        .iter()
        .filter(|e| e.starts_with("raw:write-failed"))
        .count();
    assert_eq!(attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn direct_modules_finish_before_the_transport_switch() {
    let state = Arc::new(FleetState::default());
    let (raw, usb) = fleet(&state, &[(BORON_ID, 13)]);
    let dir = tempfile::TempDir::new().expect("temp dir");

    let modules = vec![
        module("system-part1.bin", ModuleType::SystemPart, 13),
        module("bootloader.bin", ModuleType::Bootloader, 13),
    ];
    flash_device(
        &raw,
        &usb,
        &handle_for(BORON_ID, 13),
        &modules,
        &flasher_config(&dir, 2),
    )
    .await
    .expect("both phases succeed");

    let log = state.log();
    let raw_reset = log
        .iter()
        .position(|e| e.starts_with("raw:reset"))
        .expect("direct phase ends with a reset");
    let usb_open = log
        .iter()
        .position(|e| e.starts_with("usb:open"))
        .expect("update-request phase opens after");
    let usb_flash = log
        .iter()
        .position(|e| e == "usb:flash bootloader.bin")
        .expect("bootloader goes via update request");
    let usb_reset = log
        .iter()
        .rposition(|e| e.starts_with("usb:reset"))
        .expect("final reset");

    assert!(raw_reset < usb_open, "direct phase must complete first: {log:?}");
    assert!(usb_open < usb_flash && usb_flash < usb_reset, "{log:?}");
    assert_eq!(state.resets.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn encrypted_slot_policy_skips_unencrypted_images() {
    let state = Arc::new(FleetState::default());
    let (raw, usb) = fleet(&state, &[(BORON_ID, 26)]);
    let dir = tempfile::TempDir::new().expect("temp dir");

    let mut ncp = module("esp32-ncp.bin", ModuleType::NcpFirmware, 26);
    ncp.needs_encryption = true;
    ncp.encrypted = false;
    let modules = vec![module("system-part1.bin", ModuleType::SystemPart, 26), ncp];

    flash_device(
        &raw,
        &usb,
        &handle_for(BORON_ID, 26),
        &modules,
        &flasher_config(&dir, 2),
    )
    .await
    .expect("job succeeds without the skipped module");

    let log = state.log();
    assert!(
        !log.iter().any(|e| e.contains("esp32-ncp.bin")),
        "unencrypted image for an encrypted slot must be skipped: {log:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn dispatch_reports_first_error_but_flashes_every_device() {
    let state = Arc::new(FleetState::default());
    // Exhaust the first device's retry budget; the second device is healthy.
    state.fail_writes_of(BORON_ID, 10);
    let (raw, usb) = fleet(&state, &[(BORON_ID, 13), (SECOND_ID, 13)]);
    let catalog = Arc::new(PlatformCatalog::new());
    let coordinator = FleetCoordinator::new(
        catalog,
        Arc::new(raw) as Arc<dyn DeviceDiscovery>,
        Arc::new(usb) as Arc<dyn DeviceDiscovery>,
    );

    let dir = tempfile::TempDir::new().expect("temp dir");
    let config = FleetConfig {
        max_retries: 1,
        max_jobs: Some(1),
        temp_dir: dir.path().to_path_buf(),
    };

    let devices = vec![handle_for(BORON_ID, 13), handle_for(SECOND_ID, 13)];
    let modules = vec![module("system-part1.bin", ModuleType::SystemPart, 13)];

    let err = coordinator
        .dispatch(&devices, &modules, &config)
        .await
        .expect_err("first device fails");
    assert!(matches!(err, FleetError::FlashFailed { .. }));

    let log = state.log();
    // Both devices reached a terminal state: the second one flashed fine.
    assert!(
        log.iter().any(|e| e == "raw:write system-part1.bin"),
        "the healthy device still flashes: {log:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn dispatch_honors_the_job_bound() {
    let state = Arc::new(FleetState::default());
    let ids: Vec<(&str, u16)> = vec![
        (BORON_ID, 13),
        (SECOND_ID, 13),
        ("e00fce68bbbbbbbbbbbbbbbb", 13),
    ];
    let (raw, usb) = fleet(&state, &ids);
    let coordinator = FleetCoordinator::new(
        Arc::new(PlatformCatalog::new()),
        Arc::new(raw) as Arc<dyn DeviceDiscovery>,
        Arc::new(usb) as Arc<dyn DeviceDiscovery>,
    );

    let dir = tempfile::TempDir::new().expect("temp dir");
    let config = FleetConfig {
        max_retries: 0,
        max_jobs: Some(1),
        temp_dir: dir.path().to_path_buf(),
    };

    let devices: Vec<_> = ids.iter().map(|(id, p)| handle_for(id, *p)).collect();
    let modules = vec![module("system-part1.bin", ModuleType::SystemPart, 13)];
    coordinator
        .dispatch(&devices, &modules, &config)
        .await
        .expect("all devices flash");

    assert_eq!(
        state.max_active_jobs.load(Ordering::SeqCst),
        1,
        "no more than max_jobs devices may be mid-write"
    );
}

#[tokio::test(start_paused = true)]
async fn enumeration_fails_when_nothing_is_attached() {
    let state = Arc::new(FleetState::default());
    let (raw, usb) = fleet(&state, &[]);
    let coordinator = FleetCoordinator::new(
        Arc::new(PlatformCatalog::new()),
        Arc::new(raw) as Arc<dyn DeviceDiscovery>,
        Arc::new(usb) as Arc<dyn DeviceDiscovery>,
    );

    let err = coordinator
        .enumerate_devices(&FleetConfig::default())
        .await
        .expect_err("no devices");
    assert!(matches!(err, FleetError::NoDevicesFound));
}

#[tokio::test(start_paused = true)]
async fn enumeration_interrogates_and_closes_each_device() {
    let state = Arc::new(FleetState::default());
    let (raw, usb) = fleet(&state, &[(BORON_ID, 13)]);
    let coordinator = FleetCoordinator::new(
        Arc::new(PlatformCatalog::new()),
        Arc::new(raw) as Arc<dyn DeviceDiscovery>,
        Arc::new(usb) as Arc<dyn DeviceDiscovery>,
    );

    let devices = coordinator
        .enumerate_devices(&FleetConfig::default())
        .await
        .expect("one device");
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].platform_id, Some(13));

    let log = state.log();
    assert!(log.iter().any(|e| e.starts_with("raw:open")));
    assert!(log.iter().any(|e| e.starts_with("raw:close")));
}

// Registry-backed target resolution.

struct MockRegistry {
    devices: Vec<RegistryDevice>,
    updates: Mutex<Vec<(String, bool, Option<u32>)>>,
}

#[async_trait]
impl DeviceRegistry for MockRegistry {
    async fn get_user_info(&self) -> Result<UserInfo, FleetError> {
        Ok(UserInfo {
            username: "qa@example.com".to_string(),
        })
    }

    async fn list_devices(&self) -> Result<Vec<RegistryDevice>, FleetError> {
        Ok(self.devices.clone())
    }

    async fn get_device(&self, id_or_name: &str) -> Result<RegistryDevice, FleetError> {
        self.devices
            .iter()
            .find(|d| d.id == id_or_name || d.name.as_deref() == Some(id_or_name))
            .cloned()
            .ok_or_else(|| FleetError::DeviceNotFound(id_or_name.to_string()))
    }

    async fn update_device(
        &self,
        id: &str,
        development: bool,
        product_id: Option<u32>,
    ) -> Result<(), FleetError> {
        self.updates
            .lock()
            .expect("updates lock")
            .push((id.to_string(), development, product_id));
        Ok(())
    }
}

#[tokio::test]
async fn names_resolve_through_the_registry() {
    let state = Arc::new(FleetState::default());
    let (raw, usb) = fleet(&state, &[(BORON_ID, 13)]);
    let registry = Arc::new(MockRegistry {
        devices: vec![RegistryDevice {
            id: BORON_ID.to_string(),
            name: Some("lab-boron".to_string()),
            platform_id: 13,
            product_id: Some(4242),
        }],
        updates: Mutex::new(Vec::new()),
    });
    let coordinator = FleetCoordinator::new(
        Arc::new(PlatformCatalog::new()),
        Arc::new(raw) as Arc<dyn DeviceDiscovery>,
        Arc::new(usb) as Arc<dyn DeviceDiscovery>,
    )
    .with_registry(Arc::clone(&registry) as Arc<dyn DeviceRegistry>);

    let local = vec![DeviceHandle {
        id: Some(DeviceId::new(BORON_ID).expect("id")),
        platform_id: None,
        address: format!("raw:{BORON_ID}"),
    }];
    let requested = vec![TargetSpec {
        id_or_name: "lab-boron".to_string(),
        platform_hint: None,
    }];

    let selected = coordinator
        .resolve_targets(&local, &requested)
        .await
        .expect("resolved");
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].platform_id, Some(13));

    // The product device got flagged as a development device.
    let updates = registry.updates.lock().expect("updates lock").clone();
    assert_eq!(updates, vec![(BORON_ID.to_string(), true, Some(4242))]);
}

#[tokio::test]
async fn unknown_ids_fail_without_touching_the_registry() {
    let state = Arc::new(FleetState::default());
    let (raw, usb) = fleet(&state, &[(BORON_ID, 13)]);
    let coordinator = FleetCoordinator::new(
        Arc::new(PlatformCatalog::new()),
        Arc::new(raw) as Arc<dyn DeviceDiscovery>,
        Arc::new(usb) as Arc<dyn DeviceDiscovery>,
    );

    let local = vec![handle_for(BORON_ID, 13)];
    let requested = vec![TargetSpec {
        id_or_name: SECOND_ID.to_string(),
        platform_hint: None,
    }];
    let err = coordinator
        .resolve_targets(&local, &requested)
        .await
        .expect_err("absent id");
    assert!(matches!(err, FleetError::DeviceNotFound(id) if id == SECOND_ID));
}

#[tokio::test]
async fn platform_hint_fills_in_unknown_platforms() {
    let state = Arc::new(FleetState::default());
    let (raw, usb) = fleet(&state, &[(BORON_ID, 13)]);
    let coordinator = FleetCoordinator::new(
        Arc::new(PlatformCatalog::new()),
        Arc::new(raw) as Arc<dyn DeviceDiscovery>,
        Arc::new(usb) as Arc<dyn DeviceDiscovery>,
    );

    let local = vec![DeviceHandle {
        id: Some(DeviceId::new(BORON_ID).expect("id")),
        platform_id: None,
        address: format!("raw:{BORON_ID}"),
    }];
    let requested = vec![TargetSpec {
        id_or_name: BORON_ID.to_string(),
        platform_hint: Some("boron".to_string()),
    }];

    let selected = coordinator
        .resolve_targets(&local, &requested)
        .await
        .expect("resolved via hint");
    assert_eq!(selected[0].platform_id, Some(13));
}

#[tokio::test]
async fn unknown_platform_without_registry_is_an_error() {
    let state = Arc::new(FleetState::default());
    let (raw, usb) = fleet(&state, &[(BORON_ID, 13)]);
    let coordinator = FleetCoordinator::new(
        Arc::new(PlatformCatalog::new()),
        Arc::new(raw) as Arc<dyn DeviceDiscovery>,
        Arc::new(usb) as Arc<dyn DeviceDiscovery>,
    );

    let local = vec![DeviceHandle {
        id: Some(DeviceId::new(BORON_ID).expect("id")),
        platform_id: None,
        address: format!("raw:{BORON_ID}"),
    }];
    let requested = vec![TargetSpec {
        id_or_name: BORON_ID.to_string(),
        platform_hint: None,
    }];
    let err = coordinator
        .resolve_targets(&local, &requested)
        .await
        .expect_err("platform unknown and no registry");
    assert!(matches!(err, FleetError::AuthenticationRequired(_)));
}
