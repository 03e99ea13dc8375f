//! Debug-adapter transport
//!
//! Flashes targets through a hardware debug probe driven by an OpenOCD
//! daemon. The transport owns the daemon subprocess ([`daemon`]) and talks to
//! it over the telnet-style control port; adapter models and probe-able MCU
//! families live in [`adapters`].
//!
//! Opening a device is a small saga: detect the target MCU with a generic
//! Cortex-M probe pass when the adapter could be wired to more than one
//! family, restart the daemon with the real target configuration, optionally
//! reset-and-halt, then read the device id over the debug port.

pub mod adapters;
pub mod daemon;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use devflash_core::util::format_hex_address;
use devflash_core::{
    DebugTargetConfig, DeviceId, DeviceIdReadProcedure, FlashStyle, McuFamily, Module,
    PlatformCatalog, Storage,
};

use crate::device::{DeviceDiscovery, DeviceHandle, FlashDevice, FlashOutcome};
use crate::error::TransportError;
use crate::telnet::{ControlClient, ControlClientConfig};
use crate::usb::UsbBus;
use crate::{DEBUG_WRITE_TIMEOUT, DEFAULT_COMMAND_TIMEOUT, MIN_RESET_INTERVAL};

use adapters::{find_adapter, mcu_target, DebugAdapterKind, BASE_CONTROL_PORT};
use daemon::{DaemonState, OpenOcdDaemon, RestartGate};

/// Minimal control-connection surface the device logic needs; implemented by
/// [`ControlClient`] and by scripted sessions in tests.
#[async_trait]
pub trait ControlSession: Send + Sync {
    /// Run a command and collect its output.
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    /// Write a line without waiting for a response.
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Close the connection.
    async fn disconnect(&mut self);

    /// Connected with no command in flight.
    fn is_idle(&self) -> bool;
}

#[async_trait]
impl ControlSession for ControlClient {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.exec_with_timeout(command, timeout).await
    }

    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        ControlClient::send_line(self, line).await
    }

    async fn disconnect(&mut self) {
        ControlClient::disconnect(self).await;
    }

    fn is_idle(&self) -> bool {
        ControlClient::is_idle(self)
    }
}

/// One attached debug adapter.
#[derive(Debug, Clone)]
struct AdapterInstance {
    kind: &'static DebugAdapterKind,
    serial: String,
    index: u32,
}

impl AdapterInstance {
    fn locator(&self) -> String {
        format!("{}:{}", self.kind.name, self.serial)
    }

    fn control_port(&self) -> u16 {
        BASE_CONTROL_PORT + (self.index as u16) - 1
    }
}

/// Discovery over attached debug adapters.
pub struct OpenOcdTransport {
    bus: Arc<dyn UsbBus>,
    catalog: Arc<PlatformCatalog>,
    binary: PathBuf,
    restart_gates: StdMutex<HashMap<String, RestartGate>>,
}

impl OpenOcdTransport {
    /// Create the transport; the daemon binary is resolved via `PATH`.
    pub fn new(bus: Arc<dyn UsbBus>, catalog: Arc<PlatformCatalog>) -> Self {
        Self {
            bus,
            catalog,
            binary: PathBuf::from("openocd"),
            restart_gates: StdMutex::new(HashMap::new()),
        }
    }

    /// Override the daemon executable (used by tests).
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn gate_for(&self, serial: &str) -> RestartGate {
        let mut gates = self.restart_gates.lock().expect("restart gate lock");
        Arc::clone(
            gates
                .entry(serial.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }

    async fn adapters(&self) -> Result<Vec<AdapterInstance>, TransportError> {
        let mut instances = Vec::new();
        let mut next_index = 1u32;
        for info in self.bus.enumerate().await? {
            let Some(kind) = find_adapter(info.vendor_id, info.product_id) else {
                continue;
            };
            let serial = info
                .serial
                .clone()
                .unwrap_or_else(|| info.port_path.clone());
            instances.push(AdapterInstance {
                kind,
                serial,
                index: next_index,
            });
            next_index += 1;
        }
        Ok(instances)
    }

    async fn open_adapter(
        &self,
        adapter: &AdapterInstance,
    ) -> Result<OpenOcdDevice, TransportError> {
        let gate = self.gate_for(&adapter.serial);

        let family = if adapter.kind.supported.len() == 1 {
            adapter.kind.supported[0]
        } else {
            self.detect_family(adapter, &gate).await?
        };
        info!(adapter = %adapter.locator(), %family, "Debug target identified");

        let debug = self
            .family_debug_config(family)
            .ok_or(TransportError::NotSupported(
                "no debug configuration for the detected MCU family",
            ))?;

        let target_config = mcu_target(family)
            .map(|t| t.target_config)
            .unwrap_or(debug.target_config);

        let mut daemon = OpenOcdDaemon::new(&self.binary, adapter.control_port(), gate);
        let args = daemon_args(
            adapter,
            DaemonTarget::Real(target_config),
            debug.assert_srst_on_connect,
        );
        daemon.start(&args).await?;

        let client = match ControlClient::connect(
            "127.0.0.1",
            adapter.control_port(),
            ControlClientConfig::default(),
        )
        .await
        {
            Ok(client) => client,
            Err(err) => {
                daemon.stop(None).await?;
                return Err(err);
            }
        };

        let mut device = OpenOcdDevice {
            id: DeviceId::new("000000000000000000000000").map_err(|_| {
                TransportError::ControlProtocol("placeholder id construction failed".to_string())
            })?,
            platform_id: self.unique_platform_for(family),
            family,
            debug,
            daemon: Some(daemon),
            session: Some(Box::new(client)),
            last_reset: None,
            closed: false,
        };

        if debug.assert_srst_on_connect {
            if let Err(err) = device.reset_halt().await {
                device.close().await?;
                return Err(err);
            }
        }

        match device.read_device_id().await {
            Ok(id) => {
                device.id = id;
                Ok(device)
            }
            Err(err) => {
                device.close().await?;
                Err(err)
            }
        }
    }

    /// Probe the debug port with a generic Cortex-M target to identify the
    /// MCU family. Retries once with SRST asserted when the first pass sees
    /// nothing.
    async fn detect_family(
        &self,
        adapter: &AdapterInstance,
        gate: &RestartGate,
    ) -> Result<McuFamily, TransportError> {
        let mut transcript = String::new();

        for assert_srst in [false, true] {
            let mut daemon =
                OpenOcdDaemon::new(&self.binary, adapter.control_port(), Arc::clone(gate));
            daemon
                .start(&daemon_args(adapter, DaemonTarget::Generic, assert_srst))
                .await?;

            let mut client = match ControlClient::connect(
                "127.0.0.1",
                adapter.control_port(),
                ControlClientConfig::default(),
            )
            .await
            {
                Ok(client) => client,
                Err(err) => {
                    daemon.stop(None).await?;
                    return Err(err);
                }
            };

            for port_index in 0..4 {
                match client
                    .exec_with_timeout(&format!("dap info {port_index}"), DEFAULT_COMMAND_TIMEOUT)
                    .await
                {
                    Ok(response) => {
                        let done = response.to_lowercase().contains("no ap");
                        transcript.push_str(&response);
                        transcript.push('\n');
                        if done {
                            break;
                        }
                    }
                    Err(err) => {
                        transcript.push_str(&format!("dap info {port_index}: {err}\n"));
                        break;
                    }
                }
            }

            daemon.stop(Some(&mut client)).await?;

            if let Some(family) = match_family(&transcript, adapter.kind.supported) {
                return Ok(family);
            }
            if !assert_srst {
                debug!(adapter = %adapter.locator(), "No target seen; retrying with SRST asserted");
            }
        }

        Err(TransportError::UnknownTargetPlatform { transcript })
    }

    /// Debug configuration shared by all platforms of a family.
    fn family_debug_config(&self, family: McuFamily) -> Option<DebugTargetConfig> {
        self.catalog
            .iter()
            .find(|platform| platform.mcu == family && platform.debug.is_some())
            .and_then(|platform| platform.debug)
    }

    fn unique_platform_for(&self, family: McuFamily) -> Option<u16> {
        let mut matching = self.catalog.iter().filter(|p| p.mcu == family);
        let first = matching.next()?;
        if matching.next().is_none() {
            Some(first.id)
        } else {
            None
        }
    }
}

#[async_trait]
impl DeviceDiscovery for OpenOcdTransport {
    async fn list(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(self
            .adapters()
            .await?
            .iter()
            .map(|adapter| DeviceHandle {
                id: None,
                platform_id: None,
                address: adapter.locator(),
            })
            .collect())
    }

    async fn open(&self, handle: &DeviceHandle) -> Result<Box<dyn FlashDevice>, TransportError> {
        let adapters = self.adapters().await?;
        let adapter = adapters
            .iter()
            .find(|adapter| adapter.locator() == handle.address)
            .ok_or_else(|| TransportError::DeviceNotFound(handle.address.clone()))?;
        Ok(Box::new(self.open_adapter(adapter).await?))
    }

    async fn open_by_id(
        &self,
        id: &DeviceId,
        timeout: Duration,
    ) -> Result<Box<dyn FlashDevice>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for adapter in self.adapters().await? {
                let mut device = match self.open_adapter(&adapter).await {
                    Ok(device) => device,
                    Err(err) => {
                        warn!(adapter = %adapter.locator(), %err, "Skipping adapter");
                        continue;
                    }
                };
                if device.id() == id {
                    return Ok(Box::new(device));
                }
                device.close().await?;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::DeviceNotFound(id.to_string()));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

enum DaemonTarget<'a> {
    /// Generic Cortex-M target for MCU detection
    Generic,
    /// Real target configuration file
    Real(&'a str),
}

fn daemon_args(adapter: &AdapterInstance, target: DaemonTarget<'_>, assert_srst: bool) -> Vec<String> {
    let kind = adapter.kind;
    let mut args = vec!["-f".to_string(), kind.interface_config.to_string()];
    if let Some(serial_command) = kind.serial_command {
        args.push("-c".to_string());
        args.push(format!("{serial_command} {}", adapter.serial));
    }
    if let Some(extra) = kind.extra_init {
        args.push("-c".to_string());
        args.push(extra.to_string());
    }
    args.push("-c".to_string());
    args.push(format!("transport select {}", kind.transport));
    if assert_srst {
        args.push("-c".to_string());
        args.push("reset_config connect_assert_srst srst_only srst_nogate".to_string());
    }
    args.push("-c".to_string());
    args.push(format!(
        "gdb_port disabled; tcl_port disabled; telnet_port {}",
        adapter.control_port()
    ));
    match target {
        DaemonTarget::Generic => {
            args.push("-c".to_string());
            args.push(
                "swd newdap probe cpu -enable; dap create probe.dap -chain-position probe.cpu; \
                 target create probe.cpu cortex_m -dap probe.dap"
                    .to_string(),
            );
        }
        DaemonTarget::Real(config) => {
            args.push("-f".to_string());
            args.push(config.to_string());
        }
    }
    args.push("-c".to_string());
    args.push("init".to_string());
    args
}

/// Match a probe transcript against the families an adapter supports.
fn match_family(transcript: &str, supported: &[McuFamily]) -> Option<McuFamily> {
    let transcript = transcript.to_lowercase();
    supported.iter().copied().find(|family| {
        mcu_target(*family)
            .map(|target| transcript.contains(&target.probe_pattern.to_lowercase()))
            .unwrap_or(false)
    })
}

/// Flash write command for a platform's write style.
fn write_command(style: FlashStyle, file: &Path, address: u32) -> String {
    let address = format_hex_address(address);
    match style {
        FlashStyle::Program => format!("program {} {address}", file.display()),
        FlashStyle::WriteImageUnlock => {
            format!("flash write_image erase unlock {} {address}", file.display())
        }
        FlashStyle::Procedure(procedure) => {
            format!("{procedure} {} {address}", file.display())
        }
    }
}

/// Whether a flash write response indicates success for the write style.
fn write_succeeded(style: FlashStyle, response: &str) -> bool {
    let lower = response.to_lowercase();
    match style {
        FlashStyle::WriteImageUnlock => Regex::new(r"(?i)wrote \d+ bytes from file")
            .map(|re| re.is_match(response))
            .unwrap_or(false),
        FlashStyle::Program | FlashStyle::Procedure(_) => {
            lower.contains("** programming finished **")
        }
    }
}

/// Whether a reset/halt response reports a halted target.
fn target_halted(response: &str) -> bool {
    Regex::new(r"(?i)target halted due to")
        .map(|re| re.is_match(response))
        .unwrap_or(false)
}

/// Parse an `mdb` memory dump into lowercase hex.
fn parse_memory_dump(
    response: &str,
    address: u32,
    length: usize,
) -> Result<String, TransportError> {
    let pattern = format!(
        r"(?im)^0x{address:08x}:((?:\s+[0-9a-f]{{2}}){{{length}}})\s*$"
    );
    let re = Regex::new(&pattern)
        .map_err(|e| TransportError::ControlProtocol(format!("bad dump pattern: {e}")))?;
    let captures = re.captures(response).ok_or_else(|| {
        TransportError::ControlProtocol(format!("unparseable memory dump: {response}"))
    })?;
    Ok(captures[1]
        .split_whitespace()
        .collect::<String>()
        .to_lowercase())
}

/// Concatenate the capture groups of a platform-specific id pattern.
fn parse_procedure_id(response: &str, pattern: &str) -> Result<String, TransportError> {
    let re = Regex::new(pattern)
        .map_err(|e| TransportError::ControlProtocol(format!("bad id pattern: {e}")))?;
    let captures = re.captures(response).ok_or_else(|| {
        TransportError::ControlProtocol(format!("unparseable device id output: {response}"))
    })?;
    let mut id = String::new();
    for group in captures.iter().skip(1).flatten() {
        id.push_str(group.as_str());
    }
    Ok(id.to_lowercase())
}

/// One target opened through a debug adapter.
pub struct OpenOcdDevice {
    id: DeviceId,
    platform_id: Option<u16>,
    family: McuFamily,
    debug: DebugTargetConfig,
    daemon: Option<OpenOcdDaemon>,
    session: Option<Box<dyn ControlSession>>,
    last_reset: Option<Instant>,
    closed: bool,
}

impl OpenOcdDevice {
    fn session(&mut self) -> Result<&mut Box<dyn ControlSession>, TransportError> {
        self.session.as_mut().ok_or(TransportError::DeviceNotOpen)
    }

    async fn reset_halt(&mut self) -> Result<(), TransportError> {
        let family = self.family;
        let session = self.session()?;
        let response = session.exec("reset init", DEFAULT_COMMAND_TIMEOUT).await?;
        if target_halted(&response) {
            return Ok(());
        }
        warn!(%family, "reset init did not halt the target; trying soft_reset_halt");
        let response = session.exec("soft_reset_halt", DEFAULT_COMMAND_TIMEOUT).await?;
        if !target_halted(&response) {
            warn!(%family, response = %response, "Target halt unconfirmed");
        }
        Ok(())
    }

    async fn read_device_id(&mut self) -> Result<DeviceId, TransportError> {
        let procedure = self.debug.device_id;
        let session = self.session()?;
        let raw = match procedure {
            DeviceIdReadProcedure::MemoryDump {
                address,
                length,
                prefix,
            } => {
                let command = format!("mdb {} {length}", format_hex_address(address));
                let response = session.exec(&command, DEFAULT_COMMAND_TIMEOUT).await?;
                let bytes = parse_memory_dump(&response, address, length)?;
                format!("{}{bytes}", prefix.unwrap_or(""))
            }
            DeviceIdReadProcedure::Procedure { command, pattern } => {
                let response = session.exec(command, DEFAULT_COMMAND_TIMEOUT).await?;
                parse_procedure_id(&response, pattern)?
            }
        };
        DeviceId::new(&raw).map_err(|_| {
            TransportError::ControlProtocol(format!("device reported invalid id '{raw}'"))
        })
    }

    async fn throttled_reset_gap(&self) {
        if let Some(last_reset) = self.last_reset {
            let elapsed = last_reset.elapsed();
            if elapsed < MIN_RESET_INTERVAL {
                tokio::time::sleep(MIN_RESET_INTERVAL - elapsed).await;
            }
        }
    }
}

#[async_trait]
impl FlashDevice for OpenOcdDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn platform_id(&self) -> Option<u16> {
        self.platform_id
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed && self.daemon.is_none() {
            return Ok(());
        }
        self.closed = true;

        // Leave the target running when we had it under SRST.
        if self.debug.assert_srst_on_connect {
            let idle = self.session.as_ref().map(|s| s.is_idle()).unwrap_or(false);
            if idle {
                let run = self.debug.run_procedure.unwrap_or("reset run");
                if let Some(session) = self.session.as_mut() {
                    let _ = session.exec(run, DEFAULT_COMMAND_TIMEOUT).await;
                }
            }
        }

        let mut session = self.session.take();
        if let Some(session) = session.as_mut() {
            if session.is_idle() {
                let _ = session.send_line("shutdown").await;
            }
            session.disconnect().await;
        }
        // The daemon either honored the shutdown already or gets killed;
        // stop() waits for the exit either way.
        if let Some(mut daemon) = self.daemon.take() {
            daemon.stop(None).await?;
            debug_assert_eq!(daemon.state(), DaemonState::Stopped);
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.throttled_reset_gap().await;
        let run = self.debug.run_procedure.unwrap_or("reset run");
        info!(device = %self.id, command = run, "Resetting target");
        self.session()?.exec(run, DEFAULT_COMMAND_TIMEOUT).await?;
        self.last_reset = Some(Instant::now());
        Ok(())
    }

    async fn prepare_to_flash(&mut self) -> Result<(), TransportError> {
        self.reset_halt().await
    }

    fn can_flash_module(&self, module: &Module) -> bool {
        module.storage == Storage::InternalFlash
    }

    fn can_write_to_flash(&self, storage: Storage) -> bool {
        storage == Storage::InternalFlash
    }

    async fn write_to_flash(
        &mut self,
        file: &Path,
        storage: Storage,
        address: u32,
    ) -> Result<(), TransportError> {
        if storage != Storage::InternalFlash {
            return Err(TransportError::UnsupportedStorage(storage));
        }
        let style = self.debug.flash_style;
        let command = write_command(style, file, address);
        info!(device = %self.id, %command, "Writing flash via debug adapter");
        let output = self.session()?.exec(&command, DEBUG_WRITE_TIMEOUT).await?;
        if !write_succeeded(style, &output) {
            return Err(TransportError::ControlProtocol(format!(
                "flash write failed: {output}"
            )));
        }
        Ok(())
    }

    async fn flash_module(&mut self, module: &Module) -> Result<FlashOutcome, TransportError> {
        self.write_to_flash(&module.file_path, module.storage, module.address)
            .await?;
        Ok(FlashOutcome {
            reset_pending: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSession {
        script: VecDeque<(String, Result<String, ()>)>,
        idle: bool,
    }

    impl ScriptedSession {
        fn new(script: Vec<(&str, &str)>) -> Self {
            Self {
                script: script
                    .into_iter()
                    .map(|(cmd, resp)| (cmd.to_string(), Ok(resp.to_string())))
                    .collect(),
                idle: true,
            }
        }
    }

    #[async_trait]
    impl ControlSession for ScriptedSession {
        async fn exec(
            &mut self,
            command: &str,
            _timeout: Duration,
        ) -> Result<String, TransportError> {
            match self.script.pop_front() {
                Some((expected, result)) => {
                    assert_eq!(command, expected, "unexpected command order");
                    result.map_err(|_| TransportError::Disconnected)
                }
                None => panic!("unexpected command: {command}"),
            }
        }

        async fn send_line(&mut self, _line: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn disconnect(&mut self) {}

        fn is_idle(&self) -> bool {
            self.idle
        }
    }

    fn nrf_debug() -> DebugTargetConfig {
        DebugTargetConfig {
            target_config: "target/nrf52.cfg",
            flash_style: FlashStyle::Program,
            assert_srst_on_connect: false,
            device_id: DeviceIdReadProcedure::MemoryDump {
                address: 0x1000_0060,
                length: 8,
                prefix: Some("e00fce68"),
            },
            run_procedure: None,
        }
    }

    fn device_with(session: ScriptedSession, debug: DebugTargetConfig) -> OpenOcdDevice {
        OpenOcdDevice {
            id: DeviceId::new("e00fce68d23c1a2b3c4d5e6f").expect("id"),
            platform_id: None,
            family: McuFamily::Nrf52840,
            debug,
            daemon: None,
            session: Some(Box::new(session)),
            last_reset: None,
            closed: false,
        }
    }

    #[test]
    fn family_matching_is_case_insensitive_and_scoped() {
        let transcript = "AP ID register 0x2ba01477\nDesigner is 0x244, NORDIC Semiconductor";
        assert_eq!(
            match_family(transcript, &[McuFamily::Nrf52840, McuFamily::Stm32f2xx]),
            Some(McuFamily::Nrf52840)
        );
        // The same transcript does not match when the adapter cannot drive
        // that family.
        assert_eq!(match_family(transcript, &[McuFamily::Stm32f2xx]), None);
    }

    #[test]
    fn memory_dump_parsing_extracts_bytes() {
        let response = "0x10000060: de ad be ef 01 02 03 04";
        let hex = parse_memory_dump(response, 0x1000_0060, 8).expect("parse");
        assert_eq!(hex, "deadbeef01020304");
    }

    #[test]
    fn memory_dump_rejects_wrong_shape() {
        let response = "0x10000060: de ad";
        assert!(parse_memory_dump(response, 0x1000_0060, 8).is_err());
        assert!(parse_memory_dump("nonsense", 0x1000_0060, 8).is_err());
    }

    #[test]
    fn procedure_id_concatenates_captures() {
        let id = parse_procedure_id(
            "Device ID: E00FCE68 D23C1A2B3C4D5E6F",
            r"(?i)device id:\s*([0-9a-f]{8})\s*([0-9a-f]{16})",
        )
        .expect("parse");
        assert_eq!(id, "e00fce68d23c1a2b3c4d5e6f");
    }

    #[test]
    fn write_commands_follow_the_flash_style() {
        let file = Path::new("/tmp/fw.bin");
        assert_eq!(
            write_command(FlashStyle::Program, file, 0x3_0000),
            "program /tmp/fw.bin 0x00030000"
        );
        assert_eq!(
            write_command(FlashStyle::WriteImageUnlock, file, 0x8020000),
            "flash write_image erase unlock /tmp/fw.bin 0x08020000"
        );
        assert_eq!(
            write_command(FlashStyle::Procedure("rtl872x_flash_write_bin"), file, 0x10),
            "rtl872x_flash_write_bin /tmp/fw.bin 0x00000010"
        );
    }

    #[test]
    fn success_matching_per_style() {
        assert!(write_succeeded(
            FlashStyle::WriteImageUnlock,
            "wrote 262144 bytes from file fw.bin in 3.2s"
        ));
        assert!(!write_succeeded(FlashStyle::WriteImageUnlock, "couldn't open fw.bin"));
        assert!(write_succeeded(
            FlashStyle::Program,
            "** Programming Finished **\n** Verified OK **"
        ));
        assert!(write_succeeded(
            FlashStyle::Procedure("p"),
            "** programming finished **"
        ));
        assert!(!write_succeeded(FlashStyle::Program, "** Programming Failed **"));
    }

    #[tokio::test]
    async fn write_to_flash_happy_path() {
        let session = ScriptedSession::new(vec![(
            "program /tmp/fw.bin 0x00030000",
            "** Programming Finished **",
        )]);
        let mut device = device_with(session, nrf_debug());
        device
            .write_to_flash(Path::new("/tmp/fw.bin"), Storage::InternalFlash, 0x3_0000)
            .await
            .expect("write");
    }

    #[tokio::test]
    async fn write_to_flash_rejects_external_storage() {
        let session = ScriptedSession::new(vec![]);
        let mut device = device_with(session, nrf_debug());
        let err = device
            .write_to_flash(Path::new("/tmp/fw.bin"), Storage::ExternalFlash, 0)
            .await
            .expect_err("external flash is not writable via the adapter");
        assert!(matches!(err, TransportError::UnsupportedStorage(_)));
    }

    #[tokio::test]
    async fn failed_write_response_is_an_error() {
        let session = ScriptedSession::new(vec![(
            "program /tmp/fw.bin 0x00030000",
            "** Programming Failed **",
        )]);
        let mut device = device_with(session, nrf_debug());
        let err = device
            .write_to_flash(Path::new("/tmp/fw.bin"), Storage::InternalFlash, 0x3_0000)
            .await
            .expect_err("failure response");
        assert!(matches!(err, TransportError::ControlProtocol(_)));
    }

    #[tokio::test]
    async fn prepare_falls_back_to_soft_reset_halt() {
        let session = ScriptedSession::new(vec![
            ("reset init", "error: timed out while waiting for target"),
            ("soft_reset_halt", "target halted due to debug-request"),
        ]);
        let mut device = device_with(session, nrf_debug());
        device.prepare_to_flash().await.expect("prepare");
    }

    #[tokio::test]
    async fn read_device_id_applies_family_prefix() {
        let session = ScriptedSession::new(vec![(
            "mdb 0x10000060 8",
            "0x10000060: d2 3c 1a 2b 3c 4d 5e 6f",
        )]);
        let mut device = device_with(session, nrf_debug());
        let id = device.read_device_id().await.expect("device id");
        assert_eq!(id.as_str(), "e00fce68d23c1a2b3c4d5e6f");
    }

    #[tokio::test]
    async fn reset_uses_the_platform_run_procedure() {
        let mut debug = nrf_debug();
        debug.run_procedure = Some("rtl872x_run");
        let session = ScriptedSession::new(vec![("rtl872x_run", "")]);
        let mut device = device_with(session, debug);
        device.reset().await.expect("reset");
        assert!(device.last_reset.is_some());
    }
}
