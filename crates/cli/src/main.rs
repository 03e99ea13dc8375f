//! devflash - flash Device OS releases onto development boards
//!
//! The binary wires the pieces together: resolve a release (or local path)
//! into modules, enumerate and select target devices, then dispatch parallel
//! flash jobs over the chosen primary transport.

#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devflash_core::{Module, ModuleType, PlatformCatalog};
use devflash_fleet::{
    load_profile_credentials, CloudRegistryClient, DeviceRegistry, FleetConfig, FleetCoordinator,
    TargetSpec,
};
use devflash_release::{
    GithubReleaseClient, ReleaseError, ResolveOptions, Resolver, ResolverConfig,
};
use devflash_transport::dfu::DfuTransport;
use devflash_transport::openocd::OpenOcdTransport;
use devflash_transport::update_request::UpdateRequestTransport;
use devflash_transport::usb::{RusbBus, UsbBus};
use devflash_transport::DeviceDiscovery;

const FIRMWARE_REPO: &str = "particle-iot/device-os";

#[derive(Parser)]
#[command(name = "devflash")]
#[command(version)]
#[command(about = "Flash Device OS releases onto development boards")]
#[command(long_about = "\
Flashes a Device OS release (or a local directory/zip of firmware binaries)
onto one or more development boards, in parallel, over whichever transport is
available: USB update requests, dfu-util, or a debug adapter via OpenOCD.")]
struct Cli {
    /// Release version (optional leading 'v') or a path to firmware binaries
    #[arg(value_name = "VERSION|PATH")]
    firmware: String,

    /// Target device id or name, optionally suffixed with `:<platform>`
    #[arg(short = 'd', long = "device", value_name = "DEVICE[:PLATFORM]")]
    devices: Vec<String>,

    /// Flash every attached device
    #[arg(long, conflicts_with = "devices")]
    all_devices: bool,

    /// Use a debug adapter (OpenOCD) as the primary transport
    #[arg(long)]
    openocd: bool,

    /// Flash system parts (default)
    #[arg(long, overrides_with = "no_system")]
    system: bool,
    /// Skip system parts
    #[arg(long, overrides_with = "system")]
    no_system: bool,

    /// Flash the user part (default)
    #[arg(long, overrides_with = "no_user")]
    user: bool,
    /// Skip the user part
    #[arg(long, overrides_with = "user")]
    no_user: bool,

    /// Flash the bootloader (default)
    #[arg(long, overrides_with = "no_bootloader")]
    bootloader: bool,
    /// Skip the bootloader
    #[arg(long, overrides_with = "bootloader")]
    no_bootloader: bool,

    /// Flash NCP firmware (default)
    #[arg(long, overrides_with = "no_ncp")]
    ncp: bool,
    /// Skip NCP firmware
    #[arg(long, overrides_with = "ncp")]
    no_ncp: bool,

    /// Flash the radio stack (default)
    #[arg(long, overrides_with = "no_radio")]
    radio: bool,
    /// Skip the radio stack
    #[arg(long, overrides_with = "radio")]
    no_radio: bool,

    /// Resolve the version against draft releases (requires GITHUB_TOKEN)
    #[arg(long)]
    draft: bool,

    /// Ignore the local module cache
    #[arg(long)]
    no_cache: bool,

    /// Per-device retry budget
    #[arg(short = 'r', long, default_value_t = 2)]
    retries: u32,

    /// Maximum parallel device jobs (default: unbounded)
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Release-host token, needed for drafts
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Device-registry token; falls back to the saved CLI profile
    #[arg(long, env = "PARTICLE_TOKEN", hide_env_values = true)]
    particle_token: Option<String>,
}

impl Cli {
    fn module_class_enabled(&self, module_type: ModuleType) -> bool {
        match module_type {
            ModuleType::SystemPart => !self.no_system,
            ModuleType::UserPart => !self.no_user,
            ModuleType::Bootloader => !self.no_bootloader,
            ModuleType::NcpFirmware => !self.no_ncp,
            ModuleType::RadioStack => !self.no_radio,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("devflash={log_level},devflash_core={log_level},devflash_release={log_level},devflash_transport={log_level},devflash_fleet={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let temp_root = std::env::temp_dir().join(format!("devflash-{}", std::process::id()));

    let result = tokio::select! {
        result = run(&cli, &temp_root) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cleaning up");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    // Subprocesses die with their kill-on-drop handles; scratch space goes
    // here, on every exit path.
    let _ = std::fs::remove_dir_all(&temp_root);

    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, temp_root: &Path) -> Result<()> {
    let catalog = Arc::new(PlatformCatalog::new());

    if cli.draft && cli.github_token.is_none() {
        bail!("draft releases require authentication; set GITHUB_TOKEN");
    }
    if !cli.all_devices && cli.devices.is_empty() {
        bail!("no targets; pass --device <id-or-name> or --all-devices");
    }

    let modules = resolve_modules(cli, Arc::clone(&catalog), temp_root).await?;
    let modules: Vec<Module> = modules
        .into_iter()
        .filter(|m| cli.module_class_enabled(m.module_type))
        .collect();
    if modules.is_empty() {
        bail!("every module was filtered out; nothing to flash");
    }
    info!(count = modules.len(), "Modules ready");

    let bus: Arc<dyn UsbBus> = Arc::new(RusbBus::new());
    let update_request: Arc<dyn DeviceDiscovery> =
        Arc::new(UpdateRequestTransport::new(Arc::clone(&bus)));
    let primary: Arc<dyn DeviceDiscovery> = if cli.openocd {
        Arc::new(OpenOcdTransport::new(Arc::clone(&bus), Arc::clone(&catalog)))
    } else {
        Arc::new(DfuTransport::new(Arc::clone(&bus), Arc::clone(&catalog)))
    };

    let mut coordinator = FleetCoordinator::new(
        Arc::clone(&catalog),
        primary,
        Arc::clone(&update_request),
    );
    if let Some(registry) = build_registry(cli)? {
        coordinator = coordinator.with_registry(registry);
    }

    let fleet_config = FleetConfig {
        max_retries: cli.retries,
        max_jobs: cli.jobs,
        temp_dir: temp_root.join("devices"),
    };

    let local = coordinator.enumerate_devices(&fleet_config).await?;
    info!(devices = local.len(), "Devices enumerated");

    let requested = parse_target_specs(&cli.devices)?;
    let targets = coordinator.resolve_targets(&local, &requested).await?;

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .context("progress template")?,
    );
    progress.set_message(format!("Flashing {} device(s)...", targets.len()));
    progress.enable_steady_tick(Duration::from_millis(120));

    let result = coordinator.dispatch(&targets, &modules, &fleet_config).await;
    match &result {
        Ok(()) => progress.finish_with_message(format!("Flashed {} device(s)", targets.len())),
        Err(_) => progress.finish_with_message("Flashing failed"),
    }
    result?;
    Ok(())
}

async fn resolve_modules(
    cli: &Cli,
    catalog: Arc<PlatformCatalog>,
    temp_root: &Path,
) -> Result<Vec<Module>> {
    let home = dirs::home_dir().context("cannot determine the home directory")?;
    let cache_dir = home.join(".particle").join("devflash").join("binaries");

    let host = GithubReleaseClient::new(FIRMWARE_REPO)
        .context("release host client")?
        .with_token(cli.github_token.clone());

    let mut config = ResolverConfig::new(cache_dir, temp_root.to_path_buf());
    if let Some(assets_dir) = bundled_assets_dir() {
        config = config.with_assets_dir(assets_dir);
    }
    let resolver = Resolver::new(catalog, host, config);

    let input = Path::new(&cli.firmware);
    let modules = if input.exists() {
        resolver.get_modules_from_path(input).await
    } else {
        resolver
            .get_release_modules(
                &cli.firmware,
                &ResolveOptions {
                    no_cache: cli.no_cache,
                    draft: cli.draft,
                },
            )
            .await
    };

    match modules {
        Ok(modules) => Ok(modules),
        Err(ReleaseError::InvalidVersion { version, .. }) => bail!(
            "'{version}' is neither an existing path nor a release version"
        ),
        Err(err) => Err(err.into()),
    }
}

/// The asset directory shipped next to the executable, when present.
fn bundled_assets_dir() -> Option<PathBuf> {
    let exe_relative = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("assets").join("binaries")));
    if let Some(dir) = exe_relative {
        if dir.is_dir() {
            return Some(dir);
        }
    }
    let cwd_relative = PathBuf::from("assets").join("binaries");
    cwd_relative.is_dir().then_some(cwd_relative)
}

fn build_registry(cli: &Cli) -> Result<Option<Arc<dyn DeviceRegistry>>> {
    let (token, api_url) = match &cli.particle_token {
        Some(token) => (Some(token.clone()), None),
        None => match dirs::home_dir().and_then(|home| load_profile_credentials(&home)) {
            Some(credentials) => (Some(credentials.access_token), credentials.api_url),
            None => (None, None),
        },
    };
    let Some(token) = token else {
        return Ok(None);
    };

    let mut client = CloudRegistryClient::new(token).context("registry client")?;
    if let Some(api_url) = api_url {
        client = client.with_base_url(api_url);
    }
    Ok(Some(Arc::new(client)))
}

fn parse_target_specs(devices: &[String]) -> Result<Vec<TargetSpec>> {
    devices
        .iter()
        .map(|raw| {
            let (id_or_name, platform_hint) = match raw.rsplit_once(':') {
                Some((device, platform)) if !platform.is_empty() => {
                    (device.to_string(), Some(platform.to_string()))
                }
                _ => (raw.clone(), None),
            };
            if id_or_name.is_empty() {
                bail!("empty device selector '{raw}'");
            }
            Ok(TargetSpec {
                id_or_name,
                platform_hint,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_specs_split_platform_hints() {
        let specs =
            parse_target_specs(&["lab-boron:boron".to_string(), "bench-p2".to_string()])
                .expect("specs");
        assert_eq!(specs[0].id_or_name, "lab-boron");
        assert_eq!(specs[0].platform_hint.as_deref(), Some("boron"));
        assert_eq!(specs[1].id_or_name, "bench-p2");
        assert_eq!(specs[1].platform_hint, None);
    }

    #[test]
    fn empty_selectors_are_rejected() {
        assert!(parse_target_specs(&[":boron".to_string()]).is_err());
    }

    #[test]
    fn module_toggles_default_to_enabled() {
        let cli = Cli::parse_from(["devflash", "2.1.0", "--all-devices"]);
        for module_type in [
            ModuleType::SystemPart,
            ModuleType::UserPart,
            ModuleType::Bootloader,
            ModuleType::NcpFirmware,
            ModuleType::RadioStack,
        ] {
            assert!(cli.module_class_enabled(module_type));
        }
    }

    #[test]
    fn no_flags_disable_their_class() {
        let cli = Cli::parse_from([
            "devflash",
            "2.1.0",
            "--all-devices",
            "--no-bootloader",
            "--no-radio",
        ]);
        assert!(!cli.module_class_enabled(ModuleType::Bootloader));
        assert!(!cli.module_class_enabled(ModuleType::RadioStack));
        assert!(cli.module_class_enabled(ModuleType::SystemPart));
    }

    #[test]
    fn explicit_enable_overrides_an_earlier_disable() {
        let cli = Cli::parse_from([
            "devflash",
            "2.1.0",
            "--all-devices",
            "--no-user",
            "--user",
        ]);
        assert!(cli.module_class_enabled(ModuleType::UserPart));
    }

    #[test]
    fn retries_default_to_two() {
        let cli = Cli::parse_from(["devflash", "2.1.0", "--all-devices"]);
        assert_eq!(cli.retries, 2);
        assert_eq!(cli.jobs, None);
    }
}
