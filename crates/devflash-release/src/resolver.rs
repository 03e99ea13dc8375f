//! Release resolution
//!
//! Turns a requested version (or a local path) into the canonical set of
//! firmware modules to flash. The full pipeline for a version is:
//!
//! 1. Fast path: a warm cache directory short-circuits everything.
//! 2. Locate the release: `v<version>` tag, then `<version>`, then (for
//!    drafts) a walk of the full release listing.
//! 3. Download the `.bin` assets (or `.zip` fallback) with bounded
//!    concurrency and unpack archives.
//! 4. Canonicalize: group by `(platform, type, index)` with deterministic
//!    tie-breaks.
//! 5. Backfill missing modules from bundled assets and older releases.
//! 6. Commit the final set into the cache (never for drafts).

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use semver::Version;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use devflash_core::{module, Module, ModuleKey, ModuleParseError, ModuleType, PlatformCatalog};

use crate::cache::{scan_modules, CacheLayout};
use crate::error::ReleaseError;
use crate::github::{Release, ReleaseAsset, ReleaseHost};
use crate::unpack;

/// Maximum parallel asset downloads.
pub const DOWNLOAD_CONCURRENCY: usize = 6;

/// How many older releases the backfill will probe at most.
pub const MAX_BACKFILL_RELEASES: usize = 20;

/// Directories the resolver works with.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Root of the persistent module cache
    pub cache_dir: PathBuf,
    /// Scratch space for downloads and unpacking, cleaned by the caller
    pub temp_dir: PathBuf,
    /// Bundled `assets/binaries` directory used for backfill
    pub assets_dir: Option<PathBuf>,
}

impl ResolverConfig {
    /// Config with the given cache and temp directories.
    pub fn new(cache_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            temp_dir: temp_dir.into(),
            assets_dir: None,
        }
    }

    /// Use a bundled asset directory for backfill.
    pub fn with_assets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.assets_dir = Some(dir.into());
        self
    }
}

/// Per-request resolution options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Skip the cache fast path and re-fetch
    pub no_cache: bool,
    /// Allow the version to resolve to a draft release
    pub draft: bool,
}

/// Resolves release versions and local paths into module sets.
pub struct Resolver<H> {
    catalog: Arc<PlatformCatalog>,
    host: H,
    config: ResolverConfig,
    cache: CacheLayout,
}

impl<H: ReleaseHost> Resolver<H> {
    /// Create a resolver over a release host.
    pub fn new(catalog: Arc<PlatformCatalog>, host: H, config: ResolverConfig) -> Self {
        let cache = CacheLayout::new(&config.cache_dir);
        Self {
            catalog,
            host,
            config,
            cache,
        }
    }

    /// Resolve a release version into its module set.
    pub async fn get_release_modules(
        &self,
        version: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<Module>, ReleaseError> {
        let version_str = version.strip_prefix('v').unwrap_or(version);
        let semver =
            Version::parse(version_str).map_err(|source| ReleaseError::InvalidVersion {
                version: version.to_string(),
                source,
            })?;

        if options.draft && !self.host.is_authenticated() {
            return Err(ReleaseError::AuthenticationRequired(
                "draft releases require a release-host token".to_string(),
            ));
        }

        if !options.no_cache {
            let release_dir = self.cache.release_dir(version_str);
            if release_dir.is_dir() {
                let modules = scan_modules(&self.catalog, &release_dir)?;
                if !modules.is_empty() {
                    info!(
                        version = version_str,
                        count = modules.len(),
                        "Using cached release"
                    );
                    return Ok(sort_for_flashing(dedupe(modules)));
                }
            }
        }

        let release = self.locate_release(version_str, &semver, options.draft).await?;
        let assets = select_assets(&release)?;

        let download_dir = self.downloads_dir(version_str);
        self.download_assets(&assets, &download_dir).await?;
        self.unpack_zip_assets(&download_dir).await?;

        let mut set = group_modules(scan_modules(&self.catalog, &download_dir)?);
        if set.is_empty() {
            return Err(ReleaseError::NoBinariesInRelease(release.tag_name.clone()));
        }

        self.backfill(&mut set, &semver).await?;

        let modules = if release.draft {
            info!(version = version_str, "Draft release; not persisting to cache");
            set.into_values().collect()
        } else {
            let modules = self.commit(set, version_str).await?;
            // Downloads have been moved or consumed; drop the scratch tree.
            let _ = tokio::fs::remove_dir_all(self.config.temp_dir.join("downloads")).await;
            modules
        };

        Ok(sort_for_flashing(modules))
    }

    /// Parse modules from a local file, directory, or zip archive.
    pub async fn get_modules_from_path(&self, path: &Path) -> Result<Vec<Module>, ReleaseError> {
        let metadata = std::fs::metadata(path)?;

        let modules = if metadata.is_dir() {
            scan_modules(&self.catalog, path)?
        } else if path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false)
        {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".to_string());
            let out_dir = self.config.temp_dir.join("local").join(stem);
            unpack::extract_zip(path, &out_dir).await?;
            scan_modules(&self.catalog, &out_dir)?
        } else {
            match module::parse_module_file(&self.catalog, path) {
                Ok(module) => vec![module],
                Err(ModuleParseError::Io { source, .. }) => return Err(ReleaseError::Io(source)),
                Err(err) => {
                    return Err(ReleaseError::NoBinariesInRelease(format!(
                        "{}: {err}",
                        path.display()
                    )))
                }
            }
        };

        if modules.is_empty() {
            return Err(ReleaseError::NoBinariesInRelease(
                path.display().to_string(),
            ));
        }
        Ok(sort_for_flashing(dedupe(modules)))
    }

    fn downloads_dir(&self, version: &str) -> PathBuf {
        self.config.temp_dir.join("downloads").join(version)
    }

    async fn locate_release(
        &self,
        version_str: &str,
        semver: &Version,
        draft: bool,
    ) -> Result<Release, ReleaseError> {
        if let Some(release) = self.host.release_by_tag(&format!("v{version_str}")).await? {
            return Ok(release);
        }
        if let Some(release) = self.host.release_by_tag(version_str).await? {
            return Ok(release);
        }
        if draft {
            debug!(version = version_str, "Tag lookups missed; scanning for a draft release");
            for release in self.host.list_all_releases().await? {
                if !release.draft {
                    continue;
                }
                if let Ok(tag_version) = Version::parse(release.version_str()) {
                    if tag_version == *semver {
                        return Ok(release);
                    }
                }
            }
        }
        Err(ReleaseError::ReleaseNotFound(version_str.to_string()))
    }

    async fn download_assets(
        &self,
        assets: &[ReleaseAsset],
        dir: &Path,
    ) -> Result<(), ReleaseError> {
        tokio::fs::create_dir_all(dir).await?;

        let semaphore = Arc::new(Semaphore::new(DOWNLOAD_CONCURRENCY));
        let mut downloads = FuturesUnordered::new();
        for asset in assets {
            let semaphore = Arc::clone(&semaphore);
            let dest = dir.join(&asset.name);
            downloads.push(async move {
                let _permit = semaphore.acquire().await.map_err(|e| {
                    ReleaseError::DownloadFailed {
                        asset: asset.name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                debug!(asset = %asset.name, "Downloading");
                self.host.download_asset(asset, &dest).await
            });
        }

        while let Some(result) = downloads.next().await {
            result?;
        }
        Ok(())
    }

    async fn unpack_zip_assets(&self, dir: &Path) -> Result<(), ReleaseError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_zip = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("zip"))
                .unwrap_or(false);
            if !is_zip {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".to_string());
            unpack::extract_zip(&path, &dir.join(stem)).await?;
        }
        Ok(())
    }

    async fn backfill(
        &self,
        set: &mut BTreeMap<ModuleKey, Module>,
        target_version: &Version,
    ) -> Result<(), ReleaseError> {
        let mut missing = self.missing_modules(set);
        if missing.is_empty() {
            return Ok(());
        }

        self.backfill_from_assets(set, &mut missing)?;

        // Radio stacks and NCP firmware ship rarely; absence is survivable.
        missing.retain(|(_, platform, module_type)| match module_type {
            ModuleType::RadioStack | ModuleType::NcpFirmware => {
                warn!(
                    platform = %platform,
                    module = %module_type,
                    "Module not present in release or bundled assets; devices keep their current one"
                );
                false
            }
            _ => true,
        });

        if !missing.is_empty() {
            self.backfill_from_prior_releases(set, &mut missing, target_version)
                .await?;
        }

        for (_, platform, module_type) in &missing {
            warn!(
                platform = %platform,
                module = %module_type,
                "No module found in release, bundled assets, or prior releases"
            );
        }
        Ok(())
    }

    /// Expected-but-absent `(platform_id, platform_name, type)` entries for
    /// every platform that appears in the resolved set.
    fn missing_modules(&self, set: &BTreeMap<ModuleKey, Module>) -> Vec<(u16, String, ModuleType)> {
        let present_platforms: BTreeSet<u16> = set.keys().map(|key| key.0).collect();
        let mut missing = Vec::new();
        for platform_id in present_platforms {
            let Ok(platform) = self.catalog.by_id(platform_id) else {
                continue;
            };
            let mut required = vec![ModuleType::Bootloader, ModuleType::UserPart];
            if platform.has_radio_stack {
                required.push(ModuleType::RadioStack);
            }
            if platform.has_ncp_firmware {
                required.push(ModuleType::NcpFirmware);
            }
            for module_type in required {
                let present = set
                    .keys()
                    .any(|key| key.0 == platform_id && key.1 == module_type);
                if !present {
                    missing.push((platform_id, platform.name.to_string(), module_type));
                }
            }
        }
        missing
    }

    fn backfill_from_assets(
        &self,
        set: &mut BTreeMap<ModuleKey, Module>,
        missing: &mut Vec<(u16, String, ModuleType)>,
    ) -> Result<(), ReleaseError> {
        let Some(assets_dir) = &self.config.assets_dir else {
            return Ok(());
        };
        if !assets_dir.is_dir() {
            return Ok(());
        }

        for mut module in scan_modules(&self.catalog, assets_dir)? {
            let Some(position) = missing.iter().position(|(platform_id, _, module_type)| {
                *platform_id == module.platform_id && *module_type == module.module_type
            }) else {
                continue;
            };
            info!(
                platform = %module.platform_name,
                module = %module.module_type,
                file = %module.file_name(),
                "Backfilling from bundled assets"
            );
            module.is_asset = true;
            set.insert(module.key(), module);
            missing.remove(position);
        }
        Ok(())
    }

    async fn backfill_from_prior_releases(
        &self,
        set: &mut BTreeMap<ModuleKey, Module>,
        missing: &mut Vec<(u16, String, ModuleType)>,
        target_version: &Version,
    ) -> Result<(), ReleaseError> {
        let mut prior: Vec<(Version, Release)> = self
            .host
            .list_all_releases()
            .await?
            .into_iter()
            .filter_map(|release| {
                Version::parse(release.version_str())
                    .ok()
                    .map(|version| (version, release))
            })
            .filter(|(version, _)| version < target_version)
            .collect();
        prior.sort_by(|a, b| b.0.cmp(&a.0));

        for (version, release) in prior.into_iter().take(MAX_BACKFILL_RELEASES) {
            if missing.is_empty() {
                break;
            }
            let assets = match select_assets(&release) {
                Ok(assets) => assets,
                Err(_) => continue,
            };
            let download_dir = self.downloads_dir(&version.to_string());
            if let Err(err) = self.download_assets(&assets, &download_dir).await {
                warn!(release = %version, %err, "Skipping backfill release");
                continue;
            }
            if let Err(err) = self.unpack_zip_assets(&download_dir).await {
                warn!(release = %version, %err, "Skipping backfill release");
                continue;
            }

            for module in scan_modules(&self.catalog, &download_dir)? {
                let Some(position) = missing.iter().position(|(platform_id, _, module_type)| {
                    *platform_id == module.platform_id && *module_type == module.module_type
                }) else {
                    continue;
                };
                let name = module.file_name().to_lowercase();
                let name_matches = match module.module_type {
                    ModuleType::Bootloader => name.contains("bootloader"),
                    ModuleType::UserPart => name.contains("tinker"),
                    _ => false,
                };
                if !name_matches {
                    continue;
                }
                info!(
                    release = %version,
                    platform = %module.platform_name,
                    module = %module.module_type,
                    file = %module.file_name(),
                    "Backfilling from older release"
                );
                set.insert(module.key(), module);
                missing.remove(position);
            }
        }
        Ok(())
    }

    /// Move the resolved set into the cache, replacing any stale content for
    /// this version. Asset-sourced files are copied; downloads are moved.
    /// Each file lands via a rename so readers never observe partial writes.
    async fn commit(
        &self,
        set: BTreeMap<ModuleKey, Module>,
        version: &str,
    ) -> Result<Vec<Module>, ReleaseError> {
        let release_dir = self.cache.release_dir(version);
        if release_dir.exists() {
            tokio::fs::remove_dir_all(&release_dir).await?;
        }

        let mut modules = Vec::with_capacity(set.len());
        for (_, mut module) in set {
            let platform_dir = self.cache.platform_dir(version, &module.platform_name);
            tokio::fs::create_dir_all(&platform_dir).await?;
            let dest = platform_dir.join(module.file_name());

            if module.is_asset {
                let staging = dest.with_extension("part");
                tokio::fs::copy(&module.file_path, &staging).await?;
                tokio::fs::rename(&staging, &dest).await?;
            } else if tokio::fs::rename(&module.file_path, &dest).await.is_err() {
                // Rename fails across filesystems; fall back to copy+unlink.
                let staging = dest.with_extension("part");
                tokio::fs::copy(&module.file_path, &staging).await?;
                tokio::fs::rename(&staging, &dest).await?;
                let _ = tokio::fs::remove_file(&module.file_path).await;
            }

            module.file_path = dest;
            modules.push(module);
        }

        info!(version, count = modules.len(), "Cached release");
        Ok(modules)
    }
}

/// Pick assets worth downloading: `.bin` preferred, `.zip` as a known
/// incomplete fallback.
fn select_assets(release: &Release) -> Result<Vec<ReleaseAsset>, ReleaseError> {
    let with_extension = |ext: &str| -> Vec<ReleaseAsset> {
        release
            .assets
            .iter()
            .filter(|asset| {
                Path::new(&asset.name)
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case(ext))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    };

    let bins = with_extension("bin");
    if !bins.is_empty() {
        return Ok(bins);
    }
    let zips = with_extension("zip");
    if !zips.is_empty() {
        warn!(
            release = %release.tag_name,
            "Release has no .bin assets; falling back to archives (module set may be incomplete)"
        );
        return Ok(zips);
    }
    Err(ReleaseError::NoBinariesInRelease(release.tag_name.clone()))
}

/// Group parsed modules by identity key, applying collision tie-breaks.
fn group_modules(modules: Vec<Module>) -> BTreeMap<ModuleKey, Module> {
    let mut set: BTreeMap<ModuleKey, Module> = BTreeMap::new();
    for module in modules {
        match set.remove(&module.key()) {
            None => {
                set.insert(module.key(), module);
            }
            Some(existing) => {
                let winner = prefer(existing, module);
                set.insert(winner.key(), winner);
            }
        }
    }
    set
}

fn dedupe(modules: Vec<Module>) -> Vec<Module> {
    group_modules(modules).into_values().collect()
}

fn is_tinker(module: &Module) -> bool {
    module.file_name().to_lowercase().contains("tinker")
}

/// Collision tie-breaks, in order: tinker user-parts beat other user-parts,
/// newer versions beat older, and smaller files beat larger (debug builds
/// are bigger than release builds of the same version).
fn prefer(existing: Module, candidate: Module) -> Module {
    if existing.module_type == ModuleType::UserPart && is_tinker(&existing) != is_tinker(&candidate)
    {
        return if is_tinker(&candidate) {
            candidate
        } else {
            existing
        };
    }
    if candidate.version != existing.version {
        return if candidate.version > existing.version {
            candidate
        } else {
            existing
        };
    }
    if candidate.file_size < existing.file_size {
        candidate
    } else {
        existing
    }
}

fn flash_rank(module_type: ModuleType) -> u8 {
    match module_type {
        ModuleType::RadioStack => 0,
        ModuleType::SystemPart => 1,
        ModuleType::UserPart => 2,
        ModuleType::NcpFirmware => 3,
        ModuleType::Bootloader => 4,
    }
}

/// Dependency-safe write order: radio stack before the system parts that
/// link against it, user code after the system, bootloader last.
fn sort_for_flashing(mut modules: Vec<Module>) -> Vec<Module> {
    modules.sort_by_key(|m| (m.platform_id, flash_rank(m.module_type), m.index));
    modules
}
