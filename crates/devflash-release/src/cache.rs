//! On-disk module cache layout
//!
//! Cached releases live under `<root>/<version>/<platform_name>/<file>.bin`.
//! The cache is only ever written by the resolver's commit step; everything
//! here is layout arithmetic plus the read-side scan.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use devflash_core::{module, Module, PlatformCatalog};

use crate::error::ReleaseError;

/// Paths of the module cache.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one cached release.
    pub fn release_dir(&self, version: &str) -> PathBuf {
        self.root.join(version)
    }

    /// Per-platform directory within a cached release.
    pub fn platform_dir(&self, version: &str, platform_name: &str) -> PathBuf {
        self.release_dir(version).join(platform_name)
    }
}

/// Parse every `*.bin` under `dir` into modules.
///
/// Skippable parse failures are logged and dropped; I/O failures on
/// individual files abort the scan.
pub fn scan_modules(catalog: &PlatformCatalog, dir: &Path) -> Result<Vec<Module>, ReleaseError> {
    let mut modules = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "Skipping unreadable cache entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path
            .extension()
            .map(|ext| !ext.eq_ignore_ascii_case("bin"))
            .unwrap_or(true)
        {
            continue;
        }
        match module::parse_module_file(catalog, path) {
            Ok(module) => {
                debug!(file = %path.display(), platform = %module.platform_name, "Parsed module");
                modules.push(module);
            }
            Err(err) if err.is_skippable() => {
                warn!(file = %path.display(), %err, "Skipping file");
            }
            Err(devflash_core::ModuleParseError::Io { source, .. }) => {
                return Err(ReleaseError::Io(source));
            }
            Err(err) => {
                warn!(file = %path.display(), %err, "Skipping file");
            }
        }
    }
    Ok(modules)
}
