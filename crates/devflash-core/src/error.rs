//! Error types for catalog lookups and module parsing

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::ModuleType;

/// Errors raised by platform catalog lookups and tag resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The requested platform id or name is not in the catalog
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    /// A module-type tag from an external record was not recognized
    #[error("Unknown module type: {0}")]
    UnknownModuleType(String),

    /// A storage-type tag from an external record was not recognized
    #[error("Unknown storage type: {0}")]
    UnknownStorageType(String),
}

/// Errors raised while parsing a candidate firmware binary.
///
/// Most of these are *skippable*: a directory scan treats them as warnings
/// and moves on to the next file. Only plain I/O failures abort a scan.
#[derive(Error, Debug)]
pub enum ModuleParseError {
    /// Reading the file failed
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file is smaller than a module prefix plus CRC suffix
    #[error("File too short to be a firmware module: {path}")]
    TooShort {
        /// Offending file
        path: PathBuf,
    },

    /// The module function is valid but not flashable by this tool
    #[error("Unsupported module function '{function}' in {path}")]
    UnsupportedModule {
        /// Offending file
        path: PathBuf,
        /// Function tag from the prefix header
        function: &'static str,
    },

    /// The module function byte is not a known value
    #[error("Unknown module function {tag:#04x} in {path}")]
    UnknownFunction {
        /// Offending file
        path: PathBuf,
        /// Raw function byte
        tag: u8,
    },

    /// The prefix names a platform id that is not in the catalog
    #[error("Module {path} targets unknown platform id {platform_id}")]
    UnknownPlatform {
        /// Offending file
        path: PathBuf,
        /// Platform id from the prefix header
        platform_id: u16,
    },

    /// The platform has no storage descriptor for this module slot
    #[error("No storage known for {module_type:?} (index {index}) of platform {platform} in {path}")]
    StorageUnknown {
        /// Offending file
        path: PathBuf,
        /// Platform short name
        platform: String,
        /// Module type from the prefix header
        module_type: ModuleType,
        /// Module index from the prefix header
        index: u8,
    },
}

impl ModuleParseError {
    /// Whether a directory scan may log this error and continue.
    pub fn is_skippable(&self) -> bool {
        !matches!(self, ModuleParseError::Io { .. })
    }
}
