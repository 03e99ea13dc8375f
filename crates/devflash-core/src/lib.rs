//! Platform catalog and firmware module model for devflash
//!
//! This crate holds the pieces of devflash that every other crate builds on:
//!
//! - [`catalog`]: the static table of supported hardware platforms, their
//!   firmware module layouts, storage regions, and debug-adapter targets
//! - [`module_info`]: parsing of the binary module prefix header and the
//!   trailing CRC suffix
//! - [`module`]: the canonical [`Module`](module::Module) record produced by
//!   joining a parsed binary with the catalog
//! - [`util`]: device-id validation and hex formatting helpers
//!
//! Nothing in here performs I/O beyond reading candidate firmware files from
//! local disk; network, USB, and subprocess concerns live in the sibling
//! crates.

#![deny(unsafe_code, clippy::unwrap_used)]
#![warn(rust_2018_idioms)]

pub mod catalog;
pub mod error;
pub mod module;
pub mod module_info;
pub mod util;

mod data;

pub use catalog::{
    DebugTargetConfig, DeviceIdReadProcedure, FlashStyle, McuFamily, ModuleType, Platform,
    PlatformCatalog, Region, Storage, StorageDescriptor,
};
pub use error::{CatalogError, ModuleParseError};
pub use module::{Module, ModuleKey};
pub use util::DeviceId;
