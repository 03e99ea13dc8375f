//! Fleet coordination for devflash
//!
//! Turns a resolved module set and a set of target boards into finished
//! flash jobs:
//!
//! - [`flasher`]: the per-device state machine (partitioning, ordered
//!   writes, retries, transport switching, resets)
//! - [`coordinator`]: enumeration, identity reconciliation through the
//!   device registry, and bounded-parallelism dispatch
//! - [`registry`]: the cloud device-registry client and profile-file
//!   credential loading

#![deny(unsafe_code, clippy::unwrap_used)]
#![warn(rust_2018_idioms)]

pub mod coordinator;
pub mod error;
pub mod flasher;
pub mod registry;

pub use coordinator::{FleetConfig, FleetCoordinator, TargetSpec};
pub use error::FleetError;
pub use flasher::{flash_device, FlasherConfig};
pub use registry::{
    load_profile_credentials, CloudRegistryClient, DeviceRegistry, ProfileCredentials,
    RegistryDevice, UserInfo,
};
