//! Flashing transports for devflash
//!
//! Three independent implementations of the device capability interfaces:
//!
//! - [`update_request`]: asks running firmware to accept a module image over
//!   a USB vendor control request
//! - [`dfu`]: drives the external raw programmer (`dfu-util`) against a
//!   storage alt-setting
//! - [`openocd`]: owns an OpenOCD daemon subprocess plus a telnet-style
//!   control connection to write flash through a hardware debug adapter
//!
//! The [`device`] module defines the two seams everything else programs
//! against: [`DeviceDiscovery`](device::DeviceDiscovery) for enumeration and
//! [`FlashDevice`](device::FlashDevice) for per-device operations. The
//! [`telnet`] module is the line-oriented control-protocol client used by the
//! OpenOCD driver.

#![deny(unsafe_code, clippy::unwrap_used)]
#![warn(rust_2018_idioms)]

pub mod device;
pub mod dfu;
pub mod error;
pub mod openocd;
pub mod process;
pub mod telnet;
pub mod update_request;
pub mod usb;

#[cfg(test)]
pub(crate) mod testing;

pub use device::{DeviceDiscovery, DeviceHandle, FlashDevice, FlashOutcome};
pub use error::TransportError;

use std::time::Duration;

/// Timeout for one raw-programmer write.
pub const RAW_WRITE_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for one debug-adapter flash write.
pub const DEBUG_WRITE_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for one update-request module transfer.
pub const UPDATE_REQUEST_TIMEOUT: Duration = Duration::from_secs(240);

/// How long to wait for the control port after starting the daemon.
pub const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default control-protocol command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Control-protocol connect timeout.
pub const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to keep retrying a device open after a reset.
pub const REOPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum interval between resets of the same target.
pub const MIN_RESET_INTERVAL: Duration = Duration::from_secs(5);
