//! Fleet-level error types

use thiserror::Error;

use devflash_core::CatalogError;
use devflash_transport::TransportError;

/// Errors raised by enumeration, target resolution, and dispatch.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Enumeration found nothing to flash
    #[error("No devices found")]
    NoDevicesFound,

    /// A requested device is neither attached nor known to the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A selected device's platform could not be determined
    #[error("Unable to determine the platform of device {0}; pass <device>:<platform>")]
    UnknownPlatform(String),

    /// The registry needs a token that is missing or rejected
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// The registry answered with an unexpected status
    #[error("Registry request failed with status {status}: {message}")]
    Registry {
        /// HTTP status
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Registry transport failure
    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Flashing one device failed after all retries
    #[error("Flashing device {device} failed: {source}")]
    FlashFailed {
        /// Device id
        device: String,
        /// Final transport error
        #[source]
        source: TransportError,
    },

    /// Transport failure outside a per-device flash job
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Catalog lookup failure
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
