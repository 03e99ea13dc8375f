//! Transport error types

use std::time::Duration;

use thiserror::Error;

use devflash_core::Storage;

/// Errors raised by the flashing transports.
#[derive(Error, Debug)]
pub enum TransportError {
    /// An operation was attempted on a device that is not open
    #[error("Device is not open")]
    DeviceNotOpen,

    /// Opening a device failed
    #[error("Failed to open device {device}: {reason}")]
    OpenFailed {
        /// Device id or locator
        device: String,
        /// What went wrong
        reason: String,
    },

    /// The requested device never showed up
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The platform cannot address this storage over the current transport
    #[error("Storage {0} is not supported by this transport")]
    UnsupportedStorage(Storage),

    /// The transport cannot perform the requested operation at all
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    /// The external programmer exited with a failure
    #[error("Programmer failed with exit code {exit_code}: {stderr}")]
    ProgrammerFailed {
        /// Subprocess exit code (-1 when killed by a signal)
        exit_code: i32,
        /// Captured stderr
        stderr: String,
    },

    /// The daemon's control port never opened
    #[error("Daemon did not open control port {port} within {timeout:?}")]
    DaemonStartTimeout {
        /// Control port that stayed closed
        port: u16,
        /// How long we waited
        timeout: Duration,
    },

    /// The daemon exited while we still needed it
    #[error("Daemon exited unexpectedly with status {status}")]
    DaemonExitedUnexpectedly {
        /// Exit status description
        status: String,
    },

    /// A control-protocol violation or negotiation failure
    #[error("Control protocol error: {0}")]
    ControlProtocol(String),

    /// A control command did not complete in time
    #[error("Command '{command}' timed out after {timeout:?}")]
    CommandTimeout {
        /// The command that was running
        command: String,
        /// Its timeout
        timeout: Duration,
    },

    /// Debug-port probing could not identify the target MCU
    #[error("Unable to determine target platform; probe transcript:\n{transcript}")]
    UnknownTargetPlatform {
        /// Concatenated probe responses
        transcript: String,
    },

    /// USB-level failure
    #[error("USB error: {0}")]
    Usb(String),

    /// The peer closed the control connection
    #[error("Control connection closed")]
    Disconnected,

    /// Filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        TransportError::Usb(err.to_string())
    }
}
