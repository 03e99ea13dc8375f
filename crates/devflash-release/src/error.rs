//! Error types for release resolution

use thiserror::Error;

/// Errors that can occur while resolving a release into modules.
#[derive(Error, Debug)]
pub enum ReleaseError {
    /// No release exists under any tag form of the requested version
    #[error("Release not found: {0}")]
    ReleaseNotFound(String),

    /// The release has neither `.bin` nor `.zip` assets, or a local path
    /// yielded no parseable modules
    #[error("No firmware binaries found in {0}")]
    NoBinariesInRelease(String),

    /// An operation needs a release-host token that is not configured
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// Downloading a specific asset failed
    #[error("Failed to download {asset}: {reason}")]
    DownloadFailed {
        /// Name of the failing asset
        asset: String,
        /// What went wrong
        reason: String,
    },

    /// The requested version is not valid semver
    #[error("Invalid version '{version}': {source}")]
    InvalidVersion {
        /// Offending version string
        version: String,
        /// Parse failure
        #[source]
        source: semver::Error,
    },

    /// A release-host request failed at the transport level
    #[error("Release host request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The release host answered with an unexpected status
    #[error("Release host returned {status} for {url}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Request URL
        url: String,
    },

    /// Extracting a zip asset failed
    #[error("Failed to unpack {archive}: {reason}")]
    Unpack {
        /// Archive file name
        archive: String,
        /// What went wrong
        reason: String,
    },

    /// Filesystem failure while staging or caching modules
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
