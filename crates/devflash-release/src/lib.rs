//! Firmware release resolution and caching for devflash
//!
//! Given a release version (or a local path), this crate produces the set of
//! per-platform firmware [`Module`](devflash_core::Module)s to flash:
//!
//! - [`github`]: the release-host client (tagged releases, paged listing,
//!   authenticated asset downloads)
//! - [`resolver`]: the orchestration — cache fast path, asset selection,
//!   bounded downloads, canonicalization, backfill from bundled assets and
//!   older releases, and the atomic cache commit
//! - [`cache`]: the on-disk cache layout (`<cache>/<version>/<platform>/`)
//! - [`unpack`]: zip asset extraction
//!
//! Draft releases are resolvable with authentication but never persisted to
//! the cache.

#![deny(unsafe_code, clippy::unwrap_used)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod error;
pub mod github;
pub mod resolver;
pub mod unpack;

pub use error::ReleaseError;
pub use github::{GithubReleaseClient, Release, ReleaseAsset, ReleaseHost};
pub use resolver::{ResolveOptions, Resolver, ResolverConfig};
