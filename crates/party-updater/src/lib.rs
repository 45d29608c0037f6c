//! Core release catalog and installer for mihomo party.
//!
//! This crate lists published versions of the mihomo core and installs a
//! chosen version into the application's core directory.
//!
//! # Overview
//!
//! - [`ReleaseSource`] lists repository tags through a [`TagFetcher`]
//!   (normally [`GitHubClient`]) with a shared five-minute [`VersionCache`].
//! - [`platform::resolve`] maps the host OS and architecture to a release
//!   asset name. Unknown pairs fail with [`UpdateError::UnsupportedPlatform`].
//! - [`Installer`] downloads the asset to a temporary file, extracts the
//!   executable (zip on Windows, gzip elsewhere), marks it executable and
//!   renames it into place. A [`CoreStopper`] is asked to stop any process
//!   running from the target path before it is replaced.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use party_updater::{GitHubClient, ReleaseSource, RepoId, VersionCache, GITHUB_API_URL};
//!
//! async fn latest_tags() -> party_updater::Result<()> {
//!     let client = GitHubClient::new(GITHUB_API_URL, None)?;
//!     let source = ReleaseSource::new(client, Arc::new(VersionCache::new()));
//!     for tag in source.list_versions(&RepoId::mihomo(), false).await? {
//!         println!("{}", tag.name);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod download;
pub mod error;
pub mod extract;
pub mod github;
pub mod install;
pub mod platform;
pub mod release;

pub use cache::{CACHE_EXPIRY, VersionCache};
pub use download::{AssetFetcher, DOWNLOAD_TIMEOUT, DownloadProgress, HttpDownloader, format_bytes};
pub use error::{Result, UpdateError};
pub use github::{FETCH_TIMEOUT, GITHUB_API_URL, GitHubClient, ReleaseSource, TagFetcher};
pub use install::{
    CoreStopper, DEFAULT_DOWNLOAD_BASE, InstalledBinary, Installer, InstallerConfig,
    SPECIFIC_BINARY_STEM,
};
pub use platform::{ArchiveFormat, HostPlatform, PlatformTarget};
pub use release::{ReleaseTag, RepoId, filter_tags};
