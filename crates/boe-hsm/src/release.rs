//! Firmware release resolution
//!
//! The updater only needs `fetch(version) -> image`. How releases are
//! transported is up to the implementation; [`DirectoryReleaseFetcher`]
//! serves them from a local mirror directory laid out as:
//!
//! ```text
//! <root>/releases.json    index of available images
//! <root>/<file>           image files named by the index
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use boe_core::{BoeError, ModuleVersion, Result};

/// Name of the release index inside a mirror directory
pub const RELEASE_INDEX_FILE: &str = "releases.json";

/// Resolves and downloads the firmware image for a board
#[async_trait]
pub trait ReleaseFetcher: Send + Sync {
    /// Fetch the image that upgrades a board currently at `version`
    async fn fetch(&self, version: &ModuleVersion) -> Result<Vec<u8>>;
}

/// One entry of the release index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    pub hardware: u8,
    pub major: u8,
    pub feature: u8,
    pub dev: u8,
    /// Image file name relative to the mirror root
    pub file: String,
    /// Hex SHA-256 of the image
    pub sha256: String,
}

impl ReleaseEntry {
    pub fn version(&self) -> ModuleVersion {
        ModuleVersion::new(self.hardware, self.major, self.feature, self.dev)
    }
}

/// Release index file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseIndex {
    pub releases: Vec<ReleaseEntry>,
}

impl ReleaseIndex {
    /// Newest release for the same board that is newer than `current`
    pub fn select(&self, current: &ModuleVersion) -> Option<&ReleaseEntry> {
        self.releases
            .iter()
            .filter(|entry| current.is_upgraded_by(&entry.version()))
            .max_by_key(|entry| entry.version().firmware())
    }
}

/// Serves release images from a local mirror directory
#[derive(Debug, Clone)]
pub struct DirectoryReleaseFetcher {
    root: PathBuf,
}

impl DirectoryReleaseFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load and parse the release index
    pub async fn load_index(&self) -> Result<ReleaseIndex> {
        let path = self.root.join(RELEASE_INDEX_FILE);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            BoeError::ReleaseFetch(format!("Failed to read {:?}: {}", path, e))
        })?;
        let index: ReleaseIndex = serde_json::from_str(&content)?;
        Ok(index)
    }
}

#[async_trait]
impl ReleaseFetcher for DirectoryReleaseFetcher {
    async fn fetch(&self, version: &ModuleVersion) -> Result<Vec<u8>> {
        let index = self.load_index().await?;
        let entry = index.select(version).ok_or_else(|| {
            BoeError::ReleaseFetch(format!("No release newer than {} in mirror", version))
        })?;
        debug!("Selected release {} ({})", entry.version(), entry.file);

        let path = self.root.join(&entry.file);
        let image = tokio::fs::read(&path).await.map_err(|e| {
            BoeError::ReleaseFetch(format!("Failed to read image {:?}: {}", path, e))
        })?;

        if image.is_empty() {
            return Err(BoeError::ReleaseFetch(format!("Image {:?} is empty", path)));
        }

        let digest = hex::encode(Sha256::digest(&image));
        if !digest.eq_ignore_ascii_case(&entry.sha256) {
            return Err(BoeError::ReleaseFetch(format!(
                "Checksum mismatch for {}: expected {}, got {}",
                entry.file, entry.sha256, digest
            )));
        }

        info!(
            "Fetched release {} ({} bytes) for board {}",
            entry.version(),
            image.len(),
            version
        );
        Ok(image)
    }
}
