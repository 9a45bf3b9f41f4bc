//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use boe_core::{Result, SimulatorConfig};

/// BOE client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoeConfig {
    /// Local release mirror holding `releases.json` and the images
    pub release_dir: PathBuf,

    /// Try signature recovery on the board before falling back to software
    pub hardware_recovery: bool,

    /// Caller-side deadline for firmware updates (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_timeout_secs: Option<u64>,

    /// Settings of the simulated board
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl Default for BoeConfig {
    fn default() -> Self {
        Self {
            release_dir: Self::default_release_dir(),
            hardware_recovery: true,
            update_timeout_secs: None,
            simulator: SimulatorConfig::default(),
        }
    }
}

impl BoeConfig {
    fn default_release_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("boe")
            .join("releases")
    }

    /// Platform default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("boe")
            .join("config.json")
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load the file at `path`, writing the defaults there first if it is missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(path)?;
        tracing::info!("Created default config at {:?}", path);
        Ok(config)
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.release_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boe_core::BoeError;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BoeConfig::default();
        assert!(config.hardware_recovery);
        assert!(config.update_timeout_secs.is_none());
        assert!(config.release_dir.ends_with("boe/releases"));
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let created = BoeConfig::load_or_create(&path).unwrap();
        assert!(path.exists());

        let loaded = BoeConfig::load(&path).unwrap();
        assert_eq!(loaded.release_dir, created.release_dir);
        assert_eq!(loaded.simulator.serial, created.simulator.serial);
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "release_dir": "/srv/boe", "hardware_recovery": false }"#,
        )
        .unwrap();

        let config = BoeConfig::load(&path).unwrap();
        assert_eq!(config.release_dir, PathBuf::from("/srv/boe"));
        assert!(!config.hardware_recovery);
        assert_eq!(config.simulator.step_delay_ms, 5);
    }

    #[test]
    fn test_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            BoeConfig::load(&path),
            Err(BoeError::Serialization(_))
        ));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = TempDir::new().unwrap();
        let config = BoeConfig {
            release_dir: dir.path().join("mirror"),
            ..BoeConfig::default()
        };
        config.ensure_directories().unwrap();
        assert!(config.release_dir.is_dir());
    }
}
