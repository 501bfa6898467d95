//! Vault configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/tvault/vault.toml`
//! - Windows: `%APPDATA%/tvault/vault.toml`
//! - elsewhere: `/tmp/tvault/vault.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tvault_metadata::MetadataConfig;
use tvault_scheduler::SchedulerConfig;
use tvault_transfer::DEFAULT_MAX_CHUNK_SIZE;

const APP_DIR: &str = "tvault";
const CONFIG_FILE: &str = "vault.toml";

/// Errors from loading or saving the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Vault configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Root directory of the on-disk blob store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Largest chunk written, in bytes. The backend limit applies on top.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Container for new uploads and for files in the root folder.
    #[serde(default = "default_container")]
    pub default_container: String,

    /// Container holding the metadata document.
    #[serde(default = "default_metadata_container")]
    pub metadata_container: String,

    /// Concurrent thumbnail prefetch workers.
    #[serde(default = "default_thumbnail_workers")]
    pub thumbnail_workers: usize,

    #[serde(default = "default_thumbnail_cache_dir")]
    pub thumbnail_cache_dir: PathBuf,

    /// Images above this size are not fetched for previews.
    #[serde(default = "default_max_preview_bytes")]
    pub max_preview_bytes: u64,

    /// Capacity of the transfer event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_data_dir() -> PathBuf {
    app_dir().join("store")
}

fn default_max_chunk_size() -> u64 {
    DEFAULT_MAX_CHUNK_SIZE
}

fn default_container() -> String {
    "inbox".into()
}

fn default_metadata_container() -> String {
    "metadata".into()
}

fn default_thumbnail_workers() -> usize {
    3
}

fn default_thumbnail_cache_dir() -> PathBuf {
    app_dir().join("thumbnails")
}

fn default_max_preview_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_event_buffer() -> usize {
    256
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_chunk_size: default_max_chunk_size(),
            default_container: default_container(),
            metadata_container: default_metadata_container(),
            thumbnail_workers: default_thumbnail_workers(),
            thumbnail_cache_dir: default_thumbnail_cache_dir(),
            max_preview_bytes: default_max_preview_bytes(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl VaultConfig {
    /// Loads the configuration at the default path.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    /// Loads configuration from `path`, or writes a default one if missing.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: VaultConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = VaultConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn metadata_config(&self) -> MetadataConfig {
        MetadataConfig {
            container: self.metadata_container.clone(),
            default_container: self.default_container.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_container: self.default_container.clone(),
            max_chunk_size: self.max_chunk_size,
            event_buffer: self.event_buffer,
        }
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> PathBuf {
    app_dir().join(CONFIG_FILE)
}

fn app_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join(APP_DIR)
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join(APP_DIR)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp").join(APP_DIR)
    }
}
