//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "LIMS_INGEST_ROOT";

/// Application directory name used under the platform config/data dirs
const APP_DIR: &str = "lims-ingest";

/// Database file name inside the root folder
const DATABASE_FILE: &str = "lims.db";

/// Logging section of the TOML config
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// On-disk TOML configuration
///
/// Every field is optional; a missing or unreadable file falls back to defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Load a TOML config from an explicit path
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Where the effective platform config came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// No config file exists
    Defaults,
    File(PathBuf),
    /// A config file exists but could not be read or parsed; defaults are used
    Unreadable { path: PathBuf, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformConfig {
    pub config: TomlConfig,
    pub source: ConfigSource,
}

impl PlatformConfig {
    /// Report how the config was loaded
    ///
    /// Call after the tracing subscriber is installed; loading happens before.
    pub fn log_source(&self) {
        match &self.source {
            ConfigSource::Defaults => debug!("No config file found, using defaults"),
            ConfigSource::File(path) => debug!("Loaded config file: {}", path.display()),
            ConfigSource::Unreadable { path, error } => {
                warn!("Ignoring unreadable config file {}: {}", path.display(), error)
            }
        }
    }
}

/// Load the platform config file, or defaults when none is present
pub fn load_platform_config() -> PlatformConfig {
    load_config_from(find_config_file())
}

/// Load `path` if one was found, falling back to defaults
pub fn load_config_from(path: Option<PathBuf>) -> PlatformConfig {
    let Some(path) = path else {
        return PlatformConfig {
            config: TomlConfig::default(),
            source: ConfigSource::Defaults,
        };
    };

    match load_toml_config(&path) {
        Ok(config) => PlatformConfig {
            config,
            source: ConfigSource::File(path),
        },
        Err(e) => PlatformConfig {
            config: TomlConfig::default(),
            source: ConfigSource::Unreadable {
                path,
                error: e.to_string(),
            },
        },
    }
}

/// Root folder resolution, in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Get the configuration file path for the platform
fn find_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc").join(APP_DIR).join("config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("./lims_data"))
}

/// Prepares a resolved root folder for use
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    /// Create the root folder if missing
    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        Ok(())
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// Path of the warehouse database inside the root folder
    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE)
    }
}
