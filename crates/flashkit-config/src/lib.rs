//! Configuration management for flashkit
//!
//! Handles packaging defaults, update sequencer timing and logging settings.
//! Configuration lives in TOML files; partial files are overlaid on the defaults.

mod package_config;
mod sequencer_config;

pub use package_config::PackageConfig;
pub use sequencer_config::SequencerConfig;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Standard configuration paths
pub const CONFIG_DIR: &str = "/etc/flashkit";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "FLASHKIT_CONFIG";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Colored terminal output
    #[serde(default)]
    pub ansi: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: false,
        }
    }
}

/// Main flashkit configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashkitConfig {
    #[serde(default)]
    pub package: PackageConfig,

    #[serde(default)]
    pub sequencer: SequencerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FlashkitConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Search order: `$FLASHKIT_CONFIG`, the user configuration directory, then
    /// the system directory. Falls back to defaults when nothing is found.
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load(Path::new(&explicit));
        }

        if let Some(user_config) = user_config_path() {
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        let system_config = Path::new(CONFIG_DIR).join(CONFIG_FILE_NAME);
        if system_config.exists() {
            return Self::load(&system_config);
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load a partial configuration file on top of the defaults
    pub fn load_overlay(path: &Path) -> Result<Self, ConfigError> {
        let mut base = toml::Value::try_from(Self::default())?;
        let contents = std::fs::read_to_string(path)?;
        let overlay: toml::Value = toml::from_str(&contents)?;
        merge_toml(&mut base, overlay);

        let config: Self = base.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        tracing::info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.package.validate()?;
        self.sequencer.validate()?;
        Ok(())
    }
}

/// User configuration file location (`$XDG_CONFIG_HOME` or `~/.config`)
pub fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("flashkit").join(CONFIG_FILE_NAME))
}

/// Helper function to merge TOML values
pub fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                if let Some(base_value) = base_table.get_mut(&key) {
                    merge_toml(base_value, value);
                } else {
                    base_table.insert(key, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
