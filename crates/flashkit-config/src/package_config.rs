//! Packaging defaults

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ConfigError;

/// Settings used when building and unpacking update packages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Package file version written by default (1 or 2)
    #[serde(default = "default_format_version")]
    pub format_version: u32,

    /// Parent directory for temporary staging folders (system temp dir if unset)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Deflate level used for package and node archives
    #[serde(default = "default_compression_level")]
    pub compression_level: i64,
}

fn default_format_version() -> u32 {
    2
}

fn default_compression_level() -> i64 {
    6
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            format_version: default_format_version(),
            staging_dir: None,
            compression_level: default_compression_level(),
        }
    }
}

impl PackageConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.format_version, 1 | 2) {
            return Err(ConfigError::Invalid(format!(
                "package.format_version must be 1 or 2, got {}",
                self.format_version
            )));
        }

        if !(0..=9).contains(&self.compression_level) {
            return Err(ConfigError::Invalid(format!(
                "package.compression_level must be within 0..=9, got {}",
                self.compression_level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = PackageConfig::default();
        assert_eq!(config.format_version, 2);
        assert_eq!(config.compression_level, 6);
        assert!(config.staging_dir.is_none());
    }

    #[test]
    fn test_compression_level_range() {
        let config = PackageConfig {
            compression_level: 12,
            ..PackageConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
