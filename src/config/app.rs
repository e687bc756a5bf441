//! Startup configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::Controller;

use super::store::{Configuration, Setting};
use super::validation::ConfigError;

/// Capture settings loaded from a YAML file at process start.
///
/// Every field is optional; absent fields keep the controller defaults.
///
/// ```yaml
/// directory: /var/lib/db/diagnostic.data
/// enabled: true
/// period: 1s
/// max_directory_size_bytes: 209715200
/// max_file_size_bytes: 10485760
/// max_samples_per_archive_chunk: 300
/// max_samples_per_interim_chunk: 10
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Output directory (can only be set once per process).
    pub directory: Option<PathBuf>,

    /// Whether sampling starts enabled.
    pub enabled: Option<bool>,

    /// Sampling period (minimum: 100ms).
    #[serde(with = "humantime_serde")]
    pub period: Option<Duration>,

    /// Disk budget for all retained files (minimum: 10 MiB).
    pub max_directory_size_bytes: Option<u64>,

    /// Per-file budget before rotation (minimum: 1 MiB).
    pub max_file_size_bytes: Option<u64>,

    /// Samples per archive chunk (minimum: 2).
    pub max_samples_per_archive_chunk: Option<usize>,

    /// Samples per interim update (minimum: 2).
    pub max_samples_per_interim_chunk: Option<usize>,
}

impl CaptureConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every present field against its bound.
    ///
    /// # Errors
    /// Returns the first rejected setting, including `PathNotSet` when
    /// `enabled: true` is given without a directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut scratch = Configuration::default();
        for setting in self.to_settings() {
            scratch.apply(setting)?;
        }
        Ok(())
    }

    /// Settings in application order: directory first, `enabled` last.
    pub fn to_settings(&self) -> Vec<Setting> {
        let mut settings = Vec::new();

        if let Some(directory) = &self.directory {
            settings.push(Setting::Directory(directory.clone()));
        }
        if let Some(period) = self.period {
            settings.push(Setting::Period(period));
        }
        if let Some(bytes) = self.max_directory_size_bytes {
            settings.push(Setting::MaxDirectorySizeBytes(bytes));
        }
        if let Some(bytes) = self.max_file_size_bytes {
            settings.push(Setting::MaxFileSizeBytes(bytes));
        }
        if let Some(samples) = self.max_samples_per_archive_chunk {
            settings.push(Setting::MaxSamplesPerArchiveChunk(samples));
        }
        if let Some(samples) = self.max_samples_per_interim_chunk {
            settings.push(Setting::MaxSamplesPerInterimChunk(samples));
        }
        if let Some(enabled) = self.enabled {
            settings.push(Setting::Enabled(enabled));
        }

        settings
    }

    /// Push every present setting into the controller.
    pub fn apply_to(&self, controller: &Controller) -> Result<(), ConfigError> {
        for setting in self.to_settings() {
            controller.apply(setting)?;
        }
        Ok(())
    }
}
