//! Capture configuration, runtime parameters and the pending configuration store.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use strum_macros::{Display, EnumString, IntoStaticStr};

use super::validation::{
    ConfigError, MIN_DIRECTORY_SIZE_BYTES, MIN_FILE_SIZE_BYTES, MIN_SAMPLES_PER_CHUNK, at_least,
    check_period, parse_byte_size, parse_duration,
};

// =============================================================================
// Constants
// =============================================================================

/// Default sampling period (1 second).
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// Default disk budget for the output directory (200 MiB).
pub const DEFAULT_MAX_DIRECTORY_SIZE_BYTES: u64 = 200 * 1024 * 1024;

/// Default per-file budget before rotation (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Default number of samples per archive chunk.
pub const DEFAULT_MAX_SAMPLES_PER_ARCHIVE_CHUNK: usize = 300;

/// Default number of samples per interim update.
pub const DEFAULT_MAX_SAMPLES_PER_INTERIM_CHUNK: usize = 10;

// =============================================================================
// Configuration
// =============================================================================

/// Capture configuration value.
///
/// Fields are private so that every value passes its bound check on the way
/// in; an instance can never hold an out-of-bounds setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    enabled: bool,
    period: Duration,
    max_directory_size_bytes: u64,
    max_file_size_bytes: u64,
    max_samples_per_archive_chunk: usize,
    max_samples_per_interim_chunk: usize,
    directory: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            enabled: false,
            period: DEFAULT_PERIOD,
            max_directory_size_bytes: DEFAULT_MAX_DIRECTORY_SIZE_BYTES,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            max_samples_per_archive_chunk: DEFAULT_MAX_SAMPLES_PER_ARCHIVE_CHUNK,
            max_samples_per_interim_chunk: DEFAULT_MAX_SAMPLES_PER_INTERIM_CHUNK,
            directory: None,
        }
    }
}

impl Configuration {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn max_directory_size_bytes(&self) -> u64 {
        self.max_directory_size_bytes
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_bytes
    }

    pub fn max_samples_per_archive_chunk(&self) -> usize {
        self.max_samples_per_archive_chunk
    }

    pub fn max_samples_per_interim_chunk(&self) -> usize {
        self.max_samples_per_interim_chunk
    }

    /// Output directory, if one has been configured.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Set the output directory. Only the first call succeeds.
    pub fn set_directory(&mut self, path: impl Into<PathBuf>) -> Result<(), ConfigError> {
        if let Some(existing) = &self.directory {
            return Err(ConfigError::PathAlreadySet(existing.clone()));
        }
        self.directory = Some(path.into());
        Ok(())
    }

    /// Turn sampling on or off. Enabling requires a directory.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), ConfigError> {
        if enabled && self.directory.is_none() {
            return Err(ConfigError::PathNotSet);
        }
        self.enabled = enabled;
        Ok(())
    }

    pub fn set_period(&mut self, period: Duration) -> Result<(), ConfigError> {
        self.period = check_period(period)?;
        Ok(())
    }

    pub fn set_max_directory_size_bytes(&mut self, bytes: u64) -> Result<(), ConfigError> {
        self.max_directory_size_bytes = at_least(
            Parameter::MaxDirectorySizeBytes.name(),
            bytes,
            MIN_DIRECTORY_SIZE_BYTES,
        )?;
        Ok(())
    }

    pub fn set_max_file_size_bytes(&mut self, bytes: u64) -> Result<(), ConfigError> {
        self.max_file_size_bytes = at_least(
            Parameter::MaxFileSizeBytes.name(),
            bytes,
            MIN_FILE_SIZE_BYTES,
        )?;
        Ok(())
    }

    pub fn set_max_samples_per_archive_chunk(&mut self, samples: usize) -> Result<(), ConfigError> {
        self.max_samples_per_archive_chunk = at_least(
            Parameter::MaxSamplesPerArchiveChunk.name(),
            samples,
            MIN_SAMPLES_PER_CHUNK,
        )?;
        Ok(())
    }

    pub fn set_max_samples_per_interim_chunk(&mut self, samples: usize) -> Result<(), ConfigError> {
        self.max_samples_per_interim_chunk = at_least(
            Parameter::MaxSamplesPerInterimChunk.name(),
            samples,
            MIN_SAMPLES_PER_CHUNK,
        )?;
        Ok(())
    }

    /// Apply a single setting, validating it first.
    pub fn apply(&mut self, setting: Setting) -> Result<(), ConfigError> {
        match setting {
            Setting::Enabled(enabled) => self.set_enabled(enabled),
            Setting::Directory(path) => self.set_directory(path),
            Setting::Period(period) => self.set_period(period),
            Setting::MaxDirectorySizeBytes(bytes) => self.set_max_directory_size_bytes(bytes),
            Setting::MaxFileSizeBytes(bytes) => self.set_max_file_size_bytes(bytes),
            Setting::MaxSamplesPerArchiveChunk(n) => self.set_max_samples_per_archive_chunk(n),
            Setting::MaxSamplesPerInterimChunk(n) => self.set_max_samples_per_interim_chunk(n),
        }
    }
}

// =============================================================================
// Runtime parameters
// =============================================================================

/// Names of the runtime-settable options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum Parameter {
    Enabled,
    Directory,
    Period,
    MaxDirectorySizeBytes,
    MaxFileSizeBytes,
    MaxSamplesPerArchiveChunk,
    MaxSamplesPerInterimChunk,
}

impl Parameter {
    /// Option name as accepted by [`Setting::parse`].
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// A typed value for one runtime parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    Enabled(bool),
    Directory(PathBuf),
    Period(Duration),
    MaxDirectorySizeBytes(u64),
    MaxFileSizeBytes(u64),
    MaxSamplesPerArchiveChunk(usize),
    MaxSamplesPerInterimChunk(usize),
}

impl Setting {
    pub fn parameter(&self) -> Parameter {
        match self {
            Self::Enabled(_) => Parameter::Enabled,
            Self::Directory(_) => Parameter::Directory,
            Self::Period(_) => Parameter::Period,
            Self::MaxDirectorySizeBytes(_) => Parameter::MaxDirectorySizeBytes,
            Self::MaxFileSizeBytes(_) => Parameter::MaxFileSizeBytes,
            Self::MaxSamplesPerArchiveChunk(_) => Parameter::MaxSamplesPerArchiveChunk,
            Self::MaxSamplesPerInterimChunk(_) => Parameter::MaxSamplesPerInterimChunk,
        }
    }

    /// Parse a setting from a parameter name and its textual value.
    ///
    /// Only the value's syntax is checked here; bounds are enforced when the
    /// setting is applied.
    pub fn parse(name: &str, value: &str) -> Result<Self, ConfigError> {
        let parameter = Parameter::from_str(name.trim())
            .map_err(|_| ConfigError::UnknownParameter(name.trim().to_string()))?;
        let field = parameter.name();
        let value = value.trim();
        let invalid = |reason: String| ConfigError::InvalidValue { field, reason };

        Ok(match parameter {
            Parameter::Enabled => Self::Enabled(
                value
                    .parse()
                    .map_err(|e: std::str::ParseBoolError| invalid(e.to_string()))?,
            ),
            Parameter::Directory => {
                if value.is_empty() {
                    return Err(invalid("directory is empty".to_string()));
                }
                Self::Directory(PathBuf::from(value))
            }
            Parameter::Period => Self::Period(parse_duration(value).map_err(invalid)?),
            Parameter::MaxDirectorySizeBytes => {
                Self::MaxDirectorySizeBytes(parse_byte_size(value).map_err(invalid)?)
            }
            Parameter::MaxFileSizeBytes => {
                Self::MaxFileSizeBytes(parse_byte_size(value).map_err(invalid)?)
            }
            Parameter::MaxSamplesPerArchiveChunk => Self::MaxSamplesPerArchiveChunk(
                value
                    .parse()
                    .map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?,
            ),
            Parameter::MaxSamplesPerInterimChunk => Self::MaxSamplesPerInterimChunk(
                value
                    .parse()
                    .map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?,
            ),
        })
    }
}

/// Parses `name=value`.
impl FromStr for Setting {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            field: "setting",
            reason: format!("expected name=value, got '{s}'"),
        })?;
        Self::parse(name, value)
    }
}

// =============================================================================
// Pending store
// =============================================================================

/// Staging copy of the configuration written by caller threads.
///
/// Every accepted change bumps the version; the sampling loop copies the
/// whole snapshot into its active configuration once per wake.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    pending: Configuration,
    version: u64,
}

impl ConfigStore {
    pub fn new(initial: Configuration) -> Self {
        Self {
            pending: initial,
            version: 0,
        }
    }

    /// Apply a setting to the pending configuration.
    ///
    /// A rejected setting leaves the pending configuration and the version
    /// untouched.
    pub fn apply(&mut self, setting: Setting) -> Result<(), ConfigError> {
        self.pending.apply(setting)?;
        self.version += 1;
        Ok(())
    }

    /// Clear the enabled flag (used on shutdown).
    pub fn disable(&mut self) {
        self.pending.enabled = false;
        self.version += 1;
    }

    pub fn pending(&self) -> &Configuration {
        &self.pending
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Copy of the pending configuration and its version.
    pub fn snapshot(&self) -> (u64, Configuration) {
        (self.version, self.pending.clone())
    }
}
