//! Configuration errors, lower bounds and value parsing.

use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Minimum sampling period (100 milliseconds).
pub const MIN_PERIOD: Duration = Duration::from_millis(100);

/// Minimum disk budget for the output directory (10 MiB).
pub const MIN_DIRECTORY_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Minimum size of a single output file before rotation (1 MiB).
pub const MIN_FILE_SIZE_BYTES: u64 = 1024 * 1024;

/// Minimum number of samples per archive or interim chunk.
pub const MIN_SAMPLES_PER_CHUNK: usize = 2;

/// Configuration error types.
///
/// All variants are recoverable: they are returned to the caller of the
/// offending setter and never reach the sampling loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Capture was enabled before an output directory was configured.
    #[error("capture cannot be enabled before the output directory is set")]
    PathNotSet,

    /// The output directory was already configured.
    #[error("capture directory is already set to '{}' and cannot be changed", .0.display())]
    PathAlreadySet(PathBuf),

    /// A numeric value is below its lower bound.
    #[error("{field} must be at least {min}, got {value}")]
    OutOfBounds {
        field: &'static str,
        value: String,
        min: String,
    },

    /// No runtime parameter with this name exists.
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    /// A parameter value could not be parsed.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// Reject `value` when it is below `min`.
pub fn at_least<T: PartialOrd + Display>(
    field: &'static str,
    value: T,
    min: T,
) -> Result<T, ConfigError> {
    if value < min {
        return Err(ConfigError::OutOfBounds {
            field,
            value: value.to_string(),
            min: min.to_string(),
        });
    }
    Ok(value)
}

/// Reject sampling periods shorter than [`MIN_PERIOD`].
pub fn check_period(period: Duration) -> Result<Duration, ConfigError> {
    if period < MIN_PERIOD {
        return Err(ConfigError::OutOfBounds {
            field: "period",
            value: humantime::format_duration(period).to_string(),
            min: humantime::format_duration(MIN_PERIOD).to_string(),
        });
    }
    Ok(period)
}

/// Parse duration string using humantime.
///
/// Supports various formats: `100ms`, `1s`, `5m30s`, `1h`, etc.
///
/// # Examples
///
/// ```
/// use diagcap::config::parse_duration;
///
/// assert_eq!(parse_duration("100ms").unwrap().as_millis(), 100);
/// assert_eq!(parse_duration("1m").unwrap().as_secs(), 60);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Parse a byte count with an optional binary unit suffix.
///
/// Accepts plain integers (`10485760`) and `KB`, `MB`, `GB` suffixes, which
/// are interpreted as powers of 1024 (`200MB` = 200 MiB).
pub fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("size string is empty".to_string());
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size '{s}': {e}"))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "KIB" => 1024,
        "MB" | "MIB" => 1024 * 1024,
        "GB" | "GIB" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit '{other}'")),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{s}' overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_valid() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("30").is_err());
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
        assert_eq!(parse_byte_size("10MB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_byte_size("2 gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("4KiB").unwrap(), 4096);
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("MB").is_err());
        assert!(parse_byte_size("10XB").is_err());
    }

    #[test]
    fn test_bounds() {
        assert_eq!(at_least("chunk", 2usize, MIN_SAMPLES_PER_CHUNK).unwrap(), 2);
        let err = at_least("chunk", 1usize, MIN_SAMPLES_PER_CHUNK).unwrap_err();
        assert!(err.to_string().contains("chunk must be at least 2"));

        assert!(check_period(MIN_PERIOD).is_ok());
        let err = check_period(Duration::from_millis(99)).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfBounds { field: "period", .. }));
    }
}
