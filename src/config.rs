//! Configuration for diagnostic capture.
//!
//! - [`Configuration`]: validated capture settings (period, size budgets, directory)
//! - [`ConfigStore`]: pending configuration written by caller threads
//! - [`Setting`] / [`Parameter`]: named runtime options
//! - [`CaptureConfig`]: YAML startup file

mod app;
mod store;
mod validation;

pub use app::CaptureConfig;
pub use store::{ConfigStore, Configuration, Parameter, Setting};
pub use validation::{ConfigError, parse_byte_size, parse_duration};

// Re-export constants
pub use store::{
    DEFAULT_MAX_DIRECTORY_SIZE_BYTES, DEFAULT_MAX_FILE_SIZE_BYTES,
    DEFAULT_MAX_SAMPLES_PER_ARCHIVE_CHUNK, DEFAULT_MAX_SAMPLES_PER_INTERIM_CHUNK, DEFAULT_PERIOD,
};
pub use validation::{
    MIN_DIRECTORY_SIZE_BYTES, MIN_FILE_SIZE_BYTES, MIN_PERIOD, MIN_SAMPLES_PER_CHUNK,
};
