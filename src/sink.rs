//! Persistence Layer
//!
//! The sampling loop hands every merged sample to a [`PersistenceSink`],
//! created lazily through a [`SinkFactory`] on the first enabled cycle.
//!
//! # Components
//!
//! - [`SinkFactory`] / [`PersistenceSink`]: the contract the controller relies on
//! - [`SinkError`]: persistence failures (fatal to the sampling loop)
//! - [`FileSinkFactory`] / [`FileSink`]: rotating JSON-lines implementation

mod error;
pub mod file;
mod traits;

pub use error::SinkError;
pub use file::{ArchiveRecord, ArchivedSample, FileSink, FileSinkFactory, read_archive};
pub use traits::{PersistenceSink, SinkFactory};
