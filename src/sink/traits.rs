//! Persistence sink contract.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::collector::{CollectContext, CollectorRegistry, Document};
use crate::config::Configuration;
use crate::sink::SinkError;

/// Creates the persistence sink on the first enabled sampling cycle.
pub trait SinkFactory: Send + 'static {
    /// Open a sink writing under `directory`.
    ///
    /// `on_rotate` is handed over for good: the sink samples it whenever it
    /// starts a new output file.
    fn create(
        &mut self,
        config: &Configuration,
        directory: &Path,
        on_rotate: CollectorRegistry,
        ctx: &CollectContext,
    ) -> Result<Box<dyn PersistenceSink>, SinkError>;
}

impl<F> SinkFactory for F
where
    F: FnMut(
            &Configuration,
            &Path,
            CollectorRegistry,
            &CollectContext,
        ) -> Result<Box<dyn PersistenceSink>, SinkError>
        + Send
        + 'static,
{
    fn create(
        &mut self,
        config: &Configuration,
        directory: &Path,
        on_rotate: CollectorRegistry,
        ctx: &CollectContext,
    ) -> Result<Box<dyn PersistenceSink>, SinkError> {
        self(config, directory, on_rotate, ctx)
    }
}

/// Accepts merged sample documents and rotates its output as thresholds are
/// crossed.
///
/// `write` receives the sampling loop's active configuration on every call,
/// so threshold changes apply to an already-open sink from the next write.
pub trait PersistenceSink: Send {
    fn write(
        &mut self,
        ctx: &CollectContext,
        config: &Configuration,
        document: &Document,
        ts: DateTime<Utc>,
    ) -> Result<(), SinkError>;

    /// Flush and release resources. Called once at shutdown.
    fn close(&mut self) -> Result<(), SinkError>;
}
