//! Core collector traits and types.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A structured document produced by a collector or merged into a sample.
///
/// Key order is insertion order, so merged samples keep collector
/// registration order.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Errors that can occur during collection.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The collector could not produce its document.
    #[error("collector '{name}' failed: {reason}")]
    Failed { name: String, reason: String },

    /// I/O error while reading a data source.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CollectorError {
    pub fn failed(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Failed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why a collection is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectKind {
    /// Regular sampling tick.
    Periodic,
    /// Start of a new output file.
    Rotate,
}

/// Context handed to collectors and to the persistence sink.
#[derive(Debug, Clone)]
pub struct CollectContext {
    /// Sampling cycle number, starting at 1.
    pub cycle: u64,
    /// What triggered the collection.
    pub kind: CollectKind,
    /// Wall-clock time the cycle began.
    pub started_at: DateTime<Utc>,
}

impl CollectContext {
    pub fn periodic(cycle: u64) -> Self {
        Self {
            cycle,
            kind: CollectKind::Periodic,
            started_at: Utc::now(),
        }
    }

    /// Same cycle, re-tagged for an on-rotate collection.
    pub fn for_rotation(&self) -> Self {
        Self {
            kind: CollectKind::Rotate,
            ..self.clone()
        }
    }
}

/// A named producer of one document per collection.
///
/// Collectors run on the sampling thread while the rest of the system keeps
/// running. They must not mutate global state and must tolerate observing
/// other subsystems mid-change.
///
/// Returning `Err` aborts the whole sampling cycle; there is no partial
/// sample.
pub trait Collector: Send + 'static {
    /// Name of the sub-document in the merged sample.
    fn name(&self) -> &str;

    /// Produce this collector's document.
    fn collect(&mut self, ctx: &CollectContext) -> Result<Document, CollectorError>;
}

/// Adapts a closure into a [`Collector`].
///
/// ```
/// use diagcap::collector::{CollectContext, Document, FnCollector};
///
/// let collector = FnCollector::new("cycle", |ctx: &CollectContext| {
///     let mut doc = Document::new();
///     doc.insert("n".into(), ctx.cycle.into());
///     Ok(doc)
/// });
/// ```
pub struct FnCollector<F> {
    name: String,
    f: F,
}

impl<F> FnCollector<F>
where
    F: FnMut(&CollectContext) -> Result<Document, CollectorError> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Collector for FnCollector<F>
where
    F: FnMut(&CollectContext) -> Result<Document, CollectorError> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&mut self, ctx: &CollectContext) -> Result<Document, CollectorError> {
        (self.f)(ctx)
    }
}

impl<F> fmt::Debug for FnCollector<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCollector")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
