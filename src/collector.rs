//! Collector Layer
//!
//! Pluggable producers of structured documents, merged into one timestamped
//! [`Sample`] per sampling cycle.
//!
//! # Architecture
//!
//! - [`Collector`]: Core trait for implementing data collectors
//! - [`CollectorRegistry`]: Ordered collector list, runs them and merges the result
//! - [`Sample`]: Timestamp-bracketed result of one collection
//! - [`system`]: Built-in process, host and build-info collectors
//!
//! # Example
//!
//! ```rust
//! use diagcap::collector::{CollectContext, CollectorRegistry, Document, FnCollector};
//!
//! let mut registry = CollectorRegistry::new();
//! registry.add(Box::new(FnCollector::new("answer", |_: &CollectContext| {
//!     let mut doc = Document::new();
//!     doc.insert("value".into(), 42.into());
//!     Ok(doc)
//! })));
//!
//! let sample = registry.collect(&CollectContext::periodic(1)).unwrap();
//! assert_eq!(sample.entries.len(), 1);
//! ```

mod registry;
pub mod system;
mod traits;

pub use registry::{CollectorRegistry, END_FIELD, START_FIELD, Sample, SampleEntry};
pub use traits::{CollectContext, CollectKind, Collector, CollectorError, Document, FnCollector};
