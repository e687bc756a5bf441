//! Ordered collector registry and sample merging.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::collector::{CollectContext, Collector, CollectorError, Document};

/// Field holding the time a sample or entry began.
pub const START_FIELD: &str = "start";
/// Field holding the time a sample or entry finished.
pub const END_FIELD: &str = "end";

/// One collector's output within a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleEntry {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub document: Document,
}

/// The timestamp-bracketed result of one collection across all collectors.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub start: DateTime<Utc>,
    pub entries: Vec<SampleEntry>,
    pub end: DateTime<Utc>,
}

impl Sample {
    /// The "nothing to persist" sentinel: epoch timestamps, no entries.
    pub fn empty() -> Self {
        Self {
            start: DateTime::UNIX_EPOCH,
            entries: Vec::new(),
            end: DateTime::UNIX_EPOCH,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge the entries into a single document.
    ///
    /// Layout: `{ start, <name>: { start, ...fields, end }, ..., end }` in
    /// registration order. Nothing is dropped on a key collision: a repeated
    /// collector name, or a collector field named `start` or `end`, is kept
    /// under the first free `<key>#<n>`. The empty sentinel yields an empty
    /// document.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if self.is_empty() {
            return doc;
        }

        doc.insert(START_FIELD.into(), timestamp(self.start));
        for entry in &self.entries {
            let mut sub = Document::new();
            sub.insert(START_FIELD.into(), timestamp(entry.start));
            for (key, value) in &entry.document {
                sub.insert(unique_key(&sub, key, &entry.name), value.clone());
            }
            sub.insert(END_FIELD.into(), timestamp(entry.end));
            doc.insert(unique_key(&doc, &entry.name, &entry.name), Value::Object(sub));
        }
        doc.insert(END_FIELD.into(), timestamp(self.end));

        doc
    }
}

/// `key` if it is free in `doc` and not a timing field, else `key#<n>`.
fn unique_key(doc: &Document, key: &str, collector: &str) -> String {
    if key != START_FIELD && key != END_FIELD && !doc.contains_key(key) {
        return key.to_string();
    }

    let mut n = 1;
    let mut renamed = format!("{key}#{n}");
    while doc.contains_key(&renamed) {
        n += 1;
        renamed = format!("{key}#{n}");
    }
    tracing::debug!(key, renamed = %renamed, collector, "Key collision in merged sample");
    renamed
}

fn timestamp(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
}

/// Ordered list of collectors sampled together.
///
/// Collectors are run in registration order. Name uniqueness is up to the
/// caller; a duplicate name is merged under a `#<n>` suffix (see
/// [`Sample::to_document`]).
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: Vec<Box<dyn Collector>>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("collectors", &self.names())
            .finish()
    }
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a collector.
    pub fn add(&mut self, collector: Box<dyn Collector>) {
        tracing::debug!(collector = %collector.name(), "Collector registered");
        self.collectors.push(collector);
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Collector names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    /// Run every collector once and bracket the results with timestamps.
    ///
    /// Returns [`Sample::empty`] without side effects when no collectors are
    /// registered. The first failing collector aborts the whole collection.
    pub fn collect(&mut self, ctx: &CollectContext) -> Result<Sample, CollectorError> {
        if self.collectors.is_empty() {
            return Ok(Sample::empty());
        }

        let start = Utc::now();
        let mut entries = Vec::with_capacity(self.collectors.len());

        for (index, collector) in self.collectors.iter_mut().enumerate() {
            let begin = if index == 0 { start } else { Utc::now() };
            let document = collector.collect(ctx)?;
            let end = Utc::now();

            tracing::trace!(
                collector = %collector.name(),
                elapsed_us = (end - begin).num_microseconds(),
                "Collector finished"
            );

            entries.push(SampleEntry {
                name: collector.name().to_string(),
                start: begin,
                end,
                document,
            });
        }

        let end = entries.last().map_or(start, |e| e.end);
        Ok(Sample {
            start,
            entries,
            end,
        })
    }
}
