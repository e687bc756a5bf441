//! Built-in process and host collectors.
//!
//! Linux-specific sources under `/proc` are optional: on other platforms the
//! corresponding fields are simply omitted.

use std::io::ErrorKind;
use std::time::Instant;

use serde_json::{Value, json};

use crate::collector::{CollectContext, Collector, CollectorError, Document};

const PROC_SELF_STATUS: &str = "/proc/self/status";
const PROC_LOADAVG: &str = "/proc/loadavg";

/// Read a file, treating "not found" as absent.
fn read_optional(path: &str) -> Result<Option<String>, CollectorError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Current process: pid, uptime and, on Linux, thread count and memory.
#[derive(Debug)]
pub struct ProcessCollector {
    started: Instant,
}

impl ProcessCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ProcessCollector {
    fn name(&self) -> &str {
        "process"
    }

    fn collect(&mut self, _ctx: &CollectContext) -> Result<Document, CollectorError> {
        let mut doc = Document::new();
        doc.insert("pid".into(), std::process::id().into());
        doc.insert(
            "uptimeMillis".into(),
            json!(self.started.elapsed().as_millis() as u64),
        );

        if let Some(status) = read_optional(PROC_SELF_STATUS)? {
            for (key, field) in [
                ("Threads:", "threads"),
                ("VmRSS:", "residentKb"),
                ("VmSize:", "virtualKb"),
            ] {
                if let Some(value) = parse_status_value(&status, key) {
                    doc.insert(field.into(), value.into());
                }
            }
        }

        Ok(doc)
    }
}

/// Pull the leading integer from a `/proc/self/status` line such as
/// `VmRSS:     1234 kB`.
fn parse_status_value(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

/// Host: OS, architecture, CPU count and, on Linux, load averages.
#[derive(Debug, Default)]
pub struct HostCollector;

impl Collector for HostCollector {
    fn name(&self) -> &str {
        "host"
    }

    fn collect(&mut self, _ctx: &CollectContext) -> Result<Document, CollectorError> {
        let mut doc = Document::new();
        doc.insert("os".into(), std::env::consts::OS.into());
        doc.insert("arch".into(), std::env::consts::ARCH.into());
        if let Ok(cpus) = std::thread::available_parallelism() {
            doc.insert("cpus".into(), cpus.get().into());
        }

        if let Some(loadavg) = read_optional(PROC_LOADAVG)? {
            let averages: Vec<Value> = loadavg
                .split_whitespace()
                .take(3)
                .filter_map(|v| v.parse::<f64>().ok())
                .map(Value::from)
                .collect();
            if averages.len() == 3 {
                doc.insert("loadAverage".into(), Value::Array(averages));
            }
        }

        Ok(doc)
    }
}

/// Static build information, written at the head of every output file.
#[derive(Debug, Default)]
pub struct BuildInfoCollector;

impl Collector for BuildInfoCollector {
    fn name(&self) -> &str {
        "buildInfo"
    }

    fn collect(&mut self, _ctx: &CollectContext) -> Result<Document, CollectorError> {
        let mut doc = Document::new();
        doc.insert("name".into(), env!("CARGO_PKG_NAME").into());
        doc.insert("version".into(), env!("CARGO_PKG_VERSION").into());
        doc.insert("os".into(), std::env::consts::OS.into());
        doc.insert("arch".into(), std::env::consts::ARCH.into());
        Ok(doc)
    }
}
