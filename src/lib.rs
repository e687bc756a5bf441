//! Diagcap - Background Diagnostic Capture
//!
//! A small library that periodically samples a set of collectors on a
//! dedicated thread, merges their output into one timestamped document and
//! persists it to a size-bounded, rotating set of files.
//!
//! # Architecture
//!
//! - **Collectors**: named producers of one document per sample
//! - **Controller**: lifecycle, pending configuration and the sampling thread
//! - **Sink**: chunked, crash-recoverable file output with rotation and pruning
//! - **Config**: validated runtime settings and a YAML startup file
//!
//! # Example
//!
//! ```no_run
//! use diagcap::collector::system::{BuildInfoCollector, HostCollector};
//! use diagcap::{Controller, FileSinkFactory};
//!
//! let controller = Controller::new(FileSinkFactory);
//! controller.add_periodic_collector(HostCollector);
//! controller.add_on_rotate_collector(BuildInfoCollector);
//! controller.set_directory("./diagnostic.data")?;
//! controller.set_enabled(true)?;
//! controller.start()?;
//!
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! println!("{:?}", controller.most_recent_document());
//! controller.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod collector;
pub mod config;
pub mod controller;
pub mod sink;

pub use collector::{CollectContext, Collector, CollectorError, CollectorRegistry, Document};
pub use config::{CaptureConfig, ConfigError, Configuration, Parameter, Setting};
pub use controller::{CaptureError, Controller, ControllerState, FatalHandler};
pub use sink::{FileSink, FileSinkFactory, PersistenceSink, SinkError, SinkFactory};
