//! Background sampling loop.
//!
//! One thread owns the collectors, the sink factory and, once created, the
//! sink. It sleeps until the next aligned tick or until the controller signals
//! a configuration change or a stop, whichever comes first.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use crate::collector::{CollectContext, CollectorRegistry};
use crate::config::{ConfigError, Configuration};
use crate::controller::schedule::{Cadence, time_until};
use crate::controller::{CaptureError, ControllerState, FatalHandler, Setup, Shared};
use crate::sink::{PersistenceSink, SinkFactory};

/// What ended a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    /// The controller changed the configuration or requested a stop.
    Signal,
    /// The scheduled tick arrived.
    Tick,
    /// The controller is gone.
    Disconnected,
}

pub(super) struct SamplingLoop {
    shared: Arc<Mutex<Shared>>,
    rx: Receiver<()>,
    periodic: CollectorRegistry,
    /// Handed to the sink factory on first use.
    on_rotate: Option<CollectorRegistry>,
    factory: Box<dyn SinkFactory>,
    sink: Option<Box<dyn PersistenceSink>>,
    active: Configuration,
    active_version: u64,
    cadence: Cadence,
    cycle: u64,
    fatal: FatalHandler,
}

impl SamplingLoop {
    pub(super) fn new(shared: Arc<Mutex<Shared>>, setup: Setup, fatal: FatalHandler) -> Self {
        Self {
            shared,
            rx: setup.wake_rx,
            periodic: setup.periodic,
            on_rotate: Some(setup.on_rotate),
            factory: setup.factory,
            sink: None,
            active: Configuration::default(),
            active_version: 0,
            cadence: Cadence::default(),
            cycle: 0,
            fatal,
        }
    }

    /// Run until a stop is requested or a cycle fails.
    ///
    /// Returns the sink, if one was created, so the controller can close it
    /// after joining.
    pub(super) fn run(mut self) -> Option<Box<dyn PersistenceSink>> {
        tracing::info!(periodic = self.periodic.len(), "Sampling loop started");

        if self.sync_configuration() {
            loop {
                let tick = self.cadence.next_tick(Utc::now(), self.active.period());
                let wake = self.wait(time_until(tick));

                if !self.sync_configuration() {
                    break;
                }

                match wake {
                    Wake::Signal => continue,
                    Wake::Disconnected => {
                        tracing::warn!("Controller dropped, stopping sampling loop");
                        break;
                    }
                    Wake::Tick => {}
                }

                self.cadence.mark_fired(tick);
                if !self.active.enabled() {
                    continue;
                }

                if let Err(e) = self.run_cycle() {
                    tracing::error!(cycle = self.cycle, error = %e, "Sampling cycle failed");
                    (self.fatal)(&e);
                    break;
                }
            }
        }

        tracing::info!(cycles = self.cycle, "Sampling loop stopped");
        self.sink.take()
    }

    fn wait(&self, timeout: Duration) -> Wake {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Wake::Signal,
            Err(RecvTimeoutError::Timeout) => Wake::Tick,
            Err(RecvTimeoutError::Disconnected) => Wake::Disconnected,
        }
    }

    /// Copy the pending configuration into the active one.
    ///
    /// Returns `false` once a stop has been requested; the configuration is
    /// left alone in that case.
    fn sync_configuration(&mut self) -> bool {
        let (version, config) = {
            let shared = self.shared.lock();
            if shared.state == ControllerState::StopRequested {
                return false;
            }
            shared.store.snapshot()
        };

        if version != self.active_version {
            tracing::debug!(
                version,
                enabled = config.enabled(),
                period = ?config.period(),
                "Active configuration updated"
            );
        }
        self.active = config;
        self.active_version = version;
        true
    }

    fn run_cycle(&mut self) -> Result<(), CaptureError> {
        self.cycle += 1;
        let started = Instant::now();
        let ctx = CollectContext::periodic(self.cycle);

        if self.sink.is_none() {
            self.sink = Some(self.open_sink(&ctx)?);
        }

        let sample = self.periodic.collect(&ctx)?;
        if sample.is_empty() {
            tracing::trace!(cycle = self.cycle, "No periodic collectors, nothing to persist");
            return Ok(());
        }

        let document = sample.to_document();
        if let Some(sink) = self.sink.as_mut() {
            sink.write(&ctx, &self.active, &document, sample.start)?;
        }
        self.shared.lock().most_recent = document;

        tracing::debug!(
            cycle = self.cycle,
            collectors = sample.entries.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Sample captured"
        );
        Ok(())
    }

    fn open_sink(
        &mut self,
        ctx: &CollectContext,
    ) -> Result<Box<dyn PersistenceSink>, CaptureError> {
        let directory: PathBuf = self
            .active
            .directory()
            .ok_or(ConfigError::PathNotSet)?
            .to_path_buf();
        let on_rotate = self.on_rotate.take().unwrap_or_default();

        let sink = self
            .factory
            .create(&self.active, &directory, on_rotate, ctx)?;
        tracing::info!(directory = %directory.display(), "Persistence sink opened");
        Ok(sink)
    }
}
