//! Diagnostic capture controller.
//!
//! The [`Controller`] owns a single background thread that periodically runs
//! the registered collectors, merges their output into one document and hands
//! it to a persistence sink. Configuration changes are staged in a pending
//! copy and picked up by the loop on its next wake.
//!
//! ```no_run
//! use std::time::Duration;
//! use diagcap::collector::system::ProcessCollector;
//! use diagcap::controller::Controller;
//! use diagcap::sink::FileSinkFactory;
//!
//! let controller = Controller::new(FileSinkFactory);
//! controller.add_periodic_collector(ProcessCollector::new());
//! controller.set_directory("/var/lib/app/diagnostic.data")?;
//! controller.set_period(Duration::from_secs(1))?;
//! controller.set_enabled(true)?;
//! controller.start()?;
//! // ...
//! controller.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod sampler;
mod schedule;
mod state;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::collector::{Collector, CollectorError, CollectorRegistry, Document};
use crate::config::{ConfigError, ConfigStore, Configuration, Setting};
use crate::sink::{PersistenceSink, SinkError, SinkFactory};

use sampler::SamplingLoop;
pub use schedule::{Cadence, next_fire_time, time_until};
pub use state::ControllerState;

const THREAD_NAME: &str = "diagcap-sampler";

/// Errors surfaced by the capture subsystem.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("collection failed: {0}")]
    Collector(#[from] CollectorError),

    #[error("persistence failed: {0}")]
    Sink(#[from] SinkError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn sampling thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Invoked on the sampling thread when a cycle fails.
///
/// The sampling loop exits after the handler returns.
pub type FatalHandler = Arc<dyn Fn(&CaptureError) + Send + Sync>;

/// Default fatal handler: log, then abort the process.
pub fn abort_on_fatal(err: &CaptureError) {
    tracing::error!(error = %err, "Diagnostic capture failed, aborting");
    eprintln!("fatal: diagnostic capture failed: {err}");
    std::process::abort();
}

/// Everything the sampling thread takes ownership of at start.
struct Setup {
    wake_rx: Receiver<()>,
    periodic: CollectorRegistry,
    on_rotate: CollectorRegistry,
    factory: Box<dyn SinkFactory>,
}

/// State shared between the controller and the sampling thread.
struct Shared {
    state: ControllerState,
    store: ConfigStore,
    most_recent: Document,
    /// Present until the loop is started.
    setup: Option<Setup>,
}

impl Shared {
    fn new(initial: Configuration) -> Self {
        Self {
            state: ControllerState::NotStarted,
            store: ConfigStore::new(initial),
            most_recent: Document::new(),
            setup: None,
        }
    }
}

/// Controls the background diagnostic capture thread.
///
/// All methods take `&self` and are safe to call from any thread.
pub struct Controller {
    shared: Arc<Mutex<Shared>>,
    wake_tx: SyncSender<()>,
    thread: Mutex<Option<JoinHandle<Option<Box<dyn PersistenceSink>>>>>,
    fatal: FatalHandler,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Controller")
            .field("state", &shared.state)
            .field("config", shared.store.pending())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Create a controller with the default configuration.
    pub fn new(factory: impl SinkFactory) -> Self {
        Self::with_configuration(factory, Configuration::default())
    }

    /// Create a controller whose pending configuration starts at `initial`.
    pub fn with_configuration(factory: impl SinkFactory, initial: Configuration) -> Self {
        // Capacity 1: signals coalesce while the loop is busy.
        let (wake_tx, wake_rx) = mpsc::sync_channel(1);

        let mut shared = Shared::new(initial);
        shared.setup = Some(Setup {
            wake_rx,
            periodic: CollectorRegistry::new(),
            on_rotate: CollectorRegistry::new(),
            factory: Box::new(factory),
        });

        Self {
            shared: Arc::new(Mutex::new(shared)),
            wake_tx,
            thread: Mutex::new(None),
            fatal: Arc::new(abort_on_fatal),
        }
    }

    /// Replace the fatal handler.
    ///
    /// # Panics
    /// Panics if the controller has left [`ControllerState::NotStarted`].
    pub fn with_fatal_handler(
        mut self,
        handler: impl Fn(&CaptureError) + Send + Sync + 'static,
    ) -> Self {
        assert_eq!(
            self.state(),
            ControllerState::NotStarted,
            "fatal handler must be installed before start"
        );
        self.fatal = Arc::new(handler);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.shared.lock().state
    }

    /// Copy of the pending configuration.
    pub fn configuration(&self) -> Configuration {
        self.shared.lock().store.pending().clone()
    }

    /// Last merged sample document, or an empty document if none yet.
    ///
    /// The returned value is an independent copy.
    pub fn most_recent_document(&self) -> Document {
        self.shared.lock().most_recent.clone()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Set the output directory. Allowed once.
    ///
    /// The loop is not woken: the directory is only consulted when the sink
    /// is first created.
    pub fn set_directory(&self, path: impl Into<PathBuf>) -> Result<(), ConfigError> {
        self.update(Setting::Directory(path.into()))
    }

    /// Enable or disable sampling. Enabling requires a directory.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), ConfigError> {
        self.update(Setting::Enabled(enabled))
    }

    pub fn set_period(&self, period: Duration) -> Result<(), ConfigError> {
        self.update(Setting::Period(period))
    }

    pub fn set_max_directory_size_bytes(&self, bytes: u64) -> Result<(), ConfigError> {
        self.update(Setting::MaxDirectorySizeBytes(bytes))
    }

    pub fn set_max_file_size_bytes(&self, bytes: u64) -> Result<(), ConfigError> {
        self.update(Setting::MaxFileSizeBytes(bytes))
    }

    pub fn set_max_samples_per_archive_chunk(&self, samples: usize) -> Result<(), ConfigError> {
        self.update(Setting::MaxSamplesPerArchiveChunk(samples))
    }

    pub fn set_max_samples_per_interim_chunk(&self, samples: usize) -> Result<(), ConfigError> {
        self.update(Setting::MaxSamplesPerInterimChunk(samples))
    }

    /// Apply any [`Setting`].
    pub fn apply(&self, setting: Setting) -> Result<(), ConfigError> {
        self.update(setting)
    }

    fn update(&self, setting: Setting) -> Result<(), ConfigError> {
        let parameter = setting.parameter();
        let wake = !matches!(setting, Setting::Directory(_));

        {
            let mut shared = self.shared.lock();
            if let Err(e) = shared.store.apply(setting) {
                tracing::warn!(parameter = %parameter, error = %e, "Configuration change rejected");
                return Err(e);
            }
        }
        tracing::debug!(parameter = %parameter, "Configuration change staged");

        if wake {
            self.signal();
        }
        Ok(())
    }

    /// Wake the sampling loop. Extra signals coalesce.
    fn signal(&self) {
        match self.wake_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::trace!("Sampling loop not running, signal dropped");
            }
        }
    }

    // =========================================================================
    // Collectors
    // =========================================================================

    /// Register a collector sampled every period.
    ///
    /// # Panics
    /// Panics if the controller has left [`ControllerState::NotStarted`].
    pub fn add_periodic_collector(&self, collector: impl Collector) {
        let mut shared = self.shared.lock();
        assert_eq!(
            shared.state,
            ControllerState::NotStarted,
            "periodic collectors must be added before start"
        );
        if let Some(setup) = shared.setup.as_mut() {
            setup.periodic.add(Box::new(collector));
        }
    }

    /// Register a collector sampled whenever the sink starts a new file.
    ///
    /// # Panics
    /// Panics if the controller has left [`ControllerState::NotStarted`].
    pub fn add_on_rotate_collector(&self, collector: impl Collector) {
        let mut shared = self.shared.lock();
        assert_eq!(
            shared.state,
            ControllerState::NotStarted,
            "on-rotate collectors must be added before start"
        );
        if let Some(setup) = shared.setup.as_mut() {
            setup.on_rotate.add(Box::new(collector));
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the sampling thread.
    ///
    /// A spawn failure moves the controller straight to
    /// [`ControllerState::Done`].
    ///
    /// # Panics
    /// Panics if called more than once.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut shared = self.shared.lock();
        assert_eq!(
            shared.state,
            ControllerState::NotStarted,
            "diagnostic capture controller started twice"
        );
        let Some(setup) = shared.setup.take() else {
            panic!("diagnostic capture controller setup missing before start");
        };

        tracing::info!(
            enabled = shared.store.pending().enabled(),
            directory = ?shared.store.pending().directory(),
            "Starting diagnostic capture"
        );

        let sampling = SamplingLoop::new(Arc::clone(&self.shared), setup, Arc::clone(&self.fatal));
        match thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || sampling.run())
        {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                shared.state.transition(ControllerState::Started);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn sampling thread");
                shared.state.transition(ControllerState::Done);
                Err(CaptureError::Spawn(e))
            }
        }
    }

    /// Stop sampling, join the thread and close the sink.
    ///
    /// Stopping before start simply marks the controller done. Repeated calls
    /// are no-ops.
    pub fn stop(&self) {
        {
            let mut shared = self.shared.lock();
            match shared.state {
                ControllerState::NotStarted => {
                    tracing::info!("Diagnostic capture stopped before start");
                    shared.state.transition(ControllerState::Done);
                    shared.setup = None;
                    return;
                }
                ControllerState::Started => {
                    tracing::info!("Stopping diagnostic capture");
                    shared.store.disable();
                    shared.state.transition(ControllerState::StopRequested);
                }
                ControllerState::StopRequested | ControllerState::Done => {
                    tracing::debug!(state = %shared.state, "Stop already requested");
                    return;
                }
            }
        }

        self.signal();

        let handle = self.thread.lock().take();
        let sink = match handle.map(JoinHandle::join) {
            Some(Ok(sink)) => sink,
            Some(Err(_)) => {
                tracing::error!("Sampling thread panicked");
                None
            }
            None => None,
        };

        self.shared.lock().state.transition(ControllerState::Done);

        if let Some(mut sink) = sink {
            if let Err(e) = sink.close() {
                tracing::warn!(error = %e, "Failed to close persistence sink");
            }
        }
        tracing::info!("Diagnostic capture stopped");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.state() == ControllerState::Started {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectContext, FnCollector};
    use std::path::Path;

    fn failing_factory(
        _config: &Configuration,
        dir: &Path,
        _on_rotate: CollectorRegistry,
        _ctx: &CollectContext,
    ) -> Result<Box<dyn PersistenceSink>, SinkError> {
        Err(SinkError::io(dir)(std::io::Error::other("unused")))
    }

    fn controller() -> Controller {
        Controller::new(failing_factory).with_fatal_handler(|_| {})
    }

    #[test]
    fn test_initial_state() {
        let controller = controller();
        assert_eq!(controller.state(), ControllerState::NotStarted);
        assert!(controller.most_recent_document().is_empty());
        assert!(!controller.configuration().enabled());
    }

    #[test]
    fn test_setters_update_pending() {
        let controller = controller();
        controller.set_directory("/tmp/diagcap").unwrap();
        controller.set_period(Duration::from_millis(500)).unwrap();
        controller.set_enabled(true).unwrap();
        controller.set_max_samples_per_interim_chunk(4).unwrap();

        let config = controller.configuration();
        assert!(config.enabled());
        assert_eq!(config.period(), Duration::from_millis(500));
        assert_eq!(config.directory(), Some(Path::new("/tmp/diagcap")));
        assert_eq!(config.max_samples_per_interim_chunk(), 4);
    }

    #[test]
    fn test_rejected_setter_leaves_pending() {
        let controller = controller();
        assert!(matches!(
            controller.set_enabled(true),
            Err(ConfigError::PathNotSet)
        ));
        assert!(controller.set_period(Duration::from_millis(1)).is_err());

        let config = controller.configuration();
        assert!(!config.enabled());
        assert_eq!(config.period(), Duration::from_secs(1));
    }

    #[test]
    fn test_stop_before_start() {
        let controller = controller();
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Done);
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Done);
    }

    #[test]
    fn test_start_then_stop() {
        let controller = controller();
        controller.start().unwrap();
        assert_eq!(controller.state(), ControllerState::Started);
        controller.stop();
        assert_eq!(controller.state(), ControllerState::Done);
        assert!(!controller.configuration().enabled());
    }

    #[test]
    #[should_panic(expected = "started twice")]
    fn test_double_start_panics() {
        let controller = controller();
        controller.start().unwrap();
        let _ = controller.start();
    }

    #[test]
    #[should_panic(expected = "must be added before start")]
    fn test_add_collector_after_start_panics() {
        let controller = controller();
        controller.start().unwrap();
        controller.add_periodic_collector(FnCollector::new("late", |_: &CollectContext| {
            Ok(Document::new())
        }));
    }

    #[test]
    #[should_panic(expected = "fatal handler must be installed before start")]
    fn test_fatal_handler_after_start_panics() {
        let controller = controller();
        controller.start().unwrap();
        let _ = controller.with_fatal_handler(|_| {});
    }

    #[test]
    #[should_panic(expected = "fatal handler must be installed before start")]
    fn test_fatal_handler_after_stop_panics() {
        let controller = controller();
        controller.stop();
        let _ = controller.with_fatal_handler(|_| {});
    }

    #[test]
    fn test_drop_stops_thread() {
        let controller = controller();
        controller.start().unwrap();
        drop(controller);
    }
}
