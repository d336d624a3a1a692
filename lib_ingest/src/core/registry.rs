//! # Reader Registry
//!
//! [`ReaderService`] owns the map from reader id to [`RunningSource`] and
//! keeps it in step with the configuration. Every running source writes to
//! one shared event stream and one shared error stream; [`ReaderService::serve`]
//! waits on those together with the shutdown and reload signals.
//!
//! ## Lifecycle of a source:
//!
//! `starting` → `running` → `stopping` → `stopped`. A source whose adapter
//! cannot be built or connected is never registered. Stopping is idempotent
//! and does not wait for in-flight messages before the adapter is closed.
//!
//! ## Reload:
//!
//! Readers only in the new configuration are started, readers only in the
//! running set are stopped, and readers present in both are left untouched
//! even if their settings changed. The handle map's write lock is held for
//! the whole reconciliation so the same id is never starting and stopping
//! at once.
//!
//! ## Shutdown:
//!
//! The shared event stream is still read while sources stop. Units blocked
//! on a full stream can then finish and acknowledge their messages, and what
//! they forward is post-processed before [`ReaderService::serve`] returns.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::admission::AdmissionPool;
use super::dispatcher::{ChargingBackend, Dispatcher};
use super::event::{ReaderEvent, SourceFailure};
use super::ingestion::{IngestionLoop, Outlets, Pipeline};
use crate::configs::{ErsConfig, RunMode, SourceDefaults, SourceDescriptor};
use crate::correlation::Correlator;
use crate::errors::ServiceError;
use crate::ingestors::ReaderFactory;
use crate::records::{EventFilter, FieldMapper, InlineFilters, TemplateMapper};

/// Lifecycle state of a [`RunningSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// A registered source: its loop, its cancellation signal and its tasks.
pub struct RunningSource {
    descriptor: Arc<SourceDescriptor>,
    ingest: Arc<IngestionLoop>,
    cancel: CancellationToken,
    state: Mutex<SourceState>,
    runner: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RunningSource {
    fn new(ingest: Arc<IngestionLoop>) -> Self {
        Self {
            descriptor: Arc::clone(ingest.source()),
            ingest,
            cancel: CancellationToken::new(),
            state: Mutex::new(SourceState::Starting),
            runner: Mutex::new(None),
            sweeper: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<SourceDescriptor> {
        &self.descriptor
    }

    pub fn ingest(&self) -> &Arc<IngestionLoop> {
        &self.ingest
    }

    pub fn state(&self) -> SourceState {
        *self.state.lock()
    }

    /// The signal observed by the source's loop and sweeper.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn launch(&self) {
        if self.descriptor.run_mode != RunMode::OnDemand {
            let ingest = Arc::clone(&self.ingest);
            *self.runner.lock() = Some(tokio::spawn(ingest.run(self.cancel.clone())));
        }
        if let Some(correlator) = self.ingest.correlator() {
            *self.sweeper.lock() = Some(correlator.spawn_sweeper(self.cancel.clone()));
        }
        *self.state.lock() = SourceState::Running;
    }

    /// Signals the source to stop. Returns `false` when it was already stopping.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SourceState::Stopping | SourceState::Stopped => false,
            SourceState::Starting | SourceState::Running => {
                *state = SourceState::Stopping;
                self.cancel.cancel();
                true
            }
        }
    }

    /// Stops the source and waits for its loop, its sweeper and its
    /// in-flight messages.
    pub async fn finish(&self) {
        self.stop();
        let runner = self.runner.lock().take();
        match runner {
            Some(runner) => {
                if let Err(e) = runner.await {
                    warn!(reader = %self.id(), error = %e, "reader task ended abnormally");
                }
            }
            None => self.ingest.close().await,
        }
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!(reader = %self.id(), error = %e, "sweeper task ended abnormally");
            }
        }
        self.ingest.drain().await;
        *self.state.lock() = SourceState::Stopped;
        debug!(reader = %self.id(), "reader finished");
    }
}

#[derive(Debug, Clone)]
struct Settings {
    defaults: SourceDefaults,
    sweep_interval: Duration,
    enabled: bool,
}

type Streams = (mpsc::Receiver<ReaderEvent>, mpsc::Receiver<SourceFailure>);

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    /// Readers that were invalid or failed to start.
    pub skipped: Vec<String>,
}

/// The reader registry.
pub struct ReaderService {
    factory: Arc<dyn ReaderFactory>,
    dispatcher: Dispatcher,
    filter: Arc<dyn EventFilter>,
    mapper: Arc<dyn FieldMapper>,
    sources: RwLock<HashMap<String, Arc<RunningSource>>>,
    outlets: Outlets,
    streams: Mutex<Option<Streams>>,
    settings: parking_lot::RwLock<Settings>,
    post_pool: AdmissionPool,
    post_tasks: TaskTracker,
    retiring: TaskTracker,
    dispatched: AtomicU64,
    dispatch_failures: Arc<AtomicU64>,
}

impl ReaderService {
    pub fn new(
        config: &ErsConfig,
        factory: Arc<dyn ReaderFactory>,
        backend: Arc<dyn ChargingBackend>,
    ) -> Result<Self, ServiceError> {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(config.readers.len().max(16));
        Ok(Self {
            factory,
            dispatcher: Dispatcher::new(backend),
            filter: Arc::new(InlineFilters),
            mapper: Arc::new(TemplateMapper),
            sources: RwLock::new(HashMap::new()),
            outlets: Outlets {
                events: events_tx,
                errors: errors_tx,
            },
            streams: Mutex::new(Some((events_rx, errors_rx))),
            settings: parking_lot::RwLock::new(Settings {
                defaults: config.defaults()?,
                sweep_interval: config.sweep_interval,
                enabled: config.enabled,
            }),
            post_pool: AdmissionPool::new(config.concurrent_events),
            post_tasks: TaskTracker::new(),
            retiring: TaskTracker::new(),
            dispatched: AtomicU64::new(0),
            dispatch_failures: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Replaces the inline filter evaluator.
    pub fn with_filter(mut self, filter: Arc<dyn EventFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Replaces the template mapper.
    pub fn with_mapper(mut self, mapper: Arc<dyn FieldMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Starts every enabled reader. Any failure stops the readers already
    /// started and is returned.
    pub async fn start(&self, config: &ErsConfig) -> Result<(), ServiceError> {
        config.validate()?;
        if !config.enabled {
            info!("reader service disabled by configuration");
            return Ok(());
        }
        let mut sources = self.sources.write().await;
        for desc in config.readers.iter().filter(|d| d.is_enabled()) {
            if sources.contains_key(&desc.id) {
                continue;
            }
            match self.start_source(desc.clone()).await {
                Ok(handle) => {
                    sources.insert(desc.id.clone(), handle);
                }
                Err(e) => {
                    error!(reader = %desc.id, error = %e, "failed to start reader");
                    let started: Vec<_> = sources.drain().map(|(_, h)| h).collect();
                    drop(sources);
                    for handle in started {
                        handle.finish().await;
                    }
                    return Err(e);
                }
            }
        }
        info!(readers = sources.len(), "reader service started");
        Ok(())
    }

    async fn start_source(&self, desc: SourceDescriptor) -> Result<Arc<RunningSource>, ServiceError> {
        let source = Arc::new(desc);
        let adapter = self.factory.build(&source)?;
        let pipeline = Pipeline {
            decoder: self.factory.decoder(&source),
            filter: Arc::clone(&self.filter),
            mapper: Arc::clone(&self.mapper),
        };
        let Settings { defaults, sweep_interval, .. } = self.settings.read().clone();

        let mut ingest = IngestionLoop::new(
            Arc::clone(&source),
            adapter,
            pipeline,
            self.outlets.clone(),
            &defaults,
        );
        if let Some(correlator) = Correlator::for_source(
            Arc::clone(&source),
            &defaults,
            sweep_interval,
            self.outlets.events.clone(),
        ) {
            ingest = ingest.with_correlator(Arc::new(correlator));
        }
        let handle = Arc::new(RunningSource::new(Arc::new(ingest)));

        handle.ingest().connect().await.map_err(|e| ServiceError::Start {
            id: source.id.clone(),
            source: e,
        })?;
        handle.launch();
        info!(reader = %source.id, kind = %source.kind, mode = %source.run_mode, "reader registered");
        Ok(handle)
    }

    /// Serves until `shutdown` fires or a source fails. Reload requests
    /// arrive on `reload`; once that channel closes, reloads stop. Every
    /// source is stopped before returning.
    pub async fn serve(
        &self,
        shutdown: CancellationToken,
        mut reload: mpsc::Receiver<ErsConfig>,
    ) -> Result<(), ServiceError> {
        let Some((mut events, mut errors)) = self.streams.lock().take() else {
            return Err(ServiceError::AlreadyServing);
        };
        let mut reload_open = true;

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break Ok(());
                }
                Some(failure) = errors.recv() => {
                    error!(reader = %failure.reader_id, error = %failure.error, "reader failed, stopping service");
                    break Err(ServiceError::SourceFailure {
                        id: failure.reader_id,
                        source: failure.error,
                    });
                }
                next = reload.recv(), if reload_open => match next {
                    Some(config) => {
                        self.reconcile(config).await;
                    }
                    None => reload_open = false,
                },
                Some(event) = events.recv() => self.dispatch(event).await,
            }
        };

        self.stop_all(Some((events, errors))).await;
        result
    }

    /// Runs post-processing for one event on its own task, bounded by the
    /// service's event concurrency.
    async fn dispatch(&self, event: ReaderEvent) {
        let Some(token) = self.post_pool.acquire().await else {
            warn!(reader = %event.reader_id(), id = %event.event.id, "post-processing closed, dropping event");
            return;
        };
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let dispatcher = self.dispatcher.clone();
        let failures = Arc::clone(&self.dispatch_failures);
        self.post_tasks.spawn(async move {
            let reader = event.reader_id().to_string();
            let id = event.event.id.clone();
            let result = dispatcher.dispatch(event).await;
            token.release();
            if let Err(e) = result {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(reader = %reader, id = %id, error = %e, "failed to post-process event");
            }
        });
    }

    /// Applies a new configuration to the running set.
    pub async fn reconcile(&self, config: ErsConfig) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let defaults = match config.defaults() {
            Ok(defaults) => defaults,
            Err(e) => {
                warn!(error = %e, "ignoring reload with invalid service defaults");
                return summary;
            }
        };
        let mut seen = HashSet::new();
        if let Some(dup) = config.readers.iter().find(|d| !seen.insert(d.id.as_str())) {
            warn!(reader = %dup.id, "ignoring reload with duplicate reader id");
            return summary;
        }
        *self.settings.write() = Settings {
            defaults,
            sweep_interval: config.sweep_interval,
            enabled: config.enabled,
        };

        let wanted: HashMap<&str, &SourceDescriptor> = config
            .readers
            .iter()
            .filter(|d| config.enabled && d.is_enabled())
            .map(|d| (d.id.as_str(), d))
            .collect();

        let mut sources = self.sources.write().await;
        let removed: Vec<String> = sources
            .keys()
            .filter(|id| !wanted.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in removed {
            if let Some(handle) = sources.remove(&id) {
                handle.stop();
                self.retiring.spawn(async move { handle.finish().await });
                info!(reader = %id, "reader removed");
                summary.stopped.push(id);
            }
        }

        let mut added: Vec<&SourceDescriptor> = wanted
            .values()
            .filter(|d| !sources.contains_key(&d.id))
            .copied()
            .collect();
        added.sort_by(|a, b| a.id.cmp(&b.id));
        for desc in added {
            if let Err(e) = desc.validate() {
                warn!(reader = %desc.id, error = %e, "skipping invalid reader");
                summary.skipped.push(desc.id.clone());
                continue;
            }
            match self.start_source(desc.clone()).await {
                Ok(handle) => {
                    sources.insert(desc.id.clone(), handle);
                    summary.started.push(desc.id.clone());
                }
                Err(e) => {
                    warn!(reader = %desc.id, error = %e, "skipping reader that failed to start");
                    summary.skipped.push(desc.id.clone());
                }
            }
        }
        info!(
            started = summary.started.len(),
            stopped = summary.stopped.len(),
            skipped = summary.skipped.len(),
            running = sources.len(),
            "configuration reloaded"
        );
        summary
    }

    /// Processes the pending input of an on-demand reader now.
    pub async fn run_reader(&self, id: &str) -> Result<usize, ServiceError> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| ServiceError::ReaderNotFound(id.to_string()))?;
        let mode = handle.descriptor().run_mode;
        if mode != RunMode::OnDemand {
            return Err(ServiceError::UnsupportedRunMode {
                id: id.to_string(),
                mode: mode.to_string(),
            });
        }
        handle.ingest().run_once().await
    }

    pub async fn handle(&self, id: &str) -> Option<Arc<RunningSource>> {
        self.sources.read().await.get(id).cloned()
    }

    /// Ids of the registered readers, sorted.
    pub async fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the last applied configuration enables the service.
    pub fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    /// Events handed to post-processing so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Events whose post-processing returned an error.
    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    /// Stops every source and waits for sources, retired sources and
    /// post-processing to finish. Events still on the shared stream are
    /// post-processed on the way.
    pub async fn shutdown(&self) {
        let streams = self.streams.lock().take();
        self.stop_all(streams).await;
    }

    /// Keeps reading the shared streams while the sources stop, so units
    /// and sweepers waiting for room on the event stream can finish.
    async fn stop_all(&self, streams: Option<Streams>) {
        let stopping = self.stop_sources();
        tokio::pin!(stopping);
        match streams {
            Some((mut events, mut errors)) => {
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut stopping => break,
                        Some(failure) = errors.recv() => {
                            warn!(reader = %failure.reader_id, error = %failure.error, "reader failed while stopping");
                        }
                        Some(event) = events.recv() => self.dispatch(event).await,
                    }
                }
                while let Ok(event) = events.try_recv() {
                    self.dispatch(event).await;
                }
            }
            None => stopping.await,
        }
        self.post_tasks.close();
        self.post_tasks.wait().await;
        info!("reader service stopped");
    }

    async fn stop_sources(&self) {
        let handles: Vec<Arc<RunningSource>> = self.sources.write().await.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            handle.finish().await;
        }
        self.retiring.close();
        self.retiring.wait().await;
    }
}
