//! # Ingestion Loop
//!
//! Drives one [`SourceAdapter`] from connection to shutdown. Every iteration
//! takes an [`AdmissionToken`] before asking the adapter for a message, then
//! hands the message to its own task together with the token. The token is
//! dropped when that task ends, after the message was acknowledged or
//! rejected and after any forwarded event was accepted by the shared event
//! stream, so a full stream throttles receipt from the transport.
//!
//! ## Per-message unit:
//!
//! 1. decode the payload into a field map;
//! 2. run the reader's inline filters (a filtered-out record is acknowledged);
//! 3. project the fields through the reader's templates;
//! 4. buffer partial records in the [`Correlator`], forward everything else.
//!
//! Failures in the unit are logged with the reader and message identity and
//! the message is rejected. Transport failures while receiving end the loop
//! and are reported once on the error stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono_tz::Tz;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::admission::{AdmissionPool, AdmissionToken};
use super::event::{
    Disposition, FieldMap, RawMessage, ReaderEvent, SourceFailure, ATTR_FILE_NAME, OPT_FILE_NAME,
    OPT_READER_ID,
};
use crate::configs::{SourceDefaults, SourceDescriptor};
use crate::correlation::{Correlation, Correlator};
use crate::errors::{AdapterError, ProcessError, ServiceError};
use crate::ingestors::SourceAdapter;
use crate::records::{EventFilter, FieldMapper, MappingContext, RecordDecoder};
use crate::utils::event_id;

/// The collaborators that turn a raw message into a canonical event.
#[derive(Clone)]
pub struct Pipeline {
    pub decoder: Arc<dyn RecordDecoder>,
    pub filter: Arc<dyn EventFilter>,
    pub mapper: Arc<dyn FieldMapper>,
}

/// Senders of the registry's shared streams.
#[derive(Debug, Clone)]
pub struct Outlets {
    pub events: mpsc::Sender<ReaderEvent>,
    pub errors: mpsc::Sender<SourceFailure>,
}

#[derive(Debug, Default)]
struct LoopStats {
    received: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

/// One running source: adapter, admission pool and optional correlator.
pub struct IngestionLoop {
    source: Arc<SourceDescriptor>,
    adapter: Arc<dyn SourceAdapter>,
    pipeline: Pipeline,
    outlets: Outlets,
    tenant: String,
    timezone: Tz,
    pool: AdmissionPool,
    correlator: Option<Arc<Correlator>>,
    tracker: TaskTracker,
    stats: LoopStats,
}

impl IngestionLoop {
    pub fn new(
        source: Arc<SourceDescriptor>,
        adapter: Arc<dyn SourceAdapter>,
        pipeline: Pipeline,
        outlets: Outlets,
        defaults: &SourceDefaults,
    ) -> Self {
        Self {
            tenant: defaults.tenant_for(&source),
            timezone: defaults.timezone_for(&source),
            pool: AdmissionPool::new(source.concurrent_requests),
            source,
            adapter,
            pipeline,
            outlets,
            correlator: None,
            tracker: TaskTracker::new(),
            stats: LoopStats::default(),
        }
    }

    /// Routes partial records of this source through `correlator`.
    pub fn with_correlator(mut self, correlator: Arc<Correlator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    pub fn source(&self) -> &Arc<SourceDescriptor> {
        &self.source
    }

    pub fn pool(&self) -> &AdmissionPool {
        &self.pool
    }

    pub fn correlator(&self) -> Option<&Arc<Correlator>> {
        self.correlator.as_ref()
    }

    /// Messages received from the adapter so far.
    pub fn received(&self) -> u64 {
        self.stats.received.load(Ordering::Relaxed)
    }

    /// Events placed on the shared stream, merged records included.
    pub fn forwarded(&self) -> u64 {
        self.stats.forwarded.load(Ordering::Relaxed)
    }

    /// Messages whose processing failed.
    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Establishes the adapter connection. Failing here keeps the source
    /// from being registered.
    pub async fn connect(&self) -> Result<(), AdapterError> {
        self.adapter.connect().await
    }

    /// Closes the adapter. Errors are logged.
    pub async fn close(&self) {
        if let Err(e) = self.adapter.close().await {
            warn!(reader = %self.source.id, error = %e, "failed to close source");
        }
    }

    /// Pulls messages until `cancel` fires, the stream ends or the transport
    /// fails, then closes the adapter. In-flight units keep running and are
    /// awaited separately with [`IngestionLoop::drain`].
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let delay = self.source.start_delay;
        if !delay.is_zero() {
            debug!(reader = %self.source.id, delay = ?delay, "delaying start");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.close().await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(reader = %self.source.id, kind = %self.source.kind, limit = self.pool.limit(), "reader started");

        loop {
            let token = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                token = self.pool.acquire() => match token {
                    Some(token) => token,
                    None => break,
                },
            };
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.adapter.next() => next,
            };
            match next {
                Ok(Some(msg)) => self.spawn_unit(msg, token, &self.tracker),
                Ok(None) => {
                    debug!(reader = %self.source.id, "end of stream");
                    break;
                }
                Err(e) => {
                    error!(reader = %self.source.id, error = %e, "source failed");
                    let failure = SourceFailure {
                        reader_id: self.source.id.clone(),
                        error: e,
                    };
                    if self.outlets.errors.send(failure).await.is_err() {
                        warn!(reader = %self.source.id, "error stream closed");
                    }
                    break;
                }
            }
        }

        self.close().await;
        info!(reader = %self.source.id, received = self.received(), failed = self.failed(), "reader stopped");
    }

    /// Processes whatever the adapter currently holds, then returns the
    /// number of messages handled. Only adapters whose stream drains to an
    /// end can be run this way.
    pub async fn run_once(self: &Arc<Self>) -> Result<usize, ServiceError> {
        if !self.adapter.supports_manual() {
            return Err(ServiceError::ManualUnsupported(self.source.id.clone()));
        }
        let batch = TaskTracker::new();
        let mut count = 0;
        loop {
            let Some(token) = self.pool.acquire().await else {
                break;
            };
            match self.adapter.next().await {
                Ok(Some(msg)) => {
                    count += 1;
                    self.spawn_unit(msg, token, &batch);
                }
                Ok(None) => break,
                Err(e) => {
                    batch.close();
                    batch.wait().await;
                    return Err(ServiceError::SourceFailure {
                        id: self.source.id.clone(),
                        source: e,
                    });
                }
            }
        }
        batch.close();
        batch.wait().await;
        debug!(reader = %self.source.id, messages = count, "manual run finished");
        Ok(count)
    }

    /// Waits for every in-flight unit spawned by [`IngestionLoop::run`].
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_unit(self: &Arc<Self>, msg: RawMessage, token: AdmissionToken, tracker: &TaskTracker) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        tracker.spawn(async move {
            this.handle(msg).await;
            token.release();
        });
    }

    async fn handle(&self, msg: RawMessage) {
        match self.process(&msg).await {
            Ok(()) => {
                if let Err(e) = self.adapter.ack(&msg).await {
                    warn!(reader = %self.source.id, message = %msg.id, error = %e, "failed to acknowledge message");
                }
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let redeliver = self.adapter.redeliverable();
                if redeliver {
                    warn!(reader = %self.source.id, message = %msg.id, error = %e, "failed to process message");
                } else {
                    warn!(reader = %self.source.id, message = %msg.id, error = %e, "failed to process message, dropping it");
                }
                if let Err(e) = self.adapter.reject(&msg, redeliver).await {
                    warn!(reader = %self.source.id, message = %msg.id, error = %e, "failed to reject message");
                }
            }
        }
    }

    async fn process(&self, msg: &RawMessage) -> Result<(), ProcessError> {
        let raw = self.pipeline.decoder.decode(msg)?;
        if !self.pipeline.filter.pass(&self.tenant, &self.source.filters, &raw)? {
            debug!(reader = %self.source.id, message = %msg.id, "record filtered out");
            return Ok(());
        }

        let mut opts = FieldMap::new();
        opts.insert(OPT_READER_ID.to_string(), Value::from(self.source.id.as_str()));
        if let Some(name) = msg.attribute(ATTR_FILE_NAME) {
            opts.insert(OPT_FILE_NAME.to_string(), Value::from(name));
        }
        let ctx = MappingContext {
            tenant: self.tenant.clone(),
            timezone: self.timezone,
            event_id: event_id(&self.source.id, &msg.id),
            opts,
        };
        let event = self.pipeline.mapper.project(ctx, &raw, &self.source.fields)?;

        if let Some(correlator) = &self.correlator {
            if correlator.classify(&event) == Disposition::Partial {
                return match correlator.offer(event).await? {
                    Correlation::Forward(merged) => {
                        let raw = merged.fields.clone();
                        self.post(merged, Some(raw)).await
                    }
                    Correlation::Buffered | Correlation::Ignored => Ok(()),
                };
            }
        }
        self.post(event, Some(raw)).await
    }

    async fn post(&self, event: super::event::CanonicalEvent, raw: Option<FieldMap>) -> Result<(), ProcessError> {
        let id = event.id.clone();
        let out = ReaderEvent {
            source: Arc::clone(&self.source),
            event,
            raw,
        };
        self.outlets
            .events
            .send(out)
            .await
            .map_err(|_| ProcessError::Post(id))?;
        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
