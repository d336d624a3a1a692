//! # Integration Test Doubles
//!
//! Shared fixtures for the suites under `tests/`: a channel-fed source
//! adapter, a factory that hands those adapters to the registry, and a
//! charging backend that records every call.
//!
//! ## Purpose:
//! The suites drive `lib_ingest` end to end without a broker or database.
//! Messages are pushed through a [`Feed`]; acknowledgments, rejections and
//! downstream calls are recorded so tests can assert on them.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lib_ingest::configs::SourceDefaults;
use lib_ingest::core::{
    BackendCall, BackendReply, ChargingBackend, IngestionLoop, Outlets, Pipeline, ReaderEvent, SourceFailure,
};
use lib_ingest::correlation::Correlator;
use lib_ingest::errors::BackendError;
use lib_ingest::records::{decoder_for, InlineFilters, TemplateMapper};
use lib_ingest::{AdapterError, RawMessage, ReaderFactory, ServiceError, SourceAdapter, SourceDescriptor};

type Item = Result<RawMessage, String>;

/// Producer side of a [`ChannelAdapter`].
#[derive(Clone)]
pub struct Feed {
    tx: mpsc::UnboundedSender<Item>,
    seq: Arc<AtomicU64>,
}

impl Feed {
    /// Queues one message with a generated id (`m0`, `m1`, ...). Returns the id.
    pub fn push(&self, payload: &str) -> String {
        let id = format!("m{}", self.seq.fetch_add(1, Ordering::SeqCst));
        let _ = self.tx.send(Ok(RawMessage::new(id.clone(), payload.to_string())));
        id
    }

    /// Queues a transport failure; the adapter returns it from `next`.
    pub fn fail(&self, reason: &str) {
        let _ = self.tx.send(Err(reason.to_string()));
    }
}

/// Source adapter fed through an unbounded channel.
///
/// The stream ends once every [`Feed`] clone is dropped (or the adapter is
/// closed). Acks can be slowed down to keep processing units in flight; the
/// number of units inside `ack` at once is tracked.
pub struct ChannelAdapter {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Item>>,
    acked: Mutex<Vec<String>>,
    rejected: Mutex<Vec<(String, bool)>>,
    closed: CancellationToken,
    connects: AtomicUsize,
    ack_delay: Duration,
    in_ack: AtomicUsize,
    peak_ack: AtomicUsize,
    fail_connect: bool,
    manual: bool,
    batch: bool,
}

impl ChannelAdapter {
    pub fn new() -> (Arc<Self>, Feed) {
        Self::build(Duration::ZERO, false, true, false)
    }

    /// An adapter whose `ack` sleeps for `delay`.
    pub fn with_ack_delay(delay: Duration) -> (Arc<Self>, Feed) {
        Self::build(delay, false, true, false)
    }

    /// An adapter whose `connect` always fails.
    pub fn unreachable() -> (Arc<Self>, Feed) {
        Self::build(Duration::ZERO, true, true, false)
    }

    /// An adapter that cannot be run on demand.
    pub fn streaming_only() -> (Arc<Self>, Feed) {
        Self::build(Duration::ZERO, false, false, false)
    }

    /// An adapter whose stream ends as soon as nothing is queued, like a
    /// spool directory read on demand.
    pub fn batch() -> (Arc<Self>, Feed) {
        Self::build(Duration::ZERO, false, true, true)
    }

    fn build(ack_delay: Duration, fail_connect: bool, manual: bool, batch: bool) -> (Arc<Self>, Feed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(Self {
            rx: tokio::sync::Mutex::new(rx),
            acked: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
            connects: AtomicUsize::new(0),
            ack_delay,
            in_ack: AtomicUsize::new(0),
            peak_ack: AtomicUsize::new(0),
            fail_connect,
            manual,
            batch,
        });
        let feed = Feed {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        };
        (adapter, feed)
    }

    /// Ids of acknowledged messages, sorted.
    pub fn acked(&self) -> Vec<String> {
        let mut ids = self.acked.lock().clone();
        ids.sort();
        ids
    }

    /// Ids and redelivery requests of rejected messages, sorted by id.
    pub fn rejected(&self) -> Vec<(String, bool)> {
        let mut ids = self.rejected.lock().clone();
        ids.sort();
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Most processing units seen inside `ack` at the same time.
    pub fn peak_ack(&self) -> usize {
        self.peak_ack.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for ChannelAdapter {
    async fn connect(&self) -> Result<(), AdapterError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(AdapterError::Connect {
                target: "channel".into(),
                reason: "refused".into(),
            });
        }
        Ok(())
    }

    async fn next(&self) -> Result<Option<RawMessage>, AdapterError> {
        let mut rx = self.rx.lock().await;
        if self.batch {
            return match rx.try_recv() {
                Ok(Ok(msg)) => Ok(Some(msg)),
                Ok(Err(reason)) => Err(AdapterError::Receive(reason)),
                Err(_) => Ok(None),
            };
        }
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            item = rx.recv() => match item {
                Some(Ok(msg)) => Ok(Some(msg)),
                Some(Err(reason)) => Err(AdapterError::Receive(reason)),
                None => Ok(None),
            },
        }
    }

    async fn ack(&self, msg: &RawMessage) -> Result<(), AdapterError> {
        let now = self.in_ack.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_ack.fetch_max(now, Ordering::SeqCst);
        if !self.ack_delay.is_zero() {
            tokio::time::sleep(self.ack_delay).await;
        }
        self.acked.lock().push(msg.id.clone());
        self.in_ack.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, msg: &RawMessage, redeliver: bool) -> Result<(), AdapterError> {
        self.rejected.lock().push((msg.id.clone(), redeliver));
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.closed.cancel();
        Ok(())
    }

    fn supports_manual(&self) -> bool {
        self.manual
    }
}

/// Reader factory handing out pre-registered [`ChannelAdapter`]s by reader id.
///
/// A reader with no registered adapter gets a fresh one on its first build,
/// kept so a test can look up what the registry actually started.
#[derive(Default)]
pub struct ChannelFactory {
    adapters: Mutex<HashMap<String, (Arc<ChannelAdapter>, Feed)>>,
    builds: Mutex<HashMap<String, usize>>,
}

impl ChannelFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `adapter` for reader `id`.
    pub fn register(&self, id: &str, adapter: (Arc<ChannelAdapter>, Feed)) -> Feed {
        let feed = adapter.1.clone();
        self.adapters.lock().insert(id.to_string(), adapter);
        feed
    }

    /// The adapter of reader `id`.
    pub fn adapter(&self, id: &str) -> Option<Arc<ChannelAdapter>> {
        self.adapters.lock().get(id).map(|(a, _)| Arc::clone(a))
    }

    /// Feed of the adapter of reader `id`.
    pub fn feed(&self, id: &str) -> Option<Feed> {
        self.adapters.lock().get(id).map(|(_, f)| f.clone())
    }

    /// How many times an adapter was built for reader `id`.
    pub fn builds(&self, id: &str) -> usize {
        self.builds.lock().get(id).copied().unwrap_or(0)
    }
}

impl ReaderFactory for ChannelFactory {
    fn build(&self, desc: &SourceDescriptor) -> Result<Arc<dyn SourceAdapter>, ServiceError> {
        if desc.kind == "*unknown" {
            return Err(ServiceError::UnsupportedReaderType(desc.kind.clone()));
        }
        *self.builds.lock().entry(desc.id.clone()).or_default() += 1;
        let mut adapters = self.adapters.lock();
        let (adapter, _) = adapters
            .entry(desc.id.clone())
            .or_insert_with(ChannelAdapter::new);
        Ok(Arc::clone(adapter) as Arc<dyn SourceAdapter>)
    }
}

/// Charging backend that accepts every call and records it.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    fail: Mutex<Option<&'static str>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every call named `name` (e.g. `ProcessCDR`) fail.
    pub fn fail_on(&self, name: &'static str) {
        *self.fail.lock() = Some(name);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Names of the recorded calls, in call order.
    pub fn names(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(BackendCall::name).collect()
    }

    /// Waits until at least `n` calls were recorded or `limit` elapsed.
    pub async fn wait_for(&self, n: usize, limit: Duration) -> Vec<BackendCall> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let calls = self.calls();
            if calls.len() >= n || tokio::time::Instant::now() >= deadline {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ChargingBackend for RecordingBackend {
    async fn call(&self, call: BackendCall) -> Result<BackendReply, BackendError> {
        let name = call.name();
        self.calls.lock().push(call);
        if *self.fail.lock() == Some(name) {
            return Err(BackendError {
                call: name,
                reason: "rejected by test backend".into(),
            });
        }
        Ok(BackendReply::default())
    }
}

/// One ingestion loop wired to its own event and error streams.
pub struct LoopHarness {
    pub ingest: Arc<IngestionLoop>,
    pub events: mpsc::Receiver<ReaderEvent>,
    pub errors: mpsc::Receiver<SourceFailure>,
}

/// Builds the loop of `desc` over `adapter` with the stock decoder, filters
/// and templates, plus a correlator when the reader has a completion policy.
pub fn loop_harness(desc: SourceDescriptor, adapter: Arc<dyn SourceAdapter>, event_buffer: usize) -> LoopHarness {
    let desc = Arc::new(desc);
    let (events_tx, events) = mpsc::channel(event_buffer.max(1));
    let (errors_tx, errors) = mpsc::channel(4);
    let pipeline = Pipeline {
        decoder: decoder_for(&desc.kind, desc.opts.field_separator.as_deref()),
        filter: Arc::new(InlineFilters),
        mapper: Arc::new(TemplateMapper),
    };
    let defaults = SourceDefaults::default();
    let mut ingest = IngestionLoop::new(
        Arc::clone(&desc),
        adapter,
        pipeline,
        Outlets {
            events: events_tx.clone(),
            errors: errors_tx,
        },
        &defaults,
    );
    if let Some(correlator) = Correlator::for_source(desc, &defaults, Duration::from_millis(50), events_tx) {
        ingest = ingest.with_correlator(Arc::new(correlator));
    }
    LoopHarness {
        ingest: Arc::new(ingest),
        events,
        errors,
    }
}

/// Polls `check` every few milliseconds until it holds or `limit` elapsed.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
