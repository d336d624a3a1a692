//! # Partial-Record Correlation Module
//!
//! Buffers events that arrive as several correlated pieces and releases one
//! merged event per logical record. Two completion policies share one
//! substrate:
//!
//! - **`legs`**: leg matching (e.g. `INVITE`/`ACK`/`BYE` records of one call).
//! - **`fragments`**: partial CDR fragments closed by a final-fragment marker.
//!
//! ## Substrate:
//!
//! - **`cache`**: a sharded store of [`CorrelationGroup`]s with an ordered
//!   expiry index. Get-or-create, mutate and remove-on-complete run under the
//!   key's shard lock.
//! - **`eviction`**: a pure planner deciding what happens to an expired group,
//!   executed by the [`Correlator`] either lazily (an expired group found on
//!   access) or by the periodic sweep.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Sharded TTL cache of correlation groups.
pub mod cache;
/// Expired-group planning.
pub mod eviction;
/// Final-fragment completion.
pub mod fragments;
/// Buffered fragments of one correlation key.
pub mod group;
/// Leg-matching completion.
pub mod legs;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::configs::{CompletionPolicy, SourceDefaults, SourceDescriptor};
use crate::core::event::{CanonicalEvent, Disposition, ReaderEvent};
use crate::errors::ProcessError;

// --- Public API Re-exports ---
pub use cache::{CacheUpdate, GroupAction, PartialCache};
pub use eviction::{plan_eviction, EvictionError, EvictionPlan, EvictionSettings};
pub use fragments::FragmentMerger;
pub use group::{CorrelationGroup, Fragment};
pub use legs::LegMatcher;

/// Shortest sweep period, whatever the TTL.
const MIN_SWEEP: Duration = Duration::from_millis(10);

/// Outcome of offering one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    /// The event completed a record (or needs no buffering) and must be forwarded.
    Forward(CanonicalEvent),
    /// The event was buffered in its group.
    Buffered,
    /// The event could not be correlated and was dropped with a warning.
    Ignored,
}

#[derive(Debug, Clone)]
enum Matcher {
    Legs(LegMatcher),
    Fragments(FragmentMerger),
}

impl Matcher {
    fn merge(&self, fragments: &[Fragment]) -> Option<CanonicalEvent> {
        match self {
            Matcher::Legs(m) => m.merge(fragments),
            Matcher::Fragments(m) => m.merge(fragments),
        }
    }
}

/// Correlation engine of one reader.
#[derive(Debug)]
pub struct Correlator {
    source: Arc<SourceDescriptor>,
    matcher: Matcher,
    cache: PartialCache,
    eviction: EvictionSettings,
    events: mpsc::Sender<ReaderEvent>,
    sweep_every: Duration,
    evictions: AtomicU64,
}

impl Correlator {
    /// Builds the correlator of a reader; `None` when the reader has no
    /// completion policy.
    pub fn for_source(
        source: Arc<SourceDescriptor>,
        defaults: &SourceDefaults,
        sweep_interval: Duration,
        events: mpsc::Sender<ReaderEvent>,
    ) -> Option<Self> {
        let matcher = match &source.partial.policy {
            CompletionPolicy::None => return None,
            CompletionPolicy::LegMatching(policy) => Matcher::Legs(LegMatcher::new(policy.clone())),
            CompletionPolicy::FinalFragment(policy) => Matcher::Fragments(FragmentMerger::new(
                policy.clone(),
                defaults.timezone_for(&source),
            )),
        };
        Some(Self {
            cache: PartialCache::new(source.partial.ttl),
            eviction: EvictionSettings::from_descriptor(&source),
            sweep_every: sweep_interval.min(source.partial.ttl).max(MIN_SWEEP),
            matcher,
            source,
            events,
            evictions: AtomicU64::new(0),
        })
    }

    /// Leg-matching readers buffer every event; fragment readers buffer only
    /// events carrying a fragment marker.
    pub fn classify(&self, event: &CanonicalEvent) -> Disposition {
        match &self.matcher {
            Matcher::Legs(_) => Disposition::Partial,
            Matcher::Fragments(_) if event.partial_marker().is_some() => Disposition::Partial,
            Matcher::Fragments(_) => Disposition::Complete,
        }
    }

    /// Hands a partial event to its group.
    pub async fn offer(&self, event: CanonicalEvent) -> Result<Correlation, ProcessError> {
        let update = match &self.matcher {
            Matcher::Legs(m) => {
                if m.is_failed_call(&event) {
                    debug!(reader = %self.source.id, id = %event.id, "failed call forwarded without pairing");
                    return Ok(Correlation::Forward(event));
                }
                m.offer(&self.cache, &self.source.id, event)?
            }
            Matcher::Fragments(m) => match m.offer(&self.cache, event) {
                Some(update) => update,
                None => {
                    warn!(reader = %self.source.id, "fragment without OriginID, ignoring");
                    return Ok(Correlation::Ignored);
                }
            },
        };

        if let Some(stale) = update.expired {
            self.evict(stale).await;
        }
        Ok(match update.result {
            Some(merged) => Correlation::Forward(merged),
            None => Correlation::Buffered,
        })
    }

    /// Evicts every group whose TTL ran out. Returns how many were taken.
    pub async fn sweep(&self) -> usize {
        let expired = self.cache.take_expired(Instant::now());
        let count = expired.len();
        for group in expired {
            self.evict(group).await;
        }
        count
    }

    /// Runs the configured eviction action for one group. Failures are logged.
    pub async fn evict(&self, group: CorrelationGroup) {
        if group.is_empty() {
            return;
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
        let key = group.key().to_string();
        let plan = plan_eviction(&self.eviction, &key, group.fragments(), |f| self.matcher.merge(f));
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                warn!(reader = %self.source.id, key = %key, error = %e, "failed to plan eviction");
                return;
            }
        };
        debug!(reader = %self.source.id, key = %key, fragments = group.len(), action = ?self.eviction.action, "evicting partial group");

        match plan {
            EvictionPlan::Nothing => {}
            EvictionPlan::Forward(event) => {
                let out = ReaderEvent {
                    source: Arc::clone(&self.source),
                    event,
                    raw: None,
                };
                if self.events.send(out).await.is_err() {
                    warn!(reader = %self.source.id, key = %key, "event stream closed, evicted record lost");
                }
            }
            EvictionPlan::Dump { path, contents, append } => {
                if let Err(e) = write_dump(&path, contents.as_bytes(), append).await {
                    warn!(reader = %self.source.id, key = %key, path = %path.display(), error = %e, "failed to dump partial group");
                }
            }
        }
    }

    /// Periodic eviction until `cancel` fires. Groups still buffered when the
    /// reader stops are dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.sweep_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.sweep().await;
                    }
                }
            }
            let left = this.cache.drain();
            if !left.is_empty() {
                warn!(reader = %this.source.id, groups = left.len(), "reader stopped, dropping buffered partial groups");
            }
        })
    }

    pub fn cache(&self) -> &PartialCache {
        &self.cache
    }

    /// Groups currently buffered.
    pub fn pending(&self) -> usize {
        self.cache.len()
    }

    /// Non-empty groups evicted so far, whatever the action.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

async fn write_dump(path: &std::path::Path, contents: &[u8], append: bool) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await
}
