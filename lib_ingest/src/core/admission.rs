//! # Admission Token Pool
//!
//! Bounds how many messages of one source are inside a processing unit at the
//! same time. A token is taken before a message is received and travels with
//! the unit that processes it; dropping the token returns it to the pool, so
//! every exit path of the unit (success, decode/filter/map failure, failed
//! post, panic unwind) releases exactly once.
//!
//! A limit of 0 builds an unbounded pool whose `acquire` never waits. The
//! counters are kept for both kinds so tests and logs can observe the peak
//! concurrency.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct PoolStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl PoolStats {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        self.acquired.fetch_add(1, Ordering::AcqRel);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// Per-source counting resource of admission tokens.
#[derive(Debug, Clone)]
pub struct AdmissionPool {
    semaphore: Option<Arc<Semaphore>>,
    limit: usize,
    stats: Arc<PoolStats>,
}

impl AdmissionPool {
    /// A pool of `limit` tokens; 0 builds an unbounded pool.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
            limit,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Waits for a free token. Returns `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<AdmissionToken> {
        let permit = match &self.semaphore {
            Some(sem) => Some(Arc::clone(sem).acquire_owned().await.ok()?),
            None => None,
        };
        Some(self.issue(permit))
    }

    /// Takes a token only if one is free right now.
    pub fn try_acquire(&self) -> Option<AdmissionToken> {
        let permit = match &self.semaphore {
            Some(sem) => Some(Arc::clone(sem).try_acquire_owned().ok()?),
            None => None,
        };
        Some(self.issue(permit))
    }

    /// Wakes every waiter with `None` and refuses further acquisitions.
    /// Tokens already handed out stay valid.
    pub fn close(&self) {
        if let Some(sem) = &self.semaphore {
            sem.close();
        }
    }

    fn issue(&self, permit: Option<OwnedSemaphorePermit>) -> AdmissionToken {
        self.stats.enter();
        AdmissionToken {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        }
    }

    /// Configured size; 0 for unbounded pools.
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_unbounded(&self) -> bool {
        self.semaphore.is_none()
    }

    /// Tokens currently held.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of tokens held at once.
    pub fn peak(&self) -> usize {
        self.stats.peak.load(Ordering::Acquire)
    }

    pub fn acquired(&self) -> u64 {
        self.stats.acquired.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.stats.released.load(Ordering::Acquire)
    }
}

/// One unit of a source's concurrency budget. Released on drop.
#[derive(Debug)]
pub struct AdmissionToken {
    _permit: Option<OwnedSemaphorePermit>,
    stats: Arc<PoolStats>,
}

impl AdmissionToken {
    /// Returns the token to its pool.
    pub fn release(self) {}
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.stats.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_pool_blocks_at_limit() {
        let pool = AdmissionPool::new(2);
        let a = pool.acquire().await.expect("first token");
        let _b = pool.acquire().await.expect("second token");
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.in_flight(), 2);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        a.release();
        waiter.await.expect("join").expect("token after release");
        assert_eq!(pool.peak(), 2);
    }

    #[tokio::test]
    async fn unbounded_pool_never_blocks() {
        let pool = AdmissionPool::unbounded();
        let tokens: Vec<_> = (0..1000).filter_map(|_| pool.try_acquire()).collect();
        assert_eq!(tokens.len(), 1000);
        assert!(pool.is_unbounded());
        drop(tokens);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.acquired(), pool.released());
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let pool = AdmissionPool::new(1);
        let _held = pool.acquire().await.expect("token");
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.is_none() })
        };
        tokio::task::yield_now().await;
        pool.close();
        assert!(waiter.await.expect("join"));
    }
}
