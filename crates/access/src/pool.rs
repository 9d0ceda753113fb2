//! Bounded pool of reusable store sessions.

use crate::cache::Cache;
use crate::error::{ErrorKind, Result};
use crate::scope::SessionScope;
use exn::ResultExt;
use quarry_store::backend::{ConnectorHandle, SessionHandle};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Generous default for how long `acquire` waits for a free session.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CAPACITY: NonZeroUsize = NonZeroUsize::MIN.saturating_add(7);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum number of sessions checked out at once; fixed for the life of
    /// the pool.
    pub capacity: NonZeroUsize,
    pub acquire_timeout: Duration,
    /// Whether scopes evaluate client-side filters in process instead of
    /// refusing them.
    pub client_evaluation: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self { capacity: DEFAULT_CAPACITY, acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT, client_evaluation: false }
    }
}

/// Point-in-time occupancy. `in_flight + available == capacity` always
/// holds; `idle` of the available slots hold an opened session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub capacity: usize,
    pub in_flight: usize,
    pub available: usize,
    pub idle: usize,
}

/// Cumulative counters since the pool was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquisitions: u64,
    pub releases: u64,
    /// Sessions dropped instead of reused (dead on checkout, or tainted).
    pub discarded: u64,
    /// Sessions opened on the connector.
    pub opened: u64,
}

#[derive(Default)]
struct Counters {
    acquisitions: AtomicU64,
    releases: AtomicU64,
    discarded: AtomicU64,
    opened: AtomicU64,
}

pub(crate) struct PoolInner {
    pub(crate) connector: ConnectorHandle,
    pub(crate) cache: Option<Arc<Cache>>,
    pub(crate) options: PoolOptions,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<SessionHandle>>,
    closed: AtomicBool,
    counters: Counters,
}

/// A bounded set of store sessions handed out one per unit of work.
///
/// Capacity is enforced with a semaphore: a [`SessionScope`] holds one permit
/// for its whole life, so at most `capacity` sessions are ever in use.
/// Sessions are opened lazily and kept for reuse once released; each one is
/// pinged before it is handed out again and replaced if it died meanwhile.
///
/// The pool is cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: ConnectorHandle, options: PoolOptions) -> Self {
        Self::build(connector, options, None)
    }

    /// A pool whose scopes invalidate `cache` when they write.
    pub fn with_cache(connector: ConnectorHandle, options: PoolOptions, cache: Arc<Cache>) -> Self {
        Self::build(connector, options, Some(cache))
    }

    fn build(connector: ConnectorHandle, options: PoolOptions, cache: Option<Arc<Cache>>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                cache,
                options,
                permits: Arc::new(Semaphore::new(options.capacity.get())),
                idle: Mutex::new(Vec::with_capacity(options.capacity.get())),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.inner.cache.as_ref()
    }

    /// Check out a session, waiting up to the acquire timeout for one to
    /// become free.
    pub async fn acquire(&self) -> Result<SessionScope> {
        self.acquire_with(&CancellationToken::new()).await
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`Cancelled`](ErrorKind::Cancelled) as soon as `token` fires while
    /// waiting. A cancelled caller never receives a session.
    #[instrument("acquiring session", skip_all, fields(connector = self.inner.connector.name()))]
    pub async fn acquire_with(&self, token: &CancellationToken) -> Result<SessionScope> {
        if self.inner.closed.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::PoolClosed);
        }
        let permit = tokio::select! {
            biased;
            () = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
            permit = Arc::clone(&self.inner.permits).acquire_owned() => {
                // The semaphore is only ever closed by `close`.
                permit.or_raise(|| ErrorKind::PoolClosed)?
            },
            () = tokio::time::sleep(self.inner.options.acquire_timeout) => {
                tracing::warn!(timeout = ?self.inner.options.acquire_timeout, "No session became free in time");
                exn::bail!(ErrorKind::PoolExhausted)
            },
        };
        // On failure the permit is dropped here, returning the slot.
        let session = self.inner.checkout().await?;
        self.inner.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = session.id(), "Checked out session");
        Ok(SessionScope::new(session, permit, Arc::clone(&self.inner)))
    }

    /// Return a scope's session to the pool. Dropping the scope does the same.
    pub fn release(&self, scope: SessionScope) {
        drop(scope);
    }

    pub fn status(&self) -> PoolStatus {
        let capacity = self.inner.options.capacity.get();
        let available = self.inner.permits.available_permits().min(capacity);
        PoolStatus { capacity, in_flight: capacity - available, available, idle: self.inner.idle_len() }
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            acquisitions: c.acquisitions.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            opened: c.opened.load(Ordering::Relaxed),
        }
    }

    /// Drop idle sessions and refuse further acquisitions with
    /// [`PoolClosed`](ErrorKind::PoolClosed). Sessions still checked out are
    /// dropped when their scope ends.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let idle = std::mem::take(&mut *self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner));
        tracing::info!(connector = self.inner.connector.name(), dropped = idle.len(), "Closed connection pool");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl PoolInner {
    fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// An idle session that still answers a ping, or a freshly opened one.
    async fn checkout(&self) -> Result<SessionHandle> {
        loop {
            let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
            let Some(mut session) = idle else { break };
            match session.ping().await {
                Ok(()) => return Ok(session),
                Err(err) => {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(session = session.id(), error = %err, "Discarding dead session");
                },
            }
        }
        let session = self.connector.connect().await.map_err(ErrorKind::store)?;
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = session.id(), "Opened new session");
        Ok(session)
    }

    /// Take a session back from a scope. Must run before the scope's permit
    /// is released so the next waiter finds the session idle.
    pub(crate) fn release(&self, session: SessionHandle, reusable: bool) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        if reusable && !self.closed.load(Ordering::SeqCst) {
            self.idle.lock().unwrap_or_else(PoisonError::into_inner).push(session);
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(session = session.id(), reusable, "Dropping released session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_store::backend::MockConnector;
    use quarry_store::error::ErrorKind as StoreErrorKind;
    use rstest::rstest;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    fn pool(capacity: usize, timeout: Duration) -> (MockConnector, ConnectionPool) {
        let connector = MockConnector::default();
        let options = PoolOptions {
            capacity: NonZeroUsize::new(capacity).unwrap(),
            acquire_timeout: timeout,
            ..Default::default()
        };
        (connector.clone(), ConnectionPool::new(Arc::new(connector), options))
    }

    #[tokio::test]
    async fn test_sessions_are_reused() {
        let (connector, pool) = pool(2, DEFAULT_ACQUIRE_TIMEOUT);
        let first = pool.acquire().await.unwrap().session_id();
        let second = pool.acquire().await.unwrap().session_id();
        assert_eq!(first, second);
        assert_eq!(connector.connects(), 1);
        assert_eq!(pool.stats(), PoolStats { acquisitions: 2, releases: 2, discarded: 0, opened: 1 });
        assert_eq!(pool.status(), PoolStatus { capacity: 2, in_flight: 0, available: 2, idle: 1 });
    }

    #[tokio::test]
    async fn test_status_counts_in_flight() {
        let (_connector, pool) = pool(3, DEFAULT_ACQUIRE_TIMEOUT);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.status(), PoolStatus { capacity: 3, in_flight: 2, available: 1, idle: 0 });
        pool.release(a);
        assert_eq!(pool.status(), PoolStatus { capacity: 3, in_flight: 1, available: 2, idle: 1 });
        drop(b);
        assert_eq!(pool.status().in_flight, 0);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(8)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_more_than_capacity(#[case] capacity: usize) {
        let (connector, pool) = pool(capacity, DEFAULT_ACQUIRE_TIMEOUT);
        let peak = Arc::new(AtomicU64::new(0));
        let tasks = (0..capacity * 4).map(|_| {
            let (pool, connector, peak) = (pool.clone(), connector.clone(), Arc::clone(&peak));
            tokio::spawn(async move {
                let scope = pool.acquire().await.unwrap();
                peak.fetch_max(connector.open_sessions(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                drop(scope);
            })
        });
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= capacity as u64);
        assert_eq!(pool.status().in_flight, 0);
        assert_eq!(pool.stats().acquisitions, pool.stats().releases);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let (_connector, pool) = pool(1, Duration::from_millis(20));
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(*err, ErrorKind::PoolExhausted);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gets_nothing() {
        let (_connector, pool) = pool(1, DEFAULT_ACQUIRE_TIMEOUT);
        let held = pool.acquire().await.unwrap();
        let token = CancellationToken::new();
        let waiter = {
            let (pool, token) = (pool.clone(), token.clone());
            tokio::spawn(async move { pool.acquire_with(&token).await.map(|s| s.session_id()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(*err, ErrorKind::Cancelled);
        // The slot was never taken by the cancelled waiter.
        drop(held);
        assert_eq!(pool.status().in_flight, 0);
        assert_eq!(pool.stats().acquisitions, 1);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let (_connector, pool) = pool(1, DEFAULT_ACQUIRE_TIMEOUT);
        let hold = Duration::from_millis(50);
        let started = Instant::now();
        let first = pool.acquire().await.unwrap();
        let holder = tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            drop(first);
        });
        let second = pool.acquire().await.unwrap();
        assert!(started.elapsed() >= hold);
        drop(second);
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_sessions_are_replaced() {
        let (connector, pool) = pool(2, DEFAULT_ACQUIRE_TIMEOUT);
        let first = pool.acquire().await.unwrap().session_id();
        connector.kill_sessions();
        let second = pool.acquire().await.unwrap().session_id();
        assert_ne!(first, second);
        assert_eq!(connector.connects(), 2);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_slot() {
        struct Unreachable;
        #[async_trait::async_trait]
        impl quarry_store::backend::Connector for Unreachable {
            fn name(&self) -> &str {
                "unreachable"
            }
            fn schema(&self) -> &quarry_store::Schema {
                unreachable!()
            }
            async fn connect(&self) -> quarry_store::error::Result<SessionHandle> {
                exn::bail!(StoreErrorKind::ConnectionLost)
            }
        }
        let pool = ConnectionPool::new(Arc::new(Unreachable), PoolOptions::default());
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.store_kind(), Some(&StoreErrorKind::ConnectionLost));
        assert_eq!(pool.status().in_flight, 0);
    }

    #[tokio::test]
    async fn test_close() {
        let (connector, pool) = pool(2, DEFAULT_ACQUIRE_TIMEOUT);
        let held = pool.acquire().await.unwrap();
        drop(pool.acquire().await.unwrap());
        assert_eq!(connector.open_sessions(), 2);
        pool.close();
        assert_eq!(connector.open_sessions(), 1);
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(*err, ErrorKind::PoolClosed);
        drop(held);
        assert_eq!(connector.open_sessions(), 0);
        assert!(pool.is_closed());
    }
}
