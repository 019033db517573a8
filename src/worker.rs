//! Worker pool for independent units of work.
//!
//! Units are synchronous closures (the storage SPI is synchronous), so they
//! run on tokio's blocking pool. Concurrency can be capped with a
//! [`Semaphore`]; [`WorkerPool::idle`] resolves once nothing is in flight,
//! including units submitted by other units.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::{Notify, Semaphore};

/// Configuration for a [`WorkerPool`].
///
/// # Examples
///
/// ```
/// use eventpipe_es::WorkerPoolConfig;
///
/// let config = WorkerPoolConfig::default()
///     .with_max_workers(4)
///     .with_name("rabbits");
/// assert_eq!(config.max_workers, Some(4));
/// ```
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of units running at once. `None` leaves the limit to
    /// tokio's blocking pool.
    pub max_workers: Option<usize>,
    /// Name used in log fields.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            name: "eventpipe".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// Cap concurrent units at `max` (at least one).
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max.max(1));
        self
    }

    /// Set the pool name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

struct PoolInner {
    handle: Handle,
    permits: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    submitted: AtomicU64,
    panicked: AtomicU64,
    idle: Notify,
    name: String,
}

/// Counts a unit as in flight until dropped.
struct InFlight(Arc<PoolInner>);

impl InFlight {
    fn enter(inner: &Arc<PoolInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        inner.submitted.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(inner))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Handle to a tokio-backed worker pool. `Clone` is cheap.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool that spawns onto `handle`.
    pub fn new(handle: Handle, config: WorkerPoolConfig) -> Self {
        let permits = config.max_workers.map(|n| Arc::new(Semaphore::new(n)));
        tracing::debug!(
            pool = %config.name,
            max_workers = ?config.max_workers,
            "worker pool created"
        );
        Self {
            inner: Arc::new(PoolInner {
                handle,
                permits,
                in_flight: AtomicUsize::new(0),
                submitted: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
                idle: Notify::new(),
                name: config.name,
            }),
        }
    }

    /// Create an unbounded pool on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TryCurrentError`] when called outside a runtime.
    pub fn current() -> Result<Self, TryCurrentError> {
        Self::current_with(WorkerPoolConfig::default())
    }

    /// Create a pool with `config` on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TryCurrentError`] when called outside a runtime.
    pub fn current_with(config: WorkerPoolConfig) -> Result<Self, TryCurrentError> {
        Ok(Self::new(Handle::try_current()?, config))
    }

    /// Run `unit` on the pool. Never blocks the caller.
    ///
    /// A panic inside `unit` is caught and logged.
    pub fn submit<F>(&self, unit: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = InFlight::enter(&self.inner);
        let inner = Arc::clone(&self.inner);

        match &self.inner.permits {
            None => {
                self.inner.handle.spawn_blocking(move || {
                    run_unit(&inner, unit);
                    drop(guard);
                });
            }
            Some(permits) => {
                let permits = Arc::clone(permits);
                self.inner.handle.spawn(async move {
                    // The semaphore is never closed.
                    let Ok(permit) = permits.acquire_owned().await else {
                        return;
                    };
                    let handle = inner.handle.clone();
                    let blocking = handle.spawn_blocking(move || {
                        run_unit(&inner, unit);
                        drop(permit);
                        drop(guard);
                    });
                    let _ = blocking.await;
                });
            }
        }
    }

    /// Wait until no unit is in flight.
    pub async fn idle(&self) {
        loop {
            let mut notified = pin!(self.inner.idle.notified());
            // Register before checking so a wake-up between the check and
            // the await is not lost.
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Number of units submitted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Total number of units ever submitted.
    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    /// Number of units that panicked.
    pub fn panicked(&self) -> u64 {
        self.inner.panicked.load(Ordering::Relaxed)
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

fn run_unit<F: FnOnce()>(inner: &PoolInner, unit: F) {
    if catch_unwind(AssertUnwindSafe(unit)).is_err() {
        inner.panicked.fetch_add(1, Ordering::Relaxed);
        tracing::error!(pool = %inner.name, "worker unit panicked");
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("in_flight", &self.in_flight())
            .field(
                "submitted",
                &self.inner.submitted.load(Ordering::Relaxed),
            )
            .finish()
    }
}
