//! Lendpool is a lazy async pool for connections and objects of any type.
//!
//! Objects are created on demand through a [`Manager`], up to a hard
//! capacity. Borrowers either reuse an idle object, create a new one, or
//! wait until somebody returns one. Returned objects sit in a FIFO and are
//! evicted by a background worker once they have been idle for longer than
//! the configured threshold.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use lendpool::{Manager, Pool};
//!
//! #[derive(Debug)]
//! struct Error;
//!
//! struct Connection;
//!
//! impl Connection {
//!     async fn ping(&self) -> bool {
//!         true
//!     }
//! }
//!
//! struct ConnectionManager;
//!
//! #[async_trait]
//! impl Manager<Connection, Error> for ConnectionManager {
//!     async fn create(&self) -> Result<Connection, Error> {
//!         Ok(Connection)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = Pool::new(ConnectionManager, 16).unwrap();
//!     let conn = pool.borrow().await.unwrap().unwrap();
//!     assert!(conn.ping().await);
//!     conn.release().await.unwrap();
//!     pool.close().await;
//! }
//! ```
#![warn(missing_docs)]

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};

mod config;
pub use config::PoolConfig;
mod errors;
pub use errors::PoolError;
mod idle;
use idle::IdleDeque;
mod object;
pub use object::{ObjectState, PooledObject};
mod scheduler;
use scheduler::Scheduler;
mod stats;
pub use stats::Status;
use stats::{now_millis, PoolStats};

/// Slack added to the idle timeout when scheduling an eviction so the
/// fired task observes the idle interval as already elapsed.
const EVICTION_SLACK: Duration = Duration::from_millis(100);

/// This trait is used to create, validate and dispose of pooled objects.
///
/// `validate` and `invalidate` have permissive defaults so the simplest
/// manager only implements `create`.
#[async_trait]
pub trait Manager<T, E> {
    /// Create a new instance of `T`.
    async fn create(&self) -> Result<T, E>;

    /// Cheap liveness check, run on borrow and/or return when configured.
    /// An error counts as "not valid".
    async fn validate(&self, _obj: &PooledObject<T>) -> Result<bool, E> {
        Ok(true)
    }

    /// Dispose of an object leaving the pool. Errors are logged and
    /// swallowed; disposal is best-effort.
    async fn invalidate(&self, _obj: &PooledObject<T>) -> Result<(), E> {
        Ok(())
    }
}

struct PoolInner<T, E> {
    manager: Box<dyn Manager<T, E> + Send + Sync>,
    config: PoolConfig,
    closed: AtomicBool,
    next_id: AtomicU64,
    /// Identity map of every live object, keyed by [`PooledObject::id`].
    /// Removal from this map is the single destruction guard: only the
    /// caller that wins the removal runs `Manager::invalidate`.
    all_objects: DashMap<u64, Arc<PooledObject<T>>>,
    idle: IdleDeque<T>,
    scheduler: Scheduler,
    stats: PoolStats,
    /// Serializes the capacity-bounded creation path. A creator that loses
    /// the capacity re-check falls back to waiting on the idle deque.
    create_lock: Mutex<()>,
    /// Read side: borrow/return traffic. Write side: close and eviction.
    /// Never held across the idle-deque poll, so parked borrowers cannot
    /// starve close or eviction.
    pool_lock: RwLock<()>,
}

/// A generic object and connection pool.
///
/// This struct can be cloned and transferred across task boundaries and
/// uses reference counting for its internal state.
pub struct Pool<T, E> {
    inner: Arc<PoolInner<T, E>>,
}

impl<T, E> Clone for Pool<T, E> {
    fn clone(&self) -> Pool<T, E> {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for Pool<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .field("status", &self.inner.stats.snapshot())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<T, E> Pool<T, E>
where
    T: Send + Sync + 'static,
    E: fmt::Debug + Send + Sync + 'static,
{
    /// Create a new pool with a given `manager` and `max_pool_size`; every
    /// other option keeps its default.
    pub fn new(
        manager: impl Manager<T, E> + Send + Sync + 'static,
        max_pool_size: usize,
    ) -> Result<Pool<T, E>, PoolError<E>> {
        Self::from_config(manager, PoolConfig::new(max_pool_size))
    }

    /// Create a new pool with a given `manager` and `config`.
    pub fn from_config(
        manager: impl Manager<T, E> + Send + Sync + 'static,
        config: PoolConfig,
    ) -> Result<Pool<T, E>, PoolError<E>> {
        config.validate().map_err(PoolError::Config)?;
        tracing::debug!(max_pool_size = config.max_pool_size, "object pool created");
        Ok(Pool {
            inner: Arc::new(PoolInner {
                manager: Box::new(manager),
                scheduler: Scheduler::new(config.worker_lifetime),
                config,
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                all_objects: DashMap::new(),
                idle: IdleDeque::new(),
                stats: PoolStats::default(),
                create_lock: Mutex::new(()),
                pool_lock: RwLock::new(()),
            }),
        })
    }

    /// Borrow an object from the pool.
    ///
    /// Reuses an idle object when one is available, creates a new one
    /// while the pool is below capacity, and otherwise waits according to
    /// [`PoolConfig::poll_timeout`]. `Ok(None)` is only returned in
    /// non-blocking mode (zero poll timeout) when nothing is immediately
    /// available.
    pub async fn borrow(&self) -> Result<Option<Object<T, E>>, PoolError<E>> {
        let inner = &self.inner;
        loop {
            if inner.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }

            if let Some(candidate) = inner.idle.try_poll() {
                if let Some(object) = self.hand_out(candidate, false).await {
                    return Ok(Some(object));
                }
                continue;
            }

            if inner.stats.pool_size() < inner.config.max_pool_size {
                let created = {
                    let _create = inner.create_lock.lock().await;
                    if inner.stats.pool_size() < inner.config.max_pool_size {
                        let object = inner.create_with_retries().await?;
                        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                        let pooled = Arc::new(PooledObject::new(id, object, now_millis()));
                        inner.all_objects.insert(id, Arc::clone(&pooled));
                        inner.stats.record_created();
                        Some(pooled)
                    } else {
                        // Lost the capacity re-check; wait on the deque
                        // like everybody else.
                        None
                    }
                };
                if let Some(pooled) = created {
                    if let Some(object) = self.hand_out(pooled, true).await {
                        return Ok(Some(object));
                    }
                    continue;
                }
            }

            let candidate = match inner.config.poll_timeout {
                Some(limit) if limit.is_zero() => return Ok(None),
                Some(limit) => match inner.idle.poll(Some(limit)).await {
                    Some(candidate) => candidate,
                    None => {
                        if inner.closed.load(Ordering::Acquire) {
                            // Woken by close; fail at the loop head.
                            continue;
                        }
                        return Err(PoolError::PollTimeout(limit));
                    }
                },
                None => match inner.idle.poll(None).await {
                    Some(candidate) => candidate,
                    None => continue,
                },
            };
            if let Some(object) = self.hand_out(candidate, false).await {
                return Ok(Some(object));
            }
        }
    }

    /// Return a borrowed object to the pool.
    ///
    /// When the pool is closed, the idle timeout is zero, or
    /// return-validation fails, the object is invalidated instead of
    /// re-pooled; none of these raise an error. The error cases are an
    /// object the pool does not know ([`PoolError::NotInPool`]) and an
    /// object that is not currently borrowed ([`PoolError::DoubleReturn`]).
    pub async fn return_object(
        &self,
        pooled: Arc<PooledObject<T>>,
    ) -> Result<(), PoolError<E>> {
        let inner = &self.inner;
        // Identity lookup: same id *and* same wrapper instance. An object
        // of another pool never passes, even on an id collision.
        match inner.all_objects.get(&pooled.id()) {
            Some(entry) if Arc::ptr_eq(entry.value(), &pooled) => {}
            _ => return Err(PoolError::NotInPool),
        }

        let _guard = inner.pool_lock.read().await;
        let now = now_millis();
        if !pooled.try_mark_returned(now) {
            return Err(PoolError::DoubleReturn);
        }

        let discard = inner.closed.load(Ordering::Acquire)
            || matches!(inner.config.idle_timeout, Some(limit) if limit.is_zero())
            || (inner.config.validate_on_return && !inner.run_validate(&pooled).await);
        if discard {
            inner.invalidate_object(&pooled).await;
            return Ok(());
        }

        pooled.cancel_eviction();
        if let Some(idle_timeout) = inner.config.idle_timeout {
            let handle = self.schedule_eviction(pooled.id(), idle_timeout + EVICTION_SLACK);
            pooled.set_eviction(handle);
        }
        inner.idle.push(Arc::clone(&pooled));
        inner.stats.record_returned(now);
        Ok(())
    }

    /// Close the pool. Idempotent.
    ///
    /// Shuts down the eviction scheduler, wakes parked borrowers (they
    /// fail with [`PoolError::Closed`]) and invalidates every idle object.
    /// Borrowed objects are not reclaimed; they are invalidated when their
    /// holders return them.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("closing object pool");
        inner.scheduler.shutdown();
        inner.idle.close();
        let _guard = inner.pool_lock.write().await;
        while let Some(pooled) = inner.idle.try_poll() {
            inner.invalidate_object(&pooled).await;
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Retrieve a snapshot of the pool counters.
    pub fn status(&self) -> Status {
        self.inner.stats.snapshot()
    }

    /// Human-readable snapshot of pool state, stats, configuration and
    /// scheduler state.
    pub fn debug_info(&self) -> String {
        let inner = &self.inner;
        let status = inner.stats.snapshot();
        let last_access = status
            .last_access()
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| "never".to_string());
        format!(
            "pool: closed={} size={}/{} idle={}\n\
             stats: created={} invalidated={} borrowed={} returned={} last_access={}\n\
             scheduler: worker_alive={} pending_evictions={}\n\
             config: {:?}",
            inner.closed.load(Ordering::Acquire),
            status.pool_size,
            inner.config.max_pool_size,
            inner.idle.len(),
            status.created,
            status.invalidated,
            status.borrowed,
            status.returned,
            last_access,
            inner.scheduler.worker_alive(),
            inner.scheduler.pending(),
            inner.config,
        )
    }

    /// Mark an object borrowed and wrap it for the caller. Fresh objects
    /// skip validation; polled candidates are checked under the read lock
    /// so they cannot race eviction or close.
    async fn hand_out(&self, pooled: Arc<PooledObject<T>>, fresh: bool) -> Option<Object<T, E>> {
        let inner = &self.inner;
        let _guard = inner.pool_lock.read().await;
        if !fresh {
            if !pooled.is_valid() {
                // Evicted between the deque pop and here; the evictor
                // already destroyed it.
                return None;
            }
            if inner.config.validate_on_borrow && !inner.run_validate(&pooled).await {
                inner.invalidate_object(&pooled).await;
                return None;
            }
            pooled.cancel_eviction();
        }
        if !pooled.try_mark_borrowed(now_millis()) {
            return None;
        }
        inner.stats.record_borrowed(now_millis());
        Some(Object {
            pooled: Some(pooled),
            pool: Arc::downgrade(&self.inner),
        })
    }

    fn schedule_eviction(&self, id: u64, delay: Duration) -> scheduler::TaskHandle {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(
            delay,
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.evict_if_idle(id).await;
                }
            }
            .boxed(),
        )
    }
}

impl<T, E> PoolInner<T, E>
where
    T: Send + Sync + 'static,
    E: fmt::Debug + Send + Sync + 'static,
{
    async fn create_with_retries(&self) -> Result<T, PoolError<E>> {
        let max_attempts = self.config.create_retry_count + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.manager.create().await {
                Ok(object) => return Ok(object),
                Err(error) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error = ?error,
                        "object creation failed"
                    );
                    if attempt >= max_attempts {
                        return Err(PoolError::CreateFailed {
                            attempts: attempt,
                            error,
                        });
                    }
                }
            }
        }
    }

    async fn run_validate(&self, pooled: &Arc<PooledObject<T>>) -> bool {
        match self.manager.validate(pooled).await {
            Ok(valid) => valid,
            Err(error) => {
                tracing::warn!(id = pooled.id(), error = ?error, "object validation failed");
                false
            }
        }
    }

    /// Remove an object from the pool and dispose of it. The `all_objects`
    /// removal decides the single winner; everybody else backs off.
    async fn invalidate_object(&self, pooled: &Arc<PooledObject<T>>) -> bool {
        if self.all_objects.remove(&pooled.id()).is_none() {
            return false;
        }
        pooled.cancel_eviction();
        pooled.mark_invalid();
        self.idle.remove(pooled.id());
        self.stats.record_invalidated();
        if let Err(error) = self.manager.invalidate(pooled).await {
            tracing::warn!(id = pooled.id(), error = ?error, "failed to dispose of pooled object");
        }
        true
    }

    /// Eviction task body. Double-checks everything under the write lock:
    /// borrow or return may have raced the (advisory) cancellation.
    async fn evict_if_idle(&self, id: u64) {
        let _guard = self.pool_lock.write().await;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let pooled = match self.all_objects.get(&id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return,
        };
        if pooled.state() != ObjectState::Returned {
            return;
        }
        if !self.is_idle_overdue(&pooled) {
            return;
        }
        tracing::debug!(id, "evicting idle object");
        self.invalidate_object(&pooled).await;
    }

    fn is_idle_overdue(&self, pooled: &PooledObject<T>) -> bool {
        match self.config.idle_timeout {
            Some(limit) if limit.is_zero() => true,
            Some(limit) => {
                let last_returned = pooled.last_returned_at();
                last_returned > 0
                    && now_millis().saturating_sub(last_returned) >= limit.as_millis() as i64
            }
            None => false,
        }
    }
}

/// A borrowed object.
///
/// Dereferences to the wrapped `T`. Return it with
/// [`release`](Object::release); an `Object` dropped without being
/// released stays accounted as borrowed until the pool closes, and a
/// warning is logged.
pub struct Object<T, E> {
    pooled: Option<Arc<PooledObject<T>>>,
    pool: Weak<PoolInner<T, E>>,
}

impl<T, E> Object<T, E>
where
    T: Send + Sync + 'static,
    E: fmt::Debug + Send + Sync + 'static,
{
    /// Return the object to its pool.
    pub async fn release(mut self) -> Result<(), PoolError<E>> {
        let pooled = match self.pooled.take() {
            Some(pooled) => pooled,
            None => return Ok(()),
        };
        match self.pool.upgrade() {
            Some(inner) => Pool { inner }.return_object(pooled).await,
            None => Ok(()),
        }
    }
}

impl<T, E> Object<T, E> {
    /// The pool-side wrapper carrying identity, state and timestamps.
    pub fn pooled_object(&self) -> &Arc<PooledObject<T>> {
        self.pooled.as_ref().unwrap()
    }

    /// Surrender the wrapper without returning it. The caller becomes
    /// responsible for handing it back via [`Pool::return_object`].
    pub fn detach(mut self) -> Arc<PooledObject<T>> {
        self.pooled.take().unwrap()
    }
}

impl<T, E> Deref for Object<T, E> {
    type Target = T;
    fn deref(&self) -> &T {
        self.pooled.as_ref().unwrap().object()
    }
}

impl<T, E> Drop for Object<T, E> {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            if self.pool.upgrade().is_some() {
                tracing::warn!(
                    id = pooled.id(),
                    "borrowed object dropped without release; \
                     it stays borrowed until the pool closes"
                );
            }
        }
    }
}

impl<T, E> fmt::Debug for Object<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object").field("pooled", &self.pooled).finish()
    }
}
