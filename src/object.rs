use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::scheduler::TaskHandle;

/// Lifecycle state of a [`PooledObject`].
///
/// Valid transitions are `New → Borrowed`, `Borrowed → Returned`,
/// `Returned → Borrowed` and from any live state to the terminal
/// `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    /// Created but never handed out.
    New = 0,
    /// Currently held by a borrower.
    Borrowed = 1,
    /// Idle in the pool, available for the next borrower.
    Returned = 2,
    /// Removed from the pool. Terminal.
    Invalid = 3,
}

impl ObjectState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ObjectState::New,
            1 => ObjectState::Borrowed,
            2 => ObjectState::Returned,
            _ => ObjectState::Invalid,
        }
    }
}

/// The pool's wrapper around a user object.
///
/// Carries the lifecycle state, the millisecond timestamps of the last
/// borrow/return and the handle of the pending eviction task, if any.
/// Identity within the pool is the numeric [`id`](Self::id), assigned
/// once at creation.
pub struct PooledObject<T> {
    id: u64,
    object: T,
    state: AtomicU8,
    created_at: i64,
    last_borrowed_at: AtomicI64,
    last_returned_at: AtomicI64,
    eviction: Mutex<Option<TaskHandle>>,
}

impl<T> PooledObject<T> {
    pub(crate) fn new(id: u64, object: T, now_ms: i64) -> Self {
        Self {
            id,
            object,
            state: AtomicU8::new(ObjectState::New as u8),
            created_at: now_ms,
            last_borrowed_at: AtomicI64::new(0),
            last_returned_at: AtomicI64::new(0),
            eviction: Mutex::new(None),
        }
    }

    /// The pool-assigned identity of this object.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The wrapped user object.
    pub fn object(&self) -> &T {
        &self.object
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ObjectState {
        ObjectState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the object has not been invalidated.
    pub fn is_valid(&self) -> bool {
        self.state() != ObjectState::Invalid
    }

    /// Whether the object is currently held by a borrower.
    pub fn is_borrowed(&self) -> bool {
        self.state() == ObjectState::Borrowed
    }

    /// Creation time, milliseconds since the Unix epoch.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Last borrow time, milliseconds since the Unix epoch. Zero if the
    /// object was never borrowed.
    pub fn last_borrowed_at(&self) -> i64 {
        self.last_borrowed_at.load(Ordering::Acquire)
    }

    /// Last return time, milliseconds since the Unix epoch. Zero if the
    /// object was never returned.
    pub fn last_returned_at(&self) -> i64 {
        self.last_returned_at.load(Ordering::Acquire)
    }

    fn transition(&self, from: ObjectState, to: ObjectState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transition to `Borrowed` from either `New` or `Returned`. Racing
    /// callers resolve to exactly one winner.
    pub(crate) fn try_mark_borrowed(&self, now_ms: i64) -> bool {
        let ok = self.transition(ObjectState::New, ObjectState::Borrowed)
            || self.transition(ObjectState::Returned, ObjectState::Borrowed);
        if ok {
            self.last_borrowed_at.store(now_ms, Ordering::Release);
        }
        ok
    }

    /// Transition `Borrowed → Returned`. Fails for anything else, which is
    /// how a double return is detected.
    pub(crate) fn try_mark_returned(&self, now_ms: i64) -> bool {
        let ok = self.transition(ObjectState::Borrowed, ObjectState::Returned);
        if ok {
            self.last_returned_at.store(now_ms, Ordering::Release);
        }
        ok
    }

    /// Enter the terminal `Invalid` state.
    pub(crate) fn mark_invalid(&self) {
        self.state.store(ObjectState::Invalid as u8, Ordering::Release);
    }

    /// Store the handle of a freshly scheduled eviction task, cancelling
    /// any previous one.
    pub(crate) fn set_eviction(&self, handle: TaskHandle) {
        let mut slot = self.eviction.lock();
        if let Some(old) = slot.take() {
            old.cancel();
        }
        *slot = Some(handle);
    }

    /// Cancel the pending eviction task, if any. Missed cancellations are
    /// harmless: the task re-checks state under the pool write lock.
    pub(crate) fn cancel_eviction(&self) {
        if let Some(handle) = self.eviction.lock().take() {
            handle.cancel();
        }
    }
}

impl<T> std::fmt::Debug for PooledObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledObject")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .field("last_borrowed_at", &self.last_borrowed_at())
            .field("last_returned_at", &self.last_returned_at())
            .finish()
    }
}
