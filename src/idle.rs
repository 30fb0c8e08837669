use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::object::PooledObject;

/// FIFO of returned, available objects.
///
/// Insertion at the tail, polling at the head. Waiting is implemented with
/// a [`Notify`]: every push wakes one parked poller, closing wakes all of
/// them. Pollers always re-check the deque after waking, so stray wakeups
/// are harmless.
pub(crate) struct IdleDeque<T> {
    deque: Mutex<VecDeque<Arc<PooledObject<T>>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> IdleDeque<T> {
    pub(crate) fn new() -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append at the tail and wake one parked poller.
    pub(crate) fn push(&self, obj: Arc<PooledObject<T>>) {
        self.deque.lock().push_back(obj);
        self.notify.notify_one();
    }

    /// Non-blocking poll of the head.
    pub(crate) fn try_poll(&self) -> Option<Arc<PooledObject<T>>> {
        self.deque.lock().pop_front()
    }

    /// Poll the head, parking until an object arrives.
    ///
    /// `limit` bounds the wait; `None` waits indefinitely. Returns `None`
    /// when the limit elapses or the deque is closed.
    pub(crate) async fn poll(&self, limit: Option<Duration>) -> Option<Arc<PooledObject<T>>> {
        let deadline = limit.map(|d| Instant::now() + d);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            // Register for wakeups before re-checking the deque, otherwise
            // a push between the check and the park would be lost.
            let notified = self.notify.notified();
            if let Some(obj) = self.try_poll() {
                return Some(obj);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        return self.try_poll();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Remove a specific object by identity. Used by eviction so the deque
    /// only ever holds objects in the `Returned` state.
    pub(crate) fn remove(&self, id: u64) -> Option<Arc<PooledObject<T>>> {
        let mut deque = self.deque.lock();
        let pos = deque.iter().position(|obj| obj.id() == id)?;
        deque.remove(pos)
    }

    pub(crate) fn len(&self) -> usize {
        self.deque.lock().len()
    }

    /// Stop handing out objects from `poll` and wake every parked poller.
    /// `try_poll` keeps working so the pool can drain the remainder.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::now_millis;

    fn entry(id: u64) -> Arc<PooledObject<&'static str>> {
        Arc::new(PooledObject::new(id, "conn", now_millis()))
    }

    #[tokio::test]
    async fn polls_in_fifo_order() {
        let deque = IdleDeque::new();
        deque.push(entry(1));
        deque.push(entry(2));
        deque.push(entry(3));
        assert_eq!(deque.try_poll().unwrap().id(), 1);
        assert_eq!(deque.try_poll().unwrap().id(), 2);
        assert_eq!(deque.try_poll().unwrap().id(), 3);
        assert!(deque.try_poll().is_none());
    }

    #[tokio::test]
    async fn bounded_poll_times_out_empty() {
        let deque: IdleDeque<&'static str> = IdleDeque::new();
        let start = Instant::now();
        let polled = deque.poll(Some(Duration::from_millis(50))).await;
        assert!(polled.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn parked_poll_wakes_on_push() {
        let deque = Arc::new(IdleDeque::new());
        let waiter = {
            let deque = Arc::clone(&deque);
            tokio::spawn(async move { deque.poll(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        deque.push(entry(7));
        let polled = waiter.await.unwrap();
        assert_eq!(polled.unwrap().id(), 7);
    }

    #[tokio::test]
    async fn close_wakes_unbounded_poll() {
        let deque: Arc<IdleDeque<&'static str>> = Arc::new(IdleDeque::new());
        let waiter = {
            let deque = Arc::clone(&deque);
            tokio::spawn(async move { deque.poll(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        deque.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_takes_object_out_of_the_middle() {
        let deque = IdleDeque::new();
        deque.push(entry(1));
        deque.push(entry(2));
        deque.push(entry(3));
        assert_eq!(deque.remove(2).unwrap().id(), 2);
        assert!(deque.remove(2).is_none());
        assert_eq!(deque.len(), 2);
        assert_eq!(deque.try_poll().unwrap().id(), 1);
        assert_eq!(deque.try_poll().unwrap().id(), 3);
    }
}
