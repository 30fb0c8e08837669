use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use retain_mut::RetainMut;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A deferred unit of work.
pub(crate) type Job = BoxFuture<'static, ()>;

/// Cancellable reference to a scheduled job.
///
/// Cancellation is advisory: a job that already started past the
/// cancellation check still runs, which is why eviction jobs double-check
/// pool state under the write lock.
pub(crate) struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Entry {
    deadline: Instant,
    job: Option<Job>,
    cancelled: Arc<AtomicBool>,
}

impl Entry {
    fn is_dead(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.job.is_none()
    }
}

struct SchedulerInner {
    queue: Mutex<Vec<Entry>>,
    notify: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_lifetime: Option<Duration>,
    shutdown: AtomicBool,
}

/// Single-worker timer queue.
///
/// Jobs run one at a time on a lazily spawned worker task. With a
/// configured `worker_lifetime` the worker exits after that long without
/// work and is respawned by the next `schedule` call.
pub(crate) struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub(crate) fn new(worker_lifetime: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Mutex::new(Vec::new()),
                notify: Notify::new(),
                worker: Mutex::new(None),
                worker_lifetime,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue `job` to run after `delay` and hand back its cancellation
    /// handle. After shutdown the job is dropped and the handle comes back
    /// pre-cancelled.
    pub(crate) fn schedule(&self, delay: Duration, job: Job) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TaskHandle {
            cancelled: Arc::clone(&cancelled),
        };
        if self.inner.shutdown.load(Ordering::Acquire) {
            cancelled.store(true, Ordering::Release);
            return handle;
        }
        {
            let mut queue = self.inner.queue.lock();
            // Opportunistically sweep out entries whose handle was
            // cancelled; the worker does the same before sleeping.
            RetainMut::retain_mut(&mut *queue, |entry: &mut Entry| !entry.is_dead());
            queue.push(Entry {
                deadline: Instant::now() + delay,
                job: Some(job),
                cancelled,
            });
        }
        self.ensure_worker();
        self.inner.notify.notify_one();
        handle
    }

    /// Drop all pending jobs and let the worker wind down. Jobs already
    /// running are not interrupted.
    pub(crate) fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.queue.lock().clear();
        self.inner.notify.notify_waiters();
    }

    /// Number of live (not cancelled, not yet started) jobs.
    pub(crate) fn pending(&self) -> usize {
        self.inner
            .queue
            .lock()
            .iter()
            .filter(|entry| !entry.is_dead())
            .count()
    }

    /// Whether the worker task is currently alive.
    pub(crate) fn worker_alive(&self) -> bool {
        match self.inner.worker.lock().as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    fn ensure_worker(&self) {
        let mut worker = self.inner.worker.lock();
        let respawn = match worker.as_ref() {
            Some(handle) => handle.is_finished(),
            None => true,
        };
        if respawn {
            let inner = Arc::clone(&self.inner);
            *worker = Some(tokio::spawn(run_worker(inner)));
        }
    }
}

async fn run_worker(inner: Arc<SchedulerInner>) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let next_deadline = {
            let mut queue = inner.queue.lock();
            RetainMut::retain_mut(&mut *queue, |entry: &mut Entry| !entry.is_dead());
            queue.iter().map(|entry| entry.deadline).min()
        };
        // Register before deciding to park so a schedule() racing past the
        // queue inspection still wakes us.
        let notified = inner.notify.notified();
        match next_deadline {
            None => match inner.worker_lifetime {
                Some(lifetime) => {
                    if tokio::time::timeout(lifetime, notified).await.is_err() {
                        tracing::debug!("idle eviction worker expired");
                        return;
                    }
                }
                None => notified.await,
            },
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    // Sleep until the earliest job is due or a new job
                    // arrives with an earlier deadline.
                    let _ = tokio::time::timeout(deadline - now, notified).await;
                    continue;
                }
                let mut due: Vec<Job> = Vec::new();
                {
                    let mut queue = inner.queue.lock();
                    RetainMut::retain_mut(&mut *queue, |entry: &mut Entry| {
                        if entry.cancelled.load(Ordering::Acquire) {
                            return false;
                        }
                        if entry.deadline <= now {
                            if let Some(job) = entry.job.take() {
                                due.push(job);
                            }
                            false
                        } else {
                            true
                        }
                    });
                }
                for job in due {
                    job.await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    #[tokio::test]
    async fn runs_job_after_delay() {
        let scheduler = Scheduler::new(None);
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(Duration::from_millis(30), counting_job(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn cancelled_job_never_runs() {
        let scheduler = Scheduler::new(None);
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule(Duration::from_millis(30), counting_job(&counter));
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn jobs_run_in_deadline_order_on_one_worker() {
        let scheduler = Scheduler::new(None);
        let log = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in &[(60u64, "late"), (10u64, "early")] {
            let log = Arc::clone(&log);
            let tag = *tag;
            scheduler.schedule(
                Duration::from_millis(*delay),
                async move {
                    log.lock().push(tag);
                }
                .boxed(),
            );
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn worker_expires_and_respawns() {
        let scheduler = Scheduler::new(Some(Duration::from_millis(40)));
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(Duration::from_millis(10), counting_job(&counter));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scheduler.worker_alive());

        // No work for longer than the lifetime: the worker exits.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!scheduler.worker_alive());

        // Scheduling again brings it back.
        scheduler.schedule(Duration::from_millis(10), counting_job(&counter));
        assert!(scheduler.worker_alive());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_drops_pending_jobs() {
        let scheduler = Scheduler::new(None);
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(Duration::from_millis(50), counting_job(&counter));
        scheduler.shutdown();
        assert_eq!(scheduler.pending(), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let handle = scheduler.schedule(Duration::from_millis(1), counting_job(&counter));
        assert!(handle.is_cancelled());
    }
}
