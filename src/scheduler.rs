//! Recurring and one-shot callback scheduling.
//!
//! The controller never owns timers directly; it asks a [`Scheduler`] for a recurring poll and a
//! one-shot hold timer and keeps only the returned [`TaskHandle`]s.
//!
//! - [`TokioScheduler`] runs callbacks on spawned tokio tasks.
//! - [`ManualScheduler`] records what was scheduled and fires callbacks only when a test asks,
//!   so state-machine tests are deterministic.

use crate::error::{AppResult, ThermoError};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

/// Shortest recurring period [`TokioScheduler`] accepts.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Callback invoked by a scheduler; each invocation produces a fresh future.
pub type ScheduledCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Opaque identifier of a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// Raw identifier, unique per scheduler.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Delayed-callback service.
pub trait Scheduler: Send + Sync {
    /// Run `callback` after `initial_delay`, then every `period`.
    fn schedule_recurring(
        &self,
        callback: ScheduledCallback,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskHandle;

    /// Run `callback` once after `delay`.
    fn schedule_once(&self, callback: ScheduledCallback, delay: Duration) -> TaskHandle;

    /// Cancel a pending callback. Returns false if it had already fired or was unknown.
    fn cancel(&self, handle: TaskHandle) -> bool;
}

// ============================================================================
// Tokio scheduler
// ============================================================================

/// Scheduler backed by tokio tasks and timers.
///
/// Each callback invocation runs on its own task, so cancelling a handle from inside its own
/// callback never aborts the invocation that is already running.
pub struct TokioScheduler {
    runtime: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl TokioScheduler {
    /// Create a scheduler on the current tokio runtime.
    pub fn new() -> AppResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| ThermoError::Configuration(format!("no tokio runtime: {e}")))?;
        Ok(Self::with_handle(runtime))
    }

    /// Create a scheduler that spawns onto the given runtime.
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of callbacks that are still scheduled.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn register(&self, id: u64, task: JoinHandle<()>) -> TaskHandle {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task);
        TaskHandle(id)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_recurring(
        &self,
        callback: ScheduledCallback,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let runtime = self.runtime.clone();
        let period = period.max(MIN_PERIOD);
        let task = self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!(task = id, "recurring callback");
                // Awaited so ticks never overlap; detached if this loop is aborted.
                let _ = runtime.spawn(callback()).await;
            }
        });
        self.register(id, task)
    }

    fn schedule_once(&self, callback: ScheduledCallback, delay: Duration) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            trace!(task = id, "one-shot callback");
            callback().await;
        });
        self.register(id, task)
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.values() {
            task.abort();
        }
    }
}

// ============================================================================
// Manual scheduler
// ============================================================================

/// What a [`ManualScheduler`] entry was scheduled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEntry {
    /// Handle returned to the caller
    pub handle: TaskHandle,
    /// Delay before the first invocation
    pub delay: Duration,
    /// `None` for one-shot entries
    pub period: Option<Duration>,
}

struct ManualTask {
    entry: ScheduledEntry,
    callback: ScheduledCallback,
}

/// Scheduler that only fires when told to.
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    tasks: Mutex<Vec<ManualTask>>,
}

impl ManualScheduler {
    /// Scheduler with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries that are still scheduled, in scheduling order.
    pub fn pending(&self) -> Vec<ScheduledEntry> {
        self.lock().iter().map(|task| task.entry).collect()
    }

    /// Pending recurring entries.
    pub fn recurring(&self) -> Vec<ScheduledEntry> {
        self.pending()
            .into_iter()
            .filter(|entry| entry.period.is_some())
            .collect()
    }

    /// Pending one-shot entries.
    pub fn one_shots(&self) -> Vec<ScheduledEntry> {
        self.pending()
            .into_iter()
            .filter(|entry| entry.period.is_none())
            .collect()
    }

    /// Invoke one entry. One-shot entries are removed before their callback runs.
    ///
    /// Returns false if the handle is not pending.
    pub async fn fire(&self, handle: TaskHandle) -> bool {
        let callback = {
            let mut tasks = self.lock();
            let Some(position) = tasks.iter().position(|t| t.entry.handle == handle) else {
                return false;
            };
            if tasks[position].entry.period.is_none() {
                tasks.remove(position).callback
            } else {
                Arc::clone(&tasks[position].callback)
            }
        };
        callback().await;
        true
    }

    /// Invoke every pending recurring entry once.
    pub async fn tick_recurring(&self) -> usize {
        let mut fired = 0;
        for entry in self.recurring() {
            if self.fire(entry.handle).await {
                fired += 1;
            }
        }
        fired
    }

    /// Invoke every pending one-shot entry.
    pub async fn fire_one_shots(&self) -> usize {
        let mut fired = 0;
        for entry in self.one_shots() {
            if self.fire(entry.handle).await {
                fired += 1;
            }
        }
        fired
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ManualTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        &self,
        callback: ScheduledCallback,
        delay: Duration,
        period: Option<Duration>,
    ) -> TaskHandle {
        let handle = TaskHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(ManualTask {
            entry: ScheduledEntry {
                handle,
                delay,
                period,
            },
            callback,
        });
        handle
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_recurring(
        &self,
        callback: ScheduledCallback,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskHandle {
        self.insert(callback, initial_delay, Some(period))
    }

    fn schedule_once(&self, callback: ScheduledCallback, delay: Duration) -> TaskHandle {
        self.insert(callback, delay, None)
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|task| task.entry.handle != handle);
        tasks.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, ScheduledCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let callback: ScheduledCallback = Arc::new(move || {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner.fetch_add(1, Ordering::SeqCst);
            })
        });
        (count, callback)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_recurring_and_cancel() {
        let scheduler = TokioScheduler::new().unwrap();
        let (count, callback) = counter();
        let handle = scheduler.schedule_recurring(
            callback,
            Duration::from_millis(100),
            Duration::from_millis(100),
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert!(scheduler.cancel(handle));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!scheduler.cancel(handle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_once_fires_once() {
        let scheduler = TokioScheduler::new().unwrap();
        let (count, callback) = counter();
        let handle = scheduler.schedule_once(callback, Duration::from_secs(120));
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
        assert!(!scheduler.cancel(handle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_cancelled_once_never_fires() {
        let scheduler = TokioScheduler::new().unwrap();
        let (count, callback) = counter();
        let handle = scheduler.schedule_once(callback, Duration::from_secs(1));
        assert!(scheduler.cancel(handle));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tokio_scheduler_needs_runtime() {
        assert!(TokioScheduler::new().is_err());
    }

    #[tokio::test]
    async fn test_manual_scheduler_records_and_fires() {
        let scheduler = ManualScheduler::new();
        let (count, callback) = counter();
        let poll = scheduler.schedule_recurring(
            Arc::clone(&callback),
            Duration::ZERO,
            Duration::from_secs(1),
        );
        let hold = scheduler.schedule_once(callback, Duration::from_secs(120));

        assert_eq!(scheduler.recurring().len(), 1);
        assert_eq!(scheduler.one_shots()[0].delay, Duration::from_secs(120));

        assert_eq!(scheduler.tick_recurring().await, 1);
        assert!(scheduler.fire(hold).await);
        assert!(!scheduler.fire(hold).await);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(scheduler.cancel(poll));
        assert!(scheduler.pending().is_empty());
    }
}
