//! Shared interval scheduler for periodic maintenance loops.
//!
//! A single background thread fires every registered task when its interval
//! elapses. Tasks run on that thread, one after another, so a slow task delays
//! the others rather than running concurrently with them. Task callbacks are
//! invoked with no scheduler lock held, which lets a callback schedule, pause
//! or cancel tasks (including itself) without deadlocking.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Identifier of a scheduled task.
pub type TaskId = u64;

/// Callback invoked each time a task fires.
pub type TaskFn = Arc<dyn Fn() + Send + Sync>;

/// Smallest interval a task may use.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// How long the loop sleeps when no task is scheduled.
const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Wake,
    Shutdown,
}

struct ScheduledTask {
    id: TaskId,
    name: String,
    interval: Duration,
    next_due: Instant,
    paused: bool,
    runs: u64,
    callback: TaskFn,
}

/// Snapshot of one scheduled task, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub interval: Duration,
    pub paused: bool,
    pub runs: u64,
}

struct Shared {
    tasks: Mutex<Vec<ScheduledTask>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
    panics: AtomicU64,
}

/// Single-threaded scheduler firing tasks at fixed intervals.
///
/// # Example
///
/// ```
/// use pdf_reader_scheduler::IntervalScheduler;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let scheduler = IntervalScheduler::start("cache-maintenance");
/// let ticks = Arc::new(AtomicUsize::new(0));
/// let counter = ticks.clone();
///
/// let id = scheduler.schedule("cleanup", Duration::from_secs(30), move || {
///     counter.fetch_add(1, Ordering::Relaxed);
/// });
///
/// // Run immediately without waiting for the interval.
/// scheduler.run_now(id);
/// assert_eq!(ticks.load(Ordering::Relaxed), 1);
///
/// scheduler.stop();
/// ```
pub struct IntervalScheduler {
    shared: Arc<Shared>,
    control: Sender<Control>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
}

impl IntervalScheduler {
    /// Spawn the scheduler thread.
    ///
    /// If the thread cannot be spawned the scheduler is created in the stopped
    /// state; scheduled tasks can still be fired with [`run_now`](Self::run_now).
    pub fn start(name: &str) -> Self {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            panics: AtomicU64::new(0),
        });
        let (control, receiver) = crossbeam_channel::unbounded();

        let loop_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(loop_shared, receiver));

        let (thread, thread_id) = match spawned {
            Ok(handle) => {
                let id = handle.thread().id();
                (Some(handle), Some(id))
            }
            Err(err) => {
                tracing::warn!(scheduler = name, error = %err, "failed to spawn scheduler thread");
                shared.stopped.store(true, Ordering::Release);
                (None, None)
            }
        };

        Self {
            shared,
            control,
            thread: Mutex::new(thread),
            thread_id,
        }
    }

    /// Register a periodic task. The first run happens one `interval` from now.
    pub fn schedule<F>(&self, name: &str, interval: Duration, callback: F) -> TaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.tasks.lock().push(ScheduledTask {
            id,
            name: name.to_string(),
            interval,
            next_due: Instant::now() + interval,
            paused: false,
            runs: 0,
            callback: Arc::new(callback),
        });
        tracing::debug!(task = name, id, interval_ms = interval.as_millis() as u64, "task scheduled");
        self.wake();
        id
    }

    /// Change a task's interval. The next run is rescheduled from now.
    ///
    /// Returns `false` if the task does not exist.
    pub fn set_interval(&self, id: TaskId, interval: Duration) -> bool {
        let interval = interval.max(MIN_INTERVAL);
        let found = {
            let mut tasks = self.shared.tasks.lock();
            match tasks.iter_mut().find(|t| t.id == id) {
                Some(task) => {
                    task.interval = interval;
                    task.next_due = Instant::now() + interval;
                    true
                }
                None => false,
            }
        };
        if found {
            self.wake();
        }
        found
    }

    /// Stop firing a task until [`resume`](Self::resume) is called.
    pub fn pause(&self, id: TaskId) -> bool {
        self.with_task(id, |task| task.paused = true)
    }

    /// Resume a paused task; it next fires one interval from now.
    pub fn resume(&self, id: TaskId) -> bool {
        let found = self.with_task(id, |task| {
            task.paused = false;
            task.next_due = Instant::now() + task.interval;
        });
        if found {
            self.wake();
        }
        found
    }

    /// Remove a task. Returns `false` if it was already gone.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut tasks = self.shared.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        before != tasks.len()
    }

    /// Fire a task synchronously on the calling thread.
    ///
    /// Returns `false` if the task does not exist. Paused tasks still run.
    pub fn run_now(&self, id: TaskId) -> bool {
        let callback = {
            let mut tasks = self.shared.tasks.lock();
            match tasks.iter_mut().find(|t| t.id == id) {
                Some(task) => {
                    task.runs += 1;
                    Some((task.name.clone(), task.callback.clone()))
                }
                None => None,
            }
        };

        match callback {
            Some((name, callback)) => {
                Self::invoke(&self.shared, &name, &callback);
                true
            }
            None => false,
        }
    }

    /// Snapshot of a scheduled task.
    pub fn task(&self, id: TaskId) -> Option<TaskInfo> {
        let tasks = self.shared.tasks.lock();
        tasks.iter().find(|t| t.id == id).map(|t| TaskInfo {
            id: t.id,
            name: t.name.clone(),
            interval: t.interval,
            paused: t.paused,
            runs: t.runs,
        })
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Number of task invocations that panicked.
    pub fn panic_count(&self) -> u64 {
        self.shared.panics.load(Ordering::Relaxed)
    }

    /// Whether the background thread is still firing tasks.
    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop the background thread.
    ///
    /// Idempotent and callable from any thread. When called from outside the
    /// scheduler thread it waits for an in-flight task to finish, so no task
    /// runs after `stop` returns. Registered tasks are kept and can still be
    /// fired with [`run_now`](Self::run_now).
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.control.send(Control::Shutdown);

        let on_scheduler_thread = self.thread_id == Some(thread::current().id());
        let handle = self.thread.lock().take();
        match handle {
            Some(handle) if !on_scheduler_thread => {
                if handle.join().is_err() {
                    tracing::warn!("scheduler thread terminated abnormally");
                }
            }
            // Joining ourselves would deadlock; the loop exits after this task.
            _ => {}
        }
        tracing::debug!("interval scheduler stopped");
    }

    fn with_task(&self, id: TaskId, f: impl FnOnce(&mut ScheduledTask)) -> bool {
        let mut tasks = self.shared.tasks.lock();
        match tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    fn wake(&self) {
        let _ = self.control.send(Control::Wake);
    }

    fn invoke(shared: &Shared, name: &str, callback: &TaskFn) {
        if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
            shared.panics.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task = name, "scheduled task panicked");
        }
    }

    /// Scheduler loop: fire due tasks, then sleep until the next deadline or
    /// a control message.
    fn run(shared: Arc<Shared>, control: Receiver<Control>) {
        loop {
            if shared.stopped.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            let next_deadline = {
                let mut tasks = shared.tasks.lock();
                for task in tasks.iter_mut().filter(|t| !t.paused) {
                    if task.next_due <= now {
                        task.next_due = now + task.interval;
                        task.runs += 1;
                        due.push((task.name.clone(), task.callback.clone()));
                    }
                }
                tasks.iter().filter(|t| !t.paused).map(|t| t.next_due).min()
            };

            for (name, callback) in &due {
                if shared.stopped.load(Ordering::Acquire) {
                    return;
                }
                Self::invoke(&shared, name, callback);
            }

            let wait = next_deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_WAIT);

            match control.recv_timeout(wait) {
                Ok(Control::Wake) | Err(RecvTimeoutError::Timeout) => continue,
                Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

impl Drop for IntervalScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = count.clone();
        (count, move || {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_task_fires_periodically() {
        let scheduler = IntervalScheduler::start("test-periodic");
        let (count, task) = counter();
        scheduler.schedule("tick", Duration::from_millis(10), task);

        thread::sleep(Duration::from_millis(120));
        scheduler.stop();

        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_run_now_is_synchronous() {
        let scheduler = IntervalScheduler::start("test-run-now");
        let (count, task) = counter();
        let id = scheduler.schedule("slow", Duration::from_secs(3600), task);

        assert!(scheduler.run_now(id));
        assert!(scheduler.run_now(id));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.task(id).map(|t| t.runs), Some(2));

        assert!(!scheduler.run_now(9999));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let scheduler = IntervalScheduler::start("test-stop");
        assert!(scheduler.is_running());

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_no_runs_after_stop() {
        let scheduler = IntervalScheduler::start("test-after-stop");
        let (count, task) = counter();
        scheduler.schedule("tick", Duration::from_millis(5), task);

        thread::sleep(Duration::from_millis(30));
        scheduler.stop();
        let at_stop = count.load(Ordering::SeqCst);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), at_stop);
    }

    #[test]
    fn test_stop_from_other_thread() {
        let scheduler = Arc::new(IntervalScheduler::start("test-cross-thread"));
        let remote = scheduler.clone();

        thread::spawn(move || remote.stop()).join().unwrap();
        assert!(!scheduler.is_running());
        scheduler.stop();
    }

    #[test]
    fn test_stop_from_inside_task() {
        let scheduler = Arc::new(IntervalScheduler::start("test-self-stop"));
        let weak = Arc::downgrade(&scheduler);
        scheduler.schedule("stopper", Duration::from_millis(5), move || {
            if let Some(s) = weak.upgrade() {
                s.stop();
            }
        });

        thread::sleep(Duration::from_millis(60));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_pause_and_resume() {
        let scheduler = IntervalScheduler::start("test-pause");
        let (count, task) = counter();
        let id = scheduler.schedule("tick", Duration::from_millis(5), task);

        assert!(scheduler.pause(id));
        let paused_at = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(count.load(Ordering::SeqCst), paused_at);

        assert!(scheduler.resume(id));
        thread::sleep(Duration::from_millis(60));
        assert!(count.load(Ordering::SeqCst) > paused_at);

        scheduler.stop();
    }

    #[test]
    fn test_cancel_removes_task() {
        let scheduler = IntervalScheduler::start("test-cancel");
        let (_count, task) = counter();
        let id = scheduler.schedule("tick", Duration::from_secs(1), task);

        assert_eq!(scheduler.task_count(), 1);
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_set_interval_reschedules() {
        let scheduler = IntervalScheduler::start("test-interval");
        let (count, task) = counter();
        let id = scheduler.schedule("tick", Duration::from_secs(3600), task);

        assert!(scheduler.set_interval(id, Duration::from_millis(5)));
        thread::sleep(Duration::from_millis(60));
        scheduler.stop();

        assert!(count.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            scheduler.task(id).map(|t| t.interval),
            Some(Duration::from_millis(5))
        );
        assert!(!scheduler.set_interval(4242, Duration::from_secs(1)));
    }

    #[test]
    fn test_panicking_task_does_not_kill_loop() {
        let scheduler = IntervalScheduler::start("test-panic");
        let (count, task) = counter();
        scheduler.schedule("boom", Duration::from_millis(5), || panic!("task failure"));
        scheduler.schedule("tick", Duration::from_millis(5), task);

        thread::sleep(Duration::from_millis(60));
        scheduler.stop();

        assert!(scheduler.panic_count() >= 1);
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_minimum_interval_enforced() {
        let scheduler = IntervalScheduler::start("test-min");
        let id = scheduler.schedule("zero", Duration::ZERO, || {});
        assert_eq!(scheduler.task(id).map(|t| t.interval), Some(MIN_INTERVAL));
        scheduler.stop();
    }
}
