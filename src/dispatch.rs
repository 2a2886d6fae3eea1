use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};

/// Cooperative cancellation token. Work functions check it at every I/O and
/// retry boundary; process-backed work registers a kill hook so cancellation
/// can terminate the child immediately.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    kill_hook: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Relaxed);
        if let Ok(mut hook) = self.inner.kill_hook.lock() {
            if let Some(kill) = hook.as_mut() {
                kill();
            }
        }
    }

    /// Returns `Err(Cancelled)` if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn set_kill_hook(&self, hook: impl FnMut() + Send + 'static) {
        if let Ok(mut slot) = self.inner.kill_hook.lock() {
            *slot = Some(Box::new(hook));
        }
        // A cancel that raced the registration must still take effect.
        if self.is_cancelled() {
            if let Ok(mut slot) = self.inner.kill_hook.lock() {
                if let Some(kill) = slot.as_mut() {
                    kill();
                }
            }
        }
    }

    pub fn clear_kill_hook(&self) {
        if let Ok(mut slot) = self.inner.kill_hook.lock() {
            *slot = None;
        }
    }

    /// Sleep in small slices so a cancel interrupts the wait promptly.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_cancelled() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(Duration::from_millis(50)));
        }
    }
}

/// Metadata attached to each submitted task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub name: String,
    pub category: String,
    pub device_serial: Option<String>,
}

impl TaskContext {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            device_serial: None,
        }
    }

    pub fn for_device(
        name: impl Into<String>,
        category: impl Into<String>,
        serial: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            device_serial: Some(serial.into()),
        }
    }
}

type TaskFn = Box<dyn FnOnce(&CancelToken) -> Result<(), CoreError> + Send>;

struct QueuedTask {
    job: TaskFn,
    context: TaskContext,
    token: CancelToken,
    done_tx: Sender<Result<(), CoreError>>,
    finished: Arc<AtomicBool>,
}

/// Handle to a submitted task: terminal-result delivery plus cancellation.
pub struct TaskHandle {
    context: TaskContext,
    token: CancelToken,
    done_rx: Receiver<Result<(), CoreError>>,
    finished: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Block until the task reaches a terminal state.
    pub fn wait(&self) -> Result<(), CoreError> {
        match self.done_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(CoreError::io("task worker dropped without reporting")),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), CoreError>> {
        self.done_rx.recv_timeout(timeout).ok()
    }
}

const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_QUEUE_SOFT_LIMIT: usize = 32;

/// Bounded worker pool for device operations. Submissions from one origin are
/// not ordered across workers; callers needing order chain on completion.
pub struct TaskDispatcher {
    queue_tx: Mutex<Option<Sender<QueuedTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
    soft_limit: usize,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    bus: EventBus,
}

impl TaskDispatcher {
    pub fn new(bus: EventBus) -> Self {
        Self::with_workers(DEFAULT_WORKER_COUNT, DEFAULT_QUEUE_SOFT_LIMIT, bus)
    }

    pub fn with_workers(worker_count: usize, soft_limit: usize, bus: EventBus) -> Self {
        let (tx, rx) = channel::<QueuedTask>();
        let shared_rx = Arc::new(Mutex::new(rx));
        let queued = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for worker_index in 0..worker_count.max(1) {
            let shared_rx = Arc::clone(&shared_rx);
            let queued = Arc::clone(&queued);
            workers.push(thread::spawn(move || loop {
                let task = {
                    let guard = match shared_rx.lock() {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    guard.recv()
                };
                let task = match task {
                    Ok(task) => task,
                    Err(_) => return,
                };
                queued.fetch_sub(1, Ordering::Relaxed);

                // Cancelled while enqueued: report without running.
                let result = if task.token.is_cancelled() {
                    Err(CoreError::Cancelled)
                } else {
                    debug!(
                        worker = worker_index,
                        task = %task.context.name,
                        category = %task.context.category,
                        "task started"
                    );
                    (task.job)(&task.token)
                };
                task.token.clear_kill_hook();
                task.finished.store(true, Ordering::Relaxed);
                let _ = task.done_tx.send(result);
            }));
        }

        Self {
            queue_tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            queued,
            soft_limit: soft_limit.max(1),
            device_locks: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn submit(
        &self,
        context: TaskContext,
        job: impl FnOnce(&CancelToken) -> Result<(), CoreError> + Send + 'static,
    ) -> Result<TaskHandle, CoreError> {
        let token = CancelToken::new();
        self.submit_with_token(context, token, job)
    }

    /// Submit with a caller-provided token so several tasks can share one
    /// cancellation scope (e.g. a multi-device command group).
    pub fn submit_with_token(
        &self,
        context: TaskContext,
        token: CancelToken,
        job: impl FnOnce(&CancelToken) -> Result<(), CoreError> + Send + 'static,
    ) -> Result<TaskHandle, CoreError> {
        let (done_tx, done_rx) = channel();
        let finished = Arc::new(AtomicBool::new(false));
        let task = QueuedTask {
            job: Box::new(job),
            context: context.clone(),
            token: token.clone(),
            done_tx,
            finished: Arc::clone(&finished),
        };

        let guard = self
            .queue_tx
            .lock()
            .map_err(|_| CoreError::io("dispatcher queue poisoned"))?;
        let tx = guard
            .as_ref()
            .ok_or_else(|| CoreError::io("dispatcher is shut down"))?;
        tx.send(task)
            .map_err(|_| CoreError::io("dispatcher workers are gone"))?;

        let queued = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        if queued > self.soft_limit {
            warn!(queued, soft_limit = self.soft_limit, "task queue saturated");
            self.bus.publish(CoreEvent::QueueSaturated {
                queued,
                soft_limit: self.soft_limit,
            });
        }

        Ok(TaskHandle {
            context,
            token,
            done_rx,
            finished,
        })
    }

    /// Per-device mutex so operations targeting the same serial serialize.
    pub fn device_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut guard = self.device_locks.lock().expect("device locks poisoned");
        guard
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Close the queue and join workers, waiting up to `timeout`.
    pub fn shutdown(&self, timeout: Duration) {
        if let Ok(mut guard) = self.queue_tx.lock() {
            guard.take();
        }
        let deadline = Instant::now() + timeout;
        let workers = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        while Instant::now() < deadline && workers.iter().any(|w| !w.is_finished()) {
            thread::sleep(Duration::from_millis(10));
        }
        for worker in workers {
            if worker.is_finished() {
                let _ = worker.join();
            }
            // Stragglers are detached; their tasks observe the closed queue
            // and exit after the current job.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn worker_pool_bounds_concurrency() {
        let dispatcher = TaskDispatcher::with_workers(2, 32, EventBus::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for index in 0..8 {
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            let handle = dispatcher
                .submit(TaskContext::new(format!("job-{index}"), "test"), move |_| {
                    let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(current, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .expect("submit");
            handles.push(handle);
        }
        for handle in handles {
            handle.wait().expect("task");
        }
        assert!(max_running.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn cancel_before_start_skips_the_job() {
        let dispatcher = TaskDispatcher::with_workers(1, 32, EventBus::new());
        let blocker = dispatcher
            .submit(TaskContext::new("blocker", "test"), |_| {
                thread::sleep(Duration::from_millis(100));
                Ok(())
            })
            .expect("submit");

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let queued = dispatcher
            .submit(TaskContext::new("queued", "test"), move |_| {
                ran_clone.store(true, Ordering::SeqCst);
                Ok(())
            })
            .expect("submit");
        queued.cancel();

        assert!(matches!(queued.wait(), Err(CoreError::Cancelled)));
        assert!(!ran.load(Ordering::SeqCst));
        blocker.wait().expect("blocker");
    }

    #[test]
    fn saturated_queue_emits_warning_event() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let dispatcher = TaskDispatcher::with_workers(1, 2, bus);

        let mut handles = Vec::new();
        for index in 0..5 {
            handles.push(
                dispatcher
                    .submit(TaskContext::new(format!("slow-{index}"), "test"), |_| {
                        thread::sleep(Duration::from_millis(10));
                        Ok(())
                    })
                    .expect("submit"),
            );
        }
        for handle in handles {
            handle.wait().expect("task");
        }

        let saw_warning = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|event| matches!(event, CoreEvent::QueueSaturated { .. }));
        assert!(saw_warning);
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        token.sleep(Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(matches!(token.checkpoint(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn kill_hook_fires_when_registered_after_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        token.set_kill_hook(move || fired_clone.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn device_lock_serializes_same_serial() {
        let dispatcher = Arc::new(TaskDispatcher::with_workers(4, 32, EventBus::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let dispatcher_clone = Arc::clone(&dispatcher);
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            handles.push(
                dispatcher
                    .submit(
                        TaskContext::for_device("locked", "test", "device-1"),
                        move |_| {
                            let lock = dispatcher_clone.device_lock("device-1");
                            let _guard = lock.lock().expect("device lock");
                            let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                            max_running.fetch_max(current, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(5));
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        },
                    )
                    .expect("submit"),
            );
        }
        for handle in handles {
            handle.wait().expect("task");
        }
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }
}
