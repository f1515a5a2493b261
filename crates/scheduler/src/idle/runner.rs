use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::task_queue::TaskQueue;

use super::IdleTaskRunnerDelegate;

/// Idle task body. Receives the absolute deadline of the idle period it runs in.
pub type IdleTask = Box<dyn FnOnce(Instant) + Send + 'static>;

/// Posts deadline-aware tasks onto the idle queue.
#[derive(Clone)]
pub struct IdleTaskRunner {
    idle_queue: TaskQueue,
    after_wakeup_queue: TaskQueue,
    delegate: Arc<dyn IdleTaskRunnerDelegate>,
}

impl fmt::Debug for IdleTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTaskRunner")
            .field("idle_queue", &self.idle_queue)
            .field("after_wakeup_queue", &self.after_wakeup_queue)
            .finish_non_exhaustive()
    }
}

/// Reports the end of an idle task even when its body panics.
struct DidProcessGuard(Arc<dyn IdleTaskRunnerDelegate>);

impl Drop for DidProcessGuard {
    fn drop(&mut self) {
        self.0.did_process_idle_task();
    }
}

impl IdleTaskRunner {
    pub fn new(
        idle_queue: TaskQueue,
        after_wakeup_queue: TaskQueue,
        delegate: Arc<dyn IdleTaskRunnerDelegate>,
    ) -> Self {
        Self {
            idle_queue,
            after_wakeup_queue,
            delegate,
        }
    }

    /// Notifies the delegate first, so a paused long idle period restarts
    /// before the task lands on the idle queue.
    ///
    /// The idle queue is pumped once when a period starts. A task posted
    /// while a short idle period is already open waits for the next period.
    pub fn post_idle_task<F>(&self, from: &'static str, task: F) -> bool
    where
        F: FnOnce(Instant) + Send + 'static,
    {
        self.delegate.on_idle_task_posted();
        self.idle_queue.post_task(from, self.wrap(Box::new(task)))
    }

    /// Like [`post_idle_task`](Self::post_idle_task) but never runs inside a
    /// nested loop.
    pub fn post_non_nestable_idle_task<F>(&self, from: &'static str, task: F) -> bool
    where
        F: FnOnce(Instant) + Send + 'static,
    {
        self.delegate.on_idle_task_posted();
        self.idle_queue.post_non_nestable_task(from, self.wrap(Box::new(task)))
    }

    /// Posts the idle task only once some other task has woken the
    /// after-wakeup queue, so an idle thread is not woken just for it.
    pub fn post_idle_task_after_wakeup<F>(&self, from: &'static str, task: F) -> bool
    where
        F: FnOnce(Instant) + Send + 'static,
    {
        let runner = self.clone();
        self.after_wakeup_queue.post_task(from, move || {
            runner.post_idle_task(from, task);
        })
    }

    fn wrap(&self, task: IdleTask) -> impl FnOnce() + Send + 'static {
        let delegate = Arc::clone(&self.delegate);
        move || {
            let deadline = delegate.will_process_idle_task();
            let _guard = DidProcessGuard(delegate);
            task(deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use lanesched_core::PumpPolicy;

    use super::*;
    use crate::sim::SimulatedHost;
    use crate::task_queue::TaskQueueSpec;
    use crate::TaskQueueManager;

    struct RecordingDelegate {
        deadline: Instant,
        posted: AtomicUsize,
        processed: AtomicUsize,
    }

    impl IdleTaskRunnerDelegate for RecordingDelegate {
        fn on_idle_task_posted(&self) {
            self.posted.fetch_add(1, Ordering::Relaxed);
        }
        fn will_process_idle_task(&self) -> Instant {
            self.deadline
        }
        fn did_process_idle_task(&self) {
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn idle_tasks_receive_deadline_and_report_completion() {
        let host = SimulatedHost::new();
        let manager = TaskQueueManager::with_defaults(host.clone());
        let idle_queue = manager.new_task_queue(TaskQueueSpec::new("idle")).unwrap();
        let after_wakeup = manager
            .new_task_queue(TaskQueueSpec::new("after_wakeup").with_pump_policy(PumpPolicy::AfterWakeup))
            .unwrap();

        let delegate = Arc::new(RecordingDelegate {
            deadline: host.now() + Duration::from_millis(16),
            posted: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
        });
        let runner = IdleTaskRunner::new(idle_queue, after_wakeup, delegate.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        runner.post_idle_task("test", move |deadline| sink.lock().unwrap().push(deadline));
        assert_eq!(delegate.posted.load(Ordering::Relaxed), 1);

        host.run_until_idle(&manager);
        assert_eq!(*seen.lock().unwrap(), vec![delegate.deadline]);
        assert_eq!(delegate.processed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panicking_idle_task_still_reports_completion() {
        let host = SimulatedHost::new();
        let manager = TaskQueueManager::with_defaults(host.clone());
        let idle_queue = manager.new_task_queue(TaskQueueSpec::new("idle")).unwrap();
        let after_wakeup = manager.new_task_queue(TaskQueueSpec::new("after_wakeup")).unwrap();
        let delegate = Arc::new(RecordingDelegate {
            deadline: host.now(),
            posted: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
        });
        let runner = IdleTaskRunner::new(idle_queue, after_wakeup, delegate.clone());

        runner.post_idle_task("test", |_| panic!("idle task failure"));
        host.run_until_idle(&manager);
        assert_eq!(delegate.processed.load(Ordering::Relaxed), 1);
        assert_eq!(manager.metrics().tasks_panicked, 1);
    }
}
