use crate::task::{TaskInfo, TaskOutcome};
use crate::task_queue::TaskQueue;

/// Instrumentation hooks around every executed task.
///
/// Each executed task produces exactly one `will_process_task` followed by
/// exactly one `did_process_task`, including tasks whose body panicked.
/// Hooks run on the manager thread with no scheduler lock held, so they may
/// post tasks or reconfigure queues.
///
/// Registered on a [`TaskQueue`] instead of the manager, an observer only
/// sees that queue's tasks, and `did_process_task` is skipped if the
/// observer was removed while the task ran.
pub trait TaskObserver: Send + Sync {
    fn will_process_task(&self, _task: &TaskInfo) {}

    fn did_process_task(&self, _task: &TaskInfo, _outcome: TaskOutcome) {}
}

/// Manager-level notifications. At most one is installed at a time, see
/// [`TaskQueueManager::set_observer`](crate::TaskQueueManager::set_observer).
pub trait TaskQueueManagerObserver: Send + Sync {
    /// `queue` was unregistered. Its pending tasks are already gone.
    fn on_unregister_task_queue(&self, _queue: &TaskQueue) {}

    /// A pass found ready work on a disabled queue created with
    /// `should_report_when_execution_blocked`. Reported once per pass with
    /// the queue's oldest ready task.
    fn on_tried_to_execute_blocked_task(&self, _queue: &TaskQueue, _task: &TaskInfo) {}
}
