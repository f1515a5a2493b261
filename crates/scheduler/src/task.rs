use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::types::{EnqueueOrder, QueueId};

/// Boxed task body.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// A posted unit of work.
///
/// Immutable after posting except for the enqueue order, which is stamped
/// when the task crosses into a work queue.
pub(crate) struct Task {
    pub body: TaskFn,
    pub posted_from: &'static str,
    pub queue: QueueId,
    pub queue_name: Arc<str>,
    /// Post order, global across the manager.
    pub sequence_num: u64,
    pub delayed_run_time: Option<Instant>,
    pub enqueue_order: Option<EnqueueOrder>,
    pub nestable: bool,
    /// Set by a [`DelayedTaskHandle`](crate::task_queue::DelayedTaskHandle).
    pub cancelled: Option<Arc<AtomicBool>>,
}

impl Task {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            queue: self.queue,
            queue_name: Arc::clone(&self.queue_name),
            posted_from: self.posted_from,
            sequence_num: self.sequence_num,
            enqueue_order: self.enqueue_order,
            delayed_run_time: self.delayed_run_time,
            nestable: self.nestable,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("posted_from", &self.posted_from)
            .field("queue", &self.queue)
            .field("sequence_num", &self.sequence_num)
            .field("delayed_run_time", &self.delayed_run_time)
            .field("enqueue_order", &self.enqueue_order)
            .field("nestable", &self.nestable)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Description of a task handed to observers.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub queue: QueueId,
    pub queue_name: Arc<str>,
    pub posted_from: &'static str,
    pub sequence_num: u64,
    pub enqueue_order: Option<EnqueueOrder>,
    pub delayed_run_time: Option<Instant>,
    pub nestable: bool,
}

/// How a task body finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskOutcome {
    Completed,
    /// The body panicked. The panic was contained and scheduling continued.
    Panicked,
}
