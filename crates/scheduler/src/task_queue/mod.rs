//! Task queue handles and their construction spec.

pub(crate) mod internal;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lanesched_core::{Priority, PumpPolicy, WakeupPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SchedulerError;
use crate::observer::TaskObserver;
use crate::task::{Task, TaskFn};
use crate::types::{QueueId, TimeDomainId};

use self::internal::QueueShared;

/// Everything needed to register a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueSpec {
    pub name: String,
    #[serde(default)]
    pub pump_policy: PumpPolicy,
    #[serde(default)]
    pub wakeup_policy: WakeupPolicy,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub should_monitor_quiescence: bool,
    /// Tell the manager observer when a pass finds work on this queue while
    /// it is disabled.
    #[serde(default)]
    pub should_report_when_execution_blocked: bool,
    /// Defaults to the manager's real time domain.
    #[serde(skip)]
    pub time_domain: Option<TimeDomainId>,
}

impl TaskQueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pump_policy: PumpPolicy::default(),
            wakeup_policy: WakeupPolicy::default(),
            priority: Priority::default(),
            should_monitor_quiescence: false,
            should_report_when_execution_blocked: false,
            time_domain: None,
        }
    }

    pub fn with_pump_policy(mut self, pump_policy: PumpPolicy) -> Self {
        self.pump_policy = pump_policy;
        self
    }

    pub fn with_wakeup_policy(mut self, wakeup_policy: WakeupPolicy) -> Self {
        self.wakeup_policy = wakeup_policy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_should_monitor_quiescence(mut self, monitor: bool) -> Self {
        self.should_monitor_quiescence = monitor;
        self
    }

    pub fn with_should_report_when_execution_blocked(mut self, report: bool) -> Self {
        self.should_report_when_execution_blocked = report;
        self
    }

    pub fn with_time_domain(mut self, time_domain: TimeDomainId) -> Self {
        self.time_domain = Some(time_domain);
        self
    }
}

/// Handle to a registered task queue.
///
/// Posting works from any thread. Setters and most queries are main-thread
/// operations; called elsewhere they assert in debug builds and do nothing in
/// release builds. Once the queue is unregistered, posts return `false` and
/// queries report an empty queue.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<QueueShared>,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

impl TaskQueue {
    pub(crate) fn from_shared(shared: Arc<QueueShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    // ── Posting ──────────────────────────────────────────────────

    pub fn post_task<F>(&self, from: &'static str, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(from, Box::new(task), Duration::ZERO, true)
    }

    /// Like [`post_task`](Self::post_task) but never runs inside a nested loop.
    pub fn post_non_nestable_task<F>(&self, from: &'static str, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(from, Box::new(task), Duration::ZERO, false)
    }

    /// Run `task` once `delay` has elapsed on the queue's time domain. A zero
    /// delay is an immediate post.
    pub fn post_delayed_task<F>(&self, from: &'static str, task: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(from, Box::new(task), delay, true)
    }

    pub fn post_non_nestable_delayed_task<F>(&self, from: &'static str, task: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(from, Box::new(task), delay, false)
    }

    /// Like [`post_delayed_task`](Self::post_delayed_task), returning a
    /// handle that can cancel the task before it runs. `None` when the post
    /// was rejected.
    pub fn post_cancelable_delayed_task<F>(
        &self,
        from: &'static str,
        task: F,
        delay: Duration,
    ) -> Option<DelayedTaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let sequence_num = self.post_with_flag(from, Box::new(task), delay, true, Some(Arc::clone(&cancelled)))?;
        Some(DelayedTaskHandle {
            queue: Arc::downgrade(&self.shared),
            sequence_num,
            cancelled,
        })
    }

    fn post(&self, from: &'static str, body: TaskFn, delay: Duration, nestable: bool) -> bool {
        self.post_with_flag(from, body, delay, nestable, None).is_some()
    }

    /// Returns the task's sequence number if it was accepted.
    fn post_with_flag(
        &self,
        from: &'static str,
        body: TaskFn,
        delay: Duration,
        nestable: bool,
        cancelled: Option<Arc<AtomicBool>>,
    ) -> Option<u64> {
        let Some(manager) = self.shared.manager.upgrade() else {
            debug!("Dropping task posted from {} after manager shutdown", from);
            return None;
        };
        let sequence_num = manager.next_sequence_number();
        let task = Task {
            body,
            posted_from: from,
            queue: self.shared.id,
            queue_name: Arc::clone(&self.shared.name),
            sequence_num,
            delayed_run_time: None,
            enqueue_order: None,
            nestable,
            cancelled,
        };
        manager
            .post_task(&self.shared, task, delay)
            .then_some(sequence_num)
    }

    // ── Observers ────────────────────────────────────────────────

    /// Observe only the tasks of this queue. Runs after the manager's own
    /// observers.
    pub fn add_task_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.shared.observers().push(observer);
    }

    pub fn remove_task_observer(&self, observer: &Arc<dyn TaskObserver>) {
        self.shared.observers().retain(|o| !Arc::ptr_eq(o, observer));
    }

    // ── Configuration (main thread) ──────────────────────────────

    pub fn set_priority(&self, priority: Priority) {
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.set_queue_priority(self.shared.id, priority);
        }
    }

    pub fn set_pump_policy(&self, pump_policy: PumpPolicy) {
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.set_queue_pump_policy(self.shared.id, pump_policy);
        }
    }

    pub fn set_wakeup_policy(&self, wakeup_policy: WakeupPolicy) {
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.set_queue_wakeup_policy(self.shared.id, wakeup_policy);
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.set_queue_enabled(self.shared.id, enabled);
        }
    }

    pub fn set_time_domain(&self, time_domain: TimeDomainId) -> Result<(), SchedulerError> {
        let manager = self
            .shared
            .manager
            .upgrade()
            .ok_or(SchedulerError::ShutDown)?;
        manager.set_queue_time_domain(self.shared.id, time_domain)
    }

    /// Move incoming work into the work queues. Requests a pass only if
    /// something moved and `may_request_wakeup` is set. Returns whether
    /// anything moved.
    pub fn pump(&self, may_request_wakeup: bool) -> bool {
        self.shared
            .manager
            .upgrade()
            .is_some_and(|manager| manager.pump_queue(self.shared.id, may_request_wakeup))
    }

    /// Remove the queue from its manager, dropping every pending task.
    pub fn unregister(&self) {
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.unregister_task_queue(self.shared.id);
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn is_registered(&self) -> bool {
        self.shared.any_thread().registered
    }

    pub fn pump_policy(&self) -> PumpPolicy {
        self.shared.any_thread().pump_policy
    }

    pub fn time_domain(&self) -> TimeDomainId {
        self.shared.any_thread().time_domain
    }

    /// Ready, incoming, or due delayed work exists.
    pub fn has_pending_immediate_work(&self) -> bool {
        self.shared
            .manager
            .upgrade()
            .is_some_and(|m| m.queue_has_pending_immediate_work(self.shared.id))
    }

    pub fn needs_pumping(&self) -> bool {
        self.shared
            .manager
            .upgrade()
            .is_some_and(|m| m.queue_needs_pumping(self.shared.id))
    }

    pub fn is_empty(&self) -> bool {
        self.number_of_pending_tasks() == 0
    }

    pub fn number_of_pending_tasks(&self) -> usize {
        self.shared
            .manager
            .upgrade()
            .map_or(0, |m| m.queue_number_of_pending_tasks(self.shared.id))
    }

    pub fn priority(&self) -> Option<Priority> {
        self.shared.manager.upgrade().and_then(|m| m.queue_priority(self.shared.id))
    }

    pub fn wakeup_policy(&self) -> Option<WakeupPolicy> {
        self.shared.manager.upgrade().and_then(|m| m.queue_wakeup_policy(self.shared.id))
    }

    pub fn is_enabled(&self) -> bool {
        self.shared
            .manager
            .upgrade()
            .is_some_and(|m| m.queue_is_enabled(self.shared.id))
    }

    /// Due time of the earliest pending delayed task.
    pub fn next_delayed_run_time(&self) -> Option<Instant> {
        self.shared
            .manager
            .upgrade()
            .and_then(|m| m.queue_next_delayed_run_time(self.shared.id))
    }
}

/// Cancels one task posted with
/// [`TaskQueue::post_cancelable_delayed_task`].
///
/// On the manager thread, cancelling removes the task and any host wakeup
/// that only it needed. Elsewhere the task is just marked and is discarded
/// unrun once it comes due.
#[derive(Clone)]
pub struct DelayedTaskHandle {
    queue: Weak<QueueShared>,
    sequence_num: u64,
    cancelled: Arc<AtomicBool>,
}

impl fmt::Debug for DelayedTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedTaskHandle")
            .field("sequence_num", &self.sequence_num)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl DelayedTaskHandle {
    /// Idempotent. Has no effect on a task that already ran.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        if let Some(manager) = queue.manager.upgrade() {
            manager.cancel_delayed_task(queue.id, self.sequence_num);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
