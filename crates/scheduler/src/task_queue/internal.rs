use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use lanesched_core::{Priority, PumpPolicy, WakeupPolicy};

use crate::manager::ManagerInner;
use crate::observer::TaskObserver;
use crate::task::Task;
use crate::time_domain::TimeSource;
use crate::types::{QueueId, TimeDomainId, WorkQueueId, WorkQueueKind};
use crate::work_queue::WorkQueue;
use crate::work_queue_sets::WorkQueueSets;

/// Part of a queue reachable from every thread.
pub(crate) struct QueueShared {
    pub id: QueueId,
    pub name: Arc<str>,
    pub manager: Weak<ManagerInner>,
    any_thread: Mutex<QueueAnyThread>,
    observers: Mutex<Vec<Arc<dyn TaskObserver>>>,
}

/// Fields producers may touch. Held only for appends and swaps.
pub(crate) struct QueueAnyThread {
    pub immediate_incoming: VecDeque<Task>,
    /// Delayed posts made off the main thread, registered on the next pass.
    pub delayed_incoming: Vec<Task>,
    pub pump_policy: PumpPolicy,
    pub time_domain: TimeDomainId,
    pub time_source: TimeSource,
    pub registered: bool,
}

impl QueueAnyThread {
    pub fn front_sequence_num(&self) -> Option<u64> {
        self.immediate_incoming.front().map(|t| t.sequence_num)
    }
}

impl QueueShared {
    pub fn new(
        id: QueueId,
        name: Arc<str>,
        manager: Weak<ManagerInner>,
        pump_policy: PumpPolicy,
        time_domain: TimeDomainId,
        time_source: TimeSource,
    ) -> Self {
        Self {
            id,
            name,
            manager,
            any_thread: Mutex::new(QueueAnyThread {
                immediate_incoming: VecDeque::new(),
                delayed_incoming: Vec::new(),
                pump_policy,
                time_domain,
                time_source,
                registered: true,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn any_thread(&self) -> MutexGuard<'_, QueueAnyThread> {
        self.any_thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observers(&self) -> MutexGuard<'_, Vec<Arc<dyn TaskObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observers_snapshot(&self) -> Vec<Arc<dyn TaskObserver>> {
        self.observers().clone()
    }
}

/// Main-thread half of a registered queue, owned by the manager.
pub(crate) struct QueueMain {
    pub shared: Arc<QueueShared>,
    pub immediate_work_queue: WorkQueue,
    pub delayed_work_queue: WorkQueue,
    /// Pending delayed tasks keyed by (due time, sequence number).
    pub delayed_incoming: BTreeMap<(Instant, u64), Task>,
    pub priority: Priority,
    pub enabled: bool,
    pub wakeup_policy: WakeupPolicy,
    pub should_monitor_quiescence: bool,
    pub should_report_when_execution_blocked: bool,
    pub time_domain: TimeDomainId,
}

impl QueueMain {
    pub fn new(
        shared: Arc<QueueShared>,
        priority: Priority,
        wakeup_policy: WakeupPolicy,
        should_monitor_quiescence: bool,
        should_report_when_execution_blocked: bool,
        time_domain: TimeDomainId,
    ) -> Self {
        let id = shared.id;
        Self {
            shared,
            immediate_work_queue: WorkQueue::new(WorkQueueId::immediate(id)),
            delayed_work_queue: WorkQueue::new(WorkQueueId::delayed(id)),
            delayed_incoming: BTreeMap::new(),
            priority,
            enabled: true,
            wakeup_policy,
            should_monitor_quiescence,
            should_report_when_execution_blocked,
            time_domain,
        }
    }

    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    pub fn work_queue_mut(&mut self, kind: WorkQueueKind) -> &mut WorkQueue {
        match kind {
            WorkQueueKind::Immediate => &mut self.immediate_work_queue,
            WorkQueueKind::Delayed => &mut self.delayed_work_queue,
        }
    }

    pub fn add_to_sets(&mut self, sets: &mut WorkQueueSets) {
        sets.add_queue(&mut self.immediate_work_queue, self.priority);
        sets.add_queue(&mut self.delayed_work_queue, self.priority);
    }

    pub fn remove_from_sets(&mut self, sets: &mut WorkQueueSets) {
        sets.remove_queue(&mut self.immediate_work_queue);
        sets.remove_queue(&mut self.delayed_work_queue);
    }

    /// Remove delayed tasks due at or before `now`, earliest first.
    pub fn take_ready_delayed_tasks(&mut self, now: Instant) -> Vec<Task> {
        let mut ready = Vec::new();
        while let Some(entry) = self.delayed_incoming.first_entry() {
            if entry.key().0 > now {
                break;
            }
            ready.push(entry.remove());
        }
        ready
    }

    /// Remove the pending delayed task with `sequence_num`. Also returns
    /// whether another task of this queue is still due at the same time.
    pub fn remove_delayed_task(&mut self, sequence_num: u64) -> Option<(Task, Instant, bool)> {
        let key = self
            .delayed_incoming
            .keys()
            .find(|(_, seq)| *seq == sequence_num)
            .copied()?;
        let task = self.delayed_incoming.remove(&key)?;
        let due = key.0;
        let due_still_used = self
            .delayed_incoming
            .range((due, 0)..=(due, u64::MAX))
            .next()
            .is_some();
        Some((task, due, due_still_used))
    }

    /// Oldest task sitting in either work queue.
    pub fn oldest_ready_task(&self) -> Option<&Task> {
        match (self.immediate_work_queue.front(), self.delayed_work_queue.front()) {
            (Some(a), Some(b)) => Some(if a.enqueue_order <= b.enqueue_order { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    pub fn has_ready_delayed_task(&self, now: Instant) -> bool {
        self.delayed_incoming
            .first_key_value()
            .is_some_and(|((due, _), _)| *due <= now)
    }

    pub fn next_delayed_run_time(&self) -> Option<Instant> {
        self.delayed_incoming.first_key_value().map(|((due, _), _)| *due)
    }

    pub fn work_queues_empty(&self) -> bool {
        self.immediate_work_queue.is_empty() && self.delayed_work_queue.is_empty()
    }

    pub fn work_queue_len(&self) -> usize {
        self.immediate_work_queue.len() + self.delayed_work_queue.len()
    }

    /// Empty every main-thread structure and return the tasks.
    pub fn clear(&mut self, sets: &mut WorkQueueSets) -> Vec<Task> {
        let mut tasks = self.immediate_work_queue.clear(sets);
        tasks.extend(self.delayed_work_queue.clear(sets));
        tasks.extend(std::mem::take(&mut self.delayed_incoming).into_values());
        tasks
    }
}
