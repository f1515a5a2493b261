use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use lanesched_core::PumpPolicy;
use tracing::{debug, error, trace};

use crate::task::{Task, TaskInfo, TaskOutcome};
use crate::task_queue::internal::QueueShared;
use crate::task_queue::TaskQueue;
use crate::time_domain::WakeupSink;
use crate::types::{QueueId, TimeDomainId, WakeupKind};

use super::core::{ManagerInner, ManagerMain};

/// What the after-wakeup policy needs to know about the task that just ran.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PreviousTask {
    pub can_wake_other_queues: bool,
    pub sequence_num: u64,
}

impl PreviousTask {
    /// An after-wakeup queue is pumped when the previous task may wake other
    /// queues and was posted after the queue's oldest incoming task.
    fn wakes(&self, incoming_front: Option<u64>) -> bool {
        self.can_wake_other_queues && incoming_front.is_some_and(|seq| seq < self.sequence_num)
    }
}

impl ManagerMain {
    /// Index a delayed task in its queue and time domain. Gives the task back
    /// if the queue is gone.
    pub(crate) fn register_delayed_task(&mut self, task: Task, inner: &ManagerInner) -> Result<(), Task> {
        let Some(queue) = self.queues.get_mut(&task.queue) else {
            return Err(task);
        };
        let Some(domain) = self.time_domains.get_mut(&queue.time_domain) else {
            return Err(task);
        };
        let now = domain.now();
        let due = task.delayed_run_time.unwrap_or(now);
        let queue_id = task.queue;
        queue.delayed_incoming.insert((due, task.sequence_num), task);
        domain.schedule_delayed_work(queue_id, due, now, inner);
        if due <= now {
            inner.maybe_schedule_immediate_work("register_delayed_task");
        }
        Ok(())
    }

    /// Bring every work queue up to date: register off-thread delayed posts,
    /// promote due delayed tasks, then swap incoming immediate buffers
    /// according to each queue's pump policy.
    pub(crate) fn update_work_queues(&mut self, inner: &ManagerInner, previous: Option<PreviousTask>) {
        let mut buffered = Vec::new();
        for queue in self.queues.values() {
            buffered.append(&mut queue.shared.any_thread().delayed_incoming);
        }
        for task in buffered {
            if let Err(task) = self.register_delayed_task(task, inner) {
                debug!("Dropping delayed task for unregistered queue {}", task.queue);
            }
        }

        let domain_ids: Vec<TimeDomainId> = self.time_domains.keys().copied().collect();
        for id in domain_ids {
            let promoted = self.move_ready_delayed_tasks(id);
            if promoted > 0 {
                if let Ok(mut m) = inner.metrics.write() {
                    m.delayed_tasks_promoted += promoted as u64;
                }
            }
        }

        for queue in self.queues.values_mut() {
            let incoming = {
                let mut any = queue.shared.any_thread();
                let should_pump = match any.pump_policy {
                    PumpPolicy::Auto => true,
                    PumpPolicy::AfterWakeup => previous.is_some_and(|p| p.wakes(any.front_sequence_num())),
                    PumpPolicy::Manual => false,
                };
                if !should_pump || any.immediate_incoming.is_empty() {
                    continue;
                }
                std::mem::take(&mut any.immediate_incoming)
            };
            for task in incoming {
                let order = self.enqueue_orders.next();
                queue
                    .immediate_work_queue
                    .push_and_set_enqueue_order(task, order, self.selector.sets_mut());
            }
        }
    }

    /// Promote every due delayed task of the queues `domain` reports ready.
    /// Tasks are enqueued in (due time, sequence number) order across queues.
    fn move_ready_delayed_tasks(&mut self, domain: TimeDomainId) -> usize {
        let Some(time_domain) = self.time_domains.get_mut(&domain) else {
            return 0;
        };
        let mut lazy_now = time_domain.create_lazy_now();
        let woken = time_domain.wake_up_ready_delayed_queues(&mut lazy_now);
        if woken.is_empty() {
            return 0;
        }
        let now = lazy_now.now();

        let mut ready: Vec<Task> = Vec::new();
        for id in woken {
            if let Some(queue) = self.queues.get_mut(&id) {
                ready.extend(queue.take_ready_delayed_tasks(now));
            }
        }
        ready.sort_by_key(|t| (t.delayed_run_time, t.sequence_num));

        let promoted = ready.len();
        for task in ready {
            if let Some(queue) = self.queues.get_mut(&task.queue) {
                let order = self.enqueue_orders.next();
                queue
                    .delayed_work_queue
                    .push_and_set_enqueue_order(task, order, self.selector.sets_mut());
            }
        }
        trace!(domain = %domain, promoted, "Promoted delayed tasks");
        promoted
    }

    /// Move a queue's incoming immediate tasks and ready delayed tasks into
    /// its work queues. Returns whether anything moved.
    pub(crate) fn pump_queue(&mut self, id: QueueId) -> bool {
        let Some(queue) = self.queues.get_mut(&id) else {
            return false;
        };
        let now = match self.time_domains.get(&queue.time_domain) {
            Some(domain) => domain.now(),
            None => return false,
        };
        let delayed = queue.take_ready_delayed_tasks(now);
        let incoming = std::mem::take(&mut queue.shared.any_thread().immediate_incoming);
        let moved = !delayed.is_empty() || !incoming.is_empty();

        for task in delayed {
            let order = self.enqueue_orders.next();
            queue
                .delayed_work_queue
                .push_and_set_enqueue_order(task, order, self.selector.sets_mut());
        }
        for task in incoming {
            let order = self.enqueue_orders.next();
            queue
                .immediate_work_queue
                .push_and_set_enqueue_order(task, order, self.selector.sets_mut());
        }
        moved
    }

    /// Next task to run: parked non-nestable tasks first when not nested,
    /// then the selector's choice.
    fn take_next_task(&mut self, nested: bool, inner: &ManagerInner) -> Option<Task> {
        if !nested {
            if let Some(task) = self.deferred_non_nestable.pop_front() {
                return Some(task);
            }
        }
        loop {
            let selection = self.selector.select_work_queue_to_service()?;
            if let Ok(mut m) = inner.metrics.write() {
                m.record_selection(selection.priority, selection.starvation_forced);
            }
            let queue = self.queues.get_mut(&selection.work_queue.queue)?;
            let task = queue
                .work_queue_mut(selection.work_queue.kind)
                .take_front(self.selector.sets_mut())?;
            if nested && !task.nestable {
                trace!("Parking non-nestable task from {} while nested", task.posted_from);
                if let Ok(mut m) = inner.metrics.write() {
                    m.tasks_deferred += 1;
                }
                self.deferred_non_nestable.push_back(task);
                continue;
            }
            return Some(task);
        }
    }

    /// Disabled queues that asked to be reported, each with its oldest
    /// ready task.
    fn blocked_tasks(&self) -> Vec<(Arc<QueueShared>, TaskInfo)> {
        self.queues
            .values()
            .filter(|q| !q.enabled && q.should_report_when_execution_blocked)
            .filter_map(|q| Some((Arc::clone(&q.shared), q.oldest_ready_task()?.info())))
            .collect()
    }

    fn has_ready_work(&self, nested: bool) -> bool {
        self.selector.has_ready_work() || (!nested && !self.deferred_non_nestable.is_empty())
    }
}

impl ManagerInner {
    /// One scheduling pass: update work queues, run up to `work_batch_size`
    /// tasks, then arrange the next host callback.
    pub(crate) fn do_work(&self, wakeup: WakeupKind) {
        if !self.on_owner_thread("do_work") {
            return;
        }
        {
            let mut wakeups = self.wakeups();
            match wakeup {
                WakeupKind::Immediate => wakeups.immediate_pending = false,
                WakeupKind::Delayed => wakeups.drain_delayed_until(self.host.now()),
            }
        }
        if let Ok(mut m) = self.metrics.write() {
            m.passes += 1;
        }

        let nested = self.host.is_nested();
        let mut main = self.lock_main();
        if main.shut_down {
            return;
        }
        main.update_work_queues(self, None);

        let blocked = main.blocked_tasks();
        if !blocked.is_empty() {
            drop(main);
            self.report_blocked_tasks(blocked);
            main = self.lock_main();
            if main.shut_down {
                return;
            }
        }

        let batch = main.work_batch_size;
        let mut ran = 0;
        while ran < batch {
            let Some(task) = main.take_next_task(nested, self) else {
                break;
            };
            if task.is_cancelled() {
                drop(main);
                trace!("Discarding cancelled task posted from {}", task.posted_from);
                drop(task);
                if let Ok(mut m) = self.metrics.write() {
                    m.delayed_tasks_cancelled += 1;
                }
                main = self.lock_main();
                if main.shut_down {
                    return;
                }
                continue;
            }
            ran += 1;
            let info = task.info();
            let (can_wake_other_queues, monitored, queue) = main
                .queues
                .get(&task.queue)
                .map(|q| {
                    (
                        q.wakeup_policy.can_wake_other_queues(),
                        q.should_monitor_quiescence,
                        Some(Arc::clone(&q.shared)),
                    )
                })
                .unwrap_or((false, false, None));
            let outer = main.currently_executing.replace(task.queue);
            drop(main);

            self.run_task(task, &info, queue.as_deref());

            main = self.lock_main();
            main.currently_executing = outer;
            if monitored {
                main.task_ran_on_monitored_queue = true;
            }
            if main.shut_down {
                return;
            }
            main.update_work_queues(
                self,
                Some(PreviousTask {
                    can_wake_other_queues,
                    sequence_num: info.sequence_num,
                }),
            );
        }

        let has_ready_work = main.has_ready_work(nested);
        let next_delayed = main.next_real_delayed_run_time();
        drop(main);

        if has_ready_work {
            self.maybe_schedule_immediate_work("do_work");
        } else if let Some(due) = next_delayed {
            let now = self.host.now();
            self.request_delayed_wakeup(now, due.saturating_duration_since(now));
        }
    }

    /// Run one task body with observers around it. Called with no scheduler
    /// lock held.
    fn run_task(&self, task: Task, info: &TaskInfo, queue: Option<&QueueShared>) -> TaskOutcome {
        let observers = self.observers_snapshot();
        let queue_observers = queue.map(QueueShared::observers_snapshot).unwrap_or_default();
        for observer in observers.iter().chain(&queue_observers) {
            observer.will_process_task(info);
        }

        self.executing_depth.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(task.body)) {
            Ok(()) => TaskOutcome::Completed,
            Err(payload) => {
                error!(
                    "Task posted from {} on queue '{}' panicked: {}",
                    info.posted_from,
                    info.queue_name,
                    panic_message(payload.as_ref())
                );
                TaskOutcome::Panicked
            }
        };
        let elapsed = started.elapsed();
        self.executing_depth.fetch_sub(1, Ordering::Relaxed);

        debug!("Task from {} on '{}' finished in {:?}", info.posted_from, info.queue_name, elapsed);
        if let Ok(mut m) = self.metrics.write() {
            m.record_execution(&info.queue_name, elapsed);
            if outcome == TaskOutcome::Panicked {
                m.tasks_panicked += 1;
            }
        }

        for observer in &observers {
            observer.did_process_task(info, outcome);
        }
        if let Some(queue) = queue {
            let still_registered = queue.observers_snapshot();
            for observer in queue_observers
                .iter()
                .filter(|o| still_registered.iter().any(|s| Arc::ptr_eq(s, *o)))
            {
                observer.did_process_task(info, outcome);
            }
        }
        outcome
    }

    fn report_blocked_tasks(&self, blocked: Vec<(Arc<QueueShared>, TaskInfo)>) {
        let observer = self.manager_observer();
        for (queue, task) in blocked {
            trace!("Queue '{}' is disabled with task from {} ready", queue.name, task.posted_from);
            if let Some(observer) = &observer {
                observer.on_tried_to_execute_blocked_task(&TaskQueue::from_shared(queue), &task);
            }
        }
    }

    pub(crate) fn on_nested_loop_exited(&self) {
        let pending = self
            .with_main("on_nested_loop_exited", |main| !main.deferred_non_nestable.is_empty())
            .unwrap_or(false);
        if pending {
            self.maybe_schedule_immediate_work("on_nested_loop_exited");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
