use std::time::Duration;

use lanesched_core::{Priority, PumpPolicy, WakeupPolicy};
use tracing::{debug, info};

use crate::error::SchedulerError;
use crate::task::Task;
use crate::task_queue::internal::{QueueMain, QueueShared};
use crate::time_domain::due_time;
use crate::types::{QueueId, TimeDomainId};

use super::core::{ManagerInner, ManagerMain};

impl ManagerMain {
    fn queue_now(&self, queue: &QueueMain) -> Option<std::time::Instant> {
        self.time_domains.get(&queue.time_domain).map(|d| d.now())
    }
}

impl ManagerInner {
    // ── Posting (any thread) ─────────────────────────────────────

    /// Enqueue `task` on `queue`. A zero delay posts an immediate task.
    /// Returns `false` and drops the task when the queue is unregistered.
    pub(crate) fn post_task(&self, queue: &QueueShared, mut task: Task, delay: Duration) -> bool {
        if delay.is_zero() {
            let wake = {
                let mut any = queue.any_thread();
                if !any.registered {
                    drop(any);
                    debug!("Dropping task posted from {} to unregistered queue {}", task.posted_from, queue.id);
                    return false;
                }
                let wake = any.pump_policy == PumpPolicy::Auto;
                any.immediate_incoming.push_back(task);
                wake
            };
            if wake {
                self.maybe_schedule_immediate_work("post_task");
            }
            return true;
        }

        let source = {
            let any = queue.any_thread();
            if !any.registered {
                drop(any);
                debug!("Dropping delayed task posted from {} to unregistered queue {}", task.posted_from, queue.id);
                return false;
            }
            any.time_source.clone()
        };
        task.delayed_run_time = Some(due_time(source.now(), delay));

        if self.runs_tasks_on_current_thread() {
            if let Some(mut main) = self.try_lock_main() {
                let registered = main.register_delayed_task(task, self);
                drop(main);
                return match registered {
                    Ok(()) => true,
                    Err(task) => {
                        debug!("Dropping delayed task posted from {} to unregistered queue {}", task.posted_from, queue.id);
                        false
                    }
                };
            }
        }

        // Off the manager thread: buffer until the next pass registers it.
        {
            let mut any = queue.any_thread();
            if !any.registered {
                return false;
            }
            any.delayed_incoming.push(task);
        }
        self.maybe_schedule_immediate_work("post_delayed_task");
        true
    }

    // ── Main-thread mutations ────────────────────────────────────

    pub(crate) fn set_queue_priority(&self, id: QueueId, priority: Priority) {
        self.with_main("set_priority", |main| {
            let Some(queue) = main.queues.get_mut(&id) else {
                return;
            };
            if queue.priority == priority {
                return;
            }
            queue.priority = priority;
            if queue.enabled {
                let sets = main.selector.sets_mut();
                sets.change_set_index(&mut queue.immediate_work_queue, priority);
                sets.change_set_index(&mut queue.delayed_work_queue, priority);
            }
            debug!("Queue {} priority set to {}", id, priority);
        });
    }

    /// Disabled queues keep their tasks and their time domain entries but
    /// are invisible to selection.
    pub(crate) fn set_queue_enabled(&self, id: QueueId, enabled: bool) {
        let became_ready = self
            .with_main("set_enabled", |main| {
                let Some(queue) = main.queues.get_mut(&id) else {
                    return false;
                };
                if queue.enabled == enabled {
                    return false;
                }
                queue.enabled = enabled;
                if enabled {
                    queue.add_to_sets(main.selector.sets_mut());
                    !queue.work_queues_empty()
                } else {
                    queue.remove_from_sets(main.selector.sets_mut());
                    false
                }
            })
            .unwrap_or(false);
        if became_ready {
            self.maybe_schedule_immediate_work("set_enabled");
        }
    }

    /// Switching to `Auto` pumps whatever is already waiting.
    pub(crate) fn set_queue_pump_policy(&self, id: QueueId, policy: PumpPolicy) {
        let pump_now = self
            .with_main("set_pump_policy", |main| {
                let Some(queue) = main.queues.get(&id) else {
                    return false;
                };
                let previous = std::mem::replace(&mut queue.shared.any_thread().pump_policy, policy);
                previous != PumpPolicy::Auto && policy == PumpPolicy::Auto
            })
            .unwrap_or(false);
        if pump_now {
            self.pump_queue(id, true);
        }
    }

    pub(crate) fn set_queue_wakeup_policy(&self, id: QueueId, policy: WakeupPolicy) {
        self.with_main("set_wakeup_policy", |main| {
            if let Some(queue) = main.queues.get_mut(&id) {
                queue.wakeup_policy = policy;
            }
        });
    }

    /// Rebind `id` to `domain`, moving its pending delayed tasks. Each task
    /// keeps its remaining delay measured against the new clock.
    pub(crate) fn set_queue_time_domain(&self, id: QueueId, domain: TimeDomainId) -> Result<(), SchedulerError> {
        let has_delayed = self
            .with_main("set_time_domain", |main| {
                if !main.time_domains.contains_key(&domain) {
                    return Err(SchedulerError::UnknownTimeDomain(domain));
                }
                let queue = main
                    .queues
                    .get_mut(&id)
                    .ok_or(SchedulerError::QueueUnregistered(id))?;
                let from = queue.time_domain;
                if from == domain {
                    return Ok(false);
                }

                let mut source_domain = main
                    .time_domains
                    .remove(&from)
                    .ok_or(SchedulerError::UnknownTimeDomain(from))?;
                let (rebase, source) = match main.time_domains.get_mut(&domain) {
                    Some(destination) => (
                        source_domain.migrate_queue(id, destination, self),
                        destination.source().clone(),
                    ),
                    None => {
                        main.time_domains.insert(from, source_domain);
                        return Err(SchedulerError::UnknownTimeDomain(domain));
                    }
                };
                main.time_domains.insert(from, source_domain);

                queue.delayed_incoming = std::mem::take(&mut queue.delayed_incoming)
                    .into_iter()
                    .map(|((due, seq), mut task)| {
                        let due = rebase.apply(due);
                        task.delayed_run_time = Some(due);
                        ((due, seq), task)
                    })
                    .collect();
                queue.time_domain = domain;
                {
                    let mut any = queue.shared.any_thread();
                    any.time_domain = domain;
                    any.time_source = source;
                }
                info!("Queue {} moved from time domain {} to {}", id, from, domain);
                Ok(!queue.delayed_incoming.is_empty())
            })
            .unwrap_or(Err(SchedulerError::WrongThread))?;
        if has_delayed {
            self.maybe_schedule_immediate_work("set_time_domain");
        }
        Ok(())
    }

    /// Returns whether anything moved. A pass is requested only when
    /// something moved and `may_request_wakeup` is set.
    pub(crate) fn pump_queue(&self, id: QueueId, may_request_wakeup: bool) -> bool {
        let moved = self
            .with_main("pump", |main| main.pump_queue(id))
            .unwrap_or(false);
        if moved && may_request_wakeup {
            self.maybe_schedule_immediate_work("pump");
        }
        moved
    }

    // ── Queue queries ────────────────────────────────────────────

    fn with_queue<R>(&self, op: &'static str, id: QueueId, f: impl FnOnce(&ManagerMain, &QueueMain) -> R) -> Option<R> {
        self.with_main(op, |main| main.queues.get(&id).map(|queue| f(main, queue)))
            .flatten()
    }

    pub(crate) fn queue_has_pending_immediate_work(&self, id: QueueId) -> bool {
        self.with_queue("has_pending_immediate_work", id, |main, queue| {
            !queue.work_queues_empty()
                || !queue.shared.any_thread().immediate_incoming.is_empty()
                || main
                    .queue_now(queue)
                    .is_some_and(|now| queue.has_ready_delayed_task(now))
        })
        .unwrap_or(false)
    }

    /// Whether a pump would move anything.
    pub(crate) fn queue_needs_pumping(&self, id: QueueId) -> bool {
        self.with_queue("needs_pumping", id, |main, queue| {
            !queue.shared.any_thread().immediate_incoming.is_empty()
                || main
                    .queue_now(queue)
                    .is_some_and(|now| queue.has_ready_delayed_task(now))
        })
        .unwrap_or(false)
    }

    pub(crate) fn queue_number_of_pending_tasks(&self, id: QueueId) -> usize {
        self.with_queue("number_of_pending_tasks", id, |_, queue| {
            let any = queue.shared.any_thread();
            queue.work_queue_len()
                + queue.delayed_incoming.len()
                + any.immediate_incoming.len()
                + any.delayed_incoming.len()
        })
        .unwrap_or(0)
    }

    pub(crate) fn queue_priority(&self, id: QueueId) -> Option<Priority> {
        self.with_queue("priority", id, |_, queue| queue.priority)
    }

    pub(crate) fn queue_is_enabled(&self, id: QueueId) -> bool {
        self.with_queue("is_enabled", id, |_, queue| queue.enabled)
            .unwrap_or(false)
    }

    pub(crate) fn queue_wakeup_policy(&self, id: QueueId) -> Option<WakeupPolicy> {
        self.with_queue("wakeup_policy", id, |_, queue| queue.wakeup_policy)
    }

    pub(crate) fn queue_next_delayed_run_time(&self, id: QueueId) -> Option<std::time::Instant> {
        self.with_queue("next_delayed_run_time", id, |_, queue| queue.next_delayed_run_time())
            .flatten()
    }
}
