use std::collections::VecDeque;

use lanesched_core::Priority;

use crate::task::Task;
use crate::types::{EnqueueOrder, WorkQueueId};
use crate::work_queue_sets::WorkQueueSets;

/// Ready-to-run FIFO for one queue's immediate or delayed tasks.
///
/// Every mutation of the front notifies the owning [`WorkQueueSets`] so the
/// set index always matches the current front enqueue order.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    id: WorkQueueId,
    tasks: VecDeque<Task>,
    /// Tier this queue is tracked under, `None` while its queue is disabled.
    pub(crate) set_index: Option<Priority>,
}

impl WorkQueue {
    pub fn new(id: WorkQueueId) -> Self {
        Self {
            id,
            tasks: VecDeque::new(),
            set_index: None,
        }
    }

    pub fn id(&self) -> WorkQueueId {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn front(&self) -> Option<&Task> {
        self.tasks.front()
    }

    pub fn front_enqueue_order(&self) -> Option<EnqueueOrder> {
        self.tasks.front().and_then(|t| t.enqueue_order)
    }

    /// Append a task that already carries its enqueue order. Orders must
    /// increase within a work queue. An unstamped task is handed back.
    pub fn push(&mut self, task: Task, sets: &mut WorkQueueSets) -> Result<(), Task> {
        let Some(order) = task.enqueue_order else {
            return Err(task);
        };
        debug_assert!(
            self.tasks.back().and_then(|t| t.enqueue_order).map_or(true, |back| back < order),
            "enqueue orders must increase within a work queue"
        );
        let was_empty = self.tasks.is_empty();
        self.tasks.push_back(task);
        if was_empty {
            if let Some(priority) = self.set_index {
                sets.on_push_to_empty_queue(self.id, priority, order);
            }
        }
        Ok(())
    }

    pub fn push_and_set_enqueue_order(&mut self, mut task: Task, order: EnqueueOrder, sets: &mut WorkQueueSets) {
        task.enqueue_order = Some(order);
        let pushed = self.push(task, sets);
        debug_assert!(pushed.is_ok());
    }

    pub fn take_front(&mut self, sets: &mut WorkQueueSets) -> Option<Task> {
        let task = self.tasks.pop_front()?;
        if let (Some(priority), Some(old_front)) = (self.set_index, task.enqueue_order) {
            sets.on_pop_queue(self.id, priority, old_front, self.front_enqueue_order());
        }
        Some(task)
    }

    /// Remove every task, leaving the queue empty and untracked.
    pub fn clear(&mut self, sets: &mut WorkQueueSets) -> Vec<Task> {
        sets.remove_queue(self);
        self.tasks.drain(..).collect()
    }
}
