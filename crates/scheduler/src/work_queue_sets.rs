use std::collections::BTreeMap;

use lanesched_core::Priority;

use crate::types::{EnqueueOrder, WorkQueueId};
use crate::work_queue::WorkQueue;

/// All enabled, non-empty work queues, grouped by priority tier and indexed
/// by the enqueue order of their front task.
///
/// Enqueue orders are unique across the manager, so each tier is a plain
/// ordered map and the oldest work queue of a tier is its first entry.
pub(crate) struct WorkQueueSets {
    name: &'static str,
    sets: [BTreeMap<EnqueueOrder, WorkQueueId>; Priority::COUNT],
}

impl WorkQueueSets {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sets: Default::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Start tracking `work_queue` in tier `priority`.
    pub fn add_queue(&mut self, work_queue: &mut WorkQueue, priority: Priority) {
        debug_assert!(
            work_queue.set_index.is_none(),
            "{}: {:?} is already registered",
            self.name,
            work_queue.id()
        );
        work_queue.set_index = Some(priority);
        if let Some(order) = work_queue.front_enqueue_order() {
            self.sets[priority.index()].insert(order, work_queue.id());
        }
    }

    /// Stop tracking `work_queue`. Its tasks stay where they are.
    pub fn remove_queue(&mut self, work_queue: &mut WorkQueue) {
        let Some(priority) = work_queue.set_index.take() else {
            return;
        };
        if let Some(order) = work_queue.front_enqueue_order() {
            self.sets[priority.index()].remove(&order);
        }
    }

    /// Move `work_queue` to another tier.
    pub fn change_set_index(&mut self, work_queue: &mut WorkQueue, priority: Priority) {
        self.remove_queue(work_queue);
        self.add_queue(work_queue, priority);
    }

    /// A tracked work queue went from empty to non-empty.
    pub fn on_push_to_empty_queue(&mut self, id: WorkQueueId, priority: Priority, front: EnqueueOrder) {
        let previous = self.sets[priority.index()].insert(front, id);
        debug_assert!(previous.is_none(), "{}: duplicate enqueue order {:?}", self.name, front);
    }

    /// The front task of a tracked work queue was taken.
    pub fn on_pop_queue(
        &mut self,
        id: WorkQueueId,
        priority: Priority,
        old_front: EnqueueOrder,
        new_front: Option<EnqueueOrder>,
    ) {
        let set = &mut self.sets[priority.index()];
        set.remove(&old_front);
        if let Some(order) = new_front {
            set.insert(order, id);
        }
    }

    /// The work queue of `priority` whose front task is oldest.
    pub fn oldest_queue_in_set(&self, priority: Priority) -> Option<WorkQueueId> {
        self.sets[priority.index()]
            .first_key_value()
            .map(|(_, id)| *id)
    }

    /// The single selection primitive: oldest work queue of the highest
    /// non-empty tier.
    pub fn oldest_queue_in_highest_priority_non_empty_set(&self) -> Option<(Priority, WorkQueueId)> {
        Priority::ALL
            .iter()
            .find_map(|&p| self.oldest_queue_in_set(p).map(|id| (p, id)))
    }

    pub fn is_set_empty(&self, priority: Priority) -> bool {
        self.sets[priority.index()].is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.iter().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueId;
    use crate::work_queue::tests::test_task;

    fn order(n: u64) -> EnqueueOrder {
        EnqueueOrder(n)
    }

    #[test]
    fn empty_sets_select_nothing() {
        let sets = WorkQueueSets::new("test");
        assert!(sets.is_empty());
        assert_eq!(sets.oldest_queue_in_highest_priority_non_empty_set(), None);
    }

    #[test]
    fn oldest_front_wins_within_tier() {
        let mut sets = WorkQueueSets::new("test");
        let mut a = WorkQueue::new(WorkQueueId::immediate(QueueId(1)));
        let mut b = WorkQueue::new(WorkQueueId::immediate(QueueId(2)));
        sets.add_queue(&mut a, Priority::Normal);
        sets.add_queue(&mut b, Priority::Normal);

        a.push_and_set_enqueue_order(test_task(1), order(5), &mut sets);
        b.push_and_set_enqueue_order(test_task(2), order(3), &mut sets);
        assert_eq!(sets.oldest_queue_in_set(Priority::Normal), Some(b.id()));

        b.take_front(&mut sets);
        assert_eq!(sets.oldest_queue_in_set(Priority::Normal), Some(a.id()));
    }

    #[test]
    fn higher_tier_wins_regardless_of_age() {
        let mut sets = WorkQueueSets::new("test");
        let mut normal = WorkQueue::new(WorkQueueId::immediate(QueueId(1)));
        let mut control = WorkQueue::new(WorkQueueId::delayed(QueueId(2)));
        sets.add_queue(&mut normal, Priority::Normal);
        sets.add_queue(&mut control, Priority::Control);

        normal.push_and_set_enqueue_order(test_task(1), order(1), &mut sets);
        control.push_and_set_enqueue_order(test_task(2), order(9), &mut sets);

        assert_eq!(
            sets.oldest_queue_in_highest_priority_non_empty_set(),
            Some((Priority::Control, control.id()))
        );
    }

    #[test]
    fn removed_queue_is_invisible_but_keeps_tasks() {
        let mut sets = WorkQueueSets::new("test");
        let mut wq = WorkQueue::new(WorkQueueId::immediate(QueueId(1)));
        sets.add_queue(&mut wq, Priority::High);
        wq.push_and_set_enqueue_order(test_task(1), order(1), &mut sets);

        sets.remove_queue(&mut wq);
        assert!(sets.is_empty());
        assert_eq!(wq.len(), 1);

        sets.add_queue(&mut wq, Priority::High);
        assert_eq!(sets.oldest_queue_in_set(Priority::High), Some(wq.id()));
    }

    #[test]
    fn change_set_index_moves_tier() {
        let mut sets = WorkQueueSets::new("test");
        let mut wq = WorkQueue::new(WorkQueueId::immediate(QueueId(1)));
        sets.add_queue(&mut wq, Priority::BestEffort);
        wq.push_and_set_enqueue_order(test_task(1), order(1), &mut sets);

        sets.change_set_index(&mut wq, Priority::High);
        assert!(sets.is_set_empty(Priority::BestEffort));
        assert_eq!(sets.oldest_queue_in_set(Priority::High), Some(wq.id()));
    }
}
