use lanesched_core::Priority;

use crate::types::WorkQueueId;
use crate::work_queue_sets::WorkQueueSets;

/// Outcome of one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Selection {
    pub work_queue: WorkQueueId,
    pub priority: Priority,
    /// Chosen over a higher non-empty tier because this tier was starved.
    pub starvation_forced: bool,
}

/// Picks the next work queue to service.
///
/// Control is strict. High, Normal and BestEffort each count how many
/// consecutive selections went to a higher tier while they had ready work;
/// once a count reaches the threshold that tier is served next.
pub(crate) struct TaskQueueSelector {
    sets: WorkQueueSets,
    starvation_threshold: usize,
    starvation_counts: [usize; Priority::COUNT],
}

impl TaskQueueSelector {
    pub fn new(starvation_threshold: usize) -> Self {
        Self {
            sets: WorkQueueSets::new("selector"),
            starvation_threshold: starvation_threshold.max(1),
            starvation_counts: [0; Priority::COUNT],
        }
    }

    pub fn sets(&self) -> &WorkQueueSets {
        &self.sets
    }

    pub fn sets_mut(&mut self) -> &mut WorkQueueSets {
        &mut self.sets
    }

    pub fn has_ready_work(&self) -> bool {
        !self.sets.is_empty()
    }

    pub fn starvation_count(&self, priority: Priority) -> usize {
        self.starvation_counts[priority.index()]
    }

    pub fn select_work_queue_to_service(&mut self) -> Option<Selection> {
        let (highest, work_queue) = self.sets.oldest_queue_in_highest_priority_non_empty_set()?;

        let mut selection = Selection {
            work_queue,
            priority: highest,
            starvation_forced: false,
        };

        if highest != Priority::Control {
            let starved = Priority::ALL
                .iter()
                .copied()
                .filter(|&p| p > highest)
                .find(|&p| {
                    !self.sets.is_set_empty(p)
                        && self.starvation_counts[p.index()] >= self.starvation_threshold
                });
            if let Some(priority) = starved {
                if let Some(work_queue) = self.sets.oldest_queue_in_set(priority) {
                    selection = Selection {
                        work_queue,
                        priority,
                        starvation_forced: true,
                    };
                }
            }
        }

        self.update_starvation_counts(selection.priority);
        Some(selection)
    }

    fn update_starvation_counts(&mut self, chosen: Priority) {
        for priority in Priority::ALL {
            if priority == Priority::Control {
                continue;
            }
            let count = &mut self.starvation_counts[priority.index()];
            if priority == chosen || self.sets.is_set_empty(priority) {
                *count = 0;
            } else if priority > chosen {
                *count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnqueueOrder, QueueId};
    use crate::work_queue::tests::test_task;
    use crate::work_queue::WorkQueue;

    struct Fixture {
        selector: TaskQueueSelector,
        queues: Vec<WorkQueue>,
        next_order: u64,
    }

    impl Fixture {
        fn new(threshold: usize, priorities: &[Priority]) -> Self {
            let mut selector = TaskQueueSelector::new(threshold);
            let queues = priorities
                .iter()
                .enumerate()
                .map(|(i, &p)| {
                    let mut wq = WorkQueue::new(WorkQueueId::immediate(QueueId(i as u64)));
                    selector.sets_mut().add_queue(&mut wq, p);
                    wq
                })
                .collect();
            Self { selector, queues, next_order: 0 }
        }

        fn push(&mut self, queue: usize, count: usize) {
            for _ in 0..count {
                self.next_order += 1;
                let order = EnqueueOrder(self.next_order);
                self.queues[queue].push_and_set_enqueue_order(
                    test_task(self.next_order),
                    order,
                    self.selector.sets_mut(),
                );
            }
        }

        /// Select and run one task, returning the index of its queue.
        fn run_one(&mut self) -> Option<(usize, bool)> {
            let selection = self.selector.select_work_queue_to_service()?;
            let index = selection.work_queue.queue.0 as usize;
            self.queues[index].take_front(self.selector.sets_mut());
            Some((index, selection.starvation_forced))
        }
    }

    #[test]
    fn priority_order_then_age() {
        let mut f = Fixture::new(5, &[Priority::Normal, Priority::High, Priority::Normal]);
        f.push(0, 1);
        f.push(2, 1);
        f.push(1, 1);
        let order: Vec<usize> = std::iter::from_fn(|| f.run_one().map(|(q, _)| q)).collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn starved_normal_served_after_threshold() {
        let mut f = Fixture::new(3, &[Priority::High, Priority::Normal]);
        f.push(1, 1);
        f.push(0, 10);

        let first_four: Vec<(usize, bool)> = (0..4).filter_map(|_| f.run_one()).collect();
        assert_eq!(
            first_four,
            vec![(0, false), (0, false), (0, false), (1, true)]
        );
        assert_eq!(f.selector.starvation_count(Priority::Normal), 0);
    }

    #[test]
    fn control_is_never_forced_to_yield() {
        let mut f = Fixture::new(1, &[Priority::Control, Priority::BestEffort]);
        f.push(1, 1);
        f.push(0, 5);
        let order: Vec<usize> = std::iter::from_fn(|| f.run_one().map(|(q, _)| q)).collect();
        assert_eq!(order, vec![0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn highest_starved_tier_wins() {
        let mut f = Fixture::new(2, &[Priority::High, Priority::Normal, Priority::BestEffort]);
        f.push(2, 1);
        f.push(1, 1);
        f.push(0, 5);

        assert_eq!(f.run_one(), Some((0, false)));
        assert_eq!(f.run_one(), Some((0, false)));
        // Both lower tiers reached the threshold; Normal is served first.
        assert_eq!(f.run_one(), Some((1, true)));
        assert_eq!(f.run_one(), Some((2, true)));
    }

    #[test]
    fn empty_tier_resets_its_count() {
        let mut f = Fixture::new(3, &[Priority::High, Priority::Normal]);
        f.push(0, 2);
        f.run_one();
        f.run_one();
        assert_eq!(f.selector.starvation_count(Priority::Normal), 0);
        assert!(!f.selector.has_ready_work());
    }
}
