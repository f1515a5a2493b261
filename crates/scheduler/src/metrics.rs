use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lanesched_core::Priority;
use serde::Serialize;

/// Scheduler operational metrics, snapshotted via
/// [`TaskQueueManager::metrics`](crate::TaskQueueManager::metrics).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Total tasks executed by queue name.
    pub tasks_executed: HashMap<String, u64>,
    /// Average task duration by queue name.
    pub avg_task_duration: HashMap<String, Duration>,
    /// Last execution time by queue name.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Selections made per priority tier.
    pub selections_by_priority: HashMap<Priority, u64>,
    /// Selections that skipped a higher tier to serve a starved one.
    pub starvation_forced_selections: u64,
    /// Task bodies that panicked.
    pub tasks_panicked: u64,
    /// Non-nestable tasks parked because the loop was nested.
    pub tasks_deferred: u64,
    /// Delayed tasks moved into a work queue after their due time elapsed.
    pub delayed_tasks_promoted: u64,
    /// Cancelled tasks removed before they could run.
    pub delayed_tasks_cancelled: u64,
    /// `do_work` invocations.
    pub passes: u64,
}

impl SchedulerMetrics {
    /// Record a task execution.
    pub fn record_execution(&mut self, queue_name: &str, duration: Duration) {
        *self.tasks_executed.entry(queue_name.to_string()).or_default() += 1;
        self.last_run.insert(queue_name.to_string(), Utc::now());

        let count = self.tasks_executed[queue_name];
        let prev_avg = self
            .avg_task_duration
            .get(queue_name)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration.insert(queue_name.to_string(), new_avg);
    }

    pub fn record_selection(&mut self, priority: Priority, starvation_forced: bool) {
        *self.selections_by_priority.entry(priority).or_default() += 1;
        if starvation_forced {
            self.starvation_forced_selections += 1;
        }
    }

    /// Total tasks executed across all queues.
    pub fn total_executed(&self) -> u64 {
        self.tasks_executed.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("input", Duration::from_millis(100));

        assert_eq!(m.tasks_executed["input"], 1);
        assert!(m.last_run.contains_key("input"));
        assert_eq!(m.avg_task_duration["input"], Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("input", Duration::from_millis(100));
        m.record_execution("input", Duration::from_millis(200));

        assert_eq!(m.tasks_executed["input"], 2);
        let avg = m.avg_task_duration["input"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn selections_are_counted_per_tier() {
        let mut m = SchedulerMetrics::default();
        m.record_selection(Priority::High, false);
        m.record_selection(Priority::High, false);
        m.record_selection(Priority::BestEffort, true);

        assert_eq!(m.selections_by_priority[&Priority::High], 2);
        assert_eq!(m.selections_by_priority[&Priority::BestEffort], 1);
        assert_eq!(m.starvation_forced_selections, 1);
    }

    #[test]
    fn serializes_with_tier_names() {
        let mut m = SchedulerMetrics::default();
        m.record_selection(Priority::BestEffort, false);
        m.record_execution("idle", Duration::from_millis(1));

        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["selections_by_priority"]["best_effort"], 1);
        assert_eq!(json["tasks_executed"]["idle"], 1);
        assert_eq!(m.total_executed(), 1);
    }
}
