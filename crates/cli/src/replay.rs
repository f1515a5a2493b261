//! Deterministic replay on the simulated host.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use lanesched_core::SchedulerConfig;
use lanesched_scheduler::sim::SimulatedHost;
use tracing::debug;

use crate::scenario::{Event, Scenario};
use crate::world::{ReplayClock, Report, World};

/// Task cost moves the simulated clock forward.
struct SimulatedClock(Arc<SimulatedHost>);

impl ReplayClock for SimulatedClock {
    fn now(&self) -> Instant {
        self.0.now()
    }

    fn spend(&self, cost: Duration) {
        self.0.advance(cost);
    }
}

/// Replay `scenario` on a virtual clock. The same scenario always produces
/// the same execution order and timestamps.
pub fn run_virtual(scenario: &Scenario, config: &SchedulerConfig) -> Result<Report> {
    let host = SimulatedHost::new();
    let clock = Arc::new(SimulatedClock(Arc::clone(&host)));
    let world = World::build(scenario, host.clone(), clock, config)?;
    let start = world.start();
    let manager = world.manager();
    let poster = world.poster();

    // Everything scheduled for one instant is applied before tasks run at it.
    for (at, event) in scenario.timeline() {
        let due = start + at;
        if due > host.now() {
            host.run_for_period(manager, due - host.now());
        }
        match event {
            Event::Post(post) => {
                poster.post(&post);
            }
            Event::Step(action) => world.apply(&action)?,
        }
    }

    let delivered = match scenario.duration_ms {
        Some(duration) => {
            let end = start + Duration::from_millis(duration);
            host.run_for_period(manager, end.saturating_duration_since(host.now()))
        }
        None => host.fast_forward(manager),
    };
    debug!("Virtual replay delivered {} trailing callbacks", delivered);

    Ok(world.finish("virtual"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(toml: &str) -> Report {
        let scenario = Scenario::from_toml(toml).unwrap();
        run_virtual(&scenario, &SchedulerConfig::default()).unwrap()
    }

    fn labels(report: &Report) -> Vec<&str> {
        report.executions.iter().map(|e| e.label.as_str()).collect()
    }

    #[test]
    fn priorities_and_delays_shape_the_order() {
        let report = replay(
            r#"
            [[queues]]
            name = "default"

            [[queues]]
            name = "input"
            priority = "high"

            [[tasks]]
            queue = "default"
            label = "a"
            cost_ms = 2

            [[tasks]]
            queue = "default"
            label = "timer"
            delay_ms = 5

            [[tasks]]
            queue = "input"
            label = "click"
            "#,
        );
        assert_eq!(labels(&report), vec!["click", "a", "timer"]);
        assert_eq!(report.executions[1].started_ms, 0.0);
        assert_eq!(report.executions[2].started_ms, 5.0);
        assert_eq!(report.metrics.total_executed(), 3);
        assert_eq!(report.pending["default"], 0);
        assert!(report.idle_state.is_none());
    }

    #[test]
    fn manual_queue_runs_at_pump_step() {
        let report = replay(
            r#"
            [[queues]]
            name = "compositor"
            pump_policy = "manual"

            [[tasks]]
            queue = "compositor"
            label = "composite"

            [[steps]]
            at_ms = 4
            action = "pump"
            queue = "compositor"
            "#,
        );
        assert_eq!(labels(&report), vec!["composite"]);
        assert_eq!(report.executions[0].started_ms, 4.0);
    }

    #[test]
    fn virtual_domain_runs_only_when_advanced() {
        let report = replay(
            r#"
            duration_ms = 50

            [[time_domains]]
            name = "animation"

            [[queues]]
            name = "animation"
            time_domain = "animation"

            [[tasks]]
            queue = "animation"
            label = "tick"
            delay_ms = 16

            [[steps]]
            at_ms = 30
            action = "advance_time"
            time_domain = "animation"
            to_ms = 16
            "#,
        );
        assert_eq!(labels(&report), vec!["tick"]);
        assert_eq!(report.executions[0].started_ms, 30.0);
    }

    #[test]
    fn idle_tasks_get_the_short_period_deadline() {
        let report = replay(
            r#"
            [[idle_tasks]]
            label = "gc"

            [[steps]]
            at_ms = 10
            action = "start_idle_period"
            duration_ms = 6
            "#,
        );
        assert_eq!(labels(&report), vec!["gc"]);
        assert_eq!(report.executions[0].started_ms, 10.0);
        assert_eq!(report.executions[0].deadline_ms, Some(16.0));
        assert_eq!(report.idle_state.as_deref(), Some("in_short_idle_period"));
    }

    #[test]
    fn bundled_frame_scenario_replays() {
        let scenario = Scenario::from_toml(include_str!("../scenarios/frame.toml")).unwrap();
        let first = run_virtual(&scenario, &SchedulerConfig::default()).unwrap();
        let second = run_virtual(&scenario, &SchedulerConfig::default()).unwrap();
        assert_eq!(first.executions, second.executions);
        assert!(labels(&first).contains(&"gc"));
        assert!(labels(&first).contains(&"tick"));
    }
}
