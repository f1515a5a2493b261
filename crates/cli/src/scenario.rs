//! Scenario files: what to register, what to post and when.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lanesched_core::{Priority, PumpPolicy};
use lanesched_scheduler::TaskQueueSpec;
use serde::Deserialize;

/// A replayable scheduling scenario. All times are milliseconds from the
/// start of the replay.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default = "default_name")]
    pub name: String,
    /// Stop after this long. Without it a virtual replay runs until no
    /// callbacks remain and a realtime replay stops shortly after the last event.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Virtual time domains, all starting at the replay start.
    #[serde(default)]
    pub time_domains: Vec<TimeDomainDef>,
    #[serde(default)]
    pub queues: Vec<QueueDef>,
    #[serde(default)]
    pub tasks: Vec<TaskDef>,
    #[serde(default)]
    pub idle_tasks: Vec<IdleTaskDef>,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

fn default_name() -> String {
    "scenario".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeDomainDef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueDef {
    #[serde(flatten)]
    pub spec: TaskQueueSpec,
    /// Name of a virtual time domain. Defaults to the real clock.
    #[serde(default)]
    pub time_domain: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskDef {
    pub queue: String,
    pub label: String,
    /// When the task is posted.
    #[serde(default)]
    pub at_ms: u64,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_true")]
    pub nestable: bool,
    /// Simulated run time of the task body.
    #[serde(default)]
    pub cost_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdleTaskDef {
    pub label: String,
    #[serde(default)]
    pub at_ms: u64,
    /// Hold the task back until some other queue has run a task.
    #[serde(default)]
    pub after_wakeup: bool,
    #[serde(default)]
    pub cost_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDef {
    #[serde(default)]
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

/// Main-thread driver actions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Pump { queue: String },
    SetEnabled { queue: String, enabled: bool },
    SetPriority { queue: String, priority: Priority },
    SetPumpPolicy { queue: String, pump_policy: PumpPolicy },
    /// Move a queue to a named virtual domain, or back to the real clock with `"real"`.
    SetTimeDomain { queue: String, time_domain: String },
    Unregister { queue: String },
    AdvanceTime { time_domain: String, to_ms: u64 },
    StartIdlePeriod { duration_ms: u64 },
    EnableLongIdlePeriod,
    EndIdlePeriod,
}

impl Action {
    fn queue(&self) -> Option<&str> {
        match self {
            Action::Pump { queue }
            | Action::SetEnabled { queue, .. }
            | Action::SetPriority { queue, .. }
            | Action::SetPumpPolicy { queue, .. }
            | Action::SetTimeDomain { queue, .. }
            | Action::Unregister { queue } => Some(queue),
            _ => None,
        }
    }

    fn time_domain(&self) -> Option<&str> {
        match self {
            Action::SetTimeDomain { time_domain, .. } if time_domain != REAL_TIME_DOMAIN => {
                Some(time_domain)
            }
            Action::AdvanceTime { time_domain, .. } => Some(time_domain),
            _ => None,
        }
    }

    fn is_idle(&self) -> bool {
        matches!(
            self,
            Action::StartIdlePeriod { .. } | Action::EnableLongIdlePeriod | Action::EndIdlePeriod
        )
    }
}

/// Name that refers to the manager's real time domain.
pub const REAL_TIME_DOMAIN: &str = "real";

/// Something posted into the scheduler at a point in time.
#[derive(Debug, Clone)]
pub enum Post {
    Task(TaskDef),
    Idle(IdleTaskDef),
}

impl Post {
    pub fn at(&self) -> Duration {
        Duration::from_millis(match self {
            Post::Task(task) => task.at_ms,
            Post::Idle(task) => task.at_ms,
        })
    }
}

/// One timeline entry of a replay.
#[derive(Debug, Clone)]
pub enum Event {
    Post(Post),
    Step(Action),
}

impl Scenario {
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let scenario: Self = toml::from_str(toml_str).context("failed to parse scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario: {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid scenario: {}", path.display()))
    }

    /// Check every cross reference before anything is registered.
    pub fn validate(&self) -> Result<()> {
        let mut domains = HashSet::new();
        for domain in &self.time_domains {
            if domain.name == REAL_TIME_DOMAIN {
                bail!("time domain name '{}' is reserved", REAL_TIME_DOMAIN);
            }
            if !domains.insert(domain.name.as_str()) {
                bail!("duplicate time domain '{}'", domain.name);
            }
        }

        let mut queues = HashSet::new();
        for queue in &self.queues {
            if !queues.insert(queue.spec.name.as_str()) {
                bail!("duplicate queue '{}'", queue.spec.name);
            }
            if let Some(domain) = &queue.time_domain {
                if domain != REAL_TIME_DOMAIN && !domains.contains(domain.as_str()) {
                    bail!("queue '{}' uses unknown time domain '{}'", queue.spec.name, domain);
                }
            }
        }

        for task in &self.tasks {
            if !queues.contains(task.queue.as_str()) {
                bail!("task '{}' posts to unknown queue '{}'", task.label, task.queue);
            }
        }

        for step in &self.steps {
            if let Some(queue) = step.action.queue() {
                if !queues.contains(queue) {
                    bail!("step at {}ms refers to unknown queue '{}'", step.at_ms, queue);
                }
            }
            if let Some(domain) = step.action.time_domain() {
                if !domains.contains(domain) {
                    bail!("step at {}ms refers to unknown time domain '{}'", step.at_ms, domain);
                }
            }
        }
        Ok(())
    }

    /// Whether replay needs an idle helper.
    pub fn uses_idle(&self) -> bool {
        !self.idle_tasks.is_empty() || self.steps.iter().any(|s| s.action.is_idle())
    }

    pub fn posts(&self) -> Vec<Post> {
        let mut posts: Vec<Post> = self
            .tasks
            .iter()
            .cloned()
            .map(Post::Task)
            .chain(self.idle_tasks.iter().cloned().map(Post::Idle))
            .collect();
        posts.sort_by_key(Post::at);
        posts
    }

    /// Steps in time order. Steps sharing a time keep file order.
    pub fn steps(&self) -> Vec<(Duration, Action)> {
        let mut steps: Vec<(Duration, Action)> = self
            .steps
            .iter()
            .map(|s| (Duration::from_millis(s.at_ms), s.action.clone()))
            .collect();
        steps.sort_by_key(|(at, _)| *at);
        steps
    }

    /// Posts and steps merged in time order. At equal times posts come first.
    pub fn timeline(&self) -> Vec<(Duration, Event)> {
        let mut events: Vec<(Duration, Event)> = self
            .posts()
            .into_iter()
            .map(|p| (p.at(), Event::Post(p)))
            .chain(self.steps().into_iter().map(|(at, a)| (at, Event::Step(a))))
            .collect();
        events.sort_by_key(|(at, _)| *at);
        events
    }

    /// Time of the last post or step.
    pub fn last_event(&self) -> Duration {
        self.timeline().last().map(|(at, _)| *at).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = include_str!("../scenarios/frame.toml");

    #[test]
    fn bundled_scenario_is_valid() {
        let scenario = Scenario::from_toml(FRAME).unwrap();
        assert_eq!(scenario.name, "frame");
        assert!(scenario.uses_idle());
        assert!(!scenario.queues.is_empty());
    }

    #[test]
    fn queue_fields_default() {
        let scenario = Scenario::from_toml(
            r#"
            [[queues]]
            name = "default"

            [[queues]]
            name = "input"
            priority = "high"
            pump_policy = "manual"
            "#,
        )
        .unwrap();
        assert_eq!(scenario.queues[0].spec.priority, Priority::Normal);
        assert_eq!(scenario.queues[1].spec.priority, Priority::High);
        assert_eq!(scenario.queues[1].spec.pump_policy, PumpPolicy::Manual);
        assert!(scenario.queues[0].time_domain.is_none());
        assert!(!scenario.uses_idle());
    }

    #[test]
    fn steps_parse_by_action_tag() {
        let scenario = Scenario::from_toml(
            r#"
            [[time_domains]]
            name = "virtual"

            [[queues]]
            name = "timers"
            time_domain = "virtual"

            [[steps]]
            at_ms = 5
            action = "advance_time"
            time_domain = "virtual"
            to_ms = 20

            [[steps]]
            action = "pump"
            queue = "timers"
            "#,
        )
        .unwrap();
        let steps = scenario.steps();
        assert_eq!(steps[0], (Duration::ZERO, Action::Pump { queue: "timers".into() }));
        assert_eq!(
            steps[1].1,
            Action::AdvanceTime { time_domain: "virtual".into(), to_ms: 20 }
        );
    }

    #[test]
    fn unknown_queue_is_rejected() {
        let err = Scenario::from_toml(
            r#"
            [[tasks]]
            queue = "missing"
            label = "t1"
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("unknown queue 'missing'"));
    }

    #[test]
    fn real_domain_name_is_reserved() {
        let err = Scenario::from_toml("[[time_domains]]\nname = \"real\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("reserved"));
    }

    #[test]
    fn timeline_puts_posts_before_steps_at_equal_times() {
        let scenario = Scenario::from_toml(
            r#"
            [[queues]]
            name = "q"

            [[steps]]
            at_ms = 3
            action = "end_idle_period"

            [[tasks]]
            queue = "q"
            label = "late"
            at_ms = 3

            [[tasks]]
            queue = "q"
            label = "early"
            at_ms = 1
            "#,
        )
        .unwrap();
        let labels: Vec<String> = scenario
            .timeline()
            .into_iter()
            .map(|(_, event)| match event {
                Event::Post(Post::Task(task)) => task.label,
                Event::Post(Post::Idle(task)) => task.label,
                Event::Step(_) => "step".to_string(),
            })
            .collect();
        assert_eq!(labels, vec!["early", "late", "step"]);
        assert_eq!(scenario.last_event(), Duration::from_millis(3));
    }
}
