//! The scheduler objects a scenario registers, and the log of what ran.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use lanesched_core::SchedulerConfig;
use lanesched_scheduler::{
    IdleHelper, IdlePeriodState, IdleTaskRunner, PermissiveIdleDelegate, SchedulerHost,
    SchedulerMetrics, TaskQueue, TaskQueueManager, TimeDomainId, TimeDomainKind,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::scenario::{Action, IdleTaskDef, Post, Scenario, TaskDef, REAL_TIME_DOMAIN};

/// Clock used for timestamps and for spending a task's simulated cost.
pub trait ReplayClock: Send + Sync {
    fn now(&self) -> Instant;

    /// Called from inside a task body to account for its cost.
    fn spend(&self, cost: Duration);
}

/// One task execution as observed from inside its body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub label: String,
    pub queue: String,
    pub started_ms: f64,
    /// Idle tasks only: the deadline they were handed.
    pub deadline_ms: Option<f64>,
}

/// Result of one replay.
#[derive(Debug, Serialize)]
pub struct Report {
    pub scenario: String,
    pub mode: &'static str,
    pub generated_at: DateTime<Utc>,
    pub config: serde_json::Value,
    pub executions: Vec<Execution>,
    /// Tasks still queued when the replay stopped, by queue name.
    pub pending: HashMap<String, usize>,
    pub idle_state: Option<String>,
    pub metrics: SchedulerMetrics,
}

type ExecutionLog = Arc<Mutex<Vec<Execution>>>;

fn millis_since(start: Instant, at: Instant) -> f64 {
    at.saturating_duration_since(start).as_nanos() as f64 / 1_000_000.0
}

/// Thread-safe posting side of a world.
#[derive(Clone)]
pub struct Poster {
    queues: HashMap<String, TaskQueue>,
    idle_runner: Option<IdleTaskRunner>,
    clock: Arc<dyn ReplayClock>,
    start: Instant,
    log: ExecutionLog,
}

impl Poster {
    pub fn post(&self, post: &Post) -> bool {
        match post {
            Post::Task(task) => self.post_task(task),
            Post::Idle(task) => self.post_idle_task(task),
        }
    }

    fn post_task(&self, task: &TaskDef) -> bool {
        let Some(queue) = self.queues.get(&task.queue) else {
            warn!("Task '{}' targets unknown queue '{}'", task.label, task.queue);
            return false;
        };
        let body = self.body(&task.label, &task.queue, task.cost_ms);
        let run = move || body(None);
        let delay = Duration::from_millis(task.delay_ms);
        let posted = if task.nestable {
            queue.post_delayed_task("scenario", run, delay)
        } else {
            queue.post_non_nestable_delayed_task("scenario", run, delay)
        };
        if !posted {
            debug!("Queue '{}' rejected task '{}'", task.queue, task.label);
        }
        posted
    }

    fn post_idle_task(&self, task: &IdleTaskDef) -> bool {
        let Some(runner) = &self.idle_runner else {
            warn!("Idle task '{}' posted without an idle helper", task.label);
            return false;
        };
        let body = self.body(&task.label, "idle", task.cost_ms);
        let run = move |deadline: Instant| body(Some(deadline));
        if task.after_wakeup {
            runner.post_idle_task_after_wakeup("scenario", run)
        } else {
            runner.post_idle_task("scenario", run)
        }
    }

    fn body(&self, label: &str, queue: &str, cost_ms: u64) -> impl Fn(Option<Instant>) + Send + 'static {
        let log = Arc::clone(&self.log);
        let clock = Arc::clone(&self.clock);
        let start = self.start;
        let label = label.to_string();
        let queue = queue.to_string();
        move |deadline| {
            let started = clock.now();
            log.lock().unwrap_or_else(PoisonError::into_inner).push(Execution {
                label: label.clone(),
                queue: queue.clone(),
                started_ms: millis_since(start, started),
                deadline_ms: deadline.map(|d| millis_since(start, d)),
            });
            if cost_ms > 0 {
                clock.spend(Duration::from_millis(cost_ms));
            }
        }
    }
}

/// A manager with a scenario's queues, domains and optional idle helper.
pub struct World {
    name: String,
    config: SchedulerConfig,
    manager: TaskQueueManager,
    domains: HashMap<String, TimeDomainId>,
    idle: Option<IdleHelper>,
    poster: Poster,
}

impl World {
    /// Register everything the scenario declares. Must run on the thread
    /// that will drive the manager.
    pub fn build(
        scenario: &Scenario,
        host: Arc<dyn SchedulerHost>,
        clock: Arc<dyn ReplayClock>,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        let manager = TaskQueueManager::new(host, config.clone()).context("failed to create task queue manager")?;
        let start = clock.now();

        let mut domains = HashMap::new();
        for domain in &scenario.time_domains {
            let id = manager
                .register_time_domain(&domain.name, TimeDomainKind::Virtual { start })
                .with_context(|| format!("failed to register time domain '{}'", domain.name))?;
            domains.insert(domain.name.clone(), id);
        }

        let mut queues = HashMap::new();
        for def in &scenario.queues {
            let mut spec = def.spec.clone();
            if let Some(domain) = &def.time_domain {
                spec.time_domain = Some(resolve_domain(&manager, &domains, domain)?);
            }
            let queue = manager
                .new_task_queue(spec)
                .with_context(|| format!("failed to register queue '{}'", def.spec.name))?;
            queues.insert(def.spec.name.clone(), queue);
        }

        let idle = if scenario.uses_idle() {
            let helper = IdleHelper::new(
                &manager,
                Arc::new(PermissiveIdleDelegate),
                config.idle.clone(),
                &scenario.name,
            )
            .context("failed to create idle helper")?;
            Some(helper)
        } else {
            None
        };

        info!(
            "Scenario '{}' registered ({} queues, {} time domains, idle helper: {})",
            scenario.name,
            queues.len(),
            domains.len(),
            idle.is_some()
        );

        let poster = Poster {
            queues,
            idle_runner: idle.as_ref().map(IdleHelper::idle_task_runner),
            clock,
            start,
            log: ExecutionLog::default(),
        };
        Ok(Self {
            name: scenario.name.clone(),
            config: config.clone(),
            manager,
            domains,
            idle,
            poster,
        })
    }

    pub fn manager(&self) -> &TaskQueueManager {
        &self.manager
    }

    pub fn start(&self) -> Instant {
        self.poster.start
    }

    pub fn poster(&self) -> Poster {
        self.poster.clone()
    }

    fn queue(&self, name: &str) -> Result<&TaskQueue> {
        self.poster
            .queues
            .get(name)
            .ok_or_else(|| anyhow!("unknown queue '{}'", name))
    }

    fn idle(&self) -> Result<&IdleHelper> {
        self.idle.as_ref().ok_or_else(|| anyhow!("scenario has no idle helper"))
    }

    /// Apply a driver step. Main thread only.
    pub fn apply(&self, action: &Action) -> Result<()> {
        debug!(?action, "Applying scenario step");
        match action {
            Action::Pump { queue } => {
                self.queue(queue)?.pump(true);
            }
            Action::SetEnabled { queue, enabled } => self.queue(queue)?.set_enabled(*enabled),
            Action::SetPriority { queue, priority } => self.queue(queue)?.set_priority(*priority),
            Action::SetPumpPolicy { queue, pump_policy } => {
                self.queue(queue)?.set_pump_policy(*pump_policy)
            }
            Action::SetTimeDomain { queue, time_domain } => {
                let id = resolve_domain(&self.manager, &self.domains, time_domain)?;
                self.queue(queue)?
                    .set_time_domain(id)
                    .with_context(|| format!("failed to move queue '{}' to '{}'", queue, time_domain))?;
            }
            Action::Unregister { queue } => self.queue(queue)?.unregister(),
            Action::AdvanceTime { time_domain, to_ms } => {
                let id = resolve_domain(&self.manager, &self.domains, time_domain)?;
                let to = self.start() + Duration::from_millis(*to_ms);
                self.manager
                    .advance_virtual_time(id, to)
                    .with_context(|| format!("failed to advance '{}' to {}ms", time_domain, to_ms))?;
            }
            Action::StartIdlePeriod { duration_ms } => {
                let now = self.manager.now();
                self.idle()?.start_idle_period(
                    IdlePeriodState::InShortIdlePeriod,
                    now,
                    now + Duration::from_millis(*duration_ms),
                );
            }
            Action::EnableLongIdlePeriod => self.idle()?.enable_long_idle_period(),
            Action::EndIdlePeriod => self.idle()?.end_idle_period(),
        }
        Ok(())
    }

    /// Collect the report and shut the scheduler down.
    pub fn finish(self, mode: &'static str) -> Report {
        let executions = self
            .poster
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut pending: HashMap<String, usize> = self
            .poster
            .queues
            .iter()
            .filter(|(_, q)| q.is_registered())
            .map(|(name, q)| (name.clone(), q.number_of_pending_tasks()))
            .collect();
        if let Some(idle) = &self.idle {
            pending.insert("idle".to_string(), idle.idle_queue().number_of_pending_tasks());
        }
        let idle_state = self.idle.as_ref().map(|i| i.idle_period_state().to_string());
        let report = Report {
            scenario: self.name.clone(),
            mode,
            generated_at: Utc::now(),
            config: self.config.summary(),
            executions,
            pending,
            idle_state,
            metrics: self.manager.metrics(),
        };

        if let Some(idle) = &self.idle {
            idle.shutdown();
        }
        self.manager.shutdown();
        info!(
            "Scenario '{}' finished: {} tasks executed",
            self.name,
            report.executions.len()
        );
        report
    }
}

fn resolve_domain(
    manager: &TaskQueueManager,
    domains: &HashMap<String, TimeDomainId>,
    name: &str,
) -> Result<TimeDomainId> {
    if name == REAL_TIME_DOMAIN {
        return Ok(manager.real_time_domain());
    }
    domains
        .get(name)
        .copied()
        .ok_or_else(|| anyhow!("unknown time domain '{}'", name))
}
