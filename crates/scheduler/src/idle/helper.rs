use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use lanesched_core::{IdleConfig, Priority, PumpPolicy, WakeupPolicy};
use tracing::{debug, info, trace};

use crate::error::SchedulerError;
use crate::manager::{ManagerInner, TaskQueueManager};
use crate::observer::TaskObserver;
use crate::task::{TaskInfo, TaskOutcome};
use crate::task_queue::{TaskQueue, TaskQueueSpec};

use super::runner::IdleTaskRunner;
use super::state::{IdlePeriodState, IdleState};
use super::{IdleHelperDelegate, IdleTaskRunnerDelegate, LongIdlePermission};

/// Drives the idle period state machine of one manager.
///
/// The helper registers three queues on the manager:
/// - `{name}_idle`: best-effort, manually pumped, enabled only inside idle periods
/// - `{name}_control`: control priority, carries the helper's own bookkeeping tasks
/// - `{name}_control_after_wakeup`: control priority, after-wakeup pump, used by
///   [`IdleTaskRunner::post_idle_task_after_wakeup`]
///
/// Dropping the helper shuts it down and unregisters those queues.
pub struct IdleHelper {
    inner: Arc<IdleHelperInner>,
}

pub(crate) struct IdleHelperInner {
    self_ref: Weak<IdleHelperInner>,
    name: String,
    manager: Weak<ManagerInner>,
    delegate: Arc<dyn IdleHelperDelegate>,
    config: IdleConfig,
    idle_queue: TaskQueue,
    control_queue: TaskQueue,
    control_after_wakeup_queue: TaskQueue,
    runner: IdleTaskRunner,
    observer: Arc<dyn TaskObserver>,
    state: Mutex<IdleState>,
}

/// Forwards task observer callbacks without keeping the helper alive.
struct IdleObserver(Weak<IdleHelperInner>);

impl TaskObserver for IdleObserver {
    fn did_process_task(&self, _task: &TaskInfo, _outcome: TaskOutcome) {
        if let Some(helper) = self.0.upgrade() {
            helper.did_process_task();
        }
    }
}

struct RunnerDelegate(Weak<IdleHelperInner>);

impl IdleTaskRunnerDelegate for RunnerDelegate {
    fn on_idle_task_posted(&self) {
        if let Some(helper) = self.0.upgrade() {
            helper.on_idle_task_posted();
        }
    }

    fn will_process_idle_task(&self) -> Instant {
        match self.0.upgrade() {
            Some(helper) => helper.will_process_idle_task(),
            None => Instant::now(),
        }
    }

    fn did_process_idle_task(&self) {
        if let Some(helper) = self.0.upgrade() {
            helper.did_process_idle_task();
        }
    }
}

impl IdleHelper {
    /// Register the helper's queues and task observer on `manager`. Must run
    /// on the manager thread.
    pub fn new(
        manager: &TaskQueueManager,
        delegate: Arc<dyn IdleHelperDelegate>,
        config: IdleConfig,
        name: &str,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let idle_queue = manager.new_task_queue(
            TaskQueueSpec::new(format!("{name}_idle"))
                .with_priority(Priority::BestEffort)
                .with_pump_policy(PumpPolicy::Manual)
                .with_wakeup_policy(WakeupPolicy::CanWakeOtherQueues),
        )?;
        idle_queue.set_enabled(false);
        let control_queue = manager.new_task_queue(
            TaskQueueSpec::new(format!("{name}_control"))
                .with_priority(Priority::Control)
                .with_wakeup_policy(WakeupPolicy::DontWakeOtherQueues),
        )?;
        let control_after_wakeup_queue = manager.new_task_queue(
            TaskQueueSpec::new(format!("{name}_control_after_wakeup"))
                .with_priority(Priority::Control)
                .with_pump_policy(PumpPolicy::AfterWakeup)
                .with_wakeup_policy(WakeupPolicy::DontWakeOtherQueues),
        )?;

        let inner = Arc::new_cyclic(|self_ref: &Weak<IdleHelperInner>| {
            let runner = IdleTaskRunner::new(
                idle_queue.clone(),
                control_after_wakeup_queue.clone(),
                Arc::new(RunnerDelegate(Weak::clone(self_ref))),
            );
            IdleHelperInner {
                self_ref: Weak::clone(self_ref),
                name: name.to_string(),
                manager: Arc::downgrade(manager.inner()),
                delegate,
                config,
                idle_queue,
                control_queue,
                control_after_wakeup_queue,
                runner,
                observer: Arc::new(IdleObserver(Weak::clone(self_ref))),
                state: Mutex::new(IdleState::default()),
            }
        });
        manager.add_task_observer(Arc::clone(&inner.observer));

        info!(
            "Idle helper '{}' created (max idle period: {}ms, min idle period: {}ms, quiescence: {}ms)",
            name,
            inner.config.maximum_idle_period_ms,
            inner.config.minimum_idle_period_ms,
            inner.config.required_quiescence_ms
        );
        Ok(Self { inner })
    }

    pub fn idle_task_runner(&self) -> IdleTaskRunner {
        self.inner.runner.clone()
    }

    /// Start a long idle period now if possible, otherwise schedule a retry.
    pub fn enable_long_idle_period(&self) {
        self.inner.enable_long_idle_period();
    }

    /// Open an idle period ending at `deadline`. Ignored when the window is
    /// shorter than the minimum idle period.
    pub fn start_idle_period(&self, state: IdlePeriodState, now: Instant, deadline: Instant) {
        self.inner.start_idle_period(state, now, deadline);
    }

    pub fn end_idle_period(&self) {
        self.inner.end_idle_period();
    }

    pub fn idle_period_state(&self) -> IdlePeriodState {
        self.inner.state().period
    }

    /// Deadline of the current idle period, if one is open.
    pub fn current_idle_task_deadline(&self) -> Option<Instant> {
        self.inner.state().deadline
    }

    /// Only long idle periods that hit the maximum length let idle tasks
    /// overrun their deadline. Post a new idle task to continue work instead
    /// of polling this.
    pub fn can_exceed_idle_deadline_if_required(&self) -> bool {
        self.inner.state().period == IdlePeriodState::InLongIdlePeriodWithMaxDeadline
    }

    pub fn idle_queue(&self) -> &TaskQueue {
        &self.inner.idle_queue
    }

    pub fn control_queue(&self) -> &TaskQueue {
        &self.inner.control_queue
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state().is_shutdown
    }

    /// Stop all idle scheduling and unregister the helper's queues. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for IdleHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("IdleHelper")
            .field("name", &self.inner.name)
            .field("period", &state.period)
            .field("deadline", &state.deadline)
            .finish_non_exhaustive()
    }
}

impl Drop for IdleHelper {
    fn drop(&mut self) {
        let on_owner = self
            .inner
            .manager
            .upgrade()
            .map_or(true, |m| m.runs_tasks_on_current_thread());
        if on_owner {
            self.inner.shutdown();
        }
    }
}

impl IdleHelperInner {
    fn state(&self) -> MutexGuard<'_, IdleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The manager, if it is alive and we are on its thread.
    fn manager(&self, op: &'static str) -> Option<Arc<ManagerInner>> {
        let manager = self.manager.upgrade()?;
        manager.on_owner_thread(op).then_some(manager)
    }

    // ── Long idle periods ────────────────────────────────────────

    fn enable_long_idle_period(&self) {
        let Some(manager) = self.manager("enable_long_idle_period") else {
            return;
        };
        if self.state().is_shutdown {
            return;
        }
        self.end_idle_period();

        let quiescence = self.config.required_quiescence();
        if !quiescence.is_zero() && !manager.get_and_clear_system_is_quiescent_bit() {
            debug!("{}: system not quiescent, retrying long idle period in {:?}", self.name, quiescence);
            self.post_enable_long_idle_period(quiescence);
            self.delegate.is_not_quiescent();
            return;
        }

        let now = manager.now();
        let (period, delay) = self.compute_new_long_idle_period_state(&manager, now);
        if period.is_in_idle_period() {
            self.start_idle_period(period, now, now + delay);
        } else {
            trace!("{}: long idle period not started, retrying in {:?}", self.name, delay);
            self.post_enable_long_idle_period(delay);
        }
    }

    /// Returns the state to enter and either the idle period length or, for
    /// `NotInIdlePeriod`, the delay before trying again.
    fn compute_new_long_idle_period_state(&self, manager: &ManagerInner, now: Instant) -> (IdlePeriodState, Duration) {
        if let LongIdlePermission::Deferred(retry) = self.delegate.can_enter_long_idle_period(now) {
            return (IdlePeriodState::NotInIdlePeriod, retry);
        }

        let max = self.config.maximum_idle_period();
        let duration = match manager.next_delayed_run_time() {
            Some(next) => next.saturating_duration_since(now).min(max),
            None => max,
        };
        if duration < self.config.minimum_idle_period() {
            return (
                IdlePeriodState::NotInIdlePeriod,
                self.config.retry_enable_long_idle_period_delay(),
            );
        }

        let period = if !self.idle_queue.has_pending_immediate_work() {
            IdlePeriodState::InLongIdlePeriodPaused
        } else if duration == max {
            IdlePeriodState::InLongIdlePeriodWithMaxDeadline
        } else {
            IdlePeriodState::InLongIdlePeriod
        };
        (period, duration)
    }

    /// Post a call to `enable_long_idle_period` on the control queue,
    /// replacing any retry already queued. Ending the idle period cancels it.
    fn post_enable_long_idle_period(&self, delay: Duration) {
        let previous = self.state().pending_enable.take();
        if let Some(previous) = previous {
            previous.cancel();
        }
        let helper = Weak::clone(&self.self_ref);
        let handle = self.control_queue.post_cancelable_delayed_task(
            "IdleHelper::enable_long_idle_period",
            move || {
                if let Some(helper) = helper.upgrade() {
                    helper.state().pending_enable = None;
                    helper.enable_long_idle_period();
                }
            },
            delay,
        );
        self.state().pending_enable = handle;
    }

    // ── Idle period bracketing ───────────────────────────────────

    fn start_idle_period(&self, period: IdlePeriodState, now: Instant, deadline: Instant) {
        if self.manager("start_idle_period").is_none() || self.state().is_shutdown {
            return;
        }
        debug_assert!(period.is_in_idle_period(), "start_idle_period needs an idle state");
        if !period.is_in_idle_period() {
            return;
        }
        let length = deadline.saturating_duration_since(now);
        if length < self.config.minimum_idle_period() {
            trace!("{}: idle period of {:?} too short, not started", self.name, length);
            return;
        }

        self.delegate.on_idle_period_started();
        self.idle_queue.set_enabled(true);
        self.idle_queue.pump(true);
        let previous = self.state().update(period, Some(deadline));
        debug!("{}: {} -> {} ({:?} until deadline)", self.name, previous, period, length);
    }

    fn end_idle_period(&self) {
        if self.manager("end_idle_period").is_none() {
            return;
        }
        let (retry, ended) = {
            let mut state = self.state();
            if state.is_shutdown {
                return;
            }
            let retry = state.cancel_pending_enables();
            let ended = state
                .period
                .is_in_idle_period()
                .then(|| state.update(IdlePeriodState::NotInIdlePeriod, None));
            (retry, ended)
        };
        if let Some(retry) = retry {
            retry.cancel();
        }
        let Some(previous) = ended else {
            return;
        };
        debug!("{}: {} ended", self.name, previous);
        self.idle_queue.set_enabled(false);
        self.delegate.on_idle_period_ended();
    }

    // ── Task hooks ───────────────────────────────────────────────

    /// Runs after every task: an expired idle period restarts (long) or ends
    /// (short).
    fn did_process_task(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let (period, deadline) = {
            let state = self.state();
            if state.is_shutdown {
                return;
            }
            (state.period, state.deadline)
        };
        if !period.is_in_idle_period() || period == IdlePeriodState::InLongIdlePeriodPaused {
            return;
        }
        if deadline.map_or(true, |deadline| manager.now() < deadline) {
            return;
        }
        if period.is_in_long_idle_period() {
            self.enable_long_idle_period();
        } else {
            self.end_idle_period();
        }
    }

    fn did_process_idle_task(&self) {
        let Some(manager) = self.manager("did_process_idle_task") else {
            return;
        };
        let (period, deadline) = {
            let state = self.state();
            if state.is_shutdown {
                return;
            }
            (state.period, state.deadline)
        };
        if !period.is_in_long_idle_period() {
            return;
        }

        if !self.idle_queue.has_pending_immediate_work() {
            self.state().update(IdlePeriodState::InLongIdlePeriodPaused, deadline);
            debug!("{}: no idle work left, long idle period paused", self.name);
        } else if self.idle_queue.needs_pumping() {
            let delay = if period == IdlePeriodState::InLongIdlePeriodWithMaxDeadline {
                Duration::ZERO
            } else {
                deadline.map_or(Duration::ZERO, |d| d.saturating_duration_since(manager.now()))
            };
            if delay.is_zero() {
                self.enable_long_idle_period();
            } else {
                self.post_enable_long_idle_period(delay);
            }
        }
    }

    fn will_process_idle_task(&self) -> Instant {
        if let Some(deadline) = self.state().deadline {
            return deadline;
        }
        self.manager.upgrade().map_or_else(Instant::now, |m| m.now())
    }

    /// May run on any thread. Off the manager thread the check bounces
    /// through the control queue.
    fn on_idle_task_posted(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if manager.runs_tasks_on_current_thread() {
            self.on_idle_task_posted_on_main_thread();
            return;
        }
        let generation = self.state().generation;
        let helper = Weak::clone(&self.self_ref);
        self.control_queue.post_task("IdleHelper::on_idle_task_posted", move || {
            if let Some(helper) = helper.upgrade() {
                if helper.state().generation == generation {
                    helper.on_idle_task_posted_on_main_thread();
                }
            }
        });
    }

    fn on_idle_task_posted_on_main_thread(&self) {
        if self.state().period == IdlePeriodState::InLongIdlePeriodPaused {
            debug!("{}: idle task posted while paused, restarting long idle periods", self.name);
            self.post_enable_long_idle_period(Duration::ZERO);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    fn shutdown(&self) {
        let retry = {
            let mut state = self.state();
            if state.is_shutdown {
                return;
            }
            state.is_shutdown = true;
            state.cancel_pending_enables()
        };
        if let Some(retry) = retry {
            retry.cancel();
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_task_observer(&self.observer);
        }
        self.idle_queue.unregister();
        self.control_queue.unregister();
        self.control_after_wakeup_queue.unregister();
        info!("Idle helper '{}' shut down", self.name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::sim::SimulatedHost;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[derive(Default)]
    struct CountingDelegate {
        started: AtomicUsize,
        ended: AtomicUsize,
        not_quiescent: AtomicUsize,
    }

    impl IdleHelperDelegate for CountingDelegate {
        fn is_not_quiescent(&self) {
            self.not_quiescent.fetch_add(1, Ordering::Relaxed);
        }
        fn on_idle_period_started(&self) {
            self.started.fetch_add(1, Ordering::Relaxed);
        }
        fn on_idle_period_ended(&self) {
            self.ended.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn setup(config: IdleConfig) -> (Arc<SimulatedHost>, TaskQueueManager, Arc<CountingDelegate>, IdleHelper) {
        let host = SimulatedHost::new();
        let manager = TaskQueueManager::with_defaults(host.clone());
        let delegate = Arc::new(CountingDelegate::default());
        let helper = IdleHelper::new(&manager, delegate.clone(), config, "test").unwrap();
        (host, manager, delegate, helper)
    }

    #[test]
    fn creates_disabled_idle_queue_and_control_queues() {
        let (_host, _manager, _delegate, helper) = setup(IdleConfig::default());
        assert_eq!(helper.idle_queue().name(), "test_idle");
        assert!(!helper.idle_queue().is_enabled());
        assert_eq!(helper.idle_queue().pump_policy(), PumpPolicy::Manual);
        assert_eq!(helper.control_queue().priority(), Some(Priority::Control));
        assert_eq!(helper.idle_period_state(), IdlePeriodState::NotInIdlePeriod);
    }

    #[test]
    fn rejects_max_below_min() {
        let host = SimulatedHost::new();
        let manager = TaskQueueManager::with_defaults(host);
        let config = IdleConfig {
            maximum_idle_period_ms: 1,
            minimum_idle_period_ms: 2,
            ..IdleConfig::default()
        };
        let err = IdleHelper::new(&manager, Arc::new(crate::idle::PermissiveIdleDelegate), config, "bad");
        assert!(matches!(err, Err(SchedulerError::Config(_))));
    }

    #[test]
    fn short_period_brackets_idle_queue() {
        let (host, _manager, delegate, helper) = setup(IdleConfig::default());
        let now = host.now();
        helper.start_idle_period(IdlePeriodState::InShortIdlePeriod, now, now + ms(10));
        assert_eq!(helper.idle_period_state(), IdlePeriodState::InShortIdlePeriod);
        assert_eq!(helper.current_idle_task_deadline(), Some(now + ms(10)));
        assert!(helper.idle_queue().is_enabled());
        assert!(!helper.can_exceed_idle_deadline_if_required());

        helper.end_idle_period();
        assert_eq!(helper.idle_period_state(), IdlePeriodState::NotInIdlePeriod);
        assert!(!helper.idle_queue().is_enabled());
        assert_eq!(delegate.started.load(Ordering::Relaxed), 1);
        assert_eq!(delegate.ended.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn too_short_period_is_ignored() {
        let (host, _manager, delegate, helper) = setup(IdleConfig {
            minimum_idle_period_ms: 5,
            ..IdleConfig::default()
        });
        let now = host.now();
        helper.start_idle_period(IdlePeriodState::InShortIdlePeriod, now, now + ms(2));
        assert_eq!(helper.idle_period_state(), IdlePeriodState::NotInIdlePeriod);
        assert_eq!(delegate.started.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn long_period_without_idle_work_is_paused() {
        let (_host, _manager, _delegate, helper) = setup(IdleConfig::default());
        helper.enable_long_idle_period();
        assert_eq!(helper.idle_period_state(), IdlePeriodState::InLongIdlePeriodPaused);
    }

    #[test]
    fn shutdown_unregisters_queues() {
        let (_host, _manager, _delegate, helper) = setup(IdleConfig::default());
        helper.shutdown();
        assert!(helper.is_shutdown());
        assert!(!helper.idle_queue().is_registered());
        assert!(!helper.idle_task_runner().post_idle_task("test", |_| {}));
        helper.enable_long_idle_period();
        assert_eq!(helper.idle_period_state(), IdlePeriodState::NotInIdlePeriod);
    }
}
