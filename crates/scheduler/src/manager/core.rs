use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use lanesched_core::SchedulerConfig;
use tracing::{debug, info, trace, warn};

use crate::error::SchedulerError;
use crate::host::SchedulerHost;
use crate::metrics::SchedulerMetrics;
use crate::observer::{TaskObserver, TaskQueueManagerObserver};
use crate::selector::TaskQueueSelector;
use crate::task::Task;
use crate::task_queue::internal::{QueueMain, QueueShared};
use crate::task_queue::{TaskQueue, TaskQueueSpec};
use crate::time_domain::{due_time, TimeDomain, TimeDomainKind, TimeSource, VirtualClock, WakeupSink};
use crate::types::{EnqueueOrder, ManagerState, QueueId, TimeDomainId, WakeupKind};

/// Host callbacks requested and not yet delivered.
#[derive(Debug, Default)]
pub(crate) struct PendingWakeups {
    pub immediate_pending: bool,
    /// Due times of every outstanding delayed callback, superseded ones
    /// included.
    pub delayed_pending: BTreeSet<Instant>,
}

impl PendingWakeups {
    /// Forget the delayed callbacks due at or before `now`.
    pub fn drain_delayed_until(&mut self, now: Instant) {
        self.delayed_pending = self.delayed_pending.split_off(&now);
        self.delayed_pending.remove(&now);
    }
}

/// Allocates the manager-global enqueue order.
#[derive(Debug, Default)]
pub(crate) struct EnqueueOrderGenerator(u64);

impl EnqueueOrderGenerator {
    pub fn next(&mut self) -> EnqueueOrder {
        self.0 += 1;
        EnqueueOrder(self.0)
    }
}

/// State only the manager thread reads or writes.
pub(crate) struct ManagerMain {
    pub queues: BTreeMap<QueueId, QueueMain>,
    pub time_domains: BTreeMap<TimeDomainId, TimeDomain>,
    pub real_time_domain: TimeDomainId,
    pub selector: TaskQueueSelector,
    pub enqueue_orders: EnqueueOrderGenerator,
    pub work_batch_size: usize,
    /// Non-nestable tasks selected while the loop was nested.
    pub deferred_non_nestable: VecDeque<Task>,
    pub currently_executing: Option<QueueId>,
    pub task_ran_on_monitored_queue: bool,
    next_queue_id: u64,
    next_time_domain_id: u64,
    pub shut_down: bool,
}

impl ManagerMain {
    fn new(config: &SchedulerConfig, host: Arc<dyn SchedulerHost>) -> Self {
        let real_time_domain = TimeDomainId(0);
        let mut time_domains = BTreeMap::new();
        time_domains.insert(
            real_time_domain,
            TimeDomain::new(real_time_domain, "real", TimeSource::Real(host)),
        );
        Self {
            queues: BTreeMap::new(),
            time_domains,
            real_time_domain,
            selector: TaskQueueSelector::new(config.starvation_threshold),
            enqueue_orders: EnqueueOrderGenerator::default(),
            work_batch_size: config.work_batch_size.max(1),
            deferred_non_nestable: VecDeque::new(),
            currently_executing: None,
            task_ran_on_monitored_queue: false,
            next_queue_id: 1,
            next_time_domain_id: 1,
            shut_down: false,
        }
    }

    fn allocate_queue_id(&mut self) -> QueueId {
        let id = QueueId(self.next_queue_id);
        self.next_queue_id += 1;
        id
    }

    fn allocate_time_domain_id(&mut self) -> TimeDomainId {
        let id = TimeDomainId(self.next_time_domain_id);
        self.next_time_domain_id += 1;
        id
    }

    /// Every due time indexed by a real-clock domain.
    pub fn real_due_times(&self) -> BTreeSet<Instant> {
        self.time_domains
            .values()
            .filter(|d| !d.is_virtual())
            .flat_map(TimeDomain::scheduled_run_times)
            .collect()
    }

    /// Take a pending delayed task out of its queue and, when no sibling
    /// shares its due time, out of its time domain's index.
    fn remove_delayed_task(&mut self, queue_id: QueueId, sequence_num: u64) -> Option<Task> {
        let queue = self.queues.get_mut(&queue_id)?;
        if let Some((task, due, due_still_used)) = queue.remove_delayed_task(sequence_num) {
            if !due_still_used {
                if let Some(domain) = self.time_domains.get_mut(&queue.time_domain) {
                    domain.cancel_delayed_wakeup(queue_id, due);
                }
            }
            return Some(task);
        }
        let mut any = queue.shared.any_thread();
        let index = any
            .delayed_incoming
            .iter()
            .position(|t| t.sequence_num == sequence_num)?;
        Some(any.delayed_incoming.remove(index))
    }

    /// Earliest pending wakeup across real-clock domains.
    pub fn next_real_delayed_run_time(&self) -> Option<Instant> {
        self.time_domains
            .values()
            .filter(|d| !d.is_virtual())
            .filter_map(TimeDomain::next_scheduled_run_time)
            .min()
    }

    /// Tear everything down and return the tasks to drop once the lock is gone.
    fn shutdown(&mut self) -> Vec<Task> {
        if self.shut_down {
            return Vec::new();
        }
        self.shut_down = true;
        let mut dropped: Vec<Task> = self.deferred_non_nestable.drain(..).collect();
        for (id, mut queue) in std::mem::take(&mut self.queues) {
            dropped.extend(queue.clear(self.selector.sets_mut()));
            for domain in self.time_domains.values_mut() {
                domain.cancel_delayed_work(id);
            }
            let mut any = queue.shared.any_thread();
            any.registered = false;
            dropped.extend(any.immediate_incoming.drain(..));
            dropped.append(&mut any.delayed_incoming);
        }
        dropped
    }
}

/// Everything behind a [`TaskQueueManager`], shared with queue handles and
/// the idle helper through `Weak` references.
pub(crate) struct ManagerInner {
    self_ref: Weak<ManagerInner>,
    pub(crate) host: Arc<dyn SchedulerHost>,
    owner: ThreadId,
    pub(crate) config: SchedulerConfig,
    next_sequence: AtomicU64,
    main: Mutex<ManagerMain>,
    wakeups: Mutex<PendingWakeups>,
    observers: Mutex<Vec<Arc<dyn TaskObserver>>>,
    manager_observer: Mutex<Option<Arc<dyn TaskQueueManagerObserver>>>,
    pub(super) executing_depth: AtomicUsize,
    pub(super) metrics: RwLock<SchedulerMetrics>,
}

impl ManagerInner {
    // ── Thread affinity ──────────────────────────────────────────

    pub fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Checks that `op` runs on the manager thread. Asserts in debug builds,
    /// logs and refuses in release builds.
    pub(crate) fn on_owner_thread(&self, op: &'static str) -> bool {
        let on_owner = self.runs_tasks_on_current_thread();
        debug_assert!(on_owner, "{op} must be called on the scheduler thread");
        if !on_owner {
            warn!(op, "Main-thread operation called from another thread; ignoring");
        }
        on_owner
    }

    pub(super) fn lock_main(&self) -> MutexGuard<'_, ManagerMain> {
        self.main.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Main-thread access that gives up when the lock is already held by the
    /// current call stack.
    pub(crate) fn try_lock_main(&self) -> Option<MutexGuard<'_, ManagerMain>> {
        match self.main.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Run `f` against main-thread state, or `None` off the manager thread.
    pub(crate) fn with_main<R>(&self, op: &'static str, f: impl FnOnce(&mut ManagerMain) -> R) -> Option<R> {
        if !self.on_owner_thread(op) {
            return None;
        }
        let mut main = self.lock_main();
        Some(f(&mut main))
    }

    // ── Wakeups ──────────────────────────────────────────────────

    pub(super) fn wakeups(&self) -> MutexGuard<'_, PendingWakeups> {
        self.wakeups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_sequence_number(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Ask the host for one immediate pass. Repeated calls before that pass
    /// runs are coalesced.
    pub(crate) fn maybe_schedule_immediate_work(&self, from: &'static str) {
        {
            let mut wakeups = self.wakeups();
            if wakeups.immediate_pending {
                return;
            }
            wakeups.immediate_pending = true;
        }
        debug!(from, "Scheduling immediate pass");
        self.host.post_do_work(Duration::ZERO, WakeupKind::Immediate);
    }

    /// Withdraw delayed host callbacks that no indexed due time needs any
    /// more, then make sure the earliest remaining one is covered.
    fn retract_stale_delayed_wakeups(&self, live: &BTreeSet<Instant>) {
        let now = self.host.now();
        let stale: Vec<Instant> = {
            let mut wakeups = self.wakeups();
            let stale: Vec<Instant> = wakeups
                .delayed_pending
                .iter()
                .filter(|at| **at > now && !live.contains(*at))
                .copied()
                .collect();
            for at in &stale {
                wakeups.delayed_pending.remove(at);
            }
            stale
        };
        if !stale.is_empty() {
            debug!("Withdrawing {} stale delayed passes", stale.len());
        }
        for at in stale {
            self.host.cancel_do_work(at);
        }
        match live.first() {
            Some(next) if *next > now => self.request_delayed_wakeup(now, *next - now),
            Some(_) => self.maybe_schedule_immediate_work("retract_stale_delayed_wakeups"),
            None => {}
        }
    }

    /// Remove a cancelled delayed task. Off the manager thread, or while the
    /// manager is busy on this thread, the task's flag alone keeps it from
    /// running.
    pub(crate) fn cancel_delayed_task(&self, queue: QueueId, sequence_num: u64) {
        if !self.runs_tasks_on_current_thread() {
            return;
        }
        let Some(mut main) = self.try_lock_main() else {
            return;
        };
        let removed = main.remove_delayed_task(queue, sequence_num);
        let live = main.real_due_times();
        drop(main);

        let Some(task) = removed else {
            return;
        };
        trace!("Cancelled delayed task posted from {} on queue {}", task.posted_from, queue);
        drop(task);
        if let Ok(mut m) = self.metrics.write() {
            m.delayed_tasks_cancelled += 1;
        }
        self.retract_stale_delayed_wakeups(&live);
    }

    // ── Queues ───────────────────────────────────────────────────

    pub(crate) fn new_task_queue(&self, spec: TaskQueueSpec) -> Result<TaskQueue, SchedulerError> {
        self.with_main("new_task_queue", |main| {
            if main.shut_down {
                return Err(SchedulerError::ShutDown);
            }
            let domain_id = spec.time_domain.unwrap_or(main.real_time_domain);
            let source = main
                .time_domains
                .get(&domain_id)
                .ok_or(SchedulerError::UnknownTimeDomain(domain_id))?
                .source()
                .clone();

            let id = main.allocate_queue_id();
            let shared = Arc::new(QueueShared::new(
                id,
                Arc::from(spec.name.as_str()),
                Weak::clone(&self.self_ref),
                spec.pump_policy,
                domain_id,
                source,
            ));
            let mut queue = QueueMain::new(
                Arc::clone(&shared),
                spec.priority,
                spec.wakeup_policy,
                spec.should_monitor_quiescence,
                spec.should_report_when_execution_blocked,
                domain_id,
            );
            queue.add_to_sets(main.selector.sets_mut());
            main.queues.insert(id, queue);

            info!(
                "Registered task queue {} '{}' (priority: {}, pump: {}, domain: {})",
                id, spec.name, spec.priority, spec.pump_policy, domain_id
            );
            Ok(TaskQueue::from_shared(shared))
        })
        .unwrap_or(Err(SchedulerError::WrongThread))
    }

    /// Remove `queue` from every structure. Its pending tasks are dropped
    /// after the manager lock is released.
    pub(crate) fn unregister_task_queue(&self, queue: QueueId) {
        let unregistered = self.with_main("unregister_task_queue", |main| {
            let mut state = main.queues.remove(&queue)?;
            let mut dropped = state.clear(main.selector.sets_mut());
            if let Some(domain) = main.time_domains.get_mut(&state.time_domain) {
                domain.cancel_delayed_work(queue);
            }
            {
                let mut any = state.shared.any_thread();
                any.registered = false;
                dropped.extend(any.immediate_incoming.drain(..));
                dropped.append(&mut any.delayed_incoming);
            }
            Some((state.shared, dropped, main.real_due_times()))
        });
        let Some((shared, dropped, live)) = unregistered.flatten() else {
            return;
        };
        info!("Unregistered task queue {} ({} pending tasks dropped)", queue, dropped.len());
        drop(dropped);
        self.retract_stale_delayed_wakeups(&live);
        if let Some(observer) = self.manager_observer() {
            observer.on_unregister_task_queue(&TaskQueue::from_shared(shared));
        }
    }

    // ── Time domains ─────────────────────────────────────────────

    pub(crate) fn register_time_domain(
        &self,
        name: &str,
        kind: TimeDomainKind,
    ) -> Result<TimeDomainId, SchedulerError> {
        self.with_main("register_time_domain", |main| {
            let id = main.allocate_time_domain_id();
            let source = match kind {
                TimeDomainKind::Real => TimeSource::Real(Arc::clone(&self.host)),
                TimeDomainKind::Virtual { start } => TimeSource::Virtual(Arc::new(VirtualClock::new(start))),
            };
            main.time_domains.insert(id, TimeDomain::new(id, name, source));
            info!("Registered time domain {} '{}' ({:?})", id, name, kind);
            id
        })
        .ok_or(SchedulerError::WrongThread)
    }

    pub(crate) fn unregister_time_domain(&self, id: TimeDomainId) -> Result<(), SchedulerError> {
        self.with_main("unregister_time_domain", |main| {
            if id == main.real_time_domain {
                return Err(SchedulerError::RealTimeDomainRequired);
            }
            if !main.time_domains.contains_key(&id) {
                return Err(SchedulerError::UnknownTimeDomain(id));
            }
            if main.queues.values().any(|q| q.time_domain == id) {
                return Err(SchedulerError::TimeDomainInUse(id));
            }
            main.time_domains.remove(&id);
            info!("Unregistered time domain {}", id);
            Ok(())
        })
        .unwrap_or(Err(SchedulerError::WrongThread))
    }

    pub(crate) fn advance_virtual_time(&self, id: TimeDomainId, to: Instant) -> Result<(), SchedulerError> {
        let due_work = self
            .with_main("advance_virtual_time", |main| {
                let domain = main
                    .time_domains
                    .get(&id)
                    .ok_or(SchedulerError::UnknownTimeDomain(id))?;
                domain.advance_to(to)?;
                Ok(domain.next_scheduled_run_time().is_some_and(|due| due <= to))
            })
            .unwrap_or(Err(SchedulerError::WrongThread))?;
        if due_work {
            self.maybe_schedule_immediate_work("advance_virtual_time");
        }
        Ok(())
    }

    pub(crate) fn time_domain_now(&self, id: TimeDomainId) -> Option<Instant> {
        self.with_main("time_domain_now", |main| main.time_domains.get(&id).map(TimeDomain::now))
            .flatten()
    }

    pub(crate) fn real_time_domain(&self) -> TimeDomainId {
        self.with_main("real_time_domain", |main| main.real_time_domain)
            .unwrap_or(TimeDomainId(0))
    }

    // ── Observers ────────────────────────────────────────────────

    pub(crate) fn add_task_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn remove_task_observer(&self, observer: &Arc<dyn TaskObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub(crate) fn set_observer(&self, observer: Option<Arc<dyn TaskQueueManagerObserver>>) {
        *self
            .manager_observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = observer;
    }

    pub(super) fn manager_observer(&self) -> Option<Arc<dyn TaskQueueManagerObserver>> {
        self.manager_observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(super) fn observers_snapshot(&self) -> Vec<Arc<dyn TaskObserver>> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Queries ──────────────────────────────────────────────────

    /// `false` iff a task from a quiescence-monitored queue ran since the
    /// previous call.
    pub(crate) fn get_and_clear_system_is_quiescent_bit(&self) -> bool {
        self.with_main("get_and_clear_system_is_quiescent_bit", |main| {
            !std::mem::replace(&mut main.task_ran_on_monitored_queue, false)
        })
        .unwrap_or(true)
    }

    pub(crate) fn has_immediate_work(&self) -> bool {
        self.with_main("has_immediate_work", |main| {
            main.selector.has_ready_work()
                || main
                    .queues
                    .values()
                    .any(|q| !q.shared.any_thread().immediate_incoming.is_empty())
        })
        .unwrap_or(false)
    }

    pub(crate) fn next_delayed_run_time(&self) -> Option<Instant> {
        self.with_main("next_delayed_run_time", |main| main.next_real_delayed_run_time())
            .flatten()
    }

    pub(crate) fn currently_executing_queue(&self) -> Option<QueueId> {
        self.with_main("currently_executing_queue", |main| main.currently_executing)
            .flatten()
    }

    pub(crate) fn set_work_batch_size(&self, size: usize) {
        self.with_main("set_work_batch_size", |main| main.work_batch_size = size.max(1));
    }

    pub(crate) fn metrics(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub(crate) fn state(&self) -> ManagerState {
        if self.executing_depth.load(Ordering::Relaxed) > 0 {
            return ManagerState::Running;
        }
        let wakeups = self.wakeups();
        if wakeups.immediate_pending || !wakeups.delayed_pending.is_empty() {
            ManagerState::Scheduled
        } else {
            ManagerState::Idle
        }
    }

    pub(crate) fn now(&self) -> Instant {
        self.host.now()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub(crate) fn shutdown(&self) {
        let Some(dropped) = self.with_main("shutdown", ManagerMain::shutdown) else {
            return;
        };
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.set_observer(None);
        info!("Task queue manager shut down ({} pending tasks dropped)", dropped.len());
    }
}

impl WakeupSink for ManagerInner {
    /// Delayed host callback for `now + delay`, skipped when one is already
    /// pending at an earlier or equal time.
    fn request_delayed_wakeup(&self, now: Instant, delay: Duration) {
        let run_time = due_time(now, delay);
        {
            let mut wakeups = self.wakeups();
            if wakeups
                .delayed_pending
                .first()
                .is_some_and(|pending| *pending <= run_time)
            {
                return;
            }
            wakeups.delayed_pending.insert(run_time);
        }
        debug!(?delay, "Scheduling delayed pass");
        self.host.post_do_work(delay, WakeupKind::Delayed);
    }
}

// ── Public handle ────────────────────────────────────────────────

/// Owner of all task queues and time domains of one run-loop thread.
///
/// The manager belongs to the thread that created it. Queue handles may post
/// from any thread, but every other operation must run on the owning thread.
/// Dropping the manager shuts it down.
pub struct TaskQueueManager {
    inner: Arc<ManagerInner>,
}

impl TaskQueueManager {
    /// Create a manager bound to the current thread.
    pub fn new(host: Arc<dyn SchedulerHost>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        info!(
            "Task queue manager created (batch size: {}, starvation threshold: {})",
            config.work_batch_size, config.starvation_threshold
        );
        Ok(Self::build(host, config))
    }

    pub fn with_defaults(host: Arc<dyn SchedulerHost>) -> Self {
        Self::build(host, SchedulerConfig::default())
    }

    fn build(host: Arc<dyn SchedulerHost>, config: SchedulerConfig) -> Self {
        let main = ManagerMain::new(&config, Arc::clone(&host));
        let inner = Arc::new_cyclic(|self_ref| ManagerInner {
            self_ref: Weak::clone(self_ref),
            host,
            owner: thread::current().id(),
            config,
            next_sequence: AtomicU64::new(0),
            main: Mutex::new(main),
            wakeups: Mutex::new(PendingWakeups::default()),
            observers: Mutex::new(Vec::new()),
            manager_observer: Mutex::new(None),
            executing_depth: AtomicUsize::new(0),
            metrics: RwLock::new(SchedulerMetrics::default()),
        });
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ManagerInner> {
        &self.inner
    }

    /// Entry point for host callbacks.
    pub fn do_work(&self, wakeup: WakeupKind) {
        self.inner.do_work(wakeup);
    }

    /// Call after a nested run loop exits so parked non-nestable tasks run.
    pub fn on_nested_loop_exited(&self) {
        self.inner.on_nested_loop_exited();
    }

    pub fn new_task_queue(&self, spec: TaskQueueSpec) -> Result<TaskQueue, SchedulerError> {
        self.inner.new_task_queue(spec)
    }

    pub fn unregister_task_queue(&self, queue: &TaskQueue) {
        self.inner.unregister_task_queue(queue.id());
    }

    pub fn register_time_domain(&self, name: &str, kind: TimeDomainKind) -> Result<TimeDomainId, SchedulerError> {
        self.inner.register_time_domain(name, kind)
    }

    /// Fails while any queue is still bound to the domain.
    pub fn unregister_time_domain(&self, id: TimeDomainId) -> Result<(), SchedulerError> {
        self.inner.unregister_time_domain(id)
    }

    pub fn real_time_domain(&self) -> TimeDomainId {
        self.inner.real_time_domain()
    }

    /// Move a virtual domain's clock forward and schedule a pass if that made
    /// delayed work due.
    pub fn advance_virtual_time(&self, id: TimeDomainId, to: Instant) -> Result<(), SchedulerError> {
        self.inner.advance_virtual_time(id, to)
    }

    pub fn time_domain_now(&self, id: TimeDomainId) -> Option<Instant> {
        self.inner.time_domain_now(id)
    }

    pub fn add_task_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.inner.add_task_observer(observer);
    }

    pub fn remove_task_observer(&self, observer: &Arc<dyn TaskObserver>) {
        self.inner.remove_task_observer(observer);
    }

    /// Install the manager observer, replacing any previous one. `None`
    /// removes it.
    pub fn set_observer(&self, observer: Option<Arc<dyn TaskQueueManagerObserver>>) {
        self.inner.set_observer(observer);
    }

    pub fn get_and_clear_system_is_quiescent_bit(&self) -> bool {
        self.inner.get_and_clear_system_is_quiescent_bit()
    }

    /// Whether any queue has ready or incoming immediate work.
    pub fn has_immediate_work(&self) -> bool {
        self.inner.has_immediate_work()
    }

    /// Earliest due time across real-clock domains.
    pub fn next_delayed_run_time(&self) -> Option<Instant> {
        self.inner.next_delayed_run_time()
    }

    pub fn currently_executing_queue(&self) -> Option<QueueId> {
        self.inner.currently_executing_queue()
    }

    pub fn set_work_batch_size(&self, size: usize) {
        self.inner.set_work_batch_size(size);
    }

    pub fn runs_tasks_on_current_thread(&self) -> bool {
        self.inner.runs_tasks_on_current_thread()
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.inner.metrics()
    }

    pub fn state(&self) -> ManagerState {
        self.inner.state()
    }

    pub fn now(&self) -> Instant {
        self.inner.now()
    }

    /// Unregister every queue and drop all pending tasks. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for TaskQueueManager {
    fn drop(&mut self) {
        if self.inner.runs_tasks_on_current_thread() {
            self.inner.shutdown();
        }
    }
}
