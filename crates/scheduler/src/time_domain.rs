//! Time sources and the cross-queue delayed-wakeup index.
//!
//! Every queue is bound to exactly one [`TimeDomain`]. The domain supplies
//! "now" for that queue and keeps an ordered index of `(due time, queue)`
//! entries for pending delayed tasks. Two variants exist: the real domain
//! reads the host clock and asks the host for a timer when a new earliest
//! entry appears; a virtual domain keeps its own clock and only moves when
//! explicitly advanced.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::SchedulerError;
use crate::host::SchedulerHost;
use crate::types::{QueueId, TimeDomainId};

/// Longest delay a task can be posted with. Longer delays are capped, so
/// such a task stays pending without ever coming due in practice.
pub(crate) const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + delay` without overflowing the clock.
pub(crate) fn due_time(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now)
}

/// Receiver of real-clock wakeup requests (the manager).
pub(crate) trait WakeupSink {
    fn request_delayed_wakeup(&self, now: Instant, delay: Duration);
}

/// Clock owned by a virtual time domain.
#[derive(Debug)]
pub(crate) struct VirtualClock {
    now: Mutex<Instant>,
}

impl VirtualClock {
    pub fn new(start: Instant) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance_to(&self, to: Instant) -> bool {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if to < *now {
            return false;
        }
        *now = to;
        true
    }
}

/// Where a domain reads "now" from. Cloneable so producer threads can
/// compute due times without touching main-thread state.
#[derive(Clone)]
pub(crate) enum TimeSource {
    Real(Arc<dyn SchedulerHost>),
    Virtual(Arc<VirtualClock>),
}

impl TimeSource {
    pub fn now(&self) -> Instant {
        match self {
            TimeSource::Real(host) => host.now(),
            TimeSource::Virtual(clock) => clock.now(),
        }
    }
}

/// Which kind of time domain to register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeDomainKind {
    /// Driven by the host clock.
    Real,
    /// Driven by explicit `advance_virtual_time` calls, starting at `start`.
    Virtual { start: Instant },
}

/// A clock reading cached for the duration of one scheduling pass.
pub struct LazyNow {
    source: TimeSource,
    now: Option<Instant>,
}

impl LazyNow {
    pub(crate) fn new(source: TimeSource) -> Self {
        Self { source, now: None }
    }

    /// Reads the clock on first use and returns the cached value afterwards.
    pub fn now(&mut self) -> Instant {
        *self.now.get_or_insert_with(|| self.source.now())
    }
}

/// Maps due times from one domain's clock onto another's, keeping the
/// remaining delay of every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DueTimeRebase {
    pub from_now: Instant,
    pub to_now: Instant,
}

impl DueTimeRebase {
    pub fn apply(&self, due: Instant) -> Instant {
        if due >= self.from_now {
            due_time(self.to_now, due - self.from_now)
        } else {
            let overdue = self.from_now - due;
            self.to_now.checked_sub(overdue).unwrap_or(self.to_now)
        }
    }
}

pub(crate) struct TimeDomain {
    id: TimeDomainId,
    name: String,
    source: TimeSource,
    delayed_wakeups: BTreeSet<(Instant, QueueId)>,
}

impl TimeDomain {
    pub fn new(id: TimeDomainId, name: impl Into<String>, source: TimeSource) -> Self {
        Self {
            id,
            name: name.into(),
            source,
            delayed_wakeups: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> TimeDomainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &TimeSource {
        &self.source
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.source, TimeSource::Virtual(_))
    }

    pub fn now(&self) -> Instant {
        self.source.now()
    }

    pub fn create_lazy_now(&self) -> LazyNow {
        LazyNow::new(self.source.clone())
    }

    /// Index a pending delayed task of `queue`. Requests a wakeup only when
    /// the new entry became the earliest one.
    pub fn schedule_delayed_work(
        &mut self,
        queue: QueueId,
        due: Instant,
        now: Instant,
        sink: &dyn WakeupSink,
    ) {
        let was_earliest = self.next_scheduled_run_time();
        self.delayed_wakeups.insert((due, queue));
        let becomes_earliest = was_earliest.map_or(true, |t| due < t);
        if becomes_earliest {
            self.request_wakeup(now, due.saturating_duration_since(now), sink);
        }
    }

    /// Drop the entry of `queue` due at `due`, if any.
    pub fn cancel_delayed_wakeup(&mut self, queue: QueueId, due: Instant) {
        self.delayed_wakeups.remove(&(due, queue));
    }

    /// Drop every pending entry of `queue`.
    pub fn cancel_delayed_work(&mut self, queue: QueueId) {
        self.delayed_wakeups.retain(|(_, q)| *q != queue);
    }

    /// Pop every due entry and return the affected queues, each once, in the
    /// order of their earliest due entry. That order is the order in which
    /// their ready delayed tasks receive enqueue orders.
    pub fn wake_up_ready_delayed_queues(&mut self, lazy_now: &mut LazyNow) -> Vec<QueueId> {
        let mut woken = Vec::new();
        let mut seen = HashSet::new();
        while let Some(&(due, queue)) = self.delayed_wakeups.first() {
            if due > lazy_now.now() {
                break;
            }
            self.delayed_wakeups.pop_first();
            if seen.insert(queue) {
                woken.push(queue);
            }
        }
        if !woken.is_empty() {
            trace!(domain = %self.name, queues = woken.len(), "Woke delayed queues");
        }
        woken
    }

    /// Move all entries of `queue` into `destination`, rebased onto the
    /// destination clock. Entries of other queues keep their order.
    pub fn migrate_queue(
        &mut self,
        queue: QueueId,
        destination: &mut TimeDomain,
        sink: &dyn WakeupSink,
    ) -> DueTimeRebase {
        let rebase = DueTimeRebase {
            from_now: self.now(),
            to_now: destination.now(),
        };
        let moved: Vec<Instant> = self
            .delayed_wakeups
            .iter()
            .filter(|(_, q)| *q == queue)
            .map(|(due, _)| *due)
            .collect();
        self.cancel_delayed_work(queue);
        for due in moved {
            destination.schedule_delayed_work(queue, rebase.apply(due), rebase.to_now, sink);
        }
        rebase
    }

    /// Real domains ask the host for a timer; virtual domains wait for time
    /// to be advanced.
    pub fn request_wakeup(&self, now: Instant, delay: Duration, sink: &dyn WakeupSink) {
        match &self.source {
            TimeSource::Real(_) => sink.request_delayed_wakeup(now, delay),
            TimeSource::Virtual(_) => {
                trace!(domain = %self.name, ?delay, "Virtual wakeup pending until time advances");
            }
        }
    }

    pub fn advance_to(&self, to: Instant) -> Result<(), SchedulerError> {
        match &self.source {
            TimeSource::Virtual(clock) => {
                if clock.advance_to(to) {
                    Ok(())
                } else {
                    Err(SchedulerError::TimeWentBackwards(self.id))
                }
            }
            TimeSource::Real(_) => Err(SchedulerError::NotVirtual(self.id)),
        }
    }

    pub fn next_scheduled_run_time(&self) -> Option<Instant> {
        self.delayed_wakeups.first().map(|(due, _)| *due)
    }

    pub fn scheduled_run_times(&self) -> impl Iterator<Item = Instant> + '_ {
        self.delayed_wakeups.iter().map(|(due, _)| *due)
    }

    pub fn next_scheduled_task_queue(&self) -> Option<QueueId> {
        self.delayed_wakeups.first().map(|(_, q)| *q)
    }

    pub fn has_pending_wakeups(&self) -> bool {
        !self.delayed_wakeups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        requests: RefCell<Vec<Duration>>,
    }

    impl WakeupSink for RecordingSink {
        fn request_delayed_wakeup(&self, _now: Instant, delay: Duration) {
            self.requests.borrow_mut().push(delay);
        }
    }

    struct FixedHost(Instant);

    impl SchedulerHost for FixedHost {
        fn now(&self) -> Instant {
            self.0
        }
        fn post_do_work(&self, _delay: Duration, _wakeup: crate::types::WakeupKind) {}
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn real_domain(now: Instant) -> TimeDomain {
        TimeDomain::new(TimeDomainId(0), "real", TimeSource::Real(Arc::new(FixedHost(now))))
    }

    fn virtual_domain(id: u64, start: Instant) -> TimeDomain {
        TimeDomain::new(
            TimeDomainId(id),
            "virtual",
            TimeSource::Virtual(Arc::new(VirtualClock::new(start))),
        )
    }

    #[test]
    fn wakeup_requested_only_for_new_earliest() {
        let now = Instant::now();
        let sink = RecordingSink::default();
        let mut domain = real_domain(now);
        let q = QueueId(1);

        domain.schedule_delayed_work(q, now + ms(50), now, &sink);
        domain.schedule_delayed_work(q, now + ms(100), now, &sink);
        domain.schedule_delayed_work(q, now + ms(20), now, &sink);

        assert_eq!(*sink.requests.borrow(), vec![ms(50), ms(20)]);
        assert_eq!(domain.next_scheduled_run_time(), Some(now + ms(20)));
    }

    #[test]
    fn wake_dedupes_queues_in_due_order() {
        let now = Instant::now();
        let sink = RecordingSink::default();
        let mut domain = virtual_domain(1, now);
        let (a, b) = (QueueId(1), QueueId(2));

        domain.schedule_delayed_work(a, now + ms(10), now, &sink);
        domain.schedule_delayed_work(b, now + ms(5), now, &sink);
        domain.schedule_delayed_work(a, now + ms(7), now, &sink);
        domain.schedule_delayed_work(b, now + ms(30), now, &sink);

        domain.advance_to(now + ms(20)).unwrap();
        let mut lazy_now = domain.create_lazy_now();
        assert_eq!(domain.wake_up_ready_delayed_queues(&mut lazy_now), vec![b, a]);
        assert_eq!(domain.next_scheduled_run_time(), Some(now + ms(30)));
        assert!(sink.requests.borrow().is_empty(), "virtual domains never ask the host");
    }

    #[test]
    fn cancel_removes_only_that_queue() {
        let now = Instant::now();
        let sink = RecordingSink::default();
        let mut domain = real_domain(now);
        domain.schedule_delayed_work(QueueId(1), now + ms(1), now, &sink);
        domain.schedule_delayed_work(QueueId(2), now + ms(2), now, &sink);

        domain.cancel_delayed_work(QueueId(1));
        assert_eq!(domain.next_scheduled_task_queue(), Some(QueueId(2)));
        domain.cancel_delayed_work(QueueId(2));
        assert!(!domain.has_pending_wakeups());
    }

    #[test]
    fn cancel_single_entry_keeps_the_rest() {
        let now = Instant::now();
        let sink = RecordingSink::default();
        let mut domain = real_domain(now);
        let q = QueueId(1);
        domain.schedule_delayed_work(q, now + ms(5), now, &sink);
        domain.schedule_delayed_work(q, now + ms(9), now, &sink);

        domain.cancel_delayed_wakeup(q, now + ms(5));
        assert_eq!(domain.next_scheduled_run_time(), Some(now + ms(9)));
        assert_eq!(domain.scheduled_run_times().collect::<Vec<_>>(), vec![now + ms(9)]);
    }

    #[test]
    fn due_time_caps_huge_delays() {
        let now = Instant::now();
        assert_eq!(due_time(now, ms(3)), now + ms(3));
        assert_eq!(due_time(now, Duration::MAX), now + MAX_DELAY);
    }

    #[test]
    fn migrate_rebases_onto_destination_clock() {
        let start = Instant::now();
        let sink = RecordingSink::default();
        let mut a = virtual_domain(1, start);
        let mut b = virtual_domain(2, start);
        let (q, other) = (QueueId(1), QueueId(2));

        a.schedule_delayed_work(q, start + ms(30), start, &sink);
        a.schedule_delayed_work(q, start + ms(40), start, &sink);
        a.schedule_delayed_work(other, start + ms(35), start, &sink);
        a.advance_to(start + ms(20)).unwrap();

        let rebase = a.migrate_queue(q, &mut b, &sink);
        assert_eq!(rebase.apply(start + ms(30)), start + ms(10));
        assert_eq!(b.next_scheduled_run_time(), Some(start + ms(10)));
        assert_eq!(a.next_scheduled_task_queue(), Some(other));

        b.advance_to(start + ms(15)).unwrap();
        let mut lazy_now = b.create_lazy_now();
        assert_eq!(b.wake_up_ready_delayed_queues(&mut lazy_now), vec![q]);
        assert_eq!(b.next_scheduled_run_time(), Some(start + ms(20)));
    }

    #[test]
    fn rebase_keeps_overdue_order() {
        let base = Instant::now() + ms(1_000);
        let rebase = DueTimeRebase { from_now: base, to_now: base + ms(500) };
        assert!(rebase.apply(base - ms(20)) < rebase.apply(base - ms(10)));
        assert_eq!(rebase.apply(base), base + ms(500));
    }

    #[test]
    fn real_domain_cannot_advance() {
        let domain = real_domain(Instant::now());
        assert!(matches!(
            domain.advance_to(Instant::now()),
            Err(SchedulerError::NotVirtual(_))
        ));
    }

    #[test]
    fn virtual_time_is_monotonic() {
        let start = Instant::now();
        let domain = virtual_domain(3, start);
        domain.advance_to(start + ms(5)).unwrap();
        assert!(matches!(
            domain.advance_to(start),
            Err(SchedulerError::TimeWentBackwards(_))
        ));
        assert_eq!(domain.now(), start + ms(5));
    }

    #[test]
    fn lazy_now_caches_first_read() {
        let start = Instant::now();
        let clock = Arc::new(VirtualClock::new(start));
        let mut lazy_now = LazyNow::new(TimeSource::Virtual(Arc::clone(&clock)));
        assert_eq!(lazy_now.now(), start);
        clock.advance_to(start + ms(3));
        assert_eq!(lazy_now.now(), start);
    }
}
