//! Deterministic host for tests and scenario replay.
//!
//! [`SimulatedHost`] implements [`SchedulerHost`] over a manually advanced
//! clock. Host callbacks requested by the manager are recorded with their due
//! time and delivered only when the driver calls one of the `run_*` methods,
//! so every interleaving is reproducible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::host::SchedulerHost;
use crate::manager::TaskQueueManager;
use crate::types::WakeupKind;

/// Upper bound on callbacks delivered by one `fast_forward` call.
const MAX_FAST_FORWARD_CALLBACKS: usize = 100_000;

/// A monotonic clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    /// Move to `to`. Earlier instants are ignored.
    pub fn advance_to(&self, to: Instant) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if to > *now {
            *now = to;
        }
    }
}

/// Host whose clock and callback delivery are driven by the caller.
#[derive(Debug)]
pub struct SimulatedHost {
    clock: ManualClock,
    /// Requested callbacks keyed by (due time, request order).
    callbacks: Mutex<BTreeMap<(Instant, u64), WakeupKind>>,
    next_request: AtomicU64,
    nested: AtomicBool,
}

impl SimulatedHost {
    pub fn new() -> Arc<Self> {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Arc<Self> {
        Arc::new(Self {
            clock: ManualClock::new(start),
            callbacks: Mutex::new(BTreeMap::new()),
            next_request: AtomicU64::new(0),
            nested: AtomicBool::new(false),
        })
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Move the clock without delivering anything.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Report subsequent passes as running inside a nested loop.
    pub fn set_nested(&self, nested: bool) {
        self.nested.store(nested, Ordering::Relaxed);
    }

    pub fn num_pending_callbacks(&self) -> usize {
        self.callbacks().len()
    }

    pub fn next_callback_time(&self) -> Option<Instant> {
        self.callbacks().keys().next().map(|(at, _)| *at)
    }

    pub fn delay_to_next_callback(&self) -> Option<Duration> {
        let now = self.now();
        self.next_callback_time().map(|at| at.saturating_duration_since(now))
    }

    /// Kinds of every pending callback in delivery order.
    pub fn pending_callbacks(&self) -> Vec<(Instant, WakeupKind)> {
        self.callbacks().iter().map(|((at, _), kind)| (*at, *kind)).collect()
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, BTreeMap<(Instant, u64), WakeupKind>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_callback(&self, key: (Instant, u64)) -> Option<WakeupKind> {
        self.callbacks().remove(&key)
    }

    /// Deliver the callbacks that are due right now. Callbacks requested
    /// while these run wait for the next call. Returns how many ran.
    pub fn run_pending_callbacks(&self, manager: &TaskQueueManager) -> usize {
        let now = self.now();
        let due: Vec<(Instant, u64)> = self
            .callbacks()
            .keys()
            .take_while(|(at, _)| *at <= now)
            .copied()
            .collect();
        let mut ran = 0;
        for key in due {
            // The lock is released before calling into the manager.
            let Some(kind) = self.take_callback(key) else {
                continue;
            };
            trace!(?kind, "Delivering simulated host callback");
            manager.do_work(kind);
            ran += 1;
        }
        ran
    }

    /// Deliver due callbacks until none are due, without moving the clock.
    pub fn run_until_idle(&self, manager: &TaskQueueManager) -> usize {
        let mut ran = 0;
        loop {
            let batch = self.run_pending_callbacks(manager);
            if batch == 0 {
                return ran;
            }
            ran += batch;
        }
    }

    /// Advance the clock by `period`, stopping at every callback due within
    /// it. The clock ends exactly `period` later.
    pub fn run_for_period(&self, manager: &TaskQueueManager, period: Duration) -> usize {
        let end = self.now() + period;
        let mut ran = self.run_until_idle(manager);
        while let Some(next) = self.next_callback_time() {
            if next > end {
                break;
            }
            self.clock.advance_to(next);
            ran += self.run_until_idle(manager);
        }
        self.clock.advance_to(end);
        ran + self.run_until_idle(manager)
    }

    /// Jump from callback to callback until none remain.
    pub fn fast_forward(&self, manager: &TaskQueueManager) -> usize {
        let mut ran = self.run_until_idle(manager);
        while let Some(next) = self.next_callback_time() {
            if ran >= MAX_FAST_FORWARD_CALLBACKS {
                warn!("Simulated host stopped fast-forwarding after {} callbacks", ran);
                break;
            }
            self.clock.advance_to(next);
            ran += self.run_until_idle(manager);
        }
        ran
    }
}

impl SchedulerHost for SimulatedHost {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn post_do_work(&self, delay: Duration, wakeup: WakeupKind) {
        let at = self.clock.now() + delay;
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.callbacks().insert((at, request), wakeup);
    }

    fn cancel_do_work(&self, at: Instant) {
        let mut callbacks = self.callbacks();
        let key = callbacks
            .range((at, 0)..=(at, u64::MAX))
            .find(|(_, kind)| **kind == WakeupKind::Delayed)
            .map(|(key, _)| *key);
        if let Some(key) = key {
            callbacks.remove(&key);
            trace!("Withdrew simulated host callback");
        }
    }

    fn is_nested(&self) -> bool {
        self.nested.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_wait_for_their_due_time() {
        let host = SimulatedHost::new();
        host.post_do_work(Duration::from_millis(10), WakeupKind::Delayed);
        host.post_do_work(Duration::ZERO, WakeupKind::Immediate);

        assert_eq!(host.num_pending_callbacks(), 2);
        assert_eq!(host.delay_to_next_callback(), Some(Duration::ZERO));
        let kinds: Vec<WakeupKind> = host.pending_callbacks().into_iter().map(|(_, k)| k).collect();
        assert_eq!(kinds, vec![WakeupKind::Immediate, WakeupKind::Delayed]);
    }

    #[test]
    fn withdrawn_callback_is_not_delivered() {
        let host = SimulatedHost::new();
        let at = host.now() + Duration::from_millis(10);
        host.post_do_work(Duration::from_millis(10), WakeupKind::Delayed);
        host.post_do_work(Duration::from_millis(20), WakeupKind::Delayed);

        host.cancel_do_work(at);
        host.cancel_do_work(at);
        assert_eq!(host.pending_callbacks(), vec![(at + Duration::from_millis(10), WakeupKind::Delayed)]);
    }

    #[test]
    fn manual_clock_never_goes_back() {
        let start = Instant::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_millis(5));
        clock.advance_to(start);
        assert_eq!(clock.now(), start + Duration::from_millis(5));
    }

    #[test]
    fn run_for_period_ends_at_period() {
        let host = SimulatedHost::new();
        let manager = TaskQueueManager::with_defaults(host.clone());
        let start = host.now();
        host.post_do_work(Duration::from_millis(3), WakeupKind::Delayed);
        host.post_do_work(Duration::from_millis(30), WakeupKind::Delayed);

        assert_eq!(host.run_for_period(&manager, Duration::from_millis(10)), 1);
        assert_eq!(host.now(), start + Duration::from_millis(10));
        assert_eq!(host.num_pending_callbacks(), 1);
    }
}
