use std::time::{Duration, Instant};

use crate::types::WakeupKind;

/// The event loop a [`TaskQueueManager`](crate::TaskQueueManager) runs on.
///
/// The host owns the monotonic clock and the "call me back later" primitive.
/// When a requested callback fires, the host calls
/// [`TaskQueueManager::do_work`](crate::TaskQueueManager::do_work) on the
/// manager's thread with the same [`WakeupKind`].
///
/// `post_do_work` may be called while scheduler locks are held and from any
/// thread. Implementations must only record the request and never call back
/// into the manager synchronously.
pub trait SchedulerHost: Send + Sync {
    /// Monotonic clock used by the real time domain.
    fn now(&self) -> Instant;

    /// Ask for a `do_work` callback after `delay`.
    fn post_do_work(&self, delay: Duration, wakeup: WakeupKind);

    /// Withdraw a delayed callback that was requested to fire at `at` and is
    /// no longer needed. Hosts that cannot withdraw timers may ignore this;
    /// the manager tolerates the extra pass.
    fn cancel_do_work(&self, _at: Instant) {}

    /// Whether the loop is currently running nested inside a task.
    fn is_nested(&self) -> bool {
        false
    }
}
