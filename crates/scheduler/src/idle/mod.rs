//! Idle-time execution.
//!
//! The [`IdleHelper`] owns a best-effort idle queue that stays disabled
//! outside idle periods. Short idle periods are started by the host with an
//! explicit deadline; long idle periods are self-scheduled whenever nothing
//! else is pending, bounded by the next delayed task and a maximum length.
//! Idle tasks are posted through an [`IdleTaskRunner`] and receive the
//! current period's deadline.

mod helper;
mod runner;
mod state;

use std::time::{Duration, Instant};

pub use self::helper::IdleHelper;
pub use self::runner::{IdleTask, IdleTaskRunner};
pub use self::state::IdlePeriodState;

/// Answer of [`IdleHelperDelegate::can_enter_long_idle_period`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongIdlePermission {
    Allowed,
    /// Not now; try again after the given delay.
    Deferred(Duration),
}

/// Host policy hooks for the idle helper. All methods run on the manager thread.
pub trait IdleHelperDelegate: Send + Sync {
    fn can_enter_long_idle_period(&self, _now: Instant) -> LongIdlePermission {
        LongIdlePermission::Allowed
    }

    /// A long idle period was postponed because monitored queues ran tasks
    /// during the quiescence window.
    fn is_not_quiescent(&self) {}

    fn on_idle_period_started(&self) {}

    fn on_idle_period_ended(&self) {}
}

/// Delegate that allows every long idle period.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveIdleDelegate;

impl IdleHelperDelegate for PermissiveIdleDelegate {}

/// Callbacks the idle task runner makes around idle tasks.
pub trait IdleTaskRunnerDelegate: Send + Sync {
    /// May be called from any thread.
    fn on_idle_task_posted(&self);

    /// Returns the deadline handed to the idle task about to run.
    fn will_process_idle_task(&self) -> Instant;

    fn did_process_idle_task(&self);
}
