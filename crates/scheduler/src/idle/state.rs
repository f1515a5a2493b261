use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::task_queue::DelayedTaskHandle;

/// Where the idle helper is in its idle period lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePeriodState {
    #[default]
    NotInIdlePeriod,
    /// Bounded by an externally supplied deadline, e.g. the end of a frame.
    InShortIdlePeriod,
    InLongIdlePeriod,
    /// A long idle period that hit the maximum length, so idle tasks may
    /// overrun its deadline.
    InLongIdlePeriodWithMaxDeadline,
    /// Long idle period ticks stopped because no idle work is pending.
    InLongIdlePeriodPaused,
}

impl IdlePeriodState {
    pub fn is_in_idle_period(self) -> bool {
        self != IdlePeriodState::NotInIdlePeriod
    }

    pub fn is_in_long_idle_period(self) -> bool {
        matches!(
            self,
            IdlePeriodState::InLongIdlePeriod
                | IdlePeriodState::InLongIdlePeriodWithMaxDeadline
                | IdlePeriodState::InLongIdlePeriodPaused
        )
    }
}

impl fmt::Display for IdlePeriodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdlePeriodState::NotInIdlePeriod => "not_in_idle_period",
            IdlePeriodState::InShortIdlePeriod => "in_short_idle_period",
            IdlePeriodState::InLongIdlePeriod => "in_long_idle_period",
            IdlePeriodState::InLongIdlePeriodWithMaxDeadline => "in_long_idle_period_with_max_deadline",
            IdlePeriodState::InLongIdlePeriodPaused => "in_long_idle_period_paused",
        };
        f.write_str(name)
    }
}

/// Mutable idle helper state.
#[derive(Debug, Default)]
pub(crate) struct IdleState {
    pub period: IdlePeriodState,
    pub deadline: Option<Instant>,
    /// Bumped whenever pending "enable long idle period" callbacks must be
    /// invalidated.
    pub generation: u64,
    /// The queued "enable long idle period" retry, if any.
    pub pending_enable: Option<DelayedTaskHandle>,
    pub is_shutdown: bool,
}

impl IdleState {
    /// Returns the previous state.
    pub fn update(&mut self, period: IdlePeriodState, deadline: Option<Instant>) -> IdlePeriodState {
        let previous = std::mem::replace(&mut self.period, period);
        self.deadline = deadline;
        previous
    }

    /// Invalidate pending enables. The returned retry must be cancelled
    /// once the state lock is released.
    pub fn cancel_pending_enables(&mut self) -> Option<DelayedTaskHandle> {
        self.generation += 1;
        self.pending_enable.take()
    }
}
