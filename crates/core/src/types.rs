use serde::{Deserialize, Serialize};

/// Queue priority tier. Lower numeric value = higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Scheduler-internal work. Always selected first and never yields.
    Control = 0,
    /// Latency-sensitive work such as input handling.
    High = 1,
    /// Default tier for ordinary work.
    #[default]
    Normal = 2,
    /// Runs when nothing else is ready, or when starvation protection kicks in.
    BestEffort = 3,
}

impl Priority {
    /// Number of priority tiers.
    pub const COUNT: usize = 4;

    /// All tiers, highest first.
    pub const ALL: [Priority; Priority::COUNT] = [
        Priority::Control,
        Priority::High,
        Priority::Normal,
        Priority::BestEffort,
    ];

    /// Index of this tier into per-tier tables.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Control => write!(f, "control"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::BestEffort => write!(f, "best_effort"),
        }
    }
}

/// When tasks move from a queue's incoming buffer into its work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpPolicy {
    /// Incoming tasks flow into the work queue on the next pass.
    #[default]
    Auto,
    /// Incoming tasks flow only after a task from a waking queue has run.
    AfterWakeup,
    /// Incoming tasks flow only on an explicit pump.
    Manual,
}

impl std::fmt::Display for PumpPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpPolicy::Auto => write!(f, "auto"),
            PumpPolicy::AfterWakeup => write!(f, "after_wakeup"),
            PumpPolicy::Manual => write!(f, "manual"),
        }
    }
}

/// Whether running a task on a queue may pump other queues' after-wakeup work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeupPolicy {
    #[default]
    CanWakeOtherQueues,
    DontWakeOtherQueues,
}

impl WakeupPolicy {
    pub fn can_wake_other_queues(self) -> bool {
        matches!(self, WakeupPolicy::CanWakeOtherQueues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Control < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::BestEffort);
    }

    #[test]
    fn priority_index_round_trips() {
        for p in Priority::ALL {
            assert_eq!(Priority::from_index(p.index()), Some(p));
        }
        assert_eq!(Priority::from_index(Priority::COUNT), None);
    }

    #[test]
    fn policies_parse_snake_case() {
        #[derive(Deserialize)]
        struct Doc {
            priority: Priority,
            pump: PumpPolicy,
            wakeup: WakeupPolicy,
        }
        let doc: Doc = toml::from_str(
            "priority = \"best_effort\"\npump = \"after_wakeup\"\nwakeup = \"dont_wake_other_queues\"",
        )
        .unwrap();
        assert_eq!(doc.priority, Priority::BestEffort);
        assert_eq!(doc.pump, PumpPolicy::AfterWakeup);
        assert_eq!(doc.wakeup, WakeupPolicy::DontWakeOtherQueues);
    }

    #[test]
    fn defaults() {
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(PumpPolicy::default(), PumpPolicy::Auto);
        assert!(WakeupPolicy::default().can_wake_other_queues());
    }
}
