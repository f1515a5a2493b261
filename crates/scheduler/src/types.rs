use std::fmt;

use serde::Serialize;

/// Stable handle of a registered task queue. Never reused within a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct QueueId(pub(crate) u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Stable handle of a registered time domain. Never reused within a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimeDomainId(pub(crate) u64);

impl fmt::Display for TimeDomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "td{}", self.0)
    }
}

/// Global readiness sequence. Assigned when a task enters a work queue and
/// strictly increasing across every queue of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EnqueueOrder(pub(crate) u64);

impl EnqueueOrder {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Which of a queue's two work queues a task is ready in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum WorkQueueKind {
    Immediate,
    Delayed,
}

/// Identity of one work queue inside the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct WorkQueueId {
    pub queue: QueueId,
    pub kind: WorkQueueKind,
}

impl WorkQueueId {
    pub fn immediate(queue: QueueId) -> Self {
        Self { queue, kind: WorkQueueKind::Immediate }
    }

    pub fn delayed(queue: QueueId) -> Self {
        Self { queue, kind: WorkQueueKind::Delayed }
    }
}

/// Why the host is calling back into the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WakeupKind {
    /// A continuation requested because work is ready now.
    Immediate,
    /// A timer requested for the earliest pending delayed task.
    Delayed,
}

/// Coarse lifecycle of the manager's scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManagerState {
    /// Nothing ready and no callback outstanding.
    Idle,
    /// A host callback (immediate or delayed) is outstanding.
    Scheduled,
    /// A task body is executing.
    Running,
}
