//! Single-thread, multi-queue cooperative task scheduler.
//!
//! Many independently prioritized [`TaskQueue`]s are multiplexed onto one
//! run-loop thread by a [`TaskQueueManager`]. Producers on any thread post
//! into a queue's incoming buffer; the host loop calls
//! [`TaskQueueManager::do_work`], which promotes due delayed tasks, pumps
//! incoming buffers according to each queue's [`PumpPolicy`], and runs the
//! oldest ready task of the highest non-empty priority tier.
//!
//! Delayed tasks are timed by [`TimeDomain`]s (real clock or virtual clock).
//! The [`IdleHelper`] drives a dedicated idle queue that is only surfaced
//! inside deadline-bounded idle periods.

pub mod error;
pub mod host;
pub mod idle;
pub mod manager;
pub mod metrics;
pub mod observer;
pub mod sim;
pub mod task;
pub mod task_queue;
pub mod time_domain;
pub mod types;

mod selector;
mod work_queue;
mod work_queue_sets;

pub use error::SchedulerError;
pub use host::SchedulerHost;
pub use idle::{
    IdleHelper, IdleHelperDelegate, IdlePeriodState, IdleTaskRunner, IdleTaskRunnerDelegate,
    LongIdlePermission, PermissiveIdleDelegate,
};
pub use lanesched_core::{IdleConfig, Priority, PumpPolicy, SchedulerConfig, WakeupPolicy};
pub use manager::TaskQueueManager;
pub use metrics::SchedulerMetrics;
pub use observer::{TaskObserver, TaskQueueManagerObserver};
pub use task::{TaskInfo, TaskOutcome};
pub use task_queue::{DelayedTaskHandle, TaskQueue, TaskQueueSpec};
pub use time_domain::{LazyNow, TimeDomainKind};
pub use types::{EnqueueOrder, ManagerState, QueueId, TimeDomainId, WakeupKind};
