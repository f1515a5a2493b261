use thiserror::Error;

use lanesched_core::ConfigError;

use crate::types::{QueueId, TimeDomainId};

/// Errors returned by the fallible parts of the scheduler API.
///
/// Thread-affinity violations are not reported here: they assert in debug
/// builds and degrade to a logged no-op in release builds.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown time domain: {0}")]
    UnknownTimeDomain(TimeDomainId),

    #[error("time domain {0} still has queues bound to it")]
    TimeDomainInUse(TimeDomainId),

    #[error("the real time domain cannot be unregistered")]
    RealTimeDomainRequired,

    #[error("time domain {0} is not virtual")]
    NotVirtual(TimeDomainId),

    #[error("virtual time cannot move backwards (domain {0})")]
    TimeWentBackwards(TimeDomainId),

    #[error("queue {0} is not registered")]
    QueueUnregistered(QueueId),

    #[error("operation must run on the scheduler's main thread")]
    WrongThread,

    #[error("task queue manager has shut down")]
    ShutDown,
}
