//! Task queue manager -- multiplexes task queues onto one run-loop thread.
//!
//! Split into focused submodules:
//! - `core`: shared state, the public handle, registries and accessors
//! - `work`: the `do_work` pass, work queue updates and continuation scheduling
//! - `queue_ops`: main-thread queue mutations (priority, pump, enable, migrate)

mod core;
mod queue_ops;
mod work;

pub(crate) use self::core::{ManagerInner, ManagerMain};
pub use self::core::TaskQueueManager;
