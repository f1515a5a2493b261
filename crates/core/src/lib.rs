pub mod config;
pub mod error;
pub mod types;

pub use config::{load_dotenv, IdleConfig, SchedulerConfig};
pub use error::ConfigError;
pub use types::*;
