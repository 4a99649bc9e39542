//! Process lifecycle for the home server hub: configuration, liveness
//! probing, the per-app state machine, idle shutdown and status listing.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod logs;
pub mod manager;
pub mod pid_store;
pub mod probe;
pub mod scheduler;

mod support;
#[cfg(test)]
pub(crate) mod test_support;

pub use aggregator::StatusAggregator;
pub use config::{ConfigError, HubConfig, HubSettings, ManagedApp};
pub use error::LifecycleError;
pub use manager::{ActivitySnapshot, LifecycleManager};
pub use probe::{OsProbe, ProcessProbe};
pub use scheduler::{IdleScheduler, IdleSchedulerHandle};
