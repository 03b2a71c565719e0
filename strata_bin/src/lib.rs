//! Broker pool and system tasks of the strata XML database: the composition
//! root that wires the storage core together, plus the admin binary.

pub mod broker;
pub mod config;
pub mod error;
pub mod pool;
pub mod system_task;

pub use broker::{Broker, BrokerId};
pub use config::{
    CacheConfig, DatabaseConfig, JournalConfig, LockConfig, SyncConfig, CONFIG_ENV, CORE_FILES,
    DATA_DIR_ENV,
};
pub use error::{PoolError, PoolResult};
pub use pool::{BrokerPool, PoolStatus};
pub use system_task::{SyncTask, SystemTask};
