use std::time::Duration;

use thiserror::Error;

pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Storage(#[from] strata::Error),

    #[error("all {max} brokers are in use (waited {waited:?})")]
    PoolExhausted { max: usize, waited: Duration },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no index named {0:?}")]
    UnknownIndex(String),
}

impl PoolError {
    /// True when the fault threatens durability and the pool has gone read-only.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PoolError::Storage(e) if e.is_fatal())
    }
}
