//! Database configuration.
//!
//! Loaded from a JSON file named by `STRATA_CONFIG`, or built from
//! `STRATA_DATA_DIR` with defaults for everything else.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata::{JournalOptions, LockManagerOptions, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

use crate::error::{PoolError, PoolResult};

pub const CONFIG_ENV: &str = "STRATA_CONFIG";
pub const DATA_DIR_ENV: &str = "STRATA_DATA_DIR";

/// Index files every database starts with.
pub const CORE_FILES: [&str; 4] = ["collections.dbx", "dom.dbx", "structure.dbx", "values.dbx"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/journal`.
    pub journal_dir: Option<PathBuf>,
    /// Page size of newly created files.
    pub page_size: usize,
    pub core_files: Vec<String>,
    pub max_brokers: usize,
    /// How long `get_broker` waits for a free slot.
    pub broker_timeout_ms: u64,
    pub cache: CacheConfig,
    pub journal: JournalConfig,
    pub lock: LockConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Frames shared by every file.
    pub capacity_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub max_file_size: u64,
    pub sync_on_commit: bool,
    pub group_commit_delay_ms: u64,
    pub buffer_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// `None` waits forever.
    pub timeout_ms: Option<u64>,
    pub fail_on_deadlock: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minor sync: write back dirty pages.
    pub sync_period_ms: u64,
    /// Major sync: minor sync, checkpoint and disk-space check.
    pub major_sync_period_ms: u64,
    /// Free bytes below which the database turns read-only.
    pub min_free_space: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new("./data")
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_pages: 4096,
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        let defaults = JournalOptions::default();
        Self {
            max_file_size: defaults.max_file_size,
            sync_on_commit: defaults.sync_on_commit,
            group_commit_delay_ms: defaults.group_commit_delay.as_millis() as u64,
            buffer_size: defaults.buffer_size,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            fail_on_deadlock: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_period_ms: 120_000,
            major_sync_period_ms: 3_600_000,
            min_free_space: 64 * 1024 * 1024,
        }
    }
}

impl DatabaseConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            journal_dir: None,
            page_size: DEFAULT_PAGE_SIZE,
            core_files: CORE_FILES.iter().map(|s| s.to_string()).collect(),
            max_brokers: 20,
            broker_timeout_ms: 30_000,
            cache: CacheConfig::default(),
            journal: JournalConfig::default(),
            lock: LockConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    /// `STRATA_CONFIG` (a JSON file) wins over `STRATA_DATA_DIR`.
    pub fn from_env() -> PoolResult<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_json_file(path);
        }
        let config = match std::env::var(DATA_DIR_ENV) {
            Ok(dir) => Self::new(dir),
            Err(_) => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> PoolResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PoolError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> PoolResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> PoolResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> PoolResult<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(PoolError::Config(format!(
                "page_size {} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.max_brokers == 0 {
            return Err(PoolError::Config("max_brokers must be at least 1".into()));
        }
        if self.sync.sync_period_ms == 0 || self.sync.major_sync_period_ms == 0 {
            return Err(PoolError::Config("sync periods must be positive".into()));
        }
        Ok(())
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.journal_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("journal"))
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_millis(self.sync.sync_period_ms)
    }

    pub fn major_sync_period(&self) -> Duration {
        Duration::from_millis(self.sync.major_sync_period_ms)
    }

    pub fn journal_options(&self) -> JournalOptions {
        JournalOptions {
            max_file_size: self.journal.max_file_size,
            sync_on_commit: self.journal.sync_on_commit,
            group_commit_delay: Duration::from_millis(self.journal.group_commit_delay_ms),
            buffer_size: self.journal.buffer_size,
        }
    }

    pub fn lock_options(&self) -> LockManagerOptions {
        LockManagerOptions {
            default_timeout: self.lock.timeout_ms.map(Duration::from_millis),
            fail_on_deadlock: self.lock.fail_on_deadlock,
        }
    }

    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_core_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.core_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_brokers(mut self, max: usize) -> Self {
        self.max_brokers = max;
        self
    }

    pub fn with_broker_timeout(mut self, timeout: Duration) -> Self {
        self.broker_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_cache_capacity(mut self, pages: usize) -> Self {
        self.cache.capacity_pages = pages;
        self
    }

    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.journal.sync_on_commit = sync;
        self
    }

    pub fn with_max_journal_file_size(mut self, bytes: u64) -> Self {
        self.journal.max_file_size = bytes;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock.timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_fail_on_deadlock(mut self, fail: bool) -> Self {
        self.lock.fail_on_deadlock = fail;
        self
    }

    pub fn with_sync_periods(mut self, minor: Duration, major: Duration) -> Self {
        self.sync.sync_period_ms = minor.as_millis() as u64;
        self.sync.major_sync_period_ms = major.as_millis() as u64;
        self
    }

    pub fn with_min_free_space(mut self, bytes: u64) -> Self {
        self.sync.min_free_space = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = DatabaseConfig::from_json(
            r#"{ "data_dir": "/var/lib/strata", "cache": { "capacity_pages": 128 }, "lock": { "timeout_ms": 500 } }"#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/strata"));
        assert_eq!(config.cache.capacity_pages, 128);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.core_files.len(), 4);
        assert_eq!(config.journal_dir(), PathBuf::from("/var/lib/strata/journal"));
        assert_eq!(config.lock_options().default_timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = DatabaseConfig::new("db")
            .with_page_size(8192)
            .with_max_brokers(4)
            .with_fail_on_deadlock(true);
        let text = config.to_json().unwrap();
        assert_eq!(DatabaseConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            DatabaseConfig::new("db").with_page_size(3000).validate(),
            Err(PoolError::Config(_))
        ));
        assert!(DatabaseConfig::new("db").with_max_brokers(0).validate().is_err());
        assert!(matches!(
            DatabaseConfig::from_json("{ not json"),
            Err(PoolError::Json(_))
        ));
    }
}
