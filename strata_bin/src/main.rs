//! Admin entry point: `strata [status|checkpoint|recover]`.
//!
//! The database is configured from `STRATA_CONFIG` (a JSON file) or
//! `STRATA_DATA_DIR`; log filtering comes from `STRATA_LOG`.

use std::process::ExitCode;

use serde_json::json;
use strata_bin::{BrokerPool, DatabaseConfig, PoolError, PoolResult};
use tracing::error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV: &str = "STRATA_LOG";

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "status".to_string());
    match run(&command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(command, error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn run(command: &str) -> PoolResult<()> {
    let config = DatabaseConfig::from_env()?;
    match command {
        "status" => {
            let pool = BrokerPool::open(config)?;
            let status = pool.status()?;
            let report = json!({
                "data_dir": pool.config().data_dir,
                "read_only": status.read_only,
                "indexes": status.indexes,
                "brokers": { "active": status.active_brokers, "max": status.max_brokers },
                "cache": {
                    "capacity": status.cache.capacity,
                    "resident": status.cache.resident,
                    "dirty": status.cache.dirty,
                    "hits": status.cache.hits,
                    "misses": status.cache.misses,
                    "evictions": status.cache.evictions,
                },
                "journal": {
                    "files": status.journal_files,
                    "last_checkpoint": status.last_checkpoint.to_string(),
                },
                "active_transactions": status.active_transactions.len(),
                "lock_waiters": status.locks.waiting.len(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            pool.shutdown()
        }
        "checkpoint" => {
            let pool = BrokerPool::open(config)?;
            let lsn = pool.checkpoint()?;
            println!("checkpoint written at {lsn}");
            pool.shutdown()
        }
        "recover" => {
            let pool = BrokerPool::open(config)?;
            let report = pool.recovery_report();
            let summary = json!({
                "scanned": report.scanned,
                "redone": report.redone,
                "undone": report.undone,
                "losers": report.losers,
                "truncated_at": report.truncated_at.map(|lsn| lsn.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            pool.shutdown()
        }
        other => Err(PoolError::Config(format!(
            "unknown command {other:?}; expected status, checkpoint or recover"
        ))),
    }
}
