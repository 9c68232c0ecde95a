//! Logging setup: tracing with rolling daily files and retention.

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::{LogFormat, LoggingConfig};

/// File name prefix for the rolling daily logs.
const LOG_FILE_PREFIX: &str = "munin.log";

/// Keeps the non-blocking file writer alive; dropping it flushes logs.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Initialise tracing per the logging configuration.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(config: &LoggingConfig) -> anyhow::Result<LogGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.level.clone()));

    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("creating log directory {}", config.directory))?;
    let appender = tracing_appender::rolling::daily(&config.directory, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true)
            .json()
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true)
            .boxed(),
    };

    let stdout_layer = if config.stdout {
        let layer = match config.format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .with_target(true)
                .json()
                .boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer().with_target(true).boxed(),
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LogGuard { _file: Some(guard) })
}

/// Delete daily log files beyond the retention count. Returns how many
/// files were removed.
pub fn prune_old_logs(directory: &str, retention_days: usize) -> std::io::Result<usize> {
    let mut files: Vec<_> = std::fs::read_dir(directory)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
        })
        .collect();

    if files.len() <= retention_days {
        return Ok(0);
    }

    // Daily file names sort chronologically (munin.log.YYYY-MM-DD).
    files.sort();
    let excess = files.len() - retention_days;
    let mut removed = 0;
    for path in files.into_iter().take(excess) {
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Background task pruning old log files once a day.
pub fn spawn_log_pruner(
    directory: String,
    retention_days: usize,
    shutdown: tokio::sync::broadcast::Sender<()>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(86_400));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match prune_old_logs(&directory, retention_days) {
                        Ok(removed) if removed > 0 => {
                            tracing::info!(removed, "Old log files pruned");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "Log pruning failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=5 {
            std::fs::write(
                dir.path().join(format!("munin.log.2026-07-{:02}", day)),
                "x",
            )
            .unwrap();
        }
        // An unrelated file is never touched.
        std::fs::write(dir.path().join("users.json"), "{}").unwrap();

        let removed = prune_old_logs(dir.path().to_str().unwrap(), 3).unwrap();
        assert_eq!(removed, 2);

        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                "munin.log.2026-07-03",
                "munin.log.2026-07-04",
                "munin.log.2026-07-05",
                "users.json"
            ]
        );
    }

    #[test]
    fn prune_is_noop_within_retention() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("munin.log.2026-07-01"), "x").unwrap();
        assert_eq!(prune_old_logs(dir.path().to_str().unwrap(), 7).unwrap(), 0);
    }
}
