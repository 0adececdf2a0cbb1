use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_PREFIX: &str = "workbench.engine";

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Initialize process logging: compact console output plus a daily-rolling JSONL
/// file under `logs_dir`. Returns a guard that must outlive the process.
pub fn init_logging(logs_dir: &Path, retention_days: u64) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        logs_dir: logs_dir.display().to_string(),
        prefix: LOG_PREFIX.to_string(),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

/// Remove rolled log files older than the retention window.
/// Expected file names: `workbench.engine.YYYY-MM-DD.jsonl`.
pub fn cleanup_old_jsonl(logs_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{LOG_PREFIX}.");

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_removes_only_expired_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("workbench.engine.2000-01-01.jsonl");
        let fresh = dir
            .path()
            .join(format!("workbench.engine.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let unrelated = dir.path().join("other.2000-01-01.jsonl");
        for p in [&old, &fresh, &unrelated] {
            fs::write(p, "{}").unwrap();
        }

        cleanup_old_jsonl(dir.path(), 7).unwrap();

        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn canonical_logs_dir_joins_logs() {
        assert_eq!(
            canonical_logs_dir(Path::new("/tmp/wb")),
            PathBuf::from("/tmp/wb").join("logs")
        );
    }
}
