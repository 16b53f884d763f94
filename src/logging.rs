//! Structured logging (component L): a `tracing` subscriber writing to
//! stderr, plus a per-run progress log file under the state directory
//! that the core holds an exclusive advisory lock on for the lifetime
//! of the run (used by `logs`/`status` to detect an active session).

use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::session::LogLockRegistry;

/// Held for the lifetime of the run. Dropping it flushes the
/// non-blocking file writer and releases the advisory lock on the
/// progress log.
pub struct LoggingGuard {
    _appender_guard: WorkerGuard,
    locked_file: Option<std::fs::File>,
    log_path: PathBuf,
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.locked_file {
            let _ = FileExt::unlock(file);
        }
        LogLockRegistry::global().unregister(&self.log_path);
    }
}

/// `<state-dir>/logs/YYYYMMDD-HHMMSS-<sanitized-id>.log`.
pub fn log_file_path(state_dir: &Path, source_id: &str) -> PathBuf {
    let sanitized: String = source_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    state_dir
        .join("logs")
        .join(format!("{stamp}-{sanitized}.log"))
}

/// Initialize the global tracing subscriber and, if `log_path` is
/// given, open and exclusively lock that file as the run's progress
/// log, registering it with the process-scoped lock registry.
///
/// Returns a guard that must be kept alive for the duration of the run.
pub fn init(log_path: Option<&Path>, verbose: bool) -> std::io::Result<LoggingGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (writer, appender_guard, locked_file, log_path) = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            file.try_lock_exclusive().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    format!("progress log {path:?} already locked: {e}"),
                )
            })?;
            LogLockRegistry::global().register(path.to_path_buf());
            let (non_blocking, guard) = tracing_appender::non_blocking(file.try_clone()?);
            (non_blocking, guard, Some(file), path.to_path_buf())
        }
        None => {
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
            (non_blocking, guard, None, PathBuf::new())
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_path.as_os_str().is_empty())
        .finish();
    // Only the first call in a process wins; subsequent calls (e.g. in
    // tests that construct multiple loops) are no-ops.
    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(LoggingGuard {
        _appender_guard: appender_guard,
        locked_file,
        log_path,
    })
}

/// True if `path` is currently locked by this process's progress log.
pub fn is_active_log(path: &Path) -> bool {
    LogLockRegistry::global().is_locked_by_us(path)
        || std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|f| f.try_lock_exclusive().map(|_| f).map_err(Into::into))
            .map(|f| {
                let _ = FileExt::unlock(&f);
                false
            })
            .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_file_path_sanitizes_source_id() {
        let dir = tempdir().unwrap();
        let path = log_file_path(dir.path(), "TKT/../42");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(!name.contains('/'));
        assert!(name.ends_with("TKT___42.log"));
    }

    #[test]
    fn active_log_is_reported_as_locked_by_a_second_opener() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        let file = std::fs::File::create(&path).unwrap();
        file.try_lock_exclusive().unwrap();
        assert!(is_active_log(&path));
        FileExt::unlock(&file).unwrap();
    }

    #[test]
    fn unlocked_log_is_not_reported_as_active() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.log");
        std::fs::File::create(&path).unwrap();
        assert!(!is_active_log(&path));
    }
}
