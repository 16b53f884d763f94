//! Session file (`<state-dir>/session.json`) and the process-scoped
//! registry of progress-log paths this process currently holds an
//! advisory lock on.
//!
//! The session file backs the `status` CLI command: it is written when
//! a run starts and inspected (and cleaned up if stale or corrupt) when
//! `status` is invoked, possibly from a different invocation of the
//! binary.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub ticket_id: String,
    pub working_dir: PathBuf,
    pub started_at: chrono::DateTime<chrono::Local>,
    pub pid: u32,
}

impl SessionInfo {
    pub fn new(ticket_id: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            working_dir,
            started_at: chrono::Local::now(),
            pid: std::process::id(),
        }
    }
}

pub fn session_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("session.json")
}

/// Write the session file for the current process.
pub fn write(state_dir: &Path, info: &SessionInfo) -> std::io::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let json = serde_json::to_string_pretty(info).unwrap_or_default();
    std::fs::write(session_file_path(state_dir), json)
}

pub fn remove(state_dir: &Path) {
    let _ = std::fs::remove_file(session_file_path(state_dir));
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signal 0: no signal sent, only existence/permission checked.
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

#[derive(Debug)]
pub enum ReadOutcome {
    Active(SessionInfo),
    /// No session file was present.
    Absent,
    /// A session file existed but was stale (pid not alive) or corrupt;
    /// it has been removed.
    Cleaned,
}

/// Inspect `<state-dir>/session.json`. A stale (pid not alive) or
/// corrupt file is removed rather than reported.
pub fn read(state_dir: &Path) -> ReadOutcome {
    let path = session_file_path(state_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return ReadOutcome::Absent,
    };
    let info: SessionInfo = match serde_json::from_str(&content) {
        Ok(i) => i,
        Err(_) => {
            let _ = std::fs::remove_file(&path);
            return ReadOutcome::Cleaned;
        }
    };
    if pid_is_alive(info.pid) {
        ReadOutcome::Active(info)
    } else {
        let _ = std::fs::remove_file(&path);
        ReadOutcome::Cleaned
    }
}

/// The process-scoped set of progress-log paths this process currently
/// holds an advisory lock on. A component-owned registry (not module
/// globals): other in-process collaborators query it rather than
/// re-deriving lock state.
#[derive(Default)]
pub struct LogLockRegistry {
    held: Mutex<HashSet<PathBuf>>,
}

impl LogLockRegistry {
    pub fn global() -> &'static LogLockRegistry {
        static REGISTRY: OnceLock<LogLockRegistry> = OnceLock::new();
        REGISTRY.get_or_init(LogLockRegistry::default)
    }

    pub fn register(&self, path: PathBuf) {
        self.held.lock().unwrap().insert(path);
    }

    pub fn unregister(&self, path: &Path) {
        self.held.lock().unwrap().remove(path);
    }

    pub fn is_locked_by_us(&self, path: &Path) -> bool {
        self.held.lock().unwrap().contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let info = SessionInfo::new("TKT-1", dir.path().to_path_buf());
        write(dir.path(), &info).unwrap();
        match read(dir.path()) {
            ReadOutcome::Active(read_info) => assert_eq!(read_info.ticket_id, "TKT-1"),
            other => panic!("expected Active, got {other:?}"),
        }
    }

    #[test]
    fn stale_pid_is_cleaned_up() {
        let dir = tempdir().unwrap();
        // pid 0 never corresponds to a live process we can signal as non-root.
        let info = SessionInfo {
            ticket_id: "TKT-1".into(),
            working_dir: dir.path().to_path_buf(),
            started_at: chrono::Local::now(),
            pid: 999_999,
        };
        write(dir.path(), &info).unwrap();
        match read(dir.path()) {
            ReadOutcome::Cleaned => {}
            other => panic!("expected Cleaned, got {other:?}"),
        }
        assert!(!session_file_path(dir.path()).exists());
    }

    #[test]
    fn corrupt_session_file_is_cleaned_up() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(session_file_path(dir.path()), "not json").unwrap();
        match read(dir.path()) {
            ReadOutcome::Cleaned => {}
            other => panic!("expected Cleaned, got {other:?}"),
        }
    }

    #[test]
    fn absent_session_file_reports_absent() {
        let dir = tempdir().unwrap();
        assert!(matches!(read(dir.path()), ReadOutcome::Absent));
    }

    #[test]
    fn lock_registry_tracks_registered_paths() {
        let registry = LogLockRegistry::default();
        let path = PathBuf::from("/tmp/x.log");
        assert!(!registry.is_locked_by_us(&path));
        registry.register(path.clone());
        assert!(registry.is_locked_by_us(&path));
        registry.unregister(&path);
        assert!(!registry.is_locked_by_us(&path));
    }
}
