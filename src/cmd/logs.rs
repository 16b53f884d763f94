//! `logs`: list progress-log files under `<state-dir>/logs`, marking
//! which one (if any) belongs to a currently active run via a try-lock
//! on each file — the same discipline §9 documents for the external
//! `logs --follow` collaborator.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{self, CliOverrides};
use crate::logging;

pub fn cmd_logs(dir: Option<PathBuf>, follow: bool) -> Result<()> {
    let project_dir = super::start::resolve_dir(dir)?;
    let effective = config::resolve(&project_dir, CliOverrides::default())
        .context("failed to resolve effective configuration")?;

    let logs_dir = effective.state_dir.join("logs");
    let mut entries: Vec<PathBuf> = std::fs::read_dir(&logs_dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|ext| ext == "log").unwrap_or(false))
                .collect()
        })
        .unwrap_or_default();
    entries.sort();

    if entries.is_empty() {
        println!("no progress logs under {}", logs_dir.display());
        return Ok(());
    }

    for path in &entries {
        let status = if logging::is_active_log(path) { "active" } else { "historical" };
        println!("{status:>10}  {}", path.display());
    }

    if follow {
        let latest = entries.last().unwrap().clone();
        println!("\n--- following {} ---", latest.display());
        follow_file(&latest)?;
    }
    Ok(())
}

/// A minimal poll-based follow: print any bytes appended since the last
/// read, once per second, until interrupted.
fn follow_file(path: &PathBuf) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut pos = file.seek(SeekFrom::End(0))?;
    loop {
        std::thread::sleep(Duration::from_secs(1));
        let len = file.metadata()?.len();
        if len < pos {
            // File was truncated/rotated; restart from the beginning.
            pos = 0;
        }
        if len > pos {
            file.seek(SeekFrom::Start(pos))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            print!("{}", String::from_utf8_lossy(&buf));
            pos = len;
        }
    }
}
