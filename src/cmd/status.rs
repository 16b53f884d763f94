//! `status`: inspect `<state-dir>/session.json`, removing it first if
//! stale (pid not alive) or corrupt.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::{self, CliOverrides};
use crate::session::{self, ReadOutcome};

pub fn cmd_status(dir: Option<PathBuf>) -> Result<()> {
    let project_dir = super::start::resolve_dir(dir)?;
    let effective = config::resolve(&project_dir, CliOverrides::default())
        .context("failed to resolve effective configuration")?;

    match session::read(&effective.state_dir) {
        ReadOutcome::Active(info) => {
            println!("work item:   {}", info.ticket_id);
            println!("working dir: {}", info.working_dir.display());
            println!("started at:  {}", info.started_at);
            println!("pid:         {} (running)", info.pid);
        }
        ReadOutcome::Absent => {
            println!("no active run ({} not found)", session::session_file_path(&effective.state_dir).display());
        }
        ReadOutcome::Cleaned => {
            println!("no active run (stale or corrupt session file was removed)");
        }
    }
    Ok(())
}
