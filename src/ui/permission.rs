//! Default interactive permission handler (the "TUI dialog" the broker's
//! decision pipeline falls through to). Renders a `dialoguer::Select`
//! prompt per request, the same way the teacher's approval gates
//! (`gates::ApprovalGate`) asked the user to approve a phase.
//!
//! The broker treats this as a single-consumer callback it awaits
//! synchronously per request; a slow human answering one prompt simply
//! delays the next connection's handler task, which is the serialization
//! the spec calls out as acceptable.

use console::style;
use dialoguer::{theme::ColorfulTheme, Select};
use tokio::sync::Mutex;

use crate::broker::{Decision, PermissionHandler, PermissionRequest};

const OPTIONS: &[&str] = &[
    "Allow",
    "Allow once",
    "Allow for this project",
    "Allow globally",
    "Deny",
];

/// Serializes concurrent connection handlers onto the single terminal
/// dialog rather than interleaving prompts; held across the blocking
/// `interact_opt()` call via `spawn_blocking`, matching the spec's note
/// that the broker tolerates the handler blocking arbitrarily.
pub struct DialoguerPermissionHandler {
    lock: Mutex<()>,
}

impl DialoguerPermissionHandler {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }
}

impl Default for DialoguerPermissionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PermissionHandler for DialoguerPermissionHandler {
    async fn handle(&self, _request: &PermissionRequest, pattern: &str) -> (Decision, Option<String>) {
        let _guard = self.lock.lock().await;
        let prompt = format!(
            "{} wants to run {}",
            style("agent").bold(),
            style(pattern).yellow()
        );
        let selection = tokio::task::spawn_blocking(move || {
            Select::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .items(OPTIONS)
                .default(0)
                .interact_opt()
        })
        .await;

        let decision = match selection {
            Ok(Ok(Some(0))) => Decision::Allow,
            Ok(Ok(Some(1))) => Decision::AllowOnce,
            Ok(Ok(Some(2))) => Decision::AllowProject,
            Ok(Ok(Some(3))) => Decision::AllowGlobal,
            _ => Decision::Deny,
        };
        (decision, None)
    }
}
