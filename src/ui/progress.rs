//! Terminal rendering for the `start`/`review` subcommands: drains the
//! event-bus receiver (component I) and renders iteration/phase
//! progress with `indicatif`. The core never depends on this module;
//! it is one possible consumer of [`crate::events::EventReceiver`],
//! the same boundary an external TUI would attach to.

use console::{style, Emoji};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::events::{DiffLineKind, Event, EventReceiver};
use crate::status::StatusKind;

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
static TOOL: Emoji<'_, '_> = Emoji("🔧 ", "[T]");

pub struct OrchestratorUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    iteration_bar: ProgressBar,
    file_bar: ProgressBar,
    verbose: bool,
    current_iter: AtomicU32,
}

impl OrchestratorUI {
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {msg}")
            .unwrap();
        let phase_bar = multi.add(ProgressBar::new_spinner());
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phase");

        let iteration_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap();
        let iteration_bar = multi.add(ProgressBar::new_spinner());
        iteration_bar.set_style(iteration_style);
        iteration_bar.set_prefix("  Iter");
        iteration_bar.enable_steady_tick(std::time::Duration::from_millis(100));

        let file_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} {msg}")
            .unwrap();
        let file_bar = multi.add(ProgressBar::new(0));
        file_bar.set_style(file_style);
        file_bar.set_prefix(" Files");

        Self {
            multi,
            phase_bar,
            iteration_bar,
            file_bar,
            verbose,
            current_iter: AtomicU32::new(0),
        }
    }

    fn println(&self, line: impl std::fmt::Display) {
        let _ = self.multi.println(line.to_string());
    }

    /// Drain `rx` until the channel closes, rendering each event. Runs
    /// on the task that owns the terminal; the orchestration loop keeps
    /// running on its own task regardless of how fast this drains.
    pub async fn drive(mut self, mut rx: EventReceiver) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
        self.iteration_bar.finish_and_clear();
        self.phase_bar.finish_and_clear();
        self.file_bar.finish_and_clear();
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::IterationStart { iteration } => {
                self.current_iter.store(iteration, Ordering::SeqCst);
                self.iteration_bar
                    .set_message(format!("running iteration {}", style(iteration).cyan()));
            }
            Event::IterationEnd { iteration, error } => match error {
                Some(msg) => self
                    .iteration_bar
                    .set_message(format!("{CROSS}iteration {iteration} failed: {msg}")),
                None => self
                    .iteration_bar
                    .set_message(format!("{CHECK}iteration {iteration} complete")),
            },
            Event::AssistantText { delta } => {
                if self.verbose && !delta.trim().is_empty() {
                    self.println(format!("    {}", style(delta.trim()).dim()));
                }
            }
            Event::ToolUse(tool_use) => {
                let iter = self.current_iter.load(Ordering::SeqCst);
                self.iteration_bar.set_message(format!(
                    "iteration {iter} {TOOL}{}",
                    style(&tool_use.name).yellow()
                ));
                self.println(format!("    {TOOL}{}", style(&tool_use.name).yellow()));
            }
            Event::ToolResult(result) => {
                if result.is_error {
                    self.println(format!("    {CROSS}{}", style(&result.content).red()));
                }
            }
            Event::DiffLine { kind, text } => {
                if !self.verbose {
                    return;
                }
                let rendered = match kind {
                    DiffLineKind::Add => style(text).green(),
                    DiffLineKind::Del => style(text).red(),
                    DiffLineKind::Hunk => style(text).cyan(),
                    DiffLineKind::Ctx => style(text).dim(),
                };
                self.println(format!("    {rendered}"));
            }
            Event::Stats { rss_kb, .. } => {
                if let Some(kb) = rss_kb {
                    self.file_bar
                        .set_message(format!("rss {} MB", kb / 1024));
                }
            }
            Event::Status(status) => {
                let (emoji, label): (&str, &str) = match status.status {
                    StatusKind::Continue => ("~ ", "continue"),
                    StatusKind::Done => ("✅ ", "phase done"),
                    StatusKind::Blocked => ("🚧 ", "blocked"),
                    StatusKind::ReviewPass => ("✅ ", "review pass"),
                    StatusKind::ReviewFail => ("❌ ", "review fail"),
                };
                self.println(format!(
                    "{emoji}{}: {}",
                    style(label).bold(),
                    status.summary
                ));
            }
            Event::Snapshot(snapshot) => {
                self.phase_bar.set_message(format!(
                    "{} (errors {}, stale {})",
                    snapshot.phase.as_deref().unwrap_or("(none)"),
                    snapshot.error_streak,
                    snapshot.no_change_streak
                ));
            }
        }
    }
}
