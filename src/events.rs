//! Typed events forwarded across the TUI / event-bus boundary (component
//! I). The core only emits into bounded channels; rendering is an
//! external collaborator.

use serde::Serialize;
use std::collections::HashMap;

use crate::safety::TokenUsage;
use crate::status::StatusBlock;

/// Consumer-side bound: the UI is lossy by design, so overflow drops
/// silently rather than applying backpressure to the agent invoker.
pub const EVENT_CHANNEL_CAPACITY: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct ToolUseEvent {
    pub name: String,
    pub input: serde_json::Value,
    pub tool_use_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResultEvent {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiffLineKind {
    Add,
    Del,
    Hunk,
    Ctx,
}

/// Classify one line of diff-like tool-result text by its leading
/// character: `+` add, `-` del, `@@` hunk header, else context.
pub fn classify_diff_line(line: &str) -> DiffLineKind {
    if line.starts_with("@@") {
        DiffLineKind::Hunk
    } else if line.starts_with('+') {
        DiffLineKind::Add
    } else if line.starts_with('-') {
        DiffLineKind::Del
    } else {
        DiffLineKind::Ctx
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub iteration: u32,
    pub phase: Option<String>,
    pub no_change_streak: u32,
    pub error_streak: u32,
    pub total_files_changed: usize,
    pub in_review: bool,
    pub review_iterations: u32,
    pub token_totals: HashMap<String, TokenUsage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum Event {
    AssistantText { delta: String },
    ToolUse(ToolUseEvent),
    ToolResult(ToolResultEvent),
    DiffLine { kind: DiffLineKind, text: String },
    Stats { pid: u32, rss_kb: Option<u64> },
    Status(StatusBlock),
    Snapshot(StateSnapshot),
    IterationStart { iteration: u32 },
    IterationEnd { iteration: u32, error: Option<String> },
}

/// Tokenize diff-like text in a tool result into one [`Event::DiffLine`]
/// per line.
pub fn diff_events(text: &str) -> Vec<Event> {
    text.lines()
        .map(|line| Event::DiffLine {
            kind: classify_diff_line(line),
            text: line.to_string(),
        })
        .collect()
}

pub type EventSender = tokio::sync::mpsc::Sender<Event>;
pub type EventReceiver = tokio::sync::mpsc::Receiver<Event>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY)
}
