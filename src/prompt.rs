//! Prompt assembler (component E): builds the per-iteration prompt from
//! work-item content, current phase, recent history, and the required
//! trailing status-block specification.

use std::collections::HashMap;
use std::path::Path;

use crate::status::status_template;
use crate::workitem::WorkItem;

const MAX_RECENT_SUMMARIES: usize = 5;

const DEFAULT_PREAMBLE: &str = "You are working through a declared sequence of phases in the work-item below. \
Make concrete progress on the current phase, then reply with the required PROGRAMMATOR_STATUS block as the \
last thing in your response.";

const DEFAULT_REVIEW_PREAMBLE: &str = "You are reviewing the work below for correctness and quality issues. \
Reply with the required REVIEW_RESULT block as the last thing in your response.";

#[derive(Debug, Clone, Default)]
pub struct ReviewContext {
    pub pending_issues: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub work_item: &'a WorkItem,
    pub phase: Option<&'a str>,
    pub iteration: u32,
    pub recent_summaries: &'a [String],
    pub review: Option<&'a ReviewContext>,
}

/// Overridable templates, loaded from a prompts directory if present and
/// falling back to embedded defaults. Rendering is a simple
/// named-placeholder substitution with no control flow.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    pub preamble: String,
    pub review_preamble: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            preamble: DEFAULT_PREAMBLE.to_string(),
            review_preamble: DEFAULT_REVIEW_PREAMBLE.to_string(),
        }
    }
}

impl PromptTemplates {
    /// Load `preamble.txt` / `review_preamble.txt` from `dir` if present,
    /// falling back to embedded defaults for any missing file.
    pub fn load(dir: &Path) -> Self {
        let mut templates = Self::default();
        if let Ok(content) = std::fs::read_to_string(dir.join("preamble.txt")) {
            templates.preamble = content;
        }
        if let Ok(content) = std::fs::read_to_string(dir.join("review_preamble.txt")) {
            templates.review_preamble = content;
        }
        templates
    }
}

/// Substitute `{{name}}` placeholders in `template` with `vars`, no
/// control flow.
pub fn render_template(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Assemble the single string prompt for one iteration.
pub fn assemble(ctx: &PromptContext, templates: &PromptTemplates) -> String {
    let mut out = String::new();
    out.push_str(&templates.preamble);
    out.push_str("\n\n---\n\n");
    out.push_str(&ctx.work_item.raw_content);
    out.push_str("\n\n---\n\n");

    match ctx.phase {
        Some(phase) => out.push_str(&format!("Current phase: {phase}\n")),
        None => out.push_str("Current phase: null\n"),
    }
    out.push_str(&format!("Iteration: {}\n", ctx.iteration));

    if !ctx.recent_summaries.is_empty() {
        out.push_str("\nRecent iteration summaries:\n");
        let start = ctx.recent_summaries.len().saturating_sub(MAX_RECENT_SUMMARIES);
        for summary in &ctx.recent_summaries[start..] {
            out.push_str(&format!("- {summary}\n"));
        }
    }

    if let Some(review) = ctx.review {
        out.push_str("\nPending review issues to remediate:\n");
        for issue in &review.pending_issues {
            out.push_str(&format!("- {issue}\n"));
        }
    }

    out.push_str("\nReply with exactly this block at the end of your response:\n\n");
    out.push_str(status_template());
    out
}

/// Assemble a review-pass prompt for a single review agent.
pub fn assemble_review(
    ctx: &PromptContext,
    agent_focus: &[String],
    templates: &PromptTemplates,
) -> String {
    let mut out = String::new();
    out.push_str(&templates.review_preamble);
    out.push_str("\n\n---\n\n");
    out.push_str(&ctx.work_item.raw_content);
    out.push_str("\n\n---\n\n");
    if !agent_focus.is_empty() {
        out.push_str(&format!("Focus areas: {}\n", agent_focus.join(", ")));
    }
    out.push_str("\nReply with exactly this block at the end of your response:\n\n");
    out.push_str(
        "REVIEW_RESULT:\n  issues:\n    - file: \"<path>\"\n      line: <n>\n      severity: low|medium|high|critical\n      description: \"<what>\"\n      suggestion: \"<optional>\"\n",
    );
    out
}
