//! Status-block parser (component F): extracts the trailing
//! `PROGRAMMATOR_STATUS` YAML block, and the optional `REVIEW_RESULT`
//! block, from assistant text.

use serde::{Deserialize, Serialize};

pub const STATUS_MARKER: &str = "PROGRAMMATOR_STATUS:";
pub const REVIEW_MARKER: &str = "REVIEW_RESULT:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    #[serde(rename = "CONTINUE")]
    Continue,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "BLOCKED")]
    Blocked,
    #[serde(rename = "REVIEW_PASS")]
    ReviewPass,
    #[serde(rename = "REVIEW_FAIL")]
    ReviewFail,
}

/// A raw deserialization target mirroring the YAML wire shape; `phase`
/// is kept as a raw string so the `null`/empty-string sentinel can be
/// normalized uniformly in [`StatusBlock::from_raw`].
#[derive(Debug, Deserialize)]
struct RawStatus {
    status: StatusKind,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    files_changed: Vec<String>,
    #[serde(default)]
    next_action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusBlock {
    pub status: StatusKind,
    /// `None` is the internal null-phase sentinel.
    pub phase: Option<String>,
    pub summary: String,
    pub files_changed: Vec<String>,
    pub next_action: String,
    /// `true` when this record was synthesized because the block was
    /// missing or malformed, rather than parsed from the agent's text.
    pub synthetic: bool,
}

impl StatusBlock {
    fn from_raw(raw: RawStatus) -> Self {
        let phase = match raw.phase.as_deref() {
            None => None,
            Some("") | Some("null") => None,
            Some(s) => Some(s.to_string()),
        };
        Self {
            status: raw.status,
            phase,
            summary: raw.summary,
            files_changed: raw.files_changed,
            next_action: raw.next_action,
            synthetic: false,
        }
    }

    fn synthetic_blocked(summary: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Blocked,
            phase: None,
            summary: summary.into(),
            files_changed: Vec::new(),
            next_action: String::new(),
            synthetic: true,
        }
    }
}

/// Render the template into the prompt's trailing status-block
/// specification (component E reuses this).
pub fn status_template() -> &'static str {
    "PROGRAMMATOR_STATUS:\n  status: CONTINUE|DONE|BLOCKED|REVIEW_PASS|REVIEW_FAIL\n  phase: \"<phase name or null>\"\n  summary: \"<one line>\"\n  files_changed: [path, ...]\n  next_action: \"<hint>\"\n"
}

/// Find the last column-1 occurrence of `marker` in `text`, returning
/// the byte offset where the marker's line begins.
fn find_last_marker(text: &str, marker: &str) -> Option<usize> {
    let mut found = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed_line = line.trim_end_matches('\n');
        if trimmed_line.starts_with(marker) {
            found = Some(offset);
        }
        offset += line.len();
    }
    found
}

/// Slice from just after `marker`'s line to end-of-text, or up to a
/// `\n---\n` terminator if present, then parse as YAML. The marker line
/// itself is dropped so the remainder parses as a plain mapping rather
/// than as a single key wrapping the fields one level down.
fn extract_block<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let start = find_last_marker(text, marker)?;
    let rest = &text[start..];
    let block = match rest.find("\n---\n") {
        Some(end) => &rest[..end],
        None => rest,
    };
    let after_marker_line = match block.find('\n') {
        Some(idx) => &block[idx + 1..],
        None => "",
    };
    Some(after_marker_line)
}

/// Parse the trailing `PROGRAMMATOR_STATUS` block out of assistant text.
/// A missing or malformed block returns a synthetic `BLOCKED` record with
/// a diagnostic summary (this feeds the error-streak counter upstream).
pub fn parse_status_block(text: &str) -> StatusBlock {
    let Some(block) = extract_block(text, STATUS_MARKER) else {
        return StatusBlock::synthetic_blocked("no PROGRAMMATOR_STATUS block found in output");
    };
    match serde_yaml::from_str::<RawStatus>(block) {
        Ok(raw) => StatusBlock::from_raw(raw),
        Err(e) => StatusBlock::synthetic_blocked(format!("malformed PROGRAMMATOR_STATUS block: {e}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub file: String,
    pub line: Option<u32>,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReviewResult {
    #[serde(default)]
    issues: Vec<ReviewIssue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewResult {
    pub issues: Vec<ReviewIssue>,
}

impl ReviewResult {
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Parse the trailing `REVIEW_RESULT` block. `None` if absent; a
/// malformed block is treated as a single diagnostic high-severity issue
/// so a parse failure cannot masquerade as a clean pass.
pub fn parse_review_result(text: &str) -> Option<ReviewResult> {
    let block = extract_block(text, REVIEW_MARKER)?;
    match serde_yaml::from_str::<RawReviewResult>(block) {
        Ok(raw) => Some(ReviewResult { issues: raw.issues }),
        Err(e) => Some(ReviewResult {
            issues: vec![ReviewIssue {
                file: String::new(),
                line: None,
                severity: Severity::High,
                description: format!("malformed REVIEW_RESULT block: {e}"),
                suggestion: None,
            }],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_status_block() {
        let text = "I did the work.\n\nPROGRAMMATOR_STATUS:\n  status: DONE\n  phase: \"Phase 1: A\"\n  summary: \"did it\"\n  files_changed: [a.rs, b.rs]\n  next_action: \"next\"\n";
        let status = parse_status_block(text);
        assert_eq!(status.status, StatusKind::Done);
        assert_eq!(status.phase.as_deref(), Some("Phase 1: A"));
        assert_eq!(status.files_changed, vec!["a.rs", "b.rs"]);
        assert!(!status.synthetic);
    }

    #[test]
    fn null_and_empty_phase_map_to_sentinel() {
        let text = "PROGRAMMATOR_STATUS:\n  status: CONTINUE\n  phase: null\n  summary: \"x\"\n  files_changed: []\n  next_action: \"\"\n";
        assert_eq!(parse_status_block(text).phase, None);

        let text2 = "PROGRAMMATOR_STATUS:\n  status: CONTINUE\n  phase: \"\"\n  summary: \"x\"\n  files_changed: []\n  next_action: \"\"\n";
        assert_eq!(parse_status_block(text2).phase, None);
    }

    #[test]
    fn missing_block_is_synthetic_blocked() {
        let status = parse_status_block("no status block here");
        assert_eq!(status.status, StatusKind::Blocked);
        assert!(status.synthetic);
    }

    #[test]
    fn malformed_yaml_is_synthetic_blocked() {
        let text = "PROGRAMMATOR_STATUS:\n  status: [not, valid\n";
        let status = parse_status_block(text);
        assert_eq!(status.status, StatusKind::Blocked);
        assert!(status.synthetic);
    }

    #[test]
    fn uses_last_occurrence_of_marker() {
        let text = "PROGRAMMATOR_STATUS:\n  status: CONTINUE\n  phase: null\n  summary: \"first\"\n  files_changed: []\n  next_action: \"\"\n\nmore text\n\nPROGRAMMATOR_STATUS:\n  status: DONE\n  phase: null\n  summary: \"second\"\n  files_changed: []\n  next_action: \"\"\n";
        let status = parse_status_block(text);
        assert_eq!(status.status, StatusKind::Done);
        assert_eq!(status.summary, "second");
    }

    #[test]
    fn terminator_stops_the_block_before_trailing_content() {
        let text = "PROGRAMMATOR_STATUS:\n  status: CONTINUE\n  phase: null\n  summary: \"x\"\n  files_changed: []\n  next_action: \"\"\n---\ntrailing junk that is not yaml: [[[\n";
        let status = parse_status_block(text);
        assert_eq!(status.status, StatusKind::Continue);
        assert!(!status.synthetic);
    }

    #[test]
    fn review_result_empty_issues_passes() {
        let text = "REVIEW_RESULT:\n  issues: []\n";
        let result = parse_review_result(text).unwrap();
        assert!(result.passed());
    }

    #[test]
    fn review_result_with_issues_fails() {
        let text = "REVIEW_RESULT:\n  issues:\n    - file: a.rs\n      line: 10\n      severity: high\n      description: \"bug\"\n";
        let result = parse_review_result(text).unwrap();
        assert!(!result.passed());
        assert_eq!(result.issues[0].severity, Severity::High);
    }

    #[test]
    fn review_result_absent_returns_none() {
        assert!(parse_review_result("no block here").is_none());
    }
}
