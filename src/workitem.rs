//! Work-item model: parsing, phase dialects, and atomic mutation of
//! Markdown work-items (component A).
//!
//! Two backends share [`WorkItemStore`]: [`TicketStore`] shells out to an
//! external `tk` command for reads/notes/status and edits the file in-place
//! for phase completion; [`PlanStore`] owns a plain Markdown file directly.
//! [`DispatchingStore`] picks between them by identifier shape.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use crate::errors::WorkItemError;

/// One declared step inside a work-item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemKind {
    Ticket,
    Plan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemStatus {
    Open,
    InProgress,
    Closed,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Open => "open",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub status: WorkItemStatus,
    pub phases: Vec<Phase>,
    pub raw_content: String,
    pub validation_commands: Vec<String>,
    pub kind: WorkItemKind,
}

impl WorkItem {
    /// The first incomplete phase, in source order. `None` means either a
    /// phaseless item or one where every phase is already complete.
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.iter().find(|p| !p.completed)
    }

    /// Every phase marked complete, and there is at least one phase.
    pub fn all_complete(&self) -> bool {
        !self.phases.is_empty() && self.phases.iter().all(|p| p.completed)
    }

    /// `true` for a work-item with zero declared phases; it runs as a
    /// single implicit step whose phase name is the `null` sentinel.
    pub fn is_phaseless(&self) -> bool {
        self.phases.is_empty()
    }
}

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap())
}

/// `true` if `id` is non-empty and matches `[A-Za-z0-9][A-Za-z0-9_.\-]*`.
pub fn is_valid_id(id: &str) -> bool {
    id_pattern().is_match(id)
}

/// An identifier is a plan if it resolves to a file path: it ends in
/// `.md`, or begins with `./`, `/`, or `../`.
pub fn is_plan_id(id: &str) -> bool {
    id.ends_with(".md") || id.starts_with("./") || id.starts_with('/') || id.starts_with("../")
}

// --- Phase parsing -------------------------------------------------------

fn checkbox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^- \[([ xX])\] (.+)$").unwrap())
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^## (?:Step|Phase) \d+[:.]? (.+?)(?: \[([ xX])\])?$").unwrap()
    })
}

/// Parse phases from raw Markdown content. Tries the checkbox dialect
/// first (`- [ ] NAME` / `- [x] NAME`); if none are found, falls back to
/// the heading dialect (`## Step N: NAME [x]`).
pub fn parse_phases(content: &str) -> Vec<Phase> {
    let checkbox = checkbox_re();
    let checkboxes: Vec<Phase> = content
        .lines()
        .filter_map(|line| {
            checkbox.captures(line.trim_end()).map(|caps| Phase {
                name: caps[2].trim().to_string(),
                completed: caps[1].eq_ignore_ascii_case("x"),
            })
        })
        .collect();
    if !checkboxes.is_empty() {
        return checkboxes;
    }

    let heading = heading_re();
    content
        .lines()
        .filter_map(|line| {
            heading.captures(line.trim_end()).map(|caps| Phase {
                name: caps[1].trim().to_string(),
                completed: caps
                    .get(2)
                    .is_some_and(|m| m.as_str().eq_ignore_ascii_case("x")),
            })
        })
        .collect()
}

/// Parse the optional YAML frontmatter between `---` fences, returning
/// `(title, status, remaining_content)`. `remaining_content` is the input
/// with the frontmatter block stripped.
fn parse_frontmatter(content: &str) -> (Option<String>, Option<WorkItemStatus>, &str) {
    let Some(rest) = content.strip_prefix("---\n") else {
        return (None, None, content);
    };
    let Some(end) = rest.find("\n---") else {
        return (None, None, content);
    };
    let frontmatter = &rest[..end];
    let body_start = end + "\n---".len();
    let body = rest[body_start..].trim_start_matches('\n');

    let mut title = None;
    let mut status = None;
    for line in frontmatter.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key {
            "title" => title = Some(value.to_string()),
            "status" => {
                status = match value {
                    "open" => Some(WorkItemStatus::Open),
                    "in_progress" => Some(WorkItemStatus::InProgress),
                    "closed" => Some(WorkItemStatus::Closed),
                    _ => None,
                }
            }
            _ => {}
        }
    }
    (title, status, body)
}

fn derive_title(content: &str, id: &str) -> String {
    for line in content.lines() {
        if let Some(heading) = line.strip_prefix("# ") {
            return heading.trim().to_string();
        }
    }
    id.to_string()
}

/// Build a [`WorkItem`] from the raw content of a work-item file.
pub fn parse_work_item(id: &str, content: &str, kind: WorkItemKind) -> WorkItem {
    let (fm_title, fm_status, body) = parse_frontmatter(content);
    let phases = parse_phases(body);
    let title = fm_title.unwrap_or_else(|| derive_title(body, id));
    let status = fm_status.unwrap_or(WorkItemStatus::Open);
    WorkItem {
        id: id.to_string(),
        title,
        status,
        phases,
        raw_content: content.to_string(),
        validation_commands: Vec::new(),
        kind,
    }
}

// --- Phase name normalization & matching --------------------------------

fn phase_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(?:phase|step)\s+\d+\s*:\s*|^\d+\.\s*").unwrap())
}

/// Lowercase, trim, and strip a leading `phase N:` / `step N:` / `N.`
/// prefix, for comparing an agent-reported phase name against the
/// work-item's declared phase names.
pub fn normalize_phase_name(name: &str) -> String {
    let trimmed = name.trim();
    let stripped = phase_prefix_re().replace(trimmed, "");
    stripped.trim().to_lowercase()
}

/// Two phase names match if their normalized forms are equal, or one
/// contains the other.
pub fn phase_names_match(requested: &str, declared: &str) -> bool {
    let a = normalize_phase_name(requested);
    let b = normalize_phase_name(declared);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(&b) || b.contains(&a)
}

// --- Atomic file mutation -------------------------------------------------

/// Toggle the single checkbox/heading line for `phase_name` in `content`
/// to completed, returning the new content (or `None` if no line changed).
fn mark_phase_completed(content: &str, phase_name: &str) -> Option<String> {
    let mut changed = false;
    let checkbox = checkbox_re();
    let heading = heading_re();
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            if changed {
                return line.to_string();
            }
            if let Some(caps) = checkbox.captures(line.trim_end()) {
                if !caps[1].eq_ignore_ascii_case("x") && phase_names_match(phase_name, caps[2].trim()) {
                    changed = true;
                    return line.replacen("[ ]", "[x]", 1);
                }
            } else if let Some(caps) = heading.captures(line.trim_end()) {
                let already = caps
                    .get(2)
                    .is_some_and(|m| m.as_str().eq_ignore_ascii_case("x"));
                if !already && phase_names_match(phase_name, caps[1].trim()) {
                    changed = true;
                    return if caps.get(2).is_some() {
                        line.replace("[ ]", "[x]")
                    } else {
                        format!("{} [x]", line.trim_end())
                    };
                }
            }
            line.to_string()
        })
        .collect();
    if !changed {
        return None;
    }
    let mut out = lines.join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

/// Write `content` to `path` atomically: a temp file in the same
/// directory, the original's permissions preserved, then a rename.
pub fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("workitem"),
        std::process::id()
    ));
    std::fs::write(&tmp_path, content)?;
    if let Ok(meta) = std::fs::metadata(path) {
        std::fs::set_permissions(&tmp_path, meta.permissions())?;
    }
    std::fs::rename(&tmp_path, path)
}

/// Uniform interface over the two work-item backends.
pub trait WorkItemStore: Send + Sync {
    fn get(&self, id: &str) -> Result<WorkItem, WorkItemError>;
    fn update_phase(&self, id: &str, phase_name: &str) -> Result<(), WorkItemError>;
    fn add_note(&self, id: &str, text: &str) -> Result<(), WorkItemError>;
    fn set_status(&self, id: &str, status: WorkItemStatus) -> Result<(), WorkItemError>;
}

/// The plan backend: a plain Markdown file the store owns directly.
/// `add_note`/`set_status` have no concept here and are no-ops.
pub struct PlanStore;

impl PlanStore {
    fn resolve(id: &str) -> PathBuf {
        PathBuf::from(id)
    }
}

impl WorkItemStore for PlanStore {
    fn get(&self, id: &str) -> Result<WorkItem, WorkItemError> {
        let path = Self::resolve(id);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorkItemError::TicketNotFound { id: id.to_string() }
            } else {
                WorkItemError::Io(e)
            }
        })?;
        Ok(parse_work_item(id, &content, WorkItemKind::Plan))
    }

    fn update_phase(&self, id: &str, phase_name: &str) -> Result<(), WorkItemError> {
        let path = Self::resolve(id);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorkItemError::TicketNotFound { id: id.to_string() }
            } else {
                WorkItemError::Io(e)
            }
        })?;
        let phases = parse_phases(&content);
        if !phases.iter().any(|p| phase_names_match(phase_name, &p.name)) {
            return Err(WorkItemError::PhaseNotFound {
                name: phase_name.to_string(),
            });
        }
        match mark_phase_completed(&content, phase_name) {
            Some(new_content) => atomic_write(&path, &new_content).map_err(WorkItemError::Io),
            None => Ok(()), // already completed: idempotent no-op
        }
    }

    fn add_note(&self, _id: &str, _text: &str) -> Result<(), WorkItemError> {
        Ok(())
    }

    fn set_status(&self, _id: &str, _status: WorkItemStatus) -> Result<(), WorkItemError> {
        Ok(())
    }
}

/// The ticket backend: shells out to an external `tk` command for reads,
/// notes, and status changes; edits the backing file in-place for phase
/// completion, the same way the plan backend does.
pub struct TicketStore {
    tickets_dir: PathBuf,
    tk_cmd: String,
}

impl TicketStore {
    pub fn new(tickets_dir: PathBuf, tk_cmd: impl Into<String>) -> Self {
        Self {
            tickets_dir,
            tk_cmd: tk_cmd.into(),
        }
    }

    fn ticket_path(&self, id: &str) -> Result<PathBuf, WorkItemError> {
        if !is_valid_id(id) {
            return Err(WorkItemError::TicketNotFound { id: id.to_string() });
        }
        let candidate = self.tickets_dir.join(format!("{id}.md"));
        let canon_dir = self
            .tickets_dir
            .canonicalize()
            .map_err(WorkItemError::Io)?;
        // The file may not exist yet when probing, so canonicalize the
        // parent and re-join the filename for the escape check.
        let check = match candidate.canonicalize() {
            Ok(c) => c,
            Err(_) => canon_dir.join(format!("{id}.md")),
        };
        if !check.starts_with(&canon_dir) {
            return Err(WorkItemError::PathEscape { id: id.to_string() });
        }
        Ok(candidate)
    }

    fn run_tk(&self, args: &[&str]) -> Result<String, WorkItemError> {
        let output = Command::new(&self.tk_cmd)
            .args(args)
            .output()
            .map_err(WorkItemError::Io)?;
        if !output.status.success() {
            return Err(WorkItemError::ExternalCommand {
                cmd: format!("{} {}", self.tk_cmd, args.join(" ")),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl WorkItemStore for TicketStore {
    fn get(&self, id: &str) -> Result<WorkItem, WorkItemError> {
        let path = self.ticket_path(id)?;
        if !path.exists() {
            return Err(WorkItemError::TicketNotFound { id: id.to_string() });
        }
        let content = std::fs::read_to_string(&path).map_err(WorkItemError::Io)?;
        Ok(parse_work_item(id, &content, WorkItemKind::Ticket))
    }

    fn update_phase(&self, id: &str, phase_name: &str) -> Result<(), WorkItemError> {
        let path = self.ticket_path(id)?;
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorkItemError::TicketNotFound { id: id.to_string() }
            } else {
                WorkItemError::Io(e)
            }
        })?;
        let phases = parse_phases(&content);
        if !phases.iter().any(|p| phase_names_match(phase_name, &p.name)) {
            return Err(WorkItemError::PhaseNotFound {
                name: phase_name.to_string(),
            });
        }
        match mark_phase_completed(&content, phase_name) {
            Some(new_content) => atomic_write(&path, &new_content).map_err(WorkItemError::Io),
            None => Ok(()),
        }
    }

    fn add_note(&self, id: &str, text: &str) -> Result<(), WorkItemError> {
        self.run_tk(&["add-note", id, text]).map(|_| ())
    }

    fn set_status(&self, id: &str, status: WorkItemStatus) -> Result<(), WorkItemError> {
        self.run_tk(&["set-status", id, status.as_str()]).map(|_| ())
    }
}

/// Dispatches to [`TicketStore`] or [`PlanStore`] by identifier shape.
pub struct DispatchingStore {
    pub ticket: TicketStore,
    pub plan: PlanStore,
}

impl DispatchingStore {
    pub fn new(tickets_dir: PathBuf, tk_cmd: impl Into<String>) -> Self {
        Self {
            ticket: TicketStore::new(tickets_dir, tk_cmd),
            plan: PlanStore,
        }
    }
}

impl WorkItemStore for DispatchingStore {
    fn get(&self, id: &str) -> Result<WorkItem, WorkItemError> {
        if is_plan_id(id) {
            self.plan.get(id)
        } else {
            self.ticket.get(id)
        }
    }

    fn update_phase(&self, id: &str, phase_name: &str) -> Result<(), WorkItemError> {
        if is_plan_id(id) {
            self.plan.update_phase(id, phase_name)
        } else {
            self.ticket.update_phase(id, phase_name)
        }
    }

    fn add_note(&self, id: &str, text: &str) -> Result<(), WorkItemError> {
        if is_plan_id(id) {
            self.plan.add_note(id, text)
        } else {
            self.ticket.add_note(id, text)
        }
    }

    fn set_status(&self, id: &str, status: WorkItemStatus) -> Result<(), WorkItemError> {
        if is_plan_id(id) {
            self.plan.set_status(id, status)
        } else {
            self.ticket.set_status(id, status)
        }
    }
}

/// Unions the filesets reported over a run, used by safety-state tracking
/// and by the loop's final summary.
pub fn union_files(total: &mut HashSet<String>, changed: &[String]) {
    for f in changed {
        total.insert(f.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_checkbox_phases() {
        let content = "- [ ] Phase 1: A\n- [x] Phase 2: B\n";
        let phases = parse_phases(content);
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].name, "Phase 1: A");
        assert!(!phases[0].completed);
        assert!(phases[1].completed);
    }

    #[test]
    fn parses_heading_phases_when_no_checkboxes() {
        let content = "## Step 1: Scaffold\nsome text\n## Phase 2: Implement [x]\n";
        let phases = parse_phases(content);
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].name, "Scaffold");
        assert!(!phases[0].completed);
        assert_eq!(phases[1].name, "Implement");
        assert!(phases[1].completed);
    }

    #[test]
    fn zero_phases_is_phaseless_and_valid() {
        let item = parse_work_item("plan.md", "# Title\nsome body\n", WorkItemKind::Plan);
        assert!(item.is_phaseless());
        assert!(item.current_phase().is_none());
        assert!(!item.all_complete());
    }

    #[test]
    fn all_complete_requires_at_least_one_phase() {
        let item = parse_work_item("t", "- [x] Phase 1: A\n", WorkItemKind::Ticket);
        assert!(item.all_complete());
    }

    #[test]
    fn current_phase_is_first_incomplete() {
        let item = parse_work_item(
            "t",
            "- [x] Phase 1: A\n- [ ] Phase 2: B\n- [ ] Phase 3: C\n",
            WorkItemKind::Ticket,
        );
        assert_eq!(item.current_phase().unwrap().name, "Phase 2: B");
    }

    #[test]
    fn phase_names_match_by_containment_either_direction() {
        assert!(phase_names_match("Phase 2: Implement", "Implement"));
        assert!(phase_names_match("Implement", "Phase 2: Implement"));
        assert!(phase_names_match("step 3: Review", "Review"));
        assert!(!phase_names_match("Implement", "Design"));
    }

    #[test]
    fn is_plan_id_recognizes_paths() {
        assert!(is_plan_id("./plan.md"));
        assert!(is_plan_id("/abs/plan.md"));
        assert!(is_plan_id("../plan.md"));
        assert!(is_plan_id("notes.md"));
        assert!(!is_plan_id("TKT-123"));
    }

    #[test]
    fn plan_store_update_phase_is_atomic_and_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.md");
        std::fs::write(&path, "- [ ] Phase 1: A\n- [ ] Phase 2: B\n").unwrap();
        let store = PlanStore;
        let id = path.to_str().unwrap();

        store.update_phase(id, "Phase 1: A").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "- [x] Phase 1: A\n- [ ] Phase 2: B\n");

        // Idempotent: calling again on an already-completed phase is a no-op.
        store.update_phase(id, "A").unwrap();
        let content2 = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, content2);
    }

    #[test]
    fn plan_store_update_phase_unknown_name_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.md");
        std::fs::write(&path, "- [ ] Phase 1: A\n").unwrap();
        let store = PlanStore;
        let err = store.update_phase(path.to_str().unwrap(), "Nonexistent").unwrap_err();
        assert!(matches!(err, WorkItemError::PhaseNotFound { .. }));
    }

    #[test]
    fn ticket_store_rejects_path_escape() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tickets")).unwrap();
        let store = TicketStore::new(dir.path().join("tickets"), "tk");
        let err = store.get("../../etc/passwd").unwrap_err();
        assert!(matches!(
            err,
            WorkItemError::TicketNotFound { .. } | WorkItemError::PathEscape { .. }
        ));
    }

    #[test]
    fn dispatching_store_routes_by_id_shape() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tickets")).unwrap();
        let plan_path = dir.path().join("plan.md");
        std::fs::write(&plan_path, "- [ ] Phase 1: A\n").unwrap();

        let store = DispatchingStore::new(dir.path().join("tickets"), "tk");
        let item = store.get(plan_path.to_str().unwrap()).unwrap();
        assert_eq!(item.kind, WorkItemKind::Plan);
    }
}
