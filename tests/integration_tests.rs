//! Integration tests for programmator's CLI surface.
//!
//! These exercise the `programmator` binary directly with `assert_cmd`,
//! the way a user or CI job would invoke it, rather than calling library
//! functions in-process.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

/// A `programmator` command with its XDG/home roots pinned inside a
/// private temp directory so tests never read or write the real user
/// config/state.
fn programmator(env_root: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("programmator");
    cmd.env("HOME", env_root)
        .env("XDG_CONFIG_HOME", env_root.join("config"))
        .env("XDG_STATE_HOME", env_root.join("state"))
        .env_remove("PROGRAMMATOR_STATE_DIR");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes a fake agent at `<dir>/fake-agent.sh`: a stand-in for the
/// external coding agent that ignores its CLI flags, drains stdin, and
/// emits one streaming-JSON assistant turn ending in the status block
/// the orchestrator needs to see to exit `complete`.
fn write_fake_agent(dir: &Path, emit_line: &str) -> std::path::PathBuf {
    let path = dir.join("fake-agent.sh");
    let script = format!(
        "#!/bin/sh\ncat >/dev/null\necho '{{\"type\":\"system\",\"session_id\":\"s1\",\"model\":\"fake-model\"}}'\n{}\necho '{{\"type\":\"result\",\"usage\":{{\"input_tokens\":10,\"output_tokens\":5}}}}'\n",
        emit_line
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Builds the `echo` line for one assistant-turn JSON message whose text
/// content is `text`.
fn assistant_line(text: &str) -> String {
    let escaped = serde_json::to_string(text).unwrap();
    format!(
        "echo '{{\"type\":\"assistant\",\"message\":{{\"model\":\"fake-model\",\"content\":[{{\"type\":\"text\",\"text\":{escaped}}}]}}}}'"
    )
}

/// One assistant-turn JSON line whose text content ends with a
/// `PROGRAMMATOR_STATUS` block reporting `DONE` on a phaseless item.
fn done_line() -> String {
    assistant_line(
        "Finished the work.\n\nPROGRAMMATOR_STATUS:\n  status: DONE\n  phase: null\n  summary: \"did the thing\"\n  files_changed: []\n  next_action: \"\"\n",
    )
}

fn write_project_config(project: &Path, agent_cmd: &Path, extra: &str) {
    fs::create_dir_all(project.join(".programmator")).unwrap();
    fs::write(
        project.join(".programmator/config.yaml"),
        format!("agent_cmd: \"{}\"\n{extra}", agent_cmd.display()),
    )
    .unwrap();
}

mod cli_basics {
    use super::*;

    #[test]
    fn help_lists_all_subcommands() {
        let env_root = create_temp_project();
        programmator(env_root.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("start"))
            .stdout(predicate::str::contains("review"))
            .stdout(predicate::str::contains("status"))
            .stdout(predicate::str::contains("logs"))
            .stdout(predicate::str::contains("hook"));
    }

    #[test]
    fn version_prints_something() {
        let env_root = create_temp_project();
        programmator(env_root.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("programmator"));
    }

    #[test]
    fn unknown_subcommand_fails() {
        let env_root = create_temp_project();
        programmator(env_root.path()).arg("bogus").assert().failure();
    }
}

mod status_and_logs {
    use super::*;

    #[test]
    fn status_reports_no_active_run_in_a_fresh_project() {
        let env_root = create_temp_project();
        let project = create_temp_project();
        programmator(env_root.path())
            .args(["status", "--dir"])
            .arg(project.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("no active run"));
    }

    #[test]
    fn logs_reports_no_logs_in_a_fresh_project() {
        let env_root = create_temp_project();
        let project = create_temp_project();
        programmator(env_root.path())
            .args(["logs", "--dir"])
            .arg(project.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("no progress logs"));
    }
}

mod hook_subcommand {
    use super::*;

    #[test]
    fn malformed_stdin_fails_closed() {
        let env_root = create_temp_project();
        programmator(env_root.path())
            .args(["hook", "--socket", "/nonexistent/programmator-test.sock"])
            .write_stdin("not json")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"permissionDecision\":\"deny\""));
    }

    #[test]
    fn unreachable_socket_fails_closed() {
        let env_root = create_temp_project();
        let input = r#"{"session_id":"s","tool_name":"Read","tool_input":{},"tool_use_id":"t"}"#;
        programmator(env_root.path())
            .args(["hook", "--socket", "/nonexistent/programmator-test.sock"])
            .write_stdin(input)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"permissionDecision\":\"deny\""));
    }
}

mod configuration {
    use super::*;

    #[test]
    fn malformed_project_config_surfaces_as_a_failure() {
        let env_root = create_temp_project();
        let project = create_temp_project();
        fs::create_dir_all(project.path().join(".programmator")).unwrap();
        fs::write(
            project.path().join(".programmator/config.yaml"),
            "not: [valid\n",
        )
        .unwrap();
        programmator(env_root.path())
            .args(["status", "--dir"])
            .arg(project.path())
            .assert()
            .failure();
    }

    #[test]
    fn custom_state_dir_relocates_the_session_file() {
        let env_root = create_temp_project();
        let project = create_temp_project();
        let state_dir = project.path().join("custom-state");
        fs::create_dir_all(project.path().join(".programmator")).unwrap();
        fs::write(
            project.path().join(".programmator/config.yaml"),
            format!("state_dir: \"{}\"\n", state_dir.display()),
        )
        .unwrap();
        programmator(env_root.path())
            .args(["status", "--dir"])
            .arg(project.path())
            .assert()
            .success()
            .stdout(predicate::str::contains(state_dir.display().to_string()));
    }
}

mod end_to_end {
    use super::*;

    /// Drives a phaseless plan through `start` against a fake agent that
    /// immediately reports `DONE`; with `--skip-review` the loop should
    /// exit `complete` after exactly one iteration.
    #[test]
    fn start_completes_a_phaseless_plan_in_one_iteration() {
        let env_root = create_temp_project();
        let project = create_temp_project();
        let agent = write_fake_agent(project.path(), &done_line());
        write_project_config(project.path(), &agent, "max_iterations: 5\n");
        fs::write(
            project.path().join("plan.md"),
            "# A tiny plan\n\nNo declared phases, just do the thing.\n",
        )
        .unwrap();

        programmator(env_root.path())
            .current_dir(project.path())
            .args(["start", "./plan.md", "--dir"])
            .arg(project.path())
            .args(["--skip-review", "--dangerously-skip-permissions"])
            .assert()
            .success()
            .stdout(predicate::str::contains("exit: complete"))
            .stdout(predicate::str::contains("iterations: 1"));
    }

    /// A `BLOCKED` status on the first turn should exit non-zero with the
    /// agent's reported summary surfaced in the exit message.
    #[test]
    fn start_exits_nonzero_when_agent_reports_blocked() {
        let env_root = create_temp_project();
        let project = create_temp_project();
        let line = assistant_line(
            "Stuck.\n\nPROGRAMMATOR_STATUS:\n  status: BLOCKED\n  phase: null\n  summary: \"missing credentials\"\n  files_changed: []\n  next_action: \"\"\n",
        );
        let agent = write_fake_agent(project.path(), &line);
        write_project_config(project.path(), &agent, "max_iterations: 5\n");
        fs::write(project.path().join("plan.md"), "# Blocked plan\n").unwrap();

        programmator(env_root.path())
            .current_dir(project.path())
            .args(["start", "./plan.md", "--dir"])
            .arg(project.path())
            .args(["--skip-review", "--dangerously-skip-permissions"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("missing credentials"));
    }

    /// `review --dir` enters review-only mode directly; with the fake
    /// agent returning a clean `REVIEW_RESULT` block the run completes.
    #[test]
    fn review_only_mode_completes_against_a_clean_pass() {
        let env_root = create_temp_project();
        let project = create_temp_project();
        let line = assistant_line("Looks good.\n\nREVIEW_RESULT:\n  issues: []\n");
        let agent = write_fake_agent(project.path(), &line);
        write_project_config(project.path(), &agent, "");
        fs::write(project.path().join("plan.md"), "# Reviewed plan\n").unwrap();

        programmator(env_root.path())
            .current_dir(project.path())
            .args(["review", "./plan.md", "--dir"])
            .arg(project.path())
            .arg("--dangerously-skip-permissions")
            .assert()
            .stdout(predicate::str::contains("exit:"));
    }

    /// With no `passes` configured the review loop must still invoke the
    /// implicit primary agent and honor a `REVIEW_RESULT` reporting
    /// issues, rather than treating an empty pass list as an automatic
    /// clean pass. Repeated failing turns exhaust the review retry cap.
    #[test]
    fn review_only_mode_exhausts_retries_on_a_persistent_failure() {
        let env_root = create_temp_project();
        let project = create_temp_project();
        let line = assistant_line(
            "Found a bug.\n\nREVIEW_RESULT:\n  issues:\n    - file: a.rs\n      line: 3\n      severity: high\n      description: \"off by one\"\n",
        );
        let agent = write_fake_agent(project.path(), &line);
        write_project_config(project.path(), &agent, "max_review_iterations: 1\n");
        fs::write(project.path().join("plan.md"), "# Reviewed plan\n").unwrap();

        programmator(env_root.path())
            .current_dir(project.path())
            .args(["review", "./plan.md", "--dir"])
            .arg(project.path())
            .arg("--dangerously-skip-permissions")
            .assert()
            .failure()
            .stdout(predicate::str::contains("max_review_retries"));
    }
}
