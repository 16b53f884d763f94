//! Review sub-loop (component G): runs one or more review "agents"
//! (parallel or sequential), aggregates their issues, decides pass/fail,
//! and drives remediation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::events::EventSender;
use crate::invoker::{AgentInvoker, InvocationRequest};
use crate::prompt::{assemble_review, PromptContext, PromptTemplates};
use crate::status::{parse_review_result, ReviewIssue};
use crate::workitem::WorkItem;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReviewAgentConfig {
    pub name: String,
    #[serde(default)]
    pub focus: Vec<String>,
    #[serde(default = "default_executor")]
    pub executor: String,
}

fn default_executor() -> String {
    "claude".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReviewPassConfig {
    pub name: String,
    #[serde(default)]
    pub parallel: bool,
    pub agents: Vec<ReviewAgentConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_review_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub passes: Vec<ReviewPassConfig>,
}

fn default_true() -> bool {
    true
}

fn default_max_review_iterations() -> u32 {
    3
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 3,
            passes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Complete,
    MaxReviewRetries,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewRunResult {
    pub outcome: Option<ReviewOutcome>,
    pub iterations: u32,
    pub remaining_issues: Vec<ReviewIssue>,
}

/// Drives the review sub-loop over (invoker, prompt assembler); the
/// orchestration loop owns the safety-state bookkeeping (review flag,
/// review-iteration counter).
pub struct ReviewLoop {
    invoker: Arc<AgentInvoker>,
    templates: PromptTemplates,
}

impl ReviewLoop {
    pub fn new(invoker: Arc<AgentInvoker>, templates: PromptTemplates) -> Self {
        Self { invoker, templates }
    }

    /// Run every pass in order for a single review iteration, returning
    /// the aggregated issue list. `Parallel` passes fan out one
    /// invocation per agent and wait for all; others serialize.
    pub async fn run_iteration(
        &self,
        config: &ReviewConfig,
        work_item: &WorkItem,
        working_dir: &std::path::Path,
        permission_socket: Option<&std::path::Path>,
        timeout: Option<Duration>,
        events: Option<&EventSender>,
        cancel: &CancellationToken,
    ) -> Vec<ReviewIssue> {
        if config.passes.is_empty() {
            // No passes configured: fall back to a single implicit pass
            // through the primary agent rather than reviewing nothing.
            let primary = ReviewAgentConfig {
                name: "primary".to_string(),
                focus: Vec::new(),
                executor: default_executor(),
            };
            return self
                .run_agent(
                    &primary,
                    work_item,
                    working_dir,
                    permission_socket,
                    timeout,
                    events,
                    cancel,
                )
                .await;
        }
        let mut issues = Vec::new();
        for pass in &config.passes {
            let pass_issues = if pass.parallel {
                let futures = pass.agents.iter().map(|agent| {
                    self.run_agent(
                        agent,
                        work_item,
                        working_dir,
                        permission_socket,
                        timeout,
                        events,
                        cancel,
                    )
                });
                futures::future::join_all(futures)
                    .await
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
            } else {
                let mut serial = Vec::new();
                for agent in &pass.agents {
                    serial.extend(
                        self.run_agent(
                            agent,
                            work_item,
                            working_dir,
                            permission_socket,
                            timeout,
                            events,
                            cancel,
                        )
                        .await,
                    );
                }
                serial
            };
            issues.extend(pass_issues);
        }
        issues
    }

    async fn run_agent(
        &self,
        agent: &ReviewAgentConfig,
        work_item: &WorkItem,
        working_dir: &std::path::Path,
        permission_socket: Option<&std::path::Path>,
        timeout: Option<Duration>,
        events: Option<&EventSender>,
        cancel: &CancellationToken,
    ) -> Vec<ReviewIssue> {
        let ctx = PromptContext {
            work_item,
            phase: None,
            iteration: 0,
            recent_summaries: &[],
            review: None,
        };
        let prompt = assemble_review(&ctx, &agent.focus, &self.templates);
        let request = InvocationRequest {
            prompt,
            working_dir: working_dir.to_path_buf(),
            permission_socket: permission_socket.map(|p| p.to_path_buf()),
            timeout,
        };
        match self
            .invoker
            .invoke(request, events.cloned(), cancel.clone())
            .await
        {
            Ok(result) => parse_review_result(&result.assistant_text)
                .map(|r| r.issues)
                .unwrap_or_default(),
            Err(_) => vec![ReviewIssue {
                file: String::new(),
                line: None,
                severity: crate::status::Severity::High,
                description: format!("review agent '{}' invocation failed", agent.name),
                suggestion: None,
            }],
        }
    }
}

/// Aggregate pass = no agent returned a non-empty issue list.
pub fn aggregate_pass(issues: &[ReviewIssue]) -> bool {
    issues.is_empty()
}

/// Build a human-readable pending-issues report for the remediation
/// prompt fed back through the main loop.
pub fn remediation_report(issues: &[ReviewIssue]) -> Vec<String> {
    issues
        .iter()
        .map(|issue| {
            let location = match issue.line {
                Some(line) => format!("{}:{}", issue.file, line),
                None => issue.file.clone(),
            };
            format!("[{:?}] {location}: {}", issue.severity, issue.description)
        })
        .collect()
}
