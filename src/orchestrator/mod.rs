//! Orchestration loop (component H): the top-level driver that composes
//! the work-item store, safety state, permission broker, agent invoker,
//! prompt assembler, status parser, and review sub-loop into a bounded,
//! interruptible iteration driver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventSender, StateSnapshot};
use crate::invoker::{AgentInvoker, InvocationRequest};
use crate::prompt::{self, PromptContext, PromptTemplates, ReviewContext};
use crate::review::{aggregate_pass, remediation_report, ReviewConfig, ReviewLoop};
use crate::safety::{ExitReason, SafetyConfig, SafetyState, TokenUsage};
use crate::status::{parse_status_block, StatusBlock, StatusKind};
use crate::workitem::{phase_names_match, WorkItem, WorkItemStore};

#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    pub safety: SafetyConfig,
    pub review: ReviewConfig,
    pub skip_review: bool,
    pub review_only: bool,
}

#[derive(Debug, Clone)]
pub struct LoopResult {
    pub exit_reason: ExitReason,
    pub exit_message: String,
    pub iterations: u32,
    pub duration: Duration,
    pub total_files_changed: Vec<String>,
    pub final_status: Option<StatusBlock>,
    pub recent_summaries: Vec<String>,
    pub token_totals: HashMap<String, TokenUsage>,
}

/// Pause/Stop latch shared across tasks; safe to call `toggle_pause`/
/// `stop` from any task, checked only between iterations (never mid
/// invocation).
#[derive(Clone)]
pub struct LoopControl {
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl LoopControl {
    pub fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn toggle_pause(&self) {
        self.paused.fetch_xor(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Default for LoopControl {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrchestrationLoop {
    store: Arc<dyn WorkItemStore>,
    work_item_id: String,
    working_dir: PathBuf,
    permission_socket: Option<PathBuf>,
    invoker: Arc<AgentInvoker>,
    review_loop: ReviewLoop,
    templates: PromptTemplates,
    config: OrchestrationConfig,
    control: LoopControl,
    events: Option<EventSender>,
}

impl OrchestrationLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        work_item_id: String,
        working_dir: PathBuf,
        permission_socket: Option<PathBuf>,
        invoker: Arc<AgentInvoker>,
        templates: PromptTemplates,
        config: OrchestrationConfig,
        control: LoopControl,
        events: Option<EventSender>,
    ) -> Self {
        let review_loop = ReviewLoop::new(invoker.clone(), templates.clone());
        Self {
            store,
            work_item_id,
            working_dir,
            permission_socket,
            invoker,
            review_loop,
            templates,
            config,
            control,
            events,
        }
    }

    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    async fn wait_while_paused(&self) {
        while self.control.is_paused() && !self.control.cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn snapshot(&self, safety: &SafetyState, phase: Option<&str>) {
        if let Some(tx) = &self.events {
            let snapshot = StateSnapshot {
                iteration: safety.iteration,
                phase: phase.map(|s| s.to_string()),
                no_change_streak: safety.no_change_streak,
                error_streak: safety.error_streak,
                total_files_changed: safety.total_files_changed.len(),
                in_review: safety.in_review,
                review_iterations: safety.review_iterations,
                token_totals: safety.token_totals.clone(),
            };
            let _ = tx.send(Event::Snapshot(snapshot)).await;
        }
    }

    fn finish(
        &self,
        safety: &SafetyState,
        reason: ExitReason,
        message: impl Into<String>,
        final_status: Option<StatusBlock>,
        recent_summaries: &[String],
    ) -> LoopResult {
        LoopResult {
            exit_reason: reason,
            exit_message: message.into(),
            iterations: safety.iteration,
            duration: safety.elapsed(),
            total_files_changed: safety.total_files_changed.iter().cloned().collect(),
            final_status,
            recent_summaries: recent_summaries.to_vec(),
            token_totals: safety.token_totals.clone(),
        }
    }

    /// Run the full orchestration loop to completion (or exit).
    pub async fn run(&mut self) -> LoopResult {
        let mut safety = SafetyState::new();
        let mut recent_summaries: Vec<String> = Vec::new();
        let mut last_status: Option<StatusBlock> = None;
        let mut review_context: Option<ReviewContext> = None;

        if self.config.review_only {
            return self
                .enter_review(&mut safety, &mut recent_summaries)
                .await;
        }

        loop {
            if let Some(reason) = safety.check(&self.config.safety) {
                return self.finish(
                    &safety,
                    reason,
                    format!("exit condition '{}' reached", reason.as_str()),
                    last_status,
                    &recent_summaries,
                );
            }
            self.wait_while_paused().await;
            if self.control.cancel.is_cancelled() {
                return self.finish(
                    &safety,
                    ExitReason::UserInterrupt,
                    "stopped by user",
                    last_status,
                    &recent_summaries,
                );
            }

            let work_item = match self.store.get(&self.work_item_id) {
                Ok(item) => item,
                Err(e) => {
                    safety.record_iteration(&[]);
                    safety.record_error(Some(&e.to_string()));
                    recent_summaries.push(format!("error: {e}"));
                    continue;
                }
            };
            let current_phase = work_item.current_phase().map(|p| p.name.as_str());

            if let Some(tx) = &self.events {
                let _ = tx.send(Event::IterationStart {
                    iteration: safety.iteration + 1,
                })
                .await;
            }

            let ctx = PromptContext {
                work_item: &work_item,
                phase: current_phase,
                iteration: safety.iteration + 1,
                recent_summaries: &recent_summaries,
                review: review_context.as_ref(),
            };
            let prompt = prompt::assemble(&ctx, &self.templates);

            let request = InvocationRequest {
                prompt,
                working_dir: self.working_dir.clone(),
                permission_socket: self.permission_socket.clone(),
                timeout: Some(self.config.safety.timeout),
            };

            let invocation = self
                .invoker
                .invoke(
                    request,
                    self.events.clone(),
                    self.control.cancellation_token(),
                )
                .await;

            let (status, model, token_usage, iteration_error) = match invocation {
                Ok(result) => {
                    let status = parse_status_block(&result.assistant_text);
                    (status, result.model, result.token_usage, None)
                }
                Err(e) => {
                    let synthetic = StatusBlock {
                        status: StatusKind::Blocked,
                        phase: current_phase.map(|s| s.to_string()),
                        summary: e.to_string(),
                        files_changed: Vec::new(),
                        next_action: String::new(),
                        synthetic: true,
                    };
                    (synthetic, None, HashMap::new(), Some(e.to_string()))
                }
            };

            safety.record_iteration(&status.files_changed);
            let error_for_streak = iteration_error
                .as_deref()
                .or(status.synthetic.then_some(status.summary.as_str()));
            safety.record_error(error_for_streak);
            for (model_name, usage) in &token_usage {
                safety.record_turn_tokens(usage.input_tokens, usage.output_tokens);
                safety.absorb_live_tokens(model_name);
            }
            if token_usage.is_empty() {
                safety.absorb_live_tokens(model.as_deref().unwrap_or("unknown"));
            }

            recent_summaries.push(status.summary.clone());
            last_status = Some(status.clone());
            if let Some(tx) = &self.events {
                let _ = tx.send(Event::Status(status.clone())).await;
                let _ = tx.send(Event::IterationEnd {
                    iteration: safety.iteration,
                    error: iteration_error.clone(),
                })
                .await;
            }
            self.snapshot(&safety, current_phase).await;

            if let Some(reason) = safety.check(&self.config.safety) {
                return self.finish(
                    &safety,
                    reason,
                    format!("exit condition '{}' reached", reason.as_str()),
                    last_status,
                    &recent_summaries,
                );
            }

            match status.status {
                StatusKind::Continue => continue,
                StatusKind::Blocked => {
                    return self.finish(
                        &safety,
                        ExitReason::Blocked,
                        status.summary.clone(),
                        last_status,
                        &recent_summaries,
                    );
                }
                StatusKind::Done => {
                    let phase_to_mark = status.phase.as_deref().or(current_phase);
                    if let Some(phase_name) = phase_to_mark {
                        if let Err(e) = self.store.update_phase(&self.work_item_id, phase_name) {
                            recent_summaries.push(format!("phase update error: {e}"));
                        }
                    }
                    let refreshed = self.store.get(&self.work_item_id).unwrap_or(work_item);
                    if refreshed.is_phaseless() || refreshed.all_complete() {
                        if self.config.review.enabled && !self.config.skip_review {
                            return self
                                .enter_review(&mut safety, &mut recent_summaries)
                                .await;
                        }
                        return self.finish(
                            &safety,
                            ExitReason::Complete,
                            "all phases complete",
                            last_status,
                            &recent_summaries,
                        );
                    }
                    review_context = None;
                    continue;
                }
                StatusKind::ReviewPass | StatusKind::ReviewFail => continue,
            }
        }
    }

    async fn enter_review(
        &mut self,
        safety: &mut SafetyState,
        recent_summaries: &mut Vec<String>,
    ) -> LoopResult {
        safety.enter_review();
        let mut last_status: Option<StatusBlock> = None;

        loop {
            if let Some(reason) = safety.check(&self.config.safety) {
                return self.finish(
                    safety,
                    reason,
                    "max review retries reached",
                    last_status,
                    recent_summaries,
                );
            }
            self.wait_while_paused().await;
            if self.control.cancel.is_cancelled() {
                return self.finish(
                    safety,
                    ExitReason::UserInterrupt,
                    "stopped by user",
                    last_status,
                    recent_summaries,
                );
            }

            let work_item = match self.store.get(&self.work_item_id) {
                Ok(item) => item,
                Err(e) => {
                    return self.finish(
                        safety,
                        ExitReason::Blocked,
                        format!("failed to load work item for review: {e}"),
                        last_status,
                        recent_summaries,
                    );
                }
            };

            safety.record_review_iteration();
            let issues = self
                .review_loop
                .run_iteration(
                    &self.config.review,
                    &work_item,
                    &self.working_dir,
                    self.permission_socket.as_deref(),
                    Some(self.config.safety.timeout),
                    self.events.as_ref(),
                    &self.control.cancellation_token(),
                )
                .await;

            if aggregate_pass(&issues) {
                return self.finish(
                    safety,
                    ExitReason::Complete,
                    "review passed",
                    last_status,
                    recent_summaries,
                );
            }

            if safety.review_iterations >= self.config.safety.max_review_iterations {
                return self.finish(
                    safety,
                    ExitReason::MaxReviewRetries,
                    format!("review failed with {} issue(s) remaining", issues.len()),
                    last_status,
                    recent_summaries,
                );
            }

            let report = remediation_report(&issues);
            let ctx = PromptContext {
                work_item: &work_item,
                phase: None,
                iteration: safety.iteration + 1,
                recent_summaries,
                review: Some(&ReviewContext {
                    pending_issues: report.clone(),
                }),
            };
            let remediation_prompt = prompt::assemble(&ctx, &self.templates);
            let request = InvocationRequest {
                prompt: remediation_prompt,
                working_dir: self.working_dir.clone(),
                permission_socket: self.permission_socket.clone(),
                timeout: Some(self.config.safety.timeout),
            };
            match self
                .invoker
                .invoke(
                    request,
                    self.events.clone(),
                    self.control.cancellation_token(),
                )
                .await
            {
                Ok(result) => {
                    let status = parse_status_block(&result.assistant_text);
                    safety.record_iteration(&status.files_changed);
                    recent_summaries.push(status.summary.clone());
                    last_status = Some(status);
                }
                Err(e) => {
                    safety.record_iteration(&[]);
                    safety.record_error(Some(&e.to_string()));
                    recent_summaries.push(format!("remediation error: {e}"));
                }
            }
        }
    }
}

/// Determine whether the agent's reported phase (or, absent that, the
/// current phase) matches the work-item's current phase, for callers
/// that need this check outside the loop (e.g. tests and the review
/// integration).
pub fn reported_phase_matches_current(reported: Option<&str>, work_item: &WorkItem) -> bool {
    let Some(current) = work_item.current_phase() else {
        return reported.is_none();
    };
    match reported {
        Some(name) => phase_names_match(name, &current.name),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_control_toggle_pause_flips_state() {
        let control = LoopControl::new();
        assert!(!control.is_paused());
        control.toggle_pause();
        assert!(control.is_paused());
        control.toggle_pause();
        assert!(!control.is_paused());
    }

    #[test]
    fn loop_control_stop_trips_cancellation() {
        let control = LoopControl::new();
        assert!(!control.cancellation_token().is_cancelled());
        control.stop();
        assert!(control.cancellation_token().is_cancelled());
    }
}
