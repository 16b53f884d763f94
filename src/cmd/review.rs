//! `review [--base BRANCH] [--dir DIR]`: review-only mode. The concrete
//! git-diff computation against `--base` is an external collaborator
//! (§1 names git-integration helpers out of scope); this command's
//! core-owned responsibility is entering the orchestration loop's REVIEW
//! state directly (`review_only = true`) against the work-item already
//! present in the project directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::broker::{self, DenyAllHandler, PermissionBroker};
use crate::config::{self, CliOverrides};
use crate::events::event_channel;
use crate::invoker::{AgentInvoker, InvokerConfig};
use crate::logging;
use crate::orchestrator::{LoopControl, LoopResult, OrchestrationConfig, OrchestrationLoop};
use crate::prompt::PromptTemplates;
use crate::session::{self, SessionInfo};
use crate::ui::{DialoguerPermissionHandler, OrchestratorUI};
use crate::workitem::DispatchingStore;

pub struct ReviewArgs {
    pub work_item: String,
    pub base: Option<String>,
    pub dir: Option<PathBuf>,
    pub dangerously_skip_permissions: bool,
    pub verbose: bool,
}

pub async fn cmd_review(args: ReviewArgs) -> Result<LoopResult> {
    let project_dir = super::start::resolve_dir(args.dir.clone())?;

    let effective = config::resolve(&project_dir, CliOverrides::default())
        .context("failed to resolve effective configuration")?;

    let log_path = logging::log_file_path(&effective.state_dir, &args.work_item);
    let _logging_guard = logging::init(Some(&log_path), args.verbose)
        .context("failed to initialize logging")?;
    if let Some(base) = &args.base {
        tracing::info!(base, "review requested against base branch");
    }

    session::write(
        &effective.state_dir,
        &SessionInfo::new(args.work_item.clone(), project_dir.clone()),
    )
    .context("failed to write session file")?;

    let store = Arc::new(DispatchingStore::new(
        effective.tickets_dir.clone(),
        "tk",
    ));

    let (events_tx, events_rx) = event_channel();
    let ui = OrchestratorUI::new(args.verbose);
    let ui_task = tokio::spawn(ui.drive(events_rx));

    let control = LoopControl::new();
    let mut permission_socket = None;
    let mut broker_task = None;
    if !args.dangerously_skip_permissions {
        let socket_path = broker::default_socket_path();
        let handler: Arc<dyn broker::PermissionHandler> = if console::user_attended() {
            Arc::new(DialoguerPermissionHandler::new())
        } else {
            Arc::new(DenyAllHandler)
        };
        let brk = Arc::new(PermissionBroker::new(
            socket_path.clone(),
            effective.pre_allowed.clone(),
            broker::default_project_allow_list(&project_dir),
            broker::default_global_allow_list(),
            handler,
        ));
        let cancel = control.cancellation_token();
        broker_task = Some(tokio::spawn(brk.serve(cancel)));
        permission_socket = Some(socket_path);
    }

    let invoker = Arc::new(AgentInvoker::new(InvokerConfig {
        agent_cmd: effective.agent_cmd.clone(),
        extra_flags: Vec::new(),
    }));
    let templates = PromptTemplates::load(&project_dir.join(".programmator/prompts"));

    let orchestration_config = OrchestrationConfig {
        safety: effective.safety.clone(),
        review: effective.review.clone(),
        skip_review: false,
        review_only: true,
    };

    let mut orchestrator = OrchestrationLoop::new(
        store,
        args.work_item.clone(),
        project_dir,
        permission_socket,
        invoker,
        templates,
        orchestration_config,
        control.clone(),
        Some(events_tx),
    );

    let result = orchestrator.run().await;

    control.stop();
    if let Some(handle) = broker_task {
        let _ = handle.await;
    }
    drop(orchestrator);
    let _ = ui_task.await;
    session::remove(&effective.state_dir);

    Ok(result)
}
