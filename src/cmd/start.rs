//! `start <work-item>`: resolve configuration, stand up the permission
//! broker (unless `--dangerously-skip-permissions`), and drive the
//! orchestration loop to completion.

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

pub struct StartArgs {
    pub work_item: String,
    pub dir: Option<PathBuf>,
    pub max_iterations: Option<u32>,
    pub stagnation_limit: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub skip_review: bool,
    pub review_only: bool,
    pub dangerously_skip_permissions: bool,
    pub allow: Vec<String>,
    /// Tighten the permission posture: ignore the config-layer
    /// `pre_allowed` list so every non-cached, non-persisted request
    /// reaches the interactive handler (Open Question decision, see
    /// DESIGN.md).
    pub guard: bool,
    pub verbose: bool,
}

pub async fn cmd_start(args: StartArgs) -> Result<LoopResult> {
    let project_dir = resolve_dir(args.dir.clone())?;

    let cli_overrides = CliOverrides {
        max_iterations: args.max_iterations,
        stagnation_limit: args.stagnation_limit,
        timeout_secs: args.timeout_secs,
        skip_review: Some(args.skip_review),
        allow: args.allow.clone(),
    };
    let mut effective = config::resolve(&project_dir, cli_overrides)
        .context("failed to resolve effective configuration")?;
    if args.guard {
        effective.pre_allowed.clear();
    }

    let log_path = logging::log_file_path(&effective.state_dir, &args.work_item);
    let _logging_guard = logging::init(Some(&log_path), args.verbose)
        .context("failed to initialize logging")?;

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
        skip_review: args.skip_review,
        review_only: args.review_only,
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

pub fn resolve_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(d) => Ok(d),
        None => std::env::current_dir().context("failed to resolve current directory"),
    }
}
