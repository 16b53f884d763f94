//! CLI surface (component K): `clap`-derived command dispatch that
//! wires configuration (J) and logging (L) together before driving the
//! orchestration loop (H), the permission broker's lifecycle (C), and
//! the `hook` subcommand the agent spawns as its pre-tool-use hook.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use programmator::cmd::{self, logs::cmd_logs, review::ReviewArgs, start::StartArgs, status::cmd_status};
use programmator::safety::ExitReason;

#[derive(Parser)]
#[command(name = "programmator")]
#[command(version, about = "Autonomous supervisory loop for an interactive coding agent")]
struct Cli {
    /// Verbose logging (debug level); overridden by `RUST_LOG` if set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration loop over a work-item until it exits.
    Start {
        work_item: String,

        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(long = "max-iterations")]
        max_iterations: Option<u32>,

        #[arg(long = "stagnation-limit")]
        stagnation_limit: Option<u32>,

        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long = "skip-review")]
        skip_review: bool,

        #[arg(long = "review-only")]
        review_only: bool,

        #[arg(long = "dangerously-skip-permissions")]
        dangerously_skip_permissions: bool,

        /// Pre-allowed pattern (e.g. `Bash(git:*)`); repeatable.
        #[arg(long = "allow")]
        allow: Vec<String>,

        /// Ignore configured pre-allowed patterns, forcing every
        /// non-cached, non-persisted request through the interactive
        /// handler.
        #[arg(long)]
        guard: bool,
    },
    /// Enter review-only mode against the work-item already on disk.
    Review {
        work_item: String,

        #[arg(long)]
        base: Option<String>,

        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(long = "dangerously-skip-permissions")]
        dangerously_skip_permissions: bool,
    },
    /// Inspect the current run's session file.
    Status {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List (and optionally follow) progress-log files.
    Logs {
        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(long)]
        follow: bool,
    },
    /// Internal: the agent's pre-tool-use hook invokes this.
    Hook {
        #[arg(long)]
        socket: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Start {
            work_item,
            dir,
            max_iterations,
            stagnation_limit,
            timeout,
            skip_review,
            review_only,
            dangerously_skip_permissions,
            allow,
            guard,
        } => {
            let result = cmd::start::cmd_start(StartArgs {
                work_item,
                dir,
                max_iterations,
                stagnation_limit,
                timeout_secs: timeout,
                skip_review,
                review_only,
                dangerously_skip_permissions,
                allow,
                guard,
                verbose: cli.verbose,
            })
            .await?;
            report_and_exit_code(&result)
        }
        Commands::Review {
            work_item,
            base,
            dir,
            dangerously_skip_permissions,
        } => {
            let result = cmd::review::cmd_review(ReviewArgs {
                work_item,
                base,
                dir,
                dangerously_skip_permissions,
                verbose: cli.verbose,
            })
            .await?;
            report_and_exit_code(&result)
        }
        Commands::Status { dir } => {
            cmd_status(dir)?;
            0
        }
        Commands::Logs { dir, follow } => {
            cmd_logs(dir, follow)?;
            0
        }
        Commands::Hook { socket } => {
            let output = programmator::hook_cmd::run_from_stdin(&socket).await;
            println!("{output}");
            0
        }
    };

    std::process::exit(exit_code);
}

/// Print the loop's final summary and translate its exit-reason into a
/// process exit code: 0 on `complete`, nonzero otherwise.
fn report_and_exit_code(result: &programmator::orchestrator::LoopResult) -> i32 {
    println!(
        "exit: {} ({})",
        result.exit_reason.as_str(),
        result.exit_message
    );
    println!("iterations: {}", result.iterations);
    println!("duration: {:.1}s", result.duration.as_secs_f64());
    if !result.total_files_changed.is_empty() {
        println!("files changed:");
        for f in &result.total_files_changed {
            println!("  {f}");
        }
    }
    if matches!(
        result.exit_reason,
        ExitReason::Stagnation | ExitReason::MaxIterations
    ) && !result.recent_summaries.is_empty()
    {
        println!("recent summaries:");
        for s in result.recent_summaries.iter().rev().take(5).rev() {
            println!("  - {s}");
        }
    }
    for (model, usage) in &result.token_totals {
        println!(
            "tokens [{model}]: in={} out={}",
            usage.input_tokens, usage.output_tokens
        );
    }

    match result.exit_reason {
        ExitReason::Complete => 0,
        _ => 1,
    }
}
