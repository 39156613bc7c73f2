#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use clap::{Parser, Subcommand};

/// mehrhof -- drive an AI coding agent through a disciplined workflow:
/// register a task, plan it, implement it, quality-gate it, merge it.
#[derive(Parser)]
#[command(name = "mh", version, about)]
struct Cli {
    /// Agent to use for every step (overrides config and frontmatter).
    #[arg(long, global = true)]
    agent: Option<String>,

    /// Per-step agent override, repeatable (e.g. `--step-agent planning=codex`).
    #[arg(long = "step-agent", global = true, value_name = "STEP=AGENT")]
    step_agents: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a task from a reference (`file:task.md`, `dir:tasks/`, ...).
    Start {
        reference: String,
        /// Stay on the current branch instead of creating a task branch.
        #[arg(long)]
        no_branch: bool,
        /// Run the task in a linked worktree (implies a task branch).
        #[arg(long)]
        worktree: bool,
    },

    /// Run the planning agent; writes numbered specifications.
    Plan,

    /// Run the implementing agent against the working tree.
    Implement {
        /// Refuse agent file writes; show what would happen.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the external review tool and record a review artifact.
    Review {
        /// Review command to run (default: `coderabbit review`).
        #[arg(long)]
        tool: Option<String>,
    },

    /// Append a note to the task (answers a pending question, if any).
    Note {
        #[arg(required = true)]
        message: Vec<String>,
    },

    /// Answer the pending question and resume the interrupted step.
    Answer {
        #[arg(required = true)]
        message: Vec<String>,
    },

    /// Ask the dialogue agent a question about the task.
    Dialogue {
        #[arg(required = true)]
        message: Vec<String>,
    },

    /// Reset the working tree to the previous checkpoint.
    Undo,

    /// Move forward one checkpoint.
    Redo,

    /// Run the quality command (default: `make quality`).
    Quality {
        #[arg(long)]
        target: Option<String>,
    },

    /// Quality-gate, then squash-merge or open a pull request.
    Finish {
        /// Skip the quality gate.
        #[arg(long)]
        no_quality: bool,
        /// Create a pull request instead of merging locally.
        #[arg(long)]
        pr: bool,
        /// Open the pull request as a draft.
        #[arg(long)]
        draft: bool,
        /// Keep the task branch after merging.
        #[arg(long)]
        keep_branch: bool,
        /// Push the target branch after merging.
        #[arg(long)]
        push: bool,
        /// Merge target (default: the branch the task was started from).
        #[arg(long)]
        target_branch: Option<String>,
    },

    /// Drop the task: branch, worktree, work directory.
    Abandon {
        #[arg(long)]
        keep_work: bool,
        #[arg(long)]
        keep_branch: bool,
    },

    /// Run the full cycle unattended: start, plan, implement, quality
    /// (with retries), finish.
    Auto {
        reference: String,
        /// Implementation retries after quality failures.
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        #[arg(long)]
        skip_quality: bool,
        #[arg(long)]
        worktree: bool,
        #[arg(long)]
        keep_branch: bool,
        #[arg(long)]
        push: bool,
        #[arg(long)]
        target_branch: Option<String>,
        #[arg(long)]
        quality_target: Option<String>,
    },

    /// Show the active task.
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match commands::run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}
