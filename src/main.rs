use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tasker::checkpoint::OrphanDecision;
use tasker::config::{CliOverrides, Config};
use tasker::errors::{EXIT_OK, diagnostic_line};

mod cmd;

#[derive(Parser)]
#[command(name = "tasker")]
#[command(version, about = "Durable task orchestration state for multi-agent runs")]
pub struct Cli {
    /// Log to stderr as well as the log file
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Directory holding state.json, task definitions and bundles
    #[arg(long, global = true)]
    pub planning_dir: Option<PathBuf>,

    /// Seconds to wait for the state lock
    #[arg(long, global = true)]
    pub lock_timeout: Option<u64>,

    /// Largest batch a checkpoint may hold
    #[arg(long, global = true)]
    pub max_parallel: Option<usize>,

    /// tracing filter directive, e.g. "info" or "tasker=debug"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new session document
    Init {
        /// Directory the tasks operate on (defaults to target_dir from config)
        target_dir: Option<String>,
    },
    /// Load and inspect task definitions
    Tasks {
        #[command(subcommand)]
        command: TasksCommands,
    },
    /// List tasks whose dependencies are satisfied
    Ready,
    /// Drive a single task through its lifecycle
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Record a verification verdict for a task
    Verify {
        id: String,
        #[arg(long)]
        verdict: String,
        /// Per-criterion score as name=pass|partial|fail (repeatable)
        #[arg(long = "criterion")]
        criteria: Vec<String>,
    },
    /// Manage the in-flight batch checkpoint
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Reconcile after a crash
    Recover {
        #[command(subcommand)]
        command: Option<RecoverCommands>,
    },
    /// Dependency graph checks
    Graph {
        #[command(subcommand)]
        command: GraphCommands,
    },
    /// Show aggregate session status
    Status,
    /// Workflow phase control
    Phase {
        #[command(subcommand)]
        command: PhaseCommands,
    },
    /// Cooperative halt control
    Halt {
        #[command(subcommand)]
        command: HaltCommands,
    },
    /// Usage accounting
    Tokens {
        #[command(subcommand)]
        command: TokensCommands,
    },
    /// Execution bundles and integrity checks
    Bundle {
        #[command(subcommand)]
        command: BundleCommands,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TasksCommands {
    /// Validate and merge task definitions into the document
    Load {
        /// Directory of definitions (defaults to <planning-dir>/tasks)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List every task with its status and phase
    List,
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    /// Show one task in full
    Show { id: String },
    /// Mark a task running
    Start { id: String },
    /// Mark a running task complete
    Complete {
        id: String,
        #[arg(long = "created")]
        created: Vec<String>,
        #[arg(long = "modified")]
        modified: Vec<String>,
    },
    /// Mark a running task failed and roll back its files
    Fail {
        id: String,
        #[arg(long)]
        message: String,
        #[arg(long, default_value = "execution")]
        category: String,
        /// Record the failure as not retryable
        #[arg(long)]
        no_retry: bool,
        #[arg(long = "created")]
        created: Vec<String>,
        #[arg(long = "modified")]
        modified: Vec<String>,
    },
    /// Reset a failed task to pending
    Retry {
        id: String,
        /// Retry even if the failure was marked non-retryable
        #[arg(long)]
        force: bool,
    },
    /// Skip a task; dependents treat it as done
    Skip {
        id: String,
        #[arg(long, default_value = "skipped by operator")]
        reason: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum CheckpointCommands {
    /// Record a batch and start every task in it
    Create {
        #[arg(required = true)]
        tasks: Vec<String>,
    },
    /// Apply a worker's result file to its checkpoint slot
    #[command(alias = "update")]
    Report {
        id: String,
        /// Result file (defaults to <planning-dir>/bundles/<id>-result.json)
        #[arg(long)]
        result: Option<PathBuf>,
    },
    /// Reconcile settled slots and clear the checkpoint
    Complete,
    /// Show the active checkpoint
    Inspect,
    /// Drop the checkpoint
    Clear {
        /// Clear even while slots are pending
        #[arg(long)]
        force: bool,
    },
    /// Decide what happens to an orphaned task
    Resolve {
        id: String,
        #[arg(long, value_enum)]
        decision: OrphanDecision,
    },
}

#[derive(Subcommand, Clone)]
pub enum RecoverCommands {
    /// Reconcile the active checkpoint and report orphans
    Checkpoint,
    /// Restore a damaged document from its journal
    State,
}

#[derive(Subcommand, Clone)]
pub enum GraphCommands {
    /// Check for cycles, unknown dependencies and steel-thread violations
    Validate {
        /// Validate the tasks already in the document instead of the definition files
        #[arg(long)]
        document: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum PhaseCommands {
    /// Show the current workflow phase
    Show,
    /// Move to the next workflow phase
    Advance,
}

#[derive(Subcommand, Clone)]
pub enum HaltCommands {
    /// Ask the coordinator to stop dispatching
    Request {
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "operator")]
        by: String,
    },
    /// Print "halted" or "running"
    Check,
    /// Confirm the halt once the active batch has settled
    Confirm,
    /// Clear the halt flag
    Resume,
}

#[derive(Subcommand, Clone)]
pub enum TokensCommands {
    /// Add token usage for a task
    Log {
        id: String,
        #[arg(long, default_value = "0")]
        input: u64,
        #[arg(long, default_value = "0")]
        output: u64,
        #[arg(long, default_value = "0")]
        cost: f64,
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum BundleCommands {
    /// Write the execution bundle for a task
    Prepare { id: String },
    /// Check a bundle's dependency checksums before dispatch
    Check { id: String },
    /// List bundles on disk
    List,
    /// Remove bundles of finished tasks
    Clean {
        /// Remove every bundle and result file
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show,
    /// Write a default tasker.toml
    Init,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            let (line, code) = diagnostic_line(&err);
            eprintln!("{}", line);
            code
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    let overrides = CliOverrides {
        planning_dir: cli.planning_dir.clone(),
        lock_timeout_secs: cli.lock_timeout,
        max_parallel: cli.max_parallel,
        log_level: cli.log_level.clone(),
    };
    let config = Config::resolve(&overrides)?;
    // Held until return so the file writer flushes.
    let _guard = tasker::logging::init(&config.log_dir(), &config.log_level, cli.verbose);
    for warning in &config.warnings {
        tracing::warn!("{}", warning);
    }
    tracing::debug!(command = ?std::env::args().nth(1), planning_dir = %config.planning_dir.display(), "starting");

    let out = cmd::Output::new(cli.json);
    match &cli.command {
        Commands::Init { target_dir } => cmd::cmd_init(&config, &out, target_dir.as_deref())?,
        Commands::Tasks { command } => cmd::cmd_tasks(&config, &out, command)?,
        Commands::Ready => cmd::cmd_ready(&config, &out)?,
        Commands::Task { command } => cmd::cmd_task(&config, &out, command)?,
        Commands::Verify {
            id,
            verdict,
            criteria,
        } => cmd::cmd_verify(&config, &out, id, verdict, criteria)?,
        Commands::Checkpoint { command } => cmd::cmd_checkpoint(&config, &out, command)?,
        Commands::Recover { command } => cmd::cmd_recover(&config, &out, command.as_ref())?,
        Commands::Graph { command } => cmd::cmd_graph(&config, &out, command)?,
        Commands::Status => cmd::cmd_status(&config, &out)?,
        Commands::Phase { command } => cmd::cmd_phase(&config, &out, command)?,
        Commands::Halt { command } => cmd::cmd_halt(&config, &out, command)?,
        Commands::Tokens { command } => cmd::cmd_tokens(&config, &out, command)?,
        Commands::Bundle { command } => cmd::cmd_bundle(&config, &out, command)?,
        Commands::Config { command } => cmd::cmd_config(&config, &out, command.as_ref())?,
    }
    Ok(())
}
