use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cmd;

#[derive(Parser)]
#[command(name = "nebula")]
#[command(version, about = "Run coder/reviewer phases of a nebula in dependency waves")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Nebula directory holding nebula.toml and the phase files
    #[arg(short, long, global = true, default_value = ".", env = "NEBULA_DIR")]
    pub dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build and preview the execution plan
    Plan {
        /// Save the plan to .nebula/plan.json
        #[arg(long)]
        save: bool,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run every phase of the nebula
    Apply {
        /// Maximum phases in flight
        #[arg(long)]
        max_workers: Option<usize>,
        /// Show the plan without running anything
        #[arg(long)]
        dry_run: bool,
        /// Never open gates
        #[arg(long)]
        yes: bool,
        /// Run despite error-level plan risks or a stale saved plan
        #[arg(long)]
        force: bool,
        /// Forget phases completed by earlier runs
        #[arg(long)]
        fresh: bool,
    },
    /// Run a single coder/reviewer loop outside any nebula
    Task {
        description: String,
        #[arg(long, default_value = "3")]
        max_cycles: u32,
        /// Cost ceiling in USD; 0 means unlimited
        #[arg(long, default_value = "5.0")]
        budget: f64,
    },
    /// Pause dispatch of new phases
    Pause,
    /// Resume dispatch
    Resume,
    /// Let in-flight phases finish, then stop
    Stop,
    /// Run a failed phase again
    Retry { phase: String },
    /// Show recorded phase status and pending interventions
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose, &cli.dir);

    match &cli.command {
        Commands::Plan { save, json } => cmd::cmd_plan(&cli, *save, *json)?,
        Commands::Apply {
            max_workers,
            dry_run,
            yes,
            force,
            fresh,
        } => {
            let options = cmd::ApplyOptions {
                max_workers: *max_workers,
                dry_run: *dry_run,
                yes: *yes,
                force: *force,
                fresh: *fresh,
            };
            cmd::cmd_apply(&cli, options).await?;
        }
        Commands::Task {
            description,
            max_cycles,
            budget,
        } => cmd::cmd_task(&cli, description, *max_cycles, *budget).await?,
        Commands::Pause => cmd::cmd_pause(&cli)?,
        Commands::Resume => cmd::cmd_resume(&cli)?,
        Commands::Stop => cmd::cmd_stop(&cli)?,
        Commands::Retry { phase } => cmd::cmd_retry(&cli, phase)?,
        Commands::Status => cmd::cmd_status(&cli)?,
    }

    Ok(())
}

/// Console logs go to stderr, filtered by `NEBULA_LOG` (or `--verbose`).
/// When the nebula has a run-time directory, a daily JSON log is kept there too.
fn init_logging(verbose: bool, dir: &Path) -> Option<WorkerGuard> {
    let default = if verbose { "nebula=debug" } else { "nebula=warn" };
    let console_filter =
        EnvFilter::try_from_env("NEBULA_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let console = fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let log_dir = dir.join(nebula::config::RUNTIME_DIR).join("logs");
    let keep_file_log =
        dir.join(nebula::config::CONFIG_FILE).exists() && std::fs::create_dir_all(&log_dir).is_ok();
    let (file, guard) = if keep_file_log {
        let appender = tracing_appender::rolling::daily(&log_dir, "nebula.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(EnvFilter::new("nebula=debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry().with(console).with(file).init();
    guard
}
