mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, queue::QueueSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tollgate",
    about = "Reconcile ticket readiness from agent evidence and run serialized gate jobs",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from agents/ or .git/)
    #[arg(long, global = true, env = "TOLLGATE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute effective ticket status and write the readiness snapshot
    Reconcile {
        /// Snapshot date, YYYY-MM-DD (default: today, UTC)
        #[arg(long)]
        date: Option<String>,
    },

    /// Enqueue, run, and inspect gate jobs
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Enqueue MERGE gate jobs for READY_FOR_MERGE tickets
    QueueMergeReady(cmd::merge_ready::MergeReadyArgs),

    /// Inspect the gate configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Queue {
            subcommand: QueueSubcommand::RunNext { .. } | QueueSubcommand::RunLoop { .. },
        } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Reconcile { date } => cmd::reconcile::run(&root, date.as_deref(), cli.json),
        Commands::Queue { subcommand } => cmd::queue::run(&root, subcommand, cli.json),
        Commands::QueueMergeReady(args) => cmd::merge_ready::run(&root, args, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}
