use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "Kanban-driven daemon for an external code-generation CLI")]
pub struct Cli {
    /// Directory holding kiln state (config, database, logs)
    #[arg(long, default_value = ".kiln", global = true)]
    pub kiln_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the daemon
    Run,
    /// List run logs, or print the latest one for an issue
    Logs {
        /// Restrict to a single issue number
        #[arg(long)]
        issue: Option<u64>,
        /// Lines to print from the end of the latest log
        #[arg(long, default_value = "40")]
        tail: usize,
    },
    /// Apply the reset label to an issue (host/owner/repo#N)
    Reset { issue: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    kiln::logging::init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run => cmd::run::execute(&cli.kiln_dir).await,
        Commands::Logs { issue, tail } => cmd::logs::execute(&cli.kiln_dir, issue, tail),
        Commands::Reset { issue } => cmd::reset::execute(&cli.kiln_dir, &issue).await,
    }
}
