mod config;
mod discover_cmd;
mod init_cmd;
mod run_cmd;
mod setup;
mod status_cmd;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use drover_db::pool;

use config::DroverConfig;

#[derive(Parser)]
#[command(
    name = "drover",
    version,
    about = "Discover, classify, schedule and execute agent tasks on local runners"
)]
struct Cli {
    /// Database URL (overrides DROVER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Config file (overrides DROVER_CONFIG env var)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file and create the state store
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run one discovery and classification pass without executing anything
    Discover,
    /// Show task counts, runners, health and adaptations
    Status {
        /// How many failed tasks and adaptations to list
        #[arg(long, default_value_t = 10)]
        recent: i64,
    },
    /// Run the orchestration loop
    Run {
        /// Stop after this many tasks reach an outcome
        #[arg(long, conflicts_with = "single")]
        max: Option<usize>,
        /// Process a single task (same as --max 1)
        #[arg(long)]
        single: bool,
        /// Stop after a cycle that dispatched nothing
        #[arg(long)]
        stop_on_empty: bool,
    },
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            init_cmd::run_init(cli.config.as_deref(), cli.database_url.as_deref(), force).await?;
        }
        Commands::Discover => {
            let resolved = DroverConfig::resolve(cli.config.as_deref(), cli.database_url.as_deref())?;
            let db_pool = pool::open(&resolved.db_config).await?;
            let result = discover_cmd::run_discover(&db_pool, &resolved.file).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { recent } => {
            let resolved = DroverConfig::resolve(cli.config.as_deref(), cli.database_url.as_deref())?;
            let db_pool = pool::open(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, recent).await;
            db_pool.close().await;
            result?;
        }
        Commands::Run {
            max,
            single,
            stop_on_empty,
        } => {
            let resolved = DroverConfig::resolve(cli.config.as_deref(), cli.database_url.as_deref())?;
            let db_pool = pool::open(&resolved.db_config).await?;
            let limits = run_cmd::limits(max, single, stop_on_empty);
            let result = run_cmd::run(&db_pool, &resolved.file, limits).await;
            db_pool.close().await;
            result?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "drover", &mut std::io::stdout());
        }
    }

    Ok(())
}
