//! Workhorse maintenance CLI.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "workhorse")]
#[command(about = "Workhorse job worker maintenance", long_about = None)]
struct Cli {
    /// Database connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the database schema and triggers
    Migrate,
    /// Purge stale workers and old jobs
    Cleanup {
        #[command(subcommand)]
        command: CleanupCommands,
    },
}

#[derive(Subcommand)]
enum CleanupCommands {
    /// Delete workers whose heartbeat is older than the threshold.
    /// Their executing jobs are released back to pending.
    Workers {
        /// Heartbeat age threshold in seconds
        #[arg(long, default_value = "3600")]
        older_than: u64,
    },
    /// Delete jobs enqueued more than the threshold ago
    Jobs {
        /// Job age threshold in seconds
        #[arg(long, default_value = "172800")]
        older_than: u64,
        /// Restrict to these statuses (comma separated:
        /// pending, executing, completed, failed, discarded)
        #[arg(long, value_delimiter = ',')]
        status: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let pool = workhorse_db::create_pool(&cli.database_url).await?;

    match cli.command {
        Commands::Migrate => {
            commands::migrate(&pool).await?;
        }
        Commands::Cleanup { command } => match command {
            CleanupCommands::Workers { older_than } => {
                commands::cleanup_workers(&pool, older_than).await?;
            }
            CleanupCommands::Jobs { older_than, status } => {
                commands::cleanup_jobs(&pool, older_than, &status).await?;
            }
        },
    }

    Ok(())
}
