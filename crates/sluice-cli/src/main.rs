//! Operational CLI: tenant-id migration, index rebuilds, source-config
//! seeding and DLQ inspection/replay.
//!
//! Exit codes: 0 success, 1 error, 2 dry-run detected drift.

mod commands;

use clap::{Parser, Subcommand};
use sqlx::mysql::MySqlPoolOptions;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Exit code for dry-runs that detected drift
pub const EXIT_DRIFT: u8 = 2;

#[derive(Parser)]
#[command(name = "sluice-cli", about = "Sluice gateway operations", version)]
struct Cli {
    /// MySQL connection URL (falls back to SLUICE_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy the legacy tenant_id column into org_id where org_id is unset
    MigrateOrgIdFromTenantId {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Drop legacy indexes and create the canonical set
    RebuildIndexes {
        /// Report missing/extra indexes without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Create one default event-source config per org that has none
    SeedEventSourceConfigs {
        /// Report orgs that would be seeded without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Dead-letter queue operations
    #[command(subcommand)]
    Dlq(DlqCommand),
}

#[derive(Subcommand)]
enum DlqCommand {
    /// Summarize DLQ contents by status and failure kind
    Stats,
    /// List entries, newest first
    List {
        /// Maximum entries to print
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Only entries with this status (queued, retrying, abandoned, replayed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one entry in full
    Show {
        /// DLQ entry id
        id: Uuid,
    },
    /// Queue an entry for immediate replay by the gateway's DLQ worker
    Replay {
        /// DLQ entry id
        id: Uuid,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let database_url = cli
        .database_url
        .or_else(|| std::env::var("SLUICE_DATABASE_URL").ok());
    let Some(database_url) = database_url else {
        eprintln!("error: no database URL (use --database-url or SLUICE_DATABASE_URL)");
        return ExitCode::from(1);
    };

    let pool = match MySqlPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("error: cannot connect to database: {e}");
            return ExitCode::from(1);
        },
    };

    let result = match cli.command {
        Command::MigrateOrgIdFromTenantId { dry_run } => {
            commands::migrate::org_id_from_tenant_id(&pool, dry_run).await
        },
        Command::RebuildIndexes { dry_run } => commands::indexes::rebuild(&pool, dry_run).await,
        Command::SeedEventSourceConfigs { dry_run } => {
            commands::seed::event_source_configs(&pool, dry_run).await
        },
        Command::Dlq(command) => match command {
            DlqCommand::Stats => commands::dlq::stats(&pool).await,
            DlqCommand::List { limit, status } => {
                commands::dlq::list(&pool, limit, status.as_deref()).await
            },
            DlqCommand::Show { id } => commands::dlq::show(&pool, id).await,
            DlqCommand::Replay { id } => commands::dlq::replay(&pool, id).await,
        },
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        },
    }
}
