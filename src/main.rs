use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use taskvault::api::{create_api_router, AppState};
use taskvault::backup::{
    open_pool, BackupListFilter, BackupService, CreateBackupOptions, ProgressTracker,
    SqliteBackupStore,
};
use taskvault::config::Settings;
use taskvault::schedule::{BackupScheduler, ScheduleStore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "taskvault")]
#[command(about = "Backup and restore subsystem for the taskvault task-tracking server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the backup service: HTTP contract surface plus scheduler
    Serve {
        /// Override the configured HTTP port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Backup management commands
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Take a full backup now
    Full {
        #[arg(long)]
        name: Option<String>,
        /// Skip post-snapshot verification
        #[arg(long)]
        no_verify: bool,
        /// Write the artifact uncompressed
        #[arg(long)]
        no_compress: bool,
    },
    /// Take an incremental backup chained to a parent
    Incremental {
        /// Id of the completed parent backup
        #[arg(long)]
        parent: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// List catalogued backups
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Verify a backup artifact
    Verify { id: String },
    /// Apply every schedule's retention policy
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Commands::Serve { port } => serve(settings, port).await,
        Commands::Backup { command } => run_backup_command(settings, command).await,
    }
}

async fn build_components(
    settings: &Settings,
) -> Result<(Arc<BackupService>, Arc<ScheduleStore>, Arc<ProgressTracker>)> {
    let pool = open_pool(&settings.database_path).await?;
    let store = Arc::new(SqliteBackupStore::new(pool.clone()));
    let progress = Arc::new(ProgressTracker::new(settings.progress_retention_minutes));
    let service = Arc::new(BackupService::new(
        pool.clone(),
        store,
        Arc::clone(&progress),
        settings.backup_config(),
    ));
    service.initialize().await?;

    let schedules = Arc::new(ScheduleStore::new(pool));
    schedules.initialize().await?;

    Ok((service, schedules, progress))
}

async fn serve(settings: Settings, port: Option<u16>) -> Result<()> {
    let (service, schedules, progress) = build_components(&settings).await?;
    progress.spawn_eviction_sweep(settings.progress_sweep_seconds);

    let scheduler = Arc::new(BackupScheduler::new(
        Arc::clone(&service),
        Arc::clone(&schedules),
        settings.scheduler_settings(),
    ));
    if settings.scheduler_enabled {
        scheduler.start().await?;
    }

    let state = AppState {
        service,
        scheduler,
        schedules,
    };
    let router = create_api_router(state);

    let port = port.unwrap_or(settings.http_port);
    let addr = format!("0.0.0.0:{port}");
    info!(%addr, "Backup service listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_backup_command(settings: Settings, command: BackupCommands) -> Result<()> {
    let (service, schedules, _progress) = build_components(&settings).await?;

    match command {
        BackupCommands::Full {
            name,
            no_verify,
            no_compress,
        } => {
            let metadata = service
                .create_full_backup(CreateBackupOptions {
                    name,
                    compress: Some(!no_compress),
                    verify: Some(!no_verify),
                    ..Default::default()
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        BackupCommands::Incremental { parent, name } => {
            let metadata = service
                .create_incremental_backup(CreateBackupOptions {
                    name,
                    parent_backup_id: Some(parent),
                    ..Default::default()
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        BackupCommands::List { limit } => {
            let backups = service
                .list_backups(&BackupListFilter {
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            for backup in backups {
                println!(
                    "{}  {:<12} {:<11} {:>10}  {}",
                    backup.created_at.format("%Y-%m-%d %H:%M:%S"),
                    backup.backup_type.as_str(),
                    backup.status.as_str(),
                    backup.size_bytes,
                    backup.id
                );
            }
        }
        BackupCommands::Verify { id } => {
            let report = service.verify_backup(&id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(1);
            }
        }
        BackupCommands::Cleanup => {
            let scheduler =
                BackupScheduler::new(service, schedules, settings.scheduler_settings());
            let deleted = scheduler.cleanup_old_backups().await?;
            println!("deleted {deleted} backup(s)");
        }
    }
    Ok(())
}
