//! inkwell: digitize handwritten notebook pages.
//!
//! `inkwell worker` runs the processing pipeline; the other subcommands
//! submit pages and inspect what the pipeline produced.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use inkwell_core::defaults::DATABASE_URL;
use inkwell_core::{
    ExtractionBackend, JobQueue, KnowledgeUnitRepository, KnowledgeUnitType,
    ListKnowledgeUnitsRequest, ListPagesRequest, PageRepository, PageStatus, RetryPolicy,
    TagRepository,
};
use inkwell_db::{log_pool_metrics, Database, FilesystemBlobStore, PoolConfig, StorageConfig};
use inkwell_inference::OllamaExtractionBackend;
use inkwell_jobs::{PageProcessor, SubmissionConfig, SubmissionService, WorkerBuilder, WorkerConfig};

#[derive(Parser)]
#[command(name = "inkwell")]
#[command(author, version, about = "Handwritten notebook page digitizer")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the processing worker until interrupted
    Worker,

    /// Submit a page image for processing
    Submit {
        /// Image file (jpg, png, webp, heic)
        path: PathBuf,

        /// Poll until the page is completed or failed
        #[arg(short, long)]
        wait: bool,
    },

    /// Show a page's processing status
    Status { id: Uuid },

    /// Show a page with its knowledge units and tags
    Show { id: Uuid },

    /// List pages
    List {
        /// Only pages in this status (uploading, processing, completed, failed)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long)]
        limit: Option<i64>,

        #[arg(short, long)]
        offset: Option<i64>,
    },

    /// Delete a page, its knowledge units, tag links, and image
    Delete { id: Uuid },

    /// List tags, newest first
    Tags,

    /// List knowledge units across pages
    Units {
        /// Only units of this type (task, idea, note, question, action_item)
        #[arg(short = 't', long = "type")]
        unit_type: Option<String>,

        #[arg(short, long)]
        limit: Option<i64>,

        #[arg(short, long)]
        offset: Option<i64>,
    },

    /// List jobs that ran out of attempts
    DeadLetters {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },

    /// Apply pending database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let cli = Cli::parse();

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| DATABASE_URL.to_string());
    let db = Database::connect_with_config(
        &database_url,
        PoolConfig::from_env(),
        RetryPolicy::from_env(),
    )
    .await
    .context("connecting to database")?;

    match cli.command {
        Commands::Worker => run_worker(db).await,
        Commands::Submit { path, wait } => submit(db, &path, wait).await,
        Commands::Status { id } => {
            let status = db
                .pages
                .status(id)
                .await?
                .ok_or_else(|| anyhow!("Page {} not found", id))?;
            print_json(&status)
        }
        Commands::Show { id } => {
            let detail = db
                .page_detail(id)
                .await?
                .ok_or_else(|| anyhow!("Page {} not found", id))?;
            print_json(&detail)
        }
        Commands::List {
            status,
            limit,
            offset,
        } => {
            let status = status.map(|s| s.parse::<PageStatus>()).transpose()?;
            let pages = db
                .pages
                .list(ListPagesRequest {
                    status,
                    limit,
                    offset,
                })
                .await?;
            print_json(&pages)
        }
        Commands::Delete { id } => {
            let service = submission_service(&db)?;
            if !service.delete_page(id).await? {
                bail!("Page {} not found", id);
            }
            println!("Deleted page {}", id);
            Ok(())
        }
        Commands::Tags => print_json(&db.tags.list().await?),
        Commands::Units {
            unit_type,
            limit,
            offset,
        } => {
            let unit_type = unit_type
                .map(|t| t.parse::<KnowledgeUnitType>())
                .transpose()?;
            let units = db
                .knowledge_units
                .list(ListKnowledgeUnitsRequest {
                    unit_type,
                    limit,
                    offset,
                })
                .await?;
            print_json(&units)
        }
        Commands::DeadLetters { limit } => print_json(&db.jobs.list_dead(limit).await?),
        Commands::Migrate => {
            db.migrate().await?;
            info!("Database migrations complete");
            Ok(())
        }
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "inkwell=info,inkwell_jobs=debug,inkwell_db=info")
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "inkwell=info,inkwell_jobs=debug,inkwell_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = Path::new(path);
        let file_dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("inkwell.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            // No ANSI in files unless asked for.
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    tracing::debug!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}

fn blob_store() -> anyhow::Result<Arc<FilesystemBlobStore>> {
    let config = StorageConfig::from_env()?;
    Ok(Arc::new(FilesystemBlobStore::new(config)))
}

fn submission_service(db: &Database) -> anyhow::Result<SubmissionService> {
    Ok(SubmissionService::new(db.pages.clone(), db.jobs.clone(), blob_store()?)
        .with_config(SubmissionConfig::from_env()))
}

async fn run_worker(db: Database) -> anyhow::Result<()> {
    info!(subsystem = "cli", op = "worker", "Running database migrations");
    db.migrate().await?;

    let blobs = blob_store()?;
    blobs.validate().await.context("upload directory is not writable")?;

    let extractor = Arc::new(OllamaExtractionBackend::from_env());
    match extractor.health_check().await {
        Ok(true) => info!(model = extractor.model_name(), "Vision backend reachable"),
        _ => warn!(
            model = extractor.model_name(),
            "Vision backend unreachable; jobs will retry until it responds"
        ),
    }

    let processor = PageProcessor::new(
        db.pages.clone(),
        db.knowledge_units.clone(),
        db.tags.clone(),
        blobs,
        extractor,
    );

    let config = WorkerConfig::from_env();
    let handle = WorkerBuilder::new(db.jobs.clone(), Arc::new(processor))
        .with_config(config)
        .with_notify(db.jobs.job_notify())
        .build()
        .start();

    log_pool_metrics(db.pool());
    info!(
        pending = db.jobs.pending_count().await.unwrap_or(-1),
        "Worker running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for in-flight pages");
    handle.shutdown().await?;
    handle.join().await?;
    Ok(())
}

async fn submit(db: Database, path: &Path, wait: bool) -> anyhow::Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("page.jpg");

    let receipt = submission_service(&db)?.submit(filename, &data).await?;
    print_json(&receipt)?;

    if !wait {
        return Ok(());
    }

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let Some(status) = db.pages.status(receipt.page_id).await? else {
            bail!("Page {} was deleted", receipt.page_id);
        };
        if status.status.is_terminal() {
            return print_json(&status);
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
