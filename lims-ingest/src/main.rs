//! lims-ingest - LIMS plate reconciliation harness
//!
//! Feeds JSON payload files through the reconcile engine and prints one
//! verdict per message as a JSON line on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use lims_common::config::{load_platform_config, resolve_root_folder, RootFolderInitializer};
use lims_common::events::{EntityKind, EventBus};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lims_ingest::linker;
use lims_ingest::{Dispatcher, IngestError, IngestMessage, IngestSettings, LinkWorker, ReconcileEngine, Verdict};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Plate,
    Sample,
    Study,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Plate => EntityKind::Plate,
            KindArg::Sample => EntityKind::Sample,
            KindArg::Study => EntityKind::Study,
        }
    }
}

/// Command-line arguments for lims-ingest
#[derive(Parser, Debug)]
#[command(name = "lims-ingest")]
#[command(about = "Reconcile LIMS plate, sample and study messages into the warehouse")]
#[command(version)]
struct Args {
    /// Root folder holding lims.db (overrides LIMS_INGEST_ROOT and the config file)
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// LIMS source tag (id_lims) the messages came from
    #[arg(short, long)]
    source: String,

    /// Kind of payload in the files
    #[arg(short, long, value_enum, default_value = "plate")]
    kind: KindArg,

    /// JSON files, each holding one payload or an array of payloads
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

enum Pending {
    Submitted(oneshot::Receiver<Verdict>),
    Rejected(Verdict),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let platform = load_platform_config();
    let config = &platform.config;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    platform.log_source();

    info!(
        "Starting lims-ingest v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), config);
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());

    let pool = lims_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;
    let settings = IngestSettings::from_database(&pool)
        .await
        .context("Failed to load ingest settings")?;

    let events = EventBus::new(settings.event_capacity);
    let max_lock_wait_ms = settings.max_lock_wait_ms;
    let worker = LinkWorker::spawn(pool.clone(), events.clone(), max_lock_wait_ms);
    let engine = Arc::new(ReconcileEngine::new(pool.clone(), events.clone(), settings));
    let dispatcher = Dispatcher::new(engine);

    let kind = EntityKind::from(args.kind);
    let mut pending: Vec<(String, usize, Pending)> = Vec::new();

    for file in &args.files {
        let label = file.display().to_string();
        let payloads = match read_payloads(file) {
            Ok(payloads) => payloads,
            Err(err) => {
                warn!("Skipping {}: {}", label, err);
                pending.push((label, 0, Pending::Rejected(Verdict::rejected(None, &err))));
                continue;
            }
        };

        for (index, value) in payloads.into_iter().enumerate() {
            let entry = match IngestMessage::from_value(kind, args.source.clone(), value) {
                Ok(message) => Pending::Submitted(dispatcher.submit(message).await?),
                Err(err) => Pending::Rejected(Verdict::rejected(None, &err)),
            };
            pending.push((label.clone(), index, entry));
        }
    }

    let (mut accepted, mut rejected) = (0usize, 0usize);
    for (file, index, entry) in pending {
        let verdict = match entry {
            Pending::Submitted(rx) => rx.await.context("Dispatcher dropped a message")?,
            Pending::Rejected(verdict) => verdict,
        };
        if verdict.is_accepted() {
            accepted += 1;
        } else {
            rejected += 1;
        }
        println!("{}", json!({ "file": file, "index": index, "result": verdict }));
    }

    dispatcher.shutdown().await;
    worker.shutdown().await;

    let linked = linker::sweep(&pool, &events, max_lock_wait_ms)
        .await
        .context("Final obligation sweep failed")?;
    let outstanding = lims_ingest::db::pending_obligations(&pool).await?.len();

    info!(
        accepted,
        rejected,
        linked,
        outstanding_links = outstanding,
        "Ingest complete"
    );

    pool.close().await;
    Ok(())
}

/// One payload per file, or one per element when the file holds an array
fn read_payloads(path: &Path) -> std::result::Result<Vec<Value>, IngestError> {
    let content = std::fs::read_to_string(path).map_err(lims_common::Error::from)?;
    Ok(match serde_json::from_str::<Value>(&content)? {
        Value::Array(items) => items,
        single => vec![single],
    })
}
