//! ContentMap Publisher - Main Entry Point
//! Reads newline-delimited publish requests from stdin and writes them to
//! the configured target through the publish worker

mod config;
mod handler;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::DaemonConfig;
use contentmap_core::application::worker::{shutdown_channel, Worker};
use contentmap_core::application::{KeepAliveMonitor, PublishContext, PublishObjectJob};
use contentmap_core::domain::PublishOp;
use contentmap_core::port::{LockService, PublishHandler};
use contentmap_infra_sqlite::{create_pool, run_migrations, SqliteContentStore, SqliteLockService};
use handler::LogHandler;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Poll interval while the worker reports a full queue
const BACKOFF: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize logging
    let log_format =
        std::env::var("CONTENTMAP_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("contentmap=info"))
        .context("Failed to create env filter")?;

    // stdout is left alone, logs go to stderr
    match log_format.as_str() {
        "json" => {
            // Production: JSON structured logging
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            // Development: Pretty formatting with colors
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }

    info!("ContentMap Publisher v{} starting...", VERSION);

    // 2. Load configuration
    let config = DaemonConfig::from_env().context("Invalid configuration")?;
    let database_url = config.database_url();
    ensure_parent_dir(&database_url)?;

    info!(url = %database_url, key = %config.target, "Initializing content store...");

    // 3. Initialize databases
    let pool = create_pool(&database_url)
        .await
        .context("DB pool creation failed")?;
    run_migrations(&pool).await.context("Migration failed")?;

    let lock_service = match config.lock_database_url() {
        Some(url) => {
            ensure_parent_dir(&url)?;
            let lock_pool = create_pool(&url)
                .await
                .context("Lock DB pool creation failed")?;
            run_migrations(&lock_pool)
                .await
                .context("Lock DB migration failed")?;
            let service =
                Arc::new(SqliteLockService::new(lock_pool).with_lease_ttl(config.lock_lease));
            info!(
                url = %url,
                owner = %service.owner(),
                lease_secs = %service.lease_ttl().as_secs(),
                "Cross-process locking enabled"
            );
            Some(service)
        }
        None => {
            info!("No lock database configured, locking is process-local");
            None
        }
    };

    // 4. Wire the pipeline
    let lock_services: Vec<Arc<dyn LockService>> = lock_service
        .iter()
        .map(|service| Arc::clone(service) as Arc<dyn LockService>)
        .collect();
    let ctx = Arc::new(PublishContext::new(config.publish.clone(), lock_services));

    let store = Arc::new(SqliteContentStore::new(pool.clone()));
    let log_handler = Arc::new(LogHandler::new());
    let handlers: Vec<Arc<dyn PublishHandler>> = vec![log_handler.clone()];
    let target = ctx.register_target(config.target.clone(), store.clone(), handlers);

    info!("Starting worker...");
    let worker = Arc::new(Worker::new(config.publish.worker.clone()));
    worker.start()?;

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let monitor = KeepAliveMonitor::new(Arc::clone(&ctx), target)
        .with_worker(Arc::clone(&worker))
        .spawn(shutdown_rx);

    info!("✅ System ready. Reading publish requests from stdin...");

    // 5. Feed requests until EOF or Ctrl+C
    let (submitted, rejected) = feed(&ctx, &worker, &config.target).await?;

    // 6. Graceful shutdown
    info!(submitted = %submitted, rejected = %rejected, "Input finished, flushing...");
    worker.flush().await;
    shutdown_tx.shutdown();
    if let Err(e) = monitor.await {
        warn!(error = %e, "Keepalive monitor ended abnormally");
    }
    worker.stop();
    worker.join().await?;
    ctx.locks().close();

    if let Some(service) = &lock_service {
        match service.release_all().await {
            Ok(0) => {}
            Ok(leftover) => warn!(leftover = %leftover, "Released leftover publish locks"),
            Err(e) => error!(error = %e, "Failed to release publish locks"),
        }
    }

    let stats = worker.stats();
    let stored = store.count().await?;
    info!(
        state = %worker.state(),
        jobs = %stats.logged_jobs,
        units = %stats.work_units,
        failures = %stats.failures,
        published = %log_handler.committed(),
        stored = %stored,
        avg_ms = %stats.average_duration.map_or(0, |d| d.as_millis()),
        idle_percent = %format!("{:.1}", stats.idle_percent),
        "Shutdown complete."
    );

    worker
        .last_error()
        .context("Publishing finished with errors")?;
    Ok(())
}

/// Submit every parsable line as a publish job; returns (submitted, rejected)
async fn feed(ctx: &Arc<PublishContext>, worker: &Worker, target: &str) -> Result<(u64, u64)> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut submitted = 0;
    let mut rejected = 0;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully...");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let op = match serde_json::from_str::<PublishOp>(line) {
            Ok(op) => match op.validate() {
                Ok(()) => op,
                Err(e) => {
                    warn!(error = %e, "Rejected publish request");
                    rejected += 1;
                    continue;
                }
            },
            Err(e) => {
                warn!(error = %e, "Unparsable publish request");
                rejected += 1;
                continue;
            }
        };

        // is_full is advisory; back off here instead of growing the queue
        while worker.is_full() {
            tokio::time::sleep(BACKOFF).await;
        }
        let job = PublishObjectJob::new(Arc::clone(ctx), target, op);
        if let Err(e) = worker.submit(Box::new(job)) {
            error!(error = %e, "Worker no longer accepts jobs, ignoring remaining input");
            break;
        }
        submitted += 1;
    }

    Ok((submitted, rejected))
}

/// Create the directory of a file-backed database
fn ensure_parent_dir(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}
