use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use tg_forward::config::ForwardConfig;
use tg_forward::pipeline::{EngineDeps, ForwardEngine};
use tg_forward::sessions::{AccountRegistry, SessionRegistry};
use tg_forward::stats::StatsAggregator;
use tg_forward::store::{LibSqlStore, RuleStore, seed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ForwardConfig::from_env()?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📡 tg-forward v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Media: {}", config.media_dir.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(LibSqlStore::new_local(&config.db_path).await?);

    if let Some(path) = &config.rules_file {
        let report = seed::import_file(store.as_ref(), path).await?;
        eprintln!(
            "   Seed: {} accounts, {} rules ({} skipped) from {}",
            report.accounts,
            report.rules,
            report.skipped,
            path.display()
        );
    }

    // ── Sessions ─────────────────────────────────────────────────────────
    let accounts = store.list_accounts(None).await?;
    if accounts.is_empty() {
        warn!("No accounts configured; set TG_FORWARD_RULES_FILE to seed some");
    }
    let sessions: Arc<dyn SessionRegistry> = Arc::new(AccountRegistry::from_accounts(
        &accounts,
        &config.media_dir,
        config.http_timeout,
    ));
    eprintln!("   Sessions: {}", sessions.list_sessions().len());

    // ── Engine ───────────────────────────────────────────────────────────
    let stats = Arc::new(StatsAggregator::new());
    let deps = EngineDeps::new(store.clone(), sessions, stats.clone()).with_archive(store.clone());
    let engine = ForwardEngine::new(deps);
    engine.start().await?;

    let stats_task = (!config.stats_interval.is_zero()).then(|| {
        let stats = Arc::clone(&stats);
        let period = config.stats_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                info!("Stats: {}", stats.summary());
            }
        })
    });

    eprintln!("   Forwarding. Press Ctrl-C to stop.\n");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    engine.stop().await?;
    engine.drain(config.drain_timeout).await;
    if let Some(task) = stats_task {
        task.abort();
    }

    info!("Final stats: {}", stats.summary());
    Ok(())
}

/// Console logging plus an optional daily-rolling file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tg-forward.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
