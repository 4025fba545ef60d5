//! Nimbus CLI
//!
//! Loads configuration, opens the default workspace's stores, reconciles
//! persisted reminders, and wires the background jobs (heartbeat,
//! compaction, daily digest) before parking on Ctrl-C. The chat transport
//! connects through the library's collaborator traits; without one, the
//! binary runs the scheduled jobs and logs outbound messages.

use clap::Parser;
use futures::FutureExt;
use nimbus::delivery::{Delivery, LogDelivery};
use nimbus::digest::{daily_cron, DigestGenerator, OpenWeather, WeatherProvider};
use nimbus::llm::{ChatModel, ClaudeClient, UsageSink};
use nimbus::memory::Compactor;
use nimbus::{Config, ReminderStore, Scheduler, UsageLedger, WorkspaceManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Nimbus - personal assistant with durable workspace memory
#[derive(Parser, Debug)]
#[command(name = "nimbus")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the workspaces root directory
    #[arg(long)]
    workspaces_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let root = cli
        .workspaces_dir
        .unwrap_or_else(|| config.workspace_root());
    info!("workspace root: {}", root.display());

    let workspaces = Arc::new(
        WorkspaceManager::new(
            root,
            &config.workspaces.default,
            config.workspaces.history_limit,
            config.workspaces.configs.clone(),
        )
        .await?,
    );
    info!("workspaces: {}", workspaces.list_workspaces().await.join(", "));

    let scheduler = Arc::new(Scheduler::new());
    let delivery: Arc<dyn Delivery> = Arc::new(LogDelivery);
    let client = Arc::new(ClaudeClient::new(
        &config.api.key,
        &config.api.model,
        config.api.max_tokens,
    ));

    let default_store = Arc::new(workspaces.store(&config.workspaces.default).await?);
    let ledger = Arc::new(UsageLedger::open(default_store.workspace_dir()).await?);
    info!("{}", ledger.format_stats().await);

    // Reconcile persisted reminders before anything can create new ones.
    let reminders = ReminderStore::open(
        default_store.workspace_dir(),
        Arc::clone(&scheduler),
        Arc::clone(&delivery),
    )
    .await?;

    if config.heartbeat.enabled {
        let ws = Arc::clone(&workspaces);
        let period = Duration::from_secs(config.heartbeat.interval_minutes * 60);
        scheduler.schedule_every("heartbeat", period, move || {
            let ws = Arc::clone(&ws);
            async move {
                match ws.load_heartbeat_prompt().await {
                    Some(checklist) if !checklist.trim().is_empty() => {
                        info!("heartbeat checklist:\n{checklist}");
                    }
                    _ => debug!("heartbeat: no checklist"),
                }
            }
            .boxed()
        });
        info!(
            "heartbeat scheduled every {} minute(s)",
            config.heartbeat.interval_minutes
        );
    }

    if config.heartbeat.compact_enabled {
        let ws = Arc::clone(&workspaces);
        let client = Arc::clone(&client);
        let ledger = Arc::clone(&ledger);
        scheduler.schedule_cron("compaction", &config.heartbeat.compact_cron, move || {
            let ws = Arc::clone(&ws);
            let client = Arc::clone(&client);
            let ledger = Arc::clone(&ledger);
            async move {
                for name in ws.list_workspaces().await {
                    let store = match ws.store(&name).await {
                        Ok(store) => store,
                        Err(e) => {
                            error!("skipping compaction for '{name}': {e}");
                            continue;
                        }
                    };
                    // Workspace model overrides apply per request via a
                    // derived client; the shared one is never mutated.
                    let model: Arc<dyn ChatModel> = match ws.model_for(&name) {
                        Some(model) => Arc::new(client.with_model(&model)),
                        None => Arc::clone(&client) as Arc<dyn ChatModel>,
                    };
                    let compactor =
                        Compactor::new(model, Arc::clone(&ledger) as Arc<dyn UsageSink>);
                    let (ok, message) = compactor.compact(&store, false).await;
                    if ok {
                        info!("compaction for '{name}': {message}");
                    } else {
                        debug!("compaction skipped for '{name}': {message}");
                    }
                }
            }
            .boxed()
        })?;
        info!("compaction scheduled: {}", config.heartbeat.compact_cron);
    }

    if config.digest.enabled {
        let mut digest = DigestGenerator::new(
            Arc::clone(&reminders),
            Arc::clone(&default_store),
            Arc::clone(&delivery),
        );
        if !config.digest.weather_api_key.trim().is_empty() {
            let provider: Arc<dyn WeatherProvider> =
                Arc::new(OpenWeather::new(&config.digest.weather_api_key));
            digest = digest.with_weather(provider, &config.digest.location);
        }
        let digest = Arc::new(digest);
        let expr = daily_cron(&config.digest.time);
        scheduler.schedule_cron("daily_digest", &expr, move || {
            let digest = Arc::clone(&digest);
            async move { digest.deliver().await }.boxed()
        })?;
        info!("daily digest scheduled at {} UTC", config.digest.time);
    }

    info!("Nimbus running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    Ok(())
}
