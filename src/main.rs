//! dockhand entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dockhand::api::{self, AppState};
use dockhand::config::Config;
use dockhand::dispatch::WorkerDispatcher;
use dockhand::hosts::{HealthChecker, HostRouter, TunnelManager};
use dockhand::launcher::RunLauncher;
use dockhand::safety::{RedactingMakeWriter, Redactor};
use dockhand::scheduler::Scheduler;
use dockhand::store::{PgStore, Store};

#[derive(Parser, Debug)]
#[command(name = "dockhand")]
#[command(about = "Self-hosted Docker task orchestrator for small LAN fleets")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the request/response API and the /mcp tool surface.
    Api,
    /// Run the claim loop, dispatcher, and periodic health sweeps.
    Scheduler,
    /// Apply schema migrations and exit.
    Migrate,
}

fn init_tracing(config: &Config, redactor: &Arc<Redactor>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dockhand=info,tower_http=warn"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if config.redacted_mode {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(RedactingMakeWriter::new(Arc::clone(redactor))),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_env().context("loading configuration")?;
    let redactor = Arc::new(Redactor::new());
    init_tracing(&config, &redactor);

    let store = PgStore::connect(&config.database_url).context("connecting to database")?;
    store.migrate().await.context("applying migrations")?;
    let store: Arc<dyn Store> = Arc::new(store);

    match args.command {
        Command::Migrate => {
            tracing::info!("migrations applied");
            Ok(())
        }
        Command::Api => run_api(config, store).await,
        Command::Scheduler => run_scheduler(config, store, redactor).await,
    }
}

async fn run_api(config: Config, store: Arc<dyn Store>) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.artifact_root)
        .await
        .context("creating artifact root")?;

    let tunnels = Arc::new(TunnelManager::new(
        config.hosts.tunnel_port_start,
        config.hosts.tunnel_port_end,
    ));
    let state = AppState {
        store: store.clone(),
        launcher: Arc::new(RunLauncher::new(store.clone())),
        health: Arc::new(HealthChecker::new(
            store,
            tunnels.clone(),
            config.hosts.health_timeout,
            config.hosts.staleness,
        )),
        tunnels: tunnels.clone(),
        artifact_root: config.artifact_root.clone(),
        staleness: config.hosts.staleness,
    };

    let result = api::serve(state, config.api_port).await;
    tunnels.close_all().await;
    result.context("serving API")
}

async fn run_scheduler(
    config: Config,
    store: Arc<dyn Store>,
    redactor: Arc<Redactor>,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.artifact_root)
        .await
        .context("creating artifact root")?;

    let tunnels = Arc::new(TunnelManager::new(
        config.hosts.tunnel_port_start,
        config.hosts.tunnel_port_end,
    ));
    let health = Arc::new(HealthChecker::new(
        store.clone(),
        tunnels.clone(),
        config.hosts.health_timeout,
        config.hosts.staleness,
    ));

    let dispatcher = Arc::new(WorkerDispatcher::new(
        store.clone(),
        tunnels.clone(),
        config.artifact_root.clone(),
        config.upload_root.clone(),
        config.hosts.health_timeout,
        config.scheduler.job_timeout,
        config.redacted_mode.then(|| Arc::clone(&redactor)),
    ));

    let claimant = format!(
        "{}:{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "dockhand".to_string()),
        std::process::id()
    );
    let scheduler = Scheduler::new(
        store.clone(),
        HostRouter::new(store.clone(), config.hosts.staleness),
        dispatcher,
        config.scheduler.clone(),
        claimant,
    );

    reap_orphaned_workers(&store, &tunnels, &config).await;

    // Periodic health sweeps alongside the claim loop.
    let sweep_interval = config.hosts.staleness / 2;
    let sweeper = health.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = sweeper.sweep().await {
                tracing::error!(error = %e, "health sweep failed");
            }
            tokio::time::sleep(sweep_interval).await;
        }
    });

    scheduler.run_forever().await;
    tunnels.close_all().await;
    Ok(())
}

/// Remove exited ephemeral workers left behind by a previous process.
async fn reap_orphaned_workers(
    store: &Arc<dyn Store>,
    tunnels: &Arc<TunnelManager>,
    config: &Config,
) {
    let hosts = match store.list_hosts().await {
        Ok(hosts) => hosts,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list hosts for orphan reaping");
            return;
        }
    };
    for host in hosts.iter().filter(|h| h.enabled) {
        match dockhand::dispatch::docker::connect_host(host, tunnels, config.hosts.health_timeout)
            .await
        {
            Ok(docker) => {
                let removed = dockhand::dispatch::docker::reap_orphans(&docker).await;
                if removed > 0 {
                    tracing::info!(host = %host.name, removed, "reaped orphaned workers");
                }
            }
            Err(e) => {
                tracing::debug!(host = %host.name, error = %e, "skipping orphan reap");
            }
        }
    }
}
