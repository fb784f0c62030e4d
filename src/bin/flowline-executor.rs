//! # Flowline Executor
//!
//! Starts one executor process: PostgreSQL-backed concurrency limits and
//! delays, operator skip lists, and the delay poller. Runs until ctrl-c.

use anyhow::Context;
use clap::Parser;
use flowline_core::config::FlowlineConfig;
use flowline_core::database::{
    run_migrations, DatabaseConnection, PgConcurrencyLimitStorage, PgExecutionDelayStorage,
};
use flowline_core::logging::init_structured_logging;
use flowline_core::models::Flow;
use flowline_core::orchestration::{
    ChannelExecutorQueue, DelayPoller, Executor, InMemoryExecutionRepository,
    InMemoryFlowRepository,
};
use flowline_core::services::SkipExecutionService;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "flowline-executor")]
#[command(about = "Start a Flowline executor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of JSON flow definitions to load at start-up
    #[arg(short, long)]
    flow_path: Option<PathBuf>,

    /// Tenant assigned to the flows loaded from --flow-path
    #[arg(long, requires = "flow_path")]
    tenant: Option<String>,

    /// Execution ids to skip; for troubleshooting only
    #[arg(long, value_delimiter = ',')]
    skip_executions: Vec<String>,

    /// Flow identifiers (tenant|namespace|flow or namespace|flow) to skip; for troubleshooting only
    #[arg(long, value_delimiter = ',')]
    skip_flows: Vec<String>,

    /// Namespace identifiers (tenant|namespace) to skip; for troubleshooting only
    #[arg(long, value_delimiter = ',')]
    skip_namespaces: Vec<String>,

    /// Tenants to skip; for troubleshooting only
    #[arg(long, value_delimiter = ',')]
    skip_tenants: Vec<String>,

    /// Indexer record keys to skip; for troubleshooting only
    #[arg(long, value_delimiter = ',')]
    skip_indexer_records: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let mut config =
        FlowlineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    config.skip.executions.extend(cli.skip_executions);
    config.skip.flows.extend(cli.skip_flows);
    config.skip.namespaces.extend(cli.skip_namespaces);
    config.skip.tenants.extend(cli.skip_tenants);
    config.skip.indexer_records.extend(cli.skip_indexer_records);

    let connection = DatabaseConnection::connect(&config.database)
        .await
        .context("failed to connect to the database")?;
    if !connection.health_check().await? {
        warn!("Database health check failed, continuing");
    }
    run_migrations(connection.pool())
        .await
        .context("failed to run migrations")?;

    let flows = Arc::new(InMemoryFlowRepository::new());
    if let Some(path) = &cli.flow_path {
        let loaded = load_flows(&flows, path, cli.tenant.as_deref())?;
        info!(loaded, path = %path.display(), "Loaded flows");
    }

    let (queue, mut messages) = ChannelExecutorQueue::new(config.executor.emission_buffer);
    let executor = Arc::new(Executor::new(
        Arc::new(PgConcurrencyLimitStorage::new(connection.pool().clone())),
        Arc::new(PgExecutionDelayStorage::new(connection.pool().clone())),
        flows,
        Arc::new(InMemoryExecutionRepository::new()),
        Arc::new(queue),
        Arc::new(SkipExecutionService::from_config(&config.skip)),
    ));

    // No transport is bundled: emissions are only traced.
    let drain = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            debug!(
                message_type = message.message_type(),
                execution_id = %message.execution_id(),
                "Executor emission"
            );
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = DelayPoller::new(executor.clone(), config.executor.delay_poll_interval())
        .spawn(shutdown_rx);

    info!("Executor started");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down executor");

    let _ = shutdown_tx.send(true);
    poller.await.context("delay poller panicked")?;
    drop(executor);
    drain.abort();
    connection.close().await;
    Ok(())
}

fn load_flows(
    repository: &InMemoryFlowRepository,
    path: &Path,
    tenant: Option<&str>,
) -> anyhow::Result<usize> {
    let mut loaded = 0;
    for entry in std::fs::read_dir(path).with_context(|| format!("invalid flow path {}", path.display()))? {
        let file = entry?.path();
        if file.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let source = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let mut flow: Flow = match serde_json::from_str(&source) {
            Ok(flow) => flow,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Skipping unparsable flow");
                continue;
            }
        };
        if let Some(tenant) = tenant {
            flow.tenant_id = Some(tenant.to_string());
        }
        if let Err(e) = flow.validate() {
            warn!(file = %file.display(), error = %e, "Skipping invalid flow");
            continue;
        }

        repository.create(flow);
        loaded += 1;
    }
    Ok(loaded)
}
