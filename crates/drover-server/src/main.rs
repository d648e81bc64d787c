mod error;
mod metrics;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use drover_core::config::ServiceConfig;
use drover_core::executor::{Executor, OrchestratorExecutor, StubExecutor};
use drover_core::manager::WorkerManager;
use drover_core::sweeper;
use drover_db::config::DbConfig;
use drover_db::pool;

use state::AppState;

#[derive(Parser)]
#[command(name = "drover", about = "Durable task-execution service for AIOpsLab problem runs")]
struct Cli {
    /// Address to bind the HTTP server to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Database URL (overrides the DATABASE_URL env var)
    #[arg(long)]
    database_url: Option<String>,

    /// Executor backing the in-process workers
    #[arg(long, value_enum, default_value = "stub")]
    executor: ExecutorKind,

    /// Path to the orchestrator binary (with --executor orchestrator)
    #[arg(long, default_value = "aiopslab-orchestrator")]
    orchestrator_bin: String,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ExecutorKind {
    /// Simulated runs; no external processes
    Stub,
    /// Real runs through the orchestrator subprocess
    Orchestrator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = Arc::new(ServiceConfig::from_env());
    let db_config = match &cli.database_url {
        Some(url) => DbConfig::new(url),
        None => DbConfig::from_env(),
    };

    // Database: ensure it exists, connect, migrate.
    pool::ensure_database_exists(&db_config)
        .await
        .context("database bootstrap failed")?;
    let db_pool = pool::create_pool(&db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let metrics_handle = metrics::init_metrics();

    let executor: Arc<dyn Executor> = match cli.executor {
        ExecutorKind::Stub => Arc::new(StubExecutor::new(config.default_max_steps)),
        ExecutorKind::Orchestrator => Arc::new(OrchestratorExecutor::with_binary(
            cli.orchestrator_bin.clone(),
            config.default_max_steps,
        )),
    };

    let manager = Arc::new(WorkerManager::new(
        db_pool.clone(),
        Arc::clone(&config),
        executor,
    ));

    if config.auto_start_workers {
        manager
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start worker pool: {e}"))?;
        info!(
            num_workers = config.num_internal_workers,
            "worker pool started"
        );
    }

    let sweeper_cancel = CancellationToken::new();
    let sweeper_join = if config.enable_background_tasks {
        Some(tokio::spawn(sweeper::run_sweeper(
            db_pool.clone(),
            Arc::clone(&config),
            sweeper_cancel.clone(),
        )))
    } else {
        None
    };

    let app_state = AppState::new(
        db_pool.clone(),
        Arc::clone(&manager),
        Arc::clone(&config),
        metrics_handle,
    );
    let app = routes::build_router(app_state.clone());

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("drover listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state.clone()))
        .await?;

    // Signal received: stop background work, then let the pool close.
    sweeper_cancel.cancel();
    manager.stop().await;
    if let Some(join) = sweeper_join {
        let _ = join.await;
    }
    db_pool.close().await;

    info!("drover shut down");
    Ok(())
}

/// Wait for Ctrl+C, then flip the service into drain mode so new tasks and
/// claims are refused while in-flight requests finish.
async fn shutdown_signal(state: AppState) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("shutdown signal received, draining");
    state.begin_drain();
}
