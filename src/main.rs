use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use guardian::config::{GuardianConfig, LogFormat, LoggingConfig};
use guardian::grpc::GrpcServer;
use guardian::quota::QuotaEngine;
use guardian::scheduler::ResetScheduler;
use guardian::store::{CounterStore, MemoryStore, RedisStore, StoreType};

/// Request admission control with per-token request and traffic quotas.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "GUARDIAN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Override the counter store backend
    #[arg(long, value_enum)]
    store: Option<StoreType>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GuardianConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(store) = args.store {
        config.store.backend = store;
    }

    init_tracing(&config.logging);

    info!("Starting Guardian Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        store = %config.store.backend,
        default_request_quota = config.quota.default_request_quota,
        default_traffic_quota = config.quota.default_traffic_quota,
        reset_interval_secs = config.quota.reset_interval_secs,
        consistency = ?config.quota.consistency,
        "Configuration loaded"
    );

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreType::Memory => Arc::new(MemoryStore::new()),
        StoreType::Redis => Arc::new(RedisStore::connect(&config.store.redis_url).await?),
    };

    let engine = Arc::new(QuotaEngine::with_mode(
        store,
        config.quota.defaults(),
        config.quota.consistency,
    ));
    info!("Quota engine initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = ResetScheduler::new(engine.clone(), config.quota.reset_interval())
        .spawn(shutdown_rx.clone());

    let grpc_server = GrpcServer::new(config.server.grpc_addr, engine);

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    let mut server_shutdown = shutdown_rx;
    let mut server = tokio::spawn(grpc_server.serve_with_shutdown(async move {
        let _ = server_shutdown.changed().await;
    }));

    let server_result = tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            (&mut server).await?
        }
        result = &mut server => result?,
    };

    // The server may have exited on its own; stop the scheduler either way.
    let _ = shutdown_tx.send(true);
    let cycles = scheduler.await?;
    server_result?;

    info!(cycles = cycles, "Guardian Admission Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
