//! LLM Manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use llm_manager::{
    HealthMonitor, Registry, StateManager, api,
    config::ManagerConfig,
    gpu, metrics,
    models::{ModelLoader, ModelRegistry},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "llm-manager")]
#[command(about = "Local LLM runtime manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting LLM Manager");

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        state_file = ?config.state_file,
        cache_dir = ?config.cache_dir,
        max_runtimes = ?config.max_runtimes,
        "Configuration loaded"
    );

    // Detect GPUs before any runtime can ask for one
    let gpu_info = gpu::init();
    tracing::info!(
        gpu_count = gpu_info.count(),
        total_memory_mib = gpu_info.total_memory_mib(),
        "GPU detection complete"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Model registry seeded from config, discovering already cached snapshots
    let model_registry = Arc::new(
        ModelRegistry::init(config.models.clone(), config.cache_dir.clone()).await,
    );
    tracing::info!(
        models = model_registry.count().await,
        "Model registry initialized"
    );

    // Initialize runtime registry
    let registry = Arc::new(
        Registry::new(
            config.max_runtimes,
            config.server_binary_path.clone(),
            config.runtime_port_start,
            config.runtime_port_end,
        )
        .with_cache_dir(config.cache_dir.clone()),
    );

    // Initialize state manager
    let state_manager = Arc::new(StateManager::new(
        config.state_file.clone(),
        registry.clone(),
        config.server_binary_path.clone(),
    ));

    // Restore runtimes or seed from config
    if config.auto_restore_on_restart {
        tracing::info!("Auto-restore enabled, restoring runtimes from state");
        state_manager.restore().await?;
    } else if !config.runtimes.is_empty() {
        tracing::info!(count = config.runtimes.len(), "Seeding runtimes from config");
        for runtime_config in config.runtimes.clone() {
            let name = runtime_config.name.clone();
            match registry.add(runtime_config).await {
                Ok(runtime) => {
                    if let Err(e) = runtime.start(registry.server_binary_path()).await {
                        tracing::error!(
                            error = %e,
                            runtime = %name,
                            "Failed to start seeded runtime"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        runtime = %name,
                        "Failed to add seeded runtime"
                    );
                }
            }
        }
    }

    // Start health monitor
    let health_monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        config.health_check_interval_secs,
        config.health_check_initial_delay_secs,
        config.max_failures_before_restart,
        true, // auto_restart
        config.server_binary_path.clone(),
    ));

    let monitor_handle = tokio::spawn({
        let monitor = health_monitor.clone();
        async move {
            monitor.run().await;
        }
    });

    // Setup API
    let app_state = api::AppState {
        registry: registry.clone(),
        model_registry: model_registry.clone(),
        state_manager: state_manager.clone(),
        loader: Arc::new(ModelLoader::from_binary(config.server_binary_path.clone())),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    // Stop all runtimes
    tracing::info!("Stopping all runtimes");
    registry.stop_all().await;

    // Save final state
    tracing::info!("Saving final state");
    state_manager.save().await?;

    // Cancel health monitor
    monitor_handle.abort();

    tracing::info!("Shutdown complete");

    Ok(())
}

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
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
