//! condense-oracle HTTP server entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mimalloc::MiMalloc;
use tokio::net::TcpListener;
use tokio::signal;

use oracle::config::Config;
use oracle::gateway::{HandlerState, create_router_with_state};
use oracle::model::{PretrainedLoader, select_device};
use oracle::registry::ModelRegistry;
use oracle::scoring::ScoringService;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "--health-check") {
        std::process::exit(run_health_check());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    config.validate()?;
    let addr: SocketAddr = config.socket_addr().parse()?;

    tracing::info!(
        bind_addr = %config.bind_addr,
        port = config.port,
        dtype = ?config.model_dtype,
        "condense-oracle starting"
    );

    let device = select_device()?;
    let loader = Arc::new(PretrainedLoader::new(
        config.models_dir.clone(),
        config.model_dtype.to_dtype(),
    ));

    let registry = Arc::new(match config.model_cache_capacity {
        Some(capacity) => ModelRegistry::with_capacity(loader, device, capacity),
        None => ModelRegistry::new(loader, device),
    });

    if !config.preload_models.is_empty() {
        let preload_registry = registry.clone();
        let identifiers = config.preload_models.clone();
        tracing::info!(count = identifiers.len(), "Preloading models...");
        match tokio::task::spawn_blocking(move || preload_registry.preload(&identifiers)).await? {
            Ok(()) => tracing::info!("Preload complete."),
            Err(e) => tracing::warn!("Preload failed: {}. Models will load on demand.", e),
        }
    }

    let service = Arc::new(ScoringService::new(registry, config.scoring_settings()));
    let app = create_router_with_state(HandlerState::new(service));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("condense-oracle shutdown complete");
    Ok(())
}

fn run_health_check() -> i32 {
    let port = std::env::var(Config::ENV_PORT)
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{}/healthz", port);

    let Ok(rt) = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    else {
        return 1;
    };

    rt.block_on(async {
        let Ok(client) = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
        else {
            return 1;
        };

        match client.get(&url).send().await {
            Ok(res) if res.status().is_success() => 0,
            _ => 1,
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
