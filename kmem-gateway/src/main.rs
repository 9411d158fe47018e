use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kmem_gateway::server;
use kmem_gateway::state::AppState;
use kmem_pipeline::MemoryService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    kmem_core::load_dotenv();

    // Load configuration
    let config = kmem_core::Config::load()?;

    // Initialize tracing; RUST_LOG wins over the configured level
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.settings.logging.level.clone().into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Configuration loaded (queue: {}, memory: {:?}, embedding: {}/{})",
        config.settings.queue.backend,
        config.settings.memory.backends,
        config.settings.embedding.provider,
        config.settings.embedding.model
    );

    let service = Arc::new(MemoryService::from_config(&config).await?);

    // Pipelines interrupted by the last shutdown pick up where they stopped
    let resumed = service.resume_unfinished().await?;
    if !resumed.is_empty() {
        info!("Resumed {} unfinished pipelines", resumed.len());
    }

    let workers = service.spawn_workers(
        config.settings.pipeline.workers,
        Duration::from_millis(config.settings.pipeline.poll_interval_ms),
    );

    // Security: Verify localhost-only binding
    if config.settings.gateway.host != "127.0.0.1" && config.settings.gateway.host != "localhost" {
        warn!(
            "Gateway binding to non-localhost address: {}. This may expose the API to remote access.",
            config.settings.gateway.host
        );
    }

    let state = Arc::new(AppState::new(
        Arc::clone(&service),
        config.settings.gateway.max_upload_bytes,
    ));
    let bind_addr = config.bind_addr();
    info!("Starting kmem gateway on {}", bind_addr);

    let server_result = server::run(state, &bind_addr, shutdown_signal()).await;

    // The server stopped; let in-flight steps hand their messages back
    workers.shutdown().await;
    server_result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
