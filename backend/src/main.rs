//! Binary entry point: logging, config, then the profiling HTTP server.

use std::sync::Arc;

use anyhow::{Context, Result};
use heapctl_backend::{
    allocator::{SharedAllocator, SharedSymbols},
    config::ServerConfig,
    routes,
    symbols::BacktraceSymbols,
};
use heapctl_runtime::{init_logging, LoggingConfig};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[cfg(feature = "jemalloc")]
fn native_allocator() -> SharedAllocator {
    Arc::new(heapctl_backend::jemalloc::JemallocControl)
}

#[cfg(not(feature = "jemalloc"))]
fn native_allocator() -> SharedAllocator {
    Arc::new(heapctl_backend::allocator::UnsupportedAllocator)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _logging = init_logging(&LoggingConfig::from_env("heapctl"))?;
    let config = ServerConfig::from_env()?;

    tracing::info!("Starting heapctl backend");
    tracing::info!("Dump directory: {}", config.dump_dir.display());

    let symbols: SharedSymbols = Arc::new(BacktraceSymbols::new());
    let app = routes::create_app(&config, native_allocator(), symbols);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
