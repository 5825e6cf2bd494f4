//! Router assembly.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{any, get},
    Router,
};
use prometheus_client::registry::Registry;

use crate::{
    allocator::{SharedAllocator, SharedSymbols},
    config::ServerConfig,
    control::ProfilingController,
    dump::HeapDumpPipeline,
    handlers::{self, AppState},
    metrics, request_context,
};

/// Path the metrics endpoint is mounted at.
pub const METRICS_PATH: &str = "/metrics";

/// Profiling endpoints under `prefix`, which must start and end with `/`.
pub fn create_router(state: AppState, prefix: &str) -> Router {
    Router::new()
        .route(&format!("{prefix}active"), get(handlers::active))
        .route(&format!("{prefix}stats"), get(handlers::stats))
        .route(&format!("{prefix}pprof/heap"), get(handlers::heap))
        .route(&format!("{prefix}pprof/symbol"), any(handlers::symbol))
        .route(&format!("{prefix}pprof/cmdline"), get(handlers::cmdline))
        .with_state(state)
}

/// `GET /metrics` over `registry`.
pub fn metrics_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route(METRICS_PATH, get(metrics::metrics_handler))
        .with_state(registry)
}

/// Whole application: profiling endpoints when the allocator supports
/// profiling, `/metrics` when enabled and the allocator keeps stats.
pub fn create_app(
    config: &ServerConfig,
    allocator: SharedAllocator,
    symbols: SharedSymbols,
) -> Router {
    let controller = Arc::new(ProfilingController::new(Arc::clone(&allocator)));
    let mut app = Router::new();

    if controller.is_enabled() {
        let pipeline = HeapDumpPipeline::new(Arc::clone(&controller), &config.dump_dir);
        let state = AppState::new(controller, pipeline, symbols);
        app = app.merge(create_router(state, &config.path_prefix));
        tracing::info!(
            "jemalloc memory profiling http handlers registered at {}",
            config.path_prefix
        );
    } else {
        tracing::info!(
            "jemalloc memory profiling option is not enabled, http handlers will not be registered"
        );
    }

    if config.metrics_enabled {
        let mut registry = Registry::default();
        if metrics::register_allocator_metrics(&config.metrics_namespace, &mut registry, &allocator)
        {
            app = app.merge(metrics_router(Arc::new(registry)));
        }
    }

    app.layer(middleware::from_fn(request_context::request_context))
}
