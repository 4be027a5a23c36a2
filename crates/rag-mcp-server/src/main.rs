use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::{info, warn};

use rag_mcp_server::config::{LoggingConfig, Settings};
use rag_mcp_server::database::{
    ChunkRepository, ChunkStore, DbPool, IdentityRepository, IdentityStore,
};
use rag_mcp_server::handlers;
use rag_mcp_server::logging::{UsageLogger, UsageSink};
use rag_mcp_server::mcp::ToolDispatcher;
use rag_mcp_server::security::rate_limit::parse_week_start;
use rag_mcp_server::security::{IdentityResolver, RateLimiter, ThreatDetector};
use rag_mcp_server::services::{EmbeddingClient, KeyPool, RerankClient, SearchEngine};
use rag_mcp_server::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    let _log_guard = init_tracing(&settings.logging);

    info!("Starting MCP documentation retrieval server...");
    info!("Configuration loaded");

    // Initialize store pools
    let chunk_pool = DbPool::new(&settings.chunk_store).await?;
    let identity_pool = DbPool::new(&settings.identity_store).await?;
    info!("Store connections established");

    // Repositories
    let chunk_store: Arc<dyn ChunkStore> = Arc::new(ChunkRepository::new(chunk_pool.clone()));
    let identity_store: Arc<dyn IdentityStore> =
        Arc::new(IdentityRepository::new(identity_pool.clone()));

    // Provider key pool, filtered by previously persisted evictions
    let evicted = match identity_store.list_key_evictions().await {
        Ok(prefixes) => prefixes,
        Err(e) => {
            warn!("Could not load key evictions, starting with full pool: {}", e);
            Vec::new()
        }
    };
    let key_pool = Arc::new(KeyPool::new(
        settings.providers.api_keys.clone(),
        &evicted,
        identity_store.clone(),
    ));

    // Retrieval services
    let embedder = Arc::new(EmbeddingClient::new(
        settings.providers.embedding_base_url.clone(),
        settings.providers.embedding_model.clone(),
        key_pool.clone(),
    ));
    let reranker = Arc::new(RerankClient::new(
        settings.providers.rerank_base_url.clone(),
        settings.providers.rerank_model.clone(),
        key_pool.clone(),
    ));
    let engine = Arc::new(SearchEngine::new(embedder, chunk_store.clone(), reranker));

    // Governance
    let identity_resolver = Arc::new(IdentityResolver::new(identity_store.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(
        identity_store.clone(),
        parse_week_start(&settings.governance.week_start),
        settings.governance.week_boundary_utc,
    ));
    let threat = Arc::new(ThreatDetector::new(
        settings.governance.max_requests_per_minute,
        settings.governance.alert_webhook_url.clone(),
    )?);

    // Usage accounting
    let usage: Arc<dyn UsageSink> = Arc::new(UsageLogger::new(
        identity_pool.get_pool().clone(),
        settings.usage_logger.clone(),
    ));

    let dispatcher = Arc::new(ToolDispatcher::new(
        identity_resolver.clone(),
        rate_limiter,
        engine,
        chunk_store,
        usage,
        settings.links.clone(),
    ));

    let state = Arc::new(AppState {
        settings: settings.clone(),
        chunk_pool,
        identity_pool,
        dispatcher,
        identity_resolver: identity_resolver.clone(),
        threat: threat.clone(),
    });

    spawn_sweeper(threat, identity_resolver);

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_tracing(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,rag_mcp_server=debug".to_string());

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "rag-mcp-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .json()
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .json()
                .init();
            None
        }
    }
}

/// Hourly cleanup of the IP-identity cache and the threat sliding windows.
fn spawn_sweeper(threat: Arc<ThreatDetector>, resolver: Arc<IdentityResolver>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            threat.sweep();
            resolver.sweep();
        }
    });
}

fn build_router(state: Arc<AppState>) -> Router {
    // Health endpoints bypass governance.
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check));

    Router::new()
        .merge(public_routes)
        .route("/", post(handlers::mcp::jsonrpc_handler))
        .with_state(state)
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(CatchPanicLayer::new())
}
