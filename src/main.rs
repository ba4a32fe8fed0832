use lead_dashboard::{
    api::create_router,
    config::Config,
    db::{create_pool, run_migrations},
    observability::init_tracing,
    rate_limit::{spawn_sweeper, LimiterConfig, Protection, RequestGuard},
};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load()?;
    config.validate()?;

    init_tracing(&config.observability)?;

    tracing::info!("Starting lead dashboard service");
    tracing::info!("Configuration loaded: {:?}", config.server);

    let db_pool = create_pool(&config.database).await?;
    run_migrations(&db_pool).await?;

    // One guard for the whole process, shared by every protected route
    let guard = Arc::new(RequestGuard::new(LimiterConfig::from_protection(
        &config.protection,
    )?));
    tracing::info!(
        max_requests = config.protection.max_requests,
        window_seconds = config.protection.window_seconds,
        dedup_window_seconds = config.protection.dedup_window_seconds,
        "Request protection enabled"
    );

    let _sweeper = config
        .protection
        .sweep_interval()
        .map(|every| spawn_sweeper(&guard, every));

    let protection = Protection::from_config(guard, &config.protection);
    let app = create_router(db_pool, protection);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    tracing::info!("Lead dashboard service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
