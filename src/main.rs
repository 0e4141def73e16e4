mod config;
mod db;
mod frame;
mod layout;
mod routes;
mod services;
mod state;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = config::SyncConfig::from_env();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    tracing::info!(?config, "configuration loaded");

    let pool = db::init_pool(&database_url, config.db_max_connections)
        .await
        .expect("database init failed");

    let state = state::AppState::with_channel_bus(pool, config);

    // Spawn background persistence task.
    let persistence = services::persistence::spawn_persistence_task(state.clone());

    let app = routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, "canvas-sync listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    // Drain in-memory state before exit.
    persistence.abort();
    state.bus.shutdown().await;
    tracing::info!(pending_history_saves = state.history_saves.pending(), "draining canvas state");
    let report = services::persistence::flush_all_dirty(&state).await;
    let histories = services::history::flush_pending(&state).await;
    tracing::info!(
        upserted = report.upserted,
        deleted = report.deleted,
        failed_canvases = report.failed_canvases,
        evicted = report.evicted,
        histories,
        "canvas-sync stopped"
    );
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
