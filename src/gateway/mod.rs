pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;

use state::AppState;

/// Build the HTTP router
pub fn build_router(state: Arc<AppState>) -> Router {
    let escrow_routes = Router::new()
        .route("/address", post(handlers::request_address))
        .route("/release", post(handlers::release_escrow))
        .route("/status/{trade_id}", get(handlers::escrow_status));

    let session_routes = Router::new()
        .route(
            "/{user_id}",
            get(handlers::list_sessions).post(handlers::save_session),
        )
        .route("/{user_id}/recovery", get(handlers::recovery_prompt))
        .route("/{user_id}/end", post(handlers::end_session_scope))
        .route("/{user_id}/{session_id}", delete(handlers::dismiss_session))
        .route("/{user_id}/{session_id}/step", post(handlers::update_session))
        .route(
            "/{user_id}/{session_id}/restore",
            post(handlers::restore_session),
        );

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/escrow", escrow_routes)
        .nest("/api/v1/sessions", session_routes)
        .route("/api/v1/trades", post(handlers::open_trade))
        .route("/api/v1/trades/{trade_id}", get(handlers::get_trade))
        .route(
            "/api/v1/trades/{trade_id}/transition",
            post(handlers::transition_trade),
        )
        .route(
            "/api/v1/trades/{trade_id}/resolve",
            post(handlers::resolve_dispute),
        )
        .route("/api/v1/funding/obligations", post(handlers::open_obligation))
        .route("/api/v1/rates/{asset}", get(handlers::get_rate))
        .route("/webhooks/custody", post(handlers::custody_webhook))
        .with_state(state)
}

/// Bind and serve until the process exits
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(%addr, error = %e, "Failed to bind, port may already be in use");
        anyhow::anyhow!("bind {}: {}", addr, e)
    })?;

    tracing::info!(%addr, "Gateway listening");
    tracing::info!("Escrow API:  /api/v1/escrow/*");
    tracing::info!("Trades API:  /api/v1/trades/*");
    tracing::info!("Sessions:    /api/v1/sessions/*");
    tracing::info!("Webhooks:    /webhooks/custody");

    axum::serve(listener, app).await?;
    Ok(())
}
