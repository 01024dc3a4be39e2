//! HTTP router for the ops surface
//!
//! Policy CRUD and manual runs, execution history, tier statistics, metric
//! rollups, performance report, model and bucket invalidation, and health.

use crate::routes;
use crate::state::AppState;
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use tower_http::cors::CorsLayer;
use tracing::info;

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE])
    }
}

/// Create the HTTP router
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(routes::stats::health))
        .route("/api/statistics", get(routes::stats::statistics))
        .route("/api/metrics/daily", get(routes::stats::daily_metrics))
        .route("/api/report", get(routes::stats::performance_report))
        // Policies
        .route(
            "/api/policies",
            get(routes::policies::list_policies).post(routes::policies::create_policy),
        )
        .route(
            "/api/policies/{id}",
            get(routes::policies::get_policy)
                .patch(routes::policies::update_policy)
                .delete(routes::policies::delete_policy),
        )
        .route(
            "/api/policies/{id}/enable",
            post(routes::policies::enable_policy),
        )
        .route(
            "/api/policies/{id}/disable",
            post(routes::policies::disable_policy),
        )
        .route("/api/policies/{id}/run", post(routes::policies::run_policy))
        .route("/api/executions", get(routes::policies::list_executions))
        // Invalidation
        .route(
            "/api/models/{id}/invalidate",
            post(routes::invalidation::invalidate_model),
        )
        .route(
            "/api/buckets/{bucket}/invalidate",
            post(routes::invalidation::invalidate_bucket),
        )
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn start_server(
    state: AppState,
    port: u16,
    cors_origins: &[String],
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state, cors_origins);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
